//! Tree topology over the roster and the in-process transport connecting its nodes.

use super::collective_aggregation::GroupedData;
use crate::errors::ProtocolError;
use dc_crypto::{CipherVector, Point};
use std::sync::Arc;
use tokio::sync::mpsc;

/// n-ary tree over roster indices `0..size`, rooted at 0, filled level by level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tree {
    parents: Vec<Option<usize>>,
    children: Vec<Vec<usize>>,
}

impl Tree {
    pub fn n_ary(size: usize, branching: usize) -> Self {
        let branching = branching.max(1);
        let mut parents = vec![None; size];
        let mut children = vec![Vec::new(); size];
        for i in 1..size {
            let p = (i - 1) / branching;
            parents[i] = Some(p);
            children[p].push(i);
        }
        Self { parents, children }
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn parent(&self, node: usize) -> Option<usize> {
        self.parents[node]
    }

    pub fn children(&self, node: usize) -> &[usize] {
        &self.children[node]
    }
}

/// Messages exchanged along tree edges. One enum for every protocol; each node matches
/// exhaustively and treats anything it did not expect as fatal.
#[derive(Clone, Debug)]
pub enum ProtocolMessage {
    AggregationAnnounce,
    ChildAggregatedData(GroupedData),
    KeySwitchAnnounce { target: CipherVector, target_public_key: Point },
    KeySwitchContribution(CipherVector),
}

impl ProtocolMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::AggregationAnnounce => "AggregationAnnounce",
            ProtocolMessage::ChildAggregatedData(_) => "ChildAggregatedData",
            ProtocolMessage::KeySwitchAnnounce { .. } => "KeySwitchAnnounce",
            ProtocolMessage::KeySwitchContribution(_) => "KeySwitchContribution",
        }
    }
}

#[derive(Debug)]
pub struct Envelope {
    pub from: usize,
    pub msg: ProtocolMessage,
}

/// One node's view of a running protocol instance: its position in the tree, its inbox, and
/// senders to every peer.
#[derive(Debug)]
pub struct TreeNodeInstance {
    index: usize,
    parent: Option<usize>,
    children: Vec<usize>,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    peers: Arc<Vec<mpsc::UnboundedSender<Envelope>>>,
}

impl TreeNodeInstance {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn parent(&self) -> Option<usize> {
        self.parent
    }

    pub fn children(&self) -> &[usize] {
        &self.children
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    fn send(&self, to: usize, msg: ProtocolMessage) -> Result<(), ProtocolError> {
        self.peers[to]
            .send(Envelope { from: self.index, msg })
            .map_err(|_| ProtocolError::Transport(format!("node {to} is gone")))
    }

    pub fn send_to_parent(&self, msg: ProtocolMessage) -> Result<(), ProtocolError> {
        let parent = self
            .parent
            .ok_or_else(|| ProtocolError::Transport("root has no parent".to_string()))?;
        self.send(parent, msg)
    }

    pub fn send_to_children(&self, msg: &ProtocolMessage) -> Result<(), ProtocolError> {
        for &child in &self.children {
            self.send(child, msg.clone())?;
        }
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Envelope, ProtocolError> {
        self.inbox
            .recv()
            .await
            .ok_or_else(|| ProtocolError::Transport(format!("inbox of node {} closed", self.index)))
    }

    /// Receive the one message a non-root node expects from its parent.
    pub async fn recv_from_parent(&mut self) -> Result<ProtocolMessage, ProtocolError> {
        let env = self.recv().await?;
        if Some(env.from) != self.parent {
            return Err(self.unexpected(&env));
        }
        Ok(env.msg)
    }

    pub fn unexpected(&self, env: &Envelope) -> ProtocolError {
        ProtocolError::UnexpectedMessage { node: self.index, from: env.from, kind: env.msg.kind() }
    }
}

/// Channels wiring every edge of a [`Tree`] for one protocol instance.
pub struct LocalTree;

impl LocalTree {
    /// One [`TreeNodeInstance`] per tree node, in roster order.
    pub fn instances(tree: &Tree) -> Vec<TreeNodeInstance> {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..tree.len()).map(|_| mpsc::unbounded_channel()).unzip();
        let peers = Arc::new(senders);

        receivers
            .into_iter()
            .enumerate()
            .map(|(index, inbox)| TreeNodeInstance {
                index,
                parent: tree.parent(index),
                children: tree.children(index).to_vec(),
                inbox,
                peers: peers.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn n_ary_tree_shape() {
        let t = Tree::n_ary(6, 2);
        assert_eq!(t.parent(0), None);
        assert_eq!(t.children(0), &[1, 2]);
        assert_eq!(t.children(1), &[3, 4]);
        assert_eq!(t.children(2), &[5]);
        assert_eq!(t.parent(5), Some(2));

        let chain = Tree::n_ary(3, 1);
        assert_eq!(chain.children(0), &[1]);
        assert_eq!(chain.children(1), &[2]);
    }

    #[tokio::test]
    async fn messages_from_non_parents_are_rejected() {
        let mut nodes = LocalTree::instances(&Tree::n_ary(3, 2));
        let mut leaf = nodes.remove(2);

        nodes[1].send(2, ProtocolMessage::AggregationAnnounce).unwrap();
        let err = leaf.recv_from_parent().await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedMessage { node: 2, from: 1, .. }));
    }
}
