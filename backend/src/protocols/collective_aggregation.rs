//! Collective aggregation: every node merges its children's grouped buckets into its own and
//! forwards the result up, so the root ends up with the sum over the whole tree.

use super::tree::{ProtocolMessage, TreeNodeInstance};
use super::ProtocolState;
use crate::errors::ProtocolError;
use dc_crypto::{CryptoError, FilteredResponse, GroupingKey};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::oneshot;

/// Buckets of one node, ordered by key.
pub type GroupedData = BTreeMap<GroupingKey, FilteredResponse>;

/// Merge `child` into `into`.
///
/// New keys are inserted as they are. For keys already present, the aggregating attributes are
/// added and the local `group_by_enc` is kept. With `parallel` the shared buckets are summed on
/// the rayon pool; each bucket is written by exactly one worker.
pub fn merge_grouped_data(into: &mut GroupedData, child: GroupedData, parallel: bool) -> Result<(), CryptoError> {
    let (shared, fresh): (GroupedData, GroupedData) = child.into_iter().partition(|(k, _)| into.contains_key(k));

    let pairs: Vec<(&mut FilteredResponse, &FilteredResponse)> = into
        .iter_mut()
        .filter_map(|(k, dst)| shared.get(k).map(|src| (dst, src)))
        .collect();

    if parallel {
        pairs
            .into_par_iter()
            .try_for_each(|(dst, src)| dst.aggregating_attributes.add_assign(&src.aggregating_attributes))?;
    } else {
        for (dst, src) in pairs {
            dst.aggregating_attributes.add_assign(&src.aggregating_attributes)?;
        }
    }

    into.extend(fresh);
    Ok(())
}

/// One node's instance of the aggregation protocol.
pub struct CollectiveAggregation {
    node: TreeNodeInstance,
    data: GroupedData,
    parallel: bool,
    state: ProtocolState,
    feedback: Option<oneshot::Sender<GroupedData>>,
}

impl CollectiveAggregation {
    pub fn new(node: TreeNodeInstance, local: GroupedData, parallel: bool) -> Self {
        Self { node, data: local, parallel, state: ProtocolState::Idle, feedback: None }
    }

    /// Channel on which the root delivers the merged buckets.
    pub fn feedback(&mut self) -> oneshot::Receiver<GroupedData> {
        let (tx, rx) = oneshot::channel();
        self.feedback = Some(tx);
        rx
    }

    pub async fn dispatch(mut self) -> Result<ProtocolState, ProtocolError> {
        let me = self.node.index();

        if !self.node.is_root() {
            match self.node.recv_from_parent().await? {
                ProtocolMessage::AggregationAnnounce => {}
                other => {
                    return Err(ProtocolError::UnexpectedMessage {
                        node: me,
                        from: self.node.parent().unwrap_or_default(),
                        kind: other.kind(),
                    });
                }
            }
        }
        self.node.send_to_children(&ProtocolMessage::AggregationAnnounce)?;

        if self.node.is_leaf() && !self.node.is_root() {
            tracing::debug!(node = me, buckets = self.data.len(), "leaf reporting");
            self.node.send_to_parent(ProtocolMessage::ChildAggregatedData(self.data))?;
            return Ok(ProtocolState::Reported);
        }

        self.state = ProtocolState::WaitingChildren;
        let mut pending: BTreeSet<usize> = self.node.children().iter().copied().collect();
        while !pending.is_empty() {
            let env = self.node.recv().await?;
            let ProtocolMessage::ChildAggregatedData(child) = env.msg else {
                return Err(self.node.unexpected(&env));
            };
            if !pending.remove(&env.from) {
                return Err(ProtocolError::UnexpectedMessage { node: me, from: env.from, kind: "ChildAggregatedData" });
            }
            merge_grouped_data(&mut self.data, child, self.parallel)?;
        }
        self.state = ProtocolState::Merged;
        tracing::debug!(node = me, buckets = self.data.len(), "children merged");

        if self.node.is_root() {
            let tx = self
                .feedback
                .take()
                .ok_or_else(|| ProtocolError::Transport("aggregation root has no feedback consumer".to_string()))?;
            tx.send(self.data)
                .map_err(|_| ProtocolError::Transport("aggregation feedback dropped".to_string()))?;
            self.state = ProtocolState::Delivered;
        } else {
            self.node.send_to_parent(ProtocolMessage::ChildAggregatedData(self.data))?;
            self.state = ProtocolState::Forwarded;
        }

        Ok(self.state)
    }
}
