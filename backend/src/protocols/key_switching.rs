//! Key switching: moves a vector encrypted under the collective key to a querier's key.
//!
//! Node `i` contributes `(r_i·g, r_i·Q − x_i·K)` per ciphertext. Contributions are summed up the
//! tree and the root adds the sum onto the original `C`, giving `(Σr_i·g, m·g + Σr_i·Q)`: a fresh
//! encryption of `m` under `Q`. No node ever holds more than its own share.

use super::tree::{ProtocolMessage, TreeNodeInstance};
use super::ProtocolState;
use crate::errors::ProtocolError;
use ark_ff::Zero;
use dc_crypto::elgamal::{key_switch_contribution, random_scalar};
use dc_crypto::{CipherText, CipherVector, Point, Scalar};
use rand::rngs::OsRng;
use std::collections::BTreeSet;
use tokio::sync::oneshot;

/// This node's term for every element of `target`.
pub fn local_contribution(target: &CipherVector, share: &Scalar, target_public_key: &Point) -> CipherVector {
    let mut rng = OsRng;
    target
        .iter()
        .map(|ct| key_switch_contribution(ct, share, target_public_key, &random_scalar(&mut rng)))
        .collect()
}

/// Apply the summed contributions: `K` comes from the sum, `C` is original plus sum.
pub fn finalize(target: &CipherVector, summed: &CipherVector) -> Result<CipherVector, ProtocolError> {
    let original_c: CipherVector = target.iter().map(|ct| CipherText { k: Point::zero(), c: ct.c }).collect();
    Ok(original_c.add(summed)?)
}

pub struct KeySwitching {
    node: TreeNodeInstance,
    share: Scalar,
    target: Option<(CipherVector, Point)>,
    feedback: Option<oneshot::Sender<CipherVector>>,
}

impl KeySwitching {
    pub fn new(node: TreeNodeInstance, share: Scalar) -> Self {
        Self { node, share, target: None, feedback: None }
    }

    /// Seed the root with the vector to switch and the querier's key.
    pub fn with_target(mut self, target: CipherVector, target_public_key: Point) -> Self {
        self.target = Some((target, target_public_key));
        self
    }

    pub fn feedback(&mut self) -> oneshot::Receiver<CipherVector> {
        let (tx, rx) = oneshot::channel();
        self.feedback = Some(tx);
        rx
    }

    pub async fn dispatch(mut self) -> Result<ProtocolState, ProtocolError> {
        let me = self.node.index();

        let (target, target_public_key) = if self.node.is_root() {
            self.target
                .take()
                .ok_or_else(|| ProtocolError::Transport("key switching root started without a target".to_string()))?
        } else {
            match self.node.recv_from_parent().await? {
                ProtocolMessage::KeySwitchAnnounce { target, target_public_key } => (target, target_public_key),
                other => {
                    return Err(ProtocolError::UnexpectedMessage {
                        node: me,
                        from: self.node.parent().unwrap_or_default(),
                        kind: other.kind(),
                    });
                }
            }
        };

        self.node.send_to_children(&ProtocolMessage::KeySwitchAnnounce {
            target: target.clone(),
            target_public_key,
        })?;

        let mut summed = local_contribution(&target, &self.share, &target_public_key);

        if !self.node.is_leaf() {
            let mut pending: BTreeSet<usize> = self.node.children().iter().copied().collect();
            while !pending.is_empty() {
                let env = self.node.recv().await?;
                let ProtocolMessage::KeySwitchContribution(child) = env.msg else {
                    return Err(self.node.unexpected(&env));
                };
                if !pending.remove(&env.from) {
                    return Err(ProtocolError::UnexpectedMessage {
                        node: me,
                        from: env.from,
                        kind: "KeySwitchContribution",
                    });
                }
                summed.add_assign(&child)?;
            }
        }

        if !self.node.is_root() {
            tracing::debug!(node = me, elements = summed.len(), "key switching contribution forwarded");
            self.node.send_to_parent(ProtocolMessage::KeySwitchContribution(summed))?;
            return Ok(if self.node.is_leaf() { ProtocolState::Reported } else { ProtocolState::Forwarded });
        }

        let switched = finalize(&target, &summed)?;
        let tx = self
            .feedback
            .take()
            .ok_or_else(|| ProtocolError::Transport("key switching root has no feedback consumer".to_string()))?;
        tx.send(switched)
            .map_err(|_| ProtocolError::Transport("key switching feedback dropped".to_string()))?;
        Ok(ProtocolState::Delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::tree::{LocalTree, Tree};
    use crate::protocols::{run_nodes, ProtocolKind};
    use crate::roster::Collective;
    use dc_crypto::elgamal::{decrypt_int_vector, decrypt_point, encrypt_int_vector, int_to_point};
    use dc_crypto::KeyPair;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    async fn switch(collective: &Collective, branching: usize, target: CipherVector, querier: Point) -> CipherVector {
        let tree = Tree::n_ary(collective.len(), branching);
        let mut feedback = None;
        let mut nodes = Vec::new();
        for (inst, share) in LocalTree::instances(&tree).into_iter().zip(collective.shares()) {
            let mut p = KeySwitching::new(inst, share);
            if feedback.is_none() {
                p = p.with_target(target.clone(), querier);
                feedback = Some(p.feedback());
            }
            nodes.push(p.dispatch());
        }
        run_nodes(ProtocolKind::KeySwitching, nodes).await.unwrap();
        feedback.unwrap().await.unwrap()
    }

    #[tokio::test]
    async fn switched_values_decrypt_under_the_querier_key_only() {
        let mut rng = ChaCha20Rng::from_seed([21u8; 32]);
        let values = [0i64, 1, -7, 10, 123_456];

        for (size, branching) in [(1, 2), (3, 2), (5, 1), (7, 3)] {
            let collective = Collective::generate(size, &mut rng);
            let querier = KeyPair::generate(&mut rng);
            let target = encrypt_int_vector(&collective.public_key(), &values, &mut rng);

            let switched = switch(&collective, branching, target.clone(), querier.public).await;
            assert_eq!(decrypt_int_vector(&querier.secret, &switched).unwrap(), values);
            assert_ne!(switched, target);

            let collective_secret: Scalar = collective.shares().iter().sum();
            assert_ne!(decrypt_point(&collective_secret, &switched.0[2]), int_to_point(values[2]));
        }
    }

    #[tokio::test]
    async fn empty_vector_switches_to_empty() {
        let mut rng = ChaCha20Rng::from_seed([22u8; 32]);
        let collective = Collective::generate(3, &mut rng);
        let querier = KeyPair::generate(&mut rng);
        let switched = switch(&collective, 2, CipherVector::default(), querier.public).await;
        assert!(switched.is_empty());
    }
}
