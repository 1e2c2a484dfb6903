//! Tree protocols run by the collective.
//!
//! Every node of a protocol instance is a tokio task reading its own inbox; edges of the tree are
//! channels (see [`tree::LocalTree`]). The root hands its result to the caller over a oneshot
//! feedback channel, so delivery happens at most once.

pub mod addrm_server;
pub mod collective_aggregation;
pub mod key_switching;
pub mod tree;

use crate::errors::ProtocolError;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use tokio::task::JoinSet;

/// Node lifecycle shared by the tree protocols.
///
/// Root: `Idle → WaitingChildren → Merged → Delivered`.
/// Internal: `Idle → WaitingChildren → Forwarded`. Leaf: `Idle → Reported`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolState {
    Idle,
    WaitingChildren,
    Merged,
    Forwarded,
    Reported,
    Delivered,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProtocolKind {
    CollectiveAggregation,
    KeySwitching,
    AddRmServer,
}

impl ProtocolKind {
    pub fn name(self) -> &'static str {
        match self {
            ProtocolKind::CollectiveAggregation => "CollectiveAggregation",
            ProtocolKind::KeySwitching => "KeySwitching",
            ProtocolKind::AddRmServer => "AddRmServer",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProtocolKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [ProtocolKind::CollectiveAggregation, ProtocolKind::KeySwitching, ProtocolKind::AddRmServer]
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| ProtocolError::UnknownProtocol(s.to_string()))
    }
}

/// Drive every node of one protocol instance to completion.
///
/// The first failing node aborts the others: dropping the set cancels tasks that would otherwise
/// wait forever for a peer that is gone.
pub async fn run_nodes<F>(kind: ProtocolKind, nodes: Vec<F>) -> Result<(), ProtocolError>
where
    F: Future<Output = Result<ProtocolState, ProtocolError>> + Send + 'static,
{
    let mut set = JoinSet::new();
    for node in nodes {
        set.spawn(node);
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(state)) => tracing::trace!(protocol = %kind, ?state, "node finished"),
            Ok(Err(e)) => {
                tracing::warn!(protocol = %kind, error = %e, "node failed; aborting instance");
                return Err(e);
            }
            Err(e) => return Err(ProtocolError::Transport(format!("{kind} node task: {e}"))),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_names_resolve_and_unknown_names_fail() {
        for kind in [ProtocolKind::CollectiveAggregation, ProtocolKind::KeySwitching, ProtocolKind::AddRmServer] {
            assert_eq!(kind.name().parse::<ProtocolKind>().unwrap(), kind);
        }
        assert!(matches!(
            "ShuffleProtocol".parse::<ProtocolKind>(),
            Err(ProtocolError::UnknownProtocol(_))
        ));
    }

    #[tokio::test]
    async fn first_failure_aborts_the_instance() {
        type NodeFuture = std::pin::Pin<Box<dyn Future<Output = Result<ProtocolState, ProtocolError>> + Send>>;

        let ok: NodeFuture = Box::pin(async { Ok(ProtocolState::Reported) });
        let failing: NodeFuture = Box::pin(async { Err(ProtocolError::Transport("gone".into())) });
        // Never completes; must be cancelled by the failure above.
        let stuck: NodeFuture = Box::pin(std::future::pending());

        let res = run_nodes(ProtocolKind::KeySwitching, vec![ok, failing, stuck]).await;
        assert!(matches!(res, Err(ProtocolError::Transport(_))));
    }
}
