//! Opaque node invocation seam
//!
//! The mesh never prescribes a transport. Whatever carries a sub-request to a
//! node (networked RPC, message queue, in-process call) implements
//! [`NodeExecutor`]; the orchestrator and dispatcher only rely on the timeout
//! bound and the success/failure discriminant. [`MockNodeExecutor`] stands in
//! for real transports in tests.

use crate::{
    error::{MeshError, MeshResult},
    types::{NodeId, SubRequest},
};
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::timeout;
use tracing::warn;

/// Opaque invocation of a node with a sub-request
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Invoke a node. Implementations surface transport failures as
    /// `NodeUnreachable` and node-reported failures as any other error.
    async fn invoke(
        &self,
        node_id: NodeId,
        sub_request: SubRequest,
    ) -> MeshResult<serde_json::Value>;
}

/// Invoke a node through an executor with the bounded invocation timeout.
/// Elapsing the deadline yields `NodeTimeout`; the node may still be working,
/// which is why delivery is at-least-once rather than exactly-once.
pub async fn invoke_with_timeout(
    executor: &dyn NodeExecutor,
    node_id: NodeId,
    sub_request: SubRequest,
    timeout_secs: u64,
) -> MeshResult<serde_json::Value> {
    match timeout(
        Duration::from_secs(timeout_secs),
        executor.invoke(node_id, sub_request),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => {
            warn!(node_id = %node_id, timeout_secs, "Node invocation timed out");
            Err(MeshError::NodeTimeout {
                node: node_id,
                timeout_secs,
            })
        }
    }
}

/// Scripted behavior for one node in the mock executor
#[derive(Clone)]
enum MockBehavior {
    /// Respond with this value after the given delay
    Respond {
        value: serde_json::Value,
        delay: Duration,
    },
    /// Fail as unreachable
    Unreachable(String),
    /// Never respond; relies on the caller's timeout
    Hang,
}

/// In-process fake executor for tests and demos.
///
/// Nodes respond with a scripted value (echoing their assigned capabilities
/// by default), fail, or hang. Invocations are counted per node.
pub struct MockNodeExecutor {
    behaviors: DashMap<NodeId, MockBehavior>,
    invocations: DashMap<NodeId, u64>,
    default_delay: Duration,
}

impl MockNodeExecutor {
    /// Create a mock where every node echoes its assignment instantly
    pub fn new() -> Self {
        Self {
            behaviors: DashMap::new(),
            invocations: DashMap::new(),
            default_delay: Duration::from_millis(0),
        }
    }

    /// Script a node to respond with a fixed value
    pub fn respond_with(&self, node_id: NodeId, value: serde_json::Value) {
        self.behaviors.insert(
            node_id,
            MockBehavior::Respond {
                value,
                delay: self.default_delay,
            },
        );
    }

    /// Script a node to respond after a delay
    pub fn respond_after(&self, node_id: NodeId, value: serde_json::Value, delay: Duration) {
        self.behaviors
            .insert(node_id, MockBehavior::Respond { value, delay });
    }

    /// Script a node to fail as unreachable
    pub fn fail_unreachable(&self, node_id: NodeId, detail: impl Into<String>) {
        self.behaviors
            .insert(node_id, MockBehavior::Unreachable(detail.into()));
    }

    /// Script a node to hang until the caller's timeout fires
    pub fn hang(&self, node_id: NodeId) {
        self.behaviors.insert(node_id, MockBehavior::Hang);
    }

    /// How many times a node was invoked
    pub fn invocation_count(&self, node_id: NodeId) -> u64 {
        self.invocations.get(&node_id).map(|c| *c).unwrap_or(0)
    }

    fn record_invocation(&self, node_id: NodeId) {
        *self.invocations.entry(node_id).or_insert(0) += 1;
    }
}

impl Default for MockNodeExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NodeExecutor for MockNodeExecutor {
    async fn invoke(
        &self,
        node_id: NodeId,
        sub_request: SubRequest,
    ) -> MeshResult<serde_json::Value> {
        self.record_invocation(node_id);

        let behavior = self
            .behaviors
            .get(&node_id)
            .map(|b| b.clone())
            .unwrap_or(MockBehavior::Respond {
                value: serde_json::json!({
                    "node": node_id.to_string(),
                    "handled": sub_request.capabilities,
                }),
                delay: self.default_delay,
            });

        match behavior {
            MockBehavior::Respond { value, delay } => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                Ok(value)
            }
            MockBehavior::Unreachable(detail) => Err(MeshError::NodeUnreachable {
                node: node_id,
                detail,
            }),
            MockBehavior::Hang => {
                // Far longer than any test timeout
                tokio::time::sleep(Duration::from_secs(3600)).await;
                unreachable!("mock hang completed")
            }
        }
    }
}
