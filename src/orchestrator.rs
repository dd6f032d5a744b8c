//! Collaboration execution
//!
//! Steps run strictly sequentially, never in parallel: each node's output
//! becomes part of the shared context handed to the next node, a deliberate
//! causal-ordering simplification. A failed step aborts the remaining ones
//! and surfaces a [`CollaborationFailure`]; there is no automatic re-routing
//! or retry, and side effects already performed by earlier steps stand.

use crate::{
    executor::{invoke_with_timeout, NodeExecutor},
    registry::NodeRegistry,
    types::{CollaborationFailure, CollaborationPlan, NodeId, Request, SubRequest},
    INVOKE_TIMEOUT_SECS,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Pluggable synthesis of a final result from per-node results
pub trait MergeStrategy: Send + Sync {
    /// Merge the results mapping into one value. `order` is the execution
    /// order the results were produced in.
    fn merge(
        &self,
        results: &HashMap<NodeId, serde_json::Value>,
        order: &[NodeId],
    ) -> serde_json::Value;
}

/// Default merge: a JSON object keyed by producing node ID, preserving the
/// execution order in a parallel `sequence` array
pub struct KeyedMerge;

impl MergeStrategy for KeyedMerge {
    fn merge(
        &self,
        results: &HashMap<NodeId, serde_json::Value>,
        order: &[NodeId],
    ) -> serde_json::Value {
        let mut by_node = serde_json::Map::new();
        for (node_id, value) in results {
            by_node.insert(node_id.to_string(), value.clone());
        }
        serde_json::json!({
            "results": by_node,
            "sequence": order.iter().map(|n| n.to_string()).collect::<Vec<_>>(),
        })
    }
}

/// Executes collaboration plans step by step
pub struct CollaborationOrchestrator {
    registry: Arc<NodeRegistry>,
    executor: Arc<dyn NodeExecutor>,
    merge: Arc<dyn MergeStrategy>,
    invoke_timeout_secs: u64,
}

impl CollaborationOrchestrator {
    /// Create an orchestrator with the default keyed merge
    pub fn new(registry: Arc<NodeRegistry>, executor: Arc<dyn NodeExecutor>) -> Self {
        Self::with_merge(registry, executor, Arc::new(KeyedMerge))
    }

    /// Create an orchestrator with a custom merge strategy
    pub fn with_merge(
        registry: Arc<NodeRegistry>,
        executor: Arc<dyn NodeExecutor>,
        merge: Arc<dyn MergeStrategy>,
    ) -> Self {
        Self {
            registry,
            executor,
            merge,
            invoke_timeout_secs: INVOKE_TIMEOUT_SECS,
        }
    }

    /// Override the per-invocation timeout, mainly for tests
    pub fn with_invoke_timeout(mut self, secs: u64) -> Self {
        self.invoke_timeout_secs = secs;
        self
    }

    /// Execute a plan against the original request, returning the merged
    /// result on full success.
    ///
    /// Every invocation outcome, success or failure, is recorded against the
    /// node before the result is returned, so cancellation of the returned
    /// future never undoes an already-recorded outcome.
    pub async fn execute(
        &self,
        plan: &CollaborationPlan,
        request: &Request,
    ) -> Result<serde_json::Value, CollaborationFailure> {
        let mut results: HashMap<NodeId, serde_json::Value> = HashMap::new();

        for (step, node_id) in plan.execution_order.iter().copied().enumerate() {
            let sub_request = SubRequest {
                collaboration_id: plan.collaboration_id,
                context: request.context.clone(),
                prior_results: results.clone(),
                capabilities: plan.capabilities_for(node_id),
                revenue_share: plan
                    .revenue_share_per_node
                    .get(&node_id)
                    .copied()
                    .unwrap_or(0.0),
            };

            debug!(
                collaboration_id = %plan.collaboration_id,
                step,
                node_id = %node_id,
                "Executing collaboration step"
            );

            self.registry.begin_invocation(node_id);
            let outcome = invoke_with_timeout(
                self.executor.as_ref(),
                node_id,
                sub_request,
                self.invoke_timeout_secs,
            )
            .await;
            self.registry.end_invocation(node_id);

            match outcome {
                Ok(value) => {
                    if let Err(e) = self.registry.record_outcome(node_id, true) {
                        warn!(node_id = %node_id, error = %e, "Failed to record success outcome");
                    }
                    results.insert(node_id, value);
                }
                Err(e) => {
                    if let Err(record_err) = self.registry.record_outcome(node_id, false) {
                        warn!(node_id = %node_id, error = %record_err, "Failed to record failure outcome");
                    }
                    warn!(
                        collaboration_id = %plan.collaboration_id,
                        failed_node = %node_id,
                        reason = %e,
                        "Collaboration step failed; aborting remaining steps"
                    );
                    return Err(CollaborationFailure {
                        failed_node: node_id,
                        reason: e.to_string(),
                        collaboration_id: plan.collaboration_id,
                        partial_results: results,
                    });
                }
            }
        }

        info!(
            collaboration_id = %plan.collaboration_id,
            steps = plan.execution_order.len(),
            "Collaboration completed"
        );
        Ok(self.merge.merge(&results, &plan.execution_order))
    }
}
