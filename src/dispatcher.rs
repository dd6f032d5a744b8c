//! Request dispatch: single-node path vs. collaboration path
//!
//! A request goes to one node whenever any active node (other than the
//! origin) declares the full required capability set; the best such node by
//! mean composite score wins, and the planner is never consulted. Otherwise
//! the planner builds a collaboration plan, the orchestrator runs it, and a
//! successful collaboration is settled against the ledger.

use crate::{
    error::MeshError,
    executor::{invoke_with_timeout, NodeExecutor},
    orchestrator::CollaborationOrchestrator,
    planner::CollaborationPlanner,
    registry::NodeRegistry,
    scoring,
    settlement::{BillingProvider, SettlementLedger},
    types::{
        FailureDiagnostic, NodeRecord, Request, RouteOutcome, RoutingInfo, SubRequest,
    },
    INVOKE_TIMEOUT_SECS,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Decides between the single-node and collaboration paths for each request
pub struct RequestDispatcher {
    registry: Arc<NodeRegistry>,
    planner: Arc<CollaborationPlanner>,
    orchestrator: Arc<CollaborationOrchestrator>,
    executor: Arc<dyn NodeExecutor>,
    ledger: Arc<SettlementLedger>,
    billing: Arc<dyn BillingProvider>,
    invoke_timeout_secs: u64,
}

impl RequestDispatcher {
    /// Wire a dispatcher over its collaborators
    pub fn new(
        registry: Arc<NodeRegistry>,
        planner: Arc<CollaborationPlanner>,
        orchestrator: Arc<CollaborationOrchestrator>,
        executor: Arc<dyn NodeExecutor>,
        ledger: Arc<SettlementLedger>,
        billing: Arc<dyn BillingProvider>,
    ) -> Self {
        Self {
            registry,
            planner,
            orchestrator,
            executor,
            ledger,
            billing,
            invoke_timeout_secs: INVOKE_TIMEOUT_SECS,
        }
    }

    /// Override the per-invocation timeout, mainly for tests
    pub fn with_invoke_timeout(mut self, secs: u64) -> Self {
        self.invoke_timeout_secs = secs;
        self
    }

    /// Route a request to the best single node, or through a collaboration.
    ///
    /// Cancellation: dropping the returned future abandons the request, but
    /// outcomes already recorded against invoked nodes stand (at-least-once
    /// semantics toward nodes).
    pub async fn route_request(&self, request: &Request) -> RouteOutcome {
        if request.required_capabilities.is_empty() {
            return RouteOutcome::Failure {
                reason: "request requires no capabilities".to_string(),
                diagnostic: FailureDiagnostic::UnmetCapabilities(Default::default()),
            };
        }

        if let Some(node) = self.best_full_coverage_node(request) {
            return self.dispatch_single(request, node).await;
        }
        self.dispatch_collaboration(request).await
    }

    /// Best active non-origin node declaring the full required set, by mean
    /// composite score. `None` sends the request down the collaboration path.
    fn best_full_coverage_node(&self, request: &Request) -> Option<NodeRecord> {
        self.registry
            .active_nodes()
            .into_iter()
            .filter(|node| Some(node.id) != request.origin_node)
            .filter(|node| {
                request
                    .required_capabilities
                    .iter()
                    .all(|c| node.capabilities.contains(c))
            })
            .max_by(|a, b| {
                let score_a = scoring::average_score(a, &request.required_capabilities);
                let score_b = scoring::average_score(b, &request.required_capabilities);
                score_a
                    .partial_cmp(&score_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    // Stable winner when scores tie
                    .then_with(|| b.id.cmp(&a.id))
            })
    }

    async fn dispatch_single(&self, request: &Request, node: NodeRecord) -> RouteOutcome {
        let score = scoring::average_score(&node, &request.required_capabilities);
        debug!(
            node_id = %node.id,
            score,
            caller = %request.caller_identity,
            "Single-node path selected"
        );

        let sub_request = SubRequest {
            // Correlation ID for the node; no collaboration exists
            collaboration_id: Uuid::new_v4(),
            context: request.context.clone(),
            prior_results: Default::default(),
            capabilities: request.required_capabilities.iter().cloned().collect(),
            revenue_share: node.revenue_share_rate,
        };

        self.registry.begin_invocation(node.id);
        let outcome = invoke_with_timeout(
            self.executor.as_ref(),
            node.id,
            sub_request,
            self.invoke_timeout_secs,
        )
        .await;
        self.registry.end_invocation(node.id);

        match outcome {
            Ok(data) => {
                if let Err(e) = self.registry.record_outcome(node.id, true) {
                    warn!(node_id = %node.id, error = %e, "Failed to record success outcome");
                }
                RouteOutcome::Success {
                    data,
                    routing_info: RoutingInfo::SingleNode {
                        node_id: node.id,
                        score,
                    },
                }
            }
            Err(e) => {
                // Timeout and unreachable both cost trust; no retry, no
                // substitute node
                if let Err(record_err) = self.registry.record_outcome(node.id, false) {
                    warn!(node_id = %node.id, error = %record_err, "Failed to record failure outcome");
                }
                warn!(node_id = %node.id, reason = %e, "Single-node invocation failed");
                RouteOutcome::Failure {
                    reason: e.to_string(),
                    diagnostic: FailureDiagnostic::NodeInvocation {
                        node_id: node.id,
                        detail: e.to_string(),
                    },
                }
            }
        }
    }

    async fn dispatch_collaboration(&self, request: &Request) -> RouteOutcome {
        let (plan, unmet) = self.planner.plan(request).await;
        if !unmet.is_empty() {
            debug!(?unmet, "No route available");
            let error = MeshError::NoRouteAvailable {
                unmet: unmet.clone(),
            };
            return RouteOutcome::Failure {
                reason: error.to_string(),
                diagnostic: FailureDiagnostic::UnmetCapabilities(unmet),
            };
        }

        info!(
            collaboration_id = %plan.collaboration_id,
            participants = plan.participating_nodes.len(),
            caller = %request.caller_identity,
            "Collaboration path selected"
        );

        match self.orchestrator.execute(&plan, request).await {
            Ok(data) => {
                let total_revenue = self.billing.total_revenue(plan.collaboration_id).await;
                if total_revenue > 0.0 {
                    if let Err(e) = self
                        .ledger
                        .settle(
                            plan.collaboration_id,
                            &plan.revenue_share_per_node,
                            total_revenue,
                        )
                        .await
                    {
                        // The collaboration result is still valid; the ledger
                        // flags the collaboration unsettled for reconciliation
                        error!(
                            collaboration_id = %plan.collaboration_id,
                            error = %e,
                            "Settlement failed after successful collaboration"
                        );
                    }
                }
                RouteOutcome::Success {
                    data,
                    routing_info: RoutingInfo::Collaboration {
                        collaboration_id: plan.collaboration_id,
                        participants: plan.participating_nodes.clone(),
                    },
                }
            }
            Err(failure) => RouteOutcome::Failure {
                reason: failure.reason.clone(),
                diagnostic: FailureDiagnostic::Collaboration(failure),
            },
        }
    }
}
