//! Mesh coordination facade
//!
//! [`MeshCoordinator`] wires the registry, routing table, planner,
//! orchestrator, dispatcher, ledger, and liveness monitor behind the four
//! externally exposed operations: node registration, request routing,
//! heartbeats, and analytics. All state is owned here and passed by handle;
//! there is no global state.

use crate::{
    dispatcher::RequestDispatcher,
    error::MeshResult,
    executor::NodeExecutor,
    monitor::{LivenessConfig, LivenessMonitor},
    notify::{notify_best_effort, NotificationChannel, NullNotifier},
    orchestrator::CollaborationOrchestrator,
    planner::CollaborationPlanner,
    registry::NodeRegistry,
    routing::RoutingTable,
    settlement::{BillingProvider, InMemoryLedgerStore, LedgerStore, SettlementLedger},
    types::{
        MeshEvent, NetworkAnalytics, NodeDescriptor, NodeId, RegistrationReceipt, Request,
        RouteOutcome,
    },
    INVOKE_TIMEOUT_SECS,
};
use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use std::sync::Arc;
use tracing::warn;

/// Length of registration auth tokens
const AUTH_TOKEN_LEN: usize = 32;

/// Configuration for the mesh coordinator
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Bounded timeout for a single node invocation, in seconds
    pub invoke_timeout_secs: u64,
    /// Liveness monitor cadences and thresholds
    pub liveness: LivenessConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            invoke_timeout_secs: INVOKE_TIMEOUT_SECS,
            liveness: LivenessConfig::default(),
        }
    }
}

/// Facade over the full routing, orchestration, and settlement stack
pub struct MeshCoordinator {
    registry: Arc<NodeRegistry>,
    routing: Arc<RoutingTable>,
    dispatcher: RequestDispatcher,
    ledger: Arc<SettlementLedger>,
    monitor: Arc<LivenessMonitor>,
    notifier: Arc<dyn NotificationChannel>,
}

impl MeshCoordinator {
    /// Build a coordinator over the given executor and billing provider,
    /// with an in-memory ledger and no outbound notifications.
    pub fn new(
        config: MeshConfig,
        executor: Arc<dyn NodeExecutor>,
        billing: Arc<dyn BillingProvider>,
    ) -> Self {
        Self::with_collaborators(
            config,
            executor,
            billing,
            Arc::new(InMemoryLedgerStore::new()),
            Arc::new(NullNotifier),
        )
    }

    /// Build a coordinator with explicit ledger storage and notification
    /// channel.
    pub fn with_collaborators(
        config: MeshConfig,
        executor: Arc<dyn NodeExecutor>,
        billing: Arc<dyn BillingProvider>,
        ledger_store: Arc<dyn LedgerStore>,
        notifier: Arc<dyn NotificationChannel>,
    ) -> Self {
        let registry = Arc::new(NodeRegistry::new());
        let routing = Arc::new(RoutingTable::new(registry.clone()));
        let planner = Arc::new(CollaborationPlanner::new(routing.clone()));
        let orchestrator = Arc::new(
            CollaborationOrchestrator::new(registry.clone(), executor.clone())
                .with_invoke_timeout(config.invoke_timeout_secs),
        );
        let ledger = Arc::new(SettlementLedger::new(
            ledger_store,
            registry.clone(),
            notifier.clone(),
        ));
        let dispatcher = RequestDispatcher::new(
            registry.clone(),
            planner,
            orchestrator,
            executor,
            ledger.clone(),
            billing,
        )
        .with_invoke_timeout(config.invoke_timeout_secs);
        let monitor = Arc::new(LivenessMonitor::new(
            config.liveness,
            registry.clone(),
            routing.clone(),
            notifier.clone(),
        ));

        Self {
            registry,
            routing,
            dispatcher,
            ledger,
            monitor,
            notifier,
        }
    }

    /// Start the background liveness monitor
    pub fn start(&self) {
        self.monitor.start();
    }

    /// Stop background tasks
    pub async fn shutdown(&self) {
        self.monitor.shutdown().await;
    }

    /// Register a node and return its receipt: assigned ID, auth token, the
    /// current peer list, and a routing snapshot. Triggers a routing rebuild
    /// and a best-effort registration broadcast.
    pub async fn register_node(&self, descriptor: NodeDescriptor) -> MeshResult<RegistrationReceipt> {
        let capabilities = descriptor.capabilities.clone();
        let node_id = self.registry.register(descriptor)?;
        self.routing.rebuild().await;

        notify_best_effort(
            self.notifier.as_ref(),
            MeshEvent::NodeRegistered {
                node_id,
                capabilities,
                timestamp: Utc::now(),
            },
        )
        .await;

        let peer_list = self
            .registry
            .active_nodes()
            .into_iter()
            .filter(|n| n.id != node_id)
            .map(|n| (n.id, n.endpoint))
            .collect();

        Ok(RegistrationReceipt {
            node_id,
            auth_token: generate_auth_token(),
            peer_list,
            routing_snapshot: self.routing.snapshot().await,
        })
    }

    /// Route a request; see [`RequestDispatcher::route_request`]
    pub async fn route_request(&self, request: &Request) -> RouteOutcome {
        self.dispatcher.route_request(request).await
    }

    /// Record a heartbeat for a node
    pub fn heartbeat(&self, node_id: NodeId, timestamp: DateTime<Utc>) -> MeshResult<()> {
        self.registry.heartbeat(node_id, timestamp)
    }

    /// Read-only network health, performance, and economic summary
    pub async fn analytics(&self) -> NetworkAnalytics {
        let nodes = self.registry.all_nodes();
        let active: Vec<_> = nodes
            .iter()
            .filter(|n| n.status == crate::types::NodeStatus::Active)
            .collect();

        let total_requests: u64 = nodes.iter().map(|n| n.total_requests).sum();
        let successful_requests: u64 = nodes.iter().map(|n| n.successful_requests).sum();
        let avg_trust_score = if active.is_empty() {
            0.0
        } else {
            active.iter().map(|n| n.trust_score).sum::<f64>() / active.len() as f64
        };

        // An unreadable ledger reports zero settlements; the warn separates
        // that from a genuinely empty ledger
        let records = match self.ledger.records().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Ledger unreadable; analytics omits settlements");
                Vec::new()
            }
        };
        let total_revenue_settled = records.iter().map(|r| r.total_revenue).sum();

        NetworkAnalytics {
            total_nodes: nodes.len(),
            active_nodes: active.len(),
            covered_capabilities: self.routing.covered_capabilities().await,
            total_requests,
            successful_requests,
            success_rate: successful_requests as f64 / total_requests.max(1) as f64,
            avg_trust_score,
            total_revenue_settled,
            settlements: records.len(),
            unsettled_collaborations: self.ledger.unsettled_collaborations().len(),
        }
    }

    /// Handle to the registry, for operators and tests
    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Handle to the routing table
    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    /// Handle to the settlement ledger
    pub fn ledger(&self) -> &Arc<SettlementLedger> {
        &self.ledger
    }

    /// Handle to the liveness monitor, for manual scan/reconcile passes
    pub fn monitor(&self) -> &Arc<LivenessMonitor> {
        &self.monitor
    }
}

fn generate_auth_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(AUTH_TOKEN_LEN)
        .map(char::from)
        .collect()
}
