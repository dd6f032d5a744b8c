//! Trust and liveness monitoring
//!
//! Two cadences run in the background. The fast scan demotes nodes whose
//! heartbeat has gone stale, penalizes their trust, and triggers a routing
//! rebuild. The slow scan does a full rebuild plus trust-decay
//! reconciliation: elevated trust drifts back toward the registration
//! baseline for nodes that have gone quiet. Load rebalancing is delegated to
//! the provisioning layer.

use crate::{
    notify::{notify_best_effort, NotificationChannel},
    registry::NodeRegistry,
    routing::RoutingTable,
    types::MeshEvent,
    DEFAULT_TRUST_SCORE, HEARTBEAT_TIMEOUT_SECS, LIVENESS_TRUST_PENALTY,
};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio::{
    sync::RwLock,
    time::{interval, Duration},
};
use tracing::{debug, info, warn};

/// Configuration for the liveness monitor
#[derive(Debug, Clone)]
pub struct LivenessConfig {
    /// Fast-cadence heartbeat scan interval in seconds
    pub scan_interval_secs: u64,
    /// Seconds without a heartbeat before a node is demoted
    pub heartbeat_timeout_secs: i64,
    /// Slow-cadence full rebuild and decay interval in seconds
    pub reconcile_interval_secs: u64,
    /// Hours of inactivity before trust starts decaying toward the baseline
    pub decay_after_hours: i64,
    /// Fraction of the gap to the baseline removed per reconciliation pass
    pub decay_rate: f64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 30,
            heartbeat_timeout_secs: HEARTBEAT_TIMEOUT_SECS,
            reconcile_interval_secs: 300,
            decay_after_hours: 24,
            decay_rate: 0.1,
        }
    }
}

/// Background monitor that demotes unresponsive nodes and reconciles trust
pub struct LivenessMonitor {
    config: LivenessConfig,
    registry: Arc<NodeRegistry>,
    routing: Arc<RoutingTable>,
    notifier: Arc<dyn NotificationChannel>,
    shutdown: Arc<RwLock<bool>>,
}

impl LivenessMonitor {
    /// Create a monitor over the registry and routing table
    pub fn new(
        config: LivenessConfig,
        registry: Arc<NodeRegistry>,
        routing: Arc<RoutingTable>,
        notifier: Arc<dyn NotificationChannel>,
    ) -> Self {
        Self {
            config,
            registry,
            routing,
            notifier,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    /// Spawn the fast and slow cadence tasks. Call [`shutdown`] to stop them.
    ///
    /// [`shutdown`]: LivenessMonitor::shutdown
    pub fn start(self: &Arc<Self>) {
        let fast = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(fast.config.scan_interval_secs));
            loop {
                ticker.tick().await;
                if *fast.shutdown.read().await {
                    debug!("Liveness scan task shutting down");
                    break;
                }
                fast.scan_once().await;
            }
        });

        let slow = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(slow.config.reconcile_interval_secs));
            loop {
                ticker.tick().await;
                if *slow.shutdown.read().await {
                    debug!("Reconciliation task shutting down");
                    break;
                }
                slow.reconcile_once().await;
            }
        });

        info!(
            scan_interval_secs = self.config.scan_interval_secs,
            reconcile_interval_secs = self.config.reconcile_interval_secs,
            "Liveness monitor started"
        );
    }

    /// Stop the background tasks
    pub async fn shutdown(&self) {
        *self.shutdown.write().await = true;
        info!("Liveness monitor shutting down");
    }

    /// One fast-cadence pass: demote nodes whose heartbeat exceeded the
    /// timeout, penalize their trust, and rebuild the routing table if any
    /// node was demoted.
    pub async fn scan_once(&self) {
        let now = Utc::now();
        let cutoff = now - ChronoDuration::seconds(self.config.heartbeat_timeout_secs);
        let mut demoted = 0usize;

        for node in self.registry.active_nodes() {
            if node.last_heartbeat >= cutoff {
                continue;
            }
            // Staleness is re-checked under the entry lock: a heartbeat that
            // arrived after the snapshot keeps the node active
            match self
                .registry
                .demote_if_stale(node.id, cutoff, LIVENESS_TRUST_PENALTY)
            {
                Ok(true) => {
                    warn!(
                        node_id = %node.id,
                        last_heartbeat = %node.last_heartbeat,
                        "Heartbeat stale; demoted node"
                    );
                    demoted += 1;
                    notify_best_effort(
                        self.notifier.as_ref(),
                        MeshEvent::NodeDemoted {
                            node_id: node.id,
                            reason: "heartbeat timeout".to_string(),
                            timestamp: now,
                        },
                    )
                    .await;
                }
                Ok(false) => {}
                Err(e) => warn!(node_id = %node.id, error = %e, "Demotion failed"),
            }
        }

        if demoted > 0 {
            self.routing.rebuild().await;
            info!(demoted, "Liveness scan demoted nodes and rebuilt routing");
        }
    }

    /// One slow-cadence pass: full routing rebuild plus trust decay for nodes
    /// that have gone quiet.
    pub async fn reconcile_once(&self) {
        let now = Utc::now();
        let idle_cutoff = ChronoDuration::hours(self.config.decay_after_hours);

        for node in self.registry.all_nodes() {
            if now - node.last_heartbeat < idle_cutoff {
                continue;
            }
            // Elevated trust drifts back toward the registration baseline;
            // trust below baseline is left to recover through outcomes
            if node.trust_score > DEFAULT_TRUST_SCORE {
                let delta = -(node.trust_score - DEFAULT_TRUST_SCORE) * self.config.decay_rate;
                let _ = self.registry.adjust_trust(node.id, delta);
                debug!(node_id = %node.id, delta, "Applied trust decay");
            }
        }

        self.routing.rebuild().await;
        debug!("Reconciliation pass completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        notify::NullNotifier,
        types::{NodeDescriptor, NodeStatus},
    };

    fn descriptor(caps: &[&str]) -> NodeDescriptor {
        NodeDescriptor {
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            endpoint: "10.0.0.1:7000".to_string(),
            latency_estimate_ms: None,
        }
    }

    fn monitor(registry: Arc<NodeRegistry>, routing: Arc<RoutingTable>) -> LivenessMonitor {
        LivenessMonitor::new(
            LivenessConfig::default(),
            registry,
            routing,
            Arc::new(NullNotifier),
        )
    }

    #[tokio::test]
    async fn stale_heartbeat_demotes_and_penalizes() {
        let registry = Arc::new(NodeRegistry::new());
        let id = registry.register(descriptor(&["chat"])).unwrap();
        let routing = Arc::new(RoutingTable::new(registry.clone()));
        routing.rebuild().await;

        // Age the heartbeat past the timeout
        registry
            .heartbeat(id, Utc::now() - ChronoDuration::seconds(HEARTBEAT_TIMEOUT_SECS + 10))
            .unwrap();

        let monitor = monitor(registry.clone(), routing.clone());
        monitor.scan_once().await;

        let node = registry.get(id).unwrap();
        assert_eq!(node.status, NodeStatus::Inactive);
        assert!(
            (node.trust_score - (crate::DEFAULT_TRUST_SCORE - LIVENESS_TRUST_PENALTY)).abs()
                < 1e-9
        );
        assert!(routing.candidates("chat").await.is_empty());
    }

    #[tokio::test]
    async fn fresh_heartbeat_keeps_node_active() {
        let registry = Arc::new(NodeRegistry::new());
        let id = registry.register(descriptor(&["chat"])).unwrap();
        let routing = Arc::new(RoutingTable::new(registry.clone()));
        routing.rebuild().await;

        let monitor = monitor(registry.clone(), routing.clone());
        monitor.scan_once().await;

        assert_eq!(registry.get(id).unwrap().status, NodeStatus::Active);
        assert_eq!(routing.candidates("chat").await.len(), 1);
    }

    #[tokio::test]
    async fn reconciliation_decays_elevated_idle_trust() {
        let registry = Arc::new(NodeRegistry::new());
        let id = registry.register(descriptor(&["chat"])).unwrap();
        let routing = Arc::new(RoutingTable::new(registry.clone()));

        // Drive trust above the baseline, then age the node
        for _ in 0..200 {
            registry.record_outcome(id, true).unwrap();
        }
        let elevated = registry.get(id).unwrap().trust_score;
        assert!(elevated > crate::DEFAULT_TRUST_SCORE);
        registry
            .heartbeat(id, Utc::now() - ChronoDuration::hours(48))
            .unwrap();

        let monitor = monitor(registry.clone(), routing);
        monitor.reconcile_once().await;

        let decayed = registry.get(id).unwrap().trust_score;
        assert!(decayed < elevated);
        assert!(decayed >= crate::DEFAULT_TRUST_SCORE);
    }
}
