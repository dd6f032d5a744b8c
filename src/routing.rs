//! Routing table: per-capability ranked candidate lists
//!
//! The table is read-mostly. `rebuild` assembles a complete replacement from
//! the registry and swaps it in under a single write-lock assignment, so a
//! concurrent reader sees either the old table or the new one, never a mix.

use crate::{registry::NodeRegistry, scoring, types::{Capability, NodeId, RouteCandidate}};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Per-capability ranked candidate lists, rebuilt wholesale from the registry
pub struct RoutingTable {
    registry: Arc<NodeRegistry>,
    entries: RwLock<HashMap<Capability, Vec<RouteCandidate>>>,
}

impl RoutingTable {
    /// Create an empty table over a registry
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self {
            registry,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuild every capability's entry from the registry and swap the table.
    ///
    /// Idempotent given an unchanged registry: candidates are sorted by the
    /// ranking key with the node ID as a stable tiebreaker, so two rebuilds
    /// with no intervening registry change produce identical ordering.
    pub async fn rebuild(&self) {
        let mut next: HashMap<Capability, Vec<RouteCandidate>> = HashMap::new();

        for capability in self.registry.known_capabilities() {
            let mut candidates: Vec<RouteCandidate> = self
                .registry
                .active_declaring(&capability)
                .into_iter()
                .map(|node| RouteCandidate {
                    node_id: node.id,
                    trust_score: node.trust_score,
                    load: node.current_load,
                    latency_estimate_ms: node.latency_estimate_ms,
                })
                .collect();

            candidates.sort_by(|a, b| {
                scoring::rank_key(b)
                    .partial_cmp(&scoring::rank_key(a))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.node_id.cmp(&b.node_id))
            });

            if !candidates.is_empty() {
                next.insert(capability, candidates);
            }
        }

        let entry_count = next.len();
        *self.entries.write().await = next;
        debug!(capabilities = entry_count, "Routing table rebuilt");
    }

    /// Ranked candidates for one capability
    pub async fn candidates(&self, capability: &str) -> Vec<RouteCandidate> {
        self.entries
            .read()
            .await
            .get(capability)
            .cloned()
            .unwrap_or_default()
    }

    /// Top-ranked candidate for a capability, skipping excluded nodes
    pub async fn top_candidate(
        &self,
        capability: &str,
        exclude: Option<NodeId>,
    ) -> Option<RouteCandidate> {
        self.entries
            .read()
            .await
            .get(capability)?
            .iter()
            .find(|c| Some(c.node_id) != exclude)
            .cloned()
    }

    /// Clone of the whole table, for registration receipts and analytics
    pub async fn snapshot(&self) -> HashMap<Capability, Vec<RouteCandidate>> {
        self.entries.read().await.clone()
    }

    /// Number of capabilities with at least one routable candidate
    pub async fn covered_capabilities(&self) -> usize {
        self.entries.read().await.len()
    }
}
