//! Node registry and capability index
//!
//! The registry is the single source of truth for node state. Mutations to a
//! single node's counters go through its `DashMap` entry, which serializes
//! them per node while leaving different nodes free to proceed in parallel.

use crate::{
    error::{MeshError, MeshResult},
    types::{Capability, NodeDescriptor, NodeId, NodeRecord, NodeStatus},
    DEFAULT_TRUST_SCORE, PER_CAPABILITY_SHARE, TRUST_CEILING, TRUST_FAILURE_DELTA, TRUST_FLOOR,
    TRUST_SUCCESS_DELTA,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default latency estimate for nodes that do not report one
const DEFAULT_LATENCY_ESTIMATE_MS: u64 = 250;

/// Registry of all nodes known to the mesh
pub struct NodeRegistry {
    /// Node records keyed by ID; entries are never removed
    nodes: DashMap<NodeId, NodeRecord>,
    /// Capability name to declaring node IDs; grows on registration, and is
    /// effectively pruned of inactive nodes at each routing-table rebuild
    capability_index: DashMap<Capability, HashSet<NodeId>>,
}

impl NodeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            capability_index: DashMap::new(),
        }
    }

    /// Register a new node from a descriptor.
    ///
    /// Fails with `InvalidDescriptor` when the capability set is empty or the
    /// endpoint is malformed. The new node starts at the policy-default trust
    /// score and is immediately visible in the capability index.
    pub fn register(&self, descriptor: NodeDescriptor) -> MeshResult<NodeId> {
        if descriptor.capabilities.is_empty() {
            return Err(MeshError::InvalidDescriptor(
                "capability set must not be empty".to_string(),
            ));
        }
        if !Self::endpoint_is_well_formed(&descriptor.endpoint) {
            return Err(MeshError::InvalidDescriptor(format!(
                "malformed endpoint address: {:?}",
                descriptor.endpoint
            )));
        }

        let node_id = Uuid::new_v4();
        let now = Utc::now();
        let record = NodeRecord {
            id: node_id,
            capabilities: descriptor.capabilities.clone(),
            endpoint: descriptor.endpoint,
            trust_score: DEFAULT_TRUST_SCORE,
            revenue_share_rate: PER_CAPABILITY_SHARE,
            status: NodeStatus::Active,
            last_heartbeat: now,
            total_requests: 0,
            successful_requests: 0,
            revenue_generated: 0.0,
            current_load: 0,
            latency_estimate_ms: descriptor
                .latency_estimate_ms
                .unwrap_or(DEFAULT_LATENCY_ESTIMATE_MS),
            registered_at: now,
        };

        self.nodes.insert(node_id, record);
        for capability in descriptor.capabilities {
            self.capability_index
                .entry(capability)
                .or_default()
                .insert(node_id);
        }

        info!(node_id = %node_id, "Registered node");
        Ok(node_id)
    }

    /// Transition a node to inactive. The record stays in storage and is
    /// pruned from routing entries at the next rebuild.
    pub fn mark_inactive(&self, node_id: NodeId) -> MeshResult<()> {
        let mut node = self
            .nodes
            .get_mut(&node_id)
            .ok_or(MeshError::NodeNotFound(node_id))?;
        node.status = NodeStatus::Inactive;
        debug!(node_id = %node_id, "Node marked inactive");
        Ok(())
    }

    /// Record an invocation outcome for a node.
    ///
    /// Success nudges trust up by a small delta; failure applies a larger
    /// downward delta. The asymmetry biases routing away from flaky nodes:
    /// trust is lost quickly and rebuilt slowly. The score is always kept
    /// within [TRUST_FLOOR, TRUST_CEILING].
    pub fn record_outcome(&self, node_id: NodeId, success: bool) -> MeshResult<()> {
        let mut node = self
            .nodes
            .get_mut(&node_id)
            .ok_or(MeshError::NodeNotFound(node_id))?;

        node.total_requests += 1;
        if success {
            node.successful_requests += 1;
            node.trust_score = (node.trust_score + TRUST_SUCCESS_DELTA).min(TRUST_CEILING);
        } else {
            node.trust_score = (node.trust_score - TRUST_FAILURE_DELTA).max(TRUST_FLOOR);
        }

        debug!(
            node_id = %node_id,
            success,
            trust = node.trust_score,
            "Recorded invocation outcome"
        );
        Ok(())
    }

    /// Update a node's last heartbeat. Does not itself affect trust.
    pub fn heartbeat(&self, node_id: NodeId, timestamp: DateTime<Utc>) -> MeshResult<()> {
        let mut node = self
            .nodes
            .get_mut(&node_id)
            .ok_or(MeshError::NodeNotFound(node_id))?;
        node.last_heartbeat = timestamp;
        Ok(())
    }

    /// Demote a node whose heartbeat is older than `cutoff`, applying
    /// `penalty` to its trust under the same entry lock. Returns `false`
    /// without demoting when a heartbeat arrived after the caller took its
    /// snapshot, or when the node is already inactive.
    pub fn demote_if_stale(
        &self,
        node_id: NodeId,
        cutoff: DateTime<Utc>,
        penalty: f64,
    ) -> MeshResult<bool> {
        let mut node = self
            .nodes
            .get_mut(&node_id)
            .ok_or(MeshError::NodeNotFound(node_id))?;
        if node.status != NodeStatus::Active || node.last_heartbeat >= cutoff {
            return Ok(false);
        }
        node.status = NodeStatus::Inactive;
        node.trust_score = (node.trust_score - penalty).clamp(TRUST_FLOOR, TRUST_CEILING);
        debug!(node_id = %node_id, trust = node.trust_score, "Demoted stale node");
        Ok(true)
    }

    /// Apply a direct trust adjustment, clamped to the allowed range.
    /// Used by the liveness monitor for timeout penalties and decay.
    pub fn adjust_trust(&self, node_id: NodeId, delta: f64) -> MeshResult<()> {
        let mut node = self
            .nodes
            .get_mut(&node_id)
            .ok_or(MeshError::NodeNotFound(node_id))?;
        node.trust_score = (node.trust_score + delta).clamp(TRUST_FLOOR, TRUST_CEILING);
        Ok(())
    }

    /// Mark an invocation as in flight on a node
    pub fn begin_invocation(&self, node_id: NodeId) {
        if let Some(mut node) = self.nodes.get_mut(&node_id) {
            node.current_load += 1;
        }
    }

    /// Mark an in-flight invocation as finished
    pub fn end_invocation(&self, node_id: NodeId) {
        if let Some(mut node) = self.nodes.get_mut(&node_id) {
            node.current_load = node.current_load.saturating_sub(1);
        } else {
            warn!(node_id = %node_id, "end_invocation for unknown node");
        }
    }

    /// Credit settled revenue to a node
    pub fn credit_revenue(&self, node_id: NodeId, amount: f64) -> MeshResult<()> {
        let mut node = self
            .nodes
            .get_mut(&node_id)
            .ok_or(MeshError::NodeNotFound(node_id))?;
        node.revenue_generated += amount;
        Ok(())
    }

    /// Snapshot of one node's record
    pub fn get(&self, node_id: NodeId) -> Option<NodeRecord> {
        self.nodes.get(&node_id).map(|n| n.clone())
    }

    /// Whether a node exists and is active
    pub fn is_active(&self, node_id: NodeId) -> bool {
        self.nodes
            .get(&node_id)
            .map(|n| n.status == NodeStatus::Active)
            .unwrap_or(false)
    }

    /// Snapshot of all node records
    pub fn all_nodes(&self) -> Vec<NodeRecord> {
        self.nodes.iter().map(|entry| entry.clone()).collect()
    }

    /// Snapshot of all active node records
    pub fn active_nodes(&self) -> Vec<NodeRecord> {
        self.nodes
            .iter()
            .filter(|entry| entry.status == NodeStatus::Active)
            .map(|entry| entry.clone())
            .collect()
    }

    /// Active nodes declaring a capability, per the index
    pub fn active_declaring(&self, capability: &str) -> Vec<NodeRecord> {
        let Some(ids) = self.capability_index.get(capability) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.nodes.get(id))
            .filter(|n| n.status == NodeStatus::Active)
            .map(|n| n.clone())
            .collect()
    }

    /// All capability names present in the index
    pub fn known_capabilities(&self) -> Vec<Capability> {
        self.capability_index
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of registered nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the registry holds no nodes
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn endpoint_is_well_formed(endpoint: &str) -> bool {
        // host:port or a URL with an explicit scheme
        if endpoint.is_empty() || endpoint.contains(char::is_whitespace) {
            return false;
        }
        if endpoint.contains("://") {
            return endpoint.splitn(2, "://").nth(1).map_or(false, |rest| !rest.is_empty());
        }
        match endpoint.rsplit_once(':') {
            Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
            None => false,
        }
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn descriptor(caps: &[&str]) -> NodeDescriptor {
        NodeDescriptor {
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            endpoint: "10.0.0.1:7000".to_string(),
            latency_estimate_ms: None,
        }
    }

    #[test]
    fn register_assigns_default_trust() {
        let registry = NodeRegistry::new();
        let id = registry.register(descriptor(&["transcribe"])).unwrap();
        let node = registry.get(id).unwrap();
        assert_eq!(node.trust_score, DEFAULT_TRUST_SCORE);
        assert_eq!(node.status, NodeStatus::Active);
    }

    #[test]
    fn register_rejects_empty_capabilities() {
        let registry = NodeRegistry::new();
        let result = registry.register(NodeDescriptor {
            capabilities: BTreeSet::new(),
            endpoint: "10.0.0.1:7000".to_string(),
            latency_estimate_ms: None,
        });
        assert!(matches!(result, Err(MeshError::InvalidDescriptor(_))));
    }

    #[test]
    fn register_rejects_malformed_endpoint() {
        let registry = NodeRegistry::new();
        for endpoint in ["", "no port", "host:", "host:notaport", "scheme://"] {
            let result = registry.register(NodeDescriptor {
                capabilities: ["chat".to_string()].into_iter().collect(),
                endpoint: endpoint.to_string(),
                latency_estimate_ms: None,
            });
            assert!(
                matches!(result, Err(MeshError::InvalidDescriptor(_))),
                "endpoint {:?} should be rejected",
                endpoint
            );
        }
        assert!(registry
            .register(NodeDescriptor {
                capabilities: ["chat".to_string()].into_iter().collect(),
                endpoint: "https://node.example.com/invoke".to_string(),
                latency_estimate_ms: None,
            })
            .is_ok());
    }

    #[test]
    fn outcome_deltas_are_asymmetric() {
        let registry = NodeRegistry::new();
        let id = registry.register(descriptor(&["chat"])).unwrap();

        registry.record_outcome(id, true).unwrap();
        let after_success = registry.get(id).unwrap().trust_score;
        assert!((after_success - (DEFAULT_TRUST_SCORE + TRUST_SUCCESS_DELTA)).abs() < 1e-9);

        registry.record_outcome(id, false).unwrap();
        let after_failure = registry.get(id).unwrap().trust_score;
        assert!(after_success - after_failure > TRUST_SUCCESS_DELTA);
    }

    #[test]
    fn trust_never_leaves_bounds() {
        let registry = NodeRegistry::new();
        let id = registry.register(descriptor(&["chat"])).unwrap();

        for _ in 0..500 {
            registry.record_outcome(id, false).unwrap();
        }
        assert_eq!(registry.get(id).unwrap().trust_score, TRUST_FLOOR);

        for _ in 0..2000 {
            registry.record_outcome(id, true).unwrap();
        }
        assert!(registry.get(id).unwrap().trust_score <= TRUST_CEILING);
    }

    #[test]
    fn stale_demotion_rechecks_live_heartbeat() {
        let registry = NodeRegistry::new();
        let id = registry.register(descriptor(&["chat"])).unwrap();
        let cutoff = Utc::now() - chrono::Duration::seconds(120);

        // The registration heartbeat is fresh, so a stale snapshot taken
        // earlier must not win the race
        assert!(!registry.demote_if_stale(id, cutoff, 0.05).unwrap());
        assert!(registry.is_active(id));

        registry
            .heartbeat(id, cutoff - chrono::Duration::seconds(10))
            .unwrap();
        assert!(registry.demote_if_stale(id, cutoff, 0.05).unwrap());
        let node = registry.get(id).unwrap();
        assert_eq!(node.status, NodeStatus::Inactive);
        assert!((node.trust_score - (DEFAULT_TRUST_SCORE - 0.05)).abs() < 1e-9);

        // Already inactive: no second penalty
        assert!(!registry.demote_if_stale(id, cutoff, 0.05).unwrap());
        let node = registry.get(id).unwrap();
        assert!((node.trust_score - (DEFAULT_TRUST_SCORE - 0.05)).abs() < 1e-9);
    }

    #[test]
    fn inactive_nodes_stay_in_storage() {
        let registry = NodeRegistry::new();
        let id = registry.register(descriptor(&["chat"])).unwrap();
        registry.mark_inactive(id).unwrap();

        assert!(registry.get(id).is_some());
        assert!(!registry.is_active(id));
        assert!(registry.active_declaring("chat").is_empty());
    }

    #[test]
    fn heartbeat_does_not_touch_trust() {
        let registry = NodeRegistry::new();
        let id = registry.register(descriptor(&["chat"])).unwrap();
        let before = registry.get(id).unwrap().trust_score;
        registry.heartbeat(id, Utc::now()).unwrap();
        assert_eq!(registry.get(id).unwrap().trust_score, before);
    }
}
