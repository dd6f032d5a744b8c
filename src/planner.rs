//! Collaboration planning
//!
//! When no single node covers a request, the planner assigns each required
//! capability to the top-ranked eligible node, accrues provisional revenue
//! shares, and fixes an execution order. Plans are reproducible: capabilities
//! are iterated in lexicographic order, so the same registry state always
//! yields the same plan.

use crate::{
    routing::RoutingTable,
    types::{Capability, CollaborationPlan, NodeId, Request},
    NETWORK_FEE_RATE, PER_CAPABILITY_SHARE,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Pluggable execution-order strategy.
///
/// The base contract is the deterministic first-assignment order of distinct
/// nodes; [`TopologicalOrder`] is an opt-in extension for callers that know a
/// dependency graph between participants.
pub trait OrderingStrategy: Send + Sync {
    /// Order the distinct assigned nodes for execution. `assigned` is in
    /// first-assignment order and contains no duplicates.
    fn order(&self, assigned: &[NodeId]) -> Vec<NodeId>;
}

/// Default strategy: keep the deterministic first-assignment order
pub struct InsertionOrder;

impl OrderingStrategy for InsertionOrder {
    fn order(&self, assigned: &[NodeId]) -> Vec<NodeId> {
        assigned.to_vec()
    }
}

/// Topological ordering over an explicit dependency graph.
///
/// `dependencies[n]` lists nodes that must run before `n`. Nodes absent from
/// the graph, and any cycle remainder, fall back to first-assignment order so
/// the result always contains every assigned node exactly once.
pub struct TopologicalOrder {
    dependencies: HashMap<NodeId, Vec<NodeId>>,
}

impl TopologicalOrder {
    /// Build from a dependency mapping
    pub fn new(dependencies: HashMap<NodeId, Vec<NodeId>>) -> Self {
        Self { dependencies }
    }
}

impl OrderingStrategy for TopologicalOrder {
    fn order(&self, assigned: &[NodeId]) -> Vec<NodeId> {
        let member: BTreeSet<NodeId> = assigned.iter().copied().collect();
        let mut in_degree: HashMap<NodeId, usize> = assigned.iter().map(|n| (*n, 0)).collect();
        for node in assigned {
            if let Some(deps) = self.dependencies.get(node) {
                let count = deps.iter().filter(|d| member.contains(d)).count();
                in_degree.insert(*node, count);
            }
        }

        // Kahn's algorithm, picking ready nodes in first-assignment order
        // to stay deterministic
        let mut ordered = Vec::with_capacity(assigned.len());
        let mut remaining: Vec<NodeId> = assigned.to_vec();
        while !remaining.is_empty() {
            let next_pos = remaining
                .iter()
                .position(|n| in_degree.get(n).copied().unwrap_or(0) == 0);
            let Some(pos) = next_pos else {
                // Cycle: append the rest in first-assignment order
                warn!("Dependency cycle in execution ordering; falling back to assignment order");
                ordered.extend(remaining);
                break;
            };
            let node = remaining.remove(pos);
            ordered.push(node);
            for other in &remaining {
                if let Some(deps) = self.dependencies.get(other) {
                    if deps.contains(&node) {
                        if let Some(d) = in_degree.get_mut(other) {
                            *d = d.saturating_sub(1);
                        }
                    }
                }
            }
        }
        ordered
    }
}

/// Builds collaboration plans from the routing table
pub struct CollaborationPlanner {
    routing: Arc<RoutingTable>,
    ordering: Arc<dyn OrderingStrategy>,
}

impl CollaborationPlanner {
    /// Create a planner with the default insertion ordering
    pub fn new(routing: Arc<RoutingTable>) -> Self {
        Self::with_ordering(routing, Arc::new(InsertionOrder))
    }

    /// Create a planner with a custom ordering strategy
    pub fn with_ordering(routing: Arc<RoutingTable>, ordering: Arc<dyn OrderingStrategy>) -> Self {
        Self { routing, ordering }
    }

    /// Build a plan for a request. Capabilities with no eligible node are
    /// returned in the unmet set; the dispatcher decides policy (fail on any
    /// gap).
    pub async fn plan(&self, request: &Request) -> (CollaborationPlan, BTreeSet<Capability>) {
        let collaboration_id = Uuid::new_v4();
        let mut capability_to_node: BTreeMap<Capability, NodeId> = BTreeMap::new();
        let mut revenue_share_per_node: HashMap<NodeId, f64> = HashMap::new();
        let mut assigned_order: Vec<NodeId> = Vec::new();
        let mut unmet: BTreeSet<Capability> = BTreeSet::new();

        // BTreeSet iteration is lexicographic, keeping plans reproducible
        for capability in &request.required_capabilities {
            match self
                .routing
                .top_candidate(capability, request.origin_node)
                .await
            {
                Some(candidate) => {
                    capability_to_node.insert(capability.clone(), candidate.node_id);
                    *revenue_share_per_node.entry(candidate.node_id).or_insert(0.0) +=
                        PER_CAPABILITY_SHARE;
                    if !assigned_order.contains(&candidate.node_id) {
                        assigned_order.push(candidate.node_id);
                    }
                }
                None => {
                    unmet.insert(capability.clone());
                }
            }
        }

        Self::clamp_shares(&mut revenue_share_per_node);
        let execution_order = self.ordering.order(&assigned_order);

        debug!(
            collaboration_id = %collaboration_id,
            participants = execution_order.len(),
            unmet = unmet.len(),
            "Built collaboration plan"
        );

        let plan = CollaborationPlan {
            collaboration_id,
            capability_to_node,
            revenue_share_per_node,
            participating_nodes: execution_order.clone(),
            execution_order,
        };
        (plan, unmet)
    }

    /// Scale node shares down proportionally when their sum plus the network
    /// fee would exceed the whole revenue. Settlement then can never pay out
    /// more than it takes in, regardless of how many capabilities one plan
    /// spans.
    fn clamp_shares(shares: &mut HashMap<NodeId, f64>) {
        let total: f64 = shares.values().sum();
        let available = 1.0 - NETWORK_FEE_RATE;
        if total > available {
            let scale = available / total;
            for share in shares.values_mut() {
                *share *= scale;
            }
            warn!(
                original_total = total,
                scaled_to = available,
                "Clamped collaboration revenue shares"
            );
        }
    }
}
