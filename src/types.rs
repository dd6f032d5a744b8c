//! Common types for the capability mesh

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use uuid::Uuid;

/// Unique identifier for a node in the mesh
pub type NodeId = Uuid;

/// Unique identifier for a multi-node collaboration
pub type CollaborationId = Uuid;

/// Named unit of functionality a node claims to provide
pub type Capability = String;

/// Lifecycle status of a registered node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    /// Node is live and eligible for routing
    Active,
    /// Node was demoted (missed heartbeats) or withdrawn; kept in storage,
    /// pruned from routing entries at the next rebuild
    Inactive,
}

/// Descriptor supplied by the provisioning layer when registering a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Capabilities the node declares; must be non-empty
    pub capabilities: BTreeSet<Capability>,
    /// Endpoint address the executor uses to reach the node
    pub endpoint: String,
    /// Optional initial latency estimate in milliseconds
    pub latency_estimate_ms: Option<u64>,
}

/// Full record for a registered node; the registry is the single source of
/// truth for this state. Records are never hard-deleted, only marked inactive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Unique node ID
    pub id: NodeId,
    /// Declared capabilities
    pub capabilities: BTreeSet<Capability>,
    /// Endpoint address
    pub endpoint: String,
    /// Reputation value, always within [0.1, 1.0]
    pub trust_score: f64,
    /// Per-capability revenue share the node accrues in collaborations
    pub revenue_share_rate: f64,
    /// Current lifecycle status
    pub status: NodeStatus,
    /// Last heartbeat received
    pub last_heartbeat: DateTime<Utc>,
    /// Total requests dispatched to this node
    pub total_requests: u64,
    /// Requests that completed successfully
    pub successful_requests: u64,
    /// Revenue settled to this node so far
    pub revenue_generated: f64,
    /// Number of invocations currently in flight
    pub current_load: u32,
    /// Estimated invocation latency in milliseconds
    pub latency_estimate_ms: u64,
    /// When the node registered
    pub registered_at: DateTime<Utc>,
}

impl NodeRecord {
    /// Observed success rate, with no-history nodes treated as neutral
    pub fn success_rate(&self) -> f64 {
        self.successful_requests as f64 / self.total_requests.max(1) as f64
    }
}

/// An incoming request, scoped to a single dispatch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Node that originated the request, excluded from candidate selection
    pub origin_node: Option<NodeId>,
    /// Capabilities the request needs; must all be covered
    pub required_capabilities: BTreeSet<Capability>,
    /// Opaque caller context, forwarded to nodes verbatim
    pub context: serde_json::Value,
    /// Identity string of the caller, for audit logging
    pub caller_identity: String,
}

impl Request {
    /// Convenience constructor for a request with no origin node
    pub fn new<I, S>(required: I, context: serde_json::Value) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Capability>,
    {
        Self {
            origin_node: None,
            required_capabilities: required.into_iter().map(Into::into).collect(),
            context,
            caller_identity: String::new(),
        }
    }
}

/// Ranked routing candidate for one capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteCandidate {
    /// Candidate node
    pub node_id: NodeId,
    /// Trust score at rebuild time
    pub trust_score: f64,
    /// Load at rebuild time
    pub load: u32,
    /// Latency estimate in milliseconds
    pub latency_estimate_ms: u64,
}

/// Assignment of required capabilities to nodes, with execution order and
/// provisional revenue shares. Built fresh per multi-node request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationPlan {
    /// Unique collaboration ID; the only part that survives into settlement
    pub collaboration_id: CollaborationId,
    /// Capability to assigned node; BTreeMap keeps iteration deterministic
    pub capability_to_node: BTreeMap<Capability, NodeId>,
    /// Provisional revenue share per participating node
    pub revenue_share_per_node: HashMap<NodeId, f64>,
    /// Distinct nodes in the order they will be invoked
    pub execution_order: Vec<NodeId>,
    /// All participating nodes (same set as execution_order)
    pub participating_nodes: Vec<NodeId>,
}

impl CollaborationPlan {
    /// Capabilities assigned to one node, in deterministic order
    pub fn capabilities_for(&self, node_id: NodeId) -> Vec<Capability> {
        self.capability_to_node
            .iter()
            .filter(|(_, n)| **n == node_id)
            .map(|(c, _)| c.clone())
            .collect()
    }
}

/// Sub-request handed to one node during orchestration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubRequest {
    /// Collaboration this step belongs to
    pub collaboration_id: CollaborationId,
    /// Original caller context
    pub context: serde_json::Value,
    /// Results of prior steps, keyed by the node that produced them
    pub prior_results: HashMap<NodeId, serde_json::Value>,
    /// Capabilities this node is expected to cover
    pub capabilities: Vec<Capability>,
    /// Revenue share this node accrues on success
    pub revenue_share: f64,
}

/// Metadata describing how a request was routed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RoutingInfo {
    /// Whole request forwarded to one node
    SingleNode {
        node_id: NodeId,
        score: f64,
    },
    /// Request executed as a multi-node collaboration
    Collaboration {
        collaboration_id: CollaborationId,
        participants: Vec<NodeId>,
    },
}

/// Final result of a dispatched request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RouteOutcome {
    /// Request completed
    Success {
        data: serde_json::Value,
        routing_info: RoutingInfo,
    },
    /// Request failed; diagnostic carries the failure specifics
    Failure {
        reason: String,
        diagnostic: FailureDiagnostic,
    },
}

impl RouteOutcome {
    /// Whether the outcome is a success
    pub fn is_success(&self) -> bool {
        matches!(self, RouteOutcome::Success { .. })
    }
}

/// Structured diagnostic attached to a routing failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FailureDiagnostic {
    /// No node covers these capabilities
    UnmetCapabilities(BTreeSet<Capability>),
    /// A collaboration step failed; remaining steps were aborted
    Collaboration(CollaborationFailure),
    /// A single-node invocation failed
    NodeInvocation { node_id: NodeId, detail: String },
}

/// Failure surfaced when a collaboration step fails. No re-routing or retry
/// is attempted; partial results are returned for the caller to inspect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationFailure {
    /// Node whose step failed
    pub failed_node: NodeId,
    /// Why it failed (timeout, unreachable, node-reported error)
    pub reason: String,
    /// Collaboration the failure belongs to
    pub collaboration_id: CollaborationId,
    /// Results accumulated before the failure, keyed by node
    pub partial_results: HashMap<NodeId, serde_json::Value>,
}

/// Category of a settlement distribution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistributionCategory {
    /// Share paid to a participating node
    CapabilityShare,
    /// Flat fee retained by the network
    NetworkFee,
}

/// One line item of a settlement record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Distribution {
    /// Receiving node; `None` is the network itself
    pub node_id: Option<NodeId>,
    /// Amount in the billing component's currency unit
    pub amount: f64,
    /// What the amount is for
    pub category: DistributionCategory,
}

/// Immutable ledger entry recording how a collaboration's revenue was divided
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementRecord {
    /// Unique record ID
    pub record_id: Uuid,
    /// Collaboration that was settled
    pub collaboration_id: CollaborationId,
    /// Line items; sums to at most `total_revenue`
    pub distributions: Vec<Distribution>,
    /// Revenue supplied by the billing component
    pub total_revenue: f64,
    /// When the record was appended
    pub timestamp: DateTime<Utc>,
    /// Hash of the previous record, chaining the ledger
    pub prev_hash: String,
    /// Hash over this record's content and `prev_hash`
    pub record_hash: String,
}

/// Events broadcast to active nodes over the notification channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MeshEvent {
    /// A node joined the mesh
    NodeRegistered {
        node_id: NodeId,
        capabilities: BTreeSet<Capability>,
        timestamp: DateTime<Utc>,
    },
    /// A node was demoted for missing heartbeats
    NodeDemoted {
        node_id: NodeId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// Revenue was settled to a node
    RevenueSettled {
        node_id: NodeId,
        collaboration_id: CollaborationId,
        amount: f64,
        timestamp: DateTime<Utc>,
    },
}

/// Receipt returned to a freshly registered node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationReceipt {
    /// Assigned node ID
    pub node_id: NodeId,
    /// Opaque token the node presents on subsequent calls
    pub auth_token: String,
    /// Endpoints of currently active peers
    pub peer_list: Vec<(NodeId, String)>,
    /// Snapshot of the routing table at registration time
    pub routing_snapshot: HashMap<Capability, Vec<RouteCandidate>>,
}

/// Read-only network health, performance, and economic summary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkAnalytics {
    /// Registered nodes, active or not
    pub total_nodes: usize,
    /// Nodes currently active
    pub active_nodes: usize,
    /// Capabilities with at least one active declaring node
    pub covered_capabilities: usize,
    /// Total requests dispatched across all nodes
    pub total_requests: u64,
    /// Total successful requests across all nodes
    pub successful_requests: u64,
    /// Network-wide success rate
    pub success_rate: f64,
    /// Mean trust score over active nodes
    pub avg_trust_score: f64,
    /// Revenue settled through the ledger
    pub total_revenue_settled: f64,
    /// Number of settlement records appended
    pub settlements: usize,
    /// Collaborations flagged unsettled for operator reconciliation
    pub unsettled_collaborations: usize,
}
