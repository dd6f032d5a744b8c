//! Error types for mesh routing and settlement

use crate::types::{Capability, CollaborationId, NodeId};
use std::collections::BTreeSet;
use thiserror::Error;

/// Result type for mesh operations
pub type MeshResult<T> = std::result::Result<T, MeshError>;

/// Errors that can occur during routing, orchestration, or settlement
#[derive(Debug, Error)]
pub enum MeshError {
    /// Registration descriptor rejected synchronously; never retried
    #[error("Invalid node descriptor: {0}")]
    InvalidDescriptor(String),

    /// Node not found in the registry
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    /// No node covers the required capabilities
    #[error("No route available; unmet capabilities: {unmet:?}")]
    NoRouteAvailable { unmet: BTreeSet<Capability> },

    /// Node did not answer within the invocation timeout
    #[error("Node {node} timed out after {timeout_secs}s")]
    NodeTimeout { node: NodeId, timeout_secs: u64 },

    /// Node could not be reached or returned a transport-level error
    #[error("Node {node} unreachable: {detail}")]
    NodeUnreachable { node: NodeId, detail: String },

    /// Ledger append could not be made durable
    #[error("Ledger write failed for collaboration {collaboration_id}: {detail}")]
    LedgerWriteFailure {
        collaboration_id: CollaborationId,
        detail: String,
    },

    /// Ledger storage error outside the append path
    #[error("Ledger storage error: {0}")]
    StorageError(String),

    /// Other errors
    #[error("Mesh error: {0}")]
    Other(#[from] anyhow::Error),
}
