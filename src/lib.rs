//! # Capmesh
//!
//! Capability-based multi-node request router and collaboration orchestrator.
//! The mesh maintains a registry of independently operated nodes, each
//! declaring a set of capabilities, and
//!
//! - routes an incoming request to the single best node able to satisfy it,
//! - builds and executes a multi-node collaboration plan when no single node
//!   suffices, and
//! - settles usage-based revenue among participating nodes through an
//!   append-only ledger.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              MeshCoordinator                 │
//! ├──────────────┬───────────────┬───────────────┤
//! │  Dispatcher  │    Planner    │  Orchestrator │
//! ├──────────────┴───────┬───────┴───────────────┤
//! │  Registry / Scoring / Routing Table          │
//! ├──────────────────────┼───────────────────────┤
//! │  Settlement Ledger   │  Liveness Monitor     │
//! └──────────────────────┴───────────────────────┘
//! ```
//!
//! The transport used to reach a node is not prescribed: invocations go
//! through the [`executor::NodeExecutor`] trait, notifications through
//! [`notify::NotificationChannel`], and pricing through
//! [`settlement::BillingProvider`], all substitutable in tests.
//!
//! ## Known limitations
//!
//! Delivery toward nodes is at-least-once, never exactly-once: a collaboration
//! that fails mid-plan is aborted without re-routing or retry, and side
//! effects already performed by earlier steps are not reconciled. Node-reported
//! outcomes are taken at face value; there is no cryptographic verification.

pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod monitor;
pub mod notify;
pub mod orchestrator;
pub mod planner;
pub mod registry;
pub mod routing;
pub mod scoring;
pub mod settlement;
pub mod types;

pub use coordinator::{MeshConfig, MeshCoordinator};
pub use dispatcher::RequestDispatcher;
pub use error::{MeshError, MeshResult};
pub use executor::{MockNodeExecutor, NodeExecutor};
pub use monitor::{LivenessConfig, LivenessMonitor};
pub use notify::{ChannelNotifier, NotificationChannel, NullNotifier};
pub use orchestrator::{CollaborationOrchestrator, KeyedMerge, MergeStrategy};
pub use planner::{CollaborationPlanner, InsertionOrder, OrderingStrategy, TopologicalOrder};
pub use registry::NodeRegistry;
pub use routing::RoutingTable;
pub use settlement::{
    BillingProvider, FileLedgerStore, FixedRevenue, InMemoryLedgerStore, LedgerStore,
    SettlementLedger,
};
pub use types::*;

/// Trust score assigned to a freshly registered node
pub const DEFAULT_TRUST_SCORE: f64 = 0.85;

/// Lower bound of the trust range; no outcome or penalty goes below this
pub const TRUST_FLOOR: f64 = 0.1;

/// Upper bound of the trust range
pub const TRUST_CEILING: f64 = 1.0;

/// Trust gained per successful invocation
pub const TRUST_SUCCESS_DELTA: f64 = 0.001;

/// Trust lost per failed invocation; an order of magnitude larger than the
/// success delta
pub const TRUST_FAILURE_DELTA: f64 = 0.01;

/// Trust penalty applied when a node misses its heartbeat window
pub const LIVENESS_TRUST_PENALTY: f64 = 0.05;

/// Revenue share a node accrues per capability it covers in a collaboration
pub const PER_CAPABILITY_SHARE: f64 = 0.15;

/// Flat share of collaboration revenue retained by the network
pub const NETWORK_FEE_RATE: f64 = 0.05;

/// Seconds without a heartbeat before a node is demoted
pub const HEARTBEAT_TIMEOUT_SECS: i64 = 120;

/// Bounded timeout for a single node invocation
pub const INVOKE_TIMEOUT_SECS: u64 = 30;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        coordinator::{MeshConfig, MeshCoordinator},
        error::{MeshError, MeshResult},
        executor::{MockNodeExecutor, NodeExecutor},
        monitor::{LivenessConfig, LivenessMonitor},
        notify::{NotificationChannel, NullNotifier},
        registry::NodeRegistry,
        routing::RoutingTable,
        settlement::{BillingProvider, FixedRevenue, InMemoryLedgerStore, SettlementLedger},
        types::*,
    };
}
