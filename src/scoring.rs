//! Composite per-capability scoring
//!
//! Two functions rank nodes. [`score`] is the dispatcher-facing composite used
//! to pick the single best node for a request; [`rank_key`] is the cheaper key
//! the routing table sorts candidates by at rebuild time. Both are monotone:
//! more trust, a higher success rate, or declared specialization never lowers
//! a score, and more load never raises it.

use crate::types::{NodeRecord, RouteCandidate};

/// Points contributed by declaring the scored capability
const SPECIALIZATION_BONUS: f64 = 30.0;

/// Load beyond this contributes nothing further
const LOAD_HEADROOM: f64 = 20.0;

/// Composite score of a node for one capability.
///
/// `trust×100 + success_rate×50 + 30·[declared] + max(0, 20 − load)`
pub fn score(node: &NodeRecord, capability: &str) -> f64 {
    let trust_component = node.trust_score * 100.0;
    let success_component = node.success_rate() * 50.0;
    let specialization = if node.capabilities.contains(capability) {
        SPECIALIZATION_BONUS
    } else {
        0.0
    };
    let load_component = (LOAD_HEADROOM - node.current_load as f64).max(0.0);

    trust_component + success_component + specialization + load_component
}

/// Mean composite score of a node over a set of capabilities
pub fn average_score<'a, I>(node: &NodeRecord, capabilities: I) -> f64
where
    I: IntoIterator<Item = &'a String>,
{
    let mut total = 0.0;
    let mut count = 0usize;
    for capability in capabilities {
        total += score(node, capability);
        count += 1;
    }
    if count == 0 {
        0.0
    } else {
        total / count as f64
    }
}

/// Ranking key the routing table sorts by, descending:
/// `0.5×trust − 0.3×load − 0.0001×latency`
pub fn rank_key(candidate: &RouteCandidate) -> f64 {
    0.5 * candidate.trust_score
        - 0.3 * candidate.load as f64
        - 0.0001 * candidate.latency_estimate_ms as f64
}
