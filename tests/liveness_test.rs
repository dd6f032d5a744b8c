//! Integration tests for heartbeat-driven liveness

use capmesh::prelude::*;
use capmesh::settlement::FixedRevenue;
use capmesh::{HEARTBEAT_TIMEOUT_SECS, LIVENESS_TRUST_PENALTY, DEFAULT_TRUST_SCORE};
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;

fn descriptor(caps: &[&str]) -> NodeDescriptor {
    NodeDescriptor {
        capabilities: caps.iter().map(|c| c.to_string()).collect(),
        endpoint: "10.0.0.1:7000".to_string(),
        latency_estimate_ms: Some(100),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn mesh() -> (Arc<MockNodeExecutor>, MeshCoordinator) {
    init_tracing();
    let executor = Arc::new(MockNodeExecutor::new());
    let mesh = MeshCoordinator::new(
        MeshConfig::default(),
        executor.clone(),
        Arc::new(FixedRevenue(0.0)),
    );
    (executor, mesh)
}

#[tokio::test]
async fn silent_node_is_demoted_and_pruned_from_routing() {
    let (_, mesh) = mesh();
    let silent = mesh.register_node(descriptor(&["chat"])).await.unwrap();
    let alive = mesh.register_node(descriptor(&["chat"])).await.unwrap();

    // Age the silent node's heartbeat past the timeout; the live node keeps
    // heartbeating
    mesh.heartbeat(
        silent.node_id,
        Utc::now() - ChronoDuration::seconds(HEARTBEAT_TIMEOUT_SECS + 30),
    )
    .unwrap();
    mesh.heartbeat(alive.node_id, Utc::now()).unwrap();

    mesh.monitor().scan_once().await;

    let record = mesh.registry().get(silent.node_id).unwrap();
    assert_eq!(record.status, NodeStatus::Inactive);
    assert!(
        (record.trust_score - (DEFAULT_TRUST_SCORE - LIVENESS_TRUST_PENALTY)).abs() < 1e-9
    );

    // Absent from every routing entry after the rebuild the scan triggered
    let candidates = mesh.routing().candidates("chat").await;
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].node_id, alive.node_id);
}

#[tokio::test]
async fn demoted_node_no_longer_receives_requests() {
    let (executor, mesh) = mesh();
    let silent = mesh.register_node(descriptor(&["chat"])).await.unwrap();

    mesh.heartbeat(
        silent.node_id,
        Utc::now() - ChronoDuration::seconds(HEARTBEAT_TIMEOUT_SECS + 30),
    )
    .unwrap();
    mesh.monitor().scan_once().await;

    let outcome = mesh
        .route_request(&Request::new(["chat"], serde_json::json!({})))
        .await;
    assert!(!outcome.is_success());
    assert_eq!(executor.invocation_count(silent.node_id), 0);
}

#[tokio::test]
async fn heartbeat_keeps_a_node_routable() {
    let (_, mesh) = mesh();
    let node = mesh.register_node(descriptor(&["chat"])).await.unwrap();

    mesh.heartbeat(node.node_id, Utc::now()).unwrap();
    mesh.monitor().scan_once().await;

    assert_eq!(
        mesh.registry().get(node.node_id).unwrap().status,
        NodeStatus::Active
    );
    assert_eq!(mesh.routing().candidates("chat").await.len(), 1);
}

#[tokio::test]
async fn heartbeat_for_unknown_node_is_an_error() {
    let (_, mesh) = mesh();
    let result = mesh.heartbeat(uuid::Uuid::new_v4(), Utc::now());
    assert!(matches!(result, Err(MeshError::NodeNotFound(_))));
}
