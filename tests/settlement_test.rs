//! Integration tests for revenue settlement through the full routing path

use capmesh::prelude::*;
use capmesh::settlement::FixedRevenue;
use capmesh::types::DistributionCategory;
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

fn mesh_with(revenue: f64) -> (Arc<MockNodeExecutor>, MeshCoordinator) {
    init_tracing();
    let executor = Arc::new(MockNodeExecutor::new());
    let mesh = MeshCoordinator::new(
        MeshConfig::default(),
        executor.clone(),
        Arc::new(FixedRevenue(revenue)),
    );
    (executor, mesh)
}

#[tokio::test]
async fn completed_collaboration_settles_shares_and_network_fee() {
    // Scenario D: shares {N1: 0.15, N2: 0.15}, fee 0.05, revenue 100 →
    // distributions [15, 15, 5], ledger total 35 ≤ 100
    let (_, mesh) = mesh_with(100.0);
    let n1 = mesh.register_node(descriptor(&["transcribe"])).await.unwrap();
    let n2 = mesh.register_node(descriptor(&["summarize"])).await.unwrap();

    let request = Request::new(["transcribe", "summarize"], serde_json::json!({}));
    let outcome = mesh.route_request(&request).await;
    assert!(outcome.is_success());

    let records = mesh.ledger().records().await.unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.total_revenue, 100.0);

    let mut node_amounts: Vec<(NodeId, f64)> = record
        .distributions
        .iter()
        .filter(|d| d.category == DistributionCategory::CapabilityShare)
        .map(|d| (d.node_id.unwrap(), d.amount))
        .collect();
    node_amounts.sort_by_key(|(id, _)| *id);
    assert_eq!(node_amounts.len(), 2);
    assert!(node_amounts.iter().all(|(_, amount)| *amount == 15.0));

    let fee: f64 = record
        .distributions
        .iter()
        .filter(|d| d.category == DistributionCategory::NetworkFee)
        .map(|d| d.amount)
        .sum();
    assert_eq!(fee, 5.0);

    let total: f64 = record.distributions.iter().map(|d| d.amount).sum();
    assert!(total <= record.total_revenue);

    // Node balances reflect the distributions
    assert_eq!(mesh.registry().get(n1.node_id).unwrap().revenue_generated, 15.0);
    assert_eq!(mesh.registry().get(n2.node_id).unwrap().revenue_generated, 15.0);
}

#[tokio::test]
async fn failed_collaboration_settles_nothing() {
    let (executor, mesh) = mesh_with(100.0);
    let n1 = mesh.register_node(descriptor(&["transcribe"])).await.unwrap();
    mesh.register_node(descriptor(&["summarize"])).await.unwrap();
    executor.fail_unreachable(n1.node_id, "connection refused");

    let request = Request::new(["transcribe", "summarize"], serde_json::json!({}));
    assert!(!mesh.route_request(&request).await.is_success());

    assert!(mesh.ledger().records().await.unwrap().is_empty());
    assert_eq!(mesh.registry().get(n1.node_id).unwrap().revenue_generated, 0.0);
}

#[tokio::test]
async fn settlements_accumulate_in_analytics() {
    let (_, mesh) = mesh_with(50.0);
    mesh.register_node(descriptor(&["transcribe"])).await.unwrap();
    mesh.register_node(descriptor(&["summarize"])).await.unwrap();

    let request = Request::new(["transcribe", "summarize"], serde_json::json!({}));
    assert!(mesh.route_request(&request).await.is_success());
    assert!(mesh.route_request(&request).await.is_success());

    let analytics = mesh.analytics().await;
    assert_eq!(analytics.settlements, 2);
    assert_eq!(analytics.total_revenue_settled, 100.0);
    assert_eq!(analytics.unsettled_collaborations, 0);
    assert!(mesh.ledger().verify_chain().await.unwrap());
}
