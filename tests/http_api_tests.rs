//! Integration tests for the HTTP admin API.
//!
//! Requests go straight to the router, no port binding needed.
#![cfg(feature = "http")]

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use clustertopo::http::{ChangeResponse, create_router};
use clustertopo::config::CONFIGURATION_FILE;
use clustertopo::{
    ChangeExecutors, ClusterNode, MemberId, NodeConfig, StaticConfiguration, persistence,
};
use serde_json::{Value, json};
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

async fn started_node() -> Arc<ClusterNode> {
    let node = ClusterNode::open(
        NodeConfig::new("0")
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .bootstrap(StaticConfiguration::new(["0", "1", "2"], 3, 2)),
        ChangeExecutors::noop(),
    )
    .await
    .unwrap();
    node.start().await.unwrap();
    Arc::new(node)
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_topology_partitions_and_status() {
    let router = create_router(started_node().await);

    let (status, topology) = send(&router, "GET", "/api/v1/topology", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(topology["version"], 1);
    assert_eq!(topology["members"].as_object().unwrap().len(), 3);

    let (status, partitions) = send(&router, "GET", "/api/v1/partitions", None).await;
    assert_eq!(status, StatusCode::OK);
    let partitions = partitions["partitions"].as_array().unwrap();
    assert_eq!(partitions.len(), 3);
    assert_eq!(partitions[0]["partition_id"], 1);
    assert_eq!(partitions[0]["members"].as_array().unwrap().len(), 2);

    let (status, node) = send(&router, "GET", "/api/v1/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(node["member_id"], "0");
    assert_eq!(node["initialized"], true);
    assert_eq!(node["partition_count"], 3);
}

#[tokio::test]
async fn test_dry_run_does_not_commit() {
    let router = create_router(started_node().await);

    let body = json!({
        "operations": [{"PartitionJoin": {"member": "2", "partition": 1, "priority": 3}}],
        "dry_run": true
    });
    let (status, response) = send(&router, "POST", "/api/v1/operations", Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    let response: ChangeResponse = serde_json::from_value(response).unwrap();
    assert_eq!(response.change_id, None);
    assert!(!response.completed);
    assert_eq!(response.planned.len(), 1);
    assert!(response.configuration.partitions_of(&MemberId::from("2")).contains(&1));

    let (_, topology) = send(&router, "GET", "/api/v1/topology", None).await;
    assert_eq!(topology["version"], 1);
}

#[tokio::test]
async fn test_apply_operations_waits_for_completion() {
    let router = create_router(started_node().await);

    let body = json!({
        "operations": [{"PartitionJoin": {"member": "2", "partition": 1, "priority": 3}}]
    });
    let (status, response) = send(&router, "POST", "/api/v1/operations", Some(body)).await;
    assert_eq!(status, StatusCode::OK);
    let response: ChangeResponse = serde_json::from_value(response).unwrap();
    assert_eq!(response.change_id, Some(1));
    assert!(response.completed);
    assert!(!response.configuration.has_pending_changes());
    assert_eq!(
        response.configuration.priorities_of(1).get(&MemberId::from("2")),
        Some(&3)
    );

    let (_, partitions) = send(&router, "GET", "/api/v1/partitions", None).await;
    assert_eq!(partitions["partitions"][0]["primary"], "2");
}

#[tokio::test]
async fn test_invalid_operations_are_rejected() {
    let router = create_router(started_node().await);

    let body = json!({
        "operations": [{"PartitionJoin": {"member": "9", "partition": 1, "priority": 1}}]
    });
    let (status, error) = send(&router, "POST", "/api/v1/operations", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error"], "invalid_request");

    let (status, error) = send(&router, "POST", "/api/v1/changes/cancel", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error["error"], "no_change");
}

#[tokio::test]
async fn test_membership_and_scaling_changes() {
    let router = create_router(started_node().await);

    let (status, response) = send(
        &router,
        "POST",
        "/api/v1/members",
        Some(json!({"members": ["3"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", response);
    let response: ChangeResponse = serde_json::from_value(response).unwrap();
    assert!(response.completed);
    assert!(response.configuration.has_member(&MemberId::from("3")));
    assert!(!response.configuration.partitions_of(&MemberId::from("3")).is_empty());

    let (status, response) = send(&router, "DELETE", "/api/v1/members/1", None).await;
    assert_eq!(status, StatusCode::OK, "{}", response);
    let response: ChangeResponse = serde_json::from_value(response).unwrap();
    let members: BTreeSet<MemberId> = response.configuration.members.keys().cloned().collect();
    assert_eq!(
        members,
        BTreeSet::from([MemberId::from("0"), MemberId::from("2"), MemberId::from("3")])
    );

    let (status, response) = send(
        &router,
        "POST",
        "/api/v1/partitions/scale",
        Some(json!({"partition_count": 4})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", response);
    let response: ChangeResponse = serde_json::from_value(response).unwrap();
    assert_eq!(response.configuration.partition_config.partition_count, 4);
    assert_eq!(response.configuration.partition_ids().len(), 4);
}

#[tokio::test]
async fn test_changes_require_initialized_node() {
    let node = ClusterNode::open(
        NodeConfig::new("5").bind_addr("127.0.0.1:0".parse().unwrap()),
        ChangeExecutors::noop(),
    )
    .await
    .unwrap();
    let router = create_router(Arc::new(node));

    let body = json!({"operations": [{"MemberJoin": {"member": "6"}}]});
    let (status, error) = send(&router, "POST", "/api/v1/operations", Some(body)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(error["error"], "not_initialized");
}

#[tokio::test]
async fn test_replica_endpoints() {
    let router = create_router(started_node().await);

    let body = json!({"member": "2", "priority": 5});
    let (status, response) = send(&router, "POST", "/api/v1/partitions/1/replicas", Some(body)).await;
    assert_eq!(status, StatusCode::OK, "{}", response);
    let response: ChangeResponse = serde_json::from_value(response).unwrap();
    assert_eq!(response.configuration.priorities_of(1).get(&MemberId::from("2")), Some(&5));

    let body = json!({"priority": 1});
    let (status, response) = send(&router, "PUT", "/api/v1/partitions/1/replicas/2", Some(body)).await;
    assert_eq!(status, StatusCode::OK, "{}", response);
    let response: ChangeResponse = serde_json::from_value(response).unwrap();
    assert_eq!(response.configuration.priorities_of(1).get(&MemberId::from("2")), Some(&1));

    let (status, response) = send(&router, "DELETE", "/api/v1/partitions/1/replicas/2", None).await;
    assert_eq!(status, StatusCode::OK, "{}", response);
    let response: ChangeResponse = serde_json::from_value(response).unwrap();
    assert!(!response.configuration.partitions_of(&MemberId::from("2")).contains(&1));
}

#[tokio::test]
async fn test_reassign_and_exporter_endpoints() {
    let router = create_router(started_node().await);

    let body = json!({"members": ["0", "1"], "replication_factor": 3});
    let (status, error) = send(&router, "POST", "/api/v1/partitions/reassign", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error"], "invalid_request");

    let body = json!({"members": ["0", "1"]});
    let (status, response) = send(&router, "POST", "/api/v1/partitions/reassign", Some(body)).await;
    assert_eq!(status, StatusCode::OK, "{}", response);
    let response: ChangeResponse = serde_json::from_value(response).unwrap();
    assert!(!response.configuration.has_member(&MemberId::from("2")));
    assert_eq!(response.configuration.partition_ids().len(), 3);

    let (status, response) = send(&router, "POST", "/api/v1/exporters/elastic/enable", None).await;
    assert_eq!(status, StatusCode::OK, "{}", response);
    let response: ChangeResponse = serde_json::from_value(response).unwrap();
    let replica = &response.configuration.members[&MemberId::from("0")].partitions[&1];
    assert!(replica.exporters["elastic"].enabled);

    let (status, _) = send(&router, "POST", "/api/v1/exporters/elastic/disable", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, error) = send(&router, "POST", "/api/v1/exporters/elastic/disable", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error"], "invalid_request");
}

#[tokio::test]
async fn test_changes_on_non_coordinator_are_redirected() {
    let dir = TempDir::new().unwrap();
    let config = StaticConfiguration::new(["0", "1", "2"], 3, 2).generate().unwrap();
    persistence::save(&config, &dir.path().join(CONFIGURATION_FILE))
        .await
        .unwrap();

    let node = ClusterNode::open(
        NodeConfig::new("1")
            .bind_addr("127.0.0.1:0".parse().unwrap())
            .data_dir(dir.path()),
        ChangeExecutors::noop(),
    )
    .await
    .unwrap();
    node.start().await.unwrap();
    let router = create_router(Arc::new(node));

    let body = json!({"operations": [{"PartitionJoin": {"member": "2", "partition": 1, "priority": 3}}]});
    let (status, error) = send(&router, "POST", "/api/v1/operations", Some(body)).await;
    assert_eq!(status, StatusCode::MISDIRECTED_REQUEST);
    assert_eq!(error["error"], "not_coordinator");
    assert!(error["message"].as_str().unwrap().contains("coordinator: 0"));

    let (_, topology) = send(&router, "GET", "/api/v1/topology", None).await;
    assert_eq!(topology["version"], 1);
}
