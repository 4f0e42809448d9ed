//! Integration tests for the topostore HTTP API.
//!
//! Uses axum-test to exercise the router without binding a socket.

// Tests that touch TOPOSTORE_API_KEY hold a mutex across awaits on purpose.
#![allow(clippy::unwrap_used, clippy::panic, clippy::await_holding_lock)]

use axum::http::{HeaderValue, StatusCode};
use axum_test::TestServer;
use serde_json::{Value, json};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;
use topostore::Topology;
use topostore::api::{
    AppState, ErrorResponse, HealthResponse, MessageResponse, ModeResponse, StatusResponse,
    create_router,
};
use topostore_core::{
    CacheMode, GraphConfig, Identifier, Message, Metadata, Node, RevisionRecord, Timestamp,
};

/// Serializes tests since some of them modify env vars.
static AUTH_TEST_MUTEX: Mutex<()> = Mutex::new(());

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Holds the mutex, the temp dir and the topology for one test.
struct TestGuard {
    _guard: std::sync::MutexGuard<'static, ()>,
    _dir: TempDir,
    topology: Topology,
}

impl Drop for TestGuard {
    fn drop(&mut self) {
        // SAFETY: Tests run sequentially under AUTH_TEST_MUTEX, so no concurrent env access.
        unsafe { std::env::remove_var("TOPOSTORE_API_KEY") };
    }
}

fn open_topology(dir: &TempDir) -> Topology {
    Topology::open_at(
        &dir.path().join("api.redb"),
        GraphConfig::new("analyzer", "host1"),
        vec!["MAC".to_string()],
        CacheMode::Default,
    )
    .unwrap()
}

fn server_for(topology: &Topology) -> TestServer {
    let state = AppState {
        topology: topology.clone(),
        request_timeout: Duration::from_secs(5),
        rate_limit: 0,
        cors_origins: vec!["https://ops.example".to_string()],
    };
    TestServer::new(create_router(state)).unwrap()
}

fn create_test_server() -> (TestServer, TestGuard) {
    let guard = AUTH_TEST_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    // SAFETY: Tests run sequentially under AUTH_TEST_MUTEX, so no concurrent env access.
    unsafe { std::env::remove_var("TOPOSTORE_API_KEY") };
    let dir = tempfile::tempdir().unwrap();
    let topology = open_topology(&dir);
    (
        server_for(&topology),
        TestGuard {
            _guard: guard,
            _dir: dir,
            topology,
        },
    )
}

/// Interface "eth0" revised at 1s, 2s and 3s, owned by host "host1".
fn create_populated_test_server() -> (TestServer, TestGuard) {
    let (server, guard) = create_test_server();
    let graph = &guard.topology.graph;
    let host = graph.create_node(
        Identifier::new("host1"),
        [("Type", json!("host"))].into_iter().collect(),
        Timestamp::from_secs(1),
    );
    graph.add_node(host).unwrap();
    let eth0 = graph.create_node(
        Identifier::new("eth0"),
        [("Type", json!("device")), ("MTU", json!(1500))]
            .into_iter()
            .collect(),
        Timestamp::from_secs(1),
    );
    graph.add_node(eth0).unwrap();
    let owns = graph.create_edge(
        Identifier::new("owns-eth0"),
        Identifier::new("host1"),
        Identifier::new("eth0"),
        Metadata::new(),
        Timestamp::from_secs(1),
    );
    graph.add_edge(owns).unwrap();
    graph
        .add_metadata(&Identifier::new("eth0"), "MTU", 1510, Timestamp::from_secs(2))
        .unwrap();
    graph
        .add_metadata(&Identifier::new("eth0"), "MTU", 1520, Timestamp::from_secs(3))
        .unwrap();
    (server, guard)
}

// =============================================================================
// HEALTH & STATUS
// =============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let (server, _guard) = create_test_server();
    let response = server.get("/health").await;
    response.assert_status_ok();
    let body: HealthResponse = response.json();
    assert_eq!(body.status, "ok");
}

#[tokio::test]
async fn test_status_counts_live_entities() {
    let (server, _guard) = create_populated_test_server();
    let body: StatusResponse = server.get("/status").await.json();
    assert_eq!((body.nodes, body.edges), (2, 1));
    assert_eq!((body.cached_nodes, body.cached_edges), (2, 1));
    assert_eq!(body.mode, "default");
    assert_eq!(body.origin, "analyzer.host1");
}

// =============================================================================
// CACHE MODE
// =============================================================================

#[tokio::test]
async fn test_mode_switch() {
    let (server, guard) = create_test_server();
    let response = server
        .put("/mode")
        .json(&json!({"mode": "persistent-only"}))
        .await;
    response.assert_status_ok();
    let body: ModeResponse = response.json();
    assert_eq!(body.mode, "persistent_only");
    assert_eq!(guard.topology.backend.mode(), CacheMode::PersistentOnly);

    let body: ModeResponse = server.get("/mode").await.json();
    assert_eq!(body.mode, "persistent_only");
}

#[tokio::test]
async fn test_invalid_mode_is_rejected() {
    let (server, guard) = create_test_server();
    let response = server.put("/mode").json(&json!({"mode": "sometimes"})).await;
    response.assert_status(StatusCode::BAD_REQUEST);
    assert_eq!(guard.topology.backend.mode(), CacheMode::Default);
}

// =============================================================================
// READS
// =============================================================================

#[tokio::test]
async fn test_live_node_read() {
    let (server, _guard) = create_populated_test_server();
    let node: Node = server.get("/nodes/eth0").await.json();
    assert_eq!(node.element.revision, 3);
    assert_eq!(node.element.metadata.get("MTU"), Some(&json!(1520)));
}

#[tokio::test]
async fn test_point_in_time_node_read() {
    let (server, _guard) = create_populated_test_server();
    let node: Node = server
        .get("/nodes/eth0")
        .add_query_param("at", 2500)
        .await
        .json();
    assert_eq!(node.element.revision, 2);
    assert_eq!(node.element.metadata.get("MTU"), Some(&json!(1510)));

    server
        .get("/nodes/eth0")
        .add_query_param("at", 500)
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_filtered_node_listing() {
    let (server, _guard) = create_populated_test_server();
    let nodes: Vec<Node> = server
        .get("/nodes")
        .add_query_param("filter", r#"{"Type":"host"}"#)
        .await
        .json();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].element.id, Identifier::new("host1"));

    server
        .get("/nodes")
        .add_query_param("filter", "g.V().has('Type')")
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_node_edges_and_missing_node() {
    let (server, _guard) = create_populated_test_server();
    let edges: Vec<Value> = server.get("/nodes/host1/edges").await.json();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0]["Child"], json!("eth0"));

    let response = server.get("/nodes/nope/edges").await;
    response.assert_status(StatusCode::NOT_FOUND);
    let body: ErrorResponse = response.json();
    assert!(!body.retryable);
}

#[tokio::test]
async fn test_node_history_lists_every_revision() {
    let (server, _guard) = create_populated_test_server();
    let rows: Vec<RevisionRecord<Node>> = server.get("/nodes/eth0/history").await.json();
    let revisions: Vec<u64> = rows.iter().map(|r| r.entity.element.revision).collect();
    assert_eq!(revisions, vec![1, 2, 3]);
    assert_eq!(rows[0].archived_at, Some(Timestamp(2000)));
    assert!(rows[2].is_live());

    server
        .get("/edges/owns-eth0/history")
        .await
        .assert_status_ok();
    server
        .get("/edges/nope/history")
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_edge_reads() {
    let (server, _guard) = create_populated_test_server();
    let edges: Vec<Value> = server.get("/edges").await.json();
    assert_eq!(edges.len(), 1);
    let edge: Value = server.get("/edges/owns-eth0").await.json();
    assert_eq!(edge["Parent"], json!("host1"));
}

// =============================================================================
// REPLICATION
// =============================================================================

#[tokio::test]
async fn test_message_applies_remote_node() {
    let (server, guard) = create_test_server();
    let remote = guard.topology.graph.create_node(
        Identifier::new("remote"),
        Metadata::new(),
        Timestamp::from_secs(7),
    );
    let envelope = Message::NodeAdded(remote).encode().unwrap();

    let response = server.post("/messages").json(&envelope).await;
    response.assert_status_ok();
    let body: MessageResponse = response.json();
    assert_eq!(body.kind, "NodeAdded");
    assert!(body.reply.is_none());

    let (nodes, _) = guard.topology.history.live_counts().unwrap();
    assert_eq!(nodes, 1);
}

#[tokio::test]
async fn test_sync_request_is_answered() {
    let (server, _guard) = create_populated_test_server();
    let response = server
        .post("/messages")
        .json(&json!({"type": "SyncRequest", "payload": {"GremlinFilter": ""}}))
        .await;
    response.assert_status_ok();
    let body: MessageResponse = response.json();
    let reply = Message::decode(body.reply.unwrap()).unwrap();
    let Message::SyncReply(snapshot) = reply else {
        panic!("expected a SyncReply");
    };
    assert_eq!((snapshot.nodes.len(), snapshot.edges.len()), (2, 1));
}

#[tokio::test]
async fn test_unknown_message_type_is_accepted() {
    let (server, _guard) = create_test_server();
    let response = server
        .post("/messages")
        .json(&json!({"type": "Ping", "payload": {"any": 1}}))
        .await;
    response.assert_status_ok();
    let body: MessageResponse = response.json();
    assert_eq!(body.kind, "Ping");
}

#[tokio::test]
async fn test_malformed_messages_are_rejected() {
    let (server, _guard) = create_test_server();
    server
        .post("/messages")
        .text("not json")
        .await
        .assert_status(StatusCode::BAD_REQUEST);
    server
        .post("/messages")
        .json(&json!({"type": "Sync", "payload": {"Nodes": []}}))
        .await
        .assert_status(StatusCode::BAD_REQUEST);
}

// =============================================================================
// AUTHENTICATION
// =============================================================================

fn create_auth_test_server(key: &str) -> (TestServer, TestGuard) {
    let guard = AUTH_TEST_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    // SAFETY: Tests run sequentially under AUTH_TEST_MUTEX, so no concurrent env access.
    unsafe { std::env::set_var("TOPOSTORE_API_KEY", key) };
    let dir = tempfile::tempdir().unwrap();
    let topology = open_topology(&dir);
    (
        server_for(&topology),
        TestGuard {
            _guard: guard,
            _dir: dir,
            topology,
        },
    )
}

#[tokio::test]
async fn test_auth_health_is_exempt() {
    let (server, _guard) = create_auth_test_server("s3cret");
    server.get("/health").await.assert_status_ok();
}

#[tokio::test]
async fn test_auth_rejects_missing_and_wrong_keys() {
    let (server, _guard) = create_auth_test_server("s3cret");
    server
        .get("/status")
        .await
        .assert_status(StatusCode::UNAUTHORIZED);
    server
        .get("/status")
        .add_header(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer wrong"),
        )
        .await
        .assert_status(StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_auth_accepts_bearer_and_raw_keys() {
    let (server, _guard) = create_auth_test_server("s3cret");
    server
        .get("/status")
        .add_header(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer s3cret"),
        )
        .await
        .assert_status_ok();
    server
        .get("/mode")
        .add_header(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("s3cret"),
        )
        .await
        .assert_status_ok();
}

// =============================================================================
// RATE LIMITING
// =============================================================================

#[tokio::test]
async fn test_rate_limit_returns_429() {
    let (_, guard) = create_test_server();
    let state = AppState {
        topology: guard.topology.clone(),
        request_timeout: Duration::from_secs(5),
        rate_limit: 1,
        cors_origins: Vec::new(),
    };
    let server = TestServer::new(create_router(state)).unwrap();
    server.get("/health").await.assert_status_ok();
    server
        .get("/health")
        .await
        .assert_status(StatusCode::TOO_MANY_REQUESTS);
}

// =============================================================================
// CORS
// =============================================================================

#[tokio::test]
async fn test_cors_admits_only_configured_origins() {
    let (server, _guard) = create_test_server();
    let allow = axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN;

    let response = server
        .get("/health")
        .add_header(
            axum::http::header::ORIGIN,
            HeaderValue::from_static("https://ops.example"),
        )
        .await;
    response.assert_status_ok();
    assert_eq!(
        response.headers().get(&allow),
        Some(&HeaderValue::from_static("https://ops.example"))
    );

    let response = server
        .get("/health")
        .add_header(
            axum::http::header::ORIGIN,
            HeaderValue::from_static("https://elsewhere.example"),
        )
        .await;
    assert!(response.headers().get(&allow).is_none());
}

#[tokio::test]
async fn test_cors_wildcard_admits_any_origin() {
    let (_, guard) = create_test_server();
    let state = AppState {
        topology: guard.topology.clone(),
        request_timeout: Duration::from_secs(5),
        rate_limit: 0,
        cors_origins: vec!["*".to_string()],
    };
    let server = TestServer::new(create_router(state)).unwrap();
    let response = server
        .get("/health")
        .add_header(
            axum::http::header::ORIGIN,
            HeaderValue::from_static("https://anywhere.example"),
        )
        .await;
    assert_eq!(
        response
            .headers()
            .get(axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN),
        Some(&HeaderValue::from_static("*"))
    );
}
