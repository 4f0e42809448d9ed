//! Wire shapes of the HTTP API types.

#![allow(clippy::unwrap_used, clippy::panic)]

use serde_json::{Value, json};
use topostore::api::{ErrorResponse, HealthResponse, MessageResponse, ReadQuery};
use topostore_core::Envelope;

#[test]
fn health_reports_crate_version() {
    let health = HealthResponse::default();
    assert_eq!(health.status, "ok");
    assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
}

#[test]
fn message_response_omits_absent_reply() {
    let body = MessageResponse {
        kind: "NodeAdded".to_string(),
        reply: None,
    };
    assert_eq!(serde_json::to_value(&body).unwrap(), json!({"type": "NodeAdded"}));

    let body = MessageResponse {
        kind: "SyncRequest".to_string(),
        reply: Some(Envelope::new("SyncReply", json!({"Nodes": [], "Edges": []}))),
    };
    let value = serde_json::to_value(&body).unwrap();
    assert_eq!(value["reply"]["type"], json!("SyncReply"));
}

#[test]
fn error_response_carries_retry_hint() {
    let value = serde_json::to_value(ErrorResponse {
        error: "conflict".to_string(),
        retryable: true,
    })
    .unwrap();
    assert_eq!(value, json!({"error": "conflict", "retryable": true}));
}

#[test]
fn read_query_fields_are_optional() {
    let query: ReadQuery = serde_json::from_value(Value::Object(Default::default())).unwrap();
    assert!(query.at.is_none() && query.filter.is_none());
}
