//! Integration tests for the etcd JSON gateway client against a mock server.

use std::time::Duration;

use resilience_probe::cluster::{DEFAULT_GATEWAY_PREFIX, GatewayStore, StoreClient, StoreError};
use serde_json::json;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, ResponseTemplate};

mod support;
use support::socket_guard::{closed_endpoint, start_mock_server_or_skip};

macro_rules! require_mock_server {
    () => {{
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        mock_server
    }};
}

const TIMEOUT: Duration = Duration::from_secs(2);

// base64 of "test-key-1" and "test-value-1"
const KEY_B64: &str = "dGVzdC1rZXktMQ==";
const VALUE_B64: &str = "dGVzdC12YWx1ZS0x";

#[tokio::test]
async fn test_put_sends_base64_key_and_value() {
    let server = require_mock_server!();
    Mock::given(method("POST"))
        .and(path("/v3/kv/put"))
        .and(body_json(json!({ "key": KEY_B64, "value": VALUE_B64 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "header": {} })))
        .expect(1)
        .mount(&server)
        .await;

    let store = GatewayStore::new(&[server.uri()], DEFAULT_GATEWAY_PREFIX, None).unwrap();
    store.put("test-key-1", "test-value-1", TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn test_get_decodes_range_response() {
    let server = require_mock_server!();
    Mock::given(method("POST"))
        .and(path("/v3/kv/range"))
        .and(body_json(json!({ "key": KEY_B64 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "header": {},
            "kvs": [{ "key": KEY_B64, "value": VALUE_B64, "mod_revision": "4" }],
            "count": "1"
        })))
        .mount(&server)
        .await;

    let store = GatewayStore::new(&[server.uri()], DEFAULT_GATEWAY_PREFIX, None).unwrap();
    let entries = store.get("test-key-1", TIMEOUT).await.unwrap();

    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].key, "test-key-1");
    assert_eq!(entries[0].value, "test-value-1");
}

#[tokio::test]
async fn test_get_missing_key_is_empty() {
    let server = require_mock_server!();
    Mock::given(method("POST"))
        .and(path("/v3/kv/range"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "header": {} })))
        .mount(&server)
        .await;

    let store = GatewayStore::new(&[server.uri()], DEFAULT_GATEWAY_PREFIX, None).unwrap();
    assert!(store.get("/", TIMEOUT).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_uses_deleterange() {
    let server = require_mock_server!();
    Mock::given(method("POST"))
        .and(path("/v3/kv/deleterange"))
        .and(body_json(json!({ "key": KEY_B64 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "deleted": "1" })))
        .expect(1)
        .mount(&server)
        .await;

    let store = GatewayStore::new(&[server.uri()], DEFAULT_GATEWAY_PREFIX, None).unwrap();
    store.delete("test-key-1", TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn test_custom_prefix_is_used() {
    let server = require_mock_server!();
    Mock::given(method("POST"))
        .and(path("/v3beta/kv/range"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let store = GatewayStore::new(&[server.uri()], "v3beta", None).unwrap();
    store.get("/", TIMEOUT).await.unwrap();
}

// ==================== Failure Tests ====================

#[tokio::test]
async fn test_unreachable_endpoint_fails_over() {
    let server = require_mock_server!();
    Mock::given(method("POST"))
        .and(path("/v3/kv/range"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(2)
        .mount(&server)
        .await;

    let store = GatewayStore::new(
        &[closed_endpoint(), server.uri()],
        DEFAULT_GATEWAY_PREFIX,
        None,
    )
    .unwrap();

    // second call goes straight to the re-pinned endpoint
    store.get("/", TIMEOUT).await.unwrap();
    store.get("/", TIMEOUT).await.unwrap();
}

#[tokio::test]
async fn test_all_endpoints_unreachable_is_transport_error() {
    let store = GatewayStore::new(
        &[closed_endpoint(), closed_endpoint()],
        DEFAULT_GATEWAY_PREFIX,
        None,
    )
    .unwrap();

    let error = store.get("/", TIMEOUT).await.unwrap_err();
    assert!(
        matches!(error, StoreError::Transport { .. } | StoreError::Timeout { .. }),
        "unexpected error: {error:?}"
    );
}

#[tokio::test]
async fn test_server_error_is_status_without_failover() {
    let server = require_mock_server!();
    Mock::given(method("POST"))
        .and(path("/v3/kv/range"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let store = GatewayStore::new(&[server.uri()], DEFAULT_GATEWAY_PREFIX, None).unwrap();
    let error = store.get("/", TIMEOUT).await.unwrap_err();

    assert!(matches!(error, StoreError::Status { status: 503, .. }));
}

#[tokio::test]
async fn test_slow_endpoint_times_out() {
    let server = require_mock_server!();
    Mock::given(method("POST"))
        .and(path("/v3/kv/range"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({}))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let store = GatewayStore::new(&[server.uri()], DEFAULT_GATEWAY_PREFIX, None).unwrap();
    let error = store
        .get("test-key-1", Duration::from_millis(200))
        .await
        .unwrap_err();

    assert!(
        matches!(error, StoreError::Timeout { operation: "range", ref key, .. } if key == "test-key-1"),
        "unexpected error: {error:?}"
    );
}

#[tokio::test]
async fn test_undecodable_value_is_decode_error() {
    let server = require_mock_server!();
    Mock::given(method("POST"))
        .and(path("/v3/kv/range"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "kvs": [{ "key": KEY_B64, "value": "%%%" }]
        })))
        .mount(&server)
        .await;

    let store = GatewayStore::new(&[server.uri()], DEFAULT_GATEWAY_PREFIX, None).unwrap();
    let error = store.get("test-key-1", TIMEOUT).await.unwrap_err();

    assert!(matches!(error, StoreError::Decode { .. }));
}
