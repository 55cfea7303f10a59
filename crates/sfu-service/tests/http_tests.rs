//! HTTP surface tests.
//!
//! Drives the Axum router built by the harness with `tower::ServiceExt::oneshot`.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use sfu_test_utils::{
    default_rtp_capabilities, dtls_parameters, rtp_parameters, FaultyEngine, TestHarness,
};
use std::time::Duration;
use tower::ServiceExt;

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let body = body.map_or_else(Body::empty, |json| Body::from(json.to_string()));
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .expect("Failed to build request");
    let response = app
        .clone()
        .oneshot(request)
        .await
        .expect("Failed to execute request");
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
    (status, value)
}

#[tokio::test]
async fn test_two_clients_exchange_media_over_http() {
    let harness = TestHarness::start(1).await;
    let app = harness.app();

    let (status, caps) = send(&app, "GET", "/rooms/demo/router-rtp-capabilities", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(caps["codecs"].as_array().is_some_and(|c| !c.is_empty()));

    // Alice sends.
    let (_, transport) = send(&app, "POST", "/rooms/demo/clients/alice/transports", None).await;
    let send_id = transport["id"].as_str().unwrap().to_string();
    let (status, _) = send(
        &app,
        "POST",
        &format!("/rooms/demo/clients/alice/transports/{send_id}/connect"),
        Some(json!({ "dtlsParameters": dtls_parameters() })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, produced) = send(
        &app,
        "POST",
        &format!("/rooms/demo/clients/alice/transports/{send_id}/produce"),
        Some(json!({ "kind": "audio", "rtpParameters": rtp_parameters("audio/opus") })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let producer_id = produced["id"].as_str().unwrap().to_string();

    // Bob discovers and receives.
    let (_, listed) = send(&app, "GET", "/rooms/demo/clients/alice/producers", None).await;
    assert_eq!(listed.as_array().map(Vec::len), Some(1));

    let (_, transport) = send(&app, "POST", "/rooms/demo/clients/bob/transports", None).await;
    let recv_id = transport["id"].as_str().unwrap().to_string();
    send(
        &app,
        "POST",
        &format!("/rooms/demo/clients/bob/transports/{recv_id}/connect"),
        Some(json!({ "dtlsParameters": dtls_parameters() })),
    )
    .await;
    let (status, consumer) = send(
        &app,
        "POST",
        &format!("/rooms/demo/clients/bob/transports/{recv_id}/consume"),
        Some(json!({
            "producerId": producer_id,
            "rtpCapabilities": default_rtp_capabilities(),
            "appData": { "slot": 1 }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(consumer["kind"], "audio");
    assert_eq!(consumer["paused"], false);
    assert_eq!(consumer["appData"]["slot"], 1);

    // Both leave, the room goes away.
    for client in ["bob", "alice"] {
        let (status, body) = send(
            &app,
            "POST",
            &format!("/rooms/demo/clients/{client}/disconnected"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::String("OK".to_string()));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.controller.get_status().await.unwrap().room_count, 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_error_responses_use_service_shape() {
    let harness = TestHarness::start(1).await;
    let app = harness.app();

    let (status, body) = send(
        &app,
        "POST",
        &format!(
            "/rooms/none/clients/alice/transports/{}/connect",
            common::types::TransportId::new()
        ),
        Some(json!({ "dtlsParameters": dtls_parameters() })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "ROOM_NOT_FOUND");
    assert!(body["error"].as_str().is_some_and(|m| !m.is_empty()));

    let (status, body) = send(
        &app,
        "POST",
        "/rooms/none/clients/alice/transports/abc/connect",
        Some(json!({ "nope": true })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");

    harness.shutdown().await;
}

#[tokio::test]
async fn test_operational_endpoints() {
    let harness = TestHarness::start(1).await;
    let app = harness.app();

    let (status, _) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);

    // Readiness is flipped by the binary once workers are up.
    let (status, _) = send(&app, "GET", "/ready", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, _) = send(&app, "GET", "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_succeeds_while_router_creation_is_slow() {
    let engine = FaultyEngine::builder()
        .delay_router_creation(Duration::from_secs(45))
        .build();
    let harness = TestHarness::with_engine(engine, 1).await;
    let app = harness.app();

    let ((caps_status, _), (disconnect_status, body)) = tokio::join!(
        send(&app, "GET", "/rooms/slow/router-rtp-capabilities", None),
        send(&app, "POST", "/rooms/slow/clients/a/disconnected", None),
    );

    assert_eq!(disconnect_status, StatusCode::OK);
    assert_eq!(body, Value::String("OK".to_string()));
    assert_eq!(caps_status, StatusCode::OK);

    harness.shutdown().await;
}
