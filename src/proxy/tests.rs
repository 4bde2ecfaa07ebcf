use std::path::PathBuf;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::routing::{any, get, post};
use axum::Router;
use chrono::TimeZone;
use serde_json::json;
use tower::util::ServiceExt;

use super::*;
use crate::monitor::TailStatus;

const COMBINED_HEADER: &str = crate::config::COMBINED_DATA_HEADER;

// =============================================================================
// Fake upstream
// =============================================================================

fn completion_body() -> Value {
    json!({
        "id": "chatcmpl-42",
        "model": "test-model",
        "created": 1_700_000_000,
        "choices": [{
            "message": {"role": "assistant", "content": "{\"a\":1}"},
            "logprobs": {"content": [
                {"id": 90, "token": "{\"", "logprob": -0.1, "top_logprobs": []},
                {"id": 91, "token": "a", "logprob": -0.2, "top_logprobs": []},
                {"id": 92, "token": "\":1}", "logprob": -0.3, "top_logprobs": []}
            ]}
        }]
    })
}

fn rejection_log_text() -> String {
    json!({
        "log_version": "1.0",
        "timestamp": "2025-01-01T00:00:00",
        "events": [
            {"step": 1, "task_id": 7, "slot_id": 0, "rejected": {"token": 5}, "resampled": {"token": 91}}
        ]
    })
    .to_string()
}

/// Serve a fake inference server; chat completions append to `log_path` before answering
async fn spawn_upstream(log_path: PathBuf) -> String {
    let app = Router::new()
        .route(
            "/v1/chat/completions",
            post(move || {
                let log_path = log_path.clone();
                async move {
                    std::fs::write(&log_path, rejection_log_text()).expect("write rejection log");
                    Json(completion_body())
                }
            }),
        )
        .route(
            "/echo",
            any(|request: Request<Body>| async move {
                let (parts, body) = request.into_parts();
                let body = axum::body::to_bytes(body, usize::MAX).await.expect("body");
                Json(json!({
                    "method": parts.method.as_str(),
                    "query": parts.uri.query(),
                    "host": parts.headers.get(header::HOST).and_then(|v| v.to_str().ok()),
                    "x_custom": parts.headers.get("x-custom").and_then(|v| v.to_str().ok()),
                    "body": String::from_utf8_lossy(&body),
                }))
            }),
        )
        .route(
            "/redirect",
            get(|| async { (StatusCode::FOUND, [(header::LOCATION, "/elsewhere")]) }),
        )
        .route(
            "/teapot",
            get(|| async { (StatusCode::IM_A_TEAPOT, [("x-upstream", "yes")], "short and stout") }),
        )
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(3)).await;
                "late"
            }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

struct Harness {
    _dir: tempfile::TempDir,
    output_dir: PathBuf,
    config: ProxyConfig,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let output_dir = dir.path().join("traces");
    std::fs::create_dir_all(&output_dir).expect("output dir");
    let rejection_log = output_dir.join("rejection_log.json");
    let upstream_url = spawn_upstream(rejection_log.clone()).await;

    let config = ProxyConfig {
        upstream_url,
        output_dir: output_dir.clone(),
        rejection_log,
        poll_interval: Duration::from_millis(10),
        monitor_timeout: Duration::from_millis(500),
        upstream_timeout: Duration::from_secs(5),
        ..ProxyConfig::default()
    };
    Harness {
        _dir: dir,
        output_dir,
        config,
    }
}

fn chat_request(body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(CORRELATED_ENDPOINT)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

async fn body_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn artifacts(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .expect("read dir")
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("combined_"))
        })
        .collect()
}

// =============================================================================
// Pure helpers
// =============================================================================

#[test]
fn test_requests_token_telemetry() {
    let yes = br#"{"messages": [], "logprobs": true, "top_logprobs": 5}"#;
    assert!(requests_token_telemetry(&Method::POST, CORRELATED_ENDPOINT, yes));
    assert!(!requests_token_telemetry(&Method::GET, CORRELATED_ENDPOINT, yes));
    assert!(!requests_token_telemetry(&Method::POST, "/v1/completions", yes));
    assert!(!requests_token_telemetry(&Method::POST, CORRELATED_ENDPOINT, br#"{"logprobs": false}"#));
    assert!(!requests_token_telemetry(&Method::POST, CORRELATED_ENDPOINT, br#"{"messages": []}"#));
    assert!(!requests_token_telemetry(&Method::POST, CORRELATED_ENDPOINT, b"not json"));
    assert!(requests_token_telemetry(&Method::POST, CORRELATED_ENDPOINT, br#"{"logprobs": 1}"#));
}

#[test]
fn test_artifact_name() {
    let at = Utc
        .with_ymd_and_hms(2025, 3, 4, 5, 6, 7)
        .single()
        .expect("valid time")
        + chrono::Duration::milliseconds(89);
    assert_eq!(artifact_name(at, 0), "combined_20250304_050607_089.json");
    assert_eq!(artifact_name(at, 2), "combined_20250304_050607_089_2.json");
}

#[test]
fn test_persist_artifact_same_millisecond_gets_new_name() {
    let dir = tempfile::tempdir().expect("tempdir");
    let api = ApiResponse::parse_str(&completion_body().to_string()).expect("api");
    let outcome = TailOutcome {
        entries: Vec::new(),
        log_version: None,
        log_timestamp: None,
        status: TailStatus::TimedOut,
        polls: 1,
        log_observed: false,
    };
    let now = Utc::now();
    let doc = build_online_document(&api, &outcome, now);

    let first = persist_artifact(dir.path(), now, &doc).expect("first write");
    std::fs::write(dir.path().join(artifact_name(now, 1)), "taken").expect("occupy");
    let second = persist_artifact(dir.path(), now, &doc).expect("second write");

    assert_eq!(first, dir.path().join(artifact_name(now, 0)));
    assert_eq!(second, dir.path().join(artifact_name(now, 2)));
    assert_eq!(
        std::fs::read_to_string(dir.path().join(artifact_name(now, 1))).expect("read"),
        "taken"
    );
    let saved: Value = serde_json::from_str(&std::fs::read_to_string(&second).expect("read")).expect("json");
    assert_eq!(saved["summary"]["total_steps"], doc.summary.total_steps);
}

#[test]
fn test_online_document_unavailable_telemetry() {
    let api = ApiResponse::parse_str(&completion_body().to_string()).expect("api");
    let outcome = TailOutcome {
        entries: Vec::new(),
        log_version: None,
        log_timestamp: None,
        status: TailStatus::TimedOut,
        polls: 3,
        log_observed: false,
    };
    let doc = build_online_document(&api, &outcome, Utc::now());
    let value = serde_json::to_value(&doc).expect("serialize");
    assert_eq!(value["summary"]["rejected_steps"], 0);
    assert_eq!(
        value["steps"][0]["rejection_sampling"]["note"],
        crate::correlate::NOTE_NO_TELEMETRY
    );
    assert!(value["metadata"]["timestamp"].is_string());
    assert!(value["metadata"].get("rejection_log_version").is_none());
}

#[test]
fn test_correlate_and_persist_rejects_non_completion_body() {
    let dir = tempfile::tempdir().expect("tempdir");
    let monitor = TailMonitor::new(dir.path().join("log.json"), Duration::from_millis(1), Duration::ZERO);
    let err = correlate_and_persist(&monitor, dir.path(), b"[1, 2", 0).unwrap_err();
    assert!(matches!(err, TracerError::CorrelationFailure(_)));
}

// =============================================================================
// Relay
// =============================================================================

#[tokio::test]
async fn test_relay_preserves_method_query_headers_and_body() {
    let h = harness().await;
    let app = create_router(ProxyState::new(h.config.clone()).expect("state"));

    let response = app
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/echo?x=1&y=two")
                .header("x-custom", "kept")
                .body(Body::from("payload"))
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(COMBINED_HEADER).is_none());
    let echoed = body_json(response).await;
    assert_eq!(echoed["method"], "PUT");
    assert_eq!(echoed["query"], "x=1&y=two");
    assert_eq!(echoed["x_custom"], "kept");
    assert_eq!(echoed["body"], "payload");
    // Host is the upstream's own, never the caller's
    let upstream_host = h.config.upstream_url.trim_start_matches("http://");
    assert_eq!(echoed["host"], upstream_host);
}

#[tokio::test]
async fn test_relay_status_and_headers_verbatim() {
    let h = harness().await;
    let app = create_router(ProxyState::new(h.config.clone()).expect("state"));

    let response = app
        .oneshot(Request::builder().uri("/teapot").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
    assert_eq!(response.headers().get("x-upstream").map(|v| v.as_bytes()), Some(&b"yes"[..]));
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    assert_eq!(&bytes[..], b"short and stout");
}

#[tokio::test]
async fn test_redirect_relayed_not_followed() {
    let h = harness().await;
    let app = create_router(ProxyState::new(h.config.clone()).expect("state"));

    let response = app
        .oneshot(Request::builder().uri("/redirect").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers().get(header::LOCATION).map(|v| v.as_bytes()),
        Some(&b"/elsewhere"[..])
    );
}

#[tokio::test]
async fn test_unreachable_upstream_is_bad_gateway() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let config = ProxyConfig {
        upstream_url: format!("http://{addr}"),
        ..ProxyConfig::default()
    };
    let app = create_router(ProxyState::new(config).expect("state"));
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert!(body["error"].as_str().is_some_and(|e| !e.is_empty()));
}

#[tokio::test]
async fn test_upstream_timeout_is_gateway_timeout() {
    let h = harness().await;
    let config = ProxyConfig {
        upstream_timeout: Duration::from_millis(200),
        ..h.config.clone()
    };
    let app = create_router(ProxyState::new(config).expect("state"));
    let response = app
        .oneshot(Request::builder().uri("/slow").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
}

// =============================================================================
// Correlation
// =============================================================================

#[tokio::test]
async fn test_chat_completion_with_logprobs_is_correlated() {
    let h = harness().await;
    let app = create_router(ProxyState::new(h.config.clone()).expect("state"));

    let response = app
        .oneshot(chat_request(&json!({"messages": [], "logprobs": true})))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let artifact = response
        .headers()
        .get(COMBINED_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(PathBuf::from)
        .expect("artifact header");
    assert!(artifact.starts_with(&h.output_dir));

    // Body is the upstream's, untouched
    assert_eq!(body_json(response).await, completion_body());

    let combined: Value =
        serde_json::from_str(&std::fs::read_to_string(&artifact).expect("artifact")).expect("json");
    assert_eq!(combined["metadata"]["request_id"], "chatcmpl-42");
    assert_eq!(combined["metadata"]["rejection_log_version"], "1.0");
    assert_eq!(combined["summary"]["total_steps"], 3);
    assert_eq!(combined["summary"]["rejected_steps"], 1);
    assert_eq!(combined["steps"][1]["rejection_sampling"]["was_rejected"], true);
    assert_eq!(combined["steps"][1]["rejection_sampling"]["task_id"], 7);
    assert_eq!(
        combined["steps"][0]["rejection_sampling"]["note"],
        crate::correlate::NOTE_NOT_REJECTED
    );
    assert_eq!(combined["summary"]["final_output"], "{\"a\":1}");
}

#[tokio::test]
async fn test_chat_completion_without_logprobs_is_plain_relay() {
    let h = harness().await;
    let app = create_router(ProxyState::new(h.config.clone()).expect("state"));

    let response = app
        .oneshot(chat_request(&json!({"messages": []})))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(COMBINED_HEADER).is_none());
    assert!(artifacts(&h.output_dir).is_empty());
}

#[tokio::test]
async fn test_no_save_disables_correlation() {
    let h = harness().await;
    let config = ProxyConfig {
        save_combined: false,
        ..h.config.clone()
    };
    let app = create_router(ProxyState::new(config).expect("state"));

    let response = app
        .oneshot(chat_request(&json!({"logprobs": true})))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(COMBINED_HEADER).is_none());
    assert!(artifacts(&h.output_dir).is_empty());
}

#[tokio::test]
async fn test_correlation_failure_leaves_response_unchanged() {
    let h = harness().await;
    let config = ProxyConfig {
        output_dir: h.output_dir.join("missing").join("nested"),
        ..h.config.clone()
    };
    let app = create_router(ProxyState::new(config).expect("state"));

    let response = app
        .oneshot(chat_request(&json!({"logprobs": true})))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(COMBINED_HEADER).is_none());
    assert_eq!(body_json(response).await, completion_body());
}

#[tokio::test]
async fn test_missing_rejection_log_still_persists_with_note() {
    let h = harness().await;
    let config = ProxyConfig {
        rejection_log: h.output_dir.join("never_written.json"),
        monitor_timeout: Duration::from_millis(30),
        ..h.config.clone()
    };
    let app = create_router(ProxyState::new(config).expect("state"));

    let response = app
        .oneshot(chat_request(&json!({"logprobs": true})))
        .await
        .expect("response");
    let artifact = response
        .headers()
        .get(COMBINED_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(PathBuf::from)
        .expect("artifact header");

    let combined: Value =
        serde_json::from_str(&std::fs::read_to_string(&artifact).expect("artifact")).expect("json");
    assert_eq!(combined["summary"]["rejected_steps"], 0);
    assert_eq!(combined["summary"]["rejection_rate"], 0.0);
    assert_eq!(
        combined["steps"][2]["rejection_sampling"]["note"],
        crate::correlate::NOTE_NO_TELEMETRY
    );
}
