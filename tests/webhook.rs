//! Integration tests for webhook delivery: retry exhaustion, DLQ writes,
//! signature headers, and unreachable-host behavior. The receivers are
//! small in-process axum servers on ephemeral ports.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use caseflow::config::WebhookConfig;
use caseflow::webhook::{sign_body, WebhookDelivery, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use std::fs;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

fn test_config(tmp: &TempDir) -> WebhookConfig {
    WebhookConfig {
        dlq_path: tmp.path().join("dlq.jsonl"),
        backoff_base_secs: 0.0,
        max_retries: 2,
        ..Default::default()
    }
}

/// Spawn a receiver that always answers with `status`, recording each
/// request's headers and body. Returns the URL to post to.
async fn spawn_receiver(
    status: StatusCode,
    seen: Arc<Mutex<Vec<(HeaderMap, String)>>>,
) -> String {
    let app = Router::new()
        .route(
            "/hook",
            post(
                move |State(seen): State<Arc<Mutex<Vec<(HeaderMap, String)>>>>,
                      headers: HeaderMap,
                      body: String| async move {
                    seen.lock().unwrap().push((headers, body));
                    status
                },
            ),
        )
        .with_state(seen);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/hook", addr)
}

#[tokio::test]
async fn successful_delivery_reports_first_attempt() {
    let tmp = TempDir::new().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let url = spawn_receiver(StatusCode::OK, seen.clone()).await;

    let delivery = WebhookDelivery::new(test_config(&tmp)).unwrap();
    let payload = serde_json::json!({ "event_type": "step_completed" });
    let outcome = delivery.deliver(&url, &payload, "evt-1").await;

    assert!(outcome.ok);
    assert_eq!(outcome.status, Some(200));
    assert_eq!(outcome.attempt, 1);

    let state = delivery.get_retry_state("evt-1").unwrap();
    assert!(state.done);
    assert_eq!(state.attempt, 1);

    // No DLQ entry for a successful delivery.
    assert!(!tmp.path().join("dlq.jsonl").exists());
}

#[tokio::test]
async fn exhaustion_attempts_max_retries_plus_one_and_writes_one_dlq_line() {
    let tmp = TempDir::new().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let url = spawn_receiver(StatusCode::INTERNAL_SERVER_ERROR, seen.clone()).await;

    let delivery = WebhookDelivery::new(test_config(&tmp)).unwrap();
    let payload = serde_json::json!({ "event_type": "step_completed", "job_id": "wf_1" });
    let outcome = delivery.deliver(&url, &payload, "evt-dead").await;

    assert!(!outcome.ok);
    assert_eq!(outcome.status, Some(500));
    assert_eq!(outcome.attempt, 3);
    assert_eq!(seen.lock().unwrap().len(), 3);

    let state = delivery.get_retry_state("evt-dead").unwrap();
    assert_eq!(state.attempt, 3);
    assert!(!state.done);
    assert_eq!(state.last_status, Some(500));

    let dlq = fs::read_to_string(tmp.path().join("dlq.jsonl")).unwrap();
    let lines: Vec<&str> = dlq.lines().filter(|l| !l.trim().is_empty()).collect();
    assert_eq!(lines.len(), 1);

    let entry: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(entry["event_id"], "evt-dead");
    assert_eq!(entry["url"], url);
    assert_eq!(entry["attempts"], 3);
    assert_eq!(entry["payload"]["job_id"], "wf_1");
    assert_eq!(entry["retry_state"]["last_status"], 500);
}

#[tokio::test]
async fn retries_disabled_means_single_attempt() {
    let tmp = TempDir::new().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let url = spawn_receiver(StatusCode::INTERNAL_SERVER_ERROR, seen.clone()).await;

    let config = WebhookConfig {
        retries_enabled: false,
        ..test_config(&tmp)
    };
    let delivery = WebhookDelivery::new(config).unwrap();
    let outcome = delivery
        .deliver(&url, &serde_json::json!({}), "evt-once")
        .await;

    assert!(!outcome.ok);
    assert_eq!(outcome.attempt, 1);
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn signed_delivery_carries_hmac_signature_header() {
    let tmp = TempDir::new().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let url = spawn_receiver(StatusCode::OK, seen.clone()).await;

    let config = WebhookConfig {
        secret: "case-secret".to_string(),
        ..test_config(&tmp)
    };
    let delivery = WebhookDelivery::new(config).unwrap();
    let payload = serde_json::json!({ "event_id": "wf_1:step_completed:abc123def0" });
    let outcome = delivery.deliver(&url, &payload, "evt-signed").await;
    assert!(outcome.ok);

    let requests = seen.lock().unwrap();
    let (headers, body) = &requests[0];

    let signature = headers
        .get(SIGNATURE_HEADER)
        .expect("signature header missing")
        .to_str()
        .unwrap();
    assert_eq!(signature, sign_body("case-secret", body.as_bytes()));
    assert!(headers.contains_key(TIMESTAMP_HEADER));
}

#[tokio::test]
async fn unsigned_delivery_omits_signature_header() {
    let tmp = TempDir::new().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let url = spawn_receiver(StatusCode::OK, seen.clone()).await;

    let delivery = WebhookDelivery::new(test_config(&tmp)).unwrap();
    delivery
        .deliver(&url, &serde_json::json!({}), "evt-unsigned")
        .await;

    let requests = seen.lock().unwrap();
    let (headers, _) = &requests[0];
    assert!(headers.get(SIGNATURE_HEADER).is_none());
    assert!(headers.contains_key(TIMESTAMP_HEADER));
}

#[tokio::test]
async fn unreachable_host_records_all_attempts_and_dead_letters() {
    let tmp = TempDir::new().unwrap();

    // Bind then drop to get a port with nothing listening.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let url = format!("http://{}/hook", addr);

    let delivery = WebhookDelivery::new(test_config(&tmp)).unwrap();
    let outcome = delivery
        .deliver(&url, &serde_json::json!({ "event_type": "job_created" }), "evt-gone")
        .await;

    assert!(!outcome.ok);
    assert_eq!(outcome.attempt, 3);
    assert_eq!(outcome.status, None);

    let state = delivery.get_retry_state("evt-gone").unwrap();
    assert_eq!(state.attempt, 3);
    assert!(!state.done);
    assert!(state.last_status.is_none());
    assert!(state.last_error.is_some());

    let dlq = fs::read_to_string(tmp.path().join("dlq.jsonl")).unwrap();
    assert_eq!(dlq.lines().count(), 1);
}
