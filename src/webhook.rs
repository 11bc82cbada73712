//! Webhook delivery with HMAC signing, bounded retries, and a DLQ.
//!
//! Delivery is at-least-once: a 2xx response is success, anything else is
//! retried up to `max_retries` additional times with linear backoff
//! (`backoff_base * attempt_number`, no sleep after the final attempt).
//! Exhausted deliveries are appended to a newline-delimited JSON
//! dead-letter file and reported as `ok = false` — network failure never
//! raises, and never blocks the workflow step that triggered delivery.
//!
//! Receivers must dedupe on `event_id`; retry state is keyed by the same
//! id and observable via [`WebhookDelivery::get_retry_state`].

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use crate::config::WebhookConfig;

type HmacSha256 = Hmac<Sha256>;

/// Signature header carried on signed deliveries.
pub const SIGNATURE_HEADER: &str = "x-caseflow-signature";
/// Unix-seconds timestamp header carried on every delivery.
pub const TIMESTAMP_HEADER: &str = "x-caseflow-timestamp";

/// Final outcome of one `deliver` call.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryOutcome {
    pub ok: bool,
    pub status: Option<u16>,
    pub attempt: u32,
}

/// Per-event retry bookkeeping, updated after every attempt.
#[derive(Debug, Clone, Serialize)]
pub struct RetryState {
    pub url: String,
    pub attempt: u32,
    pub last_status: Option<u16>,
    pub last_error: Option<String>,
    pub done: bool,
}

pub struct WebhookDelivery {
    config: WebhookConfig,
    client: reqwest::Client,
    retry_state: Mutex<HashMap<String, RetryState>>,
}

impl WebhookDelivery {
    pub fn new(config: WebhookConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs_f64(config.effective_timeout_secs()))
            .build()?;

        Ok(Self {
            config,
            client,
            retry_state: Mutex::new(HashMap::new()),
        })
    }

    /// Deliver `payload` to `url`, retrying on any non-2xx response or
    /// network error. Never returns an error: the outcome (including
    /// exhaustion) is fully captured in the return value and the DLQ.
    pub async fn deliver(
        &self,
        url: &str,
        payload: &serde_json::Value,
        event_id: &str,
    ) -> DeliveryOutcome {
        let body = payload.to_string();
        let signature = self.sign(body.as_bytes());
        let total_attempts = if self.config.retries_enabled {
            self.config.max_retries + 1
        } else {
            1
        };

        let mut last_status: Option<u16> = None;
        let mut last_error: Option<String> = None;

        for attempt in 1..=total_attempts {
            let mut request = self
                .client
                .post(url)
                .header("Content-Type", "application/json")
                .header(TIMESTAMP_HEADER, chrono::Utc::now().timestamp().to_string());

            if let Some(sig) = &signature {
                request = request.header(SIGNATURE_HEADER, sig.clone());
            }

            match request.body(body.clone()).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    last_status = Some(status);
                    last_error = None;

                    if response.status().is_success() {
                        self.record_attempt(event_id, url, attempt, last_status, None, true);
                        return DeliveryOutcome {
                            ok: true,
                            status: last_status,
                            attempt,
                        };
                    }
                }
                Err(e) => {
                    last_status = None;
                    last_error = Some(e.to_string());
                }
            }

            self.record_attempt(event_id, url, attempt, last_status, last_error.clone(), false);

            // Linear backoff between attempts; none after the last one.
            if attempt < total_attempts {
                let delay = self.config.backoff_base_secs * attempt as f64;
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }
        }

        let final_state = self.get_retry_state(event_id);
        self.write_dlq(event_id, url, payload, total_attempts, final_state.as_ref());

        DeliveryOutcome {
            ok: false,
            status: last_status,
            attempt: total_attempts,
        }
    }

    /// Retry bookkeeping for an event id, for debugging and tests.
    pub fn get_retry_state(&self, event_id: &str) -> Option<RetryState> {
        self.retry_state
            .lock()
            .expect("retry state lock poisoned")
            .get(event_id)
            .cloned()
    }

    /// `sha256=<hex hmac>` over the body, or `None` when unsigned.
    fn sign(&self, body: &[u8]) -> Option<String> {
        if self.config.secret.is_empty() {
            return None;
        }
        Some(sign_body(&self.config.secret, body))
    }

    fn record_attempt(
        &self,
        event_id: &str,
        url: &str,
        attempt: u32,
        last_status: Option<u16>,
        last_error: Option<String>,
        done: bool,
    ) {
        let mut state = self.retry_state.lock().expect("retry state lock poisoned");
        state.insert(
            event_id.to_string(),
            RetryState {
                url: url.to_string(),
                attempt,
                last_status,
                last_error,
                done,
            },
        );
    }

    /// Append one JSON line to the dead-letter file. DLQ write failures
    /// are logged and swallowed; they must not surface to the workflow.
    fn write_dlq(
        &self,
        event_id: &str,
        url: &str,
        payload: &serde_json::Value,
        attempts: u32,
        final_state: Option<&RetryState>,
    ) {
        let entry = serde_json::json!({
            "event_id": event_id,
            "url": url,
            "payload": payload,
            "attempts": attempts,
            "retry_state": final_state,
            "dead_lettered_at": chrono::Utc::now().to_rfc3339(),
        });

        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = self.config.dlq_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.config.dlq_path)?;
            writeln!(file, "{}", entry)?;
            Ok(())
        })();

        if let Err(e) = result {
            eprintln!(
                "Warning: failed to write webhook DLQ entry for {}: {}",
                event_id, e
            );
        }
    }
}

/// Compute the signature value for a request body:
/// `"sha256=" + hex(hmac_sha256(secret, body))`.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_has_sha256_prefix_and_hex_digest() {
        let sig = sign_body("secret", b"{\"a\":1}");
        assert!(sig.starts_with("sha256="));
        let digest = &sig["sha256=".len()..];
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn signature_is_deterministic_and_key_dependent() {
        let body = b"payload bytes";
        assert_eq!(sign_body("k1", body), sign_body("k1", body));
        assert_ne!(sign_body("k1", body), sign_body("k2", body));
    }

    #[test]
    fn empty_secret_means_unsigned() {
        let delivery = WebhookDelivery::new(WebhookConfig::default()).unwrap();
        assert!(delivery.sign(b"body").is_none());
    }
}
