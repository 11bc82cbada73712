//! Idempotency-key replay store.
//!
//! Keys are scoped so that "create job" and "execute step X of job Y"
//! cannot collide. A stored record is immutable except for `updated_at`;
//! replaying the same `(scope, key)` returns the previously stored
//! response body verbatim without re-executing side effects.

use anyhow::Result;
use sqlx::SqlitePool;

/// Scope for job creation requests.
pub fn create_job_scope() -> String {
    "create_job".to_string()
}

/// Scope for one step execution of one job.
pub fn execute_step_scope(job_id: &str, step: &str) -> String {
    format!("execute_step:{}:{}", job_id, step)
}

/// Fetch the stored response body for `(scope, key)`, if any.
pub async fn lookup(pool: &SqlitePool, scope: &str, key: &str) -> Result<Option<String>> {
    let body: Option<String> = sqlx::query_scalar(
        "SELECT response_json FROM workflow_idempotency_keys WHERE scope = ? AND idempotency_key = ?",
    )
    .bind(scope)
    .bind(key)
    .fetch_optional(pool)
    .await?;

    Ok(body)
}

/// Store a response body under `(scope, key)`. On conflict only
/// `updated_at` is refreshed; the body is never overwritten.
pub async fn store(pool: &SqlitePool, scope: &str, key: &str, response_json: &str) -> Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        INSERT INTO workflow_idempotency_keys (scope, idempotency_key, response_json, updated_at)
        VALUES (?, ?, ?, ?)
        ON CONFLICT(scope, idempotency_key) DO UPDATE SET updated_at = excluded.updated_at
        "#,
    )
    .bind(scope)
    .bind(key)
    .bind(response_json)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}
