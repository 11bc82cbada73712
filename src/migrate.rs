use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create the full schema. Idempotent; safe to run on every startup.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Workflow job rows. Structured sub-objects live in *_json TEXT columns.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workflow_jobs (
            job_id TEXT PRIMARY KEY,
            workflow TEXT NOT NULL,
            status TEXT NOT NULL,
            current_step TEXT NOT NULL,
            progress REAL NOT NULL DEFAULT 0.0,
            draft_state TEXT NOT NULL,
            started_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            completed_at TEXT,
            idempotency_key TEXT,
            webhook_enabled INTEGER NOT NULL DEFAULT 0,
            webhook_url TEXT,
            webhook_last_delivery_status TEXT,
            webhook_last_delivery_at TEXT,
            stepper_json TEXT NOT NULL DEFAULT '[]',
            pagination_json TEXT NOT NULL DEFAULT '{}',
            undo_json TEXT NOT NULL DEFAULT '{}',
            metadata_json TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Idempotency replay records. A (scope, key) pair is written once and
    // replayed verbatim afterwards.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS workflow_idempotency_keys (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            scope TEXT NOT NULL,
            idempotency_key TEXT NOT NULL,
            response_json TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE(scope, idempotency_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Canonical artifacts: append-only record of ingested documents.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS canonical_artifacts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            artifact_id TEXT NOT NULL,
            sha256 TEXT NOT NULL,
            source_uri TEXT,
            mime_type TEXT,
            metadata_json TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS canonical_artifact_blobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            artifact_row_id INTEGER NOT NULL,
            blob_locator TEXT NOT NULL,
            content_size_bytes INTEGER,
            FOREIGN KEY (artifact_row_id) REFERENCES canonical_artifacts(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS canonical_artifact_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            artifact_row_id INTEGER NOT NULL,
            event_type TEXT NOT NULL,
            event_data_json TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            FOREIGN KEY (artifact_row_id) REFERENCES canonical_artifacts(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Immutability is enforced at the storage layer: UPDATE/DELETE against
    // canonical_artifacts abort even for callers bypassing the service.
    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS canonical_artifacts_no_update
        BEFORE UPDATE ON canonical_artifacts
        BEGIN
            SELECT RAISE(ABORT, 'canonical artifacts are immutable');
        END
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TRIGGER IF NOT EXISTS canonical_artifacts_no_delete
        BEFORE DELETE ON canonical_artifacts
        BEGIN
            SELECT RAISE(ABORT, 'canonical artifacts are immutable');
        END
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_artifact_events_row_id ON canonical_artifact_events(artifact_row_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_artifacts_artifact_id ON canonical_artifacts(artifact_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_updated_at ON workflow_jobs(updated_at DESC)")
        .execute(pool)
        .await?;

    Ok(())
}
