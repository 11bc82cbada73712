//! Canonical artifact store.
//!
//! Append-only, immutable record of ingested artifacts plus an ordered
//! lineage event log. Immutability is layered: the service refuses
//! update/delete unconditionally, and the schema carries `RAISE(ABORT)`
//! triggers so a direct `UPDATE`/`DELETE` against `canonical_artifacts`
//! fails even for callers that bypass this module (see `migrate`).

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;

/// Request to record a newly ingested artifact.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub artifact_id: String,
    pub sha256: String,
    pub source_uri: Option<String>,
    pub mime_type: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub blob_locator: Option<String>,
    pub content_size_bytes: Option<i64>,
}

/// One lineage event, ordered by insertion (`id ASC`).
#[derive(Debug, Clone, Serialize)]
pub struct LineageEvent {
    pub id: i64,
    pub artifact_row_id: i64,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Insert the artifact row, optionally a blob-locator row, and
/// unconditionally append an `"ingested"` lineage event carrying the
/// content hash. Returns the new surrogate row id.
pub async fn ingest_artifact(pool: &SqlitePool, artifact: &NewArtifact) -> Result<i64> {
    let metadata_json = artifact
        .metadata
        .as_ref()
        .map(|m| m.to_string())
        .unwrap_or_else(|| "{}".to_string());

    let mut tx = pool.begin().await?;

    let row = sqlx::query(
        r#"
        INSERT INTO canonical_artifacts (artifact_id, sha256, source_uri, mime_type, metadata_json)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&artifact.artifact_id)
    .bind(&artifact.sha256)
    .bind(&artifact.source_uri)
    .bind(&artifact.mime_type)
    .bind(&metadata_json)
    .execute(&mut *tx)
    .await?;

    let artifact_row_id = row.last_insert_rowid();

    if let Some(locator) = &artifact.blob_locator {
        sqlx::query(
            r#"
            INSERT INTO canonical_artifact_blobs (artifact_row_id, blob_locator, content_size_bytes)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(artifact_row_id)
        .bind(locator)
        .bind(artifact.content_size_bytes)
        .execute(&mut *tx)
        .await?;
    }

    let event_data = serde_json::json!({ "sha256": artifact.sha256 });
    sqlx::query(
        r#"
        INSERT INTO canonical_artifact_events (artifact_row_id, event_type, event_data_json, created_at)
        VALUES (?, 'ingested', ?, ?)
        "#,
    )
    .bind(artifact_row_id)
    .bind(event_data.to_string())
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    Ok(artifact_row_id)
}

/// Append a lifecycle event to an artifact's lineage. Fails with a
/// foreign-key violation if the artifact row does not exist.
pub async fn append_lineage_event(
    pool: &SqlitePool,
    artifact_row_id: i64,
    event_type: &str,
    event_data: Option<serde_json::Value>,
) -> Result<i64> {
    let data_json = event_data
        .map(|d| d.to_string())
        .unwrap_or_else(|| "{}".to_string());

    let row = sqlx::query(
        r#"
        INSERT INTO canonical_artifact_events (artifact_row_id, event_type, event_data_json, created_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(artifact_row_id)
    .bind(event_type)
    .bind(&data_json)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    Ok(row.last_insert_rowid())
}

/// All lineage events for an artifact, oldest first by insertion order.
/// Ordered by `id ASC`, not timestamp, to stay monotonic under coarse
/// clock resolution.
pub async fn list_lineage(pool: &SqlitePool, artifact_row_id: i64) -> Result<Vec<LineageEvent>> {
    let rows: Vec<(i64, i64, String, String, String)> = sqlx::query_as(
        r#"
        SELECT id, artifact_row_id, event_type, event_data_json, created_at
        FROM canonical_artifact_events
        WHERE artifact_row_id = ?
        ORDER BY id ASC
        "#,
    )
    .bind(artifact_row_id)
    .fetch_all(pool)
    .await?;

    let mut events = Vec::with_capacity(rows.len());
    for (id, row_id, event_type, data_json, created_at) in rows {
        events.push(LineageEvent {
            id,
            artifact_row_id: row_id,
            event_type,
            event_data: serde_json::from_str(&data_json).unwrap_or(serde_json::Value::Null),
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        });
    }

    Ok(events)
}

/// Always fails. Canonical artifacts are never mutated after creation;
/// history accumulates only through lineage events.
pub async fn update_artifact(_pool: &SqlitePool, artifact_row_id: i64) -> Result<()> {
    bail!(
        "canonical artifacts are immutable: refusing to update artifact row {}",
        artifact_row_id
    );
}

/// Always fails. Canonical artifacts are never deleted.
pub async fn delete_artifact(_pool: &SqlitePool, artifact_row_id: i64) -> Result<()> {
    bail!(
        "canonical artifacts are immutable: refusing to delete artifact row {}",
        artifact_row_id
    );
}
