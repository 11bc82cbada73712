//! Workflow job state machine.
//!
//! The orchestrator over the fixed seven-step sequence: per-job state,
//! idempotency-key deduplication, per-step status tracking, pagination
//! snapshots, draft state, and webhook event emission on transitions.
//!
//! Step ordering is advisory by default — any `execute_step` call
//! force-sets `status = running` and re-targets `current_step` — and can
//! be made a hard precondition with `[workflow] strict_sequencing = true`.
//!
//! Every load-mutate-save cycle on a job runs under a per-job async mutex
//! so concurrent step executions against the same `job_id` (retry storms,
//! duplicate re-polls) cannot lose updates.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::config::WorkflowConfig;
use crate::idempotency;
use crate::models::{
    DraftState, Job, JobLookup, JobStatus, PaginationMeta, StepStatus, DELIVERY_AUDIT_CAP,
    STEP_NAMES,
};
use crate::steps::{ExecutorRegistry, StepContext};
use crate::webhook::WebhookDelivery;

/// Request body for `POST /workflow/jobs`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateJobRequest {
    pub workflow: Option<String>,
    pub idempotency_key: Option<String>,
    pub webhook_url: Option<String>,
    pub metadata: Option<serde_json::Map<String, Value>>,
}

/// Request body for `POST /workflow/jobs/{id}/steps/{step}/execute`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecuteStepRequest {
    pub idempotency_key: Option<String>,
    pub payload: Option<Value>,
}

/// Keyed per-job mutexes. Contention is per job id, never global.
struct JobLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl JobLocks {
    fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    fn for_job(&self, job_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().expect("job lock map poisoned");
        map.entry(job_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// The workflow engine. One instance per process, shared across requests.
pub struct WorkflowService {
    pool: SqlitePool,
    webhooks: Arc<WebhookDelivery>,
    executors: ExecutorRegistry,
    ctx: StepContext,
    locks: JobLocks,
    policy: WorkflowConfig,
}

impl WorkflowService {
    pub fn new(
        pool: SqlitePool,
        webhooks: Arc<WebhookDelivery>,
        executors: ExecutorRegistry,
        ctx: StepContext,
        policy: WorkflowConfig,
    ) -> Self {
        Self {
            pool,
            webhooks,
            executors,
            ctx,
            locks: JobLocks::new(),
            policy,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a job. Idempotent on `(create_job, key)`: a repeated call
    /// with the same key returns the previously stored response body and
    /// creates nothing.
    pub async fn create_job(&self, req: CreateJobRequest) -> Result<Value> {
        let scope = idempotency::create_job_scope();
        if let Some(key) = &req.idempotency_key {
            if let Some(body) = idempotency::lookup(&self.pool, &scope, key).await? {
                return Ok(serde_json::from_str(&body)?);
            }
        }

        let job_id = format!("wf_{}", &Uuid::new_v4().simple().to_string()[..12]);
        let workflow = req
            .workflow
            .clone()
            .unwrap_or_else(|| self.policy.default_workflow.clone());

        let mut job = Job::new(&job_id, workflow);
        job.idempotency_key = req.idempotency_key.clone();
        if let Some(url) = req.webhook_url {
            job.webhook.enabled = true;
            job.webhook.url = Some(url);
        }
        if let Some(metadata) = req.metadata {
            job.metadata = metadata;
        }

        save_job(&self.pool, &job).await?;
        self.notify(&mut job, "job_created", json!({})).await;

        let response = json!({ "success": true, "job": job });
        if let Some(key) = &req.idempotency_key {
            idempotency::store(&self.pool, &scope, key, &response.to_string()).await?;
        }
        Ok(response)
    }

    /// Look up a job. A missing id yields a synthesized failed job, not
    /// an error; the synthesized job is persisted only when the id was
    /// issued by this service (`wf_` prefix).
    pub async fn get_status(&self, job_id: &str) -> Result<Job> {
        let mut job = load_job(&self.pool, job_id).await?.into_job();
        job.touch();
        if Job::is_local_id(job_id) {
            save_job(&self.pool, &job).await?;
        }
        Ok(job)
    }

    /// Execute one step. Idempotent on `(execute_step:<job>:<step>, key)`.
    ///
    /// A fresh call loads (or default-constructs) the job, force-sets
    /// `running`, runs the executor, records the per-step outcome, and
    /// emits a webhook event. The response is cached under the key so
    /// replays are side-effect-free.
    pub async fn execute_step(
        &self,
        job_id: &str,
        step: &str,
        req: ExecuteStepRequest,
    ) -> Result<Value> {
        if !STEP_NAMES.contains(&step) {
            bail!("unknown step: '{}'", step);
        }

        let lock = self.locks.for_job(job_id);
        let _guard = lock.lock().await;

        let scope = idempotency::execute_step_scope(job_id, step);
        if let Some(key) = &req.idempotency_key {
            if let Some(body) = idempotency::lookup(&self.pool, &scope, key).await? {
                return Ok(serde_json::from_str(&body)?);
            }
        }

        let mut job = match load_job(&self.pool, job_id).await? {
            JobLookup::Found(job) => job,
            JobLookup::NotFound(id) => Job::new(id, self.policy.default_workflow.clone()),
        };

        if self.policy.strict_sequencing {
            self.check_sequencing(&job, step)?;
        }

        job.status = JobStatus::Running;
        job.current_step = step.to_string();
        job.draft_state = DraftState::Saving;
        job.bump_progress();
        job.set_step_status(step, StepStatus::InProgress);
        save_job(&self.pool, &job).await?;

        let executor = self
            .executors
            .find(step)
            .ok_or_else(|| anyhow!("no executor registered for step: {}", step))?;
        let payload = req.payload.clone().unwrap_or(Value::Null);

        let result = match executor.execute(payload, &self.ctx).await {
            Ok(result) => result,
            Err(e) => {
                job.set_step_status(step, StepStatus::Failed);
                job.draft_state = DraftState::Failed;
                if let Err(save_err) = save_job(&self.pool, &job).await {
                    eprintln!("Warning: failed to persist failed step state: {}", save_err);
                }
                self.notify(
                    &mut job,
                    "step_failed",
                    json!({ "step": step, "error": e.to_string() }),
                )
                .await;
                return Err(e);
            }
        };

        let step_status = if result.status == "failed" {
            StepStatus::Failed
        } else {
            StepStatus::Complete
        };
        job.set_step_status(step, step_status);
        job.draft_state = DraftState::Clean;

        let result_value = serde_json::to_value(&result)?;
        let by_step = job
            .metadata
            .entry("last_result_by_step")
            .or_insert_with(|| json!({}));
        if let Some(map) = by_step.as_object_mut() {
            map.insert(step.to_string(), result_value);
        }
        if step_status == StepStatus::Complete {
            let completed = job
                .metadata
                .entry("completed_steps")
                .or_insert_with(|| json!([]));
            if let Some(list) = completed.as_array_mut() {
                if !list.iter().any(|v| v == step) {
                    list.push(json!(step));
                }
            }
        }

        job.pagination.insert(
            step.to_string(),
            PaginationMeta {
                count: result.items.len() as i64,
                has_more: false,
                next_cursor: None,
            },
        );

        save_job(&self.pool, &job).await?;
        self.notify(
            &mut job,
            "step_completed",
            json!({ "step": step, "status": result.status }),
        )
        .await;

        let response = json!({
            "success": true,
            "job_id": job.job_id,
            "step": step,
            "result": result,
            "errors": [],
        });
        if let Some(key) = &req.idempotency_key {
            idempotency::store(&self.pool, &scope, key, &response.to_string()).await?;
        }
        Ok(response)
    }

    /// Read-only page over the stashed result of one step.
    ///
    /// `has_more` is "returned count equals requested limit" — an
    /// approximation, not an exact more-rows-exist check. Refreshes the
    /// job's pagination snapshot for the step.
    pub async fn get_results(
        &self,
        job_id: &str,
        step: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Value> {
        if !STEP_NAMES.contains(&step) {
            bail!("unknown step: '{}'", step);
        }
        let limit = limit.max(0) as usize;
        let offset = offset.max(0) as usize;

        let mut job = load_job(&self.pool, job_id).await?.into_job();

        let stored = job
            .metadata
            .get("last_result_by_step")
            .and_then(|m| m.get(step))
            .cloned();

        let status = stored
            .as_ref()
            .and_then(|r| r.get("status"))
            .and_then(|s| s.as_str())
            .unwrap_or("not_started")
            .to_string();
        let all_items: Vec<Value> = stored
            .as_ref()
            .and_then(|r| r.get("items"))
            .and_then(|i| i.as_array())
            .cloned()
            .unwrap_or_default();

        let page: Vec<Value> = all_items.iter().skip(offset).take(limit).cloned().collect();
        let has_more = page.len() == limit && limit > 0;
        let pagination = PaginationMeta {
            count: page.len() as i64,
            has_more,
            next_cursor: has_more.then(|| (offset + limit).to_string()),
        };

        job.pagination.insert(step.to_string(), pagination.clone());
        job.touch();
        if Job::is_local_id(job_id) {
            save_job(&self.pool, &job).await?;
        }

        Ok(json!({
            "success": true,
            "job_id": job.job_id,
            "step": step,
            "result": {
                "status": status,
                "items": page,
                "pagination": pagination,
            },
            "errors": [],
        }))
    }

    fn check_sequencing(&self, job: &Job, step: &str) -> Result<()> {
        for item in &job.stepper {
            if item.name == step {
                break;
            }
            if item.status != StepStatus::Complete {
                bail!(
                    "strict sequencing: step '{}' cannot run before '{}' is complete",
                    step,
                    item.name
                );
            }
        }
        Ok(())
    }

    /// Deliver a workflow callback for a job transition.
    ///
    /// No-ops silently when the job's webhook is disabled. Delivery
    /// failures are recorded on the job and logged — they never fail the
    /// workflow step that triggered them.
    async fn notify(&self, job: &mut Job, event_type: &str, payload: Value) {
        if !job.webhook.enabled {
            return;
        }
        let Some(url) = job.webhook.url.clone() else {
            return;
        };

        let suffix = Uuid::new_v4().simple().to_string();
        let event_id = format!("{}:{}:{}", job.job_id, event_type, &suffix[..10]);
        let envelope = json!({
            "event_id": event_id,
            "event_type": event_type,
            "job_id": job.job_id,
            "workflow": job.workflow,
            "status": job.status,
            "current_step": job.current_step,
            "payload": payload,
            "emitted_at": Utc::now().to_rfc3339(),
        });

        let outcome = self.webhooks.deliver(&url, &envelope, &event_id).await;

        let now = Utc::now();
        job.webhook.last_delivery_status =
            Some(if outcome.ok { "delivered" } else { "failed" }.to_string());
        job.webhook.last_delivery_at = Some(now);

        let record = json!({
            "event_id": event_id,
            "event_type": event_type,
            "ok": outcome.ok,
            "status": outcome.status,
            "attempt": outcome.attempt,
            "at": now.to_rfc3339(),
        });
        let audit = job
            .metadata
            .entry("webhook")
            .or_insert_with(|| json!({ "deliveries": [] }));
        if let Some(deliveries) = audit
            .get_mut("deliveries")
            .and_then(|d| d.as_array_mut())
        {
            deliveries.push(record);
            if deliveries.len() > DELIVERY_AUDIT_CAP {
                let excess = deliveries.len() - DELIVERY_AUDIT_CAP;
                deliveries.drain(0..excess);
            }
        }

        job.touch();
        if let Err(e) = save_job(&self.pool, job).await {
            eprintln!(
                "Warning: failed to record webhook delivery for {}: {}",
                job.job_id, e
            );
        }
    }
}

// ─── Persistence ────────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct JobRow {
    job_id: String,
    workflow: String,
    status: String,
    current_step: String,
    progress: f64,
    draft_state: String,
    started_at: String,
    updated_at: String,
    completed_at: Option<String>,
    idempotency_key: Option<String>,
    webhook_enabled: i64,
    webhook_url: Option<String>,
    webhook_last_delivery_status: Option<String>,
    webhook_last_delivery_at: Option<String>,
    stepper_json: String,
    pagination_json: String,
    undo_json: String,
    metadata_json: String,
}

/// Look up one job row, deserializing the JSON sub-object columns back
/// into their domain types.
pub async fn load_job(pool: &SqlitePool, job_id: &str) -> Result<JobLookup> {
    let row: Option<JobRow> = sqlx::query_as(
        r#"
        SELECT job_id, workflow, status, current_step, progress, draft_state,
               started_at, updated_at, completed_at, idempotency_key,
               webhook_enabled, webhook_url, webhook_last_delivery_status,
               webhook_last_delivery_at, stepper_json, pagination_json,
               undo_json, metadata_json
        FROM workflow_jobs WHERE job_id = ?
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(JobLookup::NotFound(job_id.to_string()));
    };

    let job = Job {
        job_id: row.job_id,
        workflow: row.workflow,
        status: token_to_enum(&row.status).unwrap_or(JobStatus::Failed),
        current_step: row.current_step,
        progress: row.progress,
        draft_state: token_to_enum(&row.draft_state).unwrap_or(DraftState::Failed),
        started_at: parse_ts(&row.started_at),
        updated_at: parse_ts(&row.updated_at),
        completed_at: row.completed_at.as_deref().map(parse_ts),
        idempotency_key: row.idempotency_key,
        webhook: crate::models::WebhookState {
            enabled: row.webhook_enabled != 0,
            url: row.webhook_url,
            last_delivery_status: row.webhook_last_delivery_status,
            last_delivery_at: row.webhook_last_delivery_at.as_deref().map(parse_ts),
        },
        stepper: serde_json::from_str(&row.stepper_json)?,
        pagination: serde_json::from_str(&row.pagination_json)?,
        undo: serde_json::from_str(&row.undo_json)?,
        metadata: serde_json::from_str(&row.metadata_json)?,
    };

    Ok(JobLookup::Found(job))
}

/// Upsert one job row, serializing the structured sub-objects to their
/// JSON columns.
pub async fn save_job(pool: &SqlitePool, job: &Job) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO workflow_jobs (
            job_id, workflow, status, current_step, progress, draft_state,
            started_at, updated_at, completed_at, idempotency_key,
            webhook_enabled, webhook_url, webhook_last_delivery_status,
            webhook_last_delivery_at, stepper_json, pagination_json,
            undo_json, metadata_json
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(job_id) DO UPDATE SET
            workflow = excluded.workflow,
            status = excluded.status,
            current_step = excluded.current_step,
            progress = excluded.progress,
            draft_state = excluded.draft_state,
            updated_at = excluded.updated_at,
            completed_at = excluded.completed_at,
            idempotency_key = excluded.idempotency_key,
            webhook_enabled = excluded.webhook_enabled,
            webhook_url = excluded.webhook_url,
            webhook_last_delivery_status = excluded.webhook_last_delivery_status,
            webhook_last_delivery_at = excluded.webhook_last_delivery_at,
            stepper_json = excluded.stepper_json,
            pagination_json = excluded.pagination_json,
            undo_json = excluded.undo_json,
            metadata_json = excluded.metadata_json
        "#,
    )
    .bind(&job.job_id)
    .bind(&job.workflow)
    .bind(enum_to_token(&job.status))
    .bind(&job.current_step)
    .bind(job.progress)
    .bind(enum_to_token(&job.draft_state))
    .bind(job.started_at.to_rfc3339())
    .bind(job.updated_at.to_rfc3339())
    .bind(job.completed_at.map(|t| t.to_rfc3339()))
    .bind(&job.idempotency_key)
    .bind(job.webhook.enabled as i64)
    .bind(&job.webhook.url)
    .bind(&job.webhook.last_delivery_status)
    .bind(job.webhook.last_delivery_at.map(|t| t.to_rfc3339()))
    .bind(serde_json::to_string(&job.stepper)?)
    .bind(serde_json::to_string(&job.pagination)?)
    .bind(serde_json::to_string(&job.undo)?)
    .bind(serde_json::to_string(&job.metadata)?)
    .execute(pool)
    .await?;

    Ok(())
}

/// Snake-case token for a unit enum variant, via its serde rename.
fn enum_to_token<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(String::from))
        .unwrap_or_default()
}

fn token_to_enum<T: DeserializeOwned>(token: &str) -> Option<T> {
    serde_json::from_value(Value::String(token.to_string())).ok()
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enum_tokens_round_trip() {
        assert_eq!(enum_to_token(&JobStatus::WaitingInput), "waiting_input");
        assert_eq!(
            token_to_enum::<JobStatus>("waiting_input"),
            Some(JobStatus::WaitingInput)
        );
        assert_eq!(enum_to_token(&DraftState::Saving), "saving");
        assert_eq!(token_to_enum::<StepStatus>("bogus"), None::<StepStatus>);
    }
}
