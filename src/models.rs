//! Core data types for the workflow engine and canonical store.
//!
//! The [`Job`] aggregate is the unit of workflow state: one row per run,
//! carrying the per-step tracker, pagination snapshots, draft state, and
//! webhook delivery bookkeeping. Structured sub-objects (`stepper`,
//! `pagination`, `undo`, `metadata`) are real types here and only become
//! JSON text at the storage boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The fixed workflow step sequence, in execution order.
pub const STEP_NAMES: [&str; 7] = [
    "sources",
    "index_extract",
    "summarize",
    "proposals",
    "review",
    "apply",
    "analytics",
];

/// Workflow template used when a request does not name one.
pub const DEFAULT_WORKFLOW: &str = "memory_first_v2";

/// Fixed progress increment applied per `execute_step` call, capped at 1.0.
pub const PROGRESS_PER_STEP: f64 = 0.15;

/// How many webhook delivery records are retained in job metadata.
pub const DELIVERY_AUDIT_CAP: usize = 50;

/// Overall job status. Any step execution force-sets `Running`; the
/// terminal states are markers set by callers, not enforced transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    WaitingInput,
    Completed,
    Failed,
    Cancelled,
}

/// Whether a job's pending edits are saved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftState {
    Clean,
    Dirty,
    Saving,
    Failed,
}

/// Per-step execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    NotStarted,
    InProgress,
    Blocked,
    Complete,
    Failed,
}

/// One entry in the job's step tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStatusItem {
    pub name: String,
    pub status: StepStatus,
    pub updated_at: DateTime<Utc>,
}

/// Snapshot of the last page fetched for a step's results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginationMeta {
    pub count: i64,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

/// Per-job webhook destination and last delivery outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookState {
    pub enabled: bool,
    pub url: Option<String>,
    pub last_delivery_status: Option<String>,
    pub last_delivery_at: Option<DateTime<Utc>>,
}

/// Undo bookkeeping. Only a counter is tracked; there is no undo engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UndoState {
    pub depth: i64,
    pub last_undo_token: Option<String>,
}

/// One workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub workflow: String,
    pub status: JobStatus,
    pub current_step: String,
    pub progress: f64,
    pub draft_state: DraftState,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
    pub webhook: WebhookState,
    pub stepper: Vec<StepStatusItem>,
    pub pagination: BTreeMap<String, PaginationMeta>,
    pub undo: UndoState,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Job {
    /// Create a fresh job with all seven steps `not_started`.
    pub fn new(job_id: impl Into<String>, workflow: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            workflow: workflow.into(),
            status: JobStatus::Queued,
            current_step: STEP_NAMES[0].to_string(),
            progress: 0.0,
            draft_state: DraftState::Clean,
            started_at: now,
            updated_at: now,
            completed_at: None,
            idempotency_key: None,
            webhook: WebhookState::default(),
            stepper: STEP_NAMES
                .iter()
                .map(|name| StepStatusItem {
                    name: name.to_string(),
                    status: StepStatus::NotStarted,
                    updated_at: now,
                })
                .collect(),
            pagination: BTreeMap::new(),
            undo: UndoState::default(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Refresh `updated_at`.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Set the tracked status of one step, refreshing its timestamp.
    pub fn set_step_status(&mut self, step: &str, status: StepStatus) {
        let now = Utc::now();
        if let Some(item) = self.stepper.iter_mut().find(|item| item.name == step) {
            item.status = status;
            item.updated_at = now;
        }
        self.updated_at = now;
    }

    /// Advance progress by the fixed per-step increment, capped at 1.0.
    pub fn bump_progress(&mut self) {
        self.progress = (self.progress + PROGRESS_PER_STEP).min(1.0);
    }

    /// Whether this id was issued by this service (vs. a foreign id a
    /// caller made up). Foreign ids are never persisted on lookup.
    pub fn is_local_id(job_id: &str) -> bool {
        job_id.starts_with("wf_")
    }
}

/// Result of looking up a job by id.
///
/// Absence is a value, not an exception: `NotFound` maps to a synthesized
/// failed job at every boundary rather than a 404, so clients distinguish
/// "job failed" from "job absent" only via the payload.
#[derive(Debug, Clone)]
pub enum JobLookup {
    Found(Job),
    NotFound(String),
}

impl JobLookup {
    /// The looked-up job, or a synthesized `failed` job for a missing id.
    pub fn into_job(self) -> Job {
        match self {
            JobLookup::Found(job) => job,
            JobLookup::NotFound(job_id) => {
                let mut job = Job::new(job_id, DEFAULT_WORKFLOW);
                job.status = JobStatus::Failed;
                job.draft_state = DraftState::Failed;
                job
            }
        }
    }
}

/// Output contract of a step executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultSchema {
    /// `"complete"`, `"failed"`, or `"accepted"` for passthrough steps.
    pub status: String,
    pub items: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<serde_json::Value>,
}

impl ResultSchema {
    pub fn complete(items: Vec<serde_json::Value>) -> Self {
        Self {
            status: "complete".to_string(),
            items,
            summary: None,
        }
    }

    pub fn accepted(step: &str) -> Self {
        Self {
            status: "accepted".to_string(),
            items: vec![serde_json::json!({ "step": step, "accepted": true })],
            summary: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_has_all_seven_steps_not_started() {
        let job = Job::new("wf_abc123def456", DEFAULT_WORKFLOW);
        assert_eq!(job.stepper.len(), 7);
        let names: Vec<&str> = job.stepper.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, STEP_NAMES.to_vec());
        assert!(job
            .stepper
            .iter()
            .all(|s| s.status == StepStatus::NotStarted));
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.current_step, "sources");
    }

    #[test]
    fn progress_caps_at_one() {
        let mut job = Job::new("wf_x", DEFAULT_WORKFLOW);
        for _ in 0..20 {
            let before = job.progress;
            job.bump_progress();
            assert!(job.progress >= before);
        }
        assert!((job.progress - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn not_found_lookup_synthesizes_failed_job() {
        let job = JobLookup::NotFound("ghost-42".to_string()).into_job();
        assert_eq!(job.job_id, "ghost-42");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.draft_state, DraftState::Failed);
        assert_eq!(job.stepper.len(), 7);
    }

    #[test]
    fn statuses_serialize_snake_case() {
        assert_eq!(
            serde_json::to_string(&JobStatus::WaitingInput).unwrap(),
            "\"waiting_input\""
        );
        assert_eq!(
            serde_json::to_string(&StepStatus::NotStarted).unwrap(),
            "\"not_started\""
        );
        assert_eq!(
            serde_json::to_string(&DraftState::Saving).unwrap(),
            "\"saving\""
        );
    }
}
