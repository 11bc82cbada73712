//! Step executors and their external collaborators.
//!
//! Each workflow step name maps to a [`StepExecutor`] registered in an
//! [`ExecutorRegistry`]; the workflow engine dispatches by name and never
//! hard-codes step behavior. Collaborators ([`FileIndexer`],
//! [`OrganizationService`]) are trait objects — their internals (LLM
//! calls, real file moves) live outside this crate, and tests substitute
//! in-memory doubles.
//!
//! | Step | Behavior |
//! |------|----------|
//! | `index_extract` | Delegates to the file indexer, summarizes counts |
//! | `summarize` | Aggregates extension/folder counts into a summary artifact |
//! | `proposals` | Asks the organization service to generate proposals |
//! | `sources`, `review`, `apply`, `analytics` | Passthrough "accepted" placeholders |

use anyhow::{bail, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use walkdir::WalkDir;

use crate::config::IndexerConfig;
use crate::models::ResultSchema;

// ─── Collaborator contracts ─────────────────────────────────────────

/// Scan mode accepted by the file indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexMode {
    Auto,
    Watched,
    Refresh,
}

impl IndexMode {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "auto" => Ok(Self::Auto),
            "watched" => Ok(Self::Watched),
            "refresh" => Ok(Self::Refresh),
            other => bail!("invalid index mode: '{}'. Must be auto, watched, or refresh", other),
        }
    }
}

/// Counters reported by one indexing pass.
#[derive(Debug, Clone, Serialize)]
pub struct IndexReport {
    pub indexed: u64,
    pub scanned: u64,
    pub errors: u64,
    pub success: bool,
}

/// One file known to the indexer.
#[derive(Debug, Clone, Serialize)]
pub struct IndexedFile {
    pub path: String,
    pub extension: String,
    pub size_bytes: i64,
}

/// Feedback a human left on a proposal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub action: String,
    pub success: bool,
}

/// One file-organization proposal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalRecord {
    pub id: String,
    pub source_path: String,
    pub destination_folder: String,
    pub rationale: String,
    pub status: String,
    #[serde(default)]
    pub feedback: Vec<FeedbackRecord>,
}

/// External file-indexing collaborator.
#[async_trait]
pub trait FileIndexer: Send + Sync {
    /// Run an indexing pass and report counts.
    async fn index(&self, mode: IndexMode) -> Result<IndexReport>;

    /// Up to `limit` files from the last indexing pass.
    async fn indexed_files(&self, limit: usize) -> Result<Vec<IndexedFile>>;
}

/// External organization/proposal collaborator.
#[async_trait]
pub trait OrganizationService: Send + Sync {
    /// Generate up to `limit` new proposals from candidate files.
    async fn generate_proposals(&self, limit: usize) -> Result<Vec<ProposalRecord>>;

    /// Up to `limit` existing proposals.
    async fn list_proposals(&self, limit: usize) -> Result<Vec<ProposalRecord>>;
}

/// Collaborator bundle handed to every executor invocation.
#[derive(Clone)]
pub struct StepContext {
    pub indexer: Arc<dyn FileIndexer>,
    pub organizer: Arc<dyn OrganizationService>,
}

// ─── Draft-state derivation ─────────────────────────────────────────

/// Derive the draft-state label for a proposal item.
///
/// This is a priority-ordered decision list — first match wins, the
/// branches are not independent flags.
pub fn derive_proposal_draft_state(proposal: &ProposalRecord) -> &'static str {
    if proposal.status == "applied" {
        return "clean";
    }
    if proposal.feedback.iter().any(|f| f.action == "edit") {
        return "human_edited";
    }
    if proposal.feedback.iter().any(|f| f.action == "reject") {
        return "dirty";
    }
    if proposal.feedback.iter().any(|f| f.success) {
        return "saving";
    }
    if proposal.rationale.contains("user edited") {
        return "human_edited";
    }
    if proposal.status == "approved" {
        return "dirty";
    }
    "auto"
}

// ─── Executor contract and registry ─────────────────────────────────

/// One pluggable step implementation.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// The step name this executor handles (one of the fixed seven).
    fn name(&self) -> &str;

    /// Run the step against the request payload and collaborators.
    async fn execute(&self, payload: Value, ctx: &StepContext) -> Result<ResultSchema>;
}

/// Registry mapping step name → executor.
pub struct ExecutorRegistry {
    executors: Vec<Box<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            executors: Vec::new(),
        }
    }

    /// A registry pre-loaded with one executor per fixed step name.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(PassthroughStep::new("sources")));
        registry.register(Box::new(IndexExtractStep));
        registry.register(Box::new(SummarizeStep));
        registry.register(Box::new(ProposalsStep));
        registry.register(Box::new(PassthroughStep::new("review")));
        registry.register(Box::new(PassthroughStep::new("apply")));
        registry.register(Box::new(PassthroughStep::new("analytics")));
        registry
    }

    pub fn register(&mut self, executor: Box<dyn StepExecutor>) {
        self.executors.push(executor);
    }

    pub fn find(&self, name: &str) -> Option<&dyn StepExecutor> {
        self.executors
            .iter()
            .find(|e| e.name() == name)
            .map(|e| e.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Built-in executors ─────────────────────────────────────────────

/// Placeholder executor for steps with no business logic yet. Kept as a
/// registry entry so the step remains an extension point.
pub struct PassthroughStep {
    name: &'static str,
}

impl PassthroughStep {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

#[async_trait]
impl StepExecutor for PassthroughStep {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(&self, _payload: Value, _ctx: &StepContext) -> Result<ResultSchema> {
        Ok(ResultSchema::accepted(self.name))
    }
}

/// `index_extract`: run an indexing pass and summarize the counts.
pub struct IndexExtractStep;

#[async_trait]
impl StepExecutor for IndexExtractStep {
    fn name(&self) -> &str {
        "index_extract"
    }

    async fn execute(&self, payload: Value, ctx: &StepContext) -> Result<ResultSchema> {
        let mode = IndexMode::parse(payload["mode"].as_str().unwrap_or("auto"))?;
        let report = ctx.indexer.index(mode).await?;

        let mut result = ResultSchema::complete(vec![json!({
            "mode": mode,
            "indexed": report.indexed,
            "scanned": report.scanned,
            "errors": report.errors,
        })]);
        if !report.success {
            result.status = "failed".to_string();
        }
        Ok(result)
    }
}

/// `summarize`: aggregate indexed files and proposals into a summary
/// artifact. Deterministic given identical collaborator state (BTreeMap
/// aggregation, stable file ordering from the indexer).
pub struct SummarizeStep;

#[async_trait]
impl StepExecutor for SummarizeStep {
    fn name(&self) -> &str {
        "summarize"
    }

    async fn execute(&self, payload: Value, ctx: &StepContext) -> Result<ResultSchema> {
        let limit = payload["limit"].as_u64().unwrap_or(50) as usize;
        let files = ctx.indexer.indexed_files(limit).await?;
        let proposals = ctx.organizer.list_proposals(limit.max(50)).await?;

        let mut naming_conventions: BTreeMap<String, u64> = BTreeMap::new();
        for file in &files {
            *naming_conventions.entry(file.extension.clone()).or_insert(0) += 1;
        }

        let mut folder_structure: BTreeMap<String, u64> = BTreeMap::new();
        for proposal in &proposals {
            *folder_structure
                .entry(proposal.destination_folder.clone())
                .or_insert(0) += 1;
        }

        let examples: Vec<&str> = files.iter().take(25).map(|f| f.path.as_str()).collect();

        let artifact = json!({
            "naming_conventions": naming_conventions,
            "folder_structure": folder_structure,
            "examples": examples,
            "source_counts": {
                "indexed_files": files.len(),
                "proposals": proposals.len(),
            },
        });

        let mut result = ResultSchema::complete(vec![artifact.clone()]);
        result.summary = Some(artifact);
        Ok(result)
    }
}

/// `proposals`: delegate proposal generation to the organization service
/// and report what it created, one item per proposal with its derived
/// draft state attached.
pub struct ProposalsStep;

#[async_trait]
impl StepExecutor for ProposalsStep {
    fn name(&self) -> &str {
        "proposals"
    }

    async fn execute(&self, payload: Value, ctx: &StepContext) -> Result<ResultSchema> {
        let limit = payload["limit"].as_u64().unwrap_or(10) as usize;
        let created = ctx.organizer.generate_proposals(limit).await?;

        let items: Vec<Value> = created
            .iter()
            .map(|p| {
                json!({
                    "proposal": p,
                    "draft_state": derive_proposal_draft_state(p),
                })
            })
            .collect();

        let mut result = ResultSchema::complete(items);
        result.summary = Some(json!({ "created": created.len() }));
        Ok(result)
    }
}

// ─── Production collaborators ───────────────────────────────────────

/// File indexer backed by a filesystem walk of the configured root.
pub struct LocalFileIndexer {
    config: IndexerConfig,
    files: Mutex<Vec<IndexedFile>>,
}

impl LocalFileIndexer {
    pub fn new(config: IndexerConfig) -> Self {
        Self {
            config,
            files: Mutex::new(Vec::new()),
        }
    }

    fn scan(&self) -> Result<(Vec<IndexedFile>, u64, u64)> {
        let root = &self.config.root;
        if !root.exists() {
            bail!("indexer root does not exist: {}", root.display());
        }

        let include_set = build_globset(&self.config.include_globs)?;

        let mut default_excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        default_excludes.extend(self.config.exclude_globs.clone());
        let exclude_set = build_globset(&default_excludes)?;

        let mut files = Vec::new();
        let mut scanned = 0u64;
        let mut errors = 0u64;

        let walker = WalkDir::new(root).follow_links(self.config.follow_symlinks);
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => {
                    errors += 1;
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            scanned += 1;

            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().to_string();

            if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
                continue;
            }

            let extension = path
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            let size_bytes = entry.metadata().map(|m| m.len() as i64).unwrap_or(0);

            files.push(IndexedFile {
                path: rel_str,
                extension,
                size_bytes,
            });
        }

        // Sort for deterministic ordering
        files.sort_by(|a, b| a.path.cmp(&b.path));

        Ok((files, scanned, errors))
    }
}

#[async_trait]
impl FileIndexer for LocalFileIndexer {
    async fn index(&self, _mode: IndexMode) -> Result<IndexReport> {
        match self.scan() {
            Ok((files, scanned, errors)) => {
                let indexed = files.len() as u64;
                *self.files.lock().expect("indexer lock poisoned") = files;
                Ok(IndexReport {
                    indexed,
                    scanned,
                    errors,
                    success: true,
                })
            }
            Err(e) => {
                eprintln!("Warning: indexing pass failed: {}", e);
                Ok(IndexReport {
                    indexed: 0,
                    scanned: 0,
                    errors: 1,
                    success: false,
                })
            }
        }
    }

    async fn indexed_files(&self, limit: usize) -> Result<Vec<IndexedFile>> {
        {
            let files = self.files.lock().expect("indexer lock poisoned");
            if !files.is_empty() {
                return Ok(files.iter().take(limit).cloned().collect());
            }
        }
        // No pass has run yet; scan on demand.
        let (files, _, _) = self.scan()?;
        *self.files.lock().expect("indexer lock poisoned") = files.clone();
        Ok(files.into_iter().take(limit).collect())
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Organization service that proposes a destination folder per file type.
/// Deterministic; proposals accumulate in memory until applied externally.
pub struct FolderOrganizer {
    indexer: Arc<dyn FileIndexer>,
    proposals: Mutex<Vec<ProposalRecord>>,
}

impl FolderOrganizer {
    pub fn new(indexer: Arc<dyn FileIndexer>) -> Self {
        Self {
            indexer,
            proposals: Mutex::new(Vec::new()),
        }
    }

    fn destination_for(extension: &str) -> &'static str {
        match extension {
            "pdf" => "Filings",
            "doc" | "docx" | "odt" => "Drafts",
            "msg" | "eml" => "Correspondence",
            "xls" | "xlsx" | "csv" => "Exhibits",
            "png" | "jpg" | "jpeg" | "tiff" => "Evidence",
            _ => "Unsorted",
        }
    }
}

#[async_trait]
impl OrganizationService for FolderOrganizer {
    async fn generate_proposals(&self, limit: usize) -> Result<Vec<ProposalRecord>> {
        let files = self.indexer.indexed_files(limit).await?;

        let created: Vec<ProposalRecord> = files
            .iter()
            .map(|file| ProposalRecord {
                id: uuid::Uuid::new_v4().to_string(),
                source_path: file.path.clone(),
                destination_folder: Self::destination_for(&file.extension).to_string(),
                rationale: format!("grouped by file type '{}'", file.extension),
                status: "proposed".to_string(),
                feedback: Vec::new(),
            })
            .collect();

        self.proposals
            .lock()
            .expect("organizer lock poisoned")
            .extend(created.clone());

        Ok(created)
    }

    async fn list_proposals(&self, limit: usize) -> Result<Vec<ProposalRecord>> {
        let proposals = self.proposals.lock().expect("organizer lock poisoned");
        Ok(proposals.iter().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proposal(status: &str, rationale: &str, feedback: Vec<FeedbackRecord>) -> ProposalRecord {
        ProposalRecord {
            id: "p1".to_string(),
            source_path: "a.pdf".to_string(),
            destination_folder: "Filings".to_string(),
            rationale: rationale.to_string(),
            status: status.to_string(),
            feedback,
        }
    }

    #[test]
    fn applied_wins_over_everything() {
        let p = proposal(
            "applied",
            "user edited",
            vec![FeedbackRecord {
                action: "reject".to_string(),
                success: true,
            }],
        );
        assert_eq!(derive_proposal_draft_state(&p), "clean");
    }

    #[test]
    fn edit_feedback_beats_reject() {
        let p = proposal(
            "proposed",
            "",
            vec![
                FeedbackRecord {
                    action: "reject".to_string(),
                    success: false,
                },
                FeedbackRecord {
                    action: "edit".to_string(),
                    success: false,
                },
            ],
        );
        assert_eq!(derive_proposal_draft_state(&p), "human_edited");
    }

    #[test]
    fn reject_feedback_is_dirty() {
        let p = proposal(
            "proposed",
            "",
            vec![FeedbackRecord {
                action: "reject".to_string(),
                success: false,
            }],
        );
        assert_eq!(derive_proposal_draft_state(&p), "dirty");
    }

    #[test]
    fn successful_action_is_saving() {
        let p = proposal(
            "proposed",
            "",
            vec![FeedbackRecord {
                action: "move".to_string(),
                success: true,
            }],
        );
        assert_eq!(derive_proposal_draft_state(&p), "saving");
    }

    #[test]
    fn user_edited_rationale_is_human_edited() {
        let p = proposal("proposed", "destination was user edited", vec![]);
        assert_eq!(derive_proposal_draft_state(&p), "human_edited");
    }

    #[test]
    fn approved_without_feedback_is_dirty() {
        let p = proposal("approved", "", vec![]);
        assert_eq!(derive_proposal_draft_state(&p), "dirty");
    }

    #[test]
    fn default_is_auto() {
        let p = proposal("proposed", "", vec![]);
        assert_eq!(derive_proposal_draft_state(&p), "auto");
    }

    #[test]
    fn index_mode_parse_rejects_unknown() {
        assert_eq!(IndexMode::parse("auto").unwrap(), IndexMode::Auto);
        assert_eq!(IndexMode::parse("watched").unwrap(), IndexMode::Watched);
        assert_eq!(IndexMode::parse("refresh").unwrap(), IndexMode::Refresh);
        assert!(IndexMode::parse("full").is_err());
    }

    #[test]
    fn registry_covers_all_seven_steps() {
        let registry = ExecutorRegistry::with_builtins();
        assert_eq!(registry.len(), 7);
        for name in crate::models::STEP_NAMES {
            assert!(registry.find(name).is_some(), "missing executor: {}", name);
        }
    }
}
