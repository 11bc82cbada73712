use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub indexer: Option<IndexerConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

/// Webhook delivery knobs. All optional; an empty secret means unsigned.
#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: f64,
    #[serde(default = "default_webhook_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_webhook_backoff_secs")]
    pub backoff_base_secs: f64,
    #[serde(default = "default_true")]
    pub retries_enabled: bool,
    #[serde(default = "default_dlq_path")]
    pub dlq_path: PathBuf,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            timeout_secs: default_webhook_timeout_secs(),
            max_retries: default_webhook_max_retries(),
            backoff_base_secs: default_webhook_backoff_secs(),
            retries_enabled: true,
            dlq_path: default_dlq_path(),
        }
    }
}

impl WebhookConfig {
    /// Effective per-attempt timeout, clamped to a 0.5s floor.
    pub fn effective_timeout_secs(&self) -> f64 {
        self.timeout_secs.max(0.5)
    }
}

fn default_webhook_timeout_secs() -> f64 {
    5.0
}
fn default_webhook_max_retries() -> u32 {
    2
}
fn default_webhook_backoff_secs() -> f64 {
    0.5
}
fn default_true() -> bool {
    true
}
fn default_dlq_path() -> PathBuf {
    PathBuf::from("logs/workflow_webhook_dlq.jsonl")
}

/// Workflow engine policy.
#[derive(Debug, Deserialize, Clone)]
pub struct WorkflowConfig {
    #[serde(default = "default_workflow_name")]
    pub default_workflow: String,
    /// When true, a step may only run after every earlier step in the
    /// fixed sequence is complete. Ordering is advisory by default.
    #[serde(default)]
    pub strict_sequencing: bool,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            default_workflow: default_workflow_name(),
            strict_sequencing: false,
        }
    }
}

fn default_workflow_name() -> String {
    crate::models::DEFAULT_WORKFLOW.to_string()
}

/// Root directory scanned by the built-in file indexer collaborator.
#[derive(Debug, Deserialize, Clone)]
pub struct IndexerConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.server.bind.trim().is_empty() {
        anyhow::bail!("server.bind must not be empty");
    }

    if config.webhook.max_retries > 10 {
        anyhow::bail!("webhook.max_retries must be <= 10");
    }

    if config.webhook.backoff_base_secs < 0.0 {
        anyhow::bail!("webhook.backoff_base_secs must be >= 0");
    }

    if config.workflow.default_workflow.trim().is_empty() {
        anyhow::bail!("workflow.default_workflow must not be empty");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_defaults() {
        let cfg = WebhookConfig::default();
        assert_eq!(cfg.timeout_secs, 5.0);
        assert_eq!(cfg.max_retries, 2);
        assert_eq!(cfg.backoff_base_secs, 0.5);
        assert!(cfg.retries_enabled);
        assert!(cfg.secret.is_empty());
        assert_eq!(
            cfg.dlq_path,
            PathBuf::from("logs/workflow_webhook_dlq.jsonl")
        );
    }

    #[test]
    fn timeout_clamped_to_half_second_floor() {
        let cfg = WebhookConfig {
            timeout_secs: 0.01,
            ..Default::default()
        };
        assert_eq!(cfg.effective_timeout_secs(), 0.5);
    }

    #[test]
    fn minimal_config_parses_with_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [db]
            path = "data/caseflow.sqlite"

            [server]
            bind = "127.0.0.1:8700"
            "#,
        )
        .unwrap();
        assert!(!cfg.workflow.strict_sequencing);
        assert_eq!(cfg.workflow.default_workflow, "memory_first_v2");
        assert!(cfg.indexer.is_none());
    }
}
