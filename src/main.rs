//! # Caseflow CLI (`caseflow`)
//!
//! Operator entry point for the workflow service.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `caseflow init` | Create the SQLite database and run schema migrations |
//! | `caseflow serve` | Start the HTTP API server |
//! | `caseflow status <job_id>` | Print one job's state as JSON |
//! | `caseflow dlq` | Print dead-lettered webhook deliveries |
//!
//! All commands accept `--config` pointing to a TOML configuration file
//! (default `./config/caseflow.toml`).

mod canonical;
mod config;
mod db;
mod idempotency;
mod migrate;
mod models;
mod server;
mod steps;
mod webhook;
mod workflow;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Caseflow — workflow orchestration for legal document organization.
#[derive(Parser)]
#[command(
    name = "caseflow",
    about = "Caseflow — workflow orchestration core for legal document organization",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/caseflow.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file, all tables, and the immutability
    /// triggers on the canonical artifact store. Idempotent.
    Init,

    /// Start the HTTP API server.
    Serve,

    /// Print one job's state as JSON.
    ///
    /// An unknown id prints a synthesized failed job, matching the HTTP
    /// status contract.
    Status {
        /// Job id (e.g. `wf_ab12cd34ef56`).
        job_id: String,
    },

    /// Print dead-lettered webhook deliveries, one JSON object per line.
    Dlq,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&config).await?;
            println!("initialized {}", config.db.path.display());
        }
        Commands::Serve => {
            server::run_server(&config).await?;
        }
        Commands::Status { job_id } => {
            let pool = db::connect(&config).await?;
            migrate::apply_schema(&pool).await?;
            let job = workflow::load_job(&pool, &job_id).await?.into_job();
            println!("{}", serde_json::to_string_pretty(&job)?);
            pool.close().await;
        }
        Commands::Dlq => {
            let path = &config.webhook.dlq_path;
            if !path.exists() {
                println!("no dead-lettered deliveries ({})", path.display());
                return Ok(());
            }
            let content = std::fs::read_to_string(path)?;
            let count = content.lines().filter(|l| !l.trim().is_empty()).count();
            print!("{}", content);
            println!("{} dead-lettered deliveries", count);
        }
    }

    Ok(())
}
