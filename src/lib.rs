//! # Caseflow
//!
//! Workflow orchestration core for legal document organization.
//!
//! Caseflow tracks document-organization jobs through a fixed seven-step
//! pipeline (`sources → index_extract → summarize → proposals → review →
//! apply → analytics`), stores canonical artifact records immutably with
//! an append-only lineage log, and delivers signed webhook callbacks with
//! bounded retries and a dead-letter log.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────┐   ┌──────────┐
//! │   HTTP   │──▶│  Workflow     │──▶│  SQLite   │
//! │  (axum)  │   │ state machine │   │ jobs+keys │
//! └──────────┘   └──────┬────────┘   └──────────┘
//!                       │
//!          ┌────────────┼────────────┐
//!          ▼            ▼            ▼
//!    ┌──────────┐ ┌──────────┐ ┌──────────┐
//!    │  Step    │ │ Webhook  │ │Canonical │
//!    │executors │ │ delivery │ │  store   │
//!    └──────────┘ └──────────┘ └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! caseflow init                 # create database
//! caseflow serve                # start HTTP server
//! caseflow status wf_ab12cd34ef56
//! caseflow dlq                  # inspect dead-lettered webhook deliveries
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Job aggregate and core value types |
//! | [`workflow`] | Job state machine and persistence |
//! | [`steps`] | Step executors and collaborator contracts |
//! | [`webhook`] | Signed delivery with retries and DLQ |
//! | [`canonical`] | Immutable artifact store and lineage log |
//! | [`idempotency`] | Request replay store |
//! | [`server`] | HTTP API |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod canonical;
pub mod config;
pub mod db;
pub mod idempotency;
pub mod migrate;
pub mod models;
pub mod server;
pub mod steps;
pub mod webhook;
pub mod workflow;
