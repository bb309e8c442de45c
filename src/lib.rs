//! # Tracker Harness
//!
//! A local-first job orchestrator for long-running fetch, download and
//! conversion tasks against tracked works.
//!
//! Requests are validated and recorded at once; the work itself runs in the
//! background through an external engine, with status and progress kept
//! durably in SQLite so callers can poll them. Secrets needed by some jobs
//! are sealed in memory for the lifetime of that one job and never stored.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐
//! │   CLI    │   │   HTTP   │
//! │  (trk)   │   │  (axum)  │
//! └────┬─────┘   └────┬─────┘
//!      └──────┬───────┘
//!             ▼
//!        ┌─────────┐     ┌────────────┐
//!        │ JobApi  │────▶│  Settings  │
//!        └────┬────┘     └────────────┘
//!             ▼
//!       ┌───────────┐    ┌────────────┐
//!       │ JobRunner │───▶│ Credential │
//!       │ (N slots) │    │   Guard    │
//!       └──┬─────┬──┘    └────────────┘
//!          │     ▼
//!          │  ┌─────────┐
//!          │  │ Adapter │──▶ external engine
//!          │  └─────────┘
//!          ▼
//!     ┌──────────┐
//!     │ JobStore │  SQLite / in-memory
//!     └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! trk init                                   # create database
//! trk serve                                  # HTTP API + background runner
//! trk submit extract-links-only --params '{"source":"https://example.org/collections/x"}'
//! trk list --status running
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Job records, statuses, results, progress |
//! | [`params`] | Typed parameter shapes per job type |
//! | [`error`] | Error types and failure classification |
//! | [`credentials`] | Sealing and unsealing per-job secrets |
//! | [`settings`] | Persisted download settings |
//! | [`store`] | Job record storage (SQLite, in-memory) |
//! | [`adapter`] | External engine interface |
//! | [`adapter_command`] | Engine backed by an external program |
//! | [`runner`] | Scheduling and the job state machine |
//! | [`api`] | Job API facade |
//! | [`server`] | HTTP server |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod adapter;
pub mod adapter_command;
pub mod api;
pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod migrate;
pub mod models;
pub mod params;
pub mod runner;
pub mod server;
pub mod settings;
pub mod store;
