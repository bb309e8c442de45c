//! Job record storage.
//!
//! The [`JobStore`] trait is the passive persistence surface the runner
//! drives. Callers never mutate it directly; they go through the
//! [`JobApi`](crate::api::JobApi).
//!
//! Every mutation is atomic for a single job id and enforces the lifecycle
//! `pending → running → {succeeded, failed}`:
//!
//! | Method | Allowed from | Otherwise |
//! |--------|--------------|-----------|
//! | [`transition_to_running`](JobStore::transition_to_running) | `pending` | `InvalidState` |
//! | [`append_progress`](JobStore::append_progress) | `running` | `InvalidState` |
//! | [`complete`](JobStore::complete) | `running` | `InvalidState` |
//! | [`fail`](JobStore::fail) | `running` | `InvalidState` |
//!
//! Unknown ids yield `NotFound`.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::{JobError, JobFailure, JobResult};
use crate::models::{
    Job, JobFilter, JobOutput, JobStatus, JobSummary, JobType, Page, ProgressEntry,
    ProgressUpdate,
};

pub use memory::InMemoryJobStore;
pub use sqlite::SqliteJobStore;

/// Message of the entry written by the `pending → running` transition.
pub const STARTED_MESSAGE: &str = "job started";

/// Message stored on jobs failed by the startup scan.
pub const INTERRUPTED_MESSAGE: &str = "process restarted while the job was running";

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts a new `pending` job.
    async fn create(
        &self,
        job_type: JobType,
        parameters: serde_json::Value,
        has_credential: bool,
    ) -> JobResult<Job>;

    /// Moves a `pending` job to `running`, stamps `started_at` and appends
    /// the first progress entry.
    async fn transition_to_running(&self, id: &str) -> JobResult<Job>;

    /// Appends one entry to a `running` job's log. Entries get consecutive
    /// `seq` numbers and never-decreasing timestamps.
    async fn append_progress(&self, id: &str, update: ProgressUpdate) -> JobResult<ProgressEntry>;

    async fn complete(&self, id: &str, result: JobOutput) -> JobResult<()>;

    async fn fail(&self, id: &str, failure: JobFailure) -> JobResult<()>;

    async fn get(&self, id: &str) -> JobResult<Job>;

    /// Progress entries in append order, optionally only those after `after_seq`.
    async fn progress(&self, id: &str, after_seq: Option<i64>) -> JobResult<Vec<ProgressEntry>>;

    /// Summaries matching `filter`, most recent first.
    async fn list(&self, filter: JobFilter, page: Page) -> JobResult<Vec<JobSummary>>;

    async fn count(&self, filter: JobFilter) -> JobResult<u64>;

    /// Ids of `pending` jobs, oldest first.
    async fn pending_ids(&self) -> JobResult<Vec<String>>;

    /// Fails every job still marked `running` with kind `Interrupted`.
    /// Returns the affected ids.
    async fn reconcile_interrupted(&self) -> JobResult<Vec<String>>;
}

pub(crate) fn invalid_state(id: &str, status: JobStatus, action: &'static str) -> JobError {
    JobError::InvalidState {
        id: id.to_string(),
        status: status.to_string(),
        action,
    }
}

pub(crate) fn matches_filter(job: &Job, filter: &JobFilter) -> bool {
    filter.job_type.map_or(true, |t| t == job.job_type)
        && filter.status.map_or(true, |s| s == job.status)
}
