//! In-memory [`JobStore`] implementation for tests and embedding.
//!
//! All state sits behind one `tokio::sync::Mutex`, so every operation is
//! trivially atomic. Nothing survives the process.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{invalid_state, matches_filter, JobStore, INTERRUPTED_MESSAGE, STARTED_MESSAGE};
use crate::error::{ErrorKind, JobError, JobFailure, JobResult};
use crate::models::{
    Job, JobFilter, JobOutput, JobStatus, JobSummary, JobType, Page, ProgressEntry,
    ProgressUpdate,
};

struct StoredJob {
    job: Job,
    progress: Vec<ProgressEntry>,
}

impl StoredJob {
    fn push_progress(&mut self, update: ProgressUpdate) -> ProgressEntry {
        let now = Utc::now();
        let at = match self.progress.last() {
            Some(last) if last.at > now => last.at,
            _ => now,
        };
        let entry = ProgressEntry {
            seq: self.progress.len() as i64 + 1,
            at,
            message: update.message,
            data: update.data,
        };
        self.progress.push(entry.clone());
        entry
    }

    fn require(&self, expected: JobStatus, action: &'static str) -> JobResult<()> {
        if self.job.status != expected {
            return Err(invalid_state(&self.job.id, self.job.status, action));
        }
        Ok(())
    }

    fn finish(&mut self, at: DateTime<Utc>) {
        self.job.finished_at = Some(at);
    }
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, StoredJob>,
    /// Ids in creation order.
    order: Vec<String>,
}

impl Inner {
    fn stored_mut(&mut self, id: &str) -> JobResult<&mut StoredJob> {
        self.jobs
            .get_mut(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }
}

/// In-memory job store.
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(
        &self,
        job_type: JobType,
        parameters: serde_json::Value,
        has_credential: bool,
    ) -> JobResult<Job> {
        let job = Job {
            id: Uuid::new_v4().to_string(),
            job_type,
            parameters,
            status: JobStatus::Pending,
            has_credential,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
        };

        let mut inner = self.inner.lock().await;
        inner.order.push(job.id.clone());
        inner.jobs.insert(
            job.id.clone(),
            StoredJob {
                job: job.clone(),
                progress: Vec::new(),
            },
        );
        Ok(job)
    }

    async fn transition_to_running(&self, id: &str) -> JobResult<Job> {
        let mut inner = self.inner.lock().await;
        let stored = inner.stored_mut(id)?;
        stored.require(JobStatus::Pending, "start")?;
        stored.job.status = JobStatus::Running;
        stored.job.started_at = Some(Utc::now());
        stored.push_progress(ProgressUpdate::text(STARTED_MESSAGE));
        Ok(stored.job.clone())
    }

    async fn append_progress(&self, id: &str, update: ProgressUpdate) -> JobResult<ProgressEntry> {
        let mut inner = self.inner.lock().await;
        let stored = inner.stored_mut(id)?;
        stored.require(JobStatus::Running, "append progress")?;
        Ok(stored.push_progress(update))
    }

    async fn complete(&self, id: &str, result: JobOutput) -> JobResult<()> {
        let mut inner = self.inner.lock().await;
        let stored = inner.stored_mut(id)?;
        stored.require(JobStatus::Running, "complete")?;
        stored.job.status = JobStatus::Succeeded;
        stored.job.result = Some(result);
        stored.finish(Utc::now());
        Ok(())
    }

    async fn fail(&self, id: &str, failure: JobFailure) -> JobResult<()> {
        let mut inner = self.inner.lock().await;
        let stored = inner.stored_mut(id)?;
        stored.require(JobStatus::Running, "fail")?;
        stored.job.status = JobStatus::Failed;
        stored.job.error = Some(failure);
        stored.finish(Utc::now());
        Ok(())
    }

    async fn get(&self, id: &str) -> JobResult<Job> {
        let inner = self.inner.lock().await;
        inner
            .jobs
            .get(id)
            .map(|s| s.job.clone())
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    async fn progress(&self, id: &str, after_seq: Option<i64>) -> JobResult<Vec<ProgressEntry>> {
        let inner = self.inner.lock().await;
        let stored = inner
            .jobs
            .get(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        let after = after_seq.unwrap_or(0);
        Ok(stored
            .progress
            .iter()
            .filter(|e| e.seq > after)
            .cloned()
            .collect())
    }

    async fn list(&self, filter: JobFilter, page: Page) -> JobResult<Vec<JobSummary>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .order
            .iter()
            .rev()
            .filter_map(|id| inner.jobs.get(id))
            .filter(|s| matches_filter(&s.job, &filter))
            .skip(page.offset as usize)
            .take(page.limit as usize)
            .map(|s| JobSummary::from(&s.job))
            .collect())
    }

    async fn count(&self, filter: JobFilter) -> JobResult<u64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .filter(|s| matches_filter(&s.job, &filter))
            .count() as u64)
    }

    async fn pending_ids(&self) -> JobResult<Vec<String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .order
            .iter()
            .filter(|id| {
                inner
                    .jobs
                    .get(id.as_str())
                    .is_some_and(|s| s.job.status == JobStatus::Pending)
            })
            .cloned()
            .collect())
    }

    async fn reconcile_interrupted(&self) -> JobResult<Vec<String>> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();
        let mut ids = Vec::new();
        for id in inner.order.clone() {
            if let Some(stored) = inner.jobs.get_mut(&id) {
                if stored.job.status == JobStatus::Running {
                    stored.job.status = JobStatus::Failed;
                    stored.job.error =
                        Some(JobFailure::new(ErrorKind::Interrupted, INTERRUPTED_MESSAGE));
                    stored.finish(now);
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }
}
