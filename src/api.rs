//! The job API facade.
//!
//! [`JobApi`] is the only surface the HTTP server and the CLI talk to. Reads
//! go straight to the store; `submit_job`, `cancel_job` and
//! `update_settings` are the only mutating entry points. Nothing returned
//! from here carries secret material.

use anyhow::Context;
use secrecy::SecretString;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::adapter::{Adapter, UnavailableAdapter};
use crate::adapter_command::CommandAdapter;
use crate::config::Config;
use crate::credentials::CredentialGuard;
use crate::error::JobResult;
use crate::models::{JobFilter, JobPage, JobType, JobView, Page, ProgressEntry};
use crate::runner::JobRunner;
use crate::settings::{Settings, SettingsPatch, SettingsStore};
use crate::store::{JobStore, SqliteJobStore};
use crate::{db, migrate};

#[derive(Clone)]
pub struct JobApi {
    runner: Arc<JobRunner>,
}

impl JobApi {
    pub fn new(runner: Arc<JobRunner>) -> Self {
        Self { runner }
    }

    /// Wires the SQLite store, persisted settings, credential guard and the
    /// configured adapter into a runner. The runner is not started.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config)
            .await
            .with_context(|| format!("failed to open database {}", config.db.path.display()))?;
        migrate::apply(&pool).await?;

        let settings = SettingsStore::load(pool.clone())
            .await
            .context("failed to load settings")?;
        let store = SqliteJobStore::new(pool);
        let guard = CredentialGuard::from_env(&config.credentials.key_env);

        let adapter: Arc<dyn Adapter> = match CommandAdapter::from_config(&config.adapter) {
            Some(adapter) => {
                info!(program = %adapter.program().display(), "using command adapter");
                Arc::new(adapter)
            }
            None => Arc::new(UnavailableAdapter),
        };

        let runner = JobRunner::new(
            Arc::new(store),
            Arc::new(settings),
            adapter,
            Arc::new(guard),
            config.runner.workers,
        );
        Ok(Self::new(runner))
    }

    pub fn runner(&self) -> &Arc<JobRunner> {
        &self.runner
    }

    fn store(&self) -> &Arc<dyn JobStore> {
        self.runner.store()
    }

    /// Validates and queues a job. Returns the new job id.
    ///
    /// An unknown `job_type` or a parameter mismatch fails with
    /// `Validation` and creates nothing.
    pub async fn submit_job(
        &self,
        job_type: &str,
        parameters: &Value,
        secret: Option<SecretString>,
    ) -> JobResult<String> {
        let job_type: JobType = job_type.parse()?;
        let job = self.runner.submit(job_type, parameters, secret).await?;
        Ok(job.id)
    }

    pub async fn get_job_status(&self, id: &str) -> JobResult<JobView> {
        let job = self.store().get(id).await?;
        let progress = self.store().progress(id, None).await?;
        Ok(JobView::new(job, progress))
    }

    /// Progress entries, optionally only those after sequence number `after`.
    pub async fn get_job_progress(
        &self,
        id: &str,
        after: Option<i64>,
    ) -> JobResult<Vec<ProgressEntry>> {
        self.store().progress(id, after).await
    }

    pub async fn list_jobs(&self, filter: JobFilter, page: Page) -> JobResult<JobPage> {
        let jobs = self.store().list(filter, page).await?;
        let total = self.store().count(filter).await?;
        Ok(JobPage { jobs, total })
    }

    pub async fn cancel_job(&self, id: &str) -> JobResult<bool> {
        self.runner.cancel(id).await
    }

    pub async fn get_settings(&self) -> Settings {
        self.runner.settings().get().await
    }

    pub async fn update_settings(&self, patch: SettingsPatch) -> JobResult<Settings> {
        let settings = self.runner.settings().update(patch).await?;
        info!(debug = settings.debug, "settings updated");
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobError;
    use crate::models::JobStatus;
    use crate::store::InMemoryJobStore;
    use serde_json::json;

    fn api() -> JobApi {
        JobApi::new(JobRunner::new(
            Arc::new(InMemoryJobStore::new()),
            Arc::new(SettingsStore::in_memory(Settings::default())),
            Arc::new(UnavailableAdapter),
            Arc::new(CredentialGuard::from_master_key("test")),
            1,
        ))
    }

    #[tokio::test]
    async fn unknown_type_creates_nothing() {
        let api = api();
        let err = api
            .submit_job("download-everything", &json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
        let page = api
            .list_jobs(JobFilter::default(), Page::default())
            .await
            .unwrap();
        assert_eq!(page.total, 0);
        assert!(page.jobs.is_empty());
    }

    #[tokio::test]
    async fn status_view_hides_credential_flag() {
        let api = api();
        let id = api
            .submit_job(
                "fetch-from-saved-list",
                &json!({}),
                Some(crate::credentials::secret_from("hunter2".into())),
            )
            .await
            .unwrap();

        let view = api.get_job_status(&id).await.unwrap();
        assert_eq!(view.status, JobStatus::Pending);
        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("has_credential"));
    }

    #[tokio::test]
    async fn missing_job_is_not_found() {
        let api = api();
        assert!(matches!(
            api.get_job_status("nope").await,
            Err(JobError::NotFound(_))
        ));
        assert!(matches!(
            api.cancel_job("nope").await,
            Err(JobError::NotFound(_))
        ));
    }
}
