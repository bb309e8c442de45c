//! The seam between the orchestrator and the external download engine.
//!
//! The runner never talks to the engine directly. It resolves a job's
//! parameters, unseals its secret, and calls exactly one method on an
//! [`Adapter`]. The adapter reports milestones through the
//! [`ProgressReporter`] in its [`AdapterContext`] and returns either a typed
//! result or an error whose message is stored verbatim on the failed job.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │                JobRunner                 │
//! │   params + Option<&SecretString> + ctx   │
//! └──────────────┬───────────────────────────┘
//!                ▼
//!        dispatch() → one Adapter method
//!                │
//!   ┌────────────┴─────────────┐
//!   ▼                          ▼
//! CommandAdapter         UnavailableAdapter
//! (external program)     (nothing configured)
//! ```
//!
//! Retries, backoff and rate limiting are the adapter's own business; the
//! runner only observes the final outcome.

use anyhow::Result;
use async_trait::async_trait;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::{JobOutput, JobType, ProgressUpdate};
use crate::params::{
    ExclusionList, ExtractLinks, FetchBookmarks, FetchByLink, FetchFromList, FetchSavedList,
    FolderScan, JobParams, ReFetchInFormat,
};
use crate::settings::Settings;

// ═══════════════════════════════════════════════════════════════════════
// Context
// ═══════════════════════════════════════════════════════════════════════

/// Non-blocking progress sink handed to adapters.
///
/// Reports go onto an unbounded channel that the runner drains in order, so
/// calling [`report`](ProgressReporter::report) never waits on storage and
/// is safe from inside `spawn_blocking`.
#[derive(Clone)]
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<ProgressUpdate>,
}

impl ProgressReporter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn report(&self, message: impl Into<String>) {
        self.send(ProgressUpdate::text(message));
    }

    pub fn report_with(&self, message: impl Into<String>, data: serde_json::Value) {
        self.send(ProgressUpdate::with_data(message, data));
    }

    pub fn send(&self, update: ProgressUpdate) {
        // The receiver only goes away once the job is finalized.
        let _ = self.tx.send(update);
    }
}

/// Everything an adapter call may use besides its parameters and secret.
#[derive(Clone)]
pub struct AdapterContext {
    pub progress: ProgressReporter,
    /// Settings snapshot taken when the job started.
    pub settings: Settings,
    /// Fired when cancellation was requested. Honouring it is best effort.
    pub cancel: CancellationToken,
}

impl AdapterContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Typed results
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Downloaded {
    pub download_folder: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedLinks {
    pub links: Vec<String>,
    #[serde(default)]
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderUpdate {
    pub folder: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportFile {
    pub file_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExclusionFile {
    pub file_path: String,
    pub count: u64,
}

impl From<Downloaded> for JobOutput {
    fn from(r: Downloaded) -> Self {
        JobOutput::Downloaded {
            download_folder: r.download_folder,
            message: r.message,
        }
    }
}

impl From<ExtractedLinks> for JobOutput {
    fn from(r: ExtractedLinks) -> Self {
        JobOutput::Links {
            links: r.links,
            file_path: r.file_path,
        }
    }
}

impl From<BatchSummary> for JobOutput {
    fn from(r: BatchSummary) -> Self {
        JobOutput::Batch {
            total: r.total,
            successful: r.successful,
            failed: r.failed,
        }
    }
}

impl From<FolderUpdate> for JobOutput {
    fn from(r: FolderUpdate) -> Self {
        JobOutput::Folder {
            folder: r.folder,
            message: r.message,
        }
    }
}

impl From<ReportFile> for JobOutput {
    fn from(r: ReportFile) -> Self {
        JobOutput::Report {
            file_path: r.file_path,
        }
    }
}

impl From<ExclusionFile> for JobOutput {
    fn from(r: ExclusionFile) -> Self {
        JobOutput::ExclusionList {
            file_path: r.file_path,
            count: r.count,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Adapter trait
// ═══════════════════════════════════════════════════════════════════════

/// The external engine, one method per [`JobType`].
///
/// Operations that may log in take `Option<&SecretString>`; operations that
/// always need an account take `&SecretString`; the rest never see a secret.
/// The secret is only valid for the duration of the call.
///
/// Every method has a default body that fails through
/// [`unsupported`](Adapter::unsupported), so an implementation only needs
/// to provide the operations it can perform.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use anyhow::Result;
/// use tracker_harness::adapter::{Adapter, AdapterContext, ReportFile};
///
/// struct LogOnly;
///
/// #[async_trait]
/// impl Adapter for LogOnly {
///     async fn generate_log_report(&self, ctx: &AdapterContext) -> Result<ReportFile> {
///         ctx.progress.report("collecting log entries");
///         Ok(ReportFile { file_path: "/tmp/report.txt".into() })
///     }
/// }
/// ```
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Error returned by operations this adapter does not implement.
    fn unsupported(&self, job_type: JobType) -> anyhow::Error {
        anyhow::anyhow!("{} is not supported by this engine", job_type)
    }

    async fn fetch_by_link(
        &self,
        _params: &FetchByLink,
        _secret: Option<&SecretString>,
        _ctx: &AdapterContext,
    ) -> Result<Downloaded> {
        Err(self.unsupported(JobType::FetchByLink))
    }

    async fn extract_links_only(
        &self,
        _params: &ExtractLinks,
        _secret: Option<&SecretString>,
        _ctx: &AdapterContext,
    ) -> Result<ExtractedLinks> {
        Err(self.unsupported(JobType::ExtractLinksOnly))
    }

    async fn fetch_from_list(
        &self,
        _params: &FetchFromList,
        _secret: Option<&SecretString>,
        _ctx: &AdapterContext,
    ) -> Result<BatchSummary> {
        Err(self.unsupported(JobType::FetchFromList))
    }

    async fn update_incomplete(
        &self,
        _params: &FolderScan,
        _ctx: &AdapterContext,
    ) -> Result<FolderUpdate> {
        Err(self.unsupported(JobType::UpdateIncomplete))
    }

    async fn fetch_missing_from_collection(
        &self,
        _params: &FolderScan,
        _ctx: &AdapterContext,
    ) -> Result<FolderUpdate> {
        Err(self.unsupported(JobType::FetchMissingFromCollection))
    }

    async fn re_fetch_in_format(
        &self,
        _params: &ReFetchInFormat,
        _ctx: &AdapterContext,
    ) -> Result<FolderUpdate> {
        Err(self.unsupported(JobType::ReFetchInFormat))
    }

    async fn fetch_from_saved_list(
        &self,
        _params: &FetchSavedList,
        _secret: &SecretString,
        _ctx: &AdapterContext,
    ) -> Result<Downloaded> {
        Err(self.unsupported(JobType::FetchFromSavedList))
    }

    /// `secret` is the bookmark service API token.
    async fn fetch_from_bookmark_service(
        &self,
        _params: &FetchBookmarks,
        _secret: &SecretString,
        _ctx: &AdapterContext,
    ) -> Result<Downloaded> {
        Err(self.unsupported(JobType::FetchFromBookmarkService))
    }

    async fn generate_log_report(&self, _ctx: &AdapterContext) -> Result<ReportFile> {
        Err(self.unsupported(JobType::GenerateLogReport))
    }

    async fn configure_exclusion_list(
        &self,
        _params: &ExclusionList,
        _ctx: &AdapterContext,
    ) -> Result<ExclusionFile> {
        Err(self.unsupported(JobType::ConfigureExclusionList))
    }
}

/// Adapter used when no engine is configured. Every job fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableAdapter;

impl Adapter for UnavailableAdapter {
    fn unsupported(&self, _job_type: JobType) -> anyhow::Error {
        anyhow::anyhow!("external engine not configured")
    }
}

/// Routes `params` to the matching adapter method.
pub async fn dispatch(
    adapter: &dyn Adapter,
    params: &JobParams,
    secret: Option<&SecretString>,
    ctx: &AdapterContext,
) -> Result<JobOutput> {
    let required = |job_type: JobType| {
        secret.ok_or_else(|| {
            anyhow::anyhow!("{} requires a secret but none was supplied", job_type)
        })
    };

    let output: JobOutput = match params {
        JobParams::FetchByLink(p) => adapter.fetch_by_link(p, secret, ctx).await?.into(),
        JobParams::ExtractLinksOnly(p) => adapter.extract_links_only(p, secret, ctx).await?.into(),
        JobParams::FetchFromList(p) => adapter.fetch_from_list(p, secret, ctx).await?.into(),
        JobParams::UpdateIncomplete(p) => adapter.update_incomplete(p, ctx).await?.into(),
        JobParams::FetchMissingFromCollection(p) => {
            adapter.fetch_missing_from_collection(p, ctx).await?.into()
        }
        JobParams::ReFetchInFormat(p) => adapter.re_fetch_in_format(p, ctx).await?.into(),
        JobParams::FetchFromSavedList(p) => {
            let secret = required(JobType::FetchFromSavedList)?;
            adapter.fetch_from_saved_list(p, secret, ctx).await?.into()
        }
        JobParams::FetchFromBookmarkService(p) => {
            let secret = required(JobType::FetchFromBookmarkService)?;
            adapter.fetch_from_bookmark_service(p, secret, ctx).await?.into()
        }
        JobParams::GenerateLogReport => adapter.generate_log_report(ctx).await?.into(),
        JobParams::ConfigureExclusionList(p) => {
            adapter.configure_exclusion_list(p, ctx).await?.into()
        }
    };
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::secret_from;
    use serde_json::json;

    fn context() -> (AdapterContext, mpsc::UnboundedReceiver<ProgressUpdate>) {
        let (progress, rx) = ProgressReporter::channel();
        (
            AdapterContext {
                progress,
                settings: Settings::default(),
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    struct LinksOnly;

    #[async_trait]
    impl Adapter for LinksOnly {
        async fn extract_links_only(
            &self,
            params: &ExtractLinks,
            _secret: Option<&SecretString>,
            ctx: &AdapterContext,
        ) -> Result<ExtractedLinks> {
            ctx.progress.report_with("page 1", json!({ "found": 1 }));
            Ok(ExtractedLinks {
                links: vec![format!("{}/works/1", params.source)],
                file_path: None,
            })
        }
    }

    #[tokio::test]
    async fn dispatch_routes_to_matching_method() {
        let (ctx, mut rx) = context();
        let params = JobParams::parse(
            JobType::ExtractLinksOnly,
            &json!({ "source": "https://example.org" }),
        )
        .unwrap();

        let out = dispatch(&LinksOnly, &params, None, &ctx).await.unwrap();
        assert_eq!(
            out,
            JobOutput::Links {
                links: vec!["https://example.org/works/1".into()],
                file_path: None,
            }
        );
        let update = rx.recv().await.unwrap();
        assert_eq!(update.message, "page 1");
    }

    #[tokio::test]
    async fn unimplemented_operation_fails() {
        let (ctx, _rx) = context();
        let err = dispatch(&LinksOnly, &JobParams::GenerateLogReport, None, &ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("generate-log-report"));
    }

    #[tokio::test]
    async fn unavailable_adapter_says_so() {
        let (ctx, _rx) = context();
        let err = dispatch(&UnavailableAdapter, &JobParams::GenerateLogReport, None, &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "external engine not configured");
    }

    #[tokio::test]
    async fn required_secret_is_enforced() {
        let (ctx, _rx) = context();
        let params = JobParams::parse(JobType::FetchFromSavedList, &json!({})).unwrap();
        let err = dispatch(&UnavailableAdapter, &params, None, &ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("requires a secret"));

        let secret = secret_from("hunter2".into());
        let err = dispatch(&UnavailableAdapter, &params, Some(&secret), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "external engine not configured");
    }
}
