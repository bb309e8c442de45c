//! Adapter that drives an external program.
//!
//! Each job runs one process:
//!
//! ```text
//! <program> [args...] <operation>      e.g. `fetcher --quiet fetch-by-link`
//! ```
//!
//! # Protocol
//!
//! - **stdin**: the resolved parameters as a single JSON object, then EOF.
//! - **environment**: `TRK_OUTPUT_DIR`, `TRK_FILE_TYPES`, `TRK_DEBUG`,
//!   `TRK_EXTRA_WAIT`, `TRK_MAX_RETRIES` from the settings snapshot, and
//!   `TRK_SECRET` when the job carries a credential. `TRK_SECRET` is removed
//!   from the inherited environment otherwise.
//! - **stdout**: one line per event. A JSON object with a `result` key is the
//!   operation's result. A JSON object with a `progress` key (and optional
//!   `data`) is a progress entry. Any other non-empty line is a plain-text
//!   progress entry.
//! - **exit status**: non-zero fails the job with the tail of stderr.
//!
//! When the job's cancellation token fires, the process is killed.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::adapter::{
    Adapter, AdapterContext, BatchSummary, Downloaded, ExclusionFile, ExtractedLinks,
    FolderUpdate, ReportFile,
};
use crate::config::AdapterConfig;
use crate::credentials::redact;
use crate::models::{JobType, ProgressUpdate};
use crate::params::{
    ExclusionList, ExtractLinks, FetchBookmarks, FetchByLink, FetchFromList, FetchSavedList,
    FolderScan, ReFetchInFormat,
};

/// Bytes of stderr kept for the failure message.
const STDERR_TAIL: usize = 2000;

#[derive(Debug, Clone)]
pub struct CommandAdapter {
    program: PathBuf,
    args: Vec<String>,
}

/// One parsed stdout line.
#[derive(Debug, PartialEq)]
enum Line {
    Progress(ProgressUpdate),
    Result(serde_json::Value),
    Blank,
}

impl CommandAdapter {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Builds a command adapter from `[adapter]`, or `None` when no program
    /// is configured.
    pub fn from_config(config: &AdapterConfig) -> Option<Self> {
        config
            .program
            .as_ref()
            .map(|program| Self::new(program, config.args.clone()))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    async fn run<P, T>(
        &self,
        job_type: JobType,
        params: &P,
        secret: Option<&SecretString>,
        ctx: &AdapterContext,
    ) -> Result<T>
    where
        P: Serialize + Sync,
        T: DeserializeOwned,
    {
        let settings = &ctx.settings;
        let file_types = settings
            .file_types
            .iter()
            .map(|f| f.as_str())
            .collect::<Vec<_>>()
            .join(",");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(job_type.as_str())
            .env("TRK_OUTPUT_DIR", &settings.output_dir)
            .env("TRK_FILE_TYPES", file_types)
            .env("TRK_DEBUG", settings.debug.to_string())
            .env("TRK_EXTRA_WAIT", settings.extra_wait_secs.to_string())
            .env("TRK_MAX_RETRIES", settings.max_retries.to_string())
            .env_remove("TRK_SECRET")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(secret) = secret {
            cmd.env("TRK_SECRET", secret.expose_secret());
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to start {}", self.program.display()))?;

        let payload = serde_json::to_vec(params)?;
        let mut stdin = child.stdin.take().context("child stdin was not captured")?;
        let writer = tokio::spawn(async move {
            // A program that ignores its input may close stdin early.
            let _ = stdin.write_all(&payload).await;
            let _ = stdin.shutdown().await;
        });

        let mut stderr = child.stderr.take().context("child stderr was not captured")?;
        let stderr_reader = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            buf
        });

        let stdout = child.stdout.take().context("child stdout was not captured")?;
        let mut lines = BufReader::new(stdout).lines();
        let mut result = None;

        loop {
            tokio::select! {
                _ = ctx.cancel.cancelled() => {
                    let _ = child.kill().await;
                    bail!("{} was cancelled", job_type);
                }
                line = lines.next_line() => {
                    let Some(line) = line.context("failed to read engine output")? else {
                        break;
                    };
                    match parse_line(&line) {
                        Line::Progress(update) => ctx.progress.send(update),
                        Line::Result(value) => result = Some(value),
                        Line::Blank => {}
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                let _ = child.kill().await;
                bail!("{} was cancelled", job_type);
            }
            status = child.wait() => status.context("failed to wait for engine")?,
        };
        let _ = writer.await;
        let stderr = stderr_reader.await.unwrap_or_default();

        if !status.success() {
            let tail = redact(&stderr_tail(&stderr), secret);
            if tail.is_empty() {
                bail!("{} exited with {}", job_type, status);
            }
            bail!("{} exited with {}: {}", job_type, status, tail);
        }

        let value = result
            .with_context(|| format!("{} finished without reporting a result", job_type))?;
        serde_json::from_value(value)
            .with_context(|| format!("{} reported a malformed result", job_type))
    }
}

fn parse_line(line: &str) -> Line {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Line::Blank;
    }

    if trimmed.starts_with('{') {
        if let Ok(serde_json::Value::Object(mut obj)) = serde_json::from_str(trimmed) {
            if let Some(result) = obj.remove("result") {
                return Line::Result(result);
            }
            if let Some(serde_json::Value::String(message)) = obj.remove("progress") {
                return Line::Progress(ProgressUpdate {
                    message,
                    data: obj.remove("data"),
                });
            }
        }
    }

    Line::Progress(ProgressUpdate::text(trimmed))
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_TAIL {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_TAIL;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

#[async_trait]
impl Adapter for CommandAdapter {
    async fn fetch_by_link(
        &self,
        params: &FetchByLink,
        secret: Option<&SecretString>,
        ctx: &AdapterContext,
    ) -> Result<Downloaded> {
        self.run(JobType::FetchByLink, params, secret, ctx).await
    }

    async fn extract_links_only(
        &self,
        params: &ExtractLinks,
        secret: Option<&SecretString>,
        ctx: &AdapterContext,
    ) -> Result<ExtractedLinks> {
        self.run(JobType::ExtractLinksOnly, params, secret, ctx).await
    }

    async fn fetch_from_list(
        &self,
        params: &FetchFromList,
        secret: Option<&SecretString>,
        ctx: &AdapterContext,
    ) -> Result<BatchSummary> {
        self.run(JobType::FetchFromList, params, secret, ctx).await
    }

    async fn update_incomplete(
        &self,
        params: &FolderScan,
        ctx: &AdapterContext,
    ) -> Result<FolderUpdate> {
        self.run(JobType::UpdateIncomplete, params, None, ctx).await
    }

    async fn fetch_missing_from_collection(
        &self,
        params: &FolderScan,
        ctx: &AdapterContext,
    ) -> Result<FolderUpdate> {
        self.run(JobType::FetchMissingFromCollection, params, None, ctx)
            .await
    }

    async fn re_fetch_in_format(
        &self,
        params: &ReFetchInFormat,
        ctx: &AdapterContext,
    ) -> Result<FolderUpdate> {
        self.run(JobType::ReFetchInFormat, params, None, ctx).await
    }

    async fn fetch_from_saved_list(
        &self,
        params: &FetchSavedList,
        secret: &SecretString,
        ctx: &AdapterContext,
    ) -> Result<Downloaded> {
        self.run(JobType::FetchFromSavedList, params, Some(secret), ctx)
            .await
    }

    async fn fetch_from_bookmark_service(
        &self,
        params: &FetchBookmarks,
        secret: &SecretString,
        ctx: &AdapterContext,
    ) -> Result<Downloaded> {
        self.run(JobType::FetchFromBookmarkService, params, Some(secret), ctx)
            .await
    }

    async fn generate_log_report(&self, ctx: &AdapterContext) -> Result<ReportFile> {
        self.run(JobType::GenerateLogReport, &serde_json::json!({}), None, ctx)
            .await
    }

    async fn configure_exclusion_list(
        &self,
        params: &ExclusionList,
        ctx: &AdapterContext,
    ) -> Result<ExclusionFile> {
        self.run(JobType::ConfigureExclusionList, params, None, ctx)
            .await
    }
}
