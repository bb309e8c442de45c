//! Core data models for jobs and their progress.
//!
//! A [`Job`] is the full durable record. Callers outside the runner only ever
//! see the [`JobView`] and [`JobSummary`] projections, which carry no
//! credential-related fields.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{JobError, JobFailure};

/// The closed set of operations the external engine can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    FetchByLink,
    ExtractLinksOnly,
    FetchFromList,
    UpdateIncomplete,
    FetchMissingFromCollection,
    ReFetchInFormat,
    FetchFromSavedList,
    FetchFromBookmarkService,
    GenerateLogReport,
    ConfigureExclusionList,
}

impl JobType {
    pub const ALL: [JobType; 10] = [
        JobType::FetchByLink,
        JobType::ExtractLinksOnly,
        JobType::FetchFromList,
        JobType::UpdateIncomplete,
        JobType::FetchMissingFromCollection,
        JobType::ReFetchInFormat,
        JobType::FetchFromSavedList,
        JobType::FetchFromBookmarkService,
        JobType::GenerateLogReport,
        JobType::ConfigureExclusionList,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::FetchByLink => "fetch-by-link",
            JobType::ExtractLinksOnly => "extract-links-only",
            JobType::FetchFromList => "fetch-from-list",
            JobType::UpdateIncomplete => "update-incomplete",
            JobType::FetchMissingFromCollection => "fetch-missing-from-collection",
            JobType::ReFetchInFormat => "re-fetch-in-format",
            JobType::FetchFromSavedList => "fetch-from-saved-list",
            JobType::FetchFromBookmarkService => "fetch-from-bookmark-service",
            JobType::GenerateLogReport => "generate-log-report",
            JobType::ConfigureExclusionList => "configure-exclusion-list",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| JobError::validation(format!("unknown job type: '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            other => Err(JobError::validation(format!(
                "unknown job status: '{}'",
                other
            ))),
        }
    }
}

/// Operation-specific output of a succeeded job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobOutput {
    Downloaded {
        download_folder: String,
        message: String,
    },
    Links {
        links: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_path: Option<String>,
    },
    Batch {
        total: u64,
        successful: u64,
        failed: u64,
    },
    Folder {
        folder: String,
        message: String,
    },
    Report {
        file_path: String,
    },
    ExclusionList {
        file_path: String,
        count: u64,
    },
}

/// One milestone reported by an adapter, before it is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub message: String,
    pub data: Option<serde_json::Value>,
}

impl ProgressUpdate {
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            message: message.into(),
            data: Some(data),
        }
    }
}

/// A persisted progress log entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEntry {
    /// 1-based position in the job's log.
    pub seq: i64,
    pub at: DateTime<Utc>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// The full durable record of a job. Owned by the runner.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    pub parameters: serde_json::Value,
    pub status: JobStatus,
    pub has_credential: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<JobOutput>,
    pub error: Option<JobFailure>,
}

/// List row. Carries no parameters, progress or credential flags.
#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            job_type: job.job_type,
            status: job.status,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            error: job.error.clone(),
        }
    }
}

/// Caller-facing status of a single job.
#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub parameters: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<JobOutput>,
    pub error: Option<JobFailure>,
    pub progress: Vec<ProgressEntry>,
}

impl JobView {
    pub fn new(job: Job, progress: Vec<ProgressEntry>) -> Self {
        Self {
            id: job.id,
            job_type: job.job_type,
            status: job.status,
            parameters: job.parameters,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            result: job.result,
            error: job.error,
            progress,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub job_type: Option<JobType>,
    pub status: Option<JobStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

pub const DEFAULT_PAGE_LIMIT: u32 = 50;
pub const MAX_PAGE_LIMIT: u32 = 100;

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

impl Page {
    /// Clamps `limit` into `1..=MAX_PAGE_LIMIT`.
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT),
            offset: offset.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub jobs: Vec<JobSummary>,
    pub total: u64,
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_type_names_match_serde() {
        for t in JobType::ALL {
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
            assert_eq!(t.as_str().parse::<JobType>().unwrap(), t);
        }
    }

    #[test]
    fn unknown_job_type_is_validation_error() {
        let err = "download-everything".parse::<JobType>().unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn page_limit_is_clamped() {
        assert_eq!(Page::new(Some(0), None).limit, 1);
        assert_eq!(Page::new(Some(500), None).limit, MAX_PAGE_LIMIT);
        assert_eq!(Page::new(None, Some(7)), Page { limit: 50, offset: 7 });
    }

    #[test]
    fn output_is_tagged() {
        let out = JobOutput::Links {
            links: vec!["https://example.org/works/1".into()],
            file_path: None,
        };
        let v = serde_json::to_value(&out).unwrap();
        assert_eq!(v["kind"], "links");
        assert!(v.get("file_path").is_none());
    }
}
