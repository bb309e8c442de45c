//! Typed parameter shapes, one per [`JobType`].
//!
//! Submissions arrive as loose JSON. [`JobParams::parse`] turns them into a
//! typed value or a `Validation` error; it is the only gate between a caller
//! and the job table. Optional fields left unset are filled from the
//! persisted settings by [`JobParams::apply_defaults`] right before the
//! adapter call.

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{JobError, JobResult};
use crate::models::JobType;
use crate::settings::Settings;

/// Output formats the external engine can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutputFormat {
    Epub,
    Mobi,
    Pdf,
    Html,
    Azw3,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Epub => "EPUB",
            OutputFormat::Mobi => "MOBI",
            OutputFormat::Pdf => "PDF",
            OutputFormat::Html => "HTML",
            OutputFormat::Azw3 => "AZW3",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "EPUB" => Ok(OutputFormat::Epub),
            "MOBI" => Ok(OutputFormat::Mobi),
            "PDF" => Ok(OutputFormat::Pdf),
            "HTML" => Ok(OutputFormat::Html),
            "AZW3" => Ok(OutputFormat::Azw3),
            other => Err(JobError::validation(format!(
                "unknown output format: '{}'",
                other
            ))),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FetchByLink {
    pub link: String,
    #[serde(default)]
    pub file_types: Option<Vec<OutputFormat>>,
    #[serde(default)]
    pub pages: Option<u32>,
    #[serde(default)]
    pub include_series: bool,
    #[serde(default)]
    pub download_images: bool,
    #[serde(default)]
    pub login: bool,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractLinks {
    #[serde(alias = "link")]
    pub source: String,
    #[serde(default)]
    pub pages: Option<u32>,
    #[serde(default)]
    pub include_series: bool,
    #[serde(default)]
    pub include_metadata: bool,
    #[serde(default)]
    pub login: bool,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FetchFromList {
    /// Newline-separated links.
    pub file_content: String,
    #[serde(default)]
    pub file_types: Option<Vec<OutputFormat>>,
    #[serde(default = "default_true")]
    pub include_series: bool,
    #[serde(default)]
    pub download_images: bool,
    #[serde(default)]
    pub login: bool,
    #[serde(default)]
    pub username: Option<String>,
}

impl FetchFromList {
    pub fn links(&self) -> Vec<&str> {
        self.file_content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect()
    }
}

/// Shared shape for the two folder scans (incomplete works, missing
/// collection entries).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FolderScan {
    pub folder_path: String,
    #[serde(default)]
    pub file_types: Option<Vec<OutputFormat>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReFetchInFormat {
    pub folder_path: String,
    pub source_format: OutputFormat,
    pub target_formats: Vec<OutputFormat>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FetchSavedList {
    #[serde(default = "default_true")]
    pub mark_as_read: bool,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FetchBookmarks {
    #[serde(default = "default_true")]
    pub include_unread: bool,
    /// `YYYY-MM-DD`; only bookmarks saved on or after this date.
    #[serde(default)]
    pub date_from: Option<String>,
    /// Bookmark-service account; defaults to the stored one.
    #[serde(default)]
    pub account: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExclusionList {
    pub links: Vec<String>,
    #[serde(default)]
    pub check_deleted: bool,
}

/// Validated parameters, one variant per job type.
#[derive(Debug, Clone, PartialEq)]
pub enum JobParams {
    FetchByLink(FetchByLink),
    ExtractLinksOnly(ExtractLinks),
    FetchFromList(FetchFromList),
    UpdateIncomplete(FolderScan),
    FetchMissingFromCollection(FolderScan),
    ReFetchInFormat(ReFetchInFormat),
    FetchFromSavedList(FetchSavedList),
    FetchFromBookmarkService(FetchBookmarks),
    GenerateLogReport,
    ConfigureExclusionList(ExclusionList),
}

/// Whether a job type uses a secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretUse {
    Never,
    Optional,
    Required,
}

impl JobParams {
    /// Parses and validates `value` against the shape declared for `job_type`.
    pub fn parse(job_type: JobType, value: &serde_json::Value) -> JobResult<Self> {
        // A missing payload is the same as an empty object.
        let empty = serde_json::Value::Object(Default::default());
        let value = if value.is_null() { &empty } else { value };

        let params = match job_type {
            JobType::FetchByLink => JobParams::FetchByLink(decode(job_type, value)?),
            JobType::ExtractLinksOnly => JobParams::ExtractLinksOnly(decode(job_type, value)?),
            JobType::FetchFromList => JobParams::FetchFromList(decode(job_type, value)?),
            JobType::UpdateIncomplete => JobParams::UpdateIncomplete(decode(job_type, value)?),
            JobType::FetchMissingFromCollection => {
                JobParams::FetchMissingFromCollection(decode(job_type, value)?)
            }
            JobType::ReFetchInFormat => JobParams::ReFetchInFormat(decode(job_type, value)?),
            JobType::FetchFromSavedList => JobParams::FetchFromSavedList(decode(job_type, value)?),
            JobType::FetchFromBookmarkService => {
                JobParams::FetchFromBookmarkService(decode(job_type, value)?)
            }
            JobType::GenerateLogReport => {
                let is_empty = value.as_object().map(|m| m.is_empty()).unwrap_or(false);
                if !is_empty {
                    return Err(JobError::validation(
                        "generate-log-report takes no parameters",
                    ));
                }
                JobParams::GenerateLogReport
            }
            JobType::ConfigureExclusionList => {
                JobParams::ConfigureExclusionList(decode(job_type, value)?)
            }
        };

        params.validate()?;
        Ok(params)
    }

    pub fn job_type(&self) -> JobType {
        match self {
            JobParams::FetchByLink(_) => JobType::FetchByLink,
            JobParams::ExtractLinksOnly(_) => JobType::ExtractLinksOnly,
            JobParams::FetchFromList(_) => JobType::FetchFromList,
            JobParams::UpdateIncomplete(_) => JobType::UpdateIncomplete,
            JobParams::FetchMissingFromCollection(_) => JobType::FetchMissingFromCollection,
            JobParams::ReFetchInFormat(_) => JobType::ReFetchInFormat,
            JobParams::FetchFromSavedList(_) => JobType::FetchFromSavedList,
            JobParams::FetchFromBookmarkService(_) => JobType::FetchFromBookmarkService,
            JobParams::GenerateLogReport => JobType::GenerateLogReport,
            JobParams::ConfigureExclusionList(_) => JobType::ConfigureExclusionList,
        }
    }

    pub fn secret_use(&self) -> SecretUse {
        match self {
            JobParams::FetchByLink(p) if p.login => SecretUse::Required,
            JobParams::ExtractLinksOnly(p) if p.login => SecretUse::Required,
            JobParams::FetchFromList(p) if p.login => SecretUse::Required,
            JobParams::FetchByLink(_)
            | JobParams::ExtractLinksOnly(_)
            | JobParams::FetchFromList(_) => SecretUse::Optional,
            JobParams::FetchFromSavedList(_) | JobParams::FetchFromBookmarkService(_) => {
                SecretUse::Required
            }
            _ => SecretUse::Never,
        }
    }

    /// Checks that a secret was supplied exactly when the job can use one.
    pub fn check_secret(&self, has_secret: bool) -> JobResult<()> {
        match (self.secret_use(), has_secret) {
            (SecretUse::Required, false) => Err(JobError::validation(format!(
                "{} requires a secret",
                self.job_type()
            ))),
            (SecretUse::Never, true) => Err(JobError::validation(format!(
                "{} does not accept a secret",
                self.job_type()
            ))),
            _ => Ok(()),
        }
    }

    fn validate(&self) -> JobResult<()> {
        match self {
            JobParams::FetchByLink(p) => {
                require_link("link", &p.link)?;
                check_pages(p.pages)?;
                check_formats(p.file_types.as_deref())?;
                check_username(p.username.as_deref())
            }
            JobParams::ExtractLinksOnly(p) => {
                require_link("source", &p.source)?;
                check_pages(p.pages)?;
                check_username(p.username.as_deref())
            }
            JobParams::FetchFromList(p) => {
                if p.links().is_empty() {
                    return Err(JobError::validation(
                        "file_content must contain at least one link",
                    ));
                }
                check_formats(p.file_types.as_deref())?;
                check_username(p.username.as_deref())
            }
            JobParams::UpdateIncomplete(p) | JobParams::FetchMissingFromCollection(p) => {
                require_non_empty("folder_path", &p.folder_path)?;
                check_formats(p.file_types.as_deref())
            }
            JobParams::ReFetchInFormat(p) => {
                require_non_empty("folder_path", &p.folder_path)?;
                if p.target_formats.is_empty() {
                    return Err(JobError::validation("target_formats must not be empty"));
                }
                if p.target_formats.iter().all(|f| *f == p.source_format) {
                    return Err(JobError::validation(
                        "target_formats must differ from source_format",
                    ));
                }
                Ok(())
            }
            JobParams::FetchFromSavedList(p) => check_username(p.username.as_deref()),
            JobParams::FetchFromBookmarkService(p) => {
                if let Some(date) = &p.date_from {
                    NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| {
                        JobError::validation(format!(
                            "date_from must be YYYY-MM-DD, got '{}'",
                            date
                        ))
                    })?;
                }
                if let Some(account) = &p.account {
                    require_non_empty("account", account)?;
                }
                Ok(())
            }
            JobParams::GenerateLogReport => Ok(()),
            JobParams::ConfigureExclusionList(p) => {
                if p.links.is_empty() {
                    return Err(JobError::validation("links must not be empty"));
                }
                if p.links.iter().any(|l| l.trim().is_empty()) {
                    return Err(JobError::validation("links must not contain empty entries"));
                }
                Ok(())
            }
        }
    }

    /// Fills overridable values the caller left unset from `settings`.
    pub fn apply_defaults(&mut self, settings: &Settings) {
        let formats = || Some(settings.file_types.clone());
        let username = || {
            Some(settings.account_username.clone()).filter(|u| !u.is_empty())
        };

        match self {
            JobParams::FetchByLink(p) => {
                p.file_types = p.file_types.take().or_else(formats);
                p.username = p.username.take().or_else(username);
            }
            JobParams::ExtractLinksOnly(p) => {
                p.username = p.username.take().or_else(username);
            }
            JobParams::FetchFromList(p) => {
                p.file_types = p.file_types.take().or_else(formats);
                p.username = p.username.take().or_else(username);
            }
            JobParams::UpdateIncomplete(p) | JobParams::FetchMissingFromCollection(p) => {
                p.file_types = p.file_types.take().or_else(formats);
            }
            JobParams::FetchFromSavedList(p) => {
                p.username = p.username.take().or_else(username);
            }
            JobParams::FetchFromBookmarkService(p) => {
                p.account = p.account.take().or_else(|| settings.bookmark_account.clone());
            }
            JobParams::ReFetchInFormat(_)
            | JobParams::GenerateLogReport
            | JobParams::ConfigureExclusionList(_) => {}
        }
    }

    /// The parameters as JSON, as handed to an external program.
    pub fn to_json(&self) -> serde_json::Value {
        let value = match self {
            JobParams::FetchByLink(p) => serde_json::to_value(p),
            JobParams::ExtractLinksOnly(p) => serde_json::to_value(p),
            JobParams::FetchFromList(p) => serde_json::to_value(p),
            JobParams::UpdateIncomplete(p) | JobParams::FetchMissingFromCollection(p) => {
                serde_json::to_value(p)
            }
            JobParams::ReFetchInFormat(p) => serde_json::to_value(p),
            JobParams::FetchFromSavedList(p) => serde_json::to_value(p),
            JobParams::FetchFromBookmarkService(p) => serde_json::to_value(p),
            JobParams::GenerateLogReport => Ok(serde_json::json!({})),
            JobParams::ConfigureExclusionList(p) => serde_json::to_value(p),
        };
        // Plain structs of strings, bools and numbers always serialize.
        value.unwrap_or_else(|_| serde_json::json!({}))
    }
}

fn decode<T: DeserializeOwned>(job_type: JobType, value: &serde_json::Value) -> JobResult<T> {
    T::deserialize(value)
        .map_err(|e| JobError::validation(format!("invalid parameters for {}: {}", job_type, e)))
}

fn require_non_empty(field: &str, value: &str) -> JobResult<()> {
    if value.trim().is_empty() {
        return Err(JobError::validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

fn require_link(field: &str, value: &str) -> JobResult<()> {
    require_non_empty(field, value)?;
    let v = value.trim();
    if !(v.starts_with("http://") || v.starts_with("https://")) {
        return Err(JobError::validation(format!(
            "{} must be an http(s) URL, got '{}'",
            field, v
        )));
    }
    Ok(())
}

fn check_pages(pages: Option<u32>) -> JobResult<()> {
    if pages == Some(0) {
        return Err(JobError::validation("pages must be >= 1 when set"));
    }
    Ok(())
}

fn check_formats(formats: Option<&[OutputFormat]>) -> JobResult<()> {
    if let Some(f) = formats {
        if f.is_empty() {
            return Err(JobError::validation("file_types must not be empty when set"));
        }
    }
    Ok(())
}

fn check_username(username: Option<&str>) -> JobResult<()> {
    if let Some(u) = username {
        require_non_empty("username", u)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_link_is_rejected() {
        let err = JobParams::parse(JobType::FetchByLink, &json!({ "link": "" })).unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
        assert!(err.to_string().contains("link must not be empty"));
    }

    #[test]
    fn extract_links_accepts_source_or_link() {
        let a = JobParams::parse(
            JobType::ExtractLinksOnly,
            &json!({ "source": "https://example.org/collections/x" }),
        )
        .unwrap();
        let b = JobParams::parse(
            JobType::ExtractLinksOnly,
            &json!({ "link": "https://example.org/collections/x" }),
        )
        .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = JobParams::parse(
            JobType::FetchByLink,
            &json!({ "link": "https://example.org/works/1", "password": "hunter2" }),
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn unknown_format_is_rejected() {
        let err = JobParams::parse(
            JobType::UpdateIncomplete,
            &json!({ "folder_path": "/books", "file_types": ["DOCX"] }),
        );
        assert!(err.is_err());
    }

    #[test]
    fn refetch_needs_a_different_target() {
        let err = JobParams::parse(
            JobType::ReFetchInFormat,
            &json!({ "folder_path": "/books", "source_format": "EPUB", "target_formats": ["EPUB"] }),
        )
        .unwrap_err();
        assert!(err.to_string().contains("differ"));
    }

    #[test]
    fn log_report_takes_nothing() {
        assert_eq!(
            JobParams::parse(JobType::GenerateLogReport, &serde_json::Value::Null).unwrap(),
            JobParams::GenerateLogReport
        );
        assert!(JobParams::parse(JobType::GenerateLogReport, &json!({ "x": 1 })).is_err());
    }

    #[test]
    fn bad_bookmark_date_is_rejected() {
        let err = JobParams::parse(
            JobType::FetchFromBookmarkService,
            &json!({ "date_from": "last tuesday" }),
        )
        .unwrap_err();
        assert!(err.to_string().contains("YYYY-MM-DD"));
    }

    #[test]
    fn list_needs_at_least_one_link() {
        assert!(
            JobParams::parse(JobType::FetchFromList, &json!({ "file_content": "\n  \n" })).is_err()
        );
        let p = JobParams::parse(
            JobType::FetchFromList,
            &json!({ "file_content": "https://a\n\nhttps://b\n" }),
        )
        .unwrap();
        match p {
            JobParams::FetchFromList(l) => {
                assert_eq!(l.links(), vec!["https://a", "https://b"]);
                assert!(l.include_series);
            }
            other => panic!("unexpected params: {:?}", other),
        }
    }

    #[test]
    fn secret_rules() {
        let login = JobParams::parse(
            JobType::FetchByLink,
            &json!({ "link": "https://example.org/works/1", "login": true }),
        )
        .unwrap();
        assert!(login.check_secret(false).is_err());
        assert!(login.check_secret(true).is_ok());

        let anon = JobParams::parse(
            JobType::FetchByLink,
            &json!({ "link": "https://example.org/works/1" }),
        )
        .unwrap();
        assert!(anon.check_secret(false).is_ok());

        let saved = JobParams::parse(JobType::FetchFromSavedList, &json!({})).unwrap();
        assert!(saved.check_secret(false).is_err());

        let report = JobParams::GenerateLogReport;
        assert!(report.check_secret(true).is_err());
    }

    #[test]
    fn defaults_come_from_settings() {
        let settings = Settings {
            file_types: vec![OutputFormat::Pdf, OutputFormat::Html],
            account_username: "reader".into(),
            ..Settings::default()
        };

        let mut p = JobParams::parse(
            JobType::FetchByLink,
            &json!({ "link": "https://example.org/works/1" }),
        )
        .unwrap();
        p.apply_defaults(&settings);
        match p {
            JobParams::FetchByLink(f) => {
                assert_eq!(
                    f.file_types,
                    Some(vec![OutputFormat::Pdf, OutputFormat::Html])
                );
                assert_eq!(f.username.as_deref(), Some("reader"));
            }
            other => panic!("unexpected params: {:?}", other),
        }

        let mut explicit = JobParams::parse(
            JobType::UpdateIncomplete,
            &json!({ "folder_path": "/b", "file_types": ["MOBI"] }),
        )
        .unwrap();
        explicit.apply_defaults(&settings);
        match explicit {
            JobParams::UpdateIncomplete(f) => {
                assert_eq!(f.file_types, Some(vec![OutputFormat::Mobi]))
            }
            other => panic!("unexpected params: {:?}", other),
        }
    }
}
