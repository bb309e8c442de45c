//! Persisted, process-wide download settings.
//!
//! One [`SettingsStore`] exists per process and is handed to the runner and
//! the facade at construction. Reads return a snapshot; [`SettingsStore::update`]
//! merges a partial patch and replaces the whole object under a single lock,
//! persisting it as one row so a reader never observes a half-applied update.

use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;

use crate::error::{JobError, JobResult};
use crate::models::now_ms;
use crate::params::OutputFormat;

const SETTINGS_ROW: &str = "downloader";

/// Upper bound for `extra_wait_secs`.
pub const MAX_EXTRA_WAIT_SECS: u32 = 600;
/// Upper bound for `max_retries`.
pub const MAX_RETRIES: u32 = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Where the engine writes downloaded files.
    pub output_dir: String,
    /// Formats used when a job does not name its own.
    pub file_types: Vec<OutputFormat>,
    /// Account name on the target site. Not a secret.
    pub account_username: String,
    /// Account name on the bookmark service. Not a secret.
    pub bookmark_account: Option<String>,
    pub debug: bool,
    /// Extra delay the engine adds between requests.
    pub extra_wait_secs: u32,
    /// Retries the engine may attempt internally.
    pub max_retries: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            output_dir: "./downloads".to_string(),
            file_types: vec![OutputFormat::Epub],
            account_username: String::new(),
            bookmark_account: None,
            debug: false,
            extra_wait_secs: 0,
            max_retries: 0,
        }
    }
}

/// A partial update. Absent fields keep their current value; an empty
/// `bookmark_account` clears it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsPatch {
    pub output_dir: Option<String>,
    pub file_types: Option<Vec<OutputFormat>>,
    pub account_username: Option<String>,
    pub bookmark_account: Option<String>,
    pub debug: Option<bool>,
    pub extra_wait_secs: Option<u32>,
    pub max_retries: Option<u32>,
}

impl SettingsPatch {
    pub fn is_empty(&self) -> bool {
        self == &SettingsPatch::default()
    }

    /// Sets one field from a `key` / string `value` pair, as typed on a
    /// command line.
    pub fn set(&mut self, key: &str, value: &str) -> JobResult<()> {
        let bad = |what: &str| {
            JobError::validation(format!("{} expects {}, got '{}'", key, what, value))
        };
        match key {
            "output_dir" => self.output_dir = Some(value.to_string()),
            "file_types" => {
                let formats = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::parse)
                    .collect::<JobResult<Vec<OutputFormat>>>()?;
                self.file_types = Some(formats);
            }
            "account_username" => self.account_username = Some(value.to_string()),
            "bookmark_account" => self.bookmark_account = Some(value.to_string()),
            "debug" => self.debug = Some(value.parse().map_err(|_| bad("true or false"))?),
            "extra_wait_secs" => {
                self.extra_wait_secs = Some(value.parse().map_err(|_| bad("a number"))?)
            }
            "max_retries" => self.max_retries = Some(value.parse().map_err(|_| bad("a number"))?),
            other => {
                return Err(JobError::validation(format!(
                    "unknown setting: '{}'",
                    other
                )))
            }
        }
        Ok(())
    }
}

impl Settings {
    /// Returns a copy with `patch` merged in, or a validation error.
    pub fn merged(&self, patch: SettingsPatch) -> JobResult<Settings> {
        let mut next = self.clone();
        if let Some(v) = patch.output_dir {
            next.output_dir = v;
        }
        if let Some(v) = patch.file_types {
            next.file_types = v;
        }
        if let Some(v) = patch.account_username {
            next.account_username = v.trim().to_string();
        }
        if let Some(v) = patch.bookmark_account {
            let v = v.trim();
            next.bookmark_account = if v.is_empty() { None } else { Some(v.to_string()) };
        }
        if let Some(v) = patch.debug {
            next.debug = v;
        }
        if let Some(v) = patch.extra_wait_secs {
            next.extra_wait_secs = v;
        }
        if let Some(v) = patch.max_retries {
            next.max_retries = v;
        }
        next.validate()?;
        Ok(next)
    }

    fn validate(&self) -> JobResult<()> {
        if self.output_dir.trim().is_empty() {
            return Err(JobError::validation("output_dir must not be empty"));
        }
        if self.file_types.is_empty() {
            return Err(JobError::validation("file_types must not be empty"));
        }
        if self.extra_wait_secs > MAX_EXTRA_WAIT_SECS {
            return Err(JobError::validation(format!(
                "extra_wait_secs must be <= {}",
                MAX_EXTRA_WAIT_SECS
            )));
        }
        if self.max_retries > MAX_RETRIES {
            return Err(JobError::validation(format!(
                "max_retries must be <= {}",
                MAX_RETRIES
            )));
        }
        Ok(())
    }
}

pub struct SettingsStore {
    current: RwLock<Settings>,
    pool: Option<SqlitePool>,
}

impl SettingsStore {
    /// Loads settings from the database, falling back to defaults when no
    /// row has been written yet.
    pub async fn load(pool: SqlitePool) -> JobResult<Self> {
        let row = sqlx::query("SELECT value_json FROM settings WHERE name = ?")
            .bind(SETTINGS_ROW)
            .fetch_optional(&pool)
            .await?;

        let current = match row {
            Some(row) => {
                let json: String = row.get("value_json");
                serde_json::from_str(&json)?
            }
            None => Settings::default(),
        };

        Ok(Self {
            current: RwLock::new(current),
            pool: Some(pool),
        })
    }

    /// Settings that live only as long as this value. Used by tests and
    /// embedders that bring their own persistence.
    pub fn in_memory(initial: Settings) -> Self {
        Self {
            current: RwLock::new(initial),
            pool: None,
        }
    }

    pub async fn get(&self) -> Settings {
        self.current.read().await.clone()
    }

    /// Merges `patch` into the current settings and persists the result.
    pub async fn update(&self, patch: SettingsPatch) -> JobResult<Settings> {
        let mut current = self.current.write().await;
        let next = current.merged(patch)?;

        if let Some(pool) = &self.pool {
            sqlx::query(
                r#"
                INSERT INTO settings (name, value_json, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(name) DO UPDATE SET
                    value_json = excluded.value_json,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(SETTINGS_ROW)
            .bind(serde_json::to_string(&next)?)
            .bind(now_ms())
            .execute(pool)
            .await?;
        }

        *current = next.clone();
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn debug_only_patch_keeps_other_fields() {
        let initial = Settings {
            output_dir: "/srv/books".into(),
            file_types: vec![OutputFormat::Azw3],
            account_username: "reader".into(),
            bookmark_account: Some("pins".into()),
            debug: false,
            extra_wait_secs: 3,
            max_retries: 2,
        };
        let store = SettingsStore::in_memory(initial.clone());

        let updated = store
            .update(SettingsPatch {
                debug: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(updated.debug);
        assert_eq!(
            Settings {
                debug: false,
                ..updated
            },
            initial
        );
    }

    #[tokio::test]
    async fn invalid_patch_leaves_settings_untouched() {
        let store = SettingsStore::in_memory(Settings::default());
        let err = store
            .update(SettingsPatch {
                file_types: Some(vec![]),
                debug: Some(true),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
        assert_eq!(store.get().await, Settings::default());
    }

    #[test]
    fn empty_bookmark_account_clears_it() {
        let s = Settings {
            bookmark_account: Some("pins".into()),
            ..Settings::default()
        };
        let next = s
            .merged(SettingsPatch {
                bookmark_account: Some("  ".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(next.bookmark_account, None);
    }

    #[test]
    fn patch_from_key_value() {
        let mut patch = SettingsPatch::default();
        patch.set("debug", "true").unwrap();
        patch.set("file_types", "epub, pdf").unwrap();
        patch.set("max_retries", "3").unwrap();
        assert_eq!(patch.debug, Some(true));
        assert_eq!(
            patch.file_types,
            Some(vec![OutputFormat::Epub, OutputFormat::Pdf])
        );
        assert_eq!(patch.max_retries, Some(3));
        assert!(patch.set("password", "x").is_err());
        assert!(patch.set("debug", "maybe").is_err());
    }

    #[test]
    fn patch_rejects_unknown_json_keys() {
        let parsed: Result<SettingsPatch, _> =
            serde_json::from_value(serde_json::json!({ "password": "hunter2" }));
        assert!(parsed.is_err());
    }
}
