//! TOML configuration parsing.
//!
//! The configuration file holds deployment concerns only: where the database
//! lives, how many jobs may run at once, where the credential key comes from,
//! and which external program performs the actual work. User-facing download
//! preferences live in the persisted [`Settings`](crate::settings::Settings)
//! instead, so they can be changed at runtime.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub adapter: AdapterConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunnerConfig {
    /// Number of jobs allowed in `running` at the same time.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

fn default_workers() -> usize {
    2
}

pub const MAX_WORKERS: usize = 16;

#[derive(Debug, Deserialize, Clone)]
pub struct CredentialsConfig {
    /// Environment variable holding the master key for the credential guard.
    #[serde(default = "default_key_env")]
    pub key_env: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            key_env: default_key_env(),
        }
    }
}

fn default_key_env() -> String {
    "TRK_ENCRYPTION_KEY".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AdapterConfig {
    /// External engine executable. When unset every job fails with
    /// "external engine not configured".
    #[serde(default)]
    pub program: Option<PathBuf>,
    /// Extra arguments placed before the operation name.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Config {
    /// Configuration with only a database path, everything else defaulted.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            server: ServerConfig::default(),
            runner: RunnerConfig::default(),
            credentials: CredentialsConfig::default(),
            adapter: AdapterConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.runner.workers == 0 || config.runner.workers > MAX_WORKERS {
        anyhow::bail!("runner.workers must be in [1, {}]", MAX_WORKERS);
    }

    if config.credentials.key_env.trim().is_empty() {
        anyhow::bail!("credentials.key_env must not be empty");
    }

    if let Some(program) = &config.adapter.program {
        if program.as_os_str().is_empty() {
            anyhow::bail!("adapter.program must not be empty when set");
        }
    }

    Ok(())
}
