//! # Tracker Harness CLI (`trk`)
//!
//! The `trk` binary submits and inspects background jobs, edits the
//! persisted download settings and starts the HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! trk --config ./config/trk.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `trk init` | Create the SQLite database and run schema migrations |
//! | `trk serve` | Start the HTTP server and the background runner |
//! | `trk submit <type> --params <json>` | Submit a job and follow it to completion |
//! | `trk status <id>` | Show a job's status, result or error, and progress |
//! | `trk progress <id>` | Show a job's progress entries |
//! | `trk list` | List jobs, most recent first |
//! | `trk cancel <id>` | Cancel a job |
//! | `trk settings show` | Print the current settings |
//! | `trk settings set <key>=<value>...` | Update settings |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! trk init --config ./config/trk.toml
//!
//! # Extract links from a collection and wait for the result
//! trk submit extract-links-only --params '{"source":"https://example.org/collections/x"}'
//!
//! # Login download run in this process; password read from stdin
//! trk submit fetch-by-link --params @job.json --secret-stdin < password.txt
//!
//! # Default to PDF and HTML from now on
//! trk settings set file_types=PDF,HTML
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tracker_harness::api::JobApi;
use tracker_harness::config::{self, Config};
use tracker_harness::credentials::secret_from;
use tracker_harness::models::{JobFilter, JobStatus, Page};
use tracker_harness::settings::SettingsPatch;
use tracker_harness::{migrate, server};

/// How often `submit` polls for new progress.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Tracker Harness CLI: run long fetch and download jobs in the background
/// and follow their progress.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/trk.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "trk",
    about = "Tracker Harness: background fetch and download jobs for tracked works",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/trk.toml")]
    config: PathBuf,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and the `jobs`, `job_progress` and
    /// `settings` tables. Safe to run more than once.
    Init,

    /// Start the HTTP server and the background runner.
    ///
    /// Jobs left `running` by a previous process are marked failed;
    /// pending jobs are picked up again.
    Serve,

    /// Submit a job.
    ///
    /// Without `--detach` the job runs in this process and its progress is
    /// streamed until it finishes. Do not combine that with a running
    /// `trk serve` on the same database.
    Submit {
        /// Job type, e.g. `fetch-by-link` or `generate-log-report`.
        job_type: String,

        /// Parameters as JSON, or `@path` to read them from a file.
        #[arg(long, default_value = "{}")]
        params: String,

        /// Read the job's secret (password or API token) from the first
        /// line of stdin.
        ///
        /// Secrets only live in the memory of the process that received
        /// them, so this cannot be combined with `--detach`; send such jobs
        /// to `POST /jobs` on a running `trk serve` instead.
        #[arg(long, conflicts_with = "detach")]
        secret_stdin: bool,

        /// Only queue the job; `trk serve` will run it.
        #[arg(long)]
        detach: bool,
    },

    /// Show a job's status, result or error, and full progress log.
    Status { id: String },

    /// Show progress entries.
    Progress {
        id: String,

        /// Only entries with a sequence number greater than this.
        #[arg(long)]
        after: Option<i64>,
    },

    /// List jobs, most recent first.
    List {
        /// Filter by job type.
        #[arg(long = "type")]
        job_type: Option<String>,

        /// Filter by status (`pending`, `running`, `succeeded`, `failed`).
        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        limit: Option<u32>,

        #[arg(long)]
        offset: Option<u32>,
    },

    /// Cancel a job.
    ///
    /// Pending jobs are cancelled immediately. A job that `trk serve` is
    /// running can only be signalled by that process, so this command
    /// refuses it; use `POST /jobs/{id}/cancel` instead.
    Cancel { id: String },

    /// Show or change the persisted download settings.
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print the current settings as JSON.
    Show,

    /// Update one or more settings, e.g. `debug=true max_retries=3`.
    Set {
        #[arg(required = true, value_parser = parse_key_val)]
        pairs: Vec<(String, String)>,
    },
}

/// Parse a `key=value` pair.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Submit {
            job_type,
            params,
            secret_stdin,
            detach,
        } => {
            run_submit(&cfg, &job_type, &params, secret_stdin, detach).await?;
        }
        Commands::Status { id } => {
            let api = JobApi::from_config(&cfg).await?;
            let view = api.get_job_status(&id).await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Commands::Progress { id, after } => {
            let api = JobApi::from_config(&cfg).await?;
            for entry in api.get_job_progress(&id, after).await? {
                println!(
                    "{:>4}  {}  {}",
                    entry.seq,
                    entry.at.format("%Y-%m-%d %H:%M:%S"),
                    entry.message
                );
            }
        }
        Commands::List {
            job_type,
            status,
            limit,
            offset,
        } => {
            let api = JobApi::from_config(&cfg).await?;
            let filter = JobFilter {
                job_type: job_type.as_deref().map(str::parse).transpose()?,
                status: status.as_deref().map(str::parse).transpose()?,
            };
            let page = api.list_jobs(filter, Page::new(limit, offset)).await?;
            for job in &page.jobs {
                println!(
                    "{}  {:<30}  {:<9}  {}",
                    job.id,
                    job.job_type.as_str(),
                    job.status.as_str(),
                    job.created_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            println!("{} of {} jobs", page.jobs.len(), page.total);
        }
        Commands::Cancel { id } => {
            let api = JobApi::from_config(&cfg).await?;
            if api.cancel_job(&id).await? {
                let view = api.get_job_status(&id).await?;
                println!("Cancellation requested for {} (now {}).", id, view.status);
            } else {
                println!("Job {} already finished.", id);
            }
        }
        Commands::Settings { action } => {
            let api = JobApi::from_config(&cfg).await?;
            match action {
                SettingsAction::Show => {
                    let settings = api.get_settings().await;
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                }
                SettingsAction::Set { pairs } => {
                    let mut patch = SettingsPatch::default();
                    for (key, value) in &pairs {
                        patch.set(key, value)?;
                    }
                    let settings = api.update_settings(patch).await?;
                    println!("{}", serde_json::to_string_pretty(&settings)?);
                }
            }
        }
    }

    Ok(())
}

async fn run_submit(
    cfg: &Config,
    job_type: &str,
    params: &str,
    secret_stdin: bool,
    detach: bool,
) -> Result<()> {
    let raw = match params.strip_prefix('@') {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read parameters from {}", path))?,
        None => params.to_string(),
    };
    let parameters: serde_json::Value =
        serde_json::from_str(&raw).context("--params is not valid JSON")?;

    let secret = if secret_stdin {
        let mut line = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut line)
            .context("Failed to read secret from stdin")?;
        let len = line.trim_end_matches(['\r', '\n']).len();
        line.truncate(len);
        Some(secret_from(line))
    } else {
        None
    };

    let api = JobApi::from_config(cfg).await?;

    if detach {
        let id = api.submit_job(job_type, &parameters, secret).await?;
        println!("{}", id);
        return Ok(());
    }

    api.runner().start().await?;
    let id = api.submit_job(job_type, &parameters, secret).await?;
    eprintln!("Submitted job {}", id);

    let mut last_seq = 0;
    let view = loop {
        for entry in api.get_job_progress(&id, Some(last_seq)).await? {
            eprintln!("[{}] {}", entry.seq, entry.message);
            last_seq = entry.seq;
        }
        let view = api.get_job_status(&id).await?;
        if view.status.is_terminal() && view.progress.len() as i64 <= last_seq {
            break view;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    };
    api.runner().shutdown().await;

    println!("{}", serde_json::to_string_pretty(&view)?);
    if view.status == JobStatus::Failed {
        let reason = view
            .error
            .map(|e| format!("{}: {}", e.kind, e.message))
            .unwrap_or_default();
        bail!("job {} failed ({})", id, reason);
    }
    Ok(())
}
