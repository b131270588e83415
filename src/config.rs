use crate::errors::{AppError, AppResult};
use crate::models::OverlapPolicy;
use clap::{Parser, Subcommand};
use reqwest::Url;
use std::path::PathBuf;
use std::time::Duration;

/// Merge-request metrics: sync GitLab merge events into cumulative counters.
#[derive(Debug, Parser)]
#[command(name = "mr-metrics")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// GitLab personal access token.
    #[arg(long, env = "GITLAB_TOKEN", hide_env_values = true)]
    pub gitlab_token: Option<String>,

    /// GitLab instance URL.
    #[arg(long, env = "GITLAB_HOST_URL", default_value = "https://gitlab.com")]
    pub gitlab_host_url: String,

    /// Comma separated project paths, e.g. `group/api,group/web`.
    #[arg(long = "projects", env = "GITLAB_PROJECT_NAMES", value_delimiter = ',')]
    pub project_names: Vec<String>,

    /// SQLite file holding projects and counters.
    #[arg(long, env = "DATABASE_PATH", default_value = "data/mr-metrics.sqlite")]
    pub database_path: PathBuf,

    #[arg(long, env = "SYNC_INTERVAL_SECS", default_value_t = 3600)]
    pub sync_interval_secs: u64,

    /// How far before the watermark each incremental fetch starts.
    #[arg(long, env = "LOOKBACK_HOURS", default_value_t = 24)]
    pub lookback_hours: i64,

    #[arg(long, env = "HTTP_TIMEOUT_SECS", default_value_t = 15)]
    pub http_timeout_secs: u64,

    #[arg(long, env = "DB_BUSY_TIMEOUT_MS", default_value_t = 5000)]
    pub db_busy_timeout_ms: u64,

    /// `reconcile` or `recompute`.
    #[arg(long, env = "OVERLAP_POLICY", default_value = "reconcile")]
    pub overlap_policy: OverlapPolicy,

    /// Write JSON logs to a daily rolling file in this directory instead of stderr.
    #[arg(long, env = "LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Sync at startup and then on every interval until Ctrl-C.
    Serve,
    /// Run a single sync cycle for every project and exit.
    SyncOnce,
    /// Print the cumulative counts as of a date as JSON.
    Snapshot {
        /// `YYYY-MM-DD`, inclusive; defaults to today (UTC).
        #[arg(long)]
        date: Option<String>,
    },
}

impl Command {
    fn needs_gitlab(&self) -> bool {
        matches!(self, Self::Serve | Self::SyncOnce)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub gitlab_token: String,
    pub gitlab_host_url: String,
    pub project_names: Vec<String>,
    pub database_path: PathBuf,
    pub sync_interval: Duration,
    pub lookback: chrono::Duration,
    pub http_timeout: Duration,
    pub db_busy_timeout: Duration,
    pub overlap_policy: OverlapPolicy,
    pub log_dir: Option<PathBuf>,
}

impl Cli {
    pub fn config(&self) -> AppResult<Config> {
        let mut problems = Vec::new();

        let gitlab_token = self
            .gitlab_token
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        if gitlab_token.is_empty() && self.command.needs_gitlab() {
            problems.push("GITLAB_TOKEN is required".to_string());
        }

        if let Err(err) = Url::parse(&self.gitlab_host_url) {
            problems.push(format!("invalid GITLAB_HOST_URL: {}", err));
        }

        let project_names: Vec<String> = self
            .project_names
            .iter()
            .map(|name| name.trim().trim_matches('/').to_string())
            .filter(|name| !name.is_empty())
            .collect();
        if project_names.is_empty() {
            problems.push("GITLAB_PROJECT_NAMES is required".to_string());
        }

        if self.sync_interval_secs == 0 {
            problems.push("SYNC_INTERVAL_SECS must be greater than zero".to_string());
        }
        if self.lookback_hours < 0 {
            problems.push("LOOKBACK_HOURS cannot be negative".to_string());
        }
        if self.http_timeout_secs == 0 {
            problems.push("HTTP_TIMEOUT_SECS must be greater than zero".to_string());
        }

        if !problems.is_empty() {
            return Err(AppError::Config(format!(
                "configuration errors:\n- {}",
                problems.join("\n- ")
            )));
        }

        Ok(Config {
            gitlab_token,
            gitlab_host_url: self.gitlab_host_url.clone(),
            project_names,
            database_path: self.database_path.clone(),
            sync_interval: Duration::from_secs(self.sync_interval_secs),
            lookback: chrono::Duration::hours(self.lookback_hours),
            http_timeout: Duration::from_secs(self.http_timeout_secs),
            db_busy_timeout: Duration::from_millis(self.db_busy_timeout_ms),
            overlap_policy: self.overlap_policy,
            log_dir: self.log_dir.clone(),
        })
    }
}
