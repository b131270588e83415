use crate::errors::{AppError, AppResult};
use std::path::Path;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn init_tracing(log_dir: Option<&Path>) -> AppResult<()> {
    match log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir).map_err(|error| AppError::Io(error.to_string()))?;
            let file_appender = tracing_appender::rolling::daily(log_dir, "mr-metrics.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = LOG_GUARD.set(guard);

            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .json()
                .with_writer(non_blocking)
                .try_init()
                .map_err(|error| AppError::Internal(error.to_string()))
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|error| AppError::Internal(error.to_string())),
    }
}
