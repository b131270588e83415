pub mod config;
pub mod cumulative;
pub mod db;
pub mod errors;
pub mod gitlab;
pub mod logging;
pub mod models;
pub mod stats;
pub mod sync;

use crate::config::Config;
use crate::db::Database;
use crate::errors::AppResult;
use crate::gitlab::GitLabClient;
use crate::models::AggregatedStats;
use crate::stats::{parse_as_of, StatsService};
use crate::sync::{CycleOutcome, SyncOrchestrator};
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub fn open_store(config: &Config) -> AppResult<Arc<Database>> {
    let store = Database::open(&config.database_path, config.db_busy_timeout, config.overlap_policy)?;
    Ok(Arc::new(store))
}

pub fn build_orchestrator(config: &Config, store: Arc<Database>) -> AppResult<SyncOrchestrator> {
    let client = GitLabClient::new(&config.gitlab_host_url, config.gitlab_token.clone(), config.http_timeout)?;
    Ok(SyncOrchestrator::new(
        store,
        Arc::new(client),
        config.project_names.clone(),
        config.sync_interval,
    )
    .with_lookback(config.lookback))
}

pub async fn serve(config: &Config, shutdown: CancellationToken) -> AppResult<()> {
    let store = open_store(config)?;
    tracing::info!(
        database = %store.path().display(),
        projects = ?config.project_names,
        policy = store.overlap_policy().as_str(),
        "starting mr-metrics"
    );
    build_orchestrator(config, store)?.run(shutdown).await;
    Ok(())
}

pub async fn sync_once(config: &Config) -> AppResult<Vec<(String, CycleOutcome)>> {
    let store = open_store(config)?;
    Ok(build_orchestrator(config, store)?.sync_once().await)
}

pub async fn snapshot(config: &Config, date: Option<&str>) -> AppResult<AggregatedStats> {
    let as_of = parse_as_of(date, Utc::now().date_naive())?;
    let service = StatsService::new(open_store(config)?);
    service.get_snapshot(config.project_names.clone(), as_of).await
}
