use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{AggregatedStats, CounterSnapshot};
use chrono::NaiveDate;
use std::collections::BTreeSet;
use std::sync::Arc;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

pub fn short_project_name(full_name: &str) -> &str {
    full_name.rsplit('/').next().unwrap_or(full_name)
}

pub fn aggregate(snapshot: &CounterSnapshot) -> AggregatedStats {
    let mut stats = AggregatedStats {
        date: snapshot.as_of.format(DATE_FORMAT).to_string(),
        ..AggregatedStats::default()
    };

    let mut projects: BTreeSet<String> = BTreeSet::new();
    for full_name in &snapshot.projects {
        let short = short_project_name(full_name).to_string();
        stats.project_totals.entry(short.clone()).or_insert(0);
        projects.insert(short);
    }

    for count in &snapshot.counts {
        let short = short_project_name(&count.project_name).to_string();
        *stats
            .developers
            .entry(count.username.clone())
            .or_default()
            .entry(short.clone())
            .or_insert(0) += count.cumulative_count;
        *stats
            .developer_totals
            .entry(count.username.clone())
            .or_insert(0) += count.cumulative_count;
        *stats.project_totals.entry(short.clone()).or_insert(0) += count.cumulative_count;
        projects.insert(short);
    }

    stats.projects = projects.into_iter().collect();
    stats
}

pub fn parse_as_of(raw: Option<&str>, today: NaiveDate) -> AppResult<NaiveDate> {
    match raw.map(str::trim).filter(|value| !value.is_empty()) {
        None => Ok(today),
        Some(value) => NaiveDate::parse_from_str(value, DATE_FORMAT)
            .map_err(|err| AppError::Query(format!("invalid date '{}': {}", value, err))),
    }
}

#[derive(Clone)]
pub struct StatsService {
    store: Arc<Database>,
}

impl StatsService {
    pub fn new(store: Arc<Database>) -> Self {
        Self { store }
    }

    pub async fn get_snapshot(&self, project_names: Vec<String>, as_of: NaiveDate) -> AppResult<AggregatedStats> {
        let store = self.store.clone();
        let snapshot = tokio::task::spawn_blocking(move || store.snapshot(&project_names, as_of))
            .await
            .map_err(|err| AppError::Query(format!("snapshot task failed: {}", err)))?
            .map_err(|err| {
                tracing::warn!(error = %err, as_of = %as_of, "snapshot read failed");
                err
            })?;
        Ok(aggregate(&snapshot))
    }
}
