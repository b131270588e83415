use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::gitlab::EventSource;
use crate::models::{FetchedBatch, MergeSummary};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(3600);

pub fn default_lookback() -> chrono::Duration {
    chrono::Duration::days(1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Merged { project_id: i64, events: usize, samples: usize },
    FetchFailed(String),
    MergeFailed(String),
    WatermarkFailed(String),
    /// A previous cycle for the same project was still running.
    Skipped,
}

/// Where the next fetch for a project starts.
///
/// Never-synced projects fetch their whole history; otherwise the watermark is
/// pushed back by `lookback` so late events near it are picked up again.
pub fn fetch_since(watermark: Option<DateTime<Utc>>, lookback: chrono::Duration) -> DateTime<Utc> {
    match watermark {
        None => DateTime::<Utc>::UNIX_EPOCH,
        Some(last) => (last - lookback).max(DateTime::<Utc>::UNIX_EPOCH),
    }
}

#[derive(Clone)]
pub struct SyncOrchestrator {
    store: Arc<Database>,
    source: Arc<dyn EventSource>,
    projects: Arc<Vec<String>>,
    interval: Duration,
    lookback: chrono::Duration,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl SyncOrchestrator {
    pub fn new(store: Arc<Database>, source: Arc<dyn EventSource>, projects: Vec<String>, interval: Duration) -> Self {
        Self {
            store,
            source,
            projects: Arc::new(projects),
            interval,
            lookback: default_lookback(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn with_lookback(mut self, lookback: chrono::Duration) -> Self {
        self.lookback = lookback;
        self
    }

    pub fn projects(&self) -> &[String] {
        &self.projects
    }

    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            projects = self.projects.len(),
            interval_secs = self.interval.as_secs(),
            "sync loop started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles: JoinSet<(String, CycleOutcome)> = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!("shutdown requested, no further sync cycles will start");
                    break;
                }
                _ = ticker.tick() => {
                    self.spawn_cycles(&mut cycles);
                }
                Some(joined) = cycles.join_next(), if !cycles.is_empty() => {
                    log_joined(joined);
                }
            }
        }

        while let Some(joined) = cycles.join_next().await {
            log_joined(joined);
        }
        tracing::info!("sync loop stopped");
    }

    pub async fn sync_once(&self) -> Vec<(String, CycleOutcome)> {
        let mut cycles = JoinSet::new();
        self.spawn_cycles(&mut cycles);

        let mut outcomes = Vec::with_capacity(self.projects.len());
        while let Some(joined) = cycles.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => tracing::error!(error = %err, "sync cycle task failed"),
            }
        }
        outcomes.sort_by_key(|(project, _)| {
            self.projects
                .iter()
                .position(|configured| configured == project)
                .unwrap_or(usize::MAX)
        });
        outcomes
    }

    fn spawn_cycles(&self, cycles: &mut JoinSet<(String, CycleOutcome)>) {
        for project in self.projects.iter() {
            let orchestrator = self.clone();
            let project = project.clone();
            cycles.spawn(async move {
                let outcome = orchestrator.sync_project(&project).await;
                (project, outcome)
            });
        }
    }

    pub async fn sync_project(&self, project: &str) -> CycleOutcome {
        if !self.try_claim(project).await {
            tracing::debug!(project, "previous sync still running, skipping this tick");
            return CycleOutcome::Skipped;
        }
        let outcome = self.run_cycle(project).await;
        self.release(project).await;
        outcome
    }

    async fn run_cycle(&self, project: &str) -> CycleOutcome {
        let watermark = match self.read_watermark(project).await {
            Ok(watermark) => watermark,
            Err(err) => {
                tracing::warn!(project, error = %err, "failed to read sync watermark");
                return CycleOutcome::WatermarkFailed(err.to_string());
            }
        };

        let since = fetch_since(watermark, self.lookback);
        if watermark.is_none() {
            tracing::info!(project, "project never synced, fetching full history");
        }

        let batch = match self.source.fetch_events(project, since).await {
            Ok(batch) => batch,
            Err(err) => {
                tracing::warn!(project, since = %since, error = %err, "fetch failed, skipping project this cycle");
                return CycleOutcome::FetchFailed(err.to_string());
            }
        };

        let events = batch.events.len();
        let project_id = batch.project_id;
        match self.merge(project, batch).await {
            Ok(summary) => {
                tracing::info!(
                    project,
                    project_id,
                    events,
                    samples = summary.samples_written,
                    "project synced"
                );
                CycleOutcome::Merged {
                    project_id,
                    events,
                    samples: summary.samples_written,
                }
            }
            Err(err) => {
                tracing::error!(project, project_id, error = %err, "merge failed, watermark not advanced");
                CycleOutcome::MergeFailed(err.to_string())
            }
        }
    }

    async fn read_watermark(&self, project: &str) -> AppResult<Option<DateTime<Utc>>> {
        let store = self.store.clone();
        let project = project.to_string();
        tokio::task::spawn_blocking(move || store.last_synced_at(&project))
            .await
            .map_err(|err| AppError::Internal(format!("watermark task failed: {}", err)))?
    }

    async fn merge(&self, project: &str, batch: FetchedBatch) -> AppResult<MergeSummary> {
        let store = self.store.clone();
        let project = project.to_string();
        tokio::task::spawn_blocking(move || store.merge_events(batch.project_id, &project, &batch.events))
            .await
            .map_err(|err| AppError::Merge(format!("merge task failed: {}", err)))?
    }

    async fn try_claim(&self, project: &str) -> bool {
        let mut in_flight = self.in_flight.lock().await;
        in_flight.insert(project.to_string())
    }

    async fn release(&self, project: &str) {
        let mut in_flight = self.in_flight.lock().await;
        in_flight.remove(project);
    }
}

fn log_joined(joined: Result<(String, CycleOutcome), tokio::task::JoinError>) {
    match joined {
        Ok((project, CycleOutcome::Skipped)) => tracing::debug!(project = %project, "sync cycle skipped"),
        Ok(_) => {}
        Err(err) => tracing::error!(error = %err, "sync cycle task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::{fetch_since, CycleOutcome, SyncOrchestrator};
    use crate::db::Database;
    use crate::errors::{AppError, AppResult};
    use crate::gitlab::EventSource;
    use crate::models::{FetchedBatch, MergeEvent};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct ScriptedSource {
        batches: HashMap<String, FetchedBatch>,
        failing: Vec<String>,
        calls: Mutex<Vec<(String, DateTime<Utc>)>>,
    }

    impl ScriptedSource {
        fn with_batch(mut self, project: &str, project_id: i64, events: Vec<MergeEvent>) -> Self {
            self.batches
                .insert(project.to_string(), FetchedBatch { project_id, events });
            self
        }

        fn failing_for(mut self, project: &str) -> Self {
            self.failing.push(project.to_string());
            self
        }

        fn calls(&self) -> Vec<(String, DateTime<Utc>)> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn fetch_events(&self, project: &str, since: DateTime<Utc>) -> AppResult<FetchedBatch> {
            self.calls
                .lock()
                .expect("calls lock")
                .push((project.to_string(), since));
            if self.failing.iter().any(|name| name == project) {
                return Err(AppError::Fetch("GitLab API returned 502 Bad Gateway".to_string()));
            }
            self.batches
                .get(project)
                .cloned()
                .ok_or_else(|| AppError::Fetch(format!("no script for {}", project)))
        }
    }

    fn merged_at(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, d, 12, 0, 0).single().expect("timestamp")
    }

    fn store(dir: &tempfile::TempDir) -> Arc<Database> {
        Arc::new(Database::new(&dir.path().join("sync.sqlite")).expect("db"))
    }

    fn orchestrator(store: Arc<Database>, source: Arc<ScriptedSource>, projects: &[&str]) -> SyncOrchestrator {
        SyncOrchestrator::new(
            store,
            source,
            projects.iter().map(|name| name.to_string()).collect(),
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn fetch_window_starts_at_epoch_or_one_lookback_before_the_watermark() {
        let lookback = chrono::Duration::days(1);
        assert_eq!(fetch_since(None, lookback), DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(fetch_since(Some(merged_at(5)), lookback), merged_at(4));
        assert_eq!(
            fetch_since(Some(DateTime::<Utc>::UNIX_EPOCH), lookback),
            DateTime::<Utc>::UNIX_EPOCH
        );
    }

    #[tokio::test]
    async fn first_cycle_fetches_history_and_later_cycles_use_the_watermark() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        let source = Arc::new(
            ScriptedSource::default().with_batch("g/proj", 42, vec![MergeEvent::new("alice", merged_at(1))]),
        );
        let sync = orchestrator(store.clone(), source.clone(), &["g/proj"]);

        let first = sync.sync_project("g/proj").await;
        assert_eq!(
            first,
            CycleOutcome::Merged {
                project_id: 42,
                events: 1,
                samples: 1
            }
        );
        let watermark = store
            .last_synced_at("g/proj")
            .expect("watermark")
            .expect("synced");

        let second = sync.sync_project("g/proj").await;
        assert!(matches!(second, CycleOutcome::Merged { samples: 0, .. }));

        let calls = source.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, DateTime::<Utc>::UNIX_EPOCH);
        assert_eq!(calls[1].1, watermark - chrono::Duration::days(1));
    }

    #[tokio::test]
    async fn fetch_failure_is_isolated_to_its_project() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        let source = Arc::new(
            ScriptedSource::default()
                .with_batch("g/good", 1, vec![MergeEvent::new("alice", merged_at(2))])
                .failing_for("g/bad"),
        );
        let sync = orchestrator(store.clone(), source, &["g/bad", "g/good"]);

        let outcomes = sync.sync_once().await;
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].0, "g/bad");
        assert!(matches!(outcomes[0].1, CycleOutcome::FetchFailed(ref message) if message.contains("502")));
        assert_eq!(outcomes[1].0, "g/good");
        assert!(matches!(outcomes[1].1, CycleOutcome::Merged { project_id: 1, .. }));

        assert!(store.last_synced_at("g/bad").expect("watermark").is_none());
        assert!(store.last_synced_at("g/good").expect("watermark").is_some());
    }

    #[tokio::test]
    async fn merge_failure_does_not_advance_the_watermark() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        store
            .execute_batch_for_tests(
                "CREATE TRIGGER reject_counters BEFORE INSERT ON counters
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .expect("trigger");
        let source = Arc::new(
            ScriptedSource::default().with_batch("g/proj", 9, vec![MergeEvent::new("alice", merged_at(3))]),
        );
        let sync = orchestrator(store.clone(), source.clone(), &["g/proj"]);

        let outcome = sync.sync_project("g/proj").await;
        assert!(matches!(outcome, CycleOutcome::MergeFailed(ref message) if message.contains("disk full")));
        assert!(store.last_synced_at("g/proj").expect("watermark").is_none());

        sync.sync_project("g/proj").await;
        let calls = source.calls();
        assert_eq!(calls[1].1, DateTime::<Utc>::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn overlapping_cycles_for_one_project_are_skipped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        let source = Arc::new(ScriptedSource::default().with_batch("g/proj", 9, Vec::new()));
        let sync = orchestrator(store, source.clone(), &["g/proj"]);

        assert!(sync.try_claim("g/proj").await);
        assert_eq!(sync.sync_project("g/proj").await, CycleOutcome::Skipped);
        assert!(source.calls().is_empty());

        sync.release("g/proj").await;
        assert!(matches!(sync.sync_project("g/proj").await, CycleOutcome::Merged { .. }));
    }

    #[tokio::test]
    async fn run_syncs_at_startup_and_stops_on_shutdown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store(&dir);
        let source = Arc::new(
            ScriptedSource::default()
                .with_batch("g/a", 1, vec![MergeEvent::new("alice", merged_at(1))])
                .with_batch("g/b", 2, vec![MergeEvent::new("bob", merged_at(1))]),
        );
        let sync = orchestrator(store.clone(), source.clone(), &["g/a", "g/b"]);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(sync.run(shutdown.clone()));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while store.list_projects().expect("projects").len() < 2 {
            assert!(tokio::time::Instant::now() < deadline, "startup sync did not finish");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("run returns after shutdown")
            .expect("run task");

        assert_eq!(source.calls().len(), 2);
    }
}
