use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use mr_metrics_lib::db::Database;
use mr_metrics_lib::errors::AppResult;
use mr_metrics_lib::gitlab::EventSource;
use mr_metrics_lib::models::{FetchedBatch, MergeEvent};
use mr_metrics_lib::stats::StatsService;
use mr_metrics_lib::sync::{CycleOutcome, SyncOrchestrator};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Serves events from an in-memory history, honouring the `since` filter the way
/// GitLab's `updated_after` does for merge timestamps.
#[derive(Default)]
struct HistorySource {
    history: Mutex<HashMap<String, (i64, Vec<MergeEvent>)>>,
}

impl HistorySource {
    fn push(&self, project: &str, project_id: i64, event: MergeEvent) {
        let mut history = self.history.lock().expect("history lock");
        history
            .entry(project.to_string())
            .or_insert_with(|| (project_id, Vec::new()))
            .1
            .push(event);
    }
}

#[async_trait]
impl EventSource for HistorySource {
    async fn fetch_events(&self, project: &str, since: DateTime<Utc>) -> AppResult<FetchedBatch> {
        let history = self.history.lock().expect("history lock");
        let (project_id, events) = history.get(project).cloned().unwrap_or_default();
        Ok(FetchedBatch {
            project_id,
            events: events.into_iter().filter(|event| event.merged_at >= since).collect(),
        })
    }
}

fn merged_at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, day, hour, 0, 0).single().expect("timestamp")
}

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 3, day).expect("date")
}

#[tokio::test]
async fn repeated_syncs_keep_point_in_time_totals_consistent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(Database::new(&dir.path().join("pipeline.sqlite")).expect("db"));
    let source = Arc::new(HistorySource::default());
    source.push("team/api", 10, MergeEvent::new("alice", merged_at(1, 9)));
    source.push("team/api", 10, MergeEvent::new("alice", merged_at(1, 15)));
    source.push("team/api", 10, MergeEvent::new("bob", merged_at(2, 11)));
    source.push("team/web", 20, MergeEvent::new("alice", merged_at(2, 10)));

    let sync = SyncOrchestrator::new(
        store.clone(),
        source.clone(),
        vec!["team/api".to_string(), "team/web".to_string()],
        Duration::from_secs(3600),
    )
    // Fixed 2025 timestamps sit behind any wall-clock watermark, so every
    // cycle re-delivers the full history.
    .with_lookback(chrono::Duration::days(36_500));

    let outcomes = sync.sync_once().await;
    assert!(outcomes
        .iter()
        .all(|(_, outcome)| matches!(outcome, CycleOutcome::Merged { .. })));

    source.push("team/api", 10, MergeEvent::new("alice", merged_at(3, 10)));
    sync.sync_once().await;
    sync.sync_once().await;

    let service = StatsService::new(store.clone());
    let names = vec!["team/api".to_string(), "team/web".to_string()];

    let day_one = service.get_snapshot(names.clone(), date(1)).await.expect("day one");
    assert_eq!(day_one.projects, vec!["api", "web"]);
    assert_eq!(day_one.project_totals["web"], 0);
    assert_eq!(day_one.developers["alice"]["api"], 2);
    assert!(!day_one.developers.contains_key("bob"));
    assert_eq!(day_one.project_totals["api"], 2);

    let day_two = service.get_snapshot(names.clone(), date(2)).await.expect("day two");
    assert_eq!(day_two.projects, vec!["api", "web"]);
    assert_eq!(day_two.developers["alice"]["api"], 2);
    assert_eq!(day_two.developers["alice"]["web"], 1);
    assert_eq!(day_two.developer_totals["alice"], 3);
    assert_eq!(day_two.developer_totals["bob"], 1);
    assert_eq!(day_two.project_totals["api"], 3);

    let day_three = service.get_snapshot(names, date(3)).await.expect("day three");
    assert_eq!(day_three.developers["alice"]["api"], 3);
    assert_eq!(day_three.developer_totals["alice"], 4);
    assert_eq!(day_three.date, "2025-03-03");

    let alice = store.samples_for("alice", 10).expect("samples");
    assert!(alice
        .windows(2)
        .all(|pair| pair[0].cumulative_count <= pair[1].cumulative_count));
}
