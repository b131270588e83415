use crate::models::{MergeEvent, OverlapPolicy};
use chrono::NaiveDate;
use std::collections::BTreeMap;

pub type DayIncrements = BTreeMap<NaiveDate, i64>;

pub fn bucket_by_user_and_day(events: &[MergeEvent]) -> BTreeMap<String, DayIncrements> {
    let mut buckets: BTreeMap<String, DayIncrements> = BTreeMap::new();
    for event in events {
        let username = event.username.trim();
        if username.is_empty() {
            continue;
        }
        *buckets
            .entry(username.to_string())
            .or_default()
            .entry(event.day())
            .or_insert(0) += 1;
    }
    buckets
}

pub fn cumulative_walk(baseline: i64, increments: &DayIncrements) -> Vec<(NaiveDate, i64)> {
    increments
        .iter()
        .scan(baseline, |running, (day, increment)| {
            *running += increment;
            Some((*day, *running))
        })
        .collect()
}

pub fn recorded_increments(baseline: i64, stored: &[(NaiveDate, i64)]) -> DayIncrements {
    let mut previous = baseline;
    let mut increments = DayIncrements::new();
    for (day, count) in stored {
        increments.insert(*day, (count - previous).max(0));
        previous = previous.max(*count);
    }
    increments
}

/// Computes the samples one user's slice of a batch must write.
///
/// `baseline` is the stored count strictly before the first fetched day and
/// `stored` is the stored series from that day on. Only samples whose value
/// differs from what is stored are returned.
pub fn plan_user_samples(
    policy: OverlapPolicy,
    baseline: i64,
    stored: &[(NaiveDate, i64)],
    fetched: &DayIncrements,
) -> Vec<(NaiveDate, i64)> {
    let planned = match policy {
        OverlapPolicy::Recompute => cumulative_walk(baseline, fetched),
        OverlapPolicy::Reconcile => {
            let mut merged = recorded_increments(baseline, stored);
            for (day, increment) in fetched {
                let entry = merged.entry(*day).or_insert(0);
                *entry = (*entry).max(*increment);
            }
            cumulative_walk(baseline, &merged)
        }
    };

    let existing: BTreeMap<NaiveDate, i64> = stored.iter().copied().collect();
    planned
        .into_iter()
        .filter(|(day, count)| existing.get(day) != Some(count))
        .collect()
}
