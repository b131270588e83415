use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeEvent {
    pub username: String,
    pub merged_at: DateTime<Utc>,
}

impl MergeEvent {
    pub fn new(username: impl Into<String>, merged_at: DateTime<Utc>) -> Self {
        Self {
            username: username.into(),
            merged_at,
        }
    }

    pub fn day(&self) -> NaiveDate {
        self.merged_at.date_naive()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedBatch {
    pub project_id: i64,
    pub events: Vec<MergeEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverlapPolicy {
    /// Rewrite batch days from the baseline using only this batch's increments.
    Recompute,
    /// Keep the larger of the recorded and fetched increment per day and
    /// re-base every later stored sample.
    #[default]
    Reconcile,
}

impl OverlapPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recompute => "recompute",
            Self::Reconcile => "reconcile",
        }
    }
}

impl std::str::FromStr for OverlapPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "recompute" => Ok(Self::Recompute),
            "reconcile" => Ok(Self::Reconcile),
            other => Err(format!("unknown overlap policy '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRecord {
    pub project_id: i64,
    pub project_name: String,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSample {
    pub username: String,
    pub project_id: i64,
    pub day: NaiveDate,
    pub cumulative_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeSummary {
    pub users: usize,
    pub samples_written: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AsOfCount {
    pub username: String,
    pub project_id: i64,
    pub project_name: String,
    pub day: NaiveDate,
    pub cumulative_count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub as_of: NaiveDate,
    pub counts: Vec<AsOfCount>,
    pub projects: Vec<String>,
    pub developer_totals: BTreeMap<String, i64>,
    pub project_totals: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedStats {
    pub developers: BTreeMap<String, BTreeMap<String, i64>>,
    pub projects: Vec<String>,
    pub developer_totals: BTreeMap<String, i64>,
    pub project_totals: BTreeMap<String, i64>,
    pub date: String,
}
