use crate::cumulative::{bucket_by_user_and_day, plan_user_samples};
use crate::errors::{AppError, AppResult};
use crate::models::{
    AsOfCount, CounterSample, CounterSnapshot, MergeEvent, MergeSummary, OverlapPolicy, ProjectRecord,
};
use crate::stats::short_project_name;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const SCHEMA_SQL: &str = include_str!("schema.sql");

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
    overlap_policy: OverlapPolicy,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        Self::open(path, DEFAULT_BUSY_TIMEOUT, OverlapPolicy::default())
    }

    pub fn open(path: &Path, busy_timeout: Duration, overlap_policy: OverlapPolicy) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA journal_mode = WAL;")?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        tracing::debug!(path = %path.display(), policy = overlap_policy.as_str(), "counter store opened");

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
            overlap_policy,
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn overlap_policy(&self) -> OverlapPolicy {
        self.overlap_policy
    }

    pub fn last_synced_at(&self, project_name: &str) -> AppResult<Option<DateTime<Utc>>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn.query_row(
            "SELECT MAX(last_synced_at) FROM projects WHERE project_name = ?1",
            [project_name],
            |row| row.get(0),
        )?;
        raw.map(|value| parse_time(&value)).transpose().map_err(AppError::from)
    }

    pub fn merge_events(&self, project_id: i64, project_name: &str, events: &[MergeEvent]) -> AppResult<MergeSummary> {
        self.merge_events_at(project_id, project_name, events, Utc::now())
    }

    pub fn merge_events_at(
        &self,
        project_id: i64,
        project_name: &str,
        events: &[MergeEvent],
        synced_at: DateTime<Utc>,
    ) -> AppResult<MergeSummary> {
        let mut conn = self.lock().map_err(AppError::into_merge)?;
        let summary = self
            .merge_in_transaction(&mut conn, project_id, project_name, events, synced_at)
            .map_err(AppError::into_merge)?;

        tracing::debug!(
            project_id,
            project = project_name,
            events = events.len(),
            users = summary.users,
            samples = summary.samples_written,
            "merged event batch"
        );
        Ok(summary)
    }

    fn merge_in_transaction(
        &self,
        conn: &mut Connection,
        project_id: i64,
        project_name: &str,
        events: &[MergeEvent],
        synced_at: DateTime<Utc>,
    ) -> AppResult<MergeSummary> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT INTO projects (project_id, project_name, last_synced_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(project_id) DO UPDATE SET
               project_name = excluded.project_name,
               last_synced_at = excluded.last_synced_at",
            params![project_id, project_name, format_time(synced_at)],
        )?;

        let buckets = bucket_by_user_and_day(events);
        let mut summary = MergeSummary {
            users: buckets.len(),
            samples_written: 0,
        };

        for (username, fetched) in &buckets {
            let Some(first_day) = fetched.keys().next().copied() else {
                continue;
            };
            let baseline = count_before(&tx, username, project_id, first_day)?.unwrap_or(0);
            let stored = series_from(&tx, username, project_id, first_day)?;

            for (day, count) in plan_user_samples(self.overlap_policy, baseline, &stored, fetched) {
                tx.execute(
                    "INSERT INTO counters (username, project_id, day, cumulative_count)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(username, project_id, day) DO UPDATE SET
                       cumulative_count = excluded.cumulative_count",
                    params![username, project_id, day, count],
                )?;
                summary.samples_written += 1;
            }
        }

        tx.commit()?;
        Ok(summary)
    }

    // A requested name matches either the full project path or its last segment.
    pub fn snapshot(&self, project_names: &[String], as_of: NaiveDate) -> AppResult<CounterSnapshot> {
        let mut conn = self.lock().map_err(AppError::into_query)?;
        read_snapshot(&mut conn, project_names, as_of).map_err(AppError::into_query)
    }

    pub fn sample_as_of(&self, username: &str, project_id: i64, as_of: NaiveDate) -> AppResult<Option<CounterSample>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT username, project_id, day, cumulative_count
             FROM counters
             WHERE username = ?1 AND project_id = ?2 AND day <= ?3
             ORDER BY day DESC LIMIT 1",
            params![username, project_id, as_of],
            parse_sample_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn samples_for(&self, username: &str, project_id: i64) -> AppResult<Vec<CounterSample>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(
            "SELECT username, project_id, day, cumulative_count
             FROM counters WHERE username = ?1 AND project_id = ?2 ORDER BY day ASC",
        )?;
        let samples = statement
            .query_map(params![username, project_id], parse_sample_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(samples)
    }

    pub fn list_projects(&self) -> AppResult<Vec<ProjectRecord>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(
            "SELECT project_id, project_name, last_synced_at FROM projects ORDER BY project_name ASC",
        )?;
        let projects = statement
            .query_map([], |row| {
                Ok(ProjectRecord {
                    project_id: row.get(0)?,
                    project_name: row.get(1)?,
                    last_synced_at: parse_time(&row.get::<_, String>(2)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(projects)
    }

    #[cfg(test)]
    pub(crate) fn execute_batch_for_tests(&self, sql: &str) -> AppResult<()> {
        self.lock()?.execute_batch(sql).map_err(AppError::from)
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }
}

fn read_snapshot(conn: &mut Connection, project_names: &[String], as_of: NaiveDate) -> AppResult<CounterSnapshot> {
    let requested: BTreeSet<&str> = project_names.iter().map(String::as_str).collect();
    let tx = conn.transaction()?;

    let counts = {
        let mut statement = tx.prepare(
            "SELECT c.username, c.project_id, p.project_name, c.day, c.cumulative_count
             FROM counters c
             JOIN projects p ON p.project_id = c.project_id
             JOIN (
               SELECT username, project_id, MAX(day) AS day
               FROM counters
               WHERE day <= ?1
               GROUP BY username, project_id
             ) latest
               ON latest.username = c.username
              AND latest.project_id = c.project_id
              AND latest.day = c.day
             ORDER BY c.username ASC, p.project_name ASC",
        )?;
        let rows = statement.query_map([as_of], |row| {
            Ok(AsOfCount {
                username: row.get(0)?,
                project_id: row.get(1)?,
                project_name: row.get(2)?,
                day: row.get(3)?,
                cumulative_count: row.get(4)?,
            })
        })?;
        let mut counts = Vec::new();
        for row in rows {
            let row = row?;
            if is_requested(&requested, &row.project_name) {
                counts.push(row);
            }
        }
        counts
    };

    let projects = {
        let mut statement = tx.prepare(
            "SELECT DISTINCT p.project_name
             FROM projects p
             WHERE EXISTS (SELECT 1 FROM counters c WHERE c.project_id = p.project_id)
             ORDER BY p.project_name ASC",
        )?;
        let names = statement
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        names
            .into_iter()
            .filter(|name| is_requested(&requested, name))
            .collect::<Vec<_>>()
    };

    tx.commit()?;

    let mut developer_totals: BTreeMap<String, i64> = BTreeMap::new();
    let mut project_totals: BTreeMap<String, i64> =
        projects.iter().map(|name| (name.clone(), 0)).collect();
    for count in &counts {
        *developer_totals.entry(count.username.clone()).or_insert(0) += count.cumulative_count;
        *project_totals.entry(count.project_name.clone()).or_insert(0) += count.cumulative_count;
    }

    Ok(CounterSnapshot {
        as_of,
        counts,
        projects,
        developer_totals,
        project_totals,
    })
}

fn is_requested(requested: &BTreeSet<&str>, project_name: &str) -> bool {
    requested.contains(project_name) || requested.contains(short_project_name(project_name))
}

fn count_before(conn: &Connection, username: &str, project_id: i64, day: NaiveDate) -> AppResult<Option<i64>> {
    conn.query_row(
        "SELECT cumulative_count FROM counters
         WHERE username = ?1 AND project_id = ?2 AND day < ?3
         ORDER BY day DESC LIMIT 1",
        params![username, project_id, day],
        |row| row.get(0),
    )
    .optional()
    .map_err(AppError::from)
}

fn series_from(conn: &Connection, username: &str, project_id: i64, day: NaiveDate) -> AppResult<Vec<(NaiveDate, i64)>> {
    let mut statement = conn.prepare(
        "SELECT day, cumulative_count FROM counters
         WHERE username = ?1 AND project_id = ?2 AND day >= ?3
         ORDER BY day ASC",
    )?;
    let series = statement
        .query_map(params![username, project_id, day], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(series)
}

fn parse_sample_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CounterSample> {
    Ok(CounterSample {
        username: row.get(0)?,
        project_id: row.get(1)?,
        day: row.get(2)?,
        cumulative_count: row.get(3)?,
    })
}

fn format_time(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, error.to_string())),
            )
        })
}
