use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::sync::Mutex;

use crate::{InferenceRun, RunId, RunKind, RunStatus};

/// One stored per-frame count.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FrameRecord {
    pub run_id: RunId,
    pub kind: RunKind,
    pub timestamp: DateTime<Utc>,
    pub count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub kind: RunKind,
    pub total_count: u64,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub frames: u64,
}

/// Half-open instant range `[start, end)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn contains(&self, t: &DateTime<Utc>) -> bool {
        *t >= self.start && *t < self.end
    }
}

/// Append-only store of finished runs.
///
/// Methods take `&self` so one store can be shared between a processing
/// thread and readers; implementations serialise writers internally.
pub trait ResultStore: Send + Sync {
    /// Stores the run and all of its frame results, or nothing.
    fn save_run(&self, run: &InferenceRun) -> Result<()>;

    /// Frame records ordered by timestamp, optionally restricted to `range`.
    fn frame_records(&self, range: Option<TimeRange>) -> Result<Vec<FrameRecord>>;

    /// Most recent runs first.
    fn recent_runs(&self, limit: usize) -> Result<Vec<RunSummary>>;
}

pub struct SqliteResultStore {
    conn: Mutex<Connection>,
}

impl SqliteResultStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open result store {}", db_path))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("result store lock poisoned"))
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS runs (
              run_id TEXT PRIMARY KEY,
              kind TEXT NOT NULL,
              total_count INTEGER NOT NULL,
              status TEXT NOT NULL,
              created_at_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS frame_results (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              run_id TEXT NOT NULL REFERENCES runs(run_id),
              kind TEXT NOT NULL,
              recorded_at_ms INTEGER NOT NULL,
              count INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_frames_recorded ON frame_results(recorded_at_ms);
            "#,
        )?;
        Ok(())
    }
}

impl ResultStore for SqliteResultStore {
    fn save_run(&self, run: &InferenceRun) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO runs(run_id, kind, total_count, status, created_at_ms)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
            params![
                run.run_id.as_str(),
                run.kind.as_str(),
                i64::try_from(run.total_count).map_err(|_| anyhow!("total_count exceeds i64"))?,
                run.status.as_str(),
                Utc::now().timestamp_millis()
            ],
        )
        .with_context(|| format!("failed to insert run {}", run.run_id))?;
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO frame_results(run_id, kind, recorded_at_ms, count)
                VALUES (?1, ?2, ?3, ?4)
                "#,
            )?;
            for frame in &run.frame_results {
                stmt.execute(params![
                    run.run_id.as_str(),
                    run.kind.as_str(),
                    frame.timestamp.timestamp_millis(),
                    frame.count
                ])?;
            }
        }
        tx.commit()?;
        log::debug!(
            "stored run {} ({} frame result(s))",
            run.run_id,
            run.frame_results.len()
        );
        Ok(())
    }

    fn frame_records(&self, range: Option<TimeRange>) -> Result<Vec<FrameRecord>> {
        let (start, end) = match range {
            Some(r) => (r.start.timestamp_millis(), r.end.timestamp_millis()),
            None => (i64::MIN, i64::MAX),
        };
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT run_id, kind, recorded_at_ms, count FROM frame_results
            WHERE recorded_at_ms >= ?1 AND recorded_at_ms < ?2
            ORDER BY recorded_at_ms ASC, id ASC
            "#,
        )?;
        let rows = stmt.query_map(params![start, end], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, u32>(3)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (run_id, kind, recorded_at_ms, count) = row?;
            out.push(FrameRecord {
                run_id: RunId::from(run_id),
                kind: parse_kind(&kind)?,
                timestamp: from_millis(recorded_at_ms)?,
                count,
            });
        }
        Ok(out)
    }

    fn recent_runs(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT r.run_id, r.kind, r.total_count, r.status, r.created_at_ms,
                   (SELECT COUNT(*) FROM frame_results f WHERE f.run_id = r.run_id)
            FROM runs r
            ORDER BY r.created_at_ms DESC, r.rowid DESC
            LIMIT ?1
            "#,
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (run_id, kind, total_count, status, created_at_ms, frames) = row?;
            out.push(RunSummary {
                run_id: RunId::from(run_id),
                kind: parse_kind(&kind)?,
                total_count: u64::try_from(total_count)
                    .map_err(|_| anyhow!("corrupt run: negative total_count"))?,
                status: parse_status(&status)?,
                created_at: from_millis(created_at_ms)?,
                frames: u64::try_from(frames).unwrap_or(0),
            });
        }
        Ok(out)
    }
}

fn parse_kind(value: &str) -> Result<RunKind> {
    RunKind::parse(value).ok_or_else(|| anyhow!("corrupt record: unknown run kind '{}'", value))
}

fn parse_status(value: &str) -> Result<RunStatus> {
    match value {
        "complete" => Ok(RunStatus::Complete),
        "partially_failed" => Ok(RunStatus::PartiallyFailed),
        other => Err(anyhow!("corrupt record: unknown run status '{}'", other)),
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp {} out of range", ms))
}

/// Store kept in memory, for tests and dry runs.
#[derive(Default)]
pub struct InMemoryResultStore {
    runs: Mutex<Vec<(RunSummary, Vec<FrameRecord>)>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultStore for InMemoryResultStore {
    fn save_run(&self, run: &InferenceRun) -> Result<()> {
        let mut runs = self
            .runs
            .lock()
            .map_err(|_| anyhow!("result store lock poisoned"))?;
        if runs.iter().any(|(summary, _)| summary.run_id == run.run_id) {
            return Err(anyhow!("run {} already stored", run.run_id));
        }
        let records = run
            .frame_results
            .iter()
            .map(|frame| FrameRecord {
                run_id: run.run_id.clone(),
                kind: run.kind,
                timestamp: frame.timestamp,
                count: frame.count,
            })
            .collect();
        runs.push((
            RunSummary {
                run_id: run.run_id.clone(),
                kind: run.kind,
                total_count: run.total_count,
                status: run.status,
                created_at: Utc::now(),
                frames: run.frame_results.len() as u64,
            },
            records,
        ));
        Ok(())
    }

    fn frame_records(&self, range: Option<TimeRange>) -> Result<Vec<FrameRecord>> {
        let runs = self
            .runs
            .lock()
            .map_err(|_| anyhow!("result store lock poisoned"))?;
        let mut out: Vec<FrameRecord> = runs
            .iter()
            .flat_map(|(_, records)| records.iter())
            .filter(|r| range.map_or(true, |range| range.contains(&r.timestamp)))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.timestamp);
        Ok(out)
    }

    fn recent_runs(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let runs = self
            .runs
            .lock()
            .map_err(|_| anyhow!("result store lock poisoned"))?;
        Ok(runs
            .iter()
            .rev()
            .take(limit)
            .map(|(summary, _)| summary.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrameResult;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn run_at(hours: &[(u32, u32)]) -> InferenceRun {
        let frames = hours
            .iter()
            .map(|(hour, count)| FrameResult {
                timestamp: Utc.with_ymd_and_hms(2024, 3, 9, *hour, 0, 0).unwrap(),
                count: *count,
            })
            .collect();
        InferenceRun::from_frames(RunId::generate(), RunKind::Video, frames, None)
    }

    fn roundtrip(store: &dyn ResultStore) {
        store.save_run(&run_at(&[(14, 2), (9, 1)])).unwrap();
        store
            .save_run(&run_at(&[(10, 4)]).with_status(RunStatus::PartiallyFailed))
            .unwrap();

        let records = store.frame_records(None).unwrap();
        let hours: Vec<_> = records.iter().map(|r| r.timestamp.format("%H").to_string()).collect();
        assert_eq!(hours, vec!["09", "10", "14"]);

        let range = TimeRange {
            start: Utc.with_ymd_and_hms(2024, 3, 9, 10, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 3, 9, 14, 0, 0).unwrap(),
        };
        let ranged = store.frame_records(Some(range)).unwrap();
        assert_eq!(ranged.len(), 1);
        assert_eq!(ranged[0].count, 4);

        let recent = store.recent_runs(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].status, RunStatus::PartiallyFailed);
        assert_eq!(recent[1].total_count, 3);
        assert_eq!(recent[1].frames, 2);
        assert_eq!(store.recent_runs(1).unwrap().len(), 1);
    }

    #[test]
    fn sqlite_store_roundtrip() {
        roundtrip(&SqliteResultStore::open_in_memory().unwrap());
    }

    #[test]
    fn memory_store_roundtrip() {
        roundtrip(&InMemoryResultStore::new());
    }

    #[test]
    fn duplicate_run_ids_are_rejected() {
        let run = run_at(&[(1, 1)]);
        let sqlite = SqliteResultStore::open_in_memory().unwrap();
        sqlite.save_run(&run).unwrap();
        assert!(sqlite.save_run(&run).is_err());
        assert_eq!(sqlite.frame_records(None).unwrap().len(), 1);

        let memory = InMemoryResultStore::new();
        memory.save_run(&run).unwrap();
        assert!(memory.save_run(&run).is_err());
    }

    #[test]
    fn concurrent_writers_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.db");
        let store = Arc::new(SqliteResultStore::open(path.to_str().unwrap()).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        store.save_run(&run_at(&[(8, 1), (9, 2)])).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.recent_runs(100).unwrap().len(), 20);
        assert_eq!(store.frame_records(None).unwrap().len(), 40);
    }
}
