//! Ring-Buffer Store: a single-writer, multi-reader, persistent,
//! on-disk time-series ring with row-count eviction, range/seek queries,
//! and LTTB downsampling for sparklines.
//!
//! The store runs its synchronous `rusqlite` transactions on the blocking
//! thread pool (`tokio::task::spawn_blocking`) so callers never block the
//! async runtime on disk I/O. Each public method spawns one blocking task
//! against a shared, mutex-guarded connection opened in WAL mode.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::{GatewayError, InternalError, Result};
use crate::model::{DataPoint, Quality, Value};

const DEFAULT_MAX_ROWS: i64 = 60_000;

#[derive(Debug, Clone, Copy, Default)]
pub struct Range {
    pub first_ts: Option<i64>,
    pub last_ts: Option<i64>,
    pub count: i64,
}

pub struct RingBufferStore {
    conn: Arc<Mutex<Connection>>,
}

impl RingBufferStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> rusqlite::Result<Connection> {
            let conn = Connection::open(path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS datapoints (
                    rowid INTEGER PRIMARY KEY AUTOINCREMENT,
                    tag_id TEXT NOT NULL,
                    ts_ms INTEGER NOT NULL,
                    v_num REAL,
                    v_bool INTEGER,
                    v_text TEXT,
                    quality TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_tag_ts ON datapoints(tag_id, ts_ms);
                CREATE INDEX IF NOT EXISTS idx_ts ON datapoints(ts_ms);
                CREATE TABLE IF NOT EXISTS config (key TEXT PRIMARY KEY, value TEXT NOT NULL);",
            )?;
            Ok(conn)
        })
        .await
        .map_err(|e| InternalError(format!("rbs open task panicked: {e}")))??;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub async fn open_in_memory() -> Result<Self> {
        Self::open(":memory:").await
    }

    async fn run_blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().unwrap();
            f(&guard)
        })
        .await
        .map_err(|e| InternalError(format!("rbs task panicked: {e}")).into())
        .and_then(|r| r.map_err(GatewayError::from))
    }

    fn max_rows(conn: &Connection) -> rusqlite::Result<i64> {
        conn.query_row("SELECT value FROM config WHERE key = 'max_rows'", [], |row| row.get::<_, String>(0))
            .optional()?
            .map(|v| v.parse().unwrap_or(DEFAULT_MAX_ROWS))
            .map(Ok)
            .unwrap_or(Ok(DEFAULT_MAX_ROWS))
    }

    fn evict(conn: &Connection) -> rusqlite::Result<()> {
        let max_rows = Self::max_rows(conn)?;
        conn.execute(
            "DELETE FROM datapoints WHERE rowid <= (SELECT MAX(rowid) FROM datapoints) - ?1",
            params![max_rows],
        )?;
        Ok(())
    }

    fn insert_one(conn: &Connection, dp: &DataPoint) -> rusqlite::Result<()> {
        let (v_num, v_bool, v_text) = split_value(&dp.value);
        conn.execute(
            "INSERT INTO datapoints (tag_id, ts_ms, v_num, v_bool, v_text, quality) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![dp.tag_id.to_string(), dp.timestamp, v_num, v_bool, v_text, quality_str(dp.quality)],
        )?;
        Ok(())
    }

    pub async fn insert(&self, dp: DataPoint) -> Result<()> {
        self.run_blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            Self::insert_one(&tx, &dp)?;
            Self::evict(&tx)?;
            tx.commit()
        })
        .await
    }

    /// Batched form: all inserts and the eviction execute inside one write
    /// transaction.
    pub async fn insert_batch(&self, dps: Vec<DataPoint>) -> Result<()> {
        if dps.is_empty() {
            return Ok(());
        }
        self.run_blocking(move |conn| {
            let tx = conn.unchecked_transaction()?;
            for dp in &dps {
                Self::insert_one(&tx, dp)?;
            }
            Self::evict(&tx)?;
            tx.commit()
        })
        .await
    }

    pub async fn range(&self) -> Result<Range> {
        self.run_blocking(|conn| {
            conn.query_row("SELECT MIN(ts_ms), MAX(ts_ms), COUNT(*) FROM datapoints", [], |row| {
                Ok(Range { first_ts: row.get(0)?, last_ts: row.get(1)?, count: row.get(2)? })
            })
        })
        .await
    }

    /// Latest point per tag with `ts_ms <= target`, powering DVR time-travel.
    pub async fn seek(&self, target_ms: i64) -> Result<std::collections::HashMap<Uuid, DataPoint>> {
        self.run_blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT tag_id, ts_ms, v_num, v_bool, v_text, quality FROM datapoints d
                 WHERE ts_ms <= ?1
                 AND rowid = (
                     SELECT rowid FROM datapoints d2
                     WHERE d2.tag_id = d.tag_id AND d2.ts_ms <= ?1
                     ORDER BY d2.ts_ms DESC, d2.rowid DESC LIMIT 1
                 )",
            )?;
            let rows = stmt.query_map(params![target_ms], row_to_datapoint)?;
            let mut out = std::collections::HashMap::new();
            for row in rows {
                let dp = row?;
                out.insert(dp.tag_id, dp);
            }
            Ok(out)
        })
        .await
    }

    /// Raw, time-ordered rows for the given tags within `[t0, t1]`, no
    /// downsampling.
    pub async fn export(&self, tag_ids: Vec<Uuid>, t0: i64, t1: i64) -> Result<Vec<DataPoint>> {
        self.run_blocking(move |conn| {
            let placeholders = std::iter::repeat("?").take(tag_ids.len()).collect::<Vec<_>>().join(",");
            let sql = format!(
                "SELECT tag_id, ts_ms, v_num, v_bool, v_text, quality FROM datapoints
                 WHERE tag_id IN ({placeholders}) AND ts_ms >= ? AND ts_ms <= ?
                 ORDER BY ts_ms ASC, rowid ASC"
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut bound: Vec<Box<dyn rusqlite::ToSql>> =
                tag_ids.iter().map(|id| Box::new(id.to_string()) as Box<dyn rusqlite::ToSql>).collect();
            bound.push(Box::new(t0));
            bound.push(Box::new(t1));
            let params: Vec<&dyn rusqlite::ToSql> = bound.iter().map(|b| b.as_ref()).collect();
            let rows = stmt.query_map(params.as_slice(), row_to_datapoint)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }

    /// All rows for one tag within `[t0, t1]`, downsampled to at most
    /// `max_points` via LTTB.
    pub async fn sparkline(&self, tag_id: Uuid, t0: i64, t1: i64, max_points: usize) -> Result<(Vec<i64>, Vec<f64>)> {
        let rows = self
            .run_blocking(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT ts_ms, v_num, v_bool FROM datapoints
                     WHERE tag_id = ?1 AND ts_ms >= ?2 AND ts_ms <= ?3
                     ORDER BY ts_ms ASC, rowid ASC",
                )?;
                let rows = stmt.query_map(params![tag_id.to_string(), t0, t1], |row| {
                    let ts: i64 = row.get(0)?;
                    let v_num: Option<f64> = row.get(1)?;
                    let v_bool: Option<i64> = row.get(2)?;
                    let v = v_num.unwrap_or_else(|| v_bool.unwrap_or(0) as f64);
                    Ok((ts, v))
                })?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;
        Ok(lttb(&rows, max_points))
    }

    pub async fn update_config(&self, max_rows: Option<i64>, retention_minutes: Option<i64>) -> Result<()> {
        self.run_blocking(move |conn| {
            if let Some(n) = max_rows {
                conn.execute(
                    "INSERT INTO config(key, value) VALUES ('max_rows', ?1)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![n.to_string()],
                )?;
            }
            if let Some(n) = retention_minutes {
                conn.execute(
                    "INSERT INTO config(key, value) VALUES ('retention_minutes', ?1)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![n.to_string()],
                )?;
            }
            Ok(())
        })
        .await
    }

    pub async fn clear(&self) -> Result<()> {
        self.run_blocking(|conn| conn.execute("DELETE FROM datapoints", []).map(|_| ())).await
    }

    pub async fn close(self) -> Result<()> {
        // Dropping the last Arc reference closes the underlying connection;
        // nothing else to flush since every write already committed.
        Ok(())
    }
}

fn quality_str(q: Quality) -> &'static str {
    match q {
        Quality::Good => "good",
        Quality::Bad => "bad",
        Quality::Uncertain => "uncertain",
    }
}

fn quality_from_str(s: &str) -> Quality {
    match s {
        "bad" => Quality::Bad,
        "uncertain" => Quality::Uncertain,
        _ => Quality::Good,
    }
}

fn split_value(value: &Value) -> (Option<f64>, Option<i64>, Option<String>) {
    match value {
        Value::Number(n) => (Some(*n), None, None),
        Value::Bool(b) => (None, Some(if *b { 1 } else { 0 }), None),
        Value::String(s) => (None, None, Some(s.clone())),
    }
}

fn row_to_datapoint(row: &rusqlite::Row) -> rusqlite::Result<DataPoint> {
    let tag_id: String = row.get(0)?;
    let ts_ms: i64 = row.get(1)?;
    let v_num: Option<f64> = row.get(2)?;
    let v_bool: Option<i64> = row.get(3)?;
    let v_text: Option<String> = row.get(4)?;
    let quality: String = row.get(5)?;
    let value = if let Some(n) = v_num {
        Value::Number(n)
    } else if let Some(b) = v_bool {
        Value::Bool(b != 0)
    } else {
        Value::String(v_text.unwrap_or_default())
    };
    Ok(DataPoint {
        tag_id: Uuid::parse_str(&tag_id).unwrap_or(Uuid::nil()),
        timestamp: ts_ms,
        value,
        quality: quality_from_str(&quality),
    })
}

/// Largest-Triangle-Three-Buckets downsampling. Keeps the
/// first and last point, splits the remainder into `max_points - 2`
/// buckets, and from each bucket picks the point maximizing the triangle
/// area formed with the previously selected point and the average of the
/// next bucket.
fn lttb(points: &[(i64, f64)], max_points: usize) -> (Vec<i64>, Vec<f64>) {
    if points.len() <= max_points || max_points < 3 {
        let ts = points.iter().map(|p| p.0).collect();
        let values = points.iter().map(|p| p.1).collect();
        return (ts, values);
    }

    let mut sampled = Vec::with_capacity(max_points);
    sampled.push(points[0]);

    let bucket_count = max_points - 2;
    let len = points.len();
    // buckets partition the open interval (0, len-1) of interior points.
    let bucket_size = (len - 2) as f64 / bucket_count as f64;

    let mut a = 0usize; // index into `points` of the previously selected point
    for i in 0..bucket_count {
        let range_start = 1 + (i as f64 * bucket_size).floor() as usize;
        let range_end = (1 + ((i + 1) as f64 * bucket_size).floor() as usize).min(len - 1).max(range_start + 1);

        let avg_start = range_end;
        let avg_end = if i == bucket_count - 1 {
            len
        } else {
            (1 + ((i + 2) as f64 * bucket_size).floor() as usize).min(len).max(avg_start + 1)
        };
        let (avg_x, avg_y) = average(&points[avg_start.min(len - 1)..avg_end.min(len)]);

        let (ax, ay) = (points[a].0 as f64, points[a].1);
        let mut best_idx = range_start;
        let mut best_area = -1.0;
        for idx in range_start..range_end {
            let (bx, by) = (points[idx].0 as f64, points[idx].1);
            let area = ((ax - avg_x) * (by - ay) - (ax - bx) * (avg_y - ay)).abs();
            if area > best_area {
                best_area = area;
                best_idx = idx;
            }
        }
        sampled.push(points[best_idx]);
        a = best_idx;
    }

    sampled.push(points[len - 1]);
    (sampled.iter().map(|p| p.0).collect(), sampled.iter().map(|p| p.1).collect())
}

fn average(slice: &[(i64, f64)]) -> (f64, f64) {
    if slice.is_empty() {
        return (0.0, 0.0);
    }
    let n = slice.len() as f64;
    let sx = slice.iter().map(|p| p.0 as f64).sum::<f64>() / n;
    let sy = slice.iter().map(|p| p.1).sum::<f64>() / n;
    (sx, sy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Quality;

    fn dp(tag: Uuid, ts: i64, v: f64) -> DataPoint {
        DataPoint { tag_id: tag, timestamp: ts, value: Value::Number(v), quality: Quality::Good }
    }

    #[tokio::test]
    async fn eviction_keeps_row_count_at_max_rows() {
        let store = RingBufferStore::open_in_memory().await.unwrap();
        store.update_config(Some(1000), None).await.unwrap();
        let tag = Uuid::new_v4();
        let batch: Vec<DataPoint> = (0..1500).map(|i| dp(tag, i as i64, i as f64)).collect();
        store.insert_batch(batch).await.unwrap();
        let range = store.range().await.unwrap();
        assert_eq!(range.count, 1000);
        // the oldest 500 timestamps should be gone.
        let exported = store.export(vec![tag], 0, 499).await.unwrap();
        assert!(exported.is_empty());
    }

    #[tokio::test]
    async fn seek_returns_latest_point_per_tag_at_or_before_target() {
        let store = RingBufferStore::open_in_memory().await.unwrap();
        let tag = Uuid::new_v4();
        store.insert_batch(vec![dp(tag, 0, 1.0), dp(tag, 10, 2.0), dp(tag, 20, 3.0)]).await.unwrap();
        let snapshot = store.seek(15).await.unwrap();
        assert_eq!(snapshot.get(&tag).unwrap().value, Value::Number(2.0));
    }

    #[tokio::test]
    async fn sparkline_downsamples_to_at_most_max_points() {
        let store = RingBufferStore::open_in_memory().await.unwrap();
        store.update_config(Some(20_000), None).await.unwrap();
        let tag = Uuid::new_v4();
        let batch: Vec<DataPoint> = (0..10_000)
            .map(|i| dp(tag, i as i64, ((i as f64) * 0.01).sin()))
            .collect();
        store.insert_batch(batch).await.unwrap();
        let (ts, values) = store.sparkline(tag, 0, 9_999, 500).await.unwrap();
        assert!(ts.len() <= 500);
        assert_eq!(ts.len(), values.len());
        assert_eq!(*ts.first().unwrap(), 0);
        assert_eq!(*ts.last().unwrap(), 9_999);
    }

    #[tokio::test]
    async fn sparkline_returns_all_points_when_under_budget() {
        let store = RingBufferStore::open_in_memory().await.unwrap();
        let tag = Uuid::new_v4();
        store.insert_batch(vec![dp(tag, 0, 1.0), dp(tag, 1, 2.0)]).await.unwrap();
        let (ts, _) = store.sparkline(tag, 0, 1, 500).await.unwrap();
        assert_eq!(ts.len(), 2);
    }
}
