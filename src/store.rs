//! Store gateway (C2): idempotent upsert, range queries, gap and job
//! bookkeeping, and retention cleanup against a pooled SQLite connection.
//!
//! The relational engine itself is an external collaborator; SQLite is the
//! concrete backend wired up here behind the same gateway surface so a
//! different engine could sit behind it without the rest of the crate
//! noticing.

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use rust_decimal::Decimal;
use tokio::sync::Semaphore;

use crate::config::Settings;
use crate::error::StoreError;
use crate::types::{Candle, CandleGap, IngestionJob, JobStatus, JobType, SeriesKey, Timeframe};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS candles (
    exchange TEXT NOT NULL,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    open_time INTEGER NOT NULL,
    close_time INTEGER NOT NULL,
    open TEXT NOT NULL,
    high TEXT NOT NULL,
    low TEXT NOT NULL,
    close TEXT NOT NULL,
    volume TEXT NOT NULL,
    PRIMARY KEY (exchange, symbol, timeframe, open_time)
);

CREATE TABLE IF NOT EXISTS candle_gaps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exchange TEXT NOT NULL,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    gap_start INTEGER NOT NULL,
    gap_end INTEGER NOT NULL,
    detected_at INTEGER NOT NULL,
    repaired_at INTEGER,
    UNIQUE(exchange, symbol, timeframe, gap_start, gap_end)
);

CREATE TABLE IF NOT EXISTS ingestion_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    exchange TEXT NOT NULL,
    symbol TEXT NOT NULL,
    timeframe TEXT NOT NULL,
    job_type TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    completed_at INTEGER,
    candles_fetched INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);
";

fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().expect("valid timestamp stored")
}

/// A small checkout-based pool: `pool_size + overflow` connections may be
/// outstanding at once, each pre-pinged before being handed to a caller.
struct PoolInner {
    path: String,
    connections: StdMutex<VecDeque<Connection>>,
    permits: Semaphore,
}

#[derive(Clone)]
pub struct StorePool {
    inner: Arc<PoolInner>,
}

impl StorePool {
    pub fn open(settings: &Settings) -> Result<Self, StoreError> {
        let path = settings
            .database_url
            .strip_prefix("sqlite://")
            .unwrap_or(&settings.database_url)
            .to_string();

        let pool = Self {
            inner: Arc::new(PoolInner {
                path,
                connections: StdMutex::new(VecDeque::new()),
                permits: Semaphore::new((settings.store_pool_size + settings.store_pool_overflow) as usize),
            }),
        };
        pool.init_schema()?;
        Ok(pool)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = Connection::open(&self.inner.path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Check out a connection (opening a fresh one if the pool has spare
    /// capacity but no idle connection), run `f` against it on the blocking
    /// pool, and return it.
    async fn with_connection<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, rusqlite::Error> + Send + 'static,
        R: Send + 'static,
    {
        let permit = self
            .inner
            .permits
            .acquire()
            .await
            .map_err(|_| StoreError::PoolTimeout)?;

        let inner = self.inner.clone();
        let result = tokio::task::spawn_blocking(move || -> Result<R, StoreError> {
            let mut conn = {
                let mut idle = inner.connections.lock().expect("pool mutex poisoned");
                idle.pop_front()
            };
            if conn.is_none() {
                conn = Some(Connection::open(&inner.path)?);
            }
            let conn = conn.expect("connection just ensured present");

            conn.execute("SELECT 1", []).map_err(StoreError::PrePing)?;

            let outcome = f(&conn);

            inner.connections.lock().expect("pool mutex poisoned").push_back(conn);
            Ok(outcome?)
        })
        .await
        .expect("store worker task panicked")?;

        drop(permit);
        Ok(result)
    }
}

fn row_to_candle(row: &rusqlite::Row<'_>) -> rusqlite::Result<Candle> {
    let timeframe_tag: String = row.get(2)?;
    let timeframe = Timeframe::parse(&timeframe_tag).unwrap_or(Timeframe::H1);
    Ok(Candle {
        exchange: row.get(0)?,
        symbol: row.get(1)?,
        timeframe,
        open_time: from_millis(row.get(3)?),
        close_time: from_millis(row.get(4)?),
        open: Decimal::from_str(&row.get::<_, String>(5)?).unwrap_or_default(),
        high: Decimal::from_str(&row.get::<_, String>(6)?).unwrap_or_default(),
        low: Decimal::from_str(&row.get::<_, String>(7)?).unwrap_or_default(),
        close: Decimal::from_str(&row.get::<_, String>(8)?).unwrap_or_default(),
        volume: Decimal::from_str(&row.get::<_, String>(9)?).unwrap_or_default(),
    })
}

fn row_to_gap(row: &rusqlite::Row<'_>) -> rusqlite::Result<CandleGap> {
    let timeframe_tag: String = row.get(3)?;
    Ok(CandleGap {
        id: Some(row.get(0)?),
        exchange: row.get(1)?,
        symbol: row.get(2)?,
        timeframe: Timeframe::parse(&timeframe_tag).unwrap_or(Timeframe::H1),
        gap_start: from_millis(row.get(4)?),
        gap_end: from_millis(row.get(5)?),
        detected_at: from_millis(row.get(6)?),
        repaired_at: row.get::<_, Option<i64>>(7)?.map(from_millis),
    })
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<IngestionJob> {
    let timeframe_tag: String = row.get(3)?;
    let job_type: String = row.get(4)?;
    let status: String = row.get(5)?;
    Ok(IngestionJob {
        id: Some(row.get(0)?),
        exchange: row.get(1)?,
        symbol: row.get(2)?,
        timeframe: Timeframe::parse(&timeframe_tag).unwrap_or(Timeframe::H1),
        job_type: JobType::parse(&job_type).unwrap_or(JobType::Backfill),
        status: JobStatus::parse(&status).unwrap_or(JobStatus::Running),
        started_at: from_millis(row.get(6)?),
        completed_at: row.get::<_, Option<i64>>(7)?.map(from_millis),
        candles_fetched: row.get(8)?,
        last_error: row.get(9)?,
    })
}

/// Per-target summary row returned by [`StoreGateway::status_summary`].
#[derive(Debug, Clone)]
pub struct StatusRow {
    pub exchange: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub candle_count: i64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Fields to change on an [`IngestionJob`]; absent fields are left alone.
#[derive(Debug, Default, Clone)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub candles_fetched: Option<i64>,
    pub last_error: Option<String>,
    pub completed: bool,
}

impl JobUpdate {
    pub fn success(candles_fetched: i64) -> Self {
        Self {
            status: Some(JobStatus::Success),
            candles_fetched: Some(candles_fetched),
            last_error: None,
            completed: true,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            candles_fetched: None,
            last_error: Some(error.into()),
            completed: true,
        }
    }
}

#[derive(Clone)]
pub struct StoreGateway {
    pool: StorePool,
}

impl StoreGateway {
    pub fn new(pool: StorePool) -> Self {
        Self { pool }
    }

    /// Upsert a batch; returns the number of rows written. Empty input is a
    /// no-op returning 0. On conflict every non-key column is overwritten,
    /// since upstream may re-emit the still-open bar with revised values.
    pub async fn upsert_candles(&self, batch: Vec<Candle>) -> Result<usize, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }
        let count = batch.len();
        self.pool
            .with_connection(move |conn| {
                let tx = conn.unchecked_transaction()?;
                {
                    let mut stmt = tx.prepare(
                        "INSERT INTO candles (exchange, symbol, timeframe, open_time, close_time, open, high, low, close, volume)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                         ON CONFLICT(exchange, symbol, timeframe, open_time) DO UPDATE SET
                            close_time = excluded.close_time,
                            open = excluded.open,
                            high = excluded.high,
                            low = excluded.low,
                            close = excluded.close,
                            volume = excluded.volume",
                    )?;
                    for c in &batch {
                        stmt.execute(params![
                            c.exchange,
                            c.symbol,
                            c.timeframe.tag(),
                            to_millis(c.open_time),
                            to_millis(c.close_time),
                            c.open.to_string(),
                            c.high.to_string(),
                            c.low.to_string(),
                            c.close.to_string(),
                            c.volume.to_string(),
                        ])?;
                    }
                }
                tx.commit()?;
                Ok(count)
            })
            .await
    }

    /// Candles in `[start, end)`, ascending by `open_time`, capped at
    /// `limit` after ordering.
    pub async fn get_candles(
        &self,
        key: SeriesKey,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<Candle>, StoreError> {
        self.pool
            .with_connection(move |conn| {
                let mut sql = String::from(
                    "SELECT exchange, symbol, timeframe, open_time, close_time, open, high, low, close, volume
                     FROM candles WHERE exchange = ?1 AND symbol = ?2 AND timeframe = ?3",
                );
                let mut bound: Vec<Box<dyn rusqlite::ToSql>> = vec![
                    Box::new(key.exchange.clone()),
                    Box::new(key.symbol.clone()),
                    Box::new(key.timeframe.tag().to_string()),
                ];
                if let Some(start) = start {
                    sql.push_str(&format!(" AND open_time >= ?{}", bound.len() + 1));
                    bound.push(Box::new(to_millis(start)));
                }
                if let Some(end) = end {
                    sql.push_str(&format!(" AND open_time < ?{}", bound.len() + 1));
                    bound.push(Box::new(to_millis(end)));
                }
                sql.push_str(&format!(" ORDER BY open_time ASC LIMIT ?{}", bound.len() + 1));
                bound.push(Box::new(limit));

                let mut stmt = conn.prepare(&sql)?;
                let params: Vec<&dyn rusqlite::ToSql> = bound.iter().map(|b| b.as_ref()).collect();
                let mut rows = stmt.query(params.as_slice())?;
                let mut candles = Vec::new();
                while let Some(row) = rows.next()? {
                    candles.push(row_to_candle(row)?);
                }
                Ok(candles)
            })
            .await
    }

    pub async fn latest_open_time(&self, key: SeriesKey) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.pool
            .with_connection(move |conn| {
                conn.query_row(
                    "SELECT MAX(open_time) FROM candles WHERE exchange = ?1 AND symbol = ?2 AND timeframe = ?3",
                    params![key.exchange, key.symbol, key.timeframe.tag()],
                    |row| row.get::<_, Option<i64>>(0),
                )
                .map(|opt| opt.map(from_millis))
            })
            .await
    }

    pub async fn count(&self, key: SeriesKey) -> Result<i64, StoreError> {
        self.pool
            .with_connection(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM candles WHERE exchange = ?1 AND symbol = ?2 AND timeframe = ?3",
                    params![key.exchange, key.symbol, key.timeframe.tag()],
                    |row| row.get(0),
                )
            })
            .await
    }

    /// Idempotent on `(exchange,symbol,timeframe,gap_start,gap_end)`.
    /// Returns the new row id, or 0 if the gap already existed.
    pub async fn save_gap(&self, gap: CandleGap) -> Result<i64, StoreError> {
        self.pool
            .with_connection(move |conn| {
                conn.query_row(
                    "INSERT INTO candle_gaps (exchange, symbol, timeframe, gap_start, gap_end, detected_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(exchange, symbol, timeframe, gap_start, gap_end) DO NOTHING
                     RETURNING id",
                    params![
                        gap.exchange,
                        gap.symbol,
                        gap.timeframe.tag(),
                        to_millis(gap.gap_start),
                        to_millis(gap.gap_end),
                        to_millis(gap.detected_at),
                    ],
                    |row| row.get(0),
                )
                .optional()
                .map(|id| id.unwrap_or(0))
            })
            .await
    }

    pub async fn unrepaired_gaps(&self, filter: Option<SeriesKey>) -> Result<Vec<CandleGap>, StoreError> {
        self.pool
            .with_connection(move |conn| {
                let mut sql = String::from(
                    "SELECT id, exchange, symbol, timeframe, gap_start, gap_end, detected_at, repaired_at
                     FROM candle_gaps WHERE repaired_at IS NULL",
                );
                let mut bound: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
                if let Some(key) = &filter {
                    sql.push_str(" AND exchange = ?1 AND symbol = ?2 AND timeframe = ?3");
                    bound.push(Box::new(key.exchange.clone()));
                    bound.push(Box::new(key.symbol.clone()));
                    bound.push(Box::new(key.timeframe.tag().to_string()));
                }
                sql.push_str(" ORDER BY gap_start ASC");

                let mut stmt = conn.prepare(&sql)?;
                let params: Vec<&dyn rusqlite::ToSql> = bound.iter().map(|b| b.as_ref()).collect();
                let mut rows = stmt.query(params.as_slice())?;
                let mut gaps = Vec::new();
                while let Some(row) = rows.next()? {
                    gaps.push(row_to_gap(row)?);
                }
                Ok(gaps)
            })
            .await
    }

    pub async fn mark_gap_repaired(&self, id: i64) -> Result<(), StoreError> {
        let now = to_millis(Utc::now());
        self.pool
            .with_connection(move |conn| {
                conn.execute("UPDATE candle_gaps SET repaired_at = ?1 WHERE id = ?2", params![now, id])?;
                Ok(())
            })
            .await
    }

    pub async fn create_job(&self, job: IngestionJob) -> Result<i64, StoreError> {
        self.pool
            .with_connection(move |conn| {
                conn.query_row(
                    "INSERT INTO ingestion_jobs (exchange, symbol, timeframe, job_type, status, started_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6) RETURNING id",
                    params![
                        job.exchange,
                        job.symbol,
                        job.timeframe.tag(),
                        job.job_type.as_str(),
                        job.status.as_str(),
                        to_millis(job.started_at),
                    ],
                    |row| row.get(0),
                )
            })
            .await
    }

    pub async fn update_job(&self, id: i64, update: JobUpdate) -> Result<(), StoreError> {
        self.pool
            .with_connection(move |conn| {
                let mut sets = Vec::new();
                let mut bound: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

                if let Some(status) = update.status {
                    sets.push(format!("status = ?{}", bound.len() + 1));
                    bound.push(Box::new(status.as_str().to_string()));
                }
                if let Some(candles_fetched) = update.candles_fetched {
                    sets.push(format!("candles_fetched = ?{}", bound.len() + 1));
                    bound.push(Box::new(candles_fetched));
                }
                if let Some(last_error) = update.last_error {
                    sets.push(format!("last_error = ?{}", bound.len() + 1));
                    bound.push(Box::new(last_error));
                }
                if update.completed {
                    sets.push(format!("completed_at = ?{}", bound.len() + 1));
                    bound.push(Box::new(to_millis(Utc::now())));
                }
                if sets.is_empty() {
                    return Ok(());
                }

                let sql = format!(
                    "UPDATE ingestion_jobs SET {} WHERE id = ?{}",
                    sets.join(", "),
                    bound.len() + 1
                );
                bound.push(Box::new(id));

                let params: Vec<&dyn rusqlite::ToSql> = bound.iter().map(|b| b.as_ref()).collect();
                conn.execute(&sql, params.as_slice())?;
                Ok(())
            })
            .await
    }

    pub async fn recent_jobs(&self, limit: i64) -> Result<Vec<IngestionJob>, StoreError> {
        self.pool
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, exchange, symbol, timeframe, job_type, status, started_at, completed_at, candles_fetched, last_error
                     FROM ingestion_jobs ORDER BY started_at DESC LIMIT ?1",
                )?;
                let mut rows = stmt.query(params![limit])?;
                let mut jobs = Vec::new();
                while let Some(row) = rows.next()? {
                    jobs.push(row_to_job(row)?);
                }
                Ok(jobs)
            })
            .await
    }

    pub async fn status_summary(&self) -> Result<Vec<StatusRow>, StoreError> {
        self.pool
            .with_connection(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT exchange, symbol, timeframe, COUNT(*), MIN(open_time), MAX(open_time)
                     FROM candles GROUP BY exchange, symbol, timeframe ORDER BY exchange, symbol, timeframe",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let timeframe_tag: String = row.get(2)?;
                    out.push(StatusRow {
                        exchange: row.get(0)?,
                        symbol: row.get(1)?,
                        timeframe: Timeframe::parse(&timeframe_tag).unwrap_or(Timeframe::H1),
                        candle_count: row.get(3)?,
                        oldest: row.get::<_, Option<i64>>(4)?.map(from_millis),
                        newest: row.get::<_, Option<i64>>(5)?.map(from_millis),
                    });
                }
                Ok(out)
            })
            .await
    }

    /// Delete candles older than `now - days[timeframe]` per timeframe.
    /// Returns per-timeframe deletion counts.
    pub async fn cleanup_retention(&self, retention: HashMap<Timeframe, i64>) -> Result<HashMap<Timeframe, i64>, StoreError> {
        self.pool
            .with_connection(move |conn| {
                let mut deleted = HashMap::new();
                for (timeframe, days) in retention {
                    let cutoff = to_millis(Utc::now() - chrono::Duration::days(days));
                    let n = conn.execute(
                        "DELETE FROM candles WHERE timeframe = ?1 AND open_time < ?2",
                        params![timeframe.tag(), cutoff],
                    )?;
                    deleted.insert(timeframe, n as i64);
                }
                Ok(deleted)
            })
            .await
    }
}
