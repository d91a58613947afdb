//! Backfill service (C6): resume-from-latest historical fill, with one
//! ingestion job record per target.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{error, info, warn};

use crate::exchange::Exchange;
use crate::store::{JobUpdate, StoreGateway};
use crate::types::{IngestionJob, JobType, SeriesKey, Timeframe};

pub struct BackfillService {
    store: StoreGateway,
    exchange: Arc<dyn Exchange>,
}

impl BackfillService {
    pub fn new(store: StoreGateway, exchange: Arc<dyn Exchange>) -> Self {
        Self { store, exchange }
    }

    /// Backfill one target. Effective `[start, end)` is resolved by
    /// precedence: explicit `start` > stored latest `open_time` > `end -
    /// days`. Returns the number of candles saved; errors are recorded on
    /// the job and re-raised so batch callers can record per-target
    /// outcomes.
    pub async fn backfill_symbol(
        &self,
        key: SeriesKey,
        days: i64,
        start: Option<DateTime<Utc>>,
    ) -> Result<i64, crate::error::IngestError> {
        let end = Utc::now();

        let start = match start {
            Some(s) => s,
            None => match self.store.latest_open_time(key.clone()).await? {
                Some(latest) => {
                    info!(symbol = %key.symbol, timeframe = %key.timeframe, %latest, "resuming backfill from stored latest");
                    latest
                }
                None => end - ChronoDuration::days(days),
            },
        };

        let started_at = Utc::now();
        let job = IngestionJob::new_running(&key, JobType::Backfill, started_at);
        let job_id = self.store.create_job(job).await?;

        info!(symbol = %key.symbol, timeframe = %key.timeframe, %start, %end, "backfilling");

        match self.exchange.fetch_range(&key.symbol, key.timeframe, start, end).await {
            Ok(candles) if !candles.is_empty() => {
                let saved = self.store.upsert_candles(candles).await? as i64;
                info!(symbol = %key.symbol, timeframe = %key.timeframe, saved, "backfill saved candles");
                self.store.update_job(job_id, JobUpdate::success(saved)).await?;
                Ok(saved)
            }
            Ok(_) => {
                warn!(symbol = %key.symbol, timeframe = %key.timeframe, "no candles returned for backfill");
                self.store.update_job(job_id, JobUpdate::success(0)).await?;
                Ok(0)
            }
            Err(e) => {
                error!(symbol = %key.symbol, timeframe = %key.timeframe, error = %e, "backfill failed");
                self.store.update_job(job_id, JobUpdate::failed(e.to_string())).await?;
                Err(e.into())
            }
        }
    }

    /// Cartesian product of configured symbols x timeframes, sequential
    /// (bound by the shared rate limiter anyway). Negative counts mark
    /// per-target failures without aborting the rest.
    pub async fn backfill_all(&self, exchange_name: &str, symbols: &[String], timeframes: &[Timeframe], days: i64) -> HashMap<String, i64> {
        let mut results = HashMap::new();
        for symbol in symbols {
            for &timeframe in timeframes {
                let key = SeriesKey::new(exchange_name, symbol.clone(), timeframe);
                let label = format!("{symbol}/{timeframe}");
                match self.backfill_symbol(key, days, None).await {
                    Ok(count) => {
                        results.insert(label, count);
                    }
                    Err(e) => {
                        error!(target = %label, error = %e, "failed to backfill target");
                        results.insert(label, -1);
                    }
                }
            }
        }
        results
    }

    /// Same as [`backfill_symbol`](Self::backfill_symbol) with `start = now
    /// - minutes`, used to close the window between daemon startup and the
    /// WS stream becoming productive.
    pub async fn catchup_recent(&self, key: SeriesKey, minutes: i64) -> Result<i64, crate::error::IngestError> {
        let start = Utc::now() - ChronoDuration::minutes(minutes);
        self.backfill_symbol(key, 0, Some(start)).await
    }

    /// Per-target `fetch_latest(n=10)` then upsert. Used when WS ingestion
    /// is disabled, or as a secondary safety net alongside it.
    pub async fn update_latest(&self, exchange_name: &str, symbols: &[String], timeframes: &[Timeframe]) -> HashMap<String, i64> {
        let mut results = HashMap::new();
        for symbol in symbols {
            for &timeframe in timeframes {
                let label = format!("{symbol}/{timeframe}");
                match self.exchange.fetch_latest(symbol, timeframe, 10).await {
                    Ok(candles) if !candles.is_empty() => match self.store.upsert_candles(candles).await {
                        Ok(saved) => {
                            results.insert(label, saved as i64);
                        }
                        Err(e) => {
                            error!(target = %label, error = %e, "failed to persist latest candles");
                            results.insert(label, -1);
                        }
                    },
                    Ok(_) => {
                        results.insert(label, 0);
                    }
                    Err(e) => {
                        error!(target = %label, error = %e, "failed to fetch latest candles");
                        results.insert(label, -1);
                    }
                }
            }
        }
        let _ = exchange_name;
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::error::ExchangeError;
    use crate::store::StorePool;
    use crate::types::Candle;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StubExchange {
        batches: Mutex<Vec<Vec<Candle>>>,
        seen_starts: Mutex<Vec<DateTime<Utc>>>,
    }

    #[async_trait]
    impl Exchange for StubExchange {
        async fn fetch_range(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<Vec<Candle>, ExchangeError> {
            self.seen_starts.lock().unwrap().push(start);
            Ok(self.batches.lock().unwrap().pop().unwrap_or_default())
        }

        async fn fetch_latest(&self, _symbol: &str, _timeframe: Timeframe, _n: u32) -> Result<Vec<Candle>, ExchangeError> {
            Ok(Vec::new())
        }

        async fn list_symbols(&self) -> Result<Vec<String>, ExchangeError> {
            Ok(Vec::new())
        }
    }

    fn candle_at(t: DateTime<Utc>) -> Candle {
        Candle {
            exchange: "bitfinex".into(),
            symbol: "BTCUSD".into(),
            timeframe: Timeframe::H1,
            open_time: t,
            close_time: t + ChronoDuration::hours(1),
            open: "1".parse().unwrap(),
            high: "1".parse().unwrap(),
            low: "1".parse().unwrap(),
            close: "1".parse().unwrap(),
            volume: "1".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn resumes_from_stored_latest_not_now_minus_days() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.database_url = format!("sqlite://{}", dir.path().join("t.db").display());
        let store = StoreGateway::new(StorePool::open(&settings).unwrap());

        let latest = Utc::now() - ChronoDuration::days(1);
        store.upsert_candles(vec![candle_at(latest)]).await.unwrap();

        let exchange = Arc::new(StubExchange {
            batches: Mutex::new(vec![Vec::new()]),
            seen_starts: Mutex::new(Vec::new()),
        });
        let service = BackfillService::new(store, exchange.clone());

        let key = SeriesKey::new("bitfinex", "BTCUSD", Timeframe::H1);
        service.backfill_symbol(key, 30, None).await.unwrap();

        let seen = exchange.seen_starts.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!((seen[0] - latest).num_seconds().abs() < 2);
    }
}
