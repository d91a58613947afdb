//! Gap service (C7): detection from the stored series, repair by re-fetching
//! the missing range through the REST fetcher. Detected gaps are never
//! filled by interpolation — only by real upstream data.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{error, info, warn};

use crate::error::IngestError;
use crate::exchange::Exchange;
use crate::store::{JobUpdate, StoreGateway};
use crate::types::{CandleGap, IngestionJob, JobType, SeriesKey, Timeframe};

/// Summary of one `run_maintenance` cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct MaintenanceReport {
    pub new_gaps_detected: u32,
    pub gaps_repaired: u32,
    pub repair_failures: u32,
}

pub struct GapService {
    store: StoreGateway,
    exchange: Arc<dyn Exchange>,
}

impl GapService {
    pub fn new(store: StoreGateway, exchange: Arc<dyn Exchange>) -> Self {
        Self { store, exchange }
    }

    /// Scan stored candles in `[start, end)` ordered ascending and emit a
    /// gap for every consecutive pair whose spacing exceeds `Δ(timeframe)`
    /// by more than a 5% tolerance. Series with fewer than two candles
    /// yield no gaps.
    pub async fn detect(&self, key: SeriesKey, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<CandleGap>, IngestError> {
        let candles = self.store.get_candles(key.clone(), Some(start), Some(end), 100_000).await?;
        if candles.len() < 2 {
            return Ok(Vec::new());
        }

        let expected = key.timeframe.delta();
        let tolerance = expected * 5 / 100;
        let mut gaps = Vec::new();

        for pair in candles.windows(2) {
            let (current, next) = (&pair[0], &pair[1]);
            let actual = next.open_time - current.close_time;
            if actual > expected + tolerance {
                let gap = CandleGap {
                    id: None,
                    exchange: key.exchange.clone(),
                    symbol: key.symbol.clone(),
                    timeframe: key.timeframe,
                    gap_start: current.close_time,
                    gap_end: next.open_time,
                    detected_at: Utc::now(),
                    repaired_at: None,
                };
                info!(symbol = %key.symbol, timeframe = %key.timeframe, start = %gap.gap_start, end = %gap.gap_end, "gap detected");
                gaps.push(gap);
            }
        }

        Ok(gaps)
    }

    /// Detect gaps over the trailing 30 days for every configured target
    /// and persist them. Returns the count of genuinely new gaps (the
    /// uniqueness key absorbs repeats across cycles).
    pub async fn detect_and_save(&self, exchange_name: &str, symbols: &[String], timeframes: &[Timeframe]) -> Result<u32, IngestError> {
        let end = Utc::now();
        let start = end - ChronoDuration::days(30);
        let mut new_gaps = 0;

        for symbol in symbols {
            for &timeframe in timeframes {
                let key = SeriesKey::new(exchange_name, symbol.clone(), timeframe);
                for gap in self.detect(key, start, end).await? {
                    if self.store.save_gap(gap).await? != 0 {
                        new_gaps += 1;
                    }
                }
            }
        }

        info!(new_gaps, "gap detection cycle complete");
        Ok(new_gaps)
    }

    /// Re-fetch `[gap.gap_start, gap.gap_end)` and upsert. On success the
    /// gap is marked repaired; on failure it is left for the next cycle.
    pub async fn repair(&self, gap: CandleGap) -> Result<i64, IngestError> {
        let key = SeriesKey::new(gap.exchange.clone(), gap.symbol.clone(), gap.timeframe);
        let job = IngestionJob::new_running(&key, JobType::GapRepair, Utc::now());
        let job_id = self.store.create_job(job).await?;

        info!(symbol = %gap.symbol, timeframe = %gap.timeframe, start = %gap.gap_start, end = %gap.gap_end, "repairing gap");

        match self.exchange.fetch_range(&gap.symbol, gap.timeframe, gap.gap_start, gap.gap_end).await {
            Ok(candles) => {
                let saved = if candles.is_empty() {
                    warn!(symbol = %gap.symbol, timeframe = %gap.timeframe, "no candles returned for gap repair");
                    0
                } else {
                    self.store.upsert_candles(candles).await? as i64
                };

                if let Some(id) = gap.id {
                    self.store.mark_gap_repaired(id).await?;
                }
                self.store.update_job(job_id, JobUpdate::success(saved)).await?;
                Ok(saved)
            }
            Err(e) => {
                error!(symbol = %gap.symbol, timeframe = %gap.timeframe, error = %e, "gap repair failed");
                self.store.update_job(job_id, JobUpdate::failed(e.to_string())).await?;
                Err(e.into())
            }
        }
    }

    /// Repair every currently unrepaired gap, optionally bounded by
    /// `max_repairs` (0 = unlimited).
    pub async fn repair_all(&self, max_repairs: u32) -> Result<MaintenanceReport, IngestError> {
        let gaps = self.store.unrepaired_gaps(None).await?;
        let mut report = MaintenanceReport::default();

        for gap in gaps {
            if max_repairs != 0 && report.gaps_repaired + report.repair_failures >= max_repairs {
                break;
            }
            match self.repair(gap).await {
                Ok(_) => report.gaps_repaired += 1,
                Err(e) => {
                    error!(error = %e, "failed to repair gap");
                    report.repair_failures += 1;
                }
            }
        }

        Ok(report)
    }

    /// Detect then repair; called on a timer by the supervisor.
    pub async fn run_maintenance(
        &self,
        exchange_name: &str,
        symbols: &[String],
        timeframes: &[Timeframe],
        max_repairs_per_run: u32,
    ) -> Result<MaintenanceReport, IngestError> {
        let new_gaps_detected = self.detect_and_save(exchange_name, symbols, timeframes).await?;
        let mut report = self.repair_all(max_repairs_per_run).await?;
        report.new_gaps_detected = new_gaps_detected;
        Ok(report)
    }
}
