//! Candle model and the static timeframe table (C1).

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::fmt;

/// One of the closed set of timeframes this service ingests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
    W1,
}

impl Timeframe {
    /// Parse a config/storage tag like `"1h"` or `"1d"`.
    pub fn parse(tag: &str) -> Option<Self> {
        Some(match tag {
            "1m" => Self::M1,
            "5m" => Self::M5,
            "15m" => Self::M15,
            "30m" => Self::M30,
            "1h" => Self::H1,
            "4h" => Self::H4,
            "1d" => Self::D1,
            "1w" => Self::W1,
            _ => return None,
        })
    }

    /// The tag stored in the database and used in config (`"1h"`, `"1d"`, ...).
    pub fn tag(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1d",
            Self::W1 => "1w",
        }
    }

    /// Bitfinex's candle-channel code for this timeframe. Differs in case
    /// from the tag for day/week (`1D`, `1W`).
    pub fn upstream_code(self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M5 => "5m",
            Self::M15 => "15m",
            Self::M30 => "30m",
            Self::H1 => "1h",
            Self::H4 => "4h",
            Self::D1 => "1D",
            Self::W1 => "1W",
        }
    }

    /// Expected spacing between consecutive candle `open_time`s.
    pub fn delta(self) -> Duration {
        match self {
            Self::M1 => Duration::minutes(1),
            Self::M5 => Duration::minutes(5),
            Self::M15 => Duration::minutes(15),
            Self::M30 => Duration::minutes(30),
            Self::H1 => Duration::hours(1),
            Self::H4 => Duration::hours(4),
            Self::D1 => Duration::hours(24),
            Self::W1 => Duration::days(7),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Identity key for a candle, gap or job: which upstream, which instrument,
/// which bar size.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SeriesKey {
    pub exchange: String,
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl SeriesKey {
    pub fn new(exchange: impl Into<String>, symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            exchange: exchange.into(),
            symbol: symbol.into(),
            timeframe,
        }
    }
}

/// An OHLCV bar. Immutable once stored; identity is
/// `(exchange, symbol, timeframe, open_time)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    pub exchange: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub open_time: DateTime<Utc>,
    pub close_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    /// Always non-negative; upstream volume sign (if any) reflects direction
    /// only and is discarded at parse time.
    pub volume: Decimal,
}

impl Candle {
    pub fn key(&self) -> SeriesKey {
        SeriesKey::new(self.exchange.clone(), self.symbol.clone(), self.timeframe)
    }
}

/// A detected, possibly-repaired hole in a stored candle series.
#[derive(Debug, Clone, PartialEq)]
pub struct CandleGap {
    pub id: Option<i64>,
    pub exchange: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub gap_start: DateTime<Utc>,
    pub gap_end: DateTime<Utc>,
    pub detected_at: DateTime<Utc>,
    pub repaired_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobType {
    Backfill,
    Realtime,
    GapRepair,
}

impl JobType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backfill => "backfill",
            Self::Realtime => "realtime",
            Self::GapRepair => "gap_repair",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "backfill" => Self::Backfill,
            "realtime" => Self::Realtime,
            "gap_repair" => Self::GapRepair,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "running" => Self::Running,
            "success" => Self::Success,
            "failed" => Self::Failed,
            _ => return None,
        })
    }
}

/// Audit record for one unit of fetch work. Append-and-update; never
/// rewritten once it reaches a terminal status.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestionJob {
    pub id: Option<i64>,
    pub exchange: String,
    pub symbol: String,
    pub timeframe: Timeframe,
    pub job_type: JobType,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub candles_fetched: i64,
    pub last_error: Option<String>,
}

impl IngestionJob {
    pub fn new_running(key: &SeriesKey, job_type: JobType, started_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            exchange: key.exchange.clone(),
            symbol: key.symbol.clone(),
            timeframe: key.timeframe,
            job_type,
            status: JobStatus::Running,
            started_at,
            completed_at: None,
            candles_fetched: 0,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_upstream_codes() {
        assert_eq!(Timeframe::D1.upstream_code(), "1D");
        assert_eq!(Timeframe::W1.upstream_code(), "1W");
        assert_eq!(Timeframe::H1.upstream_code(), "1h");
    }

    #[test]
    fn timeframe_round_trips_through_tag() {
        for tf in [
            Timeframe::M1,
            Timeframe::M5,
            Timeframe::M15,
            Timeframe::M30,
            Timeframe::H1,
            Timeframe::H4,
            Timeframe::D1,
            Timeframe::W1,
        ] {
            assert_eq!(Timeframe::parse(tf.tag()), Some(tf));
        }
    }

    #[test]
    fn day_and_week_deltas() {
        assert_eq!(Timeframe::D1.delta(), Duration::hours(24));
        assert_eq!(Timeframe::W1.delta(), Duration::days(7));
    }
}
