//! Exchange abstraction: a capability set any upstream could implement.
//! `subscribe` is deliberately not part of this trait — it is a capability
//! of the concrete WebSocket client ([`bitfinex_ws`]), not of the REST
//! fetcher, since the latter genuinely cannot provide it.

pub mod bitfinex;
pub mod bitfinex_ws;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ExchangeError;
use crate::types::{Candle, Timeframe};

#[async_trait]
pub trait Exchange: Send + Sync {
    /// Paginated historical fetch over `[start, end)`, ascending by
    /// `open_time`.
    async fn fetch_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, ExchangeError>;

    /// Most recent `n` candles, ascending by `open_time`.
    async fn fetch_latest(&self, symbol: &str, timeframe: Timeframe, n: u32) -> Result<Vec<Candle>, ExchangeError>;

    async fn list_symbols(&self) -> Result<Vec<String>, ExchangeError>;
}
