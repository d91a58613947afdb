//! Bitfinex REST adapter (C4): paginated historical fetch, latest-N fetch,
//! and symbol listing, all paced through the shared [`RateLimiter`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::warn;

use crate::error::ExchangeError;
use crate::rate_limiter::RateLimiter;
use crate::types::{Candle, Timeframe};

use super::Exchange;

const BASE_URL: &str = "https://api-pub.bitfinex.com/v2";

/// Extra pause between paginated requests, on top of the rate limiter's
/// spacing.
const INTER_PAGE_DELAY: Duration = Duration::from_millis(200);

/// Upstream caps a single page at 10,000 candles.
const MAX_PAGE_SIZE: u32 = 10_000;

fn api_symbol(symbol: &str) -> String {
    if symbol.starts_with('t') {
        symbol.to_string()
    } else {
        format!("t{symbol}")
    }
}

fn strip_symbol_prefix(symbol: &str) -> String {
    symbol.strip_prefix('t').unwrap_or(symbol).to_string()
}

fn parse_candle_row(row: &Value, exchange: &str, symbol: &str, timeframe: Timeframe) -> Result<Candle, ExchangeError> {
    let arr = row
        .as_array()
        .ok_or_else(|| ExchangeError::MalformedPayload("candle row is not an array".to_string()))?;
    if arr.len() != 6 {
        return Err(ExchangeError::MalformedPayload(format!("expected 6-tuple, got {}", arr.len())));
    }

    let as_f64 = |v: &Value| v.as_f64().ok_or_else(|| ExchangeError::MalformedPayload("non-numeric field".to_string()));
    let as_decimal = |v: &Value| -> Result<Decimal, ExchangeError> {
        // Round-trip through the JSON number's own text when possible to
        // avoid any float-to-decimal precision surprises; fall back to the
        // parsed f64 only if serde_json gives us a non-numeric shape.
        if let Some(s) = v.as_str() {
            s.parse().map_err(|_| ExchangeError::MalformedPayload("unparseable decimal".to_string()))
        } else {
            let f = as_f64(v)?;
            Decimal::try_from(f).map_err(|_| ExchangeError::MalformedPayload("decimal overflow".to_string()))
        }
    };

    let ts_ms = as_f64(&arr[0])? as i64;
    let open = as_decimal(&arr[1])?;
    let close = as_decimal(&arr[2])?;
    let high = as_decimal(&arr[3])?;
    let low = as_decimal(&arr[4])?;
    let volume = as_decimal(&arr[5])?;

    let open_time = Utc
        .timestamp_millis_opt(ts_ms)
        .single()
        .ok_or_else(|| ExchangeError::MalformedPayload("invalid timestamp".to_string()))?;
    let close_time = open_time + timeframe.delta();

    Ok(Candle {
        exchange: exchange.to_string(),
        symbol: symbol.to_string(),
        timeframe,
        open_time,
        close_time,
        open,
        high,
        low,
        close,
        volume: volume.abs(),
    })
}

pub struct BitfinexAdapter {
    client: reqwest::Client,
    rate_limiter: RateLimiter,
}

impl BitfinexAdapter {
    pub fn new(rate_limiter: RateLimiter) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client builds with static config");
        Self { client, rate_limiter }
    }

    /// Issue one GET, applying the shared rate limiter and this adapter's
    /// own retry/backoff policy. Returns `Ok(None)` if every retry was
    /// exhausted without a usable response, matching the original's
    /// "give up and let the caller resume next cycle" contract.
    async fn request_with_retry(&self, url: &str, query: &[(&str, String)]) -> Result<Option<Value>, ExchangeError> {
        let max_retries = self.rate_limiter.max_retries();

        for attempt in 0..max_retries {
            self.rate_limiter.acquire().await;

            let response = self.client.get(url).query(query).send().await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    warn!(attempt, error = %e, "bitfinex request transport error");
                    if attempt + 1 == max_retries {
                        return Ok(None);
                    }
                    continue;
                }
            };

            if response.status().as_u16() == 429 {
                let backoff = self.rate_limiter.record_throttled().await;
                warn!(attempt, backoff_secs = backoff.as_secs_f64(), "bitfinex rate limited");
                tokio::time::sleep(backoff).await;
                continue;
            }

            if !response.status().is_success() {
                warn!(attempt, status = %response.status(), "bitfinex http error");
                if attempt + 1 == max_retries {
                    return Ok(None);
                }
                continue;
            }

            self.rate_limiter.record_success().await;
            let body: Value = response.json().await?;
            return Ok(Some(body));
        }

        Ok(None)
    }
}

#[async_trait]
impl Exchange for BitfinexAdapter {
    async fn fetch_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let api_symbol = api_symbol(symbol);
        let plain_symbol = strip_symbol_prefix(&api_symbol);
        let url = format!("{BASE_URL}/candles/trade:{}:{api_symbol}/hist", timeframe.upstream_code());

        let mut all_candles = Vec::new();
        let mut cursor = start;

        while cursor < end {
            let query = [
                ("start", cursor.timestamp_millis().to_string()),
                ("end", end.timestamp_millis().to_string()),
                ("limit", MAX_PAGE_SIZE.to_string()),
                ("sort", "1".to_string()),
            ];

            let Some(body) = self.request_with_retry(&url, &query).await? else {
                break;
            };
            let rows = match body.as_array() {
                Some(rows) if !rows.is_empty() => rows,
                _ => break,
            };

            let mut page_last_close: Option<DateTime<Utc>> = None;
            for row in rows {
                match parse_candle_row(row, "bitfinex", &plain_symbol, timeframe) {
                    Ok(candle) => {
                        page_last_close = Some(candle.close_time);
                        all_candles.push(candle);
                    }
                    Err(e) => warn!(error = %e, "skipping malformed candle row"),
                }
            }

            // A page with rows but nothing parseable can't advance the
            // cursor; break rather than re-requesting the same window
            // forever.
            match page_last_close {
                Some(close_time) => cursor = close_time,
                None => {
                    warn!("page yielded no parseable candles, aborting fetch_range");
                    break;
                }
            }

            tokio::time::sleep(INTER_PAGE_DELAY).await;
        }

        Ok(all_candles)
    }

    async fn fetch_latest(&self, symbol: &str, timeframe: Timeframe, n: u32) -> Result<Vec<Candle>, ExchangeError> {
        let api_symbol = api_symbol(symbol);
        let plain_symbol = strip_symbol_prefix(&api_symbol);
        let url = format!("{BASE_URL}/candles/trade:{}:{api_symbol}/hist", timeframe.upstream_code());

        let query = [("limit", n.to_string()), ("sort", "-1".to_string())];
        let Some(body) = self.request_with_retry(&url, &query).await? else {
            return Ok(Vec::new());
        };
        let rows = body.as_array().cloned().unwrap_or_default();

        let mut candles: Vec<Candle> = rows
            .iter()
            .filter_map(|row| match parse_candle_row(row, "bitfinex", &plain_symbol, timeframe) {
                Ok(c) => Some(c),
                Err(e) => {
                    warn!(error = %e, "skipping malformed candle row");
                    None
                }
            })
            .collect();

        candles.reverse();
        Ok(candles)
    }

    async fn list_symbols(&self) -> Result<Vec<String>, ExchangeError> {
        let url = format!("{BASE_URL}/conf/pub:list:pair:exchange");
        let Some(body) = self.request_with_retry(&url, &[]).await? else {
            return Ok(Vec::new());
        };
        let symbols = body
            .as_array()
            .and_then(|outer| outer.first())
            .and_then(|inner| inner.as_array())
            .map(|list| list.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        Ok(symbols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_seed_candle_row() {
        let row = serde_json::json!([1700000000000i64, 100.0, 101.0, 102.0, 99.5, -123.456]);
        let candle = parse_candle_row(&row, "bitfinex", "BTCUSD", Timeframe::H1).unwrap();

        assert_eq!(candle.open_time, Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap());
        assert_eq!(candle.close_time, Utc.with_ymd_and_hms(2023, 11, 14, 23, 13, 20).unwrap());
        assert_eq!(candle.open, Decimal::try_from(100.0f64).unwrap());
        assert_eq!(candle.high, Decimal::try_from(102.0f64).unwrap());
        assert_eq!(candle.low, Decimal::try_from(99.5f64).unwrap());
        assert_eq!(candle.close, Decimal::try_from(101.0f64).unwrap());
        assert_eq!(candle.volume, Decimal::try_from(123.456f64).unwrap());
    }

    #[test]
    fn symbol_normalization_adds_and_strips_t_prefix() {
        assert_eq!(api_symbol("BTCUSD"), "tBTCUSD");
        assert_eq!(api_symbol("tBTCUSD"), "tBTCUSD");
        assert_eq!(strip_symbol_prefix("tBTCUSD"), "BTCUSD");
    }

    #[test]
    fn rejects_malformed_row_shape() {
        let row = serde_json::json!([1, 2, 3]);
        assert!(parse_candle_row(&row, "bitfinex", "BTCUSD", Timeframe::H1).is_err());
    }
}
