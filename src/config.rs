//! Daemon configuration, layered defaults -> optional file -> environment,
//! mirroring the field set of the Python service this daemon replaces.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::IngestError;
use crate::types::Timeframe;

const ENV_PREFIX: &str = "MD";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_url: String,

    pub bitfinex_symbols: String,
    pub bitfinex_timeframes: String,

    pub backfill_on_startup: bool,
    pub rest_update_enabled: bool,
    pub backfill_days: i64,
    pub gap_repair_max_repairs_per_run: u32,
    pub gap_detection_interval_minutes: u64,
    pub gap_repair_interval_minutes: u64,
    pub update_interval_seconds: u64,
    pub health_check_interval_seconds: u64,

    pub ws_ingestion_enabled: bool,
    pub ws_catchup_lookback_minutes: i64,
    pub ws_reconnect_initial_backoff: f64,
    pub ws_reconnect_max_backoff: f64,
    pub ws_save_batch_size: usize,
    pub ws_save_flush_seconds: f64,
    pub ws_max_subscriptions_per_connection: usize,

    pub rate_limit_delay: f64,
    pub rate_limit_max_retries: u32,
    pub rate_limit_initial_backoff: f64,
    pub rate_limit_min_backoff_seconds: f64,
    pub rate_limit_max_backoff: f64,

    pub retention_1m: i64,
    pub retention_1h: i64,
    pub retention_4h: i64,
    pub retention_1d: i64,

    pub store_pool_size: u32,
    pub store_pool_overflow: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://market_data.db".to_string(),

            bitfinex_symbols: "BTCUSD,ETHUSD".to_string(),
            bitfinex_timeframes: "1h,1d".to_string(),

            backfill_on_startup: true,
            rest_update_enabled: false,
            backfill_days: 365,
            gap_repair_max_repairs_per_run: 10,
            gap_detection_interval_minutes: 60,
            gap_repair_interval_minutes: 60,
            update_interval_seconds: 60,
            health_check_interval_seconds: 30,

            ws_ingestion_enabled: true,
            ws_catchup_lookback_minutes: 180,
            ws_reconnect_initial_backoff: 1.0,
            ws_reconnect_max_backoff: 60.0,
            ws_save_batch_size: 200,
            ws_save_flush_seconds: 2.0,
            ws_max_subscriptions_per_connection: 25,

            rate_limit_delay: 6.0,
            rate_limit_max_retries: 10,
            rate_limit_initial_backoff: 2.0,
            rate_limit_min_backoff_seconds: 60.0,
            rate_limit_max_backoff: 120.0,

            retention_1m: 30,
            retention_1h: 365,
            retention_4h: 730,
            retention_1d: 1825,

            store_pool_size: 5,
            store_pool_overflow: 10,
        }
    }
}

impl Settings {
    /// Load layered configuration: compiled-in defaults, an optional
    /// `config/default.toml` / `.env`-style file, then `MD_*` environment
    /// overrides.
    pub fn load() -> Result<Self, IngestError> {
        let defaults = Settings::default();
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&defaults).map_err(|e| IngestError::Config(e.to_string()))?)
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("_"));

        let built = builder.build().map_err(|e| IngestError::Config(e.to_string()))?;
        built.try_deserialize().map_err(|e| IngestError::Config(e.to_string()))
    }

    pub fn symbols(&self) -> Vec<String> {
        self.bitfinex_symbols.split(',').map(|s| s.trim().to_string()).collect()
    }

    pub fn timeframes(&self) -> Vec<Timeframe> {
        self.bitfinex_timeframes
            .split(',')
            .filter_map(|s| Timeframe::parse(s.trim()))
            .collect()
    }

    pub fn retention_days(&self) -> HashMap<Timeframe, i64> {
        let mut map = HashMap::new();
        map.insert(Timeframe::M1, self.retention_1m);
        map.insert(Timeframe::H1, self.retention_1h);
        map.insert(Timeframe::H4, self.retention_4h);
        map.insert(Timeframe::D1, self.retention_1d);
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_symbols_and_timeframes() {
        let settings = Settings::default();
        assert_eq!(settings.symbols(), vec!["BTCUSD", "ETHUSD"]);
        assert_eq!(settings.timeframes(), vec![Timeframe::H1, Timeframe::D1]);
    }

    #[test]
    fn conservative_rate_limit_default() {
        assert_eq!(Settings::default().rate_limit_delay, 6.0);
    }
}
