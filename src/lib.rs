//! Market data ingestion engine: candle model, storage gateway, rate limiting,
//! exchange adapters, backfill/gap services and the daemon supervisor that
//! ties them together.

pub mod backfill;
pub mod config;
pub mod error;
pub mod exchange;
pub mod gap;
pub mod rate_limiter;
pub mod store;
pub mod supervisor;
pub mod types;
