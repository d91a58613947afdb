//! Process entry point: tracing init, layered config load, schema init,
//! and the supervisor run loop. Mirrors
//! `original_source/src/market_data/daemon.py`'s `main()`, minus the HTTP
//! query API thread (out of scope, see spec.md §1).

use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use market_data_ingestor::config::Settings;
use market_data_ingestor::exchange::bitfinex::BitfinexAdapter;
use market_data_ingestor::rate_limiter::{RateLimiter, RateLimiterConfig};
use market_data_ingestor::store::{StoreGateway, StorePool};
use market_data_ingestor::supervisor::Supervisor;
use tracing_subscriber::EnvFilter;

const EXCHANGE_NAME: &str = "bitfinex";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .compact()
        .init();

    let settings = Settings::load().context("failed to load configuration")?;

    // Schema init failure is the one fatal condition in this daemon; every
    // other error is logged and recorded per spec.md §7.
    let pool = StorePool::open(&settings).context("failed to initialize store schema")?;
    let store = StoreGateway::new(pool);

    let rate_limiter = RateLimiter::new(RateLimiterConfig::from(&settings));
    let exchange = Arc::new(BitfinexAdapter::new(rate_limiter));

    let supervisor = Supervisor::new(settings, store, exchange);
    let running = supervisor.running_handle();

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("ctrl-c received");
        running.store(false, Ordering::SeqCst);
    });

    supervisor.run(EXCHANGE_NAME).await;

    Ok(())
}
