//! Daemon supervisor (C8): lifecycle, concurrent task fan-out, and the
//! batched realtime persister (§4.8). Grounded in
//! `original_source/src/market_data/daemon.py`'s `MarketDataDaemon.run`,
//! extended with the WebSocket ingestion path spec.md §4.7 calls for but
//! the original's distilled `daemon.py` never wired up.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::backfill::BackfillService;
use crate::config::Settings;
use crate::exchange::Exchange;
use crate::exchange::bitfinex_ws::{CandleStream, CandleSubscription, RealtimeSink};
use crate::gap::GapService;
use crate::store::StoreGateway;
use crate::types::{Candle, SeriesKey};

/// Bounded realtime queue capacity (§4.8). Producers never block: a full
/// queue drops the candle and bumps a counter logged every 1,000 drops.
const REALTIME_QUEUE_CAPACITY: usize = 10_000;

/// Orchestrates the full ingestion engine: WS streamers + batched
/// persister, startup catch-up, full backfill, and the periodic
/// gap-maintenance/update/retention/health tasks, all joined on a shared
/// running flag rather than a cancellation-token library — an explicit
/// `AtomicBool` flag checked between loop iterations (see DESIGN.md's
/// "Cancellation model" entry for where this pattern is grounded).
pub struct Supervisor {
    settings: Settings,
    store: StoreGateway,
    exchange: Arc<dyn Exchange>,
    backfill: BackfillService,
    running: Arc<AtomicBool>,
}

impl Supervisor {
    pub fn new(settings: Settings, store: StoreGateway, exchange: Arc<dyn Exchange>) -> Self {
        let backfill = BackfillService::new(store.clone(), exchange.clone());
        Self {
            settings,
            store,
            exchange,
            backfill,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn running_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Drive the daemon until `running` is cleared. The caller is
    /// responsible for flipping that flag on a stop signal (e.g. a
    /// `tokio::signal::ctrl_c()` task).
    pub async fn run(&self, exchange_name: &str) {
        self.running.store(true, Ordering::SeqCst);

        info!("====================================================");
        info!("Market Data Service Starting");
        info!(symbols = ?self.settings.symbols(), timeframes = ?self.settings.timeframes().iter().map(|t| t.tag()).collect::<Vec<_>>(), "configuration loaded");
        info!("====================================================");

        let symbols = self.settings.symbols();
        let timeframes = self.settings.timeframes();

        let (tx, rx) = mpsc::channel::<Candle>(REALTIME_QUEUE_CAPACITY);

        let mut streamer_stops = Vec::new();
        let mut join_set = tokio::task::JoinSet::new();

        if self.settings.ws_ingestion_enabled {
            info!("starting websocket ingestion");
            for shard in self.shard_subscriptions(&symbols, &timeframes) {
                let stream = CandleStream::new(
                    shard,
                    std::time::Duration::from_secs_f64(self.settings.ws_reconnect_initial_backoff),
                    std::time::Duration::from_secs_f64(self.settings.ws_reconnect_max_backoff),
                );
                streamer_stops.push(stream.stop_handle());
                let sink = RealtimeSink::new(tx.clone());
                join_set.spawn(async move { stream.run(sink).await });
            }

            for symbol in &symbols {
                for &timeframe in &timeframes {
                    let key = SeriesKey::new(exchange_name, symbol.clone(), timeframe);
                    if let Err(e) = self.backfill.catchup_recent(key, self.settings.ws_catchup_lookback_minutes).await {
                        warn!(symbol = %symbol, timeframe = %timeframe, error = %e, "ws catch-up failed");
                    }
                }
            }
        } else {
            info!("websocket ingestion disabled; relying on REST update loop");
        }
        drop(tx);

        let persister_running = self.running.clone();
        let persister_store = self.store.clone();
        let batch_size = self.settings.ws_save_batch_size;
        let flush_interval = std::time::Duration::from_secs_f64(self.settings.ws_save_flush_seconds);
        join_set.spawn(async move {
            run_persister(rx, persister_store, batch_size, flush_interval, persister_running).await;
        });

        if self.settings.backfill_on_startup {
            info!(days = self.settings.backfill_days, "starting full backfill");
            let results = self.backfill.backfill_all(exchange_name, &symbols, &timeframes, self.settings.backfill_days).await;
            let total: i64 = results.values().filter(|&&v| v > 0).sum();
            info!(total, targets = results.len(), "backfill complete");
        } else {
            info!("backfill on startup disabled");
        }

        if self.settings.rest_update_enabled {
            let running = self.running.clone();
            let backfill = BackfillService::new(self.store.clone(), self.exchange.clone());
            let symbols = symbols.clone();
            let timeframes = timeframes.clone();
            let interval = std::time::Duration::from_secs(self.settings.update_interval_seconds);
            let exchange_name = exchange_name.to_string();
            join_set.spawn(async move {
                run_periodic(running, interval, || async {
                    let results = backfill.update_latest(&exchange_name, &symbols, &timeframes).await;
                    let total: i64 = results.values().filter(|&&v| v > 0).sum();
                    if total > 0 {
                        info!(total, "incremental update persisted candles");
                    }
                })
                .await;
            });
        }

        {
            let running = self.running.clone();
            let gap = GapService::new(self.store.clone(), self.exchange.clone());
            let symbols = symbols.clone();
            let timeframes = timeframes.clone();
            let interval = std::time::Duration::from_secs(self.settings.gap_repair_interval_minutes * 60);
            let max_repairs = self.settings.gap_repair_max_repairs_per_run;
            let exchange_name = exchange_name.to_string();
            join_set.spawn(async move {
                run_periodic(running, interval, || async {
                    match gap.run_maintenance(&exchange_name, &symbols, &timeframes, max_repairs).await {
                        Ok(report) => info!(
                            new_gaps = report.new_gaps_detected,
                            repaired = report.gaps_repaired,
                            failures = report.repair_failures,
                            "gap maintenance complete"
                        ),
                        Err(e) => error!(error = %e, "gap maintenance failed"),
                    }
                })
                .await;
            });
        }

        {
            let running = self.running.clone();
            let store = self.store.clone();
            let retention = self.settings.retention_days();
            join_set.spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(3_600)).await;
                run_periodic(running, std::time::Duration::from_secs(86_400), || async {
                    match store.cleanup_retention(retention.clone()).await {
                        Ok(deleted) => {
                            let total: i64 = deleted.values().sum();
                            if total > 0 {
                                info!(total, "retention cleanup deleted old candles");
                            } else {
                                info!("retention cleanup: nothing to delete");
                            }
                        }
                        Err(e) => error!(error = %e, "retention cleanup failed"),
                    }
                })
                .await;
            });
        }

        {
            let running = self.running.clone();
            let store = self.store.clone();
            let interval = std::time::Duration::from_secs(self.settings.health_check_interval_seconds);
            join_set.spawn(async move {
                run_periodic(running, interval, || async {
                    match store.status_summary().await {
                        Ok(rows) => info!(targets = rows.len(), "health check: store reachable"),
                        Err(e) => error!(error = %e, "health check failed"),
                    }
                })
                .await;
            });
        }

        info!("daemon running; send a stop signal to shut down");

        while self.running.load(Ordering::SeqCst) {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }

        info!("stop signal received, shutting down");
        for stop in &streamer_stops {
            stop.store(true, Ordering::SeqCst);
        }

        while let Some(res) = join_set.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "supervised task panicked");
            }
        }

        info!("daemon stopped");
    }

    /// Partition the full (symbol, timeframe) subscription set into shards
    /// of at most `ws_max_subscriptions_per_connection`, one [`CandleStream`]
    /// per shard, so a single connection's reconnect cycle never interrupts
    /// the others.
    fn shard_subscriptions(&self, symbols: &[String], timeframes: &[crate::types::Timeframe]) -> Vec<Vec<CandleSubscription>> {
        let mut all = Vec::new();
        for symbol in symbols {
            for &timeframe in timeframes {
                all.push(CandleSubscription { symbol: symbol.clone(), timeframe });
            }
        }

        let shard_size = self.settings.ws_max_subscriptions_per_connection.max(1);
        all.chunks(shard_size).map(|c| c.to_vec()).collect()
    }
}

/// Run `tick` every `interval` until `running` is cleared. Observes the
/// flag only between iterations, so an in-flight tick is allowed to
/// complete, matching spec.md §5's cancellation model.
async fn run_periodic<F, Fut>(running: Arc<AtomicBool>, interval: std::time::Duration, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    while running.load(Ordering::SeqCst) {
        tick().await;
        let deadline = tokio::time::Instant::now() + interval;
        while running.load(Ordering::SeqCst) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        }
    }
}

/// Single consumer task (§4.8): drains the realtime queue into batches of
/// up to `batch_size`, flushing whichever comes first — the batch filling
/// up or `flush_interval` elapsing — and upserts through the store. A
/// persistence error is logged and the loop continues; the bar is
/// ephemeral and will be re-emitted by the next WS update.
async fn run_persister(
    mut rx: mpsc::Receiver<Candle>,
    store: StoreGateway,
    batch_size: usize,
    flush_interval: std::time::Duration,
    running: Arc<AtomicBool>,
) {
    let mut batch = Vec::with_capacity(batch_size);

    loop {
        let mut flush_timer = Box::pin(tokio::time::sleep(flush_interval));

        tokio::select! {
            maybe_candle = rx.recv() => {
                match maybe_candle {
                    Some(candle) => {
                        batch.push(candle);
                        if batch.len() >= batch_size {
                            flush(&store, &mut batch).await;
                        }
                    }
                    None => {
                        // All producers gone: drain whatever is left, flush once more, exit.
                        flush(&store, &mut batch).await;
                        break;
                    }
                }
            }
            _ = &mut flush_timer => {
                if !batch.is_empty() {
                    flush(&store, &mut batch).await;
                }
                if !running.load(Ordering::SeqCst) {
                    break;
                }
            }
        }
    }
}

async fn flush(store: &StoreGateway, batch: &mut Vec<Candle>) {
    if batch.is_empty() {
        return;
    }
    let to_write = std::mem::take(batch);
    let n = to_write.len();
    match store.upsert_candles(to_write).await {
        Ok(saved) => info!(saved, "realtime batch persisted"),
        Err(e) => error!(error = %e, attempted = n, "realtime batch persist failed"),
    }
}
