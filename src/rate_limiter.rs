//! Global, process-wide request pacing for the REST fetcher (C3).
//!
//! Upstream enforces a narrow request budget and blocks the source address
//! for roughly a minute on breach, so every REST call — regardless of which
//! task issued it — funnels through one shared [`RateLimiter`]. Rather than
//! a singleton reached through a lazily-initialized global, the limiter is
//! constructed once by the supervisor and handed to callers as a cloneable
//! `Arc`-backed handle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::Settings;

#[derive(Debug)]
struct State {
    last_request: Option<Instant>,
    consecutive_rate_limits: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub min_spacing: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub min_backoff_on_429: Duration,
    pub max_retries: u32,
}

impl From<&Settings> for RateLimiterConfig {
    fn from(s: &Settings) -> Self {
        Self {
            min_spacing: Duration::from_secs_f64(s.rate_limit_delay),
            initial_backoff: Duration::from_secs_f64(s.rate_limit_initial_backoff),
            max_backoff: Duration::from_secs_f64(s.rate_limit_max_backoff),
            min_backoff_on_429: Duration::from_secs_f64(s.rate_limit_min_backoff_seconds),
            max_retries: s.rate_limit_max_retries,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterStats {
    pub request_delay: Duration,
    pub consecutive_rate_limits: u32,
}

/// Shared pacing primitive. Cheap to clone; all clones serialize through the
/// same inner mutex.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    state: Arc<Mutex<State>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(State {
                last_request: None,
                consecutive_rate_limits: 0,
            })),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Block until at least `min_spacing` has elapsed since the last granted
    /// slot, then grant this one. Mutually exclusive across all callers —
    /// this is a pacing primitive, not a token bucket, so concurrency never
    /// increases throughput.
    pub async fn acquire(&self) {
        let mut state = self.state.lock().await;
        if let Some(last) = state.last_request {
            let elapsed = last.elapsed();
            if elapsed < self.config.min_spacing {
                tokio::time::sleep(self.config.min_spacing - elapsed).await;
            }
        }
        state.last_request = Some(Instant::now());
    }

    /// A request succeeded; relax the backoff counter toward zero.
    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.consecutive_rate_limits = state.consecutive_rate_limits.saturating_sub(1);
    }

    /// A request was throttled (HTTP 429); bump the counter and return how
    /// long the caller should sleep before retrying.
    pub async fn record_throttled(&self) -> Duration {
        let mut state = self.state.lock().await;
        state.consecutive_rate_limits += 1;
        let exponent = state.consecutive_rate_limits.min(6);
        let backoff = self.config.initial_backoff.mul_f64(2f64.powi(exponent as i32));
        let backoff = backoff.min(self.config.max_backoff);
        backoff.max(self.config.min_backoff_on_429)
    }

    pub async fn stats(&self) -> RateLimiterStats {
        let state = self.state.lock().await;
        RateLimiterStats {
            request_delay: self.config.min_spacing,
            consecutive_rate_limits: state.consecutive_rate_limits,
        }
    }
}
