//! Crate-wide error types.

use thiserror::Error;

/// Errors surfaced by the store gateway.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("pool exhausted: no connection became available in time")]
    PoolTimeout,
    #[error("connection pre-ping failed: {0}")]
    PrePing(rusqlite::Error),
}

/// Errors surfaced by exchange adapters (REST and WS).
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("upstream rate limited after exhausting retries")]
    RateLimitExhausted,
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("upstream protocol error: {0}")]
    Protocol(String),
}

/// Top-level error for ingestion operations (backfill, gap repair).
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error("configuration error: {0}")]
    Config(String),
}
