//! DCA Dealbot - one worker per dollar-cost-averaging deal
//!
//! Features:
//! - Base market buy followed by a take-profit and a ladder of safety orders
//! - Take-profit re-priced on every averaging fill
//! - Operator control through the deal record: cancel, close at market, buy more, edit
//! - Idempotent order submission with retry and backoff
//! - Paper brokerage and in-memory store for simulation

pub mod api;
pub mod app;
pub mod trading;
pub mod utils;
pub mod config;

// Re-export commonly used types
pub use api::{
    ApiError, Brokerage, BrokerOrder, DealRecord, DealStatus, DealStore, HttpBrokerage,
    HttpDocumentStore, MemoryStore, OrderRecord, PaperBrokerage, StrategyRecord,
};
pub use trading::{
    DealError, DealLedger, DealOutcome, DealResult, DealWorker, LadderCursor, LadderParams,
    OrderTracker, Profit,
};
pub use config::{Config, ConfigError};
pub use utils::{retry, rate_limiter};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DealbotError {
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("API error: {0}")]
    Api(#[from] api::ApiError),
    #[error("Deal error: {0}")]
    Deal(#[from] trading::DealError),
}

/// Bot version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
