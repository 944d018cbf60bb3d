//! Application wiring
//! Logging setup and construction of the clients the worker runs against

pub mod init;

pub use init::{init_components, init_logging, parse_log_level, spawn_price_walk, AppComponents};
