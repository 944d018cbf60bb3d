//! Trading module
//! Deal lifecycle: ladder math, running totals, order tracking and the worker that drives them

pub mod errors;
pub mod ladder;
pub mod ledger;
pub mod order_tracker;
pub mod stats;
pub mod gateway;
pub mod persistence;
pub mod signals;
pub mod monitor;
pub mod listener;
pub mod worker;

pub use errors::{DealError, DealResult};
pub use ladder::{clamp_stop, compute_step, LadderCursor, LadderParams, LadderStep};
pub use ledger::{DealLedger, Profit, TakeProfitTarget};
pub use order_tracker::{OrderKind, OrderTracker, TrackedOrder, TrackedStatus};
pub use stats::DealStats;
pub use gateway::ExchangeGateway;
pub use persistence::{PersistenceSync, TotalsSnapshot};
pub use signals::{Signal, SignalReceiver, SignalSender, TerminalSignal};
pub use monitor::OrderMonitor;
pub use listener::{intent_of, ControlIntent, ControlListener};
pub use worker::{DealContext, DealOutcome, DealPhase, DealState, DealWorker};
