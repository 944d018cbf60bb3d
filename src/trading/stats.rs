//! Deal statistics
//! Per-deal counters reported at close-out

use serde::{Deserialize, Serialize};

/// Deal statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DealStats {
    pub start_time: String,
    pub orders_placed: u64,
    pub orders_filled: u64,
    pub orders_cancelled: u64,
    pub safety_orders_filled: u64,
    pub take_profit_replacements: u64,
    pub edits_handled: u64,
    pub buy_more_handled: u64,
    pub total_volume: f64,
    pub last_update: String,
}

impl DealStats {
    /// Create new stats with current time
    pub fn new() -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            start_time: now.clone(),
            last_update: now,
            ..Default::default()
        }
    }

    /// Record order placed with its notional
    pub fn record_order_placed(&mut self, notional: f64) {
        self.orders_placed += 1;
        self.total_volume += notional;
        self.update_time();
    }

    pub fn record_order_filled(&mut self) {
        self.orders_filled += 1;
        self.update_time();
    }

    pub fn record_safety_order_filled(&mut self) {
        self.safety_orders_filled += 1;
        self.record_order_filled();
    }

    pub fn record_order_cancelled(&mut self) {
        self.orders_cancelled += 1;
        self.update_time();
    }

    pub fn record_take_profit_replaced(&mut self) {
        self.take_profit_replacements += 1;
        self.update_time();
    }

    pub fn record_edit(&mut self) {
        self.edits_handled += 1;
        self.update_time();
    }

    pub fn record_buy_more(&mut self) {
        self.buy_more_handled += 1;
        self.update_time();
    }

    fn update_time(&mut self) {
        self.last_update = chrono::Utc::now().to_rfc3339();
    }

    /// One-line summary for the close-out log
    pub fn summary(&self) -> String {
        format!(
            "placed={} filled={} (safety={}) cancelled={} tp_replaced={} edits={} buy_more={} volume=${:.2}",
            self.orders_placed,
            self.orders_filled,
            self.safety_orders_filled,
            self.orders_cancelled,
            self.take_profit_replacements,
            self.edits_handled,
            self.buy_more_handled,
            self.total_volume
        )
    }
}
