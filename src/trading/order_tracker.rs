//! Order tracking
//! In-memory ledger of every order placed for the deal

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::trading::ladder::LadderCursor;

/// Role of a tracked order within the deal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    /// Base order or a manual buy-more order
    #[serde(rename = "BUY")]
    Buy,
    /// The current take-profit order
    #[serde(rename = "SELL")]
    Sell,
    #[serde(rename = "SO")]
    SafetyOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackedStatus {
    New,
    Filled,
}

/// Tracked order entry
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedOrder {
    pub order_id: String,
    pub kind: OrderKind,
    pub status: TrackedStatus,
    /// Ladder state before this safety order's rung was computed
    pub ladder_before: Option<LadderCursor>,
}

impl TrackedOrder {
    pub fn is_open_safety_order(&self) -> bool {
        self.kind == OrderKind::SafetyOrder && self.status == TrackedStatus::New
    }
}

/// Order tracker
///
/// Append-only except for status moving to `Filled`, order ids swapped in
/// place when an order is re-placed, and safety orders withdrawn by an edit.
#[derive(Debug, Clone, Default)]
pub struct OrderTracker {
    orders: Vec<TrackedOrder>,
}

impl OrderTracker {
    /// Create new order tracker
    pub fn new() -> Self {
        Self { orders: Vec::new() }
    }

    /// Track a new order
    pub fn track(&mut self, order_id: &str, kind: OrderKind, status: TrackedStatus) {
        debug!(order_id, ?kind, ?status, "📋 Tracking order");
        self.orders.push(TrackedOrder {
            order_id: order_id.to_string(),
            kind,
            status,
            ladder_before: None,
        });
    }

    /// Track a newly placed safety order with the ladder state it was computed from
    pub fn track_safety_order(&mut self, order_id: &str, ladder_before: LadderCursor) {
        debug!(order_id, rung = ladder_before.steps, "📋 Tracking safety order");
        self.orders.push(TrackedOrder {
            order_id: order_id.to_string(),
            kind: OrderKind::SafetyOrder,
            status: TrackedStatus::New,
            ladder_before: Some(ladder_before),
        });
    }

    /// The current take-profit entry
    pub fn take_profit(&self) -> Option<&TrackedOrder> {
        self.orders.iter().find(|o| o.kind == OrderKind::Sell)
    }

    /// Point the take-profit entry at a new order id
    pub fn replace_take_profit(&mut self, order_id: &str) {
        match self.orders.iter_mut().find(|o| o.kind == OrderKind::Sell) {
            Some(entry) => {
                info!(old = %entry.order_id, new = order_id, "🔁 Take-profit order replaced");
                entry.order_id = order_id.to_string();
                entry.status = TrackedStatus::New;
            }
            None => self.track(order_id, OrderKind::Sell, TrackedStatus::New),
        }
    }

    /// Swap the id of an entry whose order was re-placed, keeping its position
    pub fn replace_order_id(&mut self, old_id: &str, new_id: &str, ladder_before: Option<LadderCursor>) -> bool {
        match self.orders.iter_mut().find(|o| o.order_id == old_id) {
            Some(entry) => {
                entry.order_id = new_id.to_string();
                entry.status = TrackedStatus::New;
                if ladder_before.is_some() {
                    entry.ladder_before = ladder_before;
                }
                true
            }
            None => false,
        }
    }

    /// Mark an order filled; returns false if it is unknown
    pub fn mark_filled(&mut self, order_id: &str) -> bool {
        match self.orders.iter_mut().find(|o| o.order_id == order_id) {
            Some(entry) => {
                entry.status = TrackedStatus::Filled;
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, order_id: &str) -> bool {
        self.orders.iter().any(|o| o.order_id == order_id)
    }

    /// Unfilled safety orders, oldest first
    pub fn open_safety_orders(&self) -> Vec<TrackedOrder> {
        self.orders
            .iter()
            .filter(|o| o.is_open_safety_order())
            .cloned()
            .collect()
    }

    /// Safety orders still tracked, filled or not
    pub fn safety_orders_placed(&self) -> u32 {
        self.orders
            .iter()
            .filter(|o| o.kind == OrderKind::SafetyOrder)
            .count() as u32
    }

    /// Unfilled safety orders
    pub fn active_safety_orders(&self) -> u32 {
        self.orders.iter().filter(|o| o.is_open_safety_order()).count() as u32
    }

    /// The most recently placed unfilled safety order
    pub fn latest_open_safety_order(&self) -> Option<TrackedOrder> {
        self.orders.iter().rev().find(|o| o.is_open_safety_order()).cloned()
    }

    /// Stop tracking an order that was withdrawn
    pub fn remove(&mut self, order_id: &str) -> Option<TrackedOrder> {
        let index = self.orders.iter().position(|o| o.order_id == order_id)?;
        Some(self.orders.remove(index))
    }

    /// Every unfilled order, take-profit first
    pub fn unfilled(&self) -> Vec<TrackedOrder> {
        let mut unfilled: Vec<TrackedOrder> = self
            .orders
            .iter()
            .filter(|o| o.status == TrackedStatus::New)
            .cloned()
            .collect();
        unfilled.sort_by_key(|o| o.kind != OrderKind::Sell);
        unfilled
    }

    pub fn all(&self) -> &[TrackedOrder] {
        &self.orders
    }

    /// Get order count
    pub fn count(&self) -> usize {
        self.orders.len()
    }
}
