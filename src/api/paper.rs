//! Paper trading backends
//! In-memory brokerage and document store used by simulation mode and the lifecycle tests

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

use crate::api::{
    ApiError, BrokerOrder, BrokerOrderStatus, Brokerage, Clock, DealRecord, DealStore, DealUpdate,
    OrderRecord, OrderRequest, OrderSide, OrderType, Quote, ReplaceRequest, StrategyRecord,
    StrategyUpdate,
};

#[derive(Debug, Default)]
struct PaperState {
    price: f64,
    market_open: bool,
    opens_in: Duration,
    orders: Vec<BrokerOrder>,
    next_id: u64,
    transient_failures: u32,
    accept_then_fail: u32,
    reject_next: Option<String>,
    place_calls: u32,
    cancel_calls: u32,
}

impl PaperState {
    fn take_failure(&mut self) -> Result<(), ApiError> {
        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            return Err(ApiError::ApiError {
                status: 503,
                message: "paper brokerage unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn find_mut(&mut self, order_id: &str) -> Result<&mut BrokerOrder, ApiError> {
        self.orders
            .iter_mut()
            .find(|o| o.id == order_id)
            .ok_or_else(|| ApiError::NotFound(format!("order {}", order_id)))
    }

    fn fill(order: &mut BrokerOrder, price: f64) {
        order.status = BrokerOrderStatus::Filled;
        order.filled_qty = order.qty.unwrap_or(Decimal::ZERO);
        order.filled_avg_price = Decimal::from_f64(price).map(|p| p.round_dp(4));
        order.filled_at = Some(Utc::now());
    }

    /// Fill every open stop-limit whose limit has been reached at the current price
    fn match_orders(&mut self) {
        let price = self.price;
        for order in self.orders.iter_mut().filter(|o| !o.status.is_terminal()) {
            let limit = match order.limit_price.and_then(|p| p.to_f64()) {
                Some(limit) => limit,
                None => continue,
            };
            let crossed = match order.side {
                OrderSide::Buy => price <= limit,
                OrderSide::Sell => price >= limit,
            };
            if crossed {
                Self::fill(order, limit);
            }
        }
    }
}

/// In-memory brokerage
///
/// Market orders fill immediately at the current price. Stop-limit buys fill at
/// their limit once the price drops to it, stop-limit sells once it rises to it.
#[derive(Debug)]
pub struct PaperBrokerage {
    state: Mutex<PaperState>,
}

impl PaperBrokerage {
    pub fn new(price: f64) -> Self {
        Self {
            state: Mutex::new(PaperState {
                price,
                market_open: true,
                next_id: 1,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PaperState> {
        // A poisoned paper book is still usable for inspection
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Move the market; open stop-limits that are crossed fill at their limit
    pub fn set_price(&self, price: f64) {
        let mut state = self.lock();
        state.price = price;
        state.match_orders();
    }

    pub fn price(&self) -> f64 {
        self.lock().price
    }

    /// Close the session; it reopens on its own after `opens_in`
    pub fn close_market(&self, opens_in: Duration) {
        let mut state = self.lock();
        state.market_open = false;
        state.opens_in = opens_in;
    }

    pub fn open_market(&self) {
        self.lock().market_open = true;
    }

    /// Fill an open order at a given price regardless of its limit
    pub fn fill_order(&self, order_id: &str, price: f64) -> Result<(), ApiError> {
        let mut state = self.lock();
        let order = state.find_mut(order_id)?;
        PaperState::fill(order, price);
        Ok(())
    }

    /// Submit an order on behalf of someone other than the worker
    pub fn submit_external(&self, request: &OrderRequest) -> BrokerOrder {
        let mut state = self.lock();
        self.accept(&mut state, request)
    }

    /// Next `count` calls fail with a 503
    pub fn fail_next(&self, count: u32) {
        self.lock().transient_failures = count;
    }

    /// Next `count` placements land at the brokerage but the response is lost
    pub fn accept_then_fail_next(&self, count: u32) {
        self.lock().accept_then_fail = count;
    }

    /// Next placement is rejected with a 403 carrying `reason`
    pub fn reject_next(&self, reason: &str) {
        self.lock().reject_next = Some(reason.to_string());
    }

    pub fn orders(&self) -> Vec<BrokerOrder> {
        self.lock().orders.clone()
    }

    pub fn open_orders(&self) -> Vec<BrokerOrder> {
        self.lock()
            .orders
            .iter()
            .filter(|o| !o.status.is_terminal())
            .cloned()
            .collect()
    }

    pub fn order(&self, order_id: &str) -> Option<BrokerOrder> {
        self.lock().orders.iter().find(|o| o.id == order_id).cloned()
    }

    pub fn place_calls(&self) -> u32 {
        self.lock().place_calls
    }

    pub fn cancel_calls(&self) -> u32 {
        self.lock().cancel_calls
    }

    fn accept(&self, state: &mut PaperState, request: &OrderRequest) -> BrokerOrder {
        let id = format!("paper-{}", state.next_id);
        state.next_id += 1;

        let mut order = BrokerOrder {
            id,
            client_order_id: request.client_order_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            qty: Some(request.qty),
            filled_qty: Decimal::ZERO,
            limit_price: request.limit_price,
            stop_price: request.stop_price,
            filled_avg_price: None,
            status: BrokerOrderStatus::New,
            time_in_force: Some(request.time_in_force),
            created_at: Some(Utc::now()),
            filled_at: None,
            canceled_at: None,
        };
        if request.order_type == OrderType::Market {
            PaperState::fill(&mut order, state.price);
        }
        state.orders.push(order.clone());
        state.match_orders();

        info!(order_id = %order.id, side = ?order.side, kind = ?order.order_type, "📝 Paper order accepted");
        state
            .orders
            .iter()
            .find(|o| o.id == order.id)
            .cloned()
            .unwrap_or(order)
    }
}

#[async_trait]
impl Brokerage for PaperBrokerage {
    async fn get_clock(&self) -> Result<Clock, ApiError> {
        let mut state = self.lock();
        state.take_failure()?;
        let now = Utc::now();
        let opens_in = chrono::Duration::from_std(state.opens_in).unwrap_or_else(|_| chrono::Duration::zero());
        let clock = Clock {
            timestamp: now,
            is_open: state.market_open,
            next_open: now + opens_in,
            next_close: now + chrono::Duration::hours(6),
        };
        // The session opens once someone has been told when it will
        if !state.market_open {
            state.market_open = true;
        }
        Ok(clock)
    }

    async fn get_latest_quote(&self, _symbol: &str) -> Result<Quote, ApiError> {
        let mut state = self.lock();
        state.take_failure()?;
        Ok(Quote {
            ask_price: state.price,
            bid_price: state.price,
        })
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<BrokerOrder, ApiError> {
        let mut state = self.lock();
        state.place_calls += 1;
        state.take_failure()?;

        if let Some(reason) = state.reject_next.take() {
            return Err(ApiError::ApiError { status: 403, message: reason });
        }
        if state
            .orders
            .iter()
            .any(|o| o.client_order_id == request.client_order_id)
        {
            return Err(ApiError::ApiError {
                status: 422,
                message: "client_order_id must be unique".to_string(),
            });
        }

        let order = self.accept(&mut state, request);
        if state.accept_then_fail > 0 {
            state.accept_then_fail -= 1;
            return Err(ApiError::ApiError {
                status: 504,
                message: "gateway timeout".to_string(),
            });
        }
        Ok(order)
    }

    async fn get_order(&self, order_id: &str) -> Result<BrokerOrder, ApiError> {
        let mut state = self.lock();
        state.take_failure()?;
        state.find_mut(order_id).map(|o| o.clone())
    }

    async fn get_order_by_client_id(&self, client_order_id: &str) -> Result<Option<BrokerOrder>, ApiError> {
        let mut state = self.lock();
        state.take_failure()?;
        Ok(state
            .orders
            .iter()
            .find(|o| o.client_order_id == client_order_id)
            .cloned())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), ApiError> {
        let mut state = self.lock();
        state.cancel_calls += 1;
        state.take_failure()?;
        let order = state.find_mut(order_id)?;
        if order.status.is_terminal() {
            return Err(ApiError::ApiError {
                status: 422,
                message: format!("order is not cancelable: {}", order.status.as_str()),
            });
        }
        order.status = BrokerOrderStatus::Canceled;
        order.canceled_at = Some(Utc::now());
        Ok(())
    }

    async fn replace_order(&self, order_id: &str, request: &ReplaceRequest) -> Result<BrokerOrder, ApiError> {
        let mut state = self.lock();
        state.take_failure()?;
        let old = state.find_mut(order_id)?;
        if old.status.is_terminal() {
            return Err(ApiError::ApiError {
                status: 422,
                message: format!("order is not replaceable: {}", old.status.as_str()),
            });
        }
        old.status = BrokerOrderStatus::Replaced;
        let replacement = OrderRequest {
            symbol: old.symbol.clone(),
            qty: request.qty,
            side: old.side,
            order_type: old.order_type,
            time_in_force: request.time_in_force,
            limit_price: request.limit_price,
            stop_price: request.stop_price,
            client_order_id: uuid::Uuid::new_v4().to_string(),
        };
        Ok(self.accept(&mut state, &replacement))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    deals: HashMap<String, DealRecord>,
    orders: Vec<OrderRecord>,
    strategies: HashMap<String, StrategyRecord>,
    transient_failures: u32,
    deal_updates: u32,
}

/// In-memory document store
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_deal(&self, deal: DealRecord) {
        self.lock().deals.insert(deal.id.clone(), deal);
    }

    pub fn insert_strategy(&self, strategy: StrategyRecord) {
        self.lock().strategies.insert(strategy.id.clone(), strategy);
    }

    /// Mutate a deal record as an operator would through the external API
    pub fn modify_deal<F: FnOnce(&mut DealRecord)>(&self, deal_id: &str, f: F) {
        if let Some(deal) = self.lock().deals.get_mut(deal_id) {
            f(deal);
        }
    }

    /// Insert an order record as the external buy-more API would
    pub fn insert_order_record(&self, record: OrderRecord) {
        self.lock().orders.push(record);
    }

    pub fn deal(&self, deal_id: &str) -> Option<DealRecord> {
        self.lock().deals.get(deal_id).cloned()
    }

    pub fn strategy(&self, strategy_id: &str) -> Option<StrategyRecord> {
        self.lock().strategies.get(strategy_id).cloned()
    }

    pub fn orders(&self) -> Vec<OrderRecord> {
        self.lock().orders.clone()
    }

    pub fn order(&self, order_id: &str) -> Option<OrderRecord> {
        self.lock().orders.iter().find(|o| o.order_id == order_id).cloned()
    }

    pub fn deal_updates(&self) -> u32 {
        self.lock().deal_updates
    }

    /// Next `count` calls fail with a 503
    pub fn fail_next(&self, count: u32) {
        self.lock().transient_failures = count;
    }

    fn take_failure(state: &mut MemoryState) -> Result<(), ApiError> {
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(ApiError::ApiError {
                status: 503,
                message: "memory store unavailable".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DealStore for MemoryStore {
    async fn get_deal(&self, deal_id: &str) -> Result<DealRecord, ApiError> {
        let mut state = self.lock();
        Self::take_failure(&mut state)?;
        state
            .deals
            .get(deal_id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("deals {}", deal_id)))
    }

    async fn update_deal(&self, deal_id: &str, update: &DealUpdate) -> Result<(), ApiError> {
        let mut state = self.lock();
        Self::take_failure(&mut state)?;
        state.deal_updates += 1;
        let deal = state
            .deals
            .get_mut(deal_id)
            .ok_or_else(|| ApiError::NotFound(format!("deals {}", deal_id)))?;
        deal.apply(update);
        Ok(())
    }

    async fn insert_order(&self, record: &OrderRecord) -> Result<(), ApiError> {
        let mut state = self.lock();
        Self::take_failure(&mut state)?;
        state.orders.push(record.clone());
        Ok(())
    }

    async fn upsert_order(&self, record: &OrderRecord) -> Result<(), ApiError> {
        let mut state = self.lock();
        Self::take_failure(&mut state)?;
        match state.orders.iter_mut().find(|o| o.order_id == record.order_id) {
            Some(existing) => *existing = record.clone(),
            None => state.orders.push(record.clone()),
        }
        Ok(())
    }

    async fn find_orders(&self, deal_id: &str, side: OrderSide) -> Result<Vec<OrderRecord>, ApiError> {
        let mut state = self.lock();
        Self::take_failure(&mut state)?;
        Ok(state
            .orders
            .iter()
            .filter(|o| o.linkage.deal_id == deal_id && o.side == side)
            .cloned()
            .collect())
    }

    async fn get_strategy(&self, strategy_id: &str) -> Result<StrategyRecord, ApiError> {
        let mut state = self.lock();
        Self::take_failure(&mut state)?;
        state
            .strategies
            .get(strategy_id)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("strategies {}", strategy_id)))
    }

    async fn update_strategy(&self, strategy_id: &str, update: &StrategyUpdate) -> Result<(), ApiError> {
        let mut state = self.lock();
        Self::take_failure(&mut state)?;
        let strategy = state
            .strategies
            .get_mut(strategy_id)
            .ok_or_else(|| ApiError::NotFound(format!("strategies {}", strategy_id)))?;
        if let Some(active) = update.active_deals {
            strategy.active_deals = active;
        }
        if let Some(status) = &update.status {
            strategy.status = status.clone();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_market_order_fills_at_current_price() {
        let broker = PaperBrokerage::new(10.0);
        let order = broker
            .place_order(&OrderRequest::market("ASMB", OrderSide::Buy, 15))
            .await
            .unwrap();
        assert!(order.is_filled());
        assert_eq!(order.filled_quantity(), 15);
        assert_eq!(order.fill_price(), 10.0);
    }

    #[tokio::test]
    async fn test_stop_limit_fills_when_crossed() {
        let broker = PaperBrokerage::new(10.0);
        let buy = broker
            .place_order(&OrderRequest::stop_limit("ASMB", OrderSide::Buy, 10, 9.9, 10.098))
            .await
            .unwrap();
        let sell = broker
            .place_order(&OrderRequest::stop_limit("ASMB", OrderSide::Sell, 15, 10.1, 9.898))
            .await
            .unwrap();
        assert_eq!(buy.status, BrokerOrderStatus::New);

        broker.set_price(9.85);
        assert!(broker.get_order(&buy.id).await.unwrap().is_filled());
        assert!(!broker.get_order(&sell.id).await.unwrap().is_filled());
        assert_eq!(broker.get_order(&buy.id).await.unwrap().fill_price(), 9.9);

        broker.set_price(10.2);
        assert!(broker.get_order(&sell.id).await.unwrap().is_filled());
    }

    #[tokio::test]
    async fn test_duplicate_client_id_rejected() {
        let broker = PaperBrokerage::new(10.0);
        let request = OrderRequest::stop_limit("ASMB", OrderSide::Buy, 10, 9.9, 10.0);
        broker.place_order(&request).await.unwrap();
        let err = broker.place_order(&request).await.unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(broker.open_orders().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_terminal_order_is_rejected() {
        let broker = PaperBrokerage::new(10.0);
        let order = broker
            .place_order(&OrderRequest::market("ASMB", OrderSide::Buy, 1))
            .await
            .unwrap();
        let err = broker.cancel_order(&order.id).await.unwrap_err();
        assert_eq!(err.status(), Some(422));
    }

    #[tokio::test]
    async fn test_replace_marks_old_replaced() {
        let broker = PaperBrokerage::new(10.0);
        let old = broker
            .place_order(&OrderRequest::stop_limit("ASMB", OrderSide::Sell, 15, 10.1, 9.898))
            .await
            .unwrap();
        let new = broker
            .replace_order(&old.id, &ReplaceRequest::stop_limit(15, 10.2, 9.996))
            .await
            .unwrap();
        assert_ne!(old.id, new.id);
        assert_eq!(broker.order(&old.id).unwrap().status, BrokerOrderStatus::Replaced);
        assert_eq!(broker.open_orders().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_upsert() {
        let store = MemoryStore::new();
        let broker = PaperBrokerage::new(10.0);
        let order = broker
            .place_order(&OrderRequest::stop_limit("ASMB", OrderSide::Buy, 10, 9.9, 10.0))
            .await
            .unwrap();
        let linkage = crate::api::OrderLinkage {
            deal_id: "d".into(),
            ..Default::default()
        };
        store.insert_order(&OrderRecord::from_broker(&order, &linkage)).await.unwrap();
        broker.cancel_order(&order.id).await.unwrap();
        let canceled = broker.get_order(&order.id).await.unwrap();
        store.upsert_order(&OrderRecord::from_broker(&canceled, &linkage)).await.unwrap();

        let orders = store.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].status, "canceled");
        assert_eq!(store.find_orders("d", OrderSide::Buy).await.unwrap().len(), 1);
    }
}
