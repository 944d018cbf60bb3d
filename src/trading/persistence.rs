//! Persistence sync
//! Writes deal totals, order audit records and the strategy counter to the store

use chrono::{SecondsFormat, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use crate::api::{
    BrokerOrder, DealRecord, DealStatus, DealStore, DealUpdate, OrderLinkage, OrderRecord, OrderSide,
    StrategyUpdate,
};
use crate::trading::errors::{DealError, DealResult};
use crate::trading::ledger::{DealLedger, Profit};
use crate::utils::{retry_with_policy, RetryPolicy};

/// Totals the worker publishes to the deal record
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TotalsSnapshot {
    pub total_quantity: u64,
    pub total_buying_price: f64,
    pub average_price: f64,
    pub total_selling_price: f64,
    pub active_safety_orders: u32,
    pub next_safety_order_price: Option<f64>,
}

impl TotalsSnapshot {
    pub fn new(ledger: &DealLedger, active_safety_orders: u32, next_safety_order_price: Option<f64>) -> Self {
        Self {
            total_quantity: ledger.total_quantity,
            total_buying_price: ledger.total_buying_price,
            average_price: ledger.average_price(),
            total_selling_price: ledger.total_selling_price,
            active_safety_orders,
            next_safety_order_price,
        }
    }
}

/// Store writer for one deal
pub struct PersistenceSync {
    store: Arc<dyn DealStore>,
    linkage: OrderLinkage,
    retry: RetryPolicy,
}

impl PersistenceSync {
    pub fn new(store: Arc<dyn DealStore>, linkage: OrderLinkage, retry: RetryPolicy) -> Self {
        Self { store, linkage, retry }
    }

    pub fn deal_id(&self) -> &str {
        &self.linkage.deal_id
    }

    /// Insert the audit record of a freshly placed order
    pub async fn record_order(&self, order: &BrokerOrder) -> DealResult<()> {
        let record = OrderRecord::from_broker(order, &self.linkage);
        retry_with_policy("insert_order", &self.retry, || self.store.insert_order(&record))
            .await
            .map_err(|e| DealError::store("insert_order", e))?;
        debug!(order_id = %order.id, "Order record inserted");
        Ok(())
    }

    /// Overwrite an order's audit record with its canonical state
    pub async fn rewrite_order(&self, order: &BrokerOrder) -> DealResult<()> {
        let record = OrderRecord::from_broker(order, &self.linkage);
        retry_with_policy("upsert_order", &self.retry, || self.store.upsert_order(&record))
            .await
            .map_err(|e| DealError::store("upsert_order", e))?;
        debug!(order_id = %order.id, status = %record.status, "Order record rewritten");
        Ok(())
    }

    /// Current control record
    pub async fn read_control(&self) -> DealResult<DealRecord> {
        let deal_id = self.deal_id();
        retry_with_policy("get_deal", &self.retry, || self.store.get_deal(deal_id))
            .await
            .map_err(|e| match e {
                crate::api::ApiError::NotFound(what) => DealError::RecordNotFound(what),
                other => DealError::store("get_deal", other),
            })
    }

    pub async fn update_deal(&self, update: &DealUpdate) -> DealResult<()> {
        let deal_id = self.deal_id();
        retry_with_policy("update_deal", &self.retry, || self.store.update_deal(deal_id, update))
            .await
            .map_err(|e| DealError::store("update_deal", e))
    }

    /// Publish running totals, optionally moving the deal status
    pub async fn publish_totals(&self, totals: &TotalsSnapshot, status: Option<DealStatus>) -> DealResult<()> {
        let update = DealUpdate {
            status,
            avg_buying_price: Some(totals.average_price),
            total_buying_price: Some(totals.total_buying_price),
            total_sell_price: Some(totals.total_selling_price),
            total_order_quantity: Some(totals.total_quantity),
            active_safety_order_count: Some(totals.active_safety_orders),
            next_safety_order_limit_price: totals.next_safety_order_price,
            ..Default::default()
        };
        self.update_deal(&update).await?;
        debug!(
            qty = totals.total_quantity,
            total = totals.total_buying_price,
            avg = totals.average_price,
            "Deal totals published"
        );
        Ok(())
    }

    pub async fn clear_edited_flag(&self) -> DealResult<()> {
        self.update_deal(&DealUpdate {
            deal_edited_by_user: Some(false),
            ..Default::default()
        })
        .await
    }

    pub async fn clear_buy_more_flag(&self) -> DealResult<()> {
        self.update_deal(&DealUpdate {
            manual_order_placed_by_user: Some(false),
            ..Default::default()
        })
        .await
    }

    /// Buy-side order records for this deal
    pub async fn find_buy_orders(&self) -> DealResult<Vec<OrderRecord>> {
        let deal_id = self.deal_id();
        retry_with_policy("find_orders", &self.retry, || {
            self.store.find_orders(deal_id, OrderSide::Buy)
        })
        .await
        .map_err(|e| DealError::store("find_orders", e))
    }

    /// Terminal write for a completed deal
    pub async fn complete_deal(&self, ledger: &DealLedger, profit: &Profit) -> DealResult<()> {
        let update = DealUpdate {
            status: Some(DealStatus::Completed),
            total_order_quantity: Some(ledger.total_quantity),
            total_buying_price: Some(ledger.total_buying_price),
            avg_buying_price: Some(ledger.average_price()),
            total_sell_price: Some(profit.sell_value),
            profit_value: Some(profit.value),
            profit_percentage: Some(profit.percent_string()),
            active_safety_order_count: Some(0),
            closed_at: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
            ..Default::default()
        };
        self.update_deal(&update).await?;
        info!(
            deal_id = self.deal_id(),
            profit = profit.value,
            percent = %profit.percent_string(),
            "✅ Deal completed"
        );
        Ok(())
    }

    /// Terminal write for a deal cancelled by the operator
    pub async fn cancel_deal(&self, total_buying_price: f64) -> DealResult<()> {
        let update = DealUpdate {
            status: Some(DealStatus::Cancelled),
            profit_value: Some(-total_buying_price),
            profit_percentage: Some("-100".to_string()),
            active_safety_order_count: Some(0),
            closed_at: Some(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
            ..Default::default()
        };
        self.update_deal(&update).await?;
        info!(deal_id = self.deal_id(), "🛑 Deal cancelled");
        Ok(())
    }

    /// Take this deal off the parent strategy's active count
    pub async fn decrement_strategy(&self) -> DealResult<()> {
        let strategy_id = self.linkage.strategy_id.as_str();
        let strategy = retry_with_policy("get_strategy", &self.retry, || {
            self.store.get_strategy(strategy_id)
        })
        .await
        .map_err(|e| DealError::store("get_strategy", e))?;

        let active_deals = (strategy.active_deals - 1).max(0);
        let update = StrategyUpdate {
            active_deals: Some(active_deals),
            status: (active_deals == 0).then(|| "completed".to_string()),
        };
        retry_with_policy("update_strategy", &self.retry, || {
            self.store.update_strategy(strategy_id, &update)
        })
        .await
        .map_err(|e| DealError::store("update_strategy", e))?;

        info!(strategy_id, active_deals, "Strategy active deal count updated");
        Ok(())
    }
}
