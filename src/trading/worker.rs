//! Deal lifecycle
//!
//! Opens the position (base buy, take-profit, safety-order seeding), starts the
//! Order Monitor and Control Listener, then dispatches their signals until the
//! deal is closed. All tracker, ledger and ladder mutation happens while holding
//! the [`DealContext`] state lock, for the whole read-modify-write sequence.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::api::{BrokerOrder, BrokerOrderStatus, Brokerage, DealStatus, DealStore, OrderSide};
use crate::config::Config;
use crate::trading::errors::{DealError, DealResult};
use crate::trading::gateway::ExchangeGateway;
use crate::trading::ladder::{LadderCursor, LadderParams};
use crate::trading::ledger::{DealLedger, Profit};
use crate::trading::listener::ControlListener;
use crate::trading::monitor::OrderMonitor;
use crate::trading::order_tracker::{OrderKind, OrderTracker, TrackedStatus};
use crate::trading::persistence::{PersistenceSync, TotalsSnapshot};
use crate::trading::signals::{self, Signal, SignalReceiver, TerminalSignal};
use crate::trading::stats::DealStats;

/// Lifecycle phase, for logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealPhase {
    Starting,
    BaseFilled,
    TakeProfitPlaced,
    SafetyOrdersSeeded,
    Monitoring,
    Editing,
    BuyingMore,
    Closing,
    Completed,
    Cancelled,
}

/// How a deal ended
#[derive(Debug, Clone, PartialEq)]
pub enum DealOutcome {
    Completed(Profit),
    Cancelled,
}

/// Result of re-pricing the take-profit order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeProfitRefresh {
    Replaced,
    /// The old take-profit filled before it could be cancelled
    AlreadyFilled,
}

/// Result of a re-entrant handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    Continue,
    Close(TerminalSignal),
}

/// Mutable deal state, guarded by one lock
#[derive(Debug)]
pub struct DealState {
    pub ledger: DealLedger,
    pub tracker: OrderTracker,
    pub cursor: LadderCursor,
    pub stats: DealStats,
    /// Set when the next rung rounds down to zero shares
    pub ladder_exhausted: bool,
}

impl DealState {
    /// No further safety order can be placed
    pub fn ladder_done(&self) -> bool {
        self.ladder_exhausted || self.tracker.safety_orders_placed() >= self.ledger.max_safety_orders
    }
}

/// Everything the worker and both pollers share
pub struct DealContext {
    pub gateway: ExchangeGateway,
    pub persistence: PersistenceSync,
    pub ladder: LadderParams,
    pub poll_interval: Duration,
    state: Mutex<DealState>,
}

impl DealContext {
    pub fn new(
        gateway: ExchangeGateway,
        persistence: PersistenceSync,
        ladder: LadderParams,
        ledger: DealLedger,
        poll_interval: Duration,
    ) -> Self {
        Self {
            gateway,
            persistence,
            ladder,
            poll_interval,
            state: Mutex::new(DealState {
                ledger,
                tracker: OrderTracker::new(),
                cursor: LadderCursor::new(0.0, &ladder),
                stats: DealStats::new(),
                ladder_exhausted: false,
            }),
        }
    }

    /// Take the state lock for one read-modify-write sequence
    pub async fn lock(&self) -> MutexGuard<'_, DealState> {
        self.state.lock().await
    }

    /// Place the next rung of the ladder and track it.
    /// Returns false when the rung rounds down to zero shares; the ladder ends there.
    pub async fn place_safety_order(&self, st: &mut DealState) -> DealResult<bool> {
        let before = st.cursor;
        let step = before.peek(&self.ladder);
        if step.quantity == 0 {
            warn!(rung = step.index, limit = step.limit_price, "Safety order rounds to zero shares, ladder ends here");
            st.ladder_exhausted = true;
            return Ok(false);
        }

        let order = self
            .gateway
            .place_stop_limit(OrderSide::Buy, step.quantity, step.limit_price, step.stop_price)
            .await?;
        st.cursor.advance(&step);
        st.tracker.track_safety_order(&order.id, before);
        st.stats.record_order_placed(step.volume);
        self.persistence.record_order(&order).await?;

        info!(
            order_id = %order.id,
            rung = step.index,
            deviation = step.cumulative_deviation,
            limit = step.limit_price,
            qty = step.quantity,
            "🪜 Safety order placed"
        );
        Ok(true)
    }

    /// Place safety orders until `target_active` are open or the total allowance is used up
    pub async fn seed_safety_orders(&self, st: &mut DealState, target_active: u32) -> DealResult<()> {
        while st.tracker.active_safety_orders() < target_active && !st.ladder_done() {
            if !self.place_safety_order(st).await? {
                break;
            }
        }
        Ok(())
    }

    /// Place the take-profit for the held position at the current target
    pub async fn place_take_profit(&self, st: &mut DealState) -> DealResult<BrokerOrder> {
        let target = st.ledger.take_profit();
        let order = self
            .gateway
            .place_stop_limit(OrderSide::Sell, target.quantity, target.limit_price, target.stop_price)
            .await?;
        st.tracker.replace_take_profit(&order.id);
        st.stats.record_order_placed(target.quantity as f64 * target.limit_price);
        self.persistence.record_order(&order).await?;

        info!(
            order_id = %order.id,
            qty = target.quantity,
            limit = target.limit_price,
            "🎯 Take-profit placed"
        );
        Ok(order)
    }

    /// Cancel the current take-profit and place one priced from the current totals
    pub async fn refresh_take_profit(&self, st: &mut DealState) -> DealResult<TakeProfitRefresh> {
        if let Some(current) = st.tracker.take_profit().map(|o| o.order_id.clone()) {
            let settled = self.gateway.cancel(&current).await?;
            self.persistence.rewrite_order(&settled).await?;
            if settled.is_filled() {
                st.tracker.mark_filled(&current);
                return Ok(TakeProfitRefresh::AlreadyFilled);
            }
            self.fold_partial_sale(st, &settled);
            st.stats.record_order_cancelled();
        }
        self.place_take_profit(st).await?;
        st.stats.record_take_profit_replaced();
        Ok(TakeProfitRefresh::Replaced)
    }

    /// Count the shares a cancelled or replaced take-profit sold before it stopped
    pub fn fold_partial_sale(&self, st: &mut DealState, order: &BrokerOrder) {
        let quantity = order.filled_quantity();
        if quantity == 0 {
            return;
        }
        st.ledger.fold_sale(quantity, order.fill_price());
        info!(
            order_id = %order.id,
            qty = quantity,
            price = order.fill_price(),
            held = st.ledger.held_quantity(),
            "Take-profit sold in part before it was cancelled"
        );
    }

    /// Fold a safety-order fill into the totals.
    /// Also used for an order cancelled after a partial fill; only the filled shares count.
    pub async fn fold_safety_fill(&self, st: &mut DealState, order: &BrokerOrder) -> DealResult<()> {
        st.tracker.mark_filled(&order.id);
        st.ledger.fold_fill(order.filled_quantity(), order.fill_price());
        st.stats.record_safety_order_filled();
        self.persistence.rewrite_order(order).await?;
        info!(
            order_id = %order.id,
            status = order.status.as_str(),
            qty = order.filled_quantity(),
            price = order.fill_price(),
            total_qty = st.ledger.total_quantity,
            avg = st.ledger.average_price(),
            "💰 Safety order filled"
        );
        Ok(())
    }

    /// Limit price of the next unplaced rung, if the allowance is not used up
    pub fn next_safety_price(&self, st: &DealState) -> Option<f64> {
        if st.ladder_done() {
            None
        } else {
            Some(st.cursor.peek(&self.ladder).limit_price)
        }
    }

    pub async fn publish(&self, st: &DealState, status: Option<DealStatus>) -> DealResult<()> {
        let totals = TotalsSnapshot::new(
            &st.ledger,
            st.tracker.active_safety_orders(),
            self.next_safety_price(st),
        );
        self.persistence.publish_totals(&totals, status).await
    }
}

/// One deal worker
pub struct DealWorker {
    ctx: Arc<DealContext>,
    base_order_size: f64,
    token: CancellationToken,
}

impl DealWorker {
    pub fn new(config: &Config, brokerage: Arc<dyn Brokerage>, store: Arc<dyn DealStore>) -> Self {
        let retry = config.retry_policy();
        let gateway = ExchangeGateway::new(
            brokerage,
            &config.deal.asset,
            retry.clone(),
            config.runtime.min_call_spacing_ms,
            config.poll_interval(),
        );
        let persistence = PersistenceSync::new(store, config.order_linkage(), retry);
        let ledger = DealLedger::new(
            config.strategy.target_profit_percent,
            config.strategy.stop_loss_percent,
            config.strategy.max_safety_order_count,
            config.strategy.max_active_safety_order_count,
        );

        Self {
            ctx: Arc::new(DealContext::new(
                gateway,
                persistence,
                config.ladder_params(),
                ledger,
                config.poll_interval(),
            )),
            base_order_size: config.strategy.base_order_size,
            token: CancellationToken::new(),
        }
    }

    /// Token that interrupts the worker without touching the deal's orders
    pub fn shutdown_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn context(&self) -> Arc<DealContext> {
        self.ctx.clone()
    }

    /// Run the deal to its end
    pub async fn run(&self) -> DealResult<DealOutcome> {
        let deal_id = self.ctx.persistence.deal_id().to_string();
        info!(deal_id = %deal_id, symbol = self.ctx.gateway.symbol(), phase = ?DealPhase::Starting, "🚀 Deal worker starting");

        tokio::select! {
            opened = self.open_position() => opened?,
            _ = self.token.cancelled() => {
                warn!(deal_id = %deal_id, "Interrupted before the deal was opened");
                return Err(DealError::Shutdown);
            }
        }

        let (sender, receiver) = signals::channel();
        let pollers = [
            tokio::spawn(
                OrderMonitor::new(self.ctx.clone(), sender.clone(), self.token.child_token()).run(),
            ),
            tokio::spawn(ControlListener::new(self.ctx.clone(), sender, self.token.child_token()).run()),
        ];
        info!(deal_id = %deal_id, phase = ?DealPhase::Monitoring, "👀 Monitoring deal");

        let result = self.dispatch(receiver).await;
        self.token.cancel();
        for joined in futures::future::join_all(pollers).await {
            if let Err(e) = joined {
                error!("Poller task failed: {}", e);
            }
        }

        match &result {
            Ok(outcome) => {
                let st = self.ctx.lock().await;
                info!(deal_id = %deal_id, ?outcome, "🏁 Deal finished | {}", st.stats.summary());
            }
            Err(e) => error!(deal_id = %deal_id, category = e.category(), "❌ Deal worker stopped: {}", e),
        }
        result
    }

    /// Base buy, take-profit and the first safety orders
    async fn open_position(&self) -> DealResult<()> {
        let ctx = &self.ctx;
        ctx.gateway.wait_until_open().await?;

        let mut st = ctx.lock().await;
        let quantity = self.base_order_size.floor() as u64;
        let placed = ctx.gateway.place_market(OrderSide::Buy, quantity).await?;
        ctx.persistence.record_order(&placed).await?;
        let filled = ctx.gateway.wait_for_fill(&placed.id).await?;
        ctx.persistence.rewrite_order(&filled).await?;

        st.ledger.fold_fill(filled.filled_quantity(), filled.fill_price());
        st.tracker.track(&filled.id, OrderKind::Buy, TrackedStatus::Filled);
        st.cursor = LadderCursor::new(filled.fill_price(), &ctx.ladder);
        let spent = st.ledger.total_buying_price;
        st.stats.record_order_placed(spent);
        st.stats.record_order_filled();
        info!(
            order_id = %filled.id,
            qty = st.ledger.total_quantity,
            price = filled.fill_price(),
            total = st.ledger.total_buying_price,
            phase = ?DealPhase::BaseFilled,
            "💵 Base order filled"
        );

        ctx.place_take_profit(&mut st).await?;
        info!(phase = ?DealPhase::TakeProfitPlaced, "Take-profit in place");

        let active = st.ledger.max_active_safety_orders;
        ctx.seed_safety_orders(&mut st, active).await?;
        ctx.publish(&st, Some(DealStatus::Bought)).await?;
        info!(
            active = st.tracker.active_safety_orders(),
            phase = ?DealPhase::SafetyOrdersSeeded,
            "Safety orders seeded"
        );
        Ok(())
    }

    async fn dispatch(&self, mut receiver: SignalReceiver) -> DealResult<DealOutcome> {
        loop {
            let signal = tokio::select! {
                signal = receiver.next() => signal,
                _ = self.token.cancelled() => return Err(DealError::Shutdown),
            };

            match signal {
                Some(Signal::Fatal(error)) => return Err(error),
                Some(Signal::Terminal(reason)) => return self.close(reason).await,
                Some(Signal::BuyMore) => {
                    if let HandlerOutcome::Close(reason) = self.handle_buy_more().await? {
                        return self.close(reason).await;
                    }
                }
                Some(Signal::Edit(request)) => {
                    let outcome = self.handle_edit().await;
                    // Released even when the handler failed
                    let _ = request.ack.send(());
                    if let HandlerOutcome::Close(reason) = outcome? {
                        return self.close(reason).await;
                    }
                }
                None => return Err(DealError::Shutdown),
            }
        }
    }

    /// Apply an operator edit of target profit, stop loss and safety-order counts
    async fn handle_edit(&self) -> DealResult<HandlerOutcome> {
        let ctx = &self.ctx;
        info!(phase = ?DealPhase::Editing, "✏️ Handling deal edit");
        ctx.gateway.wait_until_open().await?;
        let control = ctx.persistence.read_control().await?;

        let mut st = ctx.lock().await;
        st.stats.record_edit();

        if let Some(stop_loss) = control.stop_loss() {
            st.ledger.stop_loss_percent = stop_loss;
        }
        if let Some(max_safety) = control.max_safety_trade_count {
            st.ledger.max_safety_orders = max_safety;
        }

        let mut refresh_needed = false;

        if let Some(target) = control.target_profit_percent() {
            if (target - st.ledger.target_profit_percent).abs() > f64::EPSILON {
                st.ledger.target_profit_percent = target;
                let tp = st.ledger.take_profit();
                let market = ctx.gateway.latest_price().await?;
                if market >= tp.limit_price {
                    info!(market, target = tp.limit_price, "Market already past the new target, closing");
                    drop(st);
                    ctx.persistence.clear_edited_flag().await?;
                    return Ok(HandlerOutcome::Close(TerminalSignal::ClosedAtMarket));
                }
                if self.replace_take_profit_in_place(&mut st).await? == TakeProfitRefresh::AlreadyFilled {
                    drop(st);
                    ctx.persistence.clear_edited_flag().await?;
                    return Ok(HandlerOutcome::Close(TerminalSignal::TakeProfitFilled));
                }
            }
        }

        if let Some(max_active) = control.max_active_safety_trade_count {
            let current = st.ledger.max_active_safety_orders;
            st.ledger.max_active_safety_orders = max_active;
            if max_active > current {
                ctx.seed_safety_orders(&mut st, max_active).await?;
            } else if max_active < current {
                refresh_needed |= self.withdraw_safety_orders(&mut st, max_active).await?;
            }
        }

        if refresh_needed && ctx.refresh_take_profit(&mut st).await? == TakeProfitRefresh::AlreadyFilled {
            drop(st);
            ctx.persistence.clear_edited_flag().await?;
            return Ok(HandlerOutcome::Close(TerminalSignal::TakeProfitFilled));
        }

        ctx.publish(&st, None).await?;
        drop(st);
        ctx.persistence.clear_edited_flag().await?;
        info!(phase = ?DealPhase::Monitoring, "Deal edit applied");
        Ok(HandlerOutcome::Continue)
    }

    /// Re-price the take-profit through the brokerage's replace endpoint
    async fn replace_take_profit_in_place(&self, st: &mut DealState) -> DealResult<TakeProfitRefresh> {
        let ctx = &self.ctx;
        let current = match st.tracker.take_profit() {
            Some(tp) => tp.order_id.clone(),
            None => {
                ctx.place_take_profit(st).await?;
                return Ok(TakeProfitRefresh::Replaced);
            }
        };

        let tp = st.ledger.take_profit();
        match ctx
            .gateway
            .replace_stop_limit(&current, OrderSide::Sell, tp.quantity, tp.limit_price, tp.stop_price)
            .await
        {
            Ok(replacement) => {
                let old = ctx.gateway.get_order(&current).await?;
                ctx.persistence.rewrite_order(&old).await?;
                ctx.persistence.record_order(&replacement).await?;
                st.tracker.replace_take_profit(&replacement.id);
                st.stats.record_take_profit_replaced();
                if old.filled_quantity() > 0 {
                    // Sized before those shares sold; re-size it for what is held
                    ctx.fold_partial_sale(st, &old);
                    return ctx.refresh_take_profit(st).await;
                }
                Ok(TakeProfitRefresh::Replaced)
            }
            Err(DealError::Brokerage { operation, source }) => {
                let old = ctx.gateway.get_order(&current).await?;
                if old.is_filled() {
                    ctx.persistence.rewrite_order(&old).await?;
                    st.tracker.mark_filled(&current);
                    Ok(TakeProfitRefresh::AlreadyFilled)
                } else {
                    Err(DealError::Brokerage { operation, source })
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Cancel the most recently placed unfilled safety orders until `target_active` remain.
    /// Returns true when one of them turned out filled and the take-profit needs re-pricing.
    async fn withdraw_safety_orders(&self, st: &mut DealState, target_active: u32) -> DealResult<bool> {
        let ctx = &self.ctx;
        let mut filled_meanwhile = false;

        while st.tracker.active_safety_orders() > target_active {
            let latest = match st.tracker.latest_open_safety_order() {
                Some(latest) => latest,
                None => break,
            };
            let settled = ctx.gateway.cancel(&latest.order_id).await?;
            if settled.filled_quantity() > 0 {
                ctx.fold_safety_fill(st, &settled).await?;
                filled_meanwhile = true;
                continue;
            }

            ctx.persistence.rewrite_order(&settled).await?;
            st.tracker.remove(&latest.order_id);
            st.stats.record_order_cancelled();
            // Rewind so a later increase re-places the same rung
            if let Some(before) = latest.ladder_before {
                if before.steps + 1 == st.cursor.steps {
                    st.cursor = before;
                    st.ladder_exhausted = false;
                }
            }
            info!(order_id = %latest.order_id, "Safety order withdrawn");
        }
        Ok(filled_meanwhile)
    }

    /// Fold operator-placed buy orders into the deal
    async fn handle_buy_more(&self) -> DealResult<HandlerOutcome> {
        let ctx = &self.ctx;
        info!(phase = ?DealPhase::BuyingMore, "🛒 Handling buy-more");

        let records = ctx.persistence.find_buy_orders().await?;
        let mut st = ctx.lock().await;
        st.stats.record_buy_more();

        let mut folded = 0;
        for record in records {
            if st.tracker.contains(&record.order_id) || record.status == BrokerOrderStatus::Canceled.as_str() {
                continue;
            }
            let filled = match ctx.gateway.wait_for_fill(&record.order_id).await {
                Ok(filled) => filled,
                Err(DealError::OrderNotFilled { order_id, status }) => {
                    warn!(order_id = %order_id, status = %status, "Manual order ended without filling, skipped");
                    continue;
                }
                Err(e) => return Err(e),
            };
            st.ledger.fold_fill(filled.filled_quantity(), filled.fill_price());
            st.tracker.track(&filled.id, OrderKind::Buy, TrackedStatus::Filled);
            st.stats.record_order_filled();
            ctx.persistence.rewrite_order(&filled).await?;
            folded += 1;
            info!(
                order_id = %filled.id,
                qty = filled.filled_quantity(),
                price = filled.fill_price(),
                avg = st.ledger.average_price(),
                "Manual buy folded into deal"
            );
        }

        if folded > 0 {
            if ctx.refresh_take_profit(&mut st).await? == TakeProfitRefresh::AlreadyFilled {
                drop(st);
                ctx.persistence.clear_buy_more_flag().await?;
                return Ok(HandlerOutcome::Close(TerminalSignal::TakeProfitFilled));
            }

            let average = st.ledger.average_price();
            if st.cursor.previous_price > average {
                if self.rebase_ladder(&mut st, average).await?
                    && ctx.refresh_take_profit(&mut st).await? == TakeProfitRefresh::AlreadyFilled
                {
                    drop(st);
                    ctx.persistence.clear_buy_more_flag().await?;
                    return Ok(HandlerOutcome::Close(TerminalSignal::TakeProfitFilled));
                }
            }
        }

        ctx.publish(&st, None).await?;
        drop(st);
        ctx.persistence.clear_buy_more_flag().await?;
        Ok(HandlerOutcome::Continue)
    }

    /// Re-anchor the ladder at `price` and re-place every unfilled safety order from it.
    /// Returns true when one of them filled before it could be cancelled.
    async fn rebase_ladder(&self, st: &mut DealState, price: f64) -> DealResult<bool> {
        let ctx = &self.ctx;
        info!(price, "Re-basing safety-order ladder on the new average");
        st.cursor.rebase(price);
        st.ladder_exhausted = false;

        let mut filled_meanwhile = false;
        for open in st.tracker.open_safety_orders() {
            let settled = ctx.gateway.cancel(&open.order_id).await?;
            if settled.filled_quantity() > 0 {
                ctx.fold_safety_fill(st, &settled).await?;
                filled_meanwhile = true;
                continue;
            }
            ctx.persistence.rewrite_order(&settled).await?;
            st.stats.record_order_cancelled();

            let before = st.cursor;
            let step = before.peek(&ctx.ladder);
            if step.quantity == 0 {
                warn!(rung = step.index, "Re-based rung rounds to zero shares, dropped");
                st.tracker.remove(&open.order_id);
                st.ladder_exhausted = true;
                continue;
            }
            let order = ctx
                .gateway
                .place_stop_limit(OrderSide::Buy, step.quantity, step.limit_price, step.stop_price)
                .await?;
            st.cursor.advance(&step);
            st.tracker.replace_order_id(&open.order_id, &order.id, Some(before));
            st.stats.record_order_placed(step.volume);
            ctx.persistence.record_order(&order).await?;
        }
        Ok(filled_meanwhile)
    }

    /// Cancel what is open, sell what is held (except on cancel) and write the final status
    async fn close(&self, reason: TerminalSignal) -> DealResult<DealOutcome> {
        let ctx = &self.ctx;
        info!(?reason, phase = ?DealPhase::Closing, "Closing deal");

        // Stop both pollers; an in-flight tick finishes before the lock below is granted
        self.token.cancel();

        if matches!(reason, TerminalSignal::ClosedAtMarket | TerminalSignal::LadderExhausted) {
            ctx.gateway.wait_until_open().await?;
        }

        let mut st = ctx.lock().await;
        let mut take_profit_fill: Option<BrokerOrder> = None;

        if let Some(tp) = st.tracker.take_profit().cloned() {
            let order = if tp.status == TrackedStatus::Filled {
                ctx.gateway.get_order(&tp.order_id).await?
            } else {
                ctx.gateway.cancel(&tp.order_id).await?
            };
            ctx.persistence.rewrite_order(&order).await?;
            if order.is_filled() {
                st.tracker.mark_filled(&tp.order_id);
                st.stats.record_order_filled();
                take_profit_fill = Some(order);
            } else {
                ctx.fold_partial_sale(&mut st, &order);
                st.stats.record_order_cancelled();
            }
        }

        for open in st.tracker.open_safety_orders() {
            let settled = ctx.gateway.cancel(&open.order_id).await?;
            if settled.filled_quantity() > 0 {
                // Position grew after all; the close-out sells it too
                ctx.fold_safety_fill(&mut st, &settled).await?;
            } else {
                ctx.persistence.rewrite_order(&settled).await?;
                st.stats.record_order_cancelled();
            }
        }

        if reason == TerminalSignal::Cancelled && take_profit_fill.is_none() {
            ctx.persistence.cancel_deal(st.ledger.total_buying_price).await?;
            ctx.persistence.decrement_strategy().await?;
            info!(phase = ?DealPhase::Cancelled, "Deal cancelled by operator");
            return Ok(DealOutcome::Cancelled);
        }

        if let Some(tp) = &take_profit_fill {
            st.ledger.fold_sale(tp.filled_quantity(), tp.fill_price());
        }

        let remaining = st.ledger.held_quantity();
        if remaining > 0 {
            info!(qty = remaining, "Selling remaining position at market");
            let placed = ctx.gateway.place_market(OrderSide::Sell, remaining).await?;
            ctx.persistence.record_order(&placed).await?;
            let filled = ctx.gateway.wait_for_fill(&placed.id).await?;
            ctx.persistence.rewrite_order(&filled).await?;
            st.tracker.track(&filled.id, OrderKind::Sell, TrackedStatus::Filled);
            st.stats.record_order_placed(filled.filled_quantity() as f64 * filled.fill_price());
            st.stats.record_order_filled();
            st.ledger.fold_sale(filled.filled_quantity(), filled.fill_price());
        }

        let profit = st.ledger.profit(st.ledger.total_selling_price);
        ctx.persistence.complete_deal(&st.ledger, &profit).await?;
        ctx.persistence.decrement_strategy().await?;
        info!(phase = ?DealPhase::Completed, profit = profit.value, "Deal completed");
        Ok(DealOutcome::Completed(profit))
    }
}
