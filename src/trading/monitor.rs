//! Order monitor
//! Polls the take-profit and open safety orders; folds safety fills and re-prices the take-profit

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::trading::errors::DealResult;
use crate::trading::order_tracker::TrackedStatus;
use crate::trading::signals::{SignalSender, TerminalSignal};
use crate::trading::worker::{DealContext, TakeProfitRefresh};

pub struct OrderMonitor {
    ctx: Arc<DealContext>,
    signals: SignalSender,
    token: CancellationToken,
}

impl OrderMonitor {
    pub fn new(ctx: Arc<DealContext>, signals: SignalSender, token: CancellationToken) -> Self {
        Self { ctx, signals, token }
    }

    /// Poll until a terminal condition is found or the worker stops the monitor
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.ctx.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = interval.tick() => {}
            }

            match self.tick().await {
                Ok(None) => {}
                Ok(Some(signal)) => {
                    info!(?signal, "Order monitor signalling");
                    self.signals.terminal(signal).await;
                    break;
                }
                Err(e) => {
                    // Only rejections reach here; the deal needs an operator
                    error!(category = e.category(), "Order monitor stopped: {}", e);
                    self.signals.fatal(e).await;
                    break;
                }
            }
        }
        debug!("Order monitor exited");
    }

    /// One polling pass under the state lock
    pub async fn tick(&self) -> DealResult<Option<TerminalSignal>> {
        let ctx = &self.ctx;
        let mut st = ctx.lock().await;
        if self.token.is_cancelled() {
            return Ok(None);
        }

        // Take-profit first: a fill here wins over any safety-order bookkeeping
        if let Some(tp) = st.tracker.take_profit().filter(|tp| tp.status == TrackedStatus::New).cloned() {
            let order = ctx.gateway.get_order(&tp.order_id).await?;
            if order.is_filled() {
                st.tracker.mark_filled(&tp.order_id);
                ctx.persistence.rewrite_order(&order).await?;
                info!(order_id = %order.id, price = order.fill_price(), "🎉 Take-profit filled");
                return Ok(Some(TerminalSignal::TakeProfitFilled));
            }
        }

        let mut filled_any = false;
        for open in st.tracker.open_safety_orders() {
            let order = ctx.gateway.get_order(&open.order_id).await?;
            if !order.is_filled() {
                continue;
            }
            filled_any = true;
            ctx.fold_safety_fill(&mut st, &order).await?;

            if ctx.refresh_take_profit(&mut st).await? == TakeProfitRefresh::AlreadyFilled {
                info!("Take-profit filled while being re-priced");
                return Ok(Some(TerminalSignal::TakeProfitFilled));
            }

            if !st.ladder_done() {
                ctx.place_safety_order(&mut st).await?;
            }
            ctx.publish(&st, None).await?;
        }

        if filled_any && st.ladder_done() && st.tracker.active_safety_orders() == 0 {
            info!(
                placed = st.tracker.safety_orders_placed(),
                zero_share_rung = st.ladder_exhausted,
                "Ladder exhausted, closing at market"
            );
            return Ok(Some(TerminalSignal::LadderExhausted));
        }
        Ok(None)
    }
}
