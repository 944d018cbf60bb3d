//! Exchange gateway
//! Order placement, cancellation, lookup and quotes against the brokerage.
//!
//! Transient failures are retried under the gateway's [`RetryPolicy`] and never
//! surface. Brokerage rejections do, as [`DealError`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::api::{
    ApiError, BrokerOrder, BrokerOrderStatus, Brokerage, OrderRequest, OrderSide, ReplaceRequest,
};
use crate::trading::errors::{DealError, DealResult};
use crate::trading::ladder::clamp_stop;
use crate::utils::{retry_with_policy, RateLimiter, RetryPolicy};

/// Exchange gateway for one symbol
pub struct ExchangeGateway {
    brokerage: Arc<dyn Brokerage>,
    symbol: String,
    retry: RetryPolicy,
    limiter: RateLimiter,
    poll_interval: Duration,
}

impl ExchangeGateway {
    pub fn new(
        brokerage: Arc<dyn Brokerage>,
        symbol: &str,
        retry: RetryPolicy,
        min_call_spacing_ms: u64,
        poll_interval: Duration,
    ) -> Self {
        Self {
            brokerage,
            symbol: symbol.to_string(),
            retry,
            limiter: RateLimiter::new(min_call_spacing_ms),
            poll_interval,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Sleep until the market session opens; returns at once when it is open
    pub async fn wait_until_open(&self) -> DealResult<()> {
        let clock = retry_with_policy("get_clock", &self.retry, || async {
            self.limiter.wait().await;
            self.brokerage.get_clock().await
        })
        .await
        .map_err(|e| DealError::brokerage("get_clock", e))?;

        if !clock.is_open {
            let wait = clock.until_open();
            info!(
                next_open = %clock.next_open,
                wait_secs = wait.as_secs(),
                "⏰ Market closed, sleeping until next open"
            );
            tokio::time::sleep(wait).await;
        }
        Ok(())
    }

    /// Latest ask (bid when no ask is quoted); waits until a positive price is available
    pub async fn latest_price(&self) -> DealResult<f64> {
        loop {
            let quote = retry_with_policy("get_latest_quote", &self.retry, || async {
                self.limiter.wait().await;
                self.brokerage.get_latest_quote(&self.symbol).await
            })
            .await
            .map_err(|e| DealError::brokerage("get_latest_quote", e))?;

            let price = if quote.ask_price > 0.0 {
                quote.ask_price
            } else {
                quote.bid_price
            };
            if price > 0.0 {
                return Ok(price);
            }
            warn!(symbol = %self.symbol, "No quote available yet, waiting");
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Submit an order exactly once.
    ///
    /// The request's client order id is kept across attempts. After a failed
    /// attempt the id is looked up first, and an order that already landed is
    /// adopted instead of being submitted a second time.
    pub async fn submit(&self, request: &OrderRequest) -> DealResult<BrokerOrder> {
        let attempted = AtomicBool::new(false);

        let result = retry_with_policy("place_order", &self.retry, || {
            let attempted = &attempted;
            async move {
                self.limiter.wait().await;
                if attempted.swap(true, Ordering::SeqCst) {
                    if let Some(existing) = self
                        .brokerage
                        .get_order_by_client_id(&request.client_order_id)
                        .await?
                    {
                        info!(
                            order_id = %existing.id,
                            client_order_id = %request.client_order_id,
                            "Adopting order from an earlier attempt"
                        );
                        return Ok(existing);
                    }
                }
                self.brokerage.place_order(request).await
            }
        })
        .await;

        match result {
            Ok(order) => {
                info!(
                    order_id = %order.id,
                    side = ?order.side,
                    kind = ?order.order_type,
                    qty = %request.qty,
                    limit = ?request.limit_price,
                    stop = ?request.stop_price,
                    "📤 Order placed"
                );
                Ok(order)
            }
            Err(e) => Err(DealError::rejected(request, e)),
        }
    }

    /// Stop-limit order (GTC) with the stop clamped against the current quote
    pub async fn place_stop_limit(
        &self,
        side: OrderSide,
        quantity: u64,
        limit_price: f64,
        stop_price: f64,
    ) -> DealResult<BrokerOrder> {
        let market = self.latest_price().await?;
        let stop_price = clamp_stop(side, stop_price, market);
        let request = OrderRequest::stop_limit(&self.symbol, side, quantity, limit_price, stop_price);
        self.submit(&request).await
    }

    /// Market order (day)
    pub async fn place_market(&self, side: OrderSide, quantity: u64) -> DealResult<BrokerOrder> {
        let request = OrderRequest::market(&self.symbol, side, quantity);
        self.submit(&request).await
    }

    /// Canonical order state
    pub async fn get_order(&self, order_id: &str) -> DealResult<BrokerOrder> {
        retry_with_policy("get_order", &self.retry, || async {
            self.limiter.wait().await;
            self.brokerage.get_order(order_id).await
        })
        .await
        .map_err(|e| DealError::brokerage("get_order", e))
    }

    /// Poll until the order fills
    pub async fn wait_for_fill(&self, order_id: &str) -> DealResult<BrokerOrder> {
        loop {
            let order = self.get_order(order_id).await?;
            if order.is_filled() {
                if order.filled_avg_price.is_none() {
                    return Err(DealError::MissingFillData {
                        order_id: order.id.clone(),
                    });
                }
                return Ok(order);
            }
            if order.status.is_terminal() {
                return Err(DealError::OrderNotFilled {
                    order_id: order.id.clone(),
                    status: order.status.as_str().to_string(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Cancel an order and wait until the brokerage reports it settled.
    ///
    /// An order already canceled, filled, expired or replaced completes the call.
    /// Returns the final canonical state so callers can tell a cancel from a fill
    /// that raced it.
    pub async fn cancel(&self, order_id: &str) -> DealResult<BrokerOrder> {
        loop {
            let requested = retry_with_policy("cancel_order", &self.retry, || async {
                self.limiter.wait().await;
                self.brokerage.cancel_order(order_id).await
            })
            .await;

            match requested {
                Ok(()) => {}
                Err(ApiError::NotFound(message)) => {
                    return Err(DealError::brokerage("cancel_order", ApiError::NotFound(message)));
                }
                // Not cancelable; the order state below says why
                Err(e) => warn!(order_id, "Cancel refused: {}", e),
            }

            let order = self.get_order(order_id).await?;
            match order.status {
                BrokerOrderStatus::Canceled
                | BrokerOrderStatus::Filled
                | BrokerOrderStatus::Expired
                | BrokerOrderStatus::Replaced
                | BrokerOrderStatus::Rejected => {
                    info!(order_id, status = order.status.as_str(), "🚫 Cancel settled");
                    return Ok(order);
                }
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }
    }

    /// Replace an open stop-limit with new quantity and prices, stop clamped against the quote
    pub async fn replace_stop_limit(
        &self,
        order_id: &str,
        side: OrderSide,
        quantity: u64,
        limit_price: f64,
        stop_price: f64,
    ) -> DealResult<BrokerOrder> {
        let market = self.latest_price().await?;
        let request = ReplaceRequest::stop_limit(quantity, limit_price, clamp_stop(side, stop_price, market));

        let replaced = retry_with_policy("replace_order", &self.retry, || async {
            self.limiter.wait().await;
            self.brokerage.replace_order(order_id, &request).await
        })
        .await
        .map_err(|e| DealError::brokerage("replace_order", e))?;

        info!(old = order_id, new = %replaced.id, limit = ?request.limit_price, "🔁 Order replaced");
        Ok(replaced)
    }
}
