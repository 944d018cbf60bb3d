//! Control listener
//! Polls the deal's control record for operator intents: cancel > close-at-market > buy-more > edit

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::api::DealRecord;
use crate::trading::signals::{SignalSender, TerminalSignal};
use crate::trading::worker::DealContext;

/// Operator intent read from one control record snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlIntent {
    Cancel,
    CloseAtMarket,
    BuyMore,
    Edit,
}

/// Highest-priority intent set on the record, if any
pub fn intent_of(record: &DealRecord) -> Option<ControlIntent> {
    if record.deal_cancelled_by_user {
        Some(ControlIntent::Cancel)
    } else if record.deal_closed_at_market_price_by_user {
        Some(ControlIntent::CloseAtMarket)
    } else if record.manual_order_placed_by_user {
        Some(ControlIntent::BuyMore)
    } else if record.deal_edited_by_user {
        Some(ControlIntent::Edit)
    } else {
        None
    }
}

pub struct ControlListener {
    ctx: Arc<DealContext>,
    signals: SignalSender,
    token: CancellationToken,
}

impl ControlListener {
    pub fn new(ctx: Arc<DealContext>, signals: SignalSender, token: CancellationToken) -> Self {
        Self { ctx, signals, token }
    }

    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.ctx.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = interval.tick() => {}
            }

            let record = tokio::select! {
                _ = self.token.cancelled() => break,
                record = self.ctx.persistence.read_control() => match record {
                    Ok(record) => record,
                    Err(e) => {
                        error!(category = e.category(), "Control listener stopped: {}", e);
                        self.signals.fatal(e).await;
                        break;
                    }
                },
            };

            let delivered = match intent_of(&record) {
                None => true,
                Some(ControlIntent::Cancel) => {
                    info!("Deal cancelled by operator");
                    self.signals.terminal(TerminalSignal::Cancelled).await;
                    break;
                }
                Some(ControlIntent::CloseAtMarket) => {
                    info!("Close at market requested by operator");
                    self.signals.terminal(TerminalSignal::ClosedAtMarket).await;
                    break;
                }
                Some(ControlIntent::BuyMore) => self.signals.buy_more(),
                Some(ControlIntent::Edit) => {
                    debug!("Deal edited by operator, waiting for the edit to be applied");
                    self.signals.edit().await
                }
            };
            if !delivered {
                break;
            }
        }
        debug!("Control listener exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_outranks_everything() {
        let mut record = DealRecord::new("d", "s", "u", "ASMB");
        record.deal_cancelled_by_user = true;
        record.deal_closed_at_market_price_by_user = true;
        record.manual_order_placed_by_user = true;
        record.deal_edited_by_user = true;
        assert_eq!(intent_of(&record), Some(ControlIntent::Cancel));
    }

    #[test]
    fn test_priority_order() {
        let mut record = DealRecord::new("d", "s", "u", "ASMB");
        assert_eq!(intent_of(&record), None);

        record.deal_edited_by_user = true;
        assert_eq!(intent_of(&record), Some(ControlIntent::Edit));

        record.manual_order_placed_by_user = true;
        assert_eq!(intent_of(&record), Some(ControlIntent::BuyMore));

        record.deal_closed_at_market_price_by_user = true;
        assert_eq!(intent_of(&record), Some(ControlIntent::CloseAtMarket));
    }
}
