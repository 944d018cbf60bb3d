//! Running deal totals
//! Fill folding, take-profit pricing and realized profit

use serde::{Deserialize, Serialize};

/// Take-profit stop sits this far below its limit
pub const TAKE_PROFIT_STOP_FACTOR: f64 = 0.98;

/// Take-profit order prices
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitTarget {
    pub quantity: u64,
    pub limit_price: f64,
    /// Unclamped stop
    pub stop_price: f64,
}

/// Realized result of a closed deal
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Profit {
    pub sell_value: f64,
    pub value: f64,
    pub percent: f64,
}

impl Profit {
    /// Percentage as stored in the deal record
    pub fn percent_string(&self) -> String {
        format!("{:.5}", self.percent)
    }
}

/// Deal totals and the user-editable deal parameters
///
/// The average buying price is always derived from the totals, never stored,
/// so `average * quantity == total_buying_price` holds after every fold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealLedger {
    pub total_quantity: u64,
    pub total_buying_price: f64,
    pub total_selling_price: f64,
    /// Shares already sold by take-profits that filled in part before a cancel
    #[serde(default)]
    pub sold_quantity: u64,
    pub target_profit_percent: f64,
    pub stop_loss_percent: f64,
    pub max_safety_orders: u32,
    pub max_active_safety_orders: u32,
}

impl DealLedger {
    pub fn new(
        target_profit_percent: f64,
        stop_loss_percent: f64,
        max_safety_orders: u32,
        max_active_safety_orders: u32,
    ) -> Self {
        Self {
            total_quantity: 0,
            total_buying_price: 0.0,
            total_selling_price: 0.0,
            sold_quantity: 0,
            target_profit_percent,
            stop_loss_percent,
            max_safety_orders,
            max_active_safety_orders,
        }
    }

    /// Fold a fill (quantity at average price) into the totals
    pub fn fold_fill(&mut self, quantity: u64, price: f64) {
        if quantity == 0 {
            return;
        }
        self.total_quantity += quantity;
        self.total_buying_price += quantity as f64 * price;
    }

    /// Fold shares sold ahead of the close into the selling totals
    pub fn fold_sale(&mut self, quantity: u64, price: f64) {
        if quantity == 0 {
            return;
        }
        self.sold_quantity += quantity;
        self.total_selling_price += quantity as f64 * price;
    }

    /// Shares the deal still holds
    pub fn held_quantity(&self) -> u64 {
        self.total_quantity.saturating_sub(self.sold_quantity)
    }

    pub fn average_price(&self) -> f64 {
        if self.total_quantity == 0 {
            0.0
        } else {
            self.total_buying_price / self.total_quantity as f64
        }
    }

    /// Notional profit aimed for at the current target
    pub fn target_profit_value(&self) -> f64 {
        self.total_buying_price * self.target_profit_percent / 100.0
    }

    /// Take-profit order for the held position at the current target.
    ///
    /// Earlier partial sales count toward the target, so the limit is what the
    /// held shares must fetch for the whole deal to reach it.
    pub fn take_profit(&self) -> TakeProfitTarget {
        let held = self.held_quantity();
        let limit_price = if held == 0 {
            0.0
        } else {
            (self.total_buying_price + self.target_profit_value() - self.total_selling_price) / held as f64
        };
        TakeProfitTarget {
            quantity: held,
            limit_price,
            stop_price: limit_price * TAKE_PROFIT_STOP_FACTOR,
        }
    }

    /// Realized profit from a sell of the position
    pub fn profit(&self, sell_value: f64) -> Profit {
        let value = sell_value - self.total_buying_price;
        let percent = if self.total_buying_price > 0.0 {
            value / self.total_buying_price * 100.0
        } else {
            0.0
        };
        Profit {
            sell_value,
            value,
            percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_take_profit_from_base_fill() {
        let mut ledger = DealLedger::new(1.0, 0.0, 5, 3);
        ledger.fold_fill(15, 10.0);

        assert_eq!(ledger.total_quantity, 15);
        assert!(approx(ledger.total_buying_price, 150.0));

        let tp = ledger.take_profit();
        assert_eq!(tp.quantity, 15);
        assert!(approx(tp.limit_price, 10.10));
        assert!(approx(tp.stop_price, 9.898));
    }

    #[test]
    fn test_safety_fill_moves_average() {
        let mut ledger = DealLedger::new(1.0, 0.0, 5, 3);
        ledger.fold_fill(15, 10.0);
        ledger.fold_fill(10, 9.90);

        assert_eq!(ledger.total_quantity, 25);
        assert!(approx(ledger.total_buying_price, 249.0));
        assert!(approx(ledger.average_price(), 9.96));

        let tp = ledger.take_profit();
        assert_eq!(tp.quantity, 25);
        assert!(approx(tp.limit_price, 249.0 * 1.01 / 25.0));
    }

    #[test]
    fn test_partial_sale_shrinks_take_profit() {
        let mut ledger = DealLedger::new(1.0, 0.0, 5, 3);
        ledger.fold_fill(15, 10.0);
        ledger.fold_sale(6, 10.10);

        assert_eq!(ledger.held_quantity(), 9);
        assert!(approx(ledger.total_selling_price, 60.6));

        // 151.5 overall target, 60.6 already realized
        let tp = ledger.take_profit();
        assert_eq!(tp.quantity, 9);
        assert!(approx(tp.limit_price, 10.10));

        let profit = ledger.profit(ledger.total_selling_price + 9.0 * 10.0);
        assert!(approx(profit.value, 0.6));
    }

    #[test]
    fn test_zero_fill_ignored() {
        let mut ledger = DealLedger::new(1.0, 0.0, 5, 3);
        ledger.fold_fill(0, 12.0);
        assert_eq!(ledger.total_quantity, 0);
        assert_eq!(ledger.average_price(), 0.0);
    }

    #[test]
    fn test_profit() {
        let mut ledger = DealLedger::new(1.0, 0.0, 5, 3);
        ledger.fold_fill(15, 10.0);

        let profit = ledger.profit(151.5);
        assert!(approx(profit.value, 1.5));
        assert!(approx(profit.percent, 1.0));
        assert_eq!(profit.percent_string(), "1.00000");

        let loss = ledger.profit(135.0);
        assert_eq!(loss.percent_string(), "-10.00000");
    }

    proptest! {
        #[test]
        fn prop_average_times_quantity_is_total(
            fills in prop::collection::vec((1u64..10_000, 0.01f64..5_000.0), 1..30)
        ) {
            let mut ledger = DealLedger::new(1.0, 0.0, 30, 30);
            for (quantity, price) in fills {
                ledger.fold_fill(quantity, price);
                let reconstructed = ledger.average_price() * ledger.total_quantity as f64;
                let tolerance = 1e-9 * ledger.total_buying_price.max(1.0);
                prop_assert!((reconstructed - ledger.total_buying_price).abs() <= tolerance);
            }
        }
    }
}
