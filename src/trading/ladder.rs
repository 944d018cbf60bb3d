//! Safety-order ladder calculator
//!
//! Each rung is derived from the previous rung's outcome. The deviation step is
//! `previous_step * step_scale`, the cumulative deviation grows by that step and
//! the limit price is taken that far below the previous rung's limit.
//!
//! The first rung carries `previous_step = cumulative_deviation` forward while
//! later rungs carry the raw deviation step. That asymmetry is what makes the
//! spacing geometric after the first rung and must be preserved.

use serde::{Deserialize, Serialize};

use crate::api::OrderSide;

/// Stop price sits this far above the limit on a safety-order buy
pub const SAFETY_STOP_FACTOR: f64 = 1.02;

/// Ladder parameters, fixed for the lifetime of a deal
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LadderParams {
    /// Deviation of the first rung below the base fill, in percent
    pub base_deviation: f64,
    pub step_scale: f64,
    pub volume_scale: f64,
    /// Share count of the first rung
    pub safety_order_size: f64,
}

/// Carry-over state between rungs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LadderCursor {
    pub previous_price: f64,
    pub previous_deviation: f64,
    pub previous_step: f64,
    pub previous_volume: f64,
    /// Rungs computed so far; the index of the next one
    pub steps: u32,
}

impl LadderCursor {
    /// Cursor anchored at the base order's fill price
    pub fn new(base_price: f64, params: &LadderParams) -> Self {
        Self {
            previous_price: base_price,
            previous_deviation: params.base_deviation,
            previous_step: 0.0,
            previous_volume: 0.0,
            steps: 0,
        }
    }

    /// Compute the next rung without moving the cursor
    pub fn peek(&self, params: &LadderParams) -> LadderStep {
        compute_step(self, params)
    }

    /// Compute the next rung and move the cursor past it
    pub fn next_step(&mut self, params: &LadderParams) -> LadderStep {
        let step = compute_step(self, params);
        self.advance(&step);
        step
    }

    /// Move the cursor past a computed rung
    pub fn advance(&mut self, step: &LadderStep) {
        self.previous_price = step.limit_price;
        self.previous_volume = step.volume;
        self.previous_deviation = step.cumulative_deviation;
        self.previous_step = if step.index == 0 {
            step.cumulative_deviation
        } else {
            step.deviation_step
        };
        self.steps = step.index + 1;
    }

    /// Re-anchor the ladder on a new reference price, keeping its progression
    pub fn rebase(&mut self, price: f64) {
        self.previous_price = price;
    }
}

/// One computed rung of the ladder
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LadderStep {
    pub index: u32,
    pub deviation_step: f64,
    pub cumulative_deviation: f64,
    pub limit_price: f64,
    /// Unclamped stop; clamp against the market with [`clamp_stop`] before placing
    pub stop_price: f64,
    /// Notional of the rung
    pub volume: f64,
    pub quantity: u64,
}

/// Pure ladder step from the cursor's carry-over state
pub fn compute_step(cursor: &LadderCursor, params: &LadderParams) -> LadderStep {
    let index = cursor.steps;
    let deviation_step = cursor.previous_step * params.step_scale;
    let cumulative_deviation = cursor.previous_deviation + deviation_step;
    let limit_price = cursor.previous_price * (1.0 - cumulative_deviation / 100.0);
    let stop_price = limit_price * SAFETY_STOP_FACTOR;

    let (volume, quantity) = if index == 0 {
        (
            params.safety_order_size * limit_price,
            params.safety_order_size.floor().max(0.0) as u64,
        )
    } else {
        let volume = cursor.previous_volume * params.volume_scale;
        let quantity = if limit_price > 0.0 {
            (volume / limit_price).floor().max(0.0) as u64
        } else {
            0
        };
        (volume, quantity)
    };

    LadderStep {
        index,
        deviation_step,
        cumulative_deviation,
        limit_price,
        stop_price,
        volume,
        quantity,
    }
}

/// Clamp a stop price so a stop-limit is never rejected as already triggered.
///
/// Buys trigger on the way up, so the stop is lowered to a market below it.
/// Sells trigger on the way down, so the stop is raised to a market above it.
pub fn clamp_stop(side: OrderSide, stop_price: f64, market_price: f64) -> f64 {
    if market_price <= 0.0 {
        return stop_price;
    }
    match side {
        OrderSide::Buy => stop_price.min(market_price),
        OrderSide::Sell => stop_price.max(market_price),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> LadderParams {
        LadderParams {
            base_deviation: 1.0,
            step_scale: 1.5,
            volume_scale: 1.2,
            safety_order_size: 10.0,
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_first_rung() {
        let p = params();
        let mut cursor = LadderCursor::new(10.0, &p);
        let step = cursor.next_step(&p);

        assert_eq!(step.index, 0);
        assert!(approx(step.deviation_step, 0.0));
        assert!(approx(step.cumulative_deviation, 1.0));
        assert!(approx(step.limit_price, 9.90));
        assert!(approx(step.stop_price, 10.098));
        assert_eq!(step.quantity, 10);
        assert!(approx(step.volume, 99.0));
    }

    #[test]
    fn test_step_asymmetry_preserved() {
        let p = params();
        let mut cursor = LadderCursor::new(10.0, &p);

        cursor.next_step(&p);
        // After the first rung the carried step is the cumulative deviation
        assert!(approx(cursor.previous_step, 1.0));

        let second = cursor.next_step(&p);
        assert!(approx(second.deviation_step, 1.5));
        assert!(approx(second.cumulative_deviation, 2.5));
        // From the second rung on, the raw step is carried
        assert!(approx(cursor.previous_step, 1.5));

        let third = cursor.next_step(&p);
        assert!(approx(third.deviation_step, 2.25));
        assert!(approx(third.cumulative_deviation, 4.75));
    }

    #[test]
    fn test_later_rungs_scale_volume() {
        let p = params();
        let mut cursor = LadderCursor::new(10.0, &p);
        let first = cursor.next_step(&p);
        let second = cursor.next_step(&p);

        assert!(approx(second.volume, first.volume * 1.2));
        assert!(approx(second.limit_price, 9.90 * (1.0 - 0.025)));
        assert_eq!(second.quantity, (second.volume / second.limit_price).floor() as u64);
    }

    #[test]
    fn test_ladder_monotonic() {
        let p = LadderParams {
            base_deviation: 2.0,
            step_scale: 1.0,
            volume_scale: 1.0,
            safety_order_size: 5.0,
        };
        let mut cursor = LadderCursor::new(50.0, &p);
        let steps: Vec<LadderStep> = (0..8).map(|_| cursor.next_step(&p)).collect();

        for pair in steps.windows(2) {
            assert!(pair[1].limit_price < pair[0].limit_price);
            assert!(pair[1].volume >= pair[0].volume - 1e-9);
        }
    }

    #[test]
    fn test_peek_does_not_move_cursor() {
        let p = params();
        let cursor = LadderCursor::new(10.0, &p);
        let peeked = cursor.peek(&p);
        assert_eq!(cursor.steps, 0);
        assert!(approx(peeked.limit_price, 9.90));
    }

    #[test]
    fn test_rebase_keeps_progression() {
        let p = params();
        let mut cursor = LadderCursor::new(10.0, &p);
        cursor.next_step(&p);
        cursor.rebase(9.5);
        let step = cursor.peek(&p);
        assert_eq!(step.index, 1);
        assert!(approx(step.limit_price, 9.5 * (1.0 - 0.025)));
    }

    #[test]
    fn test_clamp_stop() {
        // Falling market: buy stop pulled down to the market
        assert!(approx(clamp_stop(OrderSide::Buy, 10.098, 9.95), 9.95));
        assert!(approx(clamp_stop(OrderSide::Buy, 10.098, 10.5), 10.098));
        // Rising market: sell stop pushed up to the market
        assert!(approx(clamp_stop(OrderSide::Sell, 9.898, 10.05), 10.05));
        assert!(approx(clamp_stop(OrderSide::Sell, 9.898, 9.5), 9.898));
        // No quote leaves the stop alone
        assert!(approx(clamp_stop(OrderSide::Sell, 9.898, 0.0), 9.898));
    }
}
