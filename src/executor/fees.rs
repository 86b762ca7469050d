//! Platform fee schedule
//! Mission: one place computes the split, and `net = gross - fee` holds to
//! the last double bit. Buys deduct the fee from the SOL put in; sells
//! deduct it from the SOL coming out.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeSchedule {
    /// Platform fee in basis points of gross trade value.
    pub platform_fee_bps: u32,
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            platform_fee_bps: 100, // 1%
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeeSplit {
    pub gross: f64,
    pub fee: f64,
    pub net: f64,
}

impl FeeSchedule {
    pub fn new(platform_fee_bps: u32) -> Self {
        Self {
            platform_fee_bps: platform_fee_bps.min(10_000),
        }
    }

    /// Split a buy: the user funds `gross`, the venue receives `net`.
    pub fn apply_buy_fee(&self, gross_sol: f64) -> FeeSplit {
        let fee = gross_sol * self.platform_fee_bps as f64 / 10_000.0;
        FeeSplit {
            gross: gross_sol,
            fee,
            net: gross_sol - fee,
        }
    }

    /// Split sell proceeds: the venue paid `gross`, the user keeps `net`.
    pub fn apply_sell_fee(&self, proceeds_sol: f64) -> FeeSplit {
        let fee = proceeds_sol * self.platform_fee_bps as f64 / 10_000.0;
        FeeSplit {
            gross: proceeds_sol,
            fee,
            net: proceeds_sol - fee,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_equals_gross_minus_fee() {
        let fees = FeeSchedule::new(100);
        for gross in [0.01, 0.5, 1.0, 3.333333, 10.0] {
            let split = fees.apply_buy_fee(gross);
            assert!((split.net - (split.gross - split.fee)).abs() < 1e-15);
            let split = fees.apply_sell_fee(gross);
            assert!((split.net - (split.gross - split.fee)).abs() < 1e-15);
        }
    }

    #[test]
    fn test_one_percent_split() {
        let split = FeeSchedule::new(100).apply_buy_fee(0.5);
        assert!((split.fee - 0.005).abs() < 1e-12);
        assert!((split.net - 0.495).abs() < 1e-12);
    }

    #[test]
    fn test_zero_fee_passes_through() {
        let split = FeeSchedule::new(0).apply_buy_fee(1.0);
        assert_eq!(split.fee, 0.0);
        assert_eq!(split.net, 1.0);
    }

    #[test]
    fn test_fee_bps_is_capped() {
        let fees = FeeSchedule::new(50_000);
        assert_eq!(fees.platform_fee_bps, 10_000);
        let split = fees.apply_buy_fee(1.0);
        assert!(split.net >= 0.0);
    }
}
