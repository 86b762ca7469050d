//! Bonding-curve venue adapter
//! Pre-graduation trades run against the launchpad's virtual-reserve curve.
//! Quotes come from constant-product math over the live curve account; the
//! transaction itself is built by the launchpad API and signed locally.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::errors::{ErrorCode, TradeError};
use crate::models::{LifecycleState, TradeAction};
use crate::providers::launchpad::{fetch_curve_state, CurveState, LaunchpadApiClient};
use crate::providers::rpc::RpcClient;
use crate::providers::{LAMPORTS_PER_SOL, TOKEN_BASE_UNITS};

use super::{
    clamp_slippage, submit_and_confirm, ExecuteOptions, SwapIntent, SwapQuote, SwapReceipt,
    UnsignedSwap, VenueAdapter, VENUE_BONDING_CURVE,
};

pub struct BondingCurveAdapter {
    rpc: Arc<RpcClient>,
    api: Arc<LaunchpadApiClient>,
}

impl BondingCurveAdapter {
    pub fn new(rpc: Arc<RpcClient>, api: Arc<LaunchpadApiClient>) -> Self {
        Self { rpc, api }
    }

    async fn resolve_curve_state(&self, intent: &SwapIntent) -> Result<CurveState, TradeError> {
        // Prefer the live on-chain account; fall back to the REST mirror.
        if let Some(curve) = &intent.bonding_curve {
            if let Some(state) = fetch_curve_state(&self.rpc, curve).await? {
                return Ok(state);
            }
        }
        let info = self.api.coin_info(&intent.mint).await?;
        if let Some(curve) = &info.bonding_curve {
            if let Some(state) = fetch_curve_state(&self.rpc, curve).await? {
                return Ok(state);
            }
        }
        Ok(CurveState {
            virtual_token_reserves: info.virtual_token_reserves,
            virtual_sol_reserves: info.virtual_sol_reserves,
            real_token_reserves: 0,
            real_sol_reserves: 0,
            token_total_supply: 0,
            complete: info.complete,
        })
    }
}

/// Quote math shared with tests: given curve state and an intent, produce
/// expected/min amounts.
pub fn quote_against_curve(state: &CurveState, intent: &SwapIntent) -> Result<SwapQuote, TradeError> {
    if state.complete {
        // Building a curve trade for a migrated token is a permanent error:
        // the router must be re-run against the AMM venue.
        return Err(TradeError::new(
            ErrorCode::TokenGraduated,
            "bonding curve is complete",
        ));
    }
    let slippage = clamp_slippage(intent.slippage_bps) as u64;
    let (expected_out, price) = match intent.action {
        TradeAction::Buy => {
            let tokens = state.tokens_out_for_sol(intent.amount);
            if tokens == 0 {
                return Err(TradeError::new(
                    ErrorCode::SimulationFailed,
                    "curve quote yielded zero tokens",
                ));
            }
            let price = (intent.amount as f64 / LAMPORTS_PER_SOL)
                / (tokens as f64 / TOKEN_BASE_UNITS);
            (tokens, price)
        }
        TradeAction::Sell => {
            let lamports = state.sol_out_for_tokens(intent.amount);
            if lamports == 0 {
                return Err(TradeError::new(
                    ErrorCode::SimulationFailed,
                    "curve quote yielded zero lamports",
                ));
            }
            let price = (lamports as f64 / LAMPORTS_PER_SOL)
                / (intent.amount as f64 / TOKEN_BASE_UNITS);
            (lamports, price)
        }
    };
    let min_out = expected_out.saturating_mul(10_000 - slippage) / 10_000;
    Ok(SwapQuote {
        venue: VENUE_BONDING_CURVE,
        in_amount: intent.amount,
        expected_out,
        min_out,
        price_sol_per_token: price,
        aggregator: None,
    })
}

#[async_trait]
impl VenueAdapter for BondingCurveAdapter {
    fn name(&self) -> &'static str {
        VENUE_BONDING_CURVE
    }

    fn can_handle(&self, intent: &SwapIntent) -> bool {
        intent.bonding_curve.is_some()
            || matches!(intent.lifecycle_state, Some(LifecycleState::PreGraduation))
    }

    async fn quote(&self, intent: &SwapIntent) -> Result<SwapQuote, TradeError> {
        let state = self.resolve_curve_state(intent).await?;
        let quote = quote_against_curve(&state, intent)?;
        debug!(
            "Curve quote for {}: {} in -> {} out (min {})",
            intent.mint, quote.in_amount, quote.expected_out, quote.min_out
        );
        Ok(quote)
    }

    async fn build_tx(
        &self,
        _quote: &SwapQuote,
        intent: &SwapIntent,
    ) -> Result<UnsignedSwap, TradeError> {
        let tx_b64 = self
            .api
            .build_trade_transaction(
                &intent.user_pubkey,
                &intent.mint,
                intent.action == TradeAction::Buy,
                intent.amount,
                clamp_slippage(intent.slippage_bps),
                intent.priority_fee_lamports,
            )
            .await?;
        Ok(UnsignedSwap {
            venue: VENUE_BONDING_CURVE,
            tx_b64,
        })
    }

    async fn execute(
        &self,
        signed_tx_b64: &str,
        opts: &ExecuteOptions,
    ) -> Result<SwapReceipt, TradeError> {
        submit_and_confirm(&self.rpc, VENUE_BONDING_CURVE, signed_tx_b64, opts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> CurveState {
        CurveState {
            virtual_token_reserves: 1_073_000_000_000_000,
            virtual_sol_reserves: 30_000_000_000,
            real_token_reserves: 0,
            real_sol_reserves: 0,
            token_total_supply: 0,
            complete: false,
        }
    }

    fn intent(action: TradeAction, amount: u64, slippage_bps: u32) -> SwapIntent {
        SwapIntent {
            action,
            mint: "MintA".to_string(),
            amount,
            slippage_bps,
            user_pubkey: "Pub".to_string(),
            priority_fee_lamports: 0,
            lifecycle_state: Some(LifecycleState::PreGraduation),
            bonding_curve: Some("Curve".to_string()),
            emergency: false,
        }
    }

    #[test]
    fn test_buy_quote_applies_slippage_floor() {
        let q = quote_against_curve(&state(), &intent(TradeAction::Buy, 500_000_000, 200)).unwrap();
        assert!(q.expected_out > 0);
        let expected_min = q.expected_out * (10_000 - 200) / 10_000;
        assert_eq!(q.min_out, expected_min);
        assert!(q.price_sol_per_token > 0.0);
    }

    #[test]
    fn test_sell_quote_prices_in_sol() {
        let q = quote_against_curve(
            &state(),
            &intent(TradeAction::Sell, 10_000_000_000_000, 100),
        )
        .unwrap();
        assert!(q.expected_out > 0);
        assert!(q.min_out <= q.expected_out);
    }

    #[test]
    fn test_completed_curve_is_token_graduated() {
        let mut s = state();
        s.complete = true;
        let err = quote_against_curve(&s, &intent(TradeAction::Buy, 1_000_000, 100)).unwrap_err();
        assert_eq!(err.code, ErrorCode::TokenGraduated);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_oversized_slippage_is_clamped_not_inverted() {
        // 20_000 bps would underflow the min_out formula without the clamp
        let q =
            quote_against_curve(&state(), &intent(TradeAction::Buy, 500_000_000, 20_000)).unwrap();
        assert_eq!(q.min_out, q.expected_out / 100);
    }
}
