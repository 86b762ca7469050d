//! AMM venue adapter
//! Post-graduation trades route through the aggregator: quote, swap-build,
//! local signing, submission.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::errors::{ErrorCode, TradeError};
use crate::models::TradeAction;
use crate::providers::aggregator::{AggregatorClient, WSOL_MINT};
use crate::providers::rpc::RpcClient;
use crate::providers::{LAMPORTS_PER_SOL, TOKEN_BASE_UNITS};

use super::{
    clamp_slippage, submit_and_confirm, ExecuteOptions, SwapIntent, SwapQuote, SwapReceipt,
    UnsignedSwap, VenueAdapter, VENUE_AMM,
};

pub struct AmmAdapter {
    rpc: Arc<RpcClient>,
    aggregator: Arc<AggregatorClient>,
}

impl AmmAdapter {
    pub fn new(rpc: Arc<RpcClient>, aggregator: Arc<AggregatorClient>) -> Self {
        Self { rpc, aggregator }
    }
}

#[async_trait]
impl VenueAdapter for AmmAdapter {
    fn name(&self) -> &'static str {
        VENUE_AMM
    }

    /// The AMM venue is the default probe target: any mint with a routed
    /// pool can be handled here, and the aggregator quote call is the
    /// authoritative answer.
    fn can_handle(&self, _intent: &SwapIntent) -> bool {
        true
    }

    async fn quote(&self, intent: &SwapIntent) -> Result<SwapQuote, TradeError> {
        let slippage = clamp_slippage(intent.slippage_bps);
        let (input, output) = match intent.action {
            TradeAction::Buy => (WSOL_MINT, intent.mint.as_str()),
            TradeAction::Sell => (intent.mint.as_str(), WSOL_MINT),
        };
        let quote = self
            .aggregator
            .quote(input, output, intent.amount, slippage)
            .await?;

        let expected_out = quote.out_amount_u64();
        let min_out = quote.other_amount_threshold_u64();
        if expected_out == 0 {
            return Err(TradeError::new(
                ErrorCode::SimulationFailed,
                "aggregator quote yielded zero output",
            ));
        }
        let price_sol_per_token = match intent.action {
            TradeAction::Buy => (intent.amount as f64 / LAMPORTS_PER_SOL)
                / (expected_out as f64 / TOKEN_BASE_UNITS),
            TradeAction::Sell => (expected_out as f64 / LAMPORTS_PER_SOL)
                / (intent.amount as f64 / TOKEN_BASE_UNITS),
        };
        debug!(
            "AMM quote for {}: {} in -> {} out (impact {:?})",
            intent.mint,
            intent.amount,
            expected_out,
            quote.price_impact_pct()
        );
        Ok(SwapQuote {
            venue: VENUE_AMM,
            in_amount: intent.amount,
            expected_out,
            min_out,
            price_sol_per_token,
            aggregator: Some(quote),
        })
    }

    async fn build_tx(
        &self,
        quote: &SwapQuote,
        intent: &SwapIntent,
    ) -> Result<UnsignedSwap, TradeError> {
        let aggregator_quote = quote.aggregator.as_ref().ok_or_else(|| {
            TradeError::new(ErrorCode::Internal, "AMM build without aggregator quote")
        })?;
        let tx_b64 = self
            .aggregator
            .swap_transaction(
                aggregator_quote,
                &intent.user_pubkey,
                intent.priority_fee_lamports,
            )
            .await?;
        Ok(UnsignedSwap {
            venue: VENUE_AMM,
            tx_b64,
        })
    }

    async fn execute(
        &self,
        signed_tx_b64: &str,
        opts: &ExecuteOptions,
    ) -> Result<SwapReceipt, TradeError> {
        submit_and_confirm(&self.rpc, VENUE_AMM, signed_tx_b64, opts).await
    }
}
