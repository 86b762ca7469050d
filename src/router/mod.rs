//! Venue-agnostic swap router
//! Mission: one interface over the bonding-curve venue and the AMM venue.
//! Selection is deterministic from position lifecycle; when nothing pins the
//! venue, adapters are probed in fixed order and the first match wins.

pub mod amm;
pub mod bonding_curve;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::errors::{ErrorCode, TradeError};
use crate::models::{LifecycleState, TradeAction};
use crate::providers::rpc::{ConfirmationStatus, RpcClient};

/// Hard ceiling on slippage tolerance.
pub const MAX_SLIPPAGE_BPS: u32 = 9900;
/// Confirmation deadlines: the curve venue is the fast path.
pub const CONFIRM_TIMEOUT_FAST: Duration = Duration::from_secs(30);
pub const CONFIRM_TIMEOUT_AMM: Duration = Duration::from_secs(60);
const CONFIRM_POLL_MS: u64 = 800;

pub fn clamp_slippage(bps: u32) -> u32 {
    bps.min(MAX_SLIPPAGE_BPS)
}

/// A swap the executor wants to perform. Amount is lamports on buys and
/// token base units on sells.
#[derive(Debug, Clone)]
pub struct SwapIntent {
    pub action: TradeAction,
    pub mint: String,
    pub amount: u64,
    pub slippage_bps: u32,
    pub user_pubkey: String,
    pub priority_fee_lamports: u64,
    pub lifecycle_state: Option<LifecycleState>,
    pub bonding_curve: Option<String>,
    /// Emergency exits skip pre-execution simulation.
    pub emergency: bool,
}

#[derive(Debug, Clone)]
pub struct SwapQuote {
    pub venue: &'static str,
    pub in_amount: u64,
    pub expected_out: u64,
    pub min_out: u64,
    /// SOL per token implied by the quote.
    pub price_sol_per_token: f64,
    /// AMM adapter carries the aggregator quote for the swap-build call.
    pub aggregator: Option<crate::providers::aggregator::AggregatorQuote>,
}

#[derive(Debug, Clone)]
pub struct UnsignedSwap {
    pub venue: &'static str,
    pub tx_b64: String,
}

#[derive(Debug, Clone)]
pub struct SwapReceipt {
    pub venue: &'static str,
    pub signature: String,
}

#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub skip_simulation: bool,
    pub confirmation_timeout: Duration,
}

#[async_trait]
pub trait VenueAdapter: Send + Sync {
    fn name(&self) -> &'static str;
    fn can_handle(&self, intent: &SwapIntent) -> bool;
    async fn quote(&self, intent: &SwapIntent) -> Result<SwapQuote, TradeError>;
    async fn build_tx(
        &self,
        quote: &SwapQuote,
        intent: &SwapIntent,
    ) -> Result<UnsignedSwap, TradeError>;
    async fn execute(
        &self,
        signed_tx_b64: &str,
        opts: &ExecuteOptions,
    ) -> Result<SwapReceipt, TradeError>;
}

impl std::fmt::Debug for dyn VenueAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VenueAdapter").field("name", &self.name()).finish()
    }
}

pub const VENUE_BONDING_CURVE: &str = "bonding_curve";
pub const VENUE_AMM: &str = "amm";

/// Adapter registry with the deterministic selection rule.
pub struct SwapRouter {
    /// Probe order for unpinned intents: AMM first.
    adapters: Vec<Arc<dyn VenueAdapter>>,
}

impl SwapRouter {
    pub fn new(adapters: Vec<Arc<dyn VenueAdapter>>) -> Self {
        Self { adapters }
    }

    fn by_name(&self, name: &str) -> Option<Arc<dyn VenueAdapter>> {
        self.adapters.iter().find(|a| a.name() == name).cloned()
    }

    /// Selection rule:
    /// - POST_GRADUATION pins the AMM venue
    /// - PRE_GRADUATION (or a supplied curve address) pins the curve venue
    /// - otherwise probe in fixed order, first `can_handle` wins
    pub fn select(&self, intent: &SwapIntent) -> Result<Arc<dyn VenueAdapter>, TradeError> {
        let pinned = match intent.lifecycle_state {
            Some(LifecycleState::PostGraduation) => Some(VENUE_AMM),
            Some(LifecycleState::PreGraduation) => Some(VENUE_BONDING_CURVE),
            _ if intent.bonding_curve.is_some() => Some(VENUE_BONDING_CURVE),
            _ => None,
        };
        if let Some(name) = pinned {
            return self.by_name(name).ok_or_else(|| {
                TradeError::new(ErrorCode::Internal, format!("venue {} not registered", name))
            });
        }
        for adapter in &self.adapters {
            if adapter.can_handle(intent) {
                debug!("Probed venue {} for {}", adapter.name(), intent.mint);
                return Ok(adapter.clone());
            }
        }
        Err(TradeError::new(
            ErrorCode::Internal,
            format!("no venue can handle {}", intent.mint),
        ))
    }
}

/// Shared submit-and-confirm path used by both adapters: optional
/// simulation gate, submission, then status polling until the deadline.
pub(crate) async fn submit_and_confirm(
    rpc: &RpcClient,
    venue: &'static str,
    signed_tx_b64: &str,
    opts: &ExecuteOptions,
) -> Result<SwapReceipt, TradeError> {
    if !opts.skip_simulation {
        let sim = rpc.simulate_transaction(signed_tx_b64).await?;
        if !sim.success {
            return Err(TradeError::new(
                ErrorCode::SimulationFailed,
                classify_simulation_logs(&sim.logs, sim.err.as_deref()),
            ));
        }
    }

    let signature = rpc
        .send_transaction(signed_tx_b64, opts.skip_simulation)
        .await
        .map_err(reclassify_send_error)?;

    let deadline = tokio::time::Instant::now() + opts.confirmation_timeout;
    loop {
        match rpc.get_signature_status(&signature).await {
            Ok(Some(ConfirmationStatus::Confirmed | ConfirmationStatus::Finalized)) => {
                return Ok(SwapReceipt { venue, signature });
            }
            Ok(Some(ConfirmationStatus::Errored)) => {
                return Err(TradeError::new(
                    ErrorCode::SlippageExceeded,
                    format!("transaction {} failed on chain", signature),
                ));
            }
            Ok(_) => {}
            Err(e) => warn!("status poll failed for {}: {}", signature, e),
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(TradeError::new(
                ErrorCode::RpcTimeout,
                format!("no confirmation for {} before deadline", signature),
            ));
        }
        sleep(Duration::from_millis(CONFIRM_POLL_MS)).await;
    }
}

/// Map well-known send failures onto the bounded code table.
fn reclassify_send_error(err: TradeError) -> TradeError {
    let lower = err.detail.to_lowercase();
    let code = if lower.contains("insufficient") {
        ErrorCode::InsufficientFunds
    } else if lower.contains("slippage") || lower.contains("0x1771") {
        ErrorCode::SlippageExceeded
    } else if lower.contains("blockhash") {
        ErrorCode::BlockhashExpired
    } else {
        err.code
    };
    TradeError::new(code, err.detail)
}

fn classify_simulation_logs(logs: &[String], err: Option<&str>) -> String {
    let mut detail = err.unwrap_or("simulation failed").to_string();
    if let Some(line) = logs.iter().rev().find(|l| l.contains("Error")) {
        detail = format!("{} ({})", detail, line);
    }
    detail
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubAdapter {
        name: &'static str,
        handles: bool,
    }

    #[async_trait]
    impl VenueAdapter for StubAdapter {
        fn name(&self) -> &'static str {
            self.name
        }
        fn can_handle(&self, _intent: &SwapIntent) -> bool {
            self.handles
        }
        async fn quote(&self, _intent: &SwapIntent) -> Result<SwapQuote, TradeError> {
            unimplemented!()
        }
        async fn build_tx(
            &self,
            _quote: &SwapQuote,
            _intent: &SwapIntent,
        ) -> Result<UnsignedSwap, TradeError> {
            unimplemented!()
        }
        async fn execute(
            &self,
            _signed: &str,
            _opts: &ExecuteOptions,
        ) -> Result<SwapReceipt, TradeError> {
            unimplemented!()
        }
    }

    fn router(amm_handles: bool, curve_handles: bool) -> SwapRouter {
        SwapRouter::new(vec![
            Arc::new(StubAdapter {
                name: VENUE_AMM,
                handles: amm_handles,
            }),
            Arc::new(StubAdapter {
                name: VENUE_BONDING_CURVE,
                handles: curve_handles,
            }),
        ])
    }

    fn intent(lifecycle: Option<LifecycleState>, curve: Option<&str>) -> SwapIntent {
        SwapIntent {
            action: TradeAction::Buy,
            mint: "MintA".to_string(),
            amount: 1_000,
            slippage_bps: 100,
            user_pubkey: "Pub".to_string(),
            priority_fee_lamports: 0,
            lifecycle_state: lifecycle,
            bonding_curve: curve.map(String::from),
            emergency: false,
        }
    }

    #[test]
    fn test_post_graduation_pins_amm() {
        let r = router(false, true); // even if AMM claims it can't handle
        let a = r
            .select(&intent(Some(LifecycleState::PostGraduation), None))
            .unwrap();
        assert_eq!(a.name(), VENUE_AMM);
    }

    #[test]
    fn test_pre_graduation_pins_curve() {
        let r = router(true, false);
        let a = r
            .select(&intent(Some(LifecycleState::PreGraduation), None))
            .unwrap();
        assert_eq!(a.name(), VENUE_BONDING_CURVE);
    }

    #[test]
    fn test_supplied_curve_pins_curve() {
        let r = router(true, true);
        let a = r.select(&intent(None, Some("CurveAddr"))).unwrap();
        assert_eq!(a.name(), VENUE_BONDING_CURVE);
    }

    #[test]
    fn test_unpinned_probe_prefers_amm_first() {
        // Both claim the intent: fixed order means AMM wins, deterministically
        let r = router(true, true);
        let a = r.select(&intent(None, None)).unwrap();
        assert_eq!(a.name(), VENUE_AMM);
    }

    #[test]
    fn test_unpinned_probe_falls_through() {
        let r = router(false, true);
        let a = r.select(&intent(None, None)).unwrap();
        assert_eq!(a.name(), VENUE_BONDING_CURVE);
    }

    #[test]
    fn test_no_adapter_is_an_internal_error() {
        let r = router(false, false);
        let err = r.select(&intent(None, None)).unwrap_err();
        assert_eq!(err.code, ErrorCode::Internal);
    }

    #[test]
    fn test_slippage_clamp() {
        assert_eq!(clamp_slippage(0), 0);
        assert_eq!(clamp_slippage(500), 500);
        assert_eq!(clamp_slippage(20_000), MAX_SLIPPAGE_BPS);
    }

    #[test]
    fn test_send_error_reclassification() {
        let e = reclassify_send_error(TradeError::new(
            ErrorCode::NetworkError,
            "Transaction simulation failed: Error processing Instruction 2: custom program error: 0x1771",
        ));
        assert_eq!(e.code, ErrorCode::SlippageExceeded);

        let e = reclassify_send_error(TradeError::new(
            ErrorCode::NetworkError,
            "Attempt to debit an account but found no record of a prior credit / insufficient lamports",
        ));
        assert_eq!(e.code, ErrorCode::InsufficientFunds);

        let e = reclassify_send_error(TradeError::new(ErrorCode::RpcTimeout, "timed out"));
        assert_eq!(e.code, ErrorCode::RpcTimeout);
    }
}
