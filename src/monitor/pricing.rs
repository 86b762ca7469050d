//! Position pricing
//! Mission: one `get_position_price` that keeps venue and pricing source
//! coherent. Pre-graduation positions price off curve math (or the
//! launchpad mirror); post-graduation positions price off the AMM side.
//! A 30 s cache sits in front as a hint; it never feeds correctness
//! decisions.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::errors::{ErrorCode, TradeError};
use crate::models::{Position, PricingSource};
use crate::providers::aggregator::AggregatorClient;
use crate::providers::dexscreener::DexScreenerClient;
use crate::providers::launchpad::{fetch_curve_state, LaunchpadApiClient};
use crate::providers::rpc::RpcClient;

const PRICE_CACHE_TTL: Duration = Duration::from_secs(30);
/// Probe size for aggregator-derived prices: 1M base units of the token.
const AGGREGATOR_PROBE_TOKENS: u64 = 1_000_000;

pub struct PriceService {
    rpc: Arc<RpcClient>,
    aggregator: Arc<AggregatorClient>,
    dexscreener: Arc<DexScreenerClient>,
    launchpad: Arc<LaunchpadApiClient>,
    cache: Mutex<HashMap<String, (f64, Instant)>>,
}

impl PriceService {
    pub fn new(
        rpc: Arc<RpcClient>,
        aggregator: Arc<AggregatorClient>,
        dexscreener: Arc<DexScreenerClient>,
        launchpad: Arc<LaunchpadApiClient>,
    ) -> Self {
        Self {
            rpc,
            aggregator,
            dexscreener,
            launchpad,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Price in SOL per token for a position, via the fallback chain that
    /// matches its pricing source.
    pub async fn get_position_price(&self, position: &Position) -> Result<f64, TradeError> {
        if let Some(price) = self.cached(&position.token_mint) {
            return Ok(price);
        }

        let price = match position.pricing_source {
            PricingSource::BondingCurve => self.curve_price(position).await?,
            PricingSource::AmmPool => self.amm_price(&position.token_mint).await?,
        };
        self.store(&position.token_mint, price);
        Ok(price)
    }

    /// Curve chain: on-chain curve math first, launchpad mirror second.
    async fn curve_price(&self, position: &Position) -> Result<f64, TradeError> {
        if let Some(curve) = &position.bonding_curve {
            match fetch_curve_state(&self.rpc, curve).await {
                Ok(Some(state)) if state.spot_price_sol() > 0.0 => {
                    return Ok(state.spot_price_sol());
                }
                Ok(_) => {}
                Err(e) => debug!("Curve read failed for {}: {}", position.token_mint, e),
            }
        }
        self.launchpad.price_in_sol(&position.token_mint).await
    }

    /// AMM chain: aggregator quote first, screener second.
    async fn amm_price(&self, mint: &str) -> Result<f64, TradeError> {
        match self
            .aggregator
            .price_in_sol(mint, AGGREGATOR_PROBE_TOKENS)
            .await
        {
            Ok(price) if price > 0.0 => return Ok(price),
            Ok(_) => {}
            Err(e) => debug!("Aggregator price failed for {}: {}", mint, e),
        }
        self.dexscreener.price_in_sol(mint).await.and_then(|p| {
            if p > 0.0 {
                Ok(p)
            } else {
                Err(TradeError::new(
                    ErrorCode::NetworkError,
                    "screener returned a zero price",
                ))
            }
        })
    }

    fn cached(&self, mint: &str) -> Option<f64> {
        let cache = self.cache.lock();
        cache
            .get(mint)
            .filter(|(_, at)| at.elapsed() < PRICE_CACHE_TTL)
            .map(|(price, _)| *price)
    }

    fn store(&self, mint: &str, price: f64) {
        let mut cache = self.cache.lock();
        if cache.len() > 4096 {
            cache.retain(|_, (_, at)| at.elapsed() < PRICE_CACHE_TTL);
        }
        cache.insert(mint.to_string(), (price, Instant::now()));
    }

    /// Test hook: pre-warm the cache so unit tests can price without I/O.
    #[cfg(test)]
    pub fn prime_cache(&self, mint: &str, price: f64) {
        self.store(mint, price);
    }
}
