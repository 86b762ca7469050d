//! AMM aggregator adapter
//! Mission: quote + swap-transaction building for the post-graduation venue.
//! The aggregator returns a serialized transaction ready for local signing.

use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::errors::{classify_http_error, ErrorCode, TradeError};
use crate::providers::LAMPORTS_PER_SOL;

const QUOTE_TIMEOUT_SECS: u64 = 5;

pub const WSOL_MINT: &str = "So11111111111111111111111111111111111111112";

/// An aggregator quote, kept as the verbatim response body: the swap-build
/// endpoint wants the whole object back, so nothing is dropped in between.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct AggregatorQuote {
    pub raw: serde_json::Value,
}

impl AggregatorQuote {
    fn amount_field(&self, key: &str) -> u64 {
        self.raw
            .get(key)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    pub fn in_amount_u64(&self) -> u64 {
        self.amount_field("inAmount")
    }

    pub fn out_amount_u64(&self) -> u64 {
        self.amount_field("outAmount")
    }

    pub fn other_amount_threshold_u64(&self) -> u64 {
        self.amount_field("otherAmountThreshold")
    }

    pub fn price_impact_pct(&self) -> Option<f64> {
        self.raw
            .get("priceImpactPct")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }
}

pub struct AggregatorClient {
    http: reqwest::Client,
    base_url: String,
}

impl AggregatorClient {
    pub fn new(base_url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(QUOTE_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self { http, base_url }
    }

    pub async fn quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount_base_units: u64,
        slippage_bps: u32,
    ) -> Result<AggregatorQuote, TradeError> {
        let url = format!(
            "{}/quote?inputMint={}&outputMint={}&amount={}&slippageBps={}",
            self.base_url, input_mint, output_mint, amount_base_units, slippage_bps
        );
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| TradeError::new(classify_http_error(&e), format!("aggregator quote: {}", e)))?;
        if !resp.status().is_success() {
            return Err(TradeError::new(
                ErrorCode::NetworkError,
                format!("aggregator quote status {}", resp.status()),
            ));
        }
        resp.json()
            .await
            .map_err(|e| TradeError::new(ErrorCode::NetworkError, format!("quote decode: {}", e)))
    }

    /// Build the unsigned swap transaction for a quote. Returns base64.
    pub async fn swap_transaction(
        &self,
        quote: &AggregatorQuote,
        user_pubkey: &str,
        priority_fee_lamports: u64,
    ) -> Result<String, TradeError> {
        #[derive(Deserialize)]
        struct SwapResponse {
            #[serde(rename = "swapTransaction")]
            swap_transaction: String,
        }
        let body = json!({
            "quoteResponse": quote.raw,
            "userPublicKey": user_pubkey,
            "wrapAndUnwrapSol": true,
            "prioritizationFeeLamports": priority_fee_lamports,
        });
        let resp = self
            .http
            .post(format!("{}/swap", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| TradeError::new(classify_http_error(&e), format!("swap build: {}", e)))?;
        if !resp.status().is_success() {
            return Err(TradeError::new(
                ErrorCode::NetworkError,
                format!("swap build status {}", resp.status()),
            ));
        }
        let swap: SwapResponse = resp
            .json()
            .await
            .map_err(|e| TradeError::new(ErrorCode::NetworkError, format!("swap decode: {}", e)))?;
        Ok(swap.swap_transaction)
    }

    /// Spot price in SOL per token, derived from a small probe quote of
    /// token -> wSOL.
    pub async fn price_in_sol(&self, mint: &str, probe_tokens: u64) -> Result<f64, TradeError> {
        let quote = self.quote(mint, WSOL_MINT, probe_tokens, 100).await?;
        let out_lamports = quote.out_amount_u64() as f64;
        let in_tokens = quote.in_amount_u64() as f64;
        if in_tokens <= 0.0 || out_lamports <= 0.0 {
            return Err(TradeError::new(
                ErrorCode::NetworkError,
                "aggregator returned empty probe quote",
            ));
        }
        // tokens carry 6 decimals, SOL carries 9
        Ok((out_lamports / LAMPORTS_PER_SOL) / (in_tokens / crate::providers::TOKEN_BASE_UNITS))
    }
}
