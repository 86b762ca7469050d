//! DEX screener price adapter

use serde::Deserialize;
use std::time::Duration;

use crate::errors::{classify_http_error, ErrorCode, TradeError};

const PRICE_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    pairs: Option<Vec<Pair>>,
}

#[derive(Debug, Deserialize)]
struct Pair {
    #[serde(rename = "priceNative")]
    price_native: Option<String>,
    #[serde(default)]
    liquidity: Option<Liquidity>,
    #[serde(rename = "quoteToken")]
    quote_token: Option<QuoteToken>,
}

#[derive(Debug, Deserialize)]
struct Liquidity {
    #[serde(default)]
    usd: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct QuoteToken {
    symbol: Option<String>,
}

pub struct DexScreenerClient {
    http: reqwest::Client,
    base_url: String,
}

impl DexScreenerClient {
    pub fn new(base_url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(PRICE_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self { http, base_url }
    }

    /// Price in SOL per token from the deepest SOL-quoted pair.
    pub async fn price_in_sol(&self, mint: &str) -> Result<f64, TradeError> {
        let url = format!("{}/latest/dex/tokens/{}", self.base_url, mint);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| TradeError::new(classify_http_error(&e), format!("dexscreener: {}", e)))?;
        if !resp.status().is_success() {
            return Err(TradeError::new(
                ErrorCode::NetworkError,
                format!("dexscreener status {}", resp.status()),
            ));
        }
        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| TradeError::new(ErrorCode::NetworkError, format!("dexscreener decode: {}", e)))?;

        best_sol_price(body).ok_or_else(|| {
            TradeError::new(ErrorCode::NetworkError, "no SOL-quoted pair with a price")
        })
    }
}

fn best_sol_price(body: TokenResponse) -> Option<f64> {
    body.pairs?
        .into_iter()
        .filter(|p| {
            p.quote_token
                .as_ref()
                .and_then(|q| q.symbol.as_deref())
                .map(|s| s.eq_ignore_ascii_case("SOL") || s.eq_ignore_ascii_case("WSOL"))
                .unwrap_or(false)
        })
        .max_by(|a, b| {
            let la = a.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0);
            let lb = b.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0);
            la.total_cmp(&lb)
        })
        .and_then(|p| p.price_native)
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|p| *p > 0.0)
}
