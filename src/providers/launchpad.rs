//! Launchpad adapter: REST coin info and on-chain curve account decoding
//! Mission: one `CurveState` type serves pricing math, trade building and
//! graduation detection, whether it came from the REST API or a raw account
//! read.

use serde::Deserialize;
use std::time::Duration;

use crate::errors::{classify_http_error, ErrorCode, TradeError};
use crate::providers::rpc::RpcClient;
use crate::providers::{LAMPORTS_PER_SOL, TOKEN_BASE_UNITS};

const API_TIMEOUT_SECS: u64 = 5;

/// Account discriminator of the bonding-curve state account.
const CURVE_ACCOUNT_DISC: [u8; 8] = [23, 183, 248, 55, 96, 216, 172, 96];
/// 8 disc + 5 u64 + bool
const CURVE_ACCOUNT_LEN: usize = 8 + 5 * 8 + 1;

/// Virtual-reserve state of one bonding curve.
#[derive(Debug, Clone, PartialEq)]
pub struct CurveState {
    pub virtual_token_reserves: u64,
    pub virtual_sol_reserves: u64,
    pub real_token_reserves: u64,
    pub real_sol_reserves: u64,
    pub token_total_supply: u64,
    pub complete: bool,
}

impl CurveState {
    /// Spot price in SOL per token from the virtual reserves.
    pub fn spot_price_sol(&self) -> f64 {
        if self.virtual_token_reserves == 0 {
            return 0.0;
        }
        (self.virtual_sol_reserves as f64 / LAMPORTS_PER_SOL)
            / (self.virtual_token_reserves as f64 / TOKEN_BASE_UNITS)
    }

    /// Constant-product buy: tokens out for `lamports_in`.
    pub fn tokens_out_for_sol(&self, lamports_in: u64) -> u64 {
        let vsol = self.virtual_sol_reserves as u128;
        let vtok = self.virtual_token_reserves as u128;
        if vsol == 0 || vtok == 0 {
            return 0;
        }
        let k = vsol * vtok;
        let new_sol = vsol + lamports_in as u128;
        let new_tok = k / new_sol;
        (vtok - new_tok) as u64
    }

    /// Constant-product sell: lamports out for `tokens_in`.
    pub fn sol_out_for_tokens(&self, tokens_in: u64) -> u64 {
        let vsol = self.virtual_sol_reserves as u128;
        let vtok = self.virtual_token_reserves as u128;
        if vsol == 0 || vtok == 0 {
            return 0;
        }
        let k = vsol * vtok;
        let new_tok = vtok + tokens_in as u128;
        let new_sol = k / new_tok;
        (vsol - new_sol) as u64
    }
}

/// Decode a raw bonding-curve account. Layout: discriminator, five u64
/// little-endian reserves/supply fields, completion flag.
pub fn decode_curve_account(data: &[u8]) -> Result<CurveState, TradeError> {
    if data.len() < CURVE_ACCOUNT_LEN {
        return Err(TradeError::new(
            ErrorCode::NetworkError,
            format!("curve account too short: {} bytes", data.len()),
        ));
    }
    if data[..8] != CURVE_ACCOUNT_DISC {
        return Err(TradeError::new(
            ErrorCode::NetworkError,
            "account is not a bonding curve",
        ));
    }
    let u64_at = |off: usize| -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&data[off..off + 8]);
        u64::from_le_bytes(buf)
    };
    Ok(CurveState {
        virtual_token_reserves: u64_at(8),
        virtual_sol_reserves: u64_at(16),
        real_token_reserves: u64_at(24),
        real_sol_reserves: u64_at(32),
        token_total_supply: u64_at(40),
        complete: data[48] != 0,
    })
}

/// Read curve state straight from the chain.
pub async fn fetch_curve_state(
    rpc: &RpcClient,
    curve_address: &str,
) -> Result<Option<CurveState>, TradeError> {
    match rpc.get_account_data(curve_address).await? {
        None => Ok(None),
        Some(data) => decode_curve_account(&data).map(Some),
    }
}

// --- REST side ---

#[derive(Debug, Clone, Deserialize)]
pub struct CoinInfo {
    pub mint: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub symbol: Option<String>,
    #[serde(default)]
    pub creator: Option<String>,
    #[serde(default)]
    pub bonding_curve: Option<String>,
    #[serde(default)]
    pub virtual_sol_reserves: u64,
    #[serde(default)]
    pub virtual_token_reserves: u64,
    #[serde(default)]
    pub usd_market_cap: Option<f64>,
    #[serde(default)]
    pub complete: bool,
    /// Set once liquidity has migrated to the AMM.
    #[serde(default)]
    pub raydium_pool: Option<String>,
}

impl CoinInfo {
    pub fn spot_price_sol(&self) -> Option<f64> {
        if self.virtual_token_reserves == 0 {
            return None;
        }
        Some(
            (self.virtual_sol_reserves as f64 / LAMPORTS_PER_SOL)
                / (self.virtual_token_reserves as f64 / TOKEN_BASE_UNITS),
        )
    }
}

pub struct LaunchpadApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl LaunchpadApiClient {
    pub fn new(base_url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(API_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self { http, base_url }
    }

    pub async fn coin_info(&self, mint: &str) -> Result<CoinInfo, TradeError> {
        let url = format!("{}/coins/{}", self.base_url, mint);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| TradeError::new(classify_http_error(&e), format!("launchpad api: {}", e)))?;
        if !resp.status().is_success() {
            return Err(TradeError::new(
                ErrorCode::NetworkError,
                format!("launchpad api status {}", resp.status()),
            ));
        }
        resp.json()
            .await
            .map_err(|e| TradeError::new(ErrorCode::NetworkError, format!("coin decode: {}", e)))
    }

    pub async fn price_in_sol(&self, mint: &str) -> Result<f64, TradeError> {
        self.coin_info(mint).await?.spot_price_sol().ok_or_else(|| {
            TradeError::new(ErrorCode::NetworkError, "launchpad returned empty reserves")
        })
    }

    /// Build an unsigned curve trade via the launchpad's local-build
    /// endpoint. Returns the base64-serialized transaction for local
    /// signing; nothing secret leaves the process.
    #[allow(clippy::too_many_arguments)]
    pub async fn build_trade_transaction(
        &self,
        user_pubkey: &str,
        mint: &str,
        is_buy: bool,
        amount_base_units: u64,
        slippage_bps: u32,
        priority_fee_lamports: u64,
    ) -> Result<String, TradeError> {
        #[derive(Deserialize)]
        struct BuildResponse {
            transaction: String,
        }
        let body = serde_json::json!({
            "publicKey": user_pubkey,
            "mint": mint,
            "action": if is_buy { "buy" } else { "sell" },
            "amount": amount_base_units,
            "denominatedInSol": is_buy,
            "slippageBps": slippage_bps,
            "priorityFeeLamports": priority_fee_lamports,
        });
        let resp = self
            .http
            .post(format!("{}/trade-local", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| TradeError::new(classify_http_error(&e), format!("trade build: {}", e)))?;
        if !resp.status().is_success() {
            return Err(TradeError::new(
                ErrorCode::NetworkError,
                format!("trade build status {}", resp.status()),
            ));
        }
        let built: BuildResponse = resp
            .json()
            .await
            .map_err(|e| TradeError::new(ErrorCode::NetworkError, format!("trade build decode: {}", e)))?;
        Ok(built.transaction)
    }
}
