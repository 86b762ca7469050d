//! Chain JSON-RPC adapter
//! Mission: state reads and transaction submission over plain HTTP. RPC
//! provider SDKs stay out of the tree; the wire format is stable and small.

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::discovery::onchain::TxEnvelope;
use crate::errors::{classify_http_error, ErrorCode, TradeError};

const RPC_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct SimulationOutcome {
    pub success: bool,
    pub err: Option<String>,
    pub logs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationStatus {
    Processed,
    Confirmed,
    Finalized,
    Errored,
}

pub struct RpcClient {
    http: reqwest::Client,
    url: String,
}

impl RpcClient {
    pub fn new(url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(RPC_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self { http, url }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, TradeError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let resp = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TradeError::new(classify_http_error(&e), format!("{}: {}", method, e)))?;

        if resp.status().as_u16() == 429 {
            return Err(TradeError::new(
                ErrorCode::RpcRateLimited,
                format!("{} rate limited", method),
            ));
        }
        let envelope: Value = resp
            .json()
            .await
            .map_err(|e| TradeError::new(ErrorCode::NetworkError, format!("{}: {}", method, e)))?;

        if let Some(err) = envelope.get("error") {
            let message = err
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown rpc error");
            let code = if message.contains("Blockhash") || message.contains("blockhash") {
                ErrorCode::BlockhashExpired
            } else {
                ErrorCode::NetworkError
            };
            return Err(TradeError::new(code, format!("{}: {}", method, message)));
        }

        let result = envelope
            .get("result")
            .cloned()
            .ok_or_else(|| TradeError::new(ErrorCode::NetworkError, format!("{}: no result", method)))?;
        serde_json::from_value(result)
            .map_err(|e| TradeError::new(ErrorCode::NetworkError, format!("{} decode: {}", method, e)))
    }

    /// Lamport balance of an account.
    pub async fn get_balance(&self, pubkey: &str) -> Result<u64, TradeError> {
        #[derive(serde::Deserialize)]
        struct Resp {
            value: u64,
        }
        let resp: Resp = self.call("getBalance", json!([pubkey])).await?;
        Ok(resp.value)
    }

    /// Raw account data, or None when the account does not exist.
    pub async fn get_account_data(&self, pubkey: &str) -> Result<Option<Vec<u8>>, TradeError> {
        #[derive(serde::Deserialize)]
        struct Resp {
            value: Option<AccountValue>,
        }
        #[derive(serde::Deserialize)]
        struct AccountValue {
            data: (String, String),
        }
        let resp: Resp = self
            .call(
                "getAccountInfo",
                json!([pubkey, {"encoding": "base64", "commitment": "confirmed"}]),
            )
            .await?;
        match resp.value {
            None => Ok(None),
            Some(v) => {
                use base64::Engine;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(v.data.0.as_bytes())
                    .map_err(|e| {
                        TradeError::new(ErrorCode::NetworkError, format!("account data: {}", e))
                    })?;
                Ok(Some(bytes))
            }
        }
    }

    pub async fn get_latest_blockhash(&self) -> Result<String, TradeError> {
        #[derive(serde::Deserialize)]
        struct Resp {
            value: BlockhashValue,
        }
        #[derive(serde::Deserialize)]
        struct BlockhashValue {
            blockhash: String,
        }
        let resp: Resp = self
            .call("getLatestBlockhash", json!([{"commitment": "confirmed"}]))
            .await?;
        Ok(resp.value.blockhash)
    }

    /// Submit a signed, base64-serialized transaction. Returns the signature.
    pub async fn send_transaction(
        &self,
        tx_b64: &str,
        skip_preflight: bool,
    ) -> Result<String, TradeError> {
        let sig: String = self
            .call(
                "sendTransaction",
                json!([tx_b64, {
                    "encoding": "base64",
                    "skipPreflight": skip_preflight,
                    "maxRetries": 3
                }]),
            )
            .await?;
        debug!("Submitted transaction {}", sig);
        Ok(sig)
    }

    pub async fn simulate_transaction(&self, tx_b64: &str) -> Result<SimulationOutcome, TradeError> {
        #[derive(serde::Deserialize)]
        struct Resp {
            value: SimValue,
        }
        #[derive(serde::Deserialize)]
        struct SimValue {
            err: Option<Value>,
            #[serde(default)]
            logs: Option<Vec<String>>,
        }
        let resp: Resp = self
            .call(
                "simulateTransaction",
                json!([tx_b64, {"encoding": "base64", "commitment": "processed"}]),
            )
            .await?;
        Ok(SimulationOutcome {
            success: resp.value.err.is_none(),
            err: resp.value.err.map(|e| e.to_string()),
            logs: resp.value.logs.unwrap_or_default(),
        })
    }

    /// Single status probe; the confirmation loop lives with the caller.
    pub async fn get_signature_status(
        &self,
        signature: &str,
    ) -> Result<Option<ConfirmationStatus>, TradeError> {
        #[derive(serde::Deserialize)]
        struct Resp {
            value: Vec<Option<StatusValue>>,
        }
        #[derive(serde::Deserialize)]
        struct StatusValue {
            #[serde(rename = "confirmationStatus")]
            confirmation_status: Option<String>,
            err: Option<Value>,
        }
        let resp: Resp = self
            .call(
                "getSignatureStatuses",
                json!([[signature], {"searchTransactionHistory": false}]),
            )
            .await?;
        let status = resp.value.into_iter().next().flatten();
        Ok(status.map(|s| {
            if s.err.is_some() {
                ConfirmationStatus::Errored
            } else {
                match s.confirmation_status.as_deref() {
                    Some("finalized") => ConfirmationStatus::Finalized,
                    Some("confirmed") => ConfirmationStatus::Confirmed,
                    _ => ConfirmationStatus::Processed,
                }
            }
        }))
    }

    /// Full transaction for instruction decoding; None while the node has
    /// not indexed it yet.
    pub async fn get_transaction(&self, signature: &str) -> Result<Option<TxEnvelope>, TradeError> {
        self.call(
            "getTransaction",
            json!([signature, {
                "encoding": "json",
                "commitment": "confirmed",
                "maxSupportedTransactionVersion": 0
            }]),
        )
        .await
    }
}
