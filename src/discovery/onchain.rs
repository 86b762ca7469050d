//! On-chain discovery source
//! Mission: catch launches the chat channels never mention. Subscribes to
//! the launchpad program's log notifications over WebSocket, pulls the full
//! transaction, and classifies instructions by 8-byte discriminator.
//!
//! Third-party launchers invoke the launchpad via CPI, so the decoder walks
//! inner instructions as well as top-level ones. Log-pattern matching is
//! deliberately not used; discriminators don't lie.

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tokio::time::{interval, sleep, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::db::Database;
use crate::models::{CandidateStatus, Chain, DiscoveryMethod, LaunchCandidate};
use crate::providers::rpc::RpcClient;

use super::is_known_program_address;

/// Instruction discriminators from the launchpad interface definition:
/// first 8 bytes of the instruction data.
pub const DISC_CREATE: [u8; 8] = [24, 30, 200, 40, 5, 28, 7, 119];
pub const DISC_BUY: [u8; 8] = [102, 6, 61, 18, 1, 218, 235, 234];
pub const DISC_SELL: [u8; 8] = [51, 230, 133, 164, 1, 127, 131, 173];
pub const DISC_MIGRATE: [u8; 8] = [155, 234, 231, 146, 236, 158, 162, 30];

/// Fixed account positions in the pool-initialize instruction.
const CREATE_IDX_MINT: usize = 0;
const CREATE_IDX_CURVE: usize = 2;
const CREATE_IDX_CREATOR: usize = 7;

/// Send a ping every 30s: some RPC providers drop log subscriptions after
/// 10 minutes of write-side silence.
const WS_HEARTBEAT_SECS: u64 = 30;
/// Reconnect ladder, then a long cooldown before starting over.
const RECONNECT_LADDER_SECS: [u64; 5] = [3, 6, 9, 12, 15];
const RECONNECT_COOLDOWN_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchpadInstruction {
    PoolInitialize,
    Swap,
    Migrate,
}

pub fn classify_discriminator(data: &[u8]) -> Option<LaunchpadInstruction> {
    if data.len() < 8 {
        return None;
    }
    let disc: [u8; 8] = data[..8].try_into().ok()?;
    match disc {
        DISC_CREATE => Some(LaunchpadInstruction::PoolInitialize),
        DISC_BUY | DISC_SELL => Some(LaunchpadInstruction::Swap),
        DISC_MIGRATE => Some(LaunchpadInstruction::Migrate),
        _ => None,
    }
}

/// A decoded pool-initialize event.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolInit {
    pub mint: String,
    pub bonding_curve: String,
    pub creator: String,
}

// --- transaction wire shapes (json encoding) ---

#[derive(Debug, Deserialize)]
pub struct TxEnvelope {
    pub slot: u64,
    pub transaction: TxBody,
    pub meta: Option<TxMeta>,
}

#[derive(Debug, Deserialize)]
pub struct TxBody {
    pub message: TxMessage,
}

#[derive(Debug, Deserialize)]
pub struct TxMessage {
    #[serde(rename = "accountKeys")]
    pub account_keys: Vec<String>,
    pub instructions: Vec<RawInstruction>,
}

#[derive(Debug, Deserialize)]
pub struct RawInstruction {
    #[serde(rename = "programIdIndex")]
    pub program_id_index: usize,
    pub accounts: Vec<usize>,
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct TxMeta {
    pub err: Option<serde_json::Value>,
    #[serde(rename = "innerInstructions", default)]
    pub inner_instructions: Vec<InnerInstructionSet>,
}

#[derive(Debug, Deserialize)]
pub struct InnerInstructionSet {
    pub index: usize,
    pub instructions: Vec<RawInstruction>,
}

/// Walk top-level and inner (CPI) instructions and decode every
/// pool-initialize targeting the launchpad program. Failed transactions
/// yield nothing.
pub fn decode_pool_initializes(tx: &TxEnvelope, program_id: &str) -> Vec<PoolInit> {
    if tx.meta.as_ref().is_some_and(|m| m.err.is_some()) {
        return Vec::new();
    }
    let keys = &tx.transaction.message.account_keys;

    let mut all: Vec<&RawInstruction> = tx.transaction.message.instructions.iter().collect();
    if let Some(meta) = &tx.meta {
        for set in &meta.inner_instructions {
            all.extend(set.instructions.iter());
        }
    }

    let mut inits = Vec::new();
    for ix in all {
        let Some(program) = keys.get(ix.program_id_index) else {
            continue;
        };
        if program != program_id {
            continue;
        }
        let Ok(data) = bs58::decode(&ix.data).into_vec() else {
            continue;
        };
        if classify_discriminator(&data) != Some(LaunchpadInstruction::PoolInitialize) {
            continue;
        }
        let Some(init) = extract_pool_init(keys, ix) else {
            continue;
        };
        if validate_pool_init(&init) {
            inits.push(init);
        }
    }
    inits
}

fn extract_pool_init(keys: &[String], ix: &RawInstruction) -> Option<PoolInit> {
    let key_at = |pos: usize| -> Option<String> {
        ix.accounts.get(pos).and_then(|&i| keys.get(i)).cloned()
    };
    Some(PoolInit {
        mint: key_at(CREATE_IDX_MINT)?,
        bonding_curve: key_at(CREATE_IDX_CURVE)?,
        creator: key_at(CREATE_IDX_CREATOR)?,
    })
}

fn validate_pool_init(init: &PoolInit) -> bool {
    let valid_b58 = |s: &str| {
        bs58::decode(s)
            .into_vec()
            .map(|b| b.len() == 32)
            .unwrap_or(false)
    };
    valid_b58(&init.mint)
        && valid_b58(&init.bonding_curve)
        && init.mint != init.bonding_curve
        && !is_known_program_address(&init.mint)
        && !is_known_program_address(&init.creator)
}

// --- log subscription wire shapes ---

#[derive(Debug, Deserialize)]
struct WsLogNotification {
    method: Option<String>,
    params: Option<WsLogParams>,
    result: Option<serde_json::Value>,
    id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WsLogParams {
    result: WsLogResult,
}

#[derive(Debug, Deserialize)]
struct WsLogResult {
    value: WsLogValue,
}

#[derive(Debug, Deserialize)]
struct WsLogValue {
    signature: String,
    err: Option<serde_json::Value>,
}

/// Long-lived WebSocket listener with heartbeat and laddered reconnect.
pub struct OnchainSource {
    db: Database,
    rpc: Arc<RpcClient>,
    ws_url: String,
    program_id: String,
}

impl OnchainSource {
    pub fn new(db: Database, rpc: Arc<RpcClient>, ws_url: String, program_id: String) -> Self {
        Self {
            db,
            rpc,
            ws_url,
            program_id,
        }
    }

    /// Runs forever. Each (re)connect re-issues the log subscription, so a
    /// provider-side drop never leaves us silently unsubscribed.
    pub async fn run(self) {
        let mut ladder_step = 0usize;
        loop {
            match self.connect_and_stream().await {
                Ok(()) => {
                    info!("On-chain subscription closed cleanly, reconnecting");
                    ladder_step = 0;
                }
                Err(e) => {
                    error!("On-chain subscription error: {}", e);
                    if ladder_step >= RECONNECT_LADDER_SECS.len() {
                        warn!(
                            "Reconnect ladder exhausted, cooling down {}s",
                            RECONNECT_COOLDOWN_SECS
                        );
                        sleep(Duration::from_secs(RECONNECT_COOLDOWN_SECS)).await;
                        ladder_step = 0;
                    } else {
                        let delay = RECONNECT_LADDER_SECS[ladder_step];
                        warn!("Reconnecting in {}s", delay);
                        sleep(Duration::from_secs(delay)).await;
                        ladder_step += 1;
                    }
                }
            }
        }
    }

    async fn connect_and_stream(&self) -> Result<()> {
        info!("Connecting log subscription to {}", self.ws_url);
        let (ws, _) = connect_async(self.ws_url.as_str())
            .await
            .context("WebSocket connect failed")?;
        let (mut write, mut read) = ws.split();

        let subscribe = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "logsSubscribe",
            "params": [
                {"mentions": [self.program_id]},
                {"commitment": "confirmed"}
            ]
        });
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .context("logsSubscribe send failed")?;
        info!("Subscribed to logs for program {}", self.program_id);

        let mut heartbeat = interval(Duration::from_secs(WS_HEARTBEAT_SECS));
        heartbeat.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    write
                        .send(Message::Ping(Vec::new()))
                        .await
                        .context("Heartbeat ping failed")?;
                }
                msg = read.next() => {
                    let msg = msg.ok_or_else(|| anyhow!("WebSocket stream ended"))??;
                    match msg {
                        Message::Text(text) => self.handle_ws_text(&text).await,
                        Message::Ping(data) => {
                            write.send(Message::Pong(data)).await.ok();
                        }
                        Message::Close(frame) => {
                            info!("WebSocket closed by peer: {:?}", frame);
                            return Ok(());
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    async fn handle_ws_text(&self, text: &str) {
        let parsed: WsLogNotification = match serde_json::from_str(text) {
            Ok(p) => p,
            Err(e) => {
                debug!("Unparseable WS frame ({}): {}", e, text);
                return;
            }
        };
        if parsed.method.as_deref() != Some("logsNotification") {
            if let (Some(id), Some(result)) = (parsed.id, parsed.result) {
                debug!("Subscription ack id={} result={}", id, result);
            }
            return;
        }
        let Some(value) = parsed.params.map(|p| p.result.value) else {
            return;
        };
        if value.err.is_some() {
            return;
        }
        if let Err(e) = self.process_signature(&value.signature).await {
            warn!("Failed to process tx {}: {}", value.signature, e);
        }
    }

    async fn process_signature(&self, signature: &str) -> Result<()> {
        let Some(tx) = self.rpc.get_transaction(signature).await? else {
            debug!("Transaction {} not yet available", signature);
            return Ok(());
        };

        for init in decode_pool_initializes(&tx, &self.program_id) {
            info!(
                "Pool initialize: mint {} curve {} creator {}",
                init.mint, init.bonding_curve, init.creator
            );
            let candidate = LaunchCandidate {
                mint: init.mint.clone(),
                chain: Chain::Solana,
                discovery_method: DiscoveryMethod::Onchain,
                status: CandidateStatus::New,
                symbol: None,
                name: None,
                creator: Some(init.creator.clone()),
                bonding_curve: Some(init.bonding_curve.clone()),
                raw_payload: json!({
                    "onchain": {
                        "signature": signature,
                        "slot": tx.slot,
                        "seen_at": Utc::now().to_rfc3339(),
                    }
                }),
                first_seen_at: Utc::now(),
            };
            self.db.upsert_launch_candidate(&candidate)?;
        }
        Ok(())
    }
}
