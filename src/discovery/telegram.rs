//! Telegram discovery source
//! Mission: turn noisy channel chatter into launch candidates without ever
//! guessing. The parser is deterministic and fails closed: no partial
//! candidates, and two plausible mints mean no candidate at all.
//!
//! Precedence:
//! 1. an explicit label (`Mint:`, `CA:`, `Contract:`, `Address:`)
//! 2. a known token-explorer URL
//! 3. a bare base58 run, only if exactly one valid mint-shaped address
//!    survives filtering

use anyhow::Result;
use chrono::Utc;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use regex::Regex;
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::models::{CandidateStatus, Chain, DiscoveryMethod, LaunchCandidate};

use super::is_known_program_address;

lazy_static! {
    // Exact labels only: a lowercase "ca:" is chat noise, not a label.
    static ref LABEL_RE: Regex = Regex::new(
        r"\b(?:Mint|CA|Contract|Address)\s*[:=]\s*([1-9A-HJ-NP-Za-km-z]{32,44})"
    )
    .unwrap();
    static ref EXPLORER_URL_RE: Regex = Regex::new(
        r"(?:pump\.fun|dexscreener\.com/solana|birdeye\.so/token|solscan\.io/token|geckoterminal\.com/solana/pools)/([1-9A-HJ-NP-Za-km-z]{32,44})"
    )
    .unwrap();
    static ref BASE58_RUN_RE: Regex = Regex::new(r"[1-9A-HJ-NP-Za-km-z]+").unwrap();
    static ref TICKER_RE: Regex = Regex::new(r"\$([A-Za-z][A-Za-z0-9]{1,9})\b").unwrap();
}

/// A raw message handed in by the chat transport.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    pub channel_id: String,
    pub message_id: i64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseResult {
    Candidate { mint: String, symbol: Option<String> },
    Rejected { reason: &'static str },
}

impl ParseResult {
    pub fn is_candidate(&self) -> bool {
        matches!(self, ParseResult::Candidate { .. })
    }
}

/// Mint-shaped: decodes from base58 to exactly 32 bytes and is not a
/// well-known program or native-mint address.
fn is_mint_shaped(s: &str) -> bool {
    if !(32..=44).contains(&s.len()) {
        return false;
    }
    match bs58::decode(s).into_vec() {
        Ok(bytes) if bytes.len() == 32 => !is_known_program_address(s),
        _ => false,
    }
}

/// Deterministic parse of a channel message. Same input, same output.
pub fn parse_launch_message(text: &str) -> ParseResult {
    let symbol = TICKER_RE
        .captures(text)
        .map(|c| c[1].to_uppercase());

    // Rule 1: explicit label wins outright.
    if let Some(cap) = LABEL_RE.captures(text) {
        let mint = cap[1].to_string();
        if is_mint_shaped(&mint) {
            return ParseResult::Candidate { mint, symbol };
        }
        // A label pointing at a non-mint is a malformed signal, not a
        // license to scan the rest of the message.
        return ParseResult::Rejected {
            reason: "labeled_address_invalid",
        };
    }

    // Rule 2: first explorer URL.
    for cap in EXPLORER_URL_RE.captures_iter(text) {
        let mint = cap[1].to_string();
        if is_mint_shaped(&mint) {
            return ParseResult::Candidate { mint, symbol };
        }
    }

    // Rule 3: a bare run, only when unambiguous.
    let mut found: Vec<String> = Vec::new();
    for m in BASE58_RUN_RE.find_iter(text) {
        let run = m.as_str();
        if is_mint_shaped(run) && !found.iter().any(|f| f == run) {
            found.push(run.to_string());
        }
    }
    match found.len() {
        0 => ParseResult::Rejected {
            reason: "no_mint_found",
        },
        1 => ParseResult::Candidate {
            mint: found.remove(0),
            symbol,
        },
        _ => ParseResult::Rejected {
            reason: "ambiguous_mint_candidates",
        },
    }
}

/// In-memory TTL suppressor for repeated signals. A hint only: the
/// database merge-upsert is the authoritative dedup.
pub struct TtlDeduper {
    window: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl TtlDeduper {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// True when the mint has not been seen within the window; records it.
    pub fn first_sighting(&self, mint: &str) -> bool {
        let now = Instant::now();
        let mut seen = self.seen.lock();
        seen.retain(|_, t| now.duration_since(*t) < self.window);
        match seen.get(mint) {
            Some(_) => false,
            None => {
                seen.insert(mint.to_string(), now);
                true
            }
        }
    }
}

/// Long-lived consumer of channel messages. The transport (bot API polling,
/// MTProto, a test harness) only has to push `ChannelMessage`s into the
/// channel.
pub struct TelegramSource {
    db: Database,
    deduper: TtlDeduper,
    monitored_channel_id: Option<String>,
}

impl TelegramSource {
    pub fn new(db: Database, dedup_ttl: Duration, monitored_channel_id: Option<String>) -> Self {
        Self {
            db,
            deduper: TtlDeduper::new(dedup_ttl),
            monitored_channel_id,
        }
    }

    pub async fn run(self, mut rx: mpsc::Receiver<ChannelMessage>) {
        info!(
            "Telegram source running (channel filter: {:?})",
            self.monitored_channel_id
        );
        while let Some(msg) = rx.recv().await {
            if let Err(e) = self.handle_message(&msg) {
                warn!("Telegram signal handling failed: {}", e);
            }
        }
        info!("Telegram source channel closed, stopping");
    }

    pub fn handle_message(&self, msg: &ChannelMessage) -> Result<()> {
        if let Some(expected) = &self.monitored_channel_id {
            if &msg.channel_id != expected {
                return Ok(());
            }
        }

        match parse_launch_message(&msg.text) {
            ParseResult::Rejected { reason } => {
                debug!("Telegram message {} rejected: {}", msg.message_id, reason);
                Ok(())
            }
            ParseResult::Candidate { mint, symbol } => {
                if !self.deduper.first_sighting(&mint) {
                    debug!("Suppressed repeated telegram signal for {}", mint);
                    return Ok(());
                }
                let candidate = LaunchCandidate {
                    mint: mint.clone(),
                    chain: Chain::Solana,
                    discovery_method: DiscoveryMethod::Telegram,
                    status: CandidateStatus::New,
                    symbol,
                    name: None,
                    creator: None,
                    bonding_curve: None,
                    raw_payload: json!({
                        "telegram": {
                            "channel_id": msg.channel_id,
                            "message_id": msg.message_id,
                            "text": msg.text,
                            "seen_at": Utc::now().to_rfc3339(),
                        }
                    }),
                    first_seen_at: Utc::now(),
                };
                self.db.upsert_launch_candidate(&candidate)?;
                Ok(())
            }
        }
    }
}
