//! Manual trade path
//! Mission: direct buys and sells ride the same reservation + outbox rails
//! as auto trades. The callback event id keys the idempotency derivation,
//! so a double-tapped button can only ever produce one trade.

use anyhow::Result;
use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::db::{
    Database, EnqueueJob, COOLDOWN_POST_BUY, COOLDOWN_USER_RATE, PRIORITY_BUY, PRIORITY_EXIT,
};
use crate::idempotency;
use crate::models::{
    Chain, ExitTrigger, JobPayload, PositionStatus, TradeAction, TradeMode, TriggerState,
};

/// Minimum spacing between manual trade submissions per user.
const USER_RATE_COOLDOWN_SECS: i64 = 3;

/// What the chat layer renders back to the user.
#[derive(Debug, Clone, PartialEq)]
pub enum ManualTradeAck {
    Queued { job_id: i64 },
    Duplicate,
    Rejected { reason: String },
}

pub struct ManualTradeService {
    db: Database,
    max_job_attempts: i64,
}

impl ManualTradeService {
    pub fn new(db: Database, max_job_attempts: i64) -> Self {
        Self {
            db,
            max_job_attempts,
        }
    }

    /// Manual buy from a `/snipe` command or a buy callback.
    pub fn handle_buy(
        &self,
        chat_id: &str,
        chain: Chain,
        mint: &str,
        amount_sol: f64,
        slippage_bps: Option<u32>,
        external_event_id: &str,
    ) -> Result<ManualTradeAck> {
        let user = self.db.get_or_create_user(chat_id)?;

        if let Some(reason) = self.pre_trade_denial(user.id, chain) {
            return Ok(ManualTradeAck::Rejected { reason });
        }

        // Post-buy silence on this (user, mint): a recent buy means no
        // repeat until the window passes. Read errors deny.
        let cooldown_target = format!("{}:{}", user.id, mint);
        match self
            .db
            .cooldown_active(chain, COOLDOWN_POST_BUY, &cooldown_target)
        {
            Ok(false) => {}
            Ok(true) => {
                return Ok(ManualTradeAck::Rejected {
                    reason: "You recently bought this token, cooldown active".to_string(),
                })
            }
            Err(e) => {
                warn!("Cooldown read failed, denying manual buy: {}", e);
                return Ok(ManualTradeAck::Rejected {
                    reason: "Temporarily unavailable".to_string(),
                });
            }
        }

        let slippage_bps = slippage_bps.unwrap_or(user.default_slippage_bps);
        let key = idempotency::manual_buy_key(
            chain,
            user.id,
            mint,
            slippage_bps,
            amount_sol,
            external_event_id,
        );

        let enqueued = self.db.enqueue_job(&EnqueueJob {
            chain,
            action: TradeAction::Buy,
            mode: TradeMode::Manual,
            user_id: user.id,
            strategy_id: None,
            opportunity_id: None,
            idempotency_key: key,
            payload: JobPayload {
                mint: mint.to_string(),
                amount_sol,
                slippage_bps,
                priority_fee_lamports: user.priority_fee_lamports,
                position_id: None,
                trigger: None,
                sell_percent: 100.0,
                emergency: false,
            },
            priority: PRIORITY_BUY,
            max_attempts: self.max_job_attempts,
            run_after: None,
        })?;

        self.stamp_rate_limit(user.id, chain);
        match enqueued {
            Some(job_id) => {
                info!(
                    "Manual buy queued: user {} {} {} SOL (job {})",
                    user.id, mint, amount_sol, job_id
                );
                Ok(ManualTradeAck::Queued { job_id })
            }
            // Same callback replayed: silently fine.
            None => Ok(ManualTradeAck::Duplicate),
        }
    }

    /// Manual sell of an open position (full or partial).
    pub fn handle_sell(
        &self,
        chat_id: &str,
        position_id: &str,
        percent: f64,
        external_event_id: &str,
    ) -> Result<ManualTradeAck> {
        let user = self.db.get_or_create_user(chat_id)?;

        if let Some(reason) = self.pre_trade_denial(user.id, Chain::Solana) {
            return Ok(ManualTradeAck::Rejected { reason });
        }

        let position = match self.db.get_position(position_id) {
            Ok(p) => p,
            Err(_) => {
                return Ok(ManualTradeAck::Rejected {
                    reason: "Position not found".to_string(),
                })
            }
        };
        if position.user_id != user.id {
            return Ok(ManualTradeAck::Rejected {
                reason: "Position not found".to_string(),
            });
        }
        if position.status != PositionStatus::Active || position.size_tokens <= 0.0 {
            return Ok(ManualTradeAck::Rejected {
                reason: "Position is not open".to_string(),
            });
        }

        // Take the trigger gate so the exit engine cannot double-fire on
        // the same position while this sell is in flight.
        if !self.db.arm_trigger(position_id, TriggerState::Triggered)? {
            return Ok(ManualTradeAck::Rejected {
                reason: "An exit is already in progress".to_string(),
            });
        }

        let key = idempotency::manual_sell_key(
            position.chain,
            user.id,
            position_id,
            external_event_id,
        );
        let enqueued = self.db.enqueue_job(&EnqueueJob {
            chain: position.chain,
            action: TradeAction::Sell,
            mode: TradeMode::Manual,
            user_id: user.id,
            strategy_id: position.strategy_id,
            opportunity_id: None,
            idempotency_key: key,
            payload: JobPayload {
                mint: position.token_mint.clone(),
                amount_sol: 0.0,
                slippage_bps: user.default_slippage_bps,
                priority_fee_lamports: user.priority_fee_lamports,
                position_id: Some(position_id.to_string()),
                trigger: Some(ExitTrigger::Manual),
                sell_percent: percent.clamp(1.0, 100.0),
                emergency: false,
            },
            priority: PRIORITY_EXIT,
            max_attempts: self.max_job_attempts,
            run_after: None,
        })?;

        self.stamp_rate_limit(user.id, position.chain);
        match enqueued {
            Some(job_id) => {
                info!(
                    "Manual sell queued: user {} position {} {}% (job {})",
                    user.id, position_id, percent, job_id
                );
                Ok(ManualTradeAck::Queued { job_id })
            }
            None => {
                // Duplicate tap: leave the original exit armed and running.
                Ok(ManualTradeAck::Duplicate)
            }
        }
    }

    /// Safety + rate-limit pre-checks shared by both directions. The
    /// safety read is fail-closed, so an unreadable store denies.
    fn pre_trade_denial(&self, user_id: i64, chain: Chain) -> Option<String> {
        let now = Utc::now();
        for scope in ["GLOBAL".to_string(), user_id.to_string()] {
            let controls = self.db.get_safety_controls(&scope);
            if controls.trading_paused {
                return Some("Trading is currently paused".to_string());
            }
            if !controls.manual_trading_enabled {
                return Some("Manual trading is disabled".to_string());
            }
            if controls.circuit_open(now) {
                return Some("Trading temporarily halted after repeated failures".to_string());
            }
        }
        match self
            .db
            .cooldown_active(chain, COOLDOWN_USER_RATE, &user_id.to_string())
        {
            Ok(false) => None,
            Ok(true) => Some("Too many requests, slow down".to_string()),
            Err(e) => {
                warn!("Rate-limit read failed, denying: {}", e);
                Some("Temporarily unavailable".to_string())
            }
        }
    }

    fn stamp_rate_limit(&self, user_id: i64, chain: Chain) {
        let until = Utc::now() + Duration::seconds(USER_RATE_COOLDOWN_SECS);
        if let Err(e) =
            self.db
                .set_cooldown(chain, COOLDOWN_USER_RATE, &user_id.to_string(), until)
        {
            warn!("Rate-limit stamp failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::temp_db;
    use crate::models::JobStatus;

    const MINT: &str = "4k3Dyjzvzp8eMZWUXbBCjEvwSkkk59S5iCNLY3QrkX6R";

    fn service(db: &Database) -> ManualTradeService {
        ManualTradeService::new(db.clone(), 5)
    }

    #[test]
    fn test_buy_enqueues_manual_job() {
        let (db, _dir, _) = temp_db();
        let svc = service(&db);
        let ack = svc
            .handle_buy("chat-m", Chain::Solana, MINT, 0.5, None, "cb-1")
            .unwrap();
        assert!(matches!(ack, ManualTradeAck::Queued { .. }));
        assert_eq!(db.count_jobs_with_status(JobStatus::Queued).unwrap(), 1);
    }

    #[test]
    fn test_double_tap_is_one_job() {
        let (db, _dir, _) = temp_db();
        let svc = service(&db);
        let first = svc
            .handle_buy("chat-m", Chain::Solana, MINT, 0.5, None, "cb-dup")
            .unwrap();
        assert!(matches!(first, ManualTradeAck::Queued { .. }));

        // Rate-limit cooldown from the first tap would deny; clear it to
        // isolate the idempotency path (the real double-tap arrives within
        // milliseconds, before the chat layer re-enables the button).
        db.purge_expired_cooldowns().unwrap();
        db.lock().execute("DELETE FROM cooldowns", []).unwrap();

        let second = svc
            .handle_buy("chat-m", Chain::Solana, MINT, 0.5, None, "cb-dup")
            .unwrap();
        assert_eq!(second, ManualTradeAck::Duplicate);
        assert_eq!(db.count_jobs_with_status(JobStatus::Queued).unwrap(), 1);
    }

    #[test]
    fn test_distinct_taps_make_distinct_jobs() {
        let (db, _dir, _) = temp_db();
        let svc = service(&db);
        svc.handle_buy("chat-m", Chain::Solana, MINT, 0.5, None, "cb-a")
            .unwrap();
        db.lock().execute("DELETE FROM cooldowns", []).unwrap();
        svc.handle_buy("chat-m", Chain::Solana, MINT, 0.5, None, "cb-b")
            .unwrap();
        assert_eq!(db.count_jobs_with_status(JobStatus::Queued).unwrap(), 2);
    }

    #[test]
    fn test_paused_store_rejects_manual_buy() {
        let (db, _dir, _) = temp_db();
        db.set_global_pause(true).unwrap();
        let ack = service(&db)
            .handle_buy("chat-m", Chain::Solana, MINT, 0.5, None, "cb-p")
            .unwrap();
        assert!(matches!(ack, ManualTradeAck::Rejected { .. }));
        assert_eq!(db.count_jobs_with_status(JobStatus::Queued).unwrap(), 0);
    }

    #[test]
    fn test_rate_limit_spaces_submissions() {
        let (db, _dir, _) = temp_db();
        let svc = service(&db);
        svc.handle_buy("chat-m", Chain::Solana, MINT, 0.5, None, "cb-r1")
            .unwrap();
        let second = svc
            .handle_buy("chat-m", Chain::Solana, MINT, 0.5, None, "cb-r2")
            .unwrap();
        assert!(matches!(second, ManualTradeAck::Rejected { .. }));
    }

    #[test]
    fn test_post_buy_cooldown_blocks_repeat_buy() {
        let (db, _dir, _) = temp_db();
        let svc = service(&db);
        let user = db.get_or_create_user("chat-m").unwrap();
        db.set_cooldown(
            Chain::Solana,
            COOLDOWN_POST_BUY,
            &format!("{}:{}", user.id, MINT),
            Utc::now() + Duration::seconds(300),
        )
        .unwrap();

        let ack = svc
            .handle_buy("chat-m", Chain::Solana, MINT, 0.5, None, "cb-c")
            .unwrap();
        assert!(matches!(ack, ManualTradeAck::Rejected { .. }));
    }

    #[test]
    fn test_sell_requires_owned_open_position() {
        let (db, _dir, _) = temp_db();
        let svc = service(&db);
        let ack = svc
            .handle_sell("chat-m", "no-such-position", 100.0, "cb-s")
            .unwrap();
        assert!(matches!(ack, ManualTradeAck::Rejected { .. }));
    }

    #[test]
    fn test_sell_arms_gate_and_rejects_second_exit() {
        let (db, _dir, _) = temp_db();
        let svc = service(&db);
        let user = db.get_or_create_user("chat-m").unwrap();
        let reserve = db
            .reserve_trade_budget(
                TradeMode::Manual,
                user.id,
                None,
                Chain::Solana,
                TradeAction::Buy,
                MINT,
                0.5,
                100,
                "manual-sell-setup",
            )
            .unwrap();
        let position = db
            .open_position(&crate::db::OpenPosition {
                user_id: user.id,
                strategy_id: None,
                chain: Chain::Solana,
                token_mint: MINT.to_string(),
                token_symbol: None,
                entry_execution_id: reserve.execution_id.unwrap(),
                entry_tx_sig: None,
                entry_cost_sol: 0.5,
                entry_price: 1e-6,
                size_tokens: 500_000.0,
                bonding_curve: None,
            })
            .unwrap();

        let first = svc
            .handle_sell("chat-m", &position.id, 100.0, "cb-s1")
            .unwrap();
        assert!(matches!(first, ManualTradeAck::Queued { .. }));

        db.lock().execute("DELETE FROM cooldowns", []).unwrap();
        let second = svc
            .handle_sell("chat-m", &position.id, 100.0, "cb-s2")
            .unwrap();
        assert_eq!(
            second,
            ManualTradeAck::Rejected {
                reason: "An exit is already in progress".to_string()
            }
        );
    }
}
