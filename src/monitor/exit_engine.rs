//! Exit engine
//! Mission: watch open positions and fire at most one exit per trigger. The
//! poller and the optional account-event listener both funnel through the
//! same evaluation, and the `trigger_state` gate in the database decides the
//! single winner before any job is enqueued.

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{interval, sleep, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::db::{Database, EnqueueJob, PRIORITY_EXIT};
use crate::idempotency;
use crate::models::{
    ExitTrigger, JobPayload, Position, Strategy, TradeAction, TradeMode, TriggerState,
};
use crate::monitor::pricing::PriceService;

/// A stop-loss this far under water skips pre-execution simulation: getting
/// out matters more than a clean probe.
const EMERGENCY_DRAWDOWN_PCT: f64 = 50.0;

#[derive(Debug, Clone)]
pub struct ExitEngineConfig {
    pub poll_interval_secs: u64,
    pub max_job_attempts: i64,
}

/// Pure trigger evaluation, ordered TP -> SL -> trailing -> max-hold. The
/// first rule that fires wins.
pub fn evaluate_triggers(
    position: &Position,
    strategy: &Strategy,
    now: DateTime<Utc>,
) -> Option<ExitTrigger> {
    let gain = position.gain_pct();

    if strategy.take_profit_pct > 0.0 && gain >= strategy.take_profit_pct {
        return Some(ExitTrigger::TakeProfit);
    }
    if strategy.stop_loss_pct > 0.0 && gain <= -strategy.stop_loss_pct {
        return Some(ExitTrigger::StopLoss);
    }
    if strategy.trailing_distance_pct > 0.0 && position.entry_price > 0.0 {
        let peak_gain = (position.peak_price - position.entry_price) / position.entry_price * 100.0;
        if peak_gain >= strategy.trailing_activation_pct && position.peak_price > 0.0 {
            let drawdown =
                (position.peak_price - position.current_price) / position.peak_price * 100.0;
            if drawdown >= strategy.trailing_distance_pct {
                return Some(ExitTrigger::Trailing);
            }
        }
    }
    if strategy.max_hold_minutes > 0 && position.age_minutes(now) >= strategy.max_hold_minutes {
        return Some(ExitTrigger::MaxHold);
    }
    None
}

/// Moon bag: a winning take-profit keeps a slice running; every other
/// trigger exits in full.
pub fn sell_percent_for(strategy: &Strategy, trigger: ExitTrigger) -> f64 {
    if trigger == ExitTrigger::TakeProfit && strategy.moon_bag_pct > 0.0 {
        (100.0 - strategy.moon_bag_pct).clamp(0.0, 100.0)
    } else {
        100.0
    }
}

pub struct ExitEngine {
    db: Database,
    prices: Arc<PriceService>,
    cfg: ExitEngineConfig,
}

impl ExitEngine {
    pub fn new(db: Database, prices: Arc<PriceService>, cfg: ExitEngineConfig) -> Self {
        Self { db, prices, cfg }
    }

    /// Poller: every few seconds, refresh prices and evaluate every
    /// unarmed active position.
    pub async fn run(self: Arc<Self>) {
        info!(
            "Exit engine polling every {}s",
            self.cfg.poll_interval_secs
        );
        let mut tick = interval(Duration::from_secs(self.cfg.poll_interval_secs.max(1)));
        loop {
            tick.tick().await;
            let positions = match self.db.list_exit_candidates() {
                Ok(p) => p,
                Err(e) => {
                    warn!("Exit scan failed: {}", e);
                    continue;
                }
            };
            for position in positions {
                if let Err(e) = self.evaluate_position(&position.id).await {
                    debug!("Exit evaluation failed for {}: {}", position.id, e);
                }
            }
        }
    }

    /// Shared evaluation path for the poller and the event listener.
    /// Re-reads the position, refreshes its price, and fires at most once.
    pub async fn evaluate_position(&self, position_id: &str) -> Result<()> {
        let position = self.db.get_position(position_id)?;
        if position.trigger_state != TriggerState::Monitoring {
            return Ok(());
        }
        let Some(strategy_id) = position.strategy_id else {
            // Manual positions have no auto-exit parameters.
            return Ok(());
        };
        let Some(strategy) = self.db.get_strategy_opt(strategy_id)? else {
            return Ok(());
        };

        match self.prices.get_position_price(&position).await {
            Ok(price) => {
                self.db.update_market_price(&position.id, price)?;
            }
            Err(e) => {
                // Price outages must not fire or block anything; max-hold
                // still works off the stale price below.
                debug!("Price refresh failed for {}: {}", position.id, e);
            }
        }
        let position = self.db.get_position(position_id)?;

        let Some(trigger) = evaluate_triggers(&position, &strategy, Utc::now()) else {
            return Ok(());
        };

        // Gate before enqueue: exactly one evaluator wins this update, so
        // the poller and the event listener can race freely.
        if !self.db.arm_trigger(&position.id, TriggerState::Triggered)? {
            return Ok(());
        }

        let sell_percent = sell_percent_for(&strategy, trigger);
        let emergency =
            trigger == ExitTrigger::StopLoss && position.gain_pct() <= -EMERGENCY_DRAWDOWN_PCT;
        let key =
            idempotency::exit_sell_key(position.chain, &position.id, trigger, sell_percent);
        let priority_fee = self
            .db
            .get_user(position.user_id)
            .map(|u| u.priority_fee_lamports)
            .unwrap_or(0);

        let enqueued = self.db.enqueue_job(&EnqueueJob {
            chain: position.chain,
            action: TradeAction::Sell,
            mode: TradeMode::Auto,
            user_id: position.user_id,
            strategy_id: position.strategy_id,
            opportunity_id: None,
            idempotency_key: key,
            payload: JobPayload {
                mint: position.token_mint.clone(),
                amount_sol: 0.0,
                slippage_bps: strategy.slippage_bps,
                priority_fee_lamports: priority_fee,
                position_id: Some(position.id.clone()),
                trigger: Some(trigger),
                sell_percent,
                emergency,
            },
            priority: PRIORITY_EXIT,
            max_attempts: self.cfg.max_job_attempts,
            run_after: None,
        })?;

        info!(
            "Exit fired on {}: {} at {:+.1}% (sell {}%, job {:?})",
            position.id,
            trigger.as_str(),
            position.gain_pct(),
            sell_percent,
            enqueued
        );
        Ok(())
    }
}

/// Optional event listener: account subscriptions on each position's curve
/// or pool, so a violent move fires before the next poll tick.
pub struct AccountEventListener {
    db: Database,
    engine: Arc<ExitEngine>,
    ws_url: String,
}

impl AccountEventListener {
    pub fn new(db: Database, engine: Arc<ExitEngine>, ws_url: String) -> Self {
        Self { db, engine, ws_url }
    }

    pub async fn run(self) {
        loop {
            if let Err(e) = self.connect_and_stream().await {
                warn!("Account listener error: {}, reconnecting in 5s", e);
                sleep(Duration::from_secs(5)).await;
            }
        }
    }

    async fn connect_and_stream(&self) -> Result<()> {
        let (ws, _) = connect_async(self.ws_url.as_str()).await?;
        let (mut write, mut read) = ws.split();

        // request id -> position id while awaiting acks,
        // subscription id -> position id once acked
        let mut pending: HashMap<u64, String> = HashMap::new();
        let mut subscribed: HashMap<u64, String> = HashMap::new();
        let mut watched: HashMap<String, String> = HashMap::new(); // account -> position
        let mut next_request_id: u64 = 1;

        let mut refresh = interval(Duration::from_secs(30));
        loop {
            tokio::select! {
                _ = refresh.tick() => {
                    // Subscribe to accounts of positions that appeared since
                    // the last sweep. Closed positions just go quiet.
                    let positions = self.db.list_exit_candidates().unwrap_or_default();
                    for p in positions {
                        let Some(account) = p.pool_address.clone().or_else(|| p.bonding_curve.clone()) else {
                            continue;
                        };
                        if watched.contains_key(&account) {
                            continue;
                        }
                        let request = json!({
                            "jsonrpc": "2.0",
                            "id": next_request_id,
                            "method": "accountSubscribe",
                            "params": [account, {"commitment": "confirmed", "encoding": "base64"}]
                        });
                        write.send(Message::Text(request.to_string())).await?;
                        pending.insert(next_request_id, p.id.clone());
                        watched.insert(account, p.id.clone());
                        next_request_id += 1;
                    }
                    write.send(Message::Ping(Vec::new())).await?;
                }
                msg = read.next() => {
                    let Some(msg) = msg else { anyhow::bail!("account stream ended") };
                    if let Message::Text(text) = msg? {
                        let value: serde_json::Value = match serde_json::from_str(&text) {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        // Subscription ack: {"id": N, "result": <sub id>}
                        if let (Some(id), Some(sub)) =
                            (value.get("id").and_then(|v| v.as_u64()),
                             value.get("result").and_then(|v| v.as_u64()))
                        {
                            if let Some(position_id) = pending.remove(&id) {
                                subscribed.insert(sub, position_id);
                            }
                            continue;
                        }
                        // Notification: look up the position and evaluate.
                        if value.get("method").and_then(|m| m.as_str())
                            == Some("accountNotification")
                        {
                            let sub = value
                                .pointer("/params/subscription")
                                .and_then(|v| v.as_u64());
                            if let Some(position_id) =
                                sub.and_then(|s| subscribed.get(&s)).cloned()
                            {
                                if let Err(e) =
                                    self.engine.evaluate_position(&position_id).await
                                {
                                    debug!("Event evaluation failed: {}", e);
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}
