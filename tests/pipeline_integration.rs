//! End-to-end pipeline scenarios over a real on-disk store
//!
//! Wires the manual trade path, the outbox, the executor (dry-run, stubbed
//! venue) and the exit engine together the way the binary does, and checks
//! the at-most-once and exit-trigger stories across the whole flow.

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use std::sync::Arc;
use tempfile::TempDir;

use curvebot_backend::chat::{ManualTradeAck, ManualTradeService};
use curvebot_backend::db::Database;
use curvebot_backend::errors::TradeError;
use curvebot_backend::executor::fees::FeeSchedule;
use curvebot_backend::executor::{ExecutorConfig, ExecutorWorker};
use curvebot_backend::models::{
    BudgetWindow, Chain, ExecutionStatus, JobStatus, LifecycleState, PositionStatus, TradeAction,
    TriggerState,
};
use curvebot_backend::monitor::exit_engine::{ExitEngine, ExitEngineConfig};
use curvebot_backend::monitor::pricing::PriceService;
use curvebot_backend::providers::aggregator::AggregatorClient;
use curvebot_backend::providers::dexscreener::DexScreenerClient;
use curvebot_backend::providers::launchpad::LaunchpadApiClient;
use curvebot_backend::providers::rpc::RpcClient;
use curvebot_backend::router::{
    ExecuteOptions, SwapIntent, SwapQuote, SwapReceipt, SwapRouter, UnsignedSwap, VenueAdapter,
    VENUE_BONDING_CURVE,
};

const MINT: &str = "4k3Dyjzvzp8eMZWUXbBCjEvwSkkk59S5iCNLY3QrkX6R";

/// Stub venue: buys fill at 1e-6 SOL/token on the net amount, sells fill at
/// 1.5e-6 (a +50% move), both deterministically.
struct FixedPriceVenue;

#[async_trait]
impl VenueAdapter for FixedPriceVenue {
    fn name(&self) -> &'static str {
        VENUE_BONDING_CURVE
    }
    fn can_handle(&self, _intent: &SwapIntent) -> bool {
        true
    }
    async fn quote(&self, intent: &SwapIntent) -> Result<SwapQuote, TradeError> {
        let (expected_out, price) = match intent.action {
            // lamports in -> token base units out at 1e-6 SOL/token
            TradeAction::Buy => (intent.amount * 1_000, 1.0e-6),
            // token base units in -> lamports out at 1.5e-6 SOL/token
            TradeAction::Sell => (intent.amount * 15 / 10_000, 1.5e-6),
        };
        Ok(SwapQuote {
            venue: VENUE_BONDING_CURVE,
            in_amount: intent.amount,
            expected_out,
            min_out: expected_out * 99 / 100,
            price_sol_per_token: price,
            aggregator: None,
        })
    }
    async fn build_tx(
        &self,
        _quote: &SwapQuote,
        _intent: &SwapIntent,
    ) -> Result<UnsignedSwap, TradeError> {
        let mut bytes = vec![1u8];
        bytes.extend_from_slice(&[0u8; 64]);
        bytes.extend_from_slice(b"integration swap");
        Ok(UnsignedSwap {
            venue: VENUE_BONDING_CURVE,
            tx_b64: base64::engine::general_purpose::STANDARD.encode(bytes),
        })
    }
    async fn execute(
        &self,
        _signed: &str,
        _opts: &ExecuteOptions,
    ) -> Result<SwapReceipt, TradeError> {
        Ok(SwapReceipt {
            venue: VENUE_BONDING_CURVE,
            signature: "integration_sig".to_string(),
        })
    }
}

struct Harness {
    db: Database,
    manual: ManualTradeService,
    worker: ExecutorWorker,
    engine: ExitEngine,
    _dir: TempDir,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pipeline.db").to_str().unwrap().to_string();
    let db = Database::open(&path).unwrap();

    let router = Arc::new(SwapRouter::new(vec![
        Arc::new(FixedPriceVenue) as Arc<dyn VenueAdapter>
    ]));
    let rpc = Arc::new(RpcClient::new("http://127.0.0.1:1".to_string()));
    let worker = ExecutorWorker::new(
        db.clone(),
        router,
        rpc.clone(),
        FeeSchedule::new(100),
        ExecutorConfig {
            worker_id: "pipeline-worker".to_string(),
            batch_size: 8,
            lease_ttl_secs: 60,
            min_position_sol: 0.01,
            max_position_sol: 10.0,
            max_balance_pct: 0.5,
            post_buy_cooldown_secs: 300,
            circuit_cooldown_secs: 60,
            dry_run: true,
        },
    );

    // Price providers all point at a dead port: the engine evaluates off
    // the last stored price, which each scenario sets explicitly.
    let prices = Arc::new(PriceService::new(
        rpc,
        Arc::new(AggregatorClient::new("http://127.0.0.1:1".to_string())),
        Arc::new(DexScreenerClient::new("http://127.0.0.1:1".to_string())),
        Arc::new(LaunchpadApiClient::new("http://127.0.0.1:1".to_string())),
    ));
    let engine = ExitEngine::new(
        db.clone(),
        prices,
        ExitEngineConfig {
            poll_interval_secs: 3,
            max_job_attempts: 5,
        },
    );

    Harness {
        manual: ManualTradeService::new(db.clone(), 5),
        worker,
        engine,
        db,
        _dir: dir,
    }
}

async fn drain_jobs(h: &Harness) -> usize {
    let mut processed = 0;
    loop {
        let jobs = h
            .db
            .claim_jobs("pipeline-worker", 8, Utc::now(), 60)
            .unwrap();
        if jobs.is_empty() {
            return processed;
        }
        for job in jobs {
            h.worker.process_claimed(job).await;
            processed += 1;
        }
    }
}

fn seed_wallet(h: &Harness, chat_id: &str) -> i64 {
    let user = h.db.get_or_create_user(chat_id).unwrap().id;
    h.db
        .get_or_create_user_wallet(user, Chain::Solana, curvebot_backend::wallet::generate_keypair)
        .unwrap();
    user
}

/// Scenario: two identical callback taps 50 ms apart produce one
/// execution, one position, and a silent duplicate for the second tap.
#[tokio::test]
async fn duplicate_taps_execute_exactly_once() {
    let h = harness();
    let user = seed_wallet(&h, "chat-dup");

    let first = h
        .manual
        .handle_buy("chat-dup", Chain::Solana, MINT, 0.5, None, "cb-tap")
        .unwrap();
    assert!(matches!(first, ManualTradeAck::Queued { .. }));

    // The double tap lands before any cooldown housekeeping matters
    h.db.lock().execute("DELETE FROM cooldowns", []).unwrap();
    let second = h
        .manual
        .handle_buy("chat-dup", Chain::Solana, MINT, 0.5, None, "cb-tap")
        .unwrap();
    assert_eq!(second, ManualTradeAck::Duplicate);

    let processed = drain_jobs(&h).await;
    assert_eq!(processed, 1);

    let executions: i64 = h
        .db
        .lock()
        .query_row("SELECT COUNT(*) FROM executions", [], |r| r.get(0))
        .unwrap();
    assert_eq!(executions, 1);

    let positions = h.db.list_positions_for_user(user).unwrap();
    assert_eq!(positions.len(), 1);
    assert_eq!(positions[0].status, PositionStatus::Active);
    assert_eq!(positions[0].lifecycle_state, LifecycleState::PreGraduation);
}

/// Scenario: entry at 1e-6, price to 1.6e-6 with TP at 50%: one full exit,
/// position closed, realized PnL ~ +50% before fees.
#[tokio::test]
async fn take_profit_round_trip_realizes_gain() {
    let h = harness();
    let user = seed_wallet(&h, "chat-tp");
    let sid = h
        .db
        .insert_strategy(user, "tp-strategy", 0.5, BudgetWindow::PerTrade)
        .unwrap();

    // Entry through the real buy pipeline, attributed to the strategy
    h.db.enqueue_job(&curvebot_backend::db::EnqueueJob {
        chain: Chain::Solana,
        action: TradeAction::Buy,
        mode: curvebot_backend::models::TradeMode::Auto,
        user_id: user,
        strategy_id: Some(sid),
        opportunity_id: None,
        idempotency_key: "tp-entry".to_string(),
        payload: curvebot_backend::models::JobPayload {
            mint: MINT.to_string(),
            amount_sol: 0.5,
            slippage_bps: 100,
            priority_fee_lamports: 0,
            position_id: None,
            trigger: None,
            sell_percent: 100.0,
            emergency: false,
        },
        priority: curvebot_backend::db::PRIORITY_BUY,
        max_attempts: 5,
        run_after: None,
    })
    .unwrap();
    drain_jobs(&h).await;

    let position = h.db.list_positions_for_user(user).unwrap().remove(0);
    assert!((position.entry_price - 1.0e-6).abs() < 1e-12);

    // Price observation at +60%: TP (50%) fires, full size
    h.db.update_market_price(&position.id, 1.6e-6).unwrap();
    h.engine.evaluate_position(&position.id).await.unwrap();
    assert_eq!(h.db.count_jobs_with_status(JobStatus::Queued).unwrap(), 1);

    drain_jobs(&h).await;

    let closed = h.db.get_position(&position.id).unwrap();
    assert_eq!(closed.status, PositionStatus::Closed);
    assert_eq!(closed.lifecycle_state, LifecycleState::Closed);

    // Realized: entry net 0.495 -> proceeds 0.7425 gross; +50% before fees
    let sell = h
        .db
        .lock()
        .query_row(
            "SELECT amount_sol, net_amount_sol FROM executions
             WHERE action = 'SELL' AND status = 'CONFIRMED'",
            [],
            |r| Ok((r.get::<_, f64>(0)?, r.get::<_, f64>(1)?)),
        )
        .unwrap();
    assert!((sell.0 - 0.7425).abs() < 1e-9, "gross proceeds {}", sell.0);
    assert!(sell.1 < sell.0, "net is after the platform fee");
}

/// Scenario: same ride with a 25% moon bag: the TP sells 75%, the rest
/// stays monitored and can fire again later.
#[tokio::test]
async fn moon_bag_keeps_remainder_monitoring() {
    let h = harness();
    let user = seed_wallet(&h, "chat-moon");
    let sid = h
        .db
        .insert_strategy(user, "moon", 0.5, BudgetWindow::PerTrade)
        .unwrap();
    let mut strategy = h.db.get_strategy(sid).unwrap();
    strategy.moon_bag_pct = 25.0;
    h.db.update_strategy(&strategy).unwrap();

    h.db.enqueue_job(&curvebot_backend::db::EnqueueJob {
        chain: Chain::Solana,
        action: TradeAction::Buy,
        mode: curvebot_backend::models::TradeMode::Auto,
        user_id: user,
        strategy_id: Some(sid),
        opportunity_id: None,
        idempotency_key: "moon-entry".to_string(),
        payload: curvebot_backend::models::JobPayload {
            mint: MINT.to_string(),
            amount_sol: 0.5,
            slippage_bps: 100,
            priority_fee_lamports: 0,
            position_id: None,
            trigger: None,
            sell_percent: 100.0,
            emergency: false,
        },
        priority: curvebot_backend::db::PRIORITY_BUY,
        max_attempts: 5,
        run_after: None,
    })
    .unwrap();
    drain_jobs(&h).await;

    let position = h.db.list_positions_for_user(user).unwrap().remove(0);
    let original_size = position.size_tokens;

    h.db.update_market_price(&position.id, 1.6e-6).unwrap();
    h.engine.evaluate_position(&position.id).await.unwrap();
    drain_jobs(&h).await;

    let after = h.db.get_position(&position.id).unwrap();
    assert_eq!(after.status, PositionStatus::Active);
    assert_eq!(after.trigger_state, TriggerState::Monitoring);
    assert!((after.size_tokens - original_size * 0.25).abs() < 1e-6);

    // The remainder can fire again: a later stop-loss closes it out
    h.db.update_market_price(&position.id, 0.5e-6).unwrap();
    h.engine.evaluate_position(&position.id).await.unwrap();
    drain_jobs(&h).await;

    let closed = h.db.get_position(&position.id).unwrap();
    assert_eq!(closed.status, PositionStatus::Closed);
}

/// Worker crash after submission: maintenance abandons the execution, and
/// the retried job resolves as a duplicate without a second trade.
#[tokio::test]
async fn abandoned_submission_is_failed_not_retried() {
    let h = harness();
    let user = seed_wallet(&h, "chat-crash");

    let reserve = h
        .db
        .reserve_trade_budget(
            curvebot_backend::models::TradeMode::Manual,
            user,
            None,
            Chain::Solana,
            TradeAction::Buy,
            MINT,
            0.5,
            100,
            "crash-key",
        )
        .unwrap();
    let execution_id = reserve.execution_id.unwrap();
    h.db.update_execution(execution_id, ExecutionStatus::Submitted, None, None, None, None)
        .unwrap();

    // Backdate past the grace window and sweep
    let backdated = curvebot_backend::db::to_ts(&(Utc::now() - chrono::Duration::minutes(10)));
    h.db.lock()
        .execute(
            "UPDATE executions SET updated_at = ?2 WHERE id = ?1",
            rusqlite::params![execution_id, backdated],
        )
        .unwrap();
    let abandoned = h.db.fail_stuck_executions(5).unwrap();
    assert_eq!(abandoned, vec![execution_id]);

    // The crashed worker's job resurfaces via lease expiry; its retry sees
    // the existing key and finishes DONE without trading.
    h.db.enqueue_job(&curvebot_backend::db::EnqueueJob {
        chain: Chain::Solana,
        action: TradeAction::Buy,
        mode: curvebot_backend::models::TradeMode::Manual,
        user_id: user,
        strategy_id: None,
        opportunity_id: None,
        idempotency_key: "crash-key".to_string(),
        payload: curvebot_backend::models::JobPayload {
            mint: MINT.to_string(),
            amount_sol: 0.5,
            slippage_bps: 100,
            priority_fee_lamports: 0,
            position_id: None,
            trigger: None,
            sell_percent: 100.0,
            emergency: false,
        },
        priority: curvebot_backend::db::PRIORITY_BUY,
        max_attempts: 5,
        run_after: None,
    })
    .unwrap();
    drain_jobs(&h).await;

    let execution = h.db.get_execution(execution_id).unwrap();
    assert_eq!(execution.status, ExecutionStatus::Failed);
    assert_eq!(execution.error_code.as_deref(), Some("ABANDONED"));
    assert!(h.db.list_positions_for_user(user).unwrap().is_empty());
}
