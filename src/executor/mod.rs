//! Executor worker
//! Mission: drain the job outbox and turn reservations into confirmed
//! trades. The idempotency gate in `reserve_trade_budget` is the only
//! re-entrancy defense; there is deliberately no per-user in-memory lock,
//! so any number of workers in any number of processes stay safe.

pub mod fees;

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

use crate::db::{Database, COOLDOWN_POST_BUY};
use crate::errors::{ErrorCode, TradeError};
use crate::models::{
    ExecutionStatus, JobStatus, Position, TradeAction, TradeJob, TradeMode,
};
use crate::notify::Notifier;
use crate::providers::rpc::RpcClient;
use crate::providers::{LAMPORTS_PER_SOL, TOKEN_BASE_UNITS};
use crate::router::{
    ExecuteOptions, SwapIntent, SwapQuote, SwapReceipt, SwapRouter, CONFIRM_TIMEOUT_AMM,
    CONFIRM_TIMEOUT_FAST, VENUE_AMM,
};
use crate::wallet;

const IDLE_POLL_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub worker_id: String,
    pub batch_size: usize,
    pub lease_ttl_secs: u64,
    pub min_position_sol: f64,
    pub max_position_sol: f64,
    pub max_balance_pct: f64,
    pub post_buy_cooldown_secs: i64,
    pub circuit_cooldown_secs: i64,
    pub dry_run: bool,
}

#[derive(Debug)]
enum JobOutcome {
    Done,
    Failed(TradeError),
}

pub struct ExecutorWorker {
    db: Database,
    router: Arc<SwapRouter>,
    rpc: Arc<RpcClient>,
    fees: fees::FeeSchedule,
    notifier: Notifier,
    cfg: ExecutorConfig,
}

impl ExecutorWorker {
    pub fn new(
        db: Database,
        router: Arc<SwapRouter>,
        rpc: Arc<RpcClient>,
        fees: fees::FeeSchedule,
        cfg: ExecutorConfig,
    ) -> Self {
        let notifier = Notifier::new(db.clone());
        Self {
            db,
            router,
            rpc,
            fees,
            notifier,
            cfg,
        }
    }

    /// Claim loop. Runs until the task is aborted at shutdown.
    pub async fn run(self: Arc<Self>) {
        info!(
            "Executor worker {} running (batch {}, lease {}s, dry_run={})",
            self.cfg.worker_id, self.cfg.batch_size, self.cfg.lease_ttl_secs, self.cfg.dry_run
        );
        loop {
            let claimed = match self.db.claim_jobs(
                &self.cfg.worker_id,
                self.cfg.batch_size,
                Utc::now(),
                self.cfg.lease_ttl_secs,
            ) {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!("claim_jobs failed: {}", e);
                    sleep(Duration::from_millis(IDLE_POLL_MS * 4)).await;
                    continue;
                }
            };
            if claimed.is_empty() {
                sleep(Duration::from_millis(IDLE_POLL_MS)).await;
                continue;
            }
            for job in claimed {
                self.process_claimed(job).await;
            }
        }
    }

    /// Process one leased job with a live heartbeat, then finalize.
    pub async fn process_claimed(&self, job: TradeJob) {
        let heartbeat = {
            let db = self.db.clone();
            let worker = self.cfg.worker_id.clone();
            let ttl = self.cfg.lease_ttl_secs;
            let job_id = job.id;
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(Duration::from_secs((ttl / 3).max(1)));
                tick.tick().await;
                loop {
                    tick.tick().await;
                    if let Err(e) = db.heartbeat_job(job_id, &worker, ttl) {
                        warn!("Heartbeat lost for job {}: {}", job_id, e);
                        break;
                    }
                }
            })
        };

        let outcome = self.process_job(&job).await;
        heartbeat.abort();

        let result = match &outcome {
            JobOutcome::Done => {
                self.db
                    .finalize_job(job.id, &self.cfg.worker_id, JobStatus::Done, false, None)
            }
            JobOutcome::Failed(e) => self.db.finalize_job(
                job.id,
                &self.cfg.worker_id,
                JobStatus::Failed,
                e.is_retryable(),
                Some(&e.to_string()),
            ),
        };
        if let Err(e) = result {
            // Lost lease or store trouble: the outbox recovers via takeover.
            error!("Finalize failed for job {}: {}", job.id, e);
        }
    }

    async fn process_job(&self, job: &TradeJob) -> JobOutcome {
        debug!(
            "Processing job {} ({} {} {})",
            job.id,
            job.mode.as_str(),
            job.action.as_str(),
            job.payload.mint
        );

        // Step 1: the reservation gate.
        let reserve = match self.db.reserve_trade_budget(
            job.mode,
            job.user_id,
            job.strategy_id,
            job.chain,
            job.action,
            &job.payload.mint,
            job.payload.amount_sol,
            job.payload.slippage_bps,
            &job.idempotency_key,
        ) {
            Ok(r) => r,
            Err(e) => {
                return JobOutcome::Failed(TradeError::new(
                    ErrorCode::NetworkError,
                    format!("reservation failed: {}", e),
                ))
            }
        };

        let execution_id = if reserve.allowed {
            match reserve.execution_id {
                Some(id) => id,
                None => {
                    return JobOutcome::Failed(TradeError::new(
                        ErrorCode::Internal,
                        "reservation allowed without an execution id",
                    ))
                }
            }
        } else if reserve.already_executed() {
            // Duplicate intent. Resume only if the prior attempt never got
            // past RESERVED; anything later is at-most-once territory.
            let id = match reserve.execution_id {
                Some(id) => id,
                None => {
                    return JobOutcome::Failed(TradeError::new(
                        ErrorCode::Internal,
                        "duplicate without an execution id",
                    ))
                }
            };
            match self.db.get_execution(id).map(|e| e.status) {
                Ok(ExecutionStatus::Reserved) => {
                    debug!("Resuming reserved execution {}", id);
                    id
                }
                Ok(status) => {
                    info!(
                        "Job {} is a duplicate of execution {} ({}), done",
                        job.id,
                        id,
                        status.as_str()
                    );
                    return JobOutcome::Done;
                }
                Err(e) => {
                    return JobOutcome::Failed(TradeError::new(
                        ErrorCode::NetworkError,
                        format!("ledger read failed: {}", e),
                    ))
                }
            }
        } else {
            let reason = reserve.reason.unwrap_or_else(|| "denied".to_string());
            let code = denial_code(&reason);
            warn!("Job {} denied by reservation: {}", job.id, reason);
            self.notifier
                .trade_failed(job.user_id, &job.payload.mint, job.action, code);
            return JobOutcome::Failed(TradeError::new(code, reason));
        };

        match self.run_trade(job, execution_id).await {
            Ok(()) => JobOutcome::Done,
            Err(e) => {
                self.handle_trade_failure(job, execution_id, &e);
                JobOutcome::Failed(e)
            }
        }
    }

    /// Steps 2-8: wallet, sizing, fees, router, confirmation, position
    /// bookkeeping. Transient errors before submission leave the execution
    /// RESERVED so a retry resumes it.
    async fn run_trade(&self, job: &TradeJob, execution_id: i64) -> Result<(), TradeError> {
        // Step 2: wallet, read per-trade and integrity-checked.
        let wallet_row = self
            .db
            .get_user_wallet(job.user_id, job.chain)
            .map_err(|e| TradeError::new(ErrorCode::NetworkError, format!("wallet read: {}", e)))?
            .ok_or_else(|| {
                TradeError::new(ErrorCode::Internal, format!("user {} has no wallet", job.user_id))
            })?;
        let signing = wallet::validate_wallet(&wallet_row)?;

        // Step 3: balance and position-size limits (buys only).
        if job.action == TradeAction::Buy {
            self.enforce_buy_limits(job, &wallet_row.pubkey).await?;
        }

        // Step 4: fee split on buys; sells are fee'd on proceeds later.
        let (intent_amount, sell_position) = match job.action {
            TradeAction::Buy => {
                let split = self.fees.apply_buy_fee(job.payload.amount_sol);
                self.db
                    .set_execution_fee(execution_id, split.gross, split.fee, split.net)
                    .map_err(|e| {
                        TradeError::new(ErrorCode::NetworkError, format!("fee write: {}", e))
                    })?;
                ((split.net * LAMPORTS_PER_SOL) as u64, None)
            }
            TradeAction::Sell => {
                let position = self.load_sell_position(job)?;
                let tokens =
                    position.size_tokens * job.payload.sell_percent.clamp(0.0, 100.0) / 100.0;
                if tokens <= 0.0 {
                    return Err(TradeError::new(
                        ErrorCode::Internal,
                        "sell resolves to zero tokens",
                    ));
                }
                ((tokens * TOKEN_BASE_UNITS) as u64, Some(position))
            }
        };

        // Router selection is pinned by the position's lifecycle at this
        // moment; the venue and the pricing source stay coherent. Buys on a
        // fresh launch carry the candidate's curve address as the hint.
        let buy_curve_hint = if job.action == TradeAction::Buy {
            self.db
                .get_launch_candidate(&job.payload.mint, job.chain)
                .ok()
                .flatten()
                .and_then(|c| c.bonding_curve)
        } else {
            None
        };
        let intent = SwapIntent {
            action: job.action,
            mint: job.payload.mint.clone(),
            amount: intent_amount,
            slippage_bps: job.payload.slippage_bps,
            user_pubkey: wallet_row.pubkey.clone(),
            priority_fee_lamports: job.payload.priority_fee_lamports,
            lifecycle_state: sell_position.as_ref().map(|p| p.lifecycle_state),
            bonding_curve: sell_position
                .as_ref()
                .and_then(|p| p.bonding_curve.clone())
                .or(buy_curve_hint),
            emergency: job.payload.emergency,
        };
        let adapter = self.router.select(&intent)?;

        // Quote and build while still RESERVED: failures here are cheap and
        // a retry can resume the reservation.
        let quote = adapter.quote(&intent).await?;
        let unsigned = adapter.build_tx(&quote, &intent).await?;
        let signed = wallet::sign_transaction_b64(&unsigned.tx_b64, &signing)?;

        // Past this line the trade may reach the chain; mark it.
        self.db
            .update_execution(execution_id, ExecutionStatus::Submitted, None, None, None, None)
            .map_err(|e| TradeError::new(ErrorCode::Internal, format!("ledger: {}", e)))?;

        if job.action == TradeAction::Sell
            && (job.payload.sell_percent - 100.0).abs() < f64::EPSILON
        {
            if let Some(position) = &sell_position {
                let _ = self.db.set_position_closing(&position.id);
            }
        }

        let receipt = if self.cfg.dry_run {
            info!(
                "DRY RUN: would execute {} {} on {} ({} in, >= {} out)",
                job.action.as_str(),
                job.payload.mint,
                quote.venue,
                quote.in_amount,
                quote.min_out
            );
            SwapReceipt {
                venue: quote.venue,
                signature: format!("dryrun_{}", execution_id),
            }
        } else {
            let opts = ExecuteOptions {
                skip_simulation: intent.emergency && job.action == TradeAction::Sell,
                confirmation_timeout: if quote.venue == VENUE_AMM {
                    CONFIRM_TIMEOUT_AMM
                } else {
                    CONFIRM_TIMEOUT_FAST
                },
            };
            adapter.execute(&signed, &opts).await?
        };

        // Step 7: confirmed bookkeeping.
        match job.action {
            TradeAction::Buy => self.settle_buy(job, execution_id, &quote, &receipt)?,
            TradeAction::Sell => {
                let position = sell_position.ok_or_else(|| {
                    TradeError::new(ErrorCode::Internal, "sell settled without a position")
                })?;
                self.settle_sell(job, execution_id, &position, &quote, &receipt)?
            }
        }

        self.record_success(job.user_id);
        Ok(())
    }

    async fn enforce_buy_limits(&self, job: &TradeJob, pubkey: &str) -> Result<(), TradeError> {
        let amount = job.payload.amount_sol;
        if amount < self.cfg.min_position_sol {
            return Err(TradeError::new(
                ErrorCode::BudgetExceeded,
                format!("{} SOL is below the {} minimum", amount, self.cfg.min_position_sol),
            ));
        }
        if amount > self.cfg.max_position_sol {
            return Err(TradeError::new(
                ErrorCode::BudgetExceeded,
                format!("{} SOL is above the {} maximum", amount, self.cfg.max_position_sol),
            ));
        }
        if self.cfg.dry_run {
            return Ok(());
        }
        let balance_sol = self.rpc.get_balance(pubkey).await? as f64 / LAMPORTS_PER_SOL;
        if amount > balance_sol * self.cfg.max_balance_pct {
            return Err(TradeError::new(
                ErrorCode::InsufficientFunds,
                format!(
                    "{} SOL exceeds {}% of the {} SOL balance",
                    amount,
                    self.cfg.max_balance_pct * 100.0,
                    balance_sol
                ),
            ));
        }
        Ok(())
    }

    fn load_sell_position(&self, job: &TradeJob) -> Result<Position, TradeError> {
        let position_id = job.payload.position_id.as_deref().ok_or_else(|| {
            TradeError::new(ErrorCode::Internal, "sell job without a position id")
        })?;
        let position = self
            .db
            .get_position(position_id)
            .map_err(|e| TradeError::new(ErrorCode::Internal, format!("position read: {}", e)))?;
        if position.user_id != job.user_id {
            return Err(TradeError::new(
                ErrorCode::Internal,
                "position does not belong to the job's user",
            ));
        }
        if position.size_tokens <= 0.0 {
            return Err(TradeError::new(ErrorCode::Internal, "position is empty"));
        }
        Ok(position)
    }

    fn settle_buy(
        &self,
        job: &TradeJob,
        execution_id: i64,
        quote: &SwapQuote,
        receipt: &SwapReceipt,
    ) -> Result<(), TradeError> {
        let tokens = quote.expected_out as f64 / TOKEN_BASE_UNITS;
        let price = quote.price_sol_per_token;
        self.db
            .update_execution(
                execution_id,
                ExecutionStatus::Confirmed,
                Some(&receipt.signature),
                Some(tokens),
                Some(price),
                None,
            )
            .map_err(|e| TradeError::new(ErrorCode::Internal, format!("ledger: {}", e)))?;

        let execution = self
            .db
            .get_execution(execution_id)
            .map_err(|e| TradeError::new(ErrorCode::Internal, format!("ledger: {}", e)))?;

        let candidate = self
            .db
            .get_launch_candidate(&job.payload.mint, job.chain)
            .ok()
            .flatten();
        let position = self
            .db
            .open_position(&crate::db::OpenPosition {
                user_id: job.user_id,
                strategy_id: job.strategy_id,
                chain: job.chain,
                token_mint: job.payload.mint.clone(),
                token_symbol: candidate.as_ref().and_then(|c| c.symbol.clone()),
                entry_execution_id: execution_id,
                entry_tx_sig: Some(receipt.signature.clone()),
                entry_cost_sol: execution.net_amount_sol,
                entry_price: price,
                size_tokens: tokens,
                bonding_curve: candidate.as_ref().and_then(|c| c.bonding_curve.clone()),
            })
            .map_err(|e| TradeError::new(ErrorCode::Internal, format!("position open: {}", e)))?;

        // Step 8: post-buy cooldown on (user, mint), then tell the user.
        let until = Utc::now() + ChronoDuration::seconds(self.cfg.post_buy_cooldown_secs);
        if let Err(e) = self.db.set_cooldown(
            job.chain,
            COOLDOWN_POST_BUY,
            &format!("{}:{}", job.user_id, job.payload.mint),
            until,
        ) {
            warn!("Cooldown write failed: {}", e);
        }
        self.notifier.buy_confirmed(
            job.user_id,
            &job.payload.mint,
            execution.net_amount_sol,
            tokens,
            &receipt.signature,
        );
        info!(
            "Buy confirmed: execution {} -> position {} ({} tokens at {:.3e})",
            execution_id, position.id, tokens, price
        );
        Ok(())
    }

    fn settle_sell(
        &self,
        job: &TradeJob,
        execution_id: i64,
        position: &Position,
        quote: &SwapQuote,
        receipt: &SwapReceipt,
    ) -> Result<(), TradeError> {
        let proceeds = quote.expected_out as f64 / LAMPORTS_PER_SOL;
        let split = self.fees.apply_sell_fee(proceeds);
        self.db
            .set_execution_fee(execution_id, split.gross, split.fee, split.net)
            .map_err(|e| TradeError::new(ErrorCode::Internal, format!("fee write: {}", e)))?;

        let sold_tokens = quote.in_amount as f64 / TOKEN_BASE_UNITS;
        self.db
            .update_execution(
                execution_id,
                ExecutionStatus::Confirmed,
                Some(&receipt.signature),
                Some(sold_tokens),
                Some(quote.price_sol_per_token),
                None,
            )
            .map_err(|e| TradeError::new(ErrorCode::Internal, format!("ledger: {}", e)))?;

        let outcome = self
            .db
            .apply_sell(&position.id, job.payload.sell_percent)
            .map_err(|e| TradeError::new(ErrorCode::Internal, format!("position: {}", e)))?;

        let cost_basis = position.entry_cost_sol * job.payload.sell_percent.clamp(0.0, 100.0) / 100.0;
        let pnl = split.net - cost_basis;
        self.notifier.sell_confirmed(
            job.user_id,
            &job.payload.mint,
            split.net,
            pnl,
            outcome.closed,
            &receipt.signature,
        );
        info!(
            "Sell confirmed: execution {} on position {} (pnl {:+.4} SOL, closed={})",
            execution_id, position.id, pnl, outcome.closed
        );
        Ok(())
    }

    /// Terminal failures stamp the ledger, trip the breaker, free the
    /// position for future exit evaluation and notify the user. Transient
    /// failures leave the RESERVED row for the retry to resume.
    fn handle_trade_failure(&self, job: &TradeJob, execution_id: i64, err: &TradeError) {
        warn!("Job {} trade failed: {}", job.id, err);
        if err.is_retryable() {
            return;
        }

        if let Err(e) = self.db.update_execution(
            execution_id,
            ExecutionStatus::Failed,
            None,
            None,
            None,
            Some((err.code, err.detail.as_str())),
        ) {
            // Already CONFIRMED/FAILED rows reject the transition; that's fine.
            debug!("Ledger failure stamp skipped for {}: {}", execution_id, e);
        }

        if job.action == TradeAction::Sell {
            if let Some(position_id) = job.payload.position_id.as_deref() {
                if let Err(e) = self.db.reset_trigger(position_id) {
                    warn!("Trigger reset failed for {}: {}", position_id, e);
                }
            }
        }

        for scope in ["GLOBAL".to_string(), job.user_id.to_string()] {
            if let Err(e) = self
                .db
                .record_trade_failure(&scope, self.cfg.circuit_cooldown_secs)
            {
                warn!("Circuit bookkeeping failed for {}: {}", scope, e);
            }
        }

        if err.code == ErrorCode::WalletMismatch {
            self.notifier.security_event(job.user_id, &err.detail);
        } else {
            self.notifier
                .trade_failed(job.user_id, &job.payload.mint, job.action, err.code);
        }
    }

    fn record_success(&self, user_id: i64) {
        for scope in ["GLOBAL".to_string(), user_id.to_string()] {
            if let Err(e) = self.db.record_trade_success(&scope) {
                warn!("Breaker reset failed for {}: {}", scope, e);
            }
        }
    }
}

fn denial_code(reason: &str) -> ErrorCode {
    let lower = reason.to_lowercase();
    if lower.contains("circuit") {
        ErrorCode::CircuitOpen
    } else if lower.contains("budget") {
        ErrorCode::BudgetExceeded
    } else {
        ErrorCode::SafetyPaused
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::temp_db;
    use crate::db::{EnqueueJob, PRIORITY_BUY, PRIORITY_EXIT};
    use crate::errors::TradeError;
    use crate::models::{Chain, JobPayload, LifecycleState};
    use crate::router::{UnsignedSwap, VenueAdapter, VENUE_BONDING_CURVE};
    use async_trait::async_trait;
    use base64::Engine;
    use parking_lot::Mutex;

    /// Venue stub: canned quotes, a valid unsigned envelope, scripted
    /// execute outcomes.
    struct ScriptedVenue {
        name: &'static str,
        quote_error: Mutex<Option<ErrorCode>>,
        tokens_out: u64,
        lamports_out: u64,
    }

    impl ScriptedVenue {
        fn healthy(name: &'static str) -> Self {
            Self {
                name,
                quote_error: Mutex::new(None),
                tokens_out: 495_000 * 1_000_000,
                lamports_out: 742_500_000,
            }
        }

        fn failing(name: &'static str, code: ErrorCode) -> Self {
            Self {
                quote_error: Mutex::new(Some(code)),
                ..Self::healthy(name)
            }
        }
    }

    #[async_trait]
    impl VenueAdapter for ScriptedVenue {
        fn name(&self) -> &'static str {
            self.name
        }
        fn can_handle(&self, _intent: &SwapIntent) -> bool {
            true
        }
        async fn quote(&self, intent: &SwapIntent) -> Result<SwapQuote, TradeError> {
            if let Some(code) = *self.quote_error.lock() {
                return Err(TradeError::new(code, "scripted quote failure"));
            }
            let expected_out = match intent.action {
                TradeAction::Buy => self.tokens_out,
                TradeAction::Sell => self.lamports_out,
            };
            Ok(SwapQuote {
                venue: self.name,
                in_amount: intent.amount,
                expected_out,
                min_out: expected_out * 99 / 100,
                price_sol_per_token: 1.0e-6,
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
            bytes.extend_from_slice(b"scripted swap message");
            Ok(UnsignedSwap {
                venue: self.name,
                tx_b64: base64::engine::general_purpose::STANDARD.encode(bytes),
            })
        }
        async fn execute(
            &self,
            _signed: &str,
            _opts: &ExecuteOptions,
        ) -> Result<SwapReceipt, TradeError> {
            Ok(SwapReceipt {
                venue: self.name,
                signature: "scripted_sig".to_string(),
            })
        }
    }

    fn worker_with(db: &Database, venue: ScriptedVenue) -> ExecutorWorker {
        let router = Arc::new(SwapRouter::new(vec![Arc::new(venue)]));
        let rpc = Arc::new(RpcClient::new("http://127.0.0.1:1".to_string()));
        ExecutorWorker::new(
            db.clone(),
            router,
            rpc,
            fees::FeeSchedule::new(100),
            ExecutorConfig {
                worker_id: "test-worker".to_string(),
                batch_size: 4,
                lease_ttl_secs: 60,
                min_position_sol: 0.01,
                max_position_sol: 10.0,
                max_balance_pct: 0.5,
                post_buy_cooldown_secs: 300,
                circuit_cooldown_secs: 60,
                dry_run: true,
            },
        )
    }

    fn seed_user_with_wallet(db: &Database) -> i64 {
        let user = db.get_or_create_user("chat-exec").unwrap().id;
        db.get_or_create_user_wallet(user, Chain::Solana, crate::wallet::generate_keypair)
            .unwrap();
        user
    }

    fn buy_job(db: &Database, user: i64, key: &str) -> TradeJob {
        db.enqueue_job(&EnqueueJob {
            chain: Chain::Solana,
            action: TradeAction::Buy,
            mode: TradeMode::Manual,
            user_id: user,
            strategy_id: None,
            opportunity_id: None,
            idempotency_key: key.to_string(),
            payload: JobPayload {
                mint: "MintAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".to_string(),
                amount_sol: 0.5,
                slippage_bps: 100,
                priority_fee_lamports: 0,
                position_id: None,
                trigger: None,
                sell_percent: 100.0,
                emergency: false,
            },
            priority: PRIORITY_BUY,
            max_attempts: 5,
            run_after: None,
        })
        .unwrap();
        db.claim_jobs("test-worker", 1, Utc::now(), 60)
            .unwrap()
            .remove(0)
    }

    #[tokio::test]
    async fn test_buy_pipeline_opens_position_and_cooldown() {
        let (db, _dir, _) = temp_db();
        let user = seed_user_with_wallet(&db);
        let worker = worker_with(&db, ScriptedVenue::healthy(VENUE_BONDING_CURVE));

        let job = buy_job(&db, user, "exec-buy-1");
        worker.process_claimed(job.clone()).await;

        // Job finished, ledger confirmed, fee recorded
        assert_eq!(db.get_job(job.id).unwrap().status, JobStatus::Done);
        let execution = db.get_execution_by_key("exec-buy-1").unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Confirmed);
        assert!((execution.fee_sol - 0.005).abs() < 1e-12);
        assert!((execution.net_amount_sol - 0.495).abs() < 1e-12);

        // Position opened with entry pinned to the quote
        let positions = db.list_positions_for_user(user).unwrap();
        assert_eq!(positions.len(), 1);
        let p = &positions[0];
        assert_eq!(p.lifecycle_state, LifecycleState::PreGraduation);
        assert!((p.size_tokens - 495_000.0).abs() < 1e-6);
        assert_eq!(p.entry_execution_id, execution.id);

        // Post-buy cooldown set
        assert!(db
            .cooldown_active(
                Chain::Solana,
                COOLDOWN_POST_BUY,
                &format!("{}:MintAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA", user)
            )
            .unwrap());

        // User notified
        let pending = db.pending_notifications(10).unwrap();
        assert!(pending.iter().any(|n| n.kind == "buy_confirmed"));
    }

    #[tokio::test]
    async fn test_duplicate_job_returns_done_without_second_execution() {
        let (db, _dir, _) = temp_db();
        let user = seed_user_with_wallet(&db);
        let worker = worker_with(&db, ScriptedVenue::healthy(VENUE_BONDING_CURVE));

        let job1 = buy_job(&db, user, "exec-dup");
        worker.process_claimed(job1).await;

        // A second tap enqueues nothing (same key), but even a fresh job
        // with the same key would resolve as a duplicate:
        db.enqueue_job(&EnqueueJob {
            chain: Chain::Solana,
            action: TradeAction::Buy,
            mode: TradeMode::Manual,
            user_id: user,
            strategy_id: None,
            opportunity_id: None,
            idempotency_key: "exec-dup-second-job".to_string(),
            payload: JobPayload {
                mint: "MintAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".to_string(),
                amount_sol: 0.5,
                slippage_bps: 100,
                priority_fee_lamports: 0,
                position_id: None,
                trigger: None,
                sell_percent: 100.0,
                emergency: false,
            },
            priority: PRIORITY_BUY,
            max_attempts: 5,
            run_after: None,
        })
        .unwrap();
        let mut job2 = db.claim_jobs("test-worker", 1, Utc::now(), 60).unwrap().remove(0);
        // Simulate the duplicate tap by reusing the first key
        job2.idempotency_key = "exec-dup".to_string();
        worker.process_claimed(job2).await;

        let n: i64 = db
            .lock()
            .query_row(
                "SELECT COUNT(*) FROM executions WHERE idempotency_key = 'exec-dup'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(db.list_positions_for_user(user).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transient_quote_failure_retries_and_resumes_reservation() {
        let (db, _dir, _) = temp_db();
        let user = seed_user_with_wallet(&db);
        let worker = worker_with(
            &db,
            ScriptedVenue::failing(VENUE_BONDING_CURVE, ErrorCode::RpcTimeout),
        );

        let job = buy_job(&db, user, "exec-retry");
        worker.process_claimed(job.clone()).await;

        // Retryable: job re-queued, execution still RESERVED for the resume
        let stored = db.get_job(job.id).unwrap();
        assert_eq!(stored.status, JobStatus::Queued);
        let execution = db.get_execution_by_key("exec-retry").unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Reserved);

        // Second attempt with a healthy venue resumes the same execution
        let worker = worker_with(&db, ScriptedVenue::healthy(VENUE_BONDING_CURVE));
        let retried = db
            .claim_jobs("test-worker", 1, Utc::now() + ChronoDuration::seconds(30), 60)
            .unwrap()
            .remove(0);
        assert_eq!(retried.id, job.id);
        worker.process_claimed(retried).await;

        let resumed = db.get_execution_by_key("exec-retry").unwrap().unwrap();
        assert_eq!(resumed.status, ExecutionStatus::Confirmed);
        assert_eq!(resumed.id, execution.id, "retry must resume the same row");
    }

    #[tokio::test]
    async fn test_permanent_failure_is_terminal_and_trips_breaker() {
        let (db, _dir, _) = temp_db();
        let user = seed_user_with_wallet(&db);
        let worker = worker_with(
            &db,
            ScriptedVenue::failing(VENUE_BONDING_CURVE, ErrorCode::SlippageExceeded),
        );

        let job = buy_job(&db, user, "exec-slip");
        worker.process_claimed(job.clone()).await;

        assert_eq!(db.get_job(job.id).unwrap().status, JobStatus::Failed);
        let execution = db.get_execution_by_key("exec-slip").unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.error_code.as_deref(), Some("SLIPPAGE_EXCEEDED"));

        let controls = db.get_safety_controls("GLOBAL");
        assert_eq!(controls.consecutive_failures, 1);

        let pending = db.pending_notifications(10).unwrap();
        assert!(pending.iter().any(|n| n.kind == "trade_failed"));
    }

    #[tokio::test]
    async fn test_tampered_wallet_fails_closed_with_security_event() {
        let (db, _dir, _) = temp_db();
        let user = seed_user_with_wallet(&db);
        // Corrupt the stored pubkey so derivation cannot match
        db.lock()
            .execute(
                "UPDATE wallets SET pubkey = 'TamperedTamperedTamperedTamperedTampered11' WHERE user_id = ?1",
                [user],
            )
            .unwrap();

        let worker = worker_with(&db, ScriptedVenue::healthy(VENUE_BONDING_CURVE));
        let job = buy_job(&db, user, "exec-tamper");
        worker.process_claimed(job.clone()).await;

        assert_eq!(db.get_job(job.id).unwrap().status, JobStatus::Failed);
        let execution = db.get_execution_by_key("exec-tamper").unwrap().unwrap();
        assert_eq!(execution.error_code.as_deref(), Some("WALLET_MISMATCH"));
        let pending = db.pending_notifications(10).unwrap();
        assert!(pending.iter().any(|n| n.kind == "security_event"));
    }

    #[tokio::test]
    async fn test_paused_reservation_denies_job_terminally() {
        let (db, _dir, _) = temp_db();
        let user = seed_user_with_wallet(&db);
        db.set_global_pause(true).unwrap();
        let worker = worker_with(&db, ScriptedVenue::healthy(VENUE_BONDING_CURVE));

        let job = buy_job(&db, user, "exec-paused");
        worker.process_claimed(job.clone()).await;

        assert_eq!(db.get_job(job.id).unwrap().status, JobStatus::Failed);
        assert!(db.get_execution_by_key("exec-paused").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_full_sell_realizes_and_closes() {
        let (db, _dir, _) = temp_db();
        let user = seed_user_with_wallet(&db);
        let worker = worker_with(&db, ScriptedVenue::healthy(VENUE_BONDING_CURVE));

        // Open a position through a real buy first
        let buy = buy_job(&db, user, "exec-sell-setup");
        worker.process_claimed(buy).await;
        let position = db.list_positions_for_user(user).unwrap().remove(0);

        db.enqueue_job(&EnqueueJob {
            chain: Chain::Solana,
            action: TradeAction::Sell,
            mode: TradeMode::Auto,
            user_id: user,
            strategy_id: None,
            opportunity_id: None,
            idempotency_key: "exec-sell".to_string(),
            payload: JobPayload {
                mint: position.token_mint.clone(),
                amount_sol: 0.0,
                slippage_bps: 100,
                priority_fee_lamports: 0,
                position_id: Some(position.id.clone()),
                trigger: Some(crate::models::ExitTrigger::TakeProfit),
                sell_percent: 100.0,
                emergency: false,
            },
            priority: PRIORITY_EXIT,
            max_attempts: 5,
            run_after: None,
        })
        .unwrap();
        let sell = db
            .claim_jobs("test-worker", 1, Utc::now(), 60)
            .unwrap()
            .remove(0);
        worker.process_claimed(sell).await;

        let position = db.get_position(&position.id).unwrap();
        assert_eq!(position.status, crate::models::PositionStatus::Closed);
        assert_eq!(position.lifecycle_state, LifecycleState::Closed);

        let execution = db.get_execution_by_key("exec-sell").unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Confirmed);
        // Sell fee taken from proceeds: 0.7425 gross, 1% fee
        assert!((execution.fee_sol - 0.007425).abs() < 1e-9);

        let pending = db.pending_notifications(20).unwrap();
        assert!(pending.iter().any(|n| n.kind == "sell_confirmed"));
    }
}
