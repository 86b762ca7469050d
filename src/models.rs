//! Core domain types shared across the execution pipeline
//! Mission: one vocabulary for candidates, opportunities, executions,
//! positions and jobs, persisted as stable TEXT tags.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Supported chains. Everything ships Solana-first; the tag is kept in every
/// row (and in idempotency keys) so additional chains are a data change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chain {
    Solana,
}

impl Chain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Solana => "solana",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "solana" | "sol" => Some(Chain::Solana),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeMode {
    Manual,
    Auto,
}

impl TradeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeMode::Manual => "MANUAL",
            TradeMode::Auto => "AUTO",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "MANUAL" => Some(TradeMode::Manual),
            "AUTO" => Some(TradeMode::Auto),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Buy,
    Sell,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "BUY",
            TradeAction::Sell => "SELL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(TradeAction::Buy),
            "SELL" => Some(TradeAction::Sell),
            _ => None,
        }
    }
}

/// Ledger row status. Transitions are enforced by the database layer:
/// RESERVED -> SUBMITTED -> CONFIRMED, or {RESERVED, SUBMITTED} -> FAILED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    Reserved,
    Submitted,
    Confirmed,
    Failed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Reserved => "RESERVED",
            ExecutionStatus::Submitted => "SUBMITTED",
            ExecutionStatus::Confirmed => "CONFIRMED",
            ExecutionStatus::Failed => "FAILED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "RESERVED" => Some(ExecutionStatus::Reserved),
            "SUBMITTED" => Some(ExecutionStatus::Submitted),
            "CONFIRMED" => Some(ExecutionStatus::Confirmed),
            "FAILED" => Some(ExecutionStatus::Failed),
            _ => None,
        }
    }
}

/// How a launch candidate was first seen. Ordered: an on-chain sighting is
/// stronger evidence than a chat message and never downgrades.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    Telegram,
    Onchain,
}

impl DiscoveryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryMethod::Telegram => "telegram",
            DiscoveryMethod::Onchain => "onchain",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "telegram" => Some(DiscoveryMethod::Telegram),
            "onchain" => Some(DiscoveryMethod::Onchain),
            _ => None,
        }
    }

    /// Merge rank: higher wins on duplicate detection.
    pub fn rank(&self) -> u8 {
        match self {
            DiscoveryMethod::Telegram => 1,
            DiscoveryMethod::Onchain => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    New,
    Scored,
    Rejected,
    Promoted,
}

impl CandidateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateStatus::New => "new",
            CandidateStatus::Scored => "scored",
            CandidateStatus::Rejected => "rejected",
            CandidateStatus::Promoted => "promoted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "new" => Some(CandidateStatus::New),
            "scored" => Some(CandidateStatus::Scored),
            "rejected" => Some(CandidateStatus::Rejected),
            "promoted" => Some(CandidateStatus::Promoted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpportunityStatus {
    New,
    Qualified,
    Rejected,
    Executing,
    Expired,
}

impl OpportunityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpportunityStatus::New => "NEW",
            OpportunityStatus::Qualified => "QUALIFIED",
            OpportunityStatus::Rejected => "REJECTED",
            OpportunityStatus::Executing => "EXECUTING",
            OpportunityStatus::Expired => "EXPIRED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(OpportunityStatus::New),
            "QUALIFIED" => Some(OpportunityStatus::Qualified),
            "REJECTED" => Some(OpportunityStatus::Rejected),
            "EXECUTING" => Some(OpportunityStatus::Executing),
            "EXPIRED" => Some(OpportunityStatus::Expired),
            _ => None,
        }
    }
}

/// Position venue phase. Monotonic: PRE_GRADUATION -> POST_GRADUATION ->
/// CLOSED, never backward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LifecycleState {
    PreGraduation,
    PostGraduation,
    Closed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::PreGraduation => "PRE_GRADUATION",
            LifecycleState::PostGraduation => "POST_GRADUATION",
            LifecycleState::Closed => "CLOSED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "PRE_GRADUATION" => Some(LifecycleState::PreGraduation),
            "POST_GRADUATION" => Some(LifecycleState::PostGraduation),
            "CLOSED" => Some(LifecycleState::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PricingSource {
    BondingCurve,
    AmmPool,
}

impl PricingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PricingSource::BondingCurve => "BONDING_CURVE",
            PricingSource::AmmPool => "AMM_POOL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "BONDING_CURVE" => Some(PricingSource::BondingCurve),
            "AMM_POOL" => Some(PricingSource::AmmPool),
            _ => None,
        }
    }
}

/// Exit-logic arming flag. Anything other than MONITORING means some
/// evaluator already claimed the position; pollers skip it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TriggerState {
    Monitoring,
    TpArmed,
    TrailArmed,
    Triggered,
}

impl TriggerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerState::Monitoring => "MONITORING",
            TriggerState::TpArmed => "TP_ARMED",
            TriggerState::TrailArmed => "TRAIL_ARMED",
            TriggerState::Triggered => "TRIGGERED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "MONITORING" => Some(TriggerState::Monitoring),
            "TP_ARMED" => Some(TriggerState::TpArmed),
            "TRAIL_ARMED" => Some(TriggerState::TrailArmed),
            "TRIGGERED" => Some(TriggerState::Triggered),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Active,
    Closing,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Active => "ACTIVE",
            PositionStatus::Closing => "CLOSING",
            PositionStatus::Closed => "CLOSED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(PositionStatus::Active),
            "CLOSING" => Some(PositionStatus::Closing),
            "CLOSED" => Some(PositionStatus::Closed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Queued,
    Claimed,
    Done,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Claimed => "CLAIMED",
            JobStatus::Done => "DONE",
            JobStatus::Failed => "FAILED",
            JobStatus::Canceled => "CANCELED",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(JobStatus::Queued),
            "CLAIMED" => Some(JobStatus::Claimed),
            "DONE" => Some(JobStatus::Done),
            "FAILED" => Some(JobStatus::Failed),
            "CANCELED" => Some(JobStatus::Canceled),
            _ => None,
        }
    }
}

/// Why a sell fired. The tag participates in exit-sell idempotency keys, so
/// the same trigger on the same position never double-executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitTrigger {
    TakeProfit,
    StopLoss,
    Trailing,
    MaxHold,
    Manual,
}

impl ExitTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitTrigger::TakeProfit => "take_profit",
            ExitTrigger::StopLoss => "stop_loss",
            ExitTrigger::Trailing => "trailing",
            ExitTrigger::MaxHold => "max_hold",
            ExitTrigger::Manual => "manual",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "take_profit" => Some(ExitTrigger::TakeProfit),
            "stop_loss" => Some(ExitTrigger::StopLoss),
            "trailing" => Some(ExitTrigger::Trailing),
            "max_hold" => Some(ExitTrigger::MaxHold),
            "manual" => Some(ExitTrigger::Manual),
            _ => None,
        }
    }
}

/// How `max_sol_per_trade` is enforced: a per-trade ceiling, or a cumulative
/// ceiling over the trailing 24 hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetWindow {
    PerTrade,
    Daily,
}

impl BudgetWindow {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetWindow::PerTrade => "per_trade",
            BudgetWindow::Daily => "daily",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "per_trade" => Some(BudgetWindow::PerTrade),
            "daily" => Some(BudgetWindow::Daily),
            _ => None,
        }
    }
}

/// An auto-trade strategy owned by a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub chain: Chain,
    pub enabled: bool,
    pub max_sol_per_trade: f64,
    pub budget_window: BudgetWindow,
    pub slippage_bps: u32,
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    pub max_hold_minutes: i64,
    pub trailing_activation_pct: f64,
    pub trailing_distance_pct: f64,
    pub moon_bag_pct: f64,
    pub min_score: u32,
    pub min_initial_liquidity_sol: f64,
    pub allowed_sources: Vec<DiscoveryMethod>,
    pub denylisted_mints: Vec<String>,
    pub denylisted_deployers: Vec<String>,
}

/// A newly discovered token launch, keyed by (mint, chain).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchCandidate {
    pub mint: String,
    pub chain: Chain,
    pub discovery_method: DiscoveryMethod,
    pub status: CandidateStatus,
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub creator: Option<String>,
    pub bonding_curve: Option<String>,
    pub raw_payload: serde_json::Value,
    pub first_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: i64,
    pub mint: String,
    pub chain: Chain,
    pub score: u32,
    pub reasons: Vec<String>,
    pub hard_stop: bool,
    pub matched_strategy_ids: Vec<i64>,
    pub status: OpportunityStatus,
    pub detected_at: DateTime<Utc>,
}

/// Immutable ledger row for a submitted trade. One row per idempotency key,
/// ever.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: i64,
    pub idempotency_key: String,
    pub mode: TradeMode,
    pub action: TradeAction,
    pub user_id: i64,
    pub strategy_id: Option<i64>,
    pub chain: Chain,
    pub token_mint: String,
    pub amount_sol: f64,
    pub fee_sol: f64,
    pub net_amount_sol: f64,
    pub slippage_bps: u32,
    pub tx_signature: Option<String>,
    pub status: ExecutionStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub user_id: i64,
    pub strategy_id: Option<i64>,
    pub chain: Chain,
    pub token_mint: String,
    pub token_symbol: Option<String>,
    pub entry_execution_id: i64,
    pub entry_tx_sig: Option<String>,
    pub entry_cost_sol: f64,
    pub entry_price: f64,
    pub size_tokens: f64,
    pub peak_price: f64,
    pub current_price: f64,
    pub lifecycle_state: LifecycleState,
    pub pricing_source: PricingSource,
    pub trigger_state: TriggerState,
    pub status: PositionStatus,
    pub bonding_curve: Option<String>,
    pub pool_address: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn age_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.opened_at).num_minutes()
    }

    /// Unrealized gain relative to entry, in percent.
    pub fn gain_pct(&self) -> f64 {
        if self.entry_price <= 0.0 {
            return 0.0;
        }
        (self.current_price - self.entry_price) / self.entry_price * 100.0
    }
}

/// Payload carried by a work-queue row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub mint: String,
    pub amount_sol: f64,
    pub slippage_bps: u32,
    #[serde(default)]
    pub priority_fee_lamports: u64,
    #[serde(default)]
    pub position_id: Option<String>,
    #[serde(default)]
    pub trigger: Option<ExitTrigger>,
    /// 1..=100; only meaningful on sells.
    #[serde(default = "default_sell_percent")]
    pub sell_percent: f64,
    /// Skip pre-execution simulation (stop-loss far under water).
    #[serde(default)]
    pub emergency: bool,
}

fn default_sell_percent() -> f64 {
    100.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeJob {
    pub id: i64,
    pub chain: Chain,
    pub action: TradeAction,
    pub mode: TradeMode,
    pub user_id: i64,
    pub strategy_id: Option<i64>,
    pub opportunity_id: Option<i64>,
    pub idempotency_key: String,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub priority: i64,
    pub attempts: i64,
    pub max_attempts: i64,
    pub run_after: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Safety switches for one scope (`GLOBAL` or a user id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyControls {
    pub scope: String,
    pub trading_paused: bool,
    pub auto_execute_enabled: bool,
    pub manual_trading_enabled: bool,
    pub consecutive_failures: i64,
    pub circuit_breaker_threshold: i64,
    pub circuit_open_until: Option<DateTime<Utc>>,
}

impl SafetyControls {
    /// The fail-closed value: any read error is treated as this.
    pub fn restrictive(scope: &str) -> Self {
        Self {
            scope: scope.to_string(),
            trading_paused: true,
            auto_execute_enabled: false,
            manual_trading_enabled: false,
            consecutive_failures: 0,
            circuit_breaker_threshold: 0,
            circuit_open_until: None,
        }
    }

    pub fn circuit_open(&self, now: DateTime<Utc>) -> bool {
        matches!(self.circuit_open_until, Some(until) if until > now)
    }
}

/// Application configuration, from the process environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub rpc_http_url: String,
    pub rpc_ws_url: String,
    pub launchpad_program_id: String,
    pub aggregator_url: String,
    pub dexscreener_url: String,
    pub launchpad_api_url: String,
    pub monitored_channel_id: Option<String>,
    pub worker_count: usize,
    pub lease_ttl_secs: u64,
    pub max_attempts: i64,
    pub poller_interval_secs: u64,
    pub graduation_interval_secs: u64,
    pub post_buy_cooldown_secs: i64,
    pub platform_fee_bps: u32,
    pub min_position_sol: f64,
    pub max_position_sol: f64,
    pub max_balance_pct: f64,
    pub telegram_dedup_ttl_secs: u64,
    // Feature flags gating the long-lived loops at startup
    pub auto_execute_enabled: bool,
    pub tp_sl_engine_enabled: bool,
    pub graduation_monitor_enabled: bool,
    pub onchain_discovery_enabled: bool,
    pub dry_run: bool,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        Ok(Self {
            database_path: env_or("DATABASE_PATH", "./curvebot.db"),
            rpc_http_url: env_or("SOLANA_RPC_URL", "https://api.mainnet-beta.solana.com"),
            rpc_ws_url: env_or("SOLANA_RPC_WS_URL", "wss://api.mainnet-beta.solana.com"),
            launchpad_program_id: env_or(
                "LAUNCHPAD_PROGRAM_ID",
                "6EF8rrecthR5Dkzon8Nwu78hRvfCKubJ14M5uBEwF6P",
            ),
            aggregator_url: env_or("AGGREGATOR_URL", "https://quote-api.jup.ag/v6"),
            dexscreener_url: env_or("DEXSCREENER_URL", "https://api.dexscreener.com"),
            launchpad_api_url: env_or("LAUNCHPAD_API_URL", "https://frontend-api.pump.fun"),
            monitored_channel_id: std::env::var("MONITORED_CHANNEL_ID").ok(),
            worker_count: env_or("WORKER_COUNT", "2").parse().unwrap_or(2),
            lease_ttl_secs: env_or("JOB_LEASE_TTL_SECS", "60").parse().unwrap_or(60),
            max_attempts: env_or("JOB_MAX_ATTEMPTS", "5").parse().unwrap_or(5),
            poller_interval_secs: env_or("EXIT_POLL_INTERVAL_SECS", "3").parse().unwrap_or(3),
            graduation_interval_secs: env_or("GRADUATION_POLL_INTERVAL_SECS", "5")
                .parse()
                .unwrap_or(5),
            post_buy_cooldown_secs: env_or("POST_BUY_COOLDOWN_SECS", "300").parse().unwrap_or(300),
            platform_fee_bps: env_or("PLATFORM_FEE_BPS", "100").parse().unwrap_or(100),
            min_position_sol: env_or("MIN_POSITION_SOL", "0.01").parse().unwrap_or(0.01),
            max_position_sol: env_or("MAX_POSITION_SOL", "10.0").parse().unwrap_or(10.0),
            max_balance_pct: env_or("MAX_BALANCE_PCT", "0.5").parse().unwrap_or(0.5),
            telegram_dedup_ttl_secs: env_or("TELEGRAM_DEDUP_TTL_SECS", "120")
                .parse()
                .unwrap_or(120),
            auto_execute_enabled: env_flag("AUTO_EXECUTE_ENABLED", false),
            tp_sl_engine_enabled: env_flag("TP_SL_ENGINE_ENABLED", true),
            graduation_monitor_enabled: env_flag("GRADUATION_MONITOR_ENABLED", true),
            onchain_discovery_enabled: env_flag("ONCHAIN_DISCOVERY_ENABLED", true),
            dry_run: env_flag("DRY_RUN", true),
        })
    }
}
