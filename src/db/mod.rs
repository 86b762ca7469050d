//! SQLite persistence layer
//! Mission: every cross-worker invariant lives here, behind short immediate
//! transactions. Workers coordinate through these procedures and nothing
//! else; there is no shared in-process state a second process could race on.
//!
//! Notes:
//! - WAL mode so monitors can read while a worker writes
//! - `BEGIN IMMEDIATE` for every multi-statement procedure; SQLite's
//!   single-writer lock is what makes claim/reserve atomic across processes
//! - timestamps are fixed-width RFC3339 (micros, Z) so TEXT comparison is
//!   chronological comparison

mod candidates;
mod cooldowns;
mod executions;
mod jobs;
mod notifications;
mod positions;
mod safety;
mod strategies;
mod wallets;

pub use candidates::OPPORTUNITY_TTL_SECS;
pub use cooldowns::{COOLDOWN_POST_BUY, COOLDOWN_USER_RATE};
pub use executions::ReserveOutcome;
pub use jobs::{backoff_delay_secs, EnqueueJob, PRIORITY_BUY, PRIORITY_EXIT};
pub use notifications::NotificationRow;
pub use positions::{OpenPosition, SellOutcome};
pub use wallets::{UserRecord, WalletRecord};

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::sync::Arc;
use tracing::info;

/// Schema. Unique indices are the idempotency story; partial state is never
/// representable (every transition is a single UPDATE).
const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA busy_timeout = 5000;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_id TEXT UNIQUE NOT NULL,
    priority_fee_lamports INTEGER NOT NULL DEFAULT 0,
    default_slippage_bps INTEGER NOT NULL DEFAULT 100,
    max_daily_sol REAL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS wallets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    chain TEXT NOT NULL,
    pubkey TEXT NOT NULL,
    secret_b58 TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (user_id, chain),
    FOREIGN KEY (user_id) REFERENCES users(id)
);

CREATE TABLE IF NOT EXISTS strategies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    name TEXT NOT NULL,
    chain TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 0,
    max_sol_per_trade REAL NOT NULL,
    budget_window TEXT NOT NULL DEFAULT 'per_trade',
    slippage_bps INTEGER NOT NULL DEFAULT 100,
    take_profit_pct REAL NOT NULL DEFAULT 50.0,
    stop_loss_pct REAL NOT NULL DEFAULT 20.0,
    max_hold_minutes INTEGER NOT NULL DEFAULT 60,
    trailing_activation_pct REAL NOT NULL DEFAULT 0.0,
    trailing_distance_pct REAL NOT NULL DEFAULT 0.0,
    moon_bag_pct REAL NOT NULL DEFAULT 0.0,
    min_score INTEGER NOT NULL DEFAULT 0,
    min_initial_liquidity_sol REAL NOT NULL DEFAULT 0.0,
    allowed_sources TEXT NOT NULL DEFAULT '["telegram","onchain"]',
    denylisted_mints TEXT NOT NULL DEFAULT '[]',
    denylisted_deployers TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL,
    FOREIGN KEY (user_id) REFERENCES users(id)
);
CREATE INDEX IF NOT EXISTS idx_strategies_enabled ON strategies(enabled, chain);

CREATE TABLE IF NOT EXISTS launch_candidates (
    mint TEXT NOT NULL,
    chain TEXT NOT NULL,
    discovery_method TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'new',
    symbol TEXT,
    name TEXT,
    creator TEXT,
    bonding_curve TEXT,
    raw_payload TEXT NOT NULL DEFAULT '{}',
    first_seen_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (mint, chain)
);
CREATE INDEX IF NOT EXISTS idx_candidates_status ON launch_candidates(status, first_seen_at);

CREATE TABLE IF NOT EXISTS opportunities (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    mint TEXT NOT NULL,
    chain TEXT NOT NULL,
    score INTEGER NOT NULL,
    reasons TEXT NOT NULL DEFAULT '[]',
    hard_stop INTEGER NOT NULL DEFAULT 0,
    matched_strategy_ids TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'NEW',
    detected_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_opportunities_status ON opportunities(status, detected_at);

CREATE TABLE IF NOT EXISTS executions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    idempotency_key TEXT NOT NULL,
    mode TEXT NOT NULL,
    action TEXT NOT NULL,
    user_id INTEGER NOT NULL,
    strategy_id INTEGER,
    chain TEXT NOT NULL,
    token_mint TEXT NOT NULL,
    amount_sol REAL NOT NULL,
    fee_sol REAL NOT NULL DEFAULT 0.0,
    net_amount_sol REAL NOT NULL,
    slippage_bps INTEGER NOT NULL,
    tx_signature TEXT,
    tokens_out REAL,
    exec_price REAL,
    status TEXT NOT NULL DEFAULT 'RESERVED',
    error_code TEXT,
    error_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_executions_idem ON executions(idempotency_key);
CREATE INDEX IF NOT EXISTS idx_executions_user ON executions(user_id, status);
CREATE INDEX IF NOT EXISTS idx_executions_stuck ON executions(status, updated_at);

CREATE TABLE IF NOT EXISTS trade_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chain TEXT NOT NULL,
    action TEXT NOT NULL,
    mode TEXT NOT NULL,
    user_id INTEGER NOT NULL,
    strategy_id INTEGER,
    opportunity_id INTEGER,
    idempotency_key TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'QUEUED',
    priority INTEGER NOT NULL DEFAULT 10,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 5,
    run_after TEXT NOT NULL,
    lease_owner TEXT,
    lease_expires_at TEXT,
    last_error TEXT,
    created_at TEXT NOT NULL,
    completed_at TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_idem ON trade_jobs(idempotency_key);
CREATE INDEX IF NOT EXISTS idx_jobs_claim ON trade_jobs(status, priority, run_after);

CREATE TABLE IF NOT EXISTS positions (
    id TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL,
    strategy_id INTEGER,
    chain TEXT NOT NULL,
    token_mint TEXT NOT NULL,
    token_symbol TEXT,
    entry_execution_id INTEGER NOT NULL,
    entry_tx_sig TEXT,
    entry_cost_sol REAL NOT NULL,
    entry_price REAL NOT NULL,
    size_tokens REAL NOT NULL,
    peak_price REAL NOT NULL,
    current_price REAL NOT NULL,
    lifecycle_state TEXT NOT NULL DEFAULT 'PRE_GRADUATION',
    pricing_source TEXT NOT NULL DEFAULT 'BONDING_CURVE',
    trigger_state TEXT NOT NULL DEFAULT 'MONITORING',
    status TEXT NOT NULL DEFAULT 'ACTIVE',
    bonding_curve TEXT,
    pool_address TEXT,
    opened_at TEXT NOT NULL,
    closed_at TEXT,
    updated_at TEXT NOT NULL,
    FOREIGN KEY (entry_execution_id) REFERENCES executions(id)
);
CREATE INDEX IF NOT EXISTS idx_positions_user ON positions(user_id, status);
CREATE INDEX IF NOT EXISTS idx_positions_watch ON positions(status, trigger_state, lifecycle_state);

CREATE TABLE IF NOT EXISTS safety_controls (
    scope TEXT PRIMARY KEY,
    trading_paused INTEGER NOT NULL DEFAULT 0,
    auto_execute_enabled INTEGER NOT NULL DEFAULT 1,
    manual_trading_enabled INTEGER NOT NULL DEFAULT 1,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    circuit_breaker_threshold INTEGER NOT NULL DEFAULT 5,
    circuit_open_until TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cooldowns (
    chain TEXT NOT NULL,
    kind TEXT NOT NULL,
    target TEXT NOT NULL,
    until TEXT NOT NULL,
    PRIMARY KEY (chain, kind, target)
);

CREATE TABLE IF NOT EXISTS notifications (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id INTEGER NOT NULL,
    type TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    delivered_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_notifications_pending ON notifications(delivered_at, created_at);

CREATE TABLE IF NOT EXISTS fee_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    execution_id INTEGER NOT NULL,
    gross_sol REAL NOT NULL,
    fee_sol REAL NOT NULL,
    net_sol REAL NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (execution_id) REFERENCES executions(id)
);
"#;

/// Cloneable handle over a single SQLite connection. Each process opens its
/// own handle; cross-process exclusion comes from SQLite, not from this lock.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path))?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        info!("Database ready at {}", path);
        Ok(db)
    }

    /// In-memory database for unit tests that don't need cross-handle
    /// visibility.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize schema")?;
        // Seed the global safety row so reads have something to find.
        conn.execute(
            "INSERT OR IGNORE INTO safety_controls
             (scope, trading_paused, auto_execute_enabled, manual_trading_enabled,
              consecutive_failures, circuit_breaker_threshold, updated_at)
             VALUES ('GLOBAL', 0, 1, 1, 0, 5, ?1)",
            [now_ts()],
        )?;
        Ok(())
    }

    /// Raw connection access for maintenance tooling and tests. Production
    /// code paths go through the procedures below.
    pub fn lock(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }
}

/// Fixed-width RFC3339 (UTC, microseconds). Lexicographic order equals
/// chronological order, which the claim/expiry queries rely on.
pub fn now_ts() -> String {
    to_ts(&Utc::now())
}

pub fn to_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Malformed rows sort before everything rather than panicking a worker.
pub fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

pub fn parse_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|v| parse_ts(&v))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_are_fixed_width_and_ordered() {
        let a = to_ts(&Utc::now());
        let b = to_ts(&(Utc::now() + chrono::Duration::seconds(1)));
        assert_eq!(a.len(), b.len());
        assert!(a < b);
    }

    #[test]
    fn test_parse_ts_round_trip() {
        let now = Utc::now();
        let parsed = parse_ts(&to_ts(&now));
        assert!((parsed - now).num_microseconds().unwrap().abs() < 2);
    }

    #[test]
    fn test_schema_initializes_twice() {
        let (db, _dir, path) = test_util::temp_db();
        drop(db);
        // Re-open over the same file must not fail on existing tables
        let db2 = Database::open(&path).unwrap();
        let n: i64 = db2
            .lock()
            .query_row("SELECT COUNT(*) FROM safety_controls", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }
}
