//! Execution ledger procedures
//! Mission: `reserve_trade_budget` is the single gate every trade passes
//! through. One idempotency key, one row, ever.

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use super::{now_ts, parse_ts, parse_ts_opt, safety, Database};
use crate::errors::ErrorCode;
use crate::models::{Chain, Execution, ExecutionStatus, TradeAction, TradeMode};

/// Result of a reservation attempt. `allowed=false` with an `execution_id`
/// means the key was already executed; callers treat that as success.
#[derive(Debug, Clone)]
pub struct ReserveOutcome {
    pub allowed: bool,
    pub reason: Option<String>,
    pub execution_id: Option<i64>,
}

impl ReserveOutcome {
    fn denied(reason: &str) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
            execution_id: None,
        }
    }

    pub fn already_executed(&self) -> bool {
        !self.allowed && self.reason.as_deref() == Some("Already executed")
    }
}

pub(crate) fn immediate_tx<T>(
    conn: &Connection,
    f: impl FnOnce(&Connection) -> Result<T>,
) -> Result<T> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    match f(conn) {
        Ok(v) => {
            conn.execute_batch("COMMIT")?;
            Ok(v)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

impl Database {
    /// Atomically reserve budget for a trade intent and open its ledger row.
    ///
    /// Denies without inserting when: the key already exists (returns the
    /// existing execution id), safety controls forbid the mode, the circuit
    /// is open, or the per-user / per-strategy budget is insufficient.
    #[allow(clippy::too_many_arguments)]
    pub fn reserve_trade_budget(
        &self,
        mode: TradeMode,
        user_id: i64,
        strategy_id: Option<i64>,
        chain: Chain,
        action: TradeAction,
        token_mint: &str,
        amount_sol: f64,
        slippage_bps: u32,
        idempotency_key: &str,
    ) -> Result<ReserveOutcome> {
        let conn = self.lock();
        immediate_tx(&conn, |conn| {
            // 1. Idempotency short-circuit: a second attempt with the same
            //    key returns the existing row, never creates one.
            let existing: Option<i64> = conn
                .query_row(
                    "SELECT id FROM executions WHERE idempotency_key = ?1",
                    [idempotency_key],
                    |r| r.get(0),
                )
                .optional()?;
            if let Some(id) = existing {
                return Ok(ReserveOutcome {
                    allowed: false,
                    reason: Some("Already executed".to_string()),
                    execution_id: Some(id),
                });
            }

            // 2. Safety gates, global then per-user. A read error aborts the
            //    transaction, which denies by construction.
            let now = Utc::now();
            let global = safety::read_controls_in_tx(conn, "GLOBAL")?;
            if global.trading_paused {
                return Ok(ReserveOutcome::denied("Trading paused"));
            }
            if global.circuit_open(now) {
                return Ok(ReserveOutcome::denied("Circuit breaker open"));
            }
            match mode {
                TradeMode::Auto if !global.auto_execute_enabled => {
                    return Ok(ReserveOutcome::denied("Auto trading disabled"));
                }
                TradeMode::Manual if !global.manual_trading_enabled => {
                    return Ok(ReserveOutcome::denied("Manual trading disabled"));
                }
                _ => {}
            }
            if let Some(user) = safety::read_controls_opt_in_tx(conn, &user_id.to_string())? {
                if user.trading_paused {
                    return Ok(ReserveOutcome::denied("Trading paused for user"));
                }
                if user.circuit_open(now) {
                    return Ok(ReserveOutcome::denied("Circuit breaker open for user"));
                }
                match mode {
                    TradeMode::Auto if !user.auto_execute_enabled => {
                        return Ok(ReserveOutcome::denied("Auto trading disabled for user"));
                    }
                    TradeMode::Manual if !user.manual_trading_enabled => {
                        return Ok(ReserveOutcome::denied("Manual trading disabled for user"));
                    }
                    _ => {}
                }
            }

            // 3. Budget. Buys spend; sells only reduce exposure.
            if action == TradeAction::Buy {
                if let Some(sid) = strategy_id {
                    if let Some(denial) = strategy_budget_denial(conn, sid, amount_sol)? {
                        return Ok(ReserveOutcome::denied(&denial));
                    }
                }
                if let Some(denial) = user_budget_denial(conn, user_id, amount_sol)? {
                    return Ok(ReserveOutcome::denied(&denial));
                }
            }

            // 4. Open the ledger row.
            let ts = now_ts();
            conn.execute(
                "INSERT INTO executions
                 (idempotency_key, mode, action, user_id, strategy_id, chain, token_mint,
                  amount_sol, fee_sol, net_amount_sol, slippage_bps, status,
                  created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0.0, ?8, ?9, 'RESERVED', ?10, ?10)",
                params![
                    idempotency_key,
                    mode.as_str(),
                    action.as_str(),
                    user_id,
                    strategy_id,
                    chain.as_str(),
                    token_mint,
                    amount_sol,
                    slippage_bps,
                    ts,
                ],
            )?;
            let id = conn.last_insert_rowid();
            info!(
                "Reserved execution {} ({} {} {} SOL, user {})",
                id,
                mode.as_str(),
                action.as_str(),
                amount_sol,
                user_id
            );
            Ok(ReserveOutcome {
                allowed: true,
                reason: None,
                execution_id: Some(id),
            })
        })
    }

    /// Advance an execution. Legal transitions only:
    /// RESERVED -> SUBMITTED -> CONFIRMED, {RESERVED, SUBMITTED} -> FAILED.
    pub fn update_execution(
        &self,
        execution_id: i64,
        status: ExecutionStatus,
        tx_signature: Option<&str>,
        tokens_out: Option<f64>,
        exec_price: Option<f64>,
        error: Option<(ErrorCode, &str)>,
    ) -> Result<()> {
        let conn = self.lock();
        immediate_tx(&conn, |conn| {
            let current: String = conn
                .query_row(
                    "SELECT status FROM executions WHERE id = ?1",
                    [execution_id],
                    |r| r.get(0),
                )
                .with_context(|| format!("Execution {} not found", execution_id))?;
            let current = ExecutionStatus::from_str(&current)
                .with_context(|| format!("Execution {} has unknown status", execution_id))?;

            let legal = matches!(
                (current, status),
                (ExecutionStatus::Reserved, ExecutionStatus::Submitted)
                    | (ExecutionStatus::Submitted, ExecutionStatus::Confirmed)
                    | (ExecutionStatus::Reserved, ExecutionStatus::Failed)
                    | (ExecutionStatus::Submitted, ExecutionStatus::Failed)
            );
            if !legal {
                bail!(
                    "Illegal execution transition {} -> {} (id {})",
                    current.as_str(),
                    status.as_str(),
                    execution_id
                );
            }

            let ts = now_ts();
            let completed = matches!(
                status,
                ExecutionStatus::Confirmed | ExecutionStatus::Failed
            );
            conn.execute(
                "UPDATE executions SET
                   status = ?2,
                   tx_signature = COALESCE(?3, tx_signature),
                   tokens_out = COALESCE(?4, tokens_out),
                   exec_price = COALESCE(?5, exec_price),
                   error_code = ?6,
                   error_message = ?7,
                   updated_at = ?8,
                   completed_at = CASE WHEN ?9 THEN ?8 ELSE completed_at END
                 WHERE id = ?1",
                params![
                    execution_id,
                    status.as_str(),
                    tx_signature,
                    tokens_out,
                    exec_price,
                    error.map(|(c, _)| c.as_str()),
                    error.map(|(_, m)| m),
                    ts,
                    completed,
                ],
            )?;
            Ok(())
        })
    }

    /// Record the fee split on the ledger row and in the fee ledger.
    /// Idempotent per execution: a resumed reservation replaces its prior
    /// fee event instead of stacking a second one.
    pub fn set_execution_fee(&self, execution_id: i64, gross: f64, fee: f64, net: f64) -> Result<()> {
        let conn = self.lock();
        immediate_tx(&conn, |conn| {
            let ts = now_ts();
            let updated = conn.execute(
                "UPDATE executions SET amount_sol = ?2, fee_sol = ?3, net_amount_sol = ?4, updated_at = ?5
                 WHERE id = ?1",
                params![execution_id, gross, fee, net, ts],
            )?;
            if updated == 0 {
                bail!("Execution {} not found", execution_id);
            }
            conn.execute(
                "DELETE FROM fee_events WHERE execution_id = ?1",
                [execution_id],
            )?;
            conn.execute(
                "INSERT INTO fee_events (execution_id, gross_sol, fee_sol, net_sol, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![execution_id, gross, fee, net, ts],
            )?;
            Ok(())
        })
    }

    pub fn get_execution(&self, execution_id: i64) -> Result<Execution> {
        let conn = self.lock();
        let exec = conn
            .query_row(
                "SELECT id, idempotency_key, mode, action, user_id, strategy_id, chain,
                        token_mint, amount_sol, fee_sol, net_amount_sol, slippage_bps,
                        tx_signature, status, error_code, error_message,
                        created_at, updated_at, completed_at
                 FROM executions WHERE id = ?1",
                [execution_id],
                map_execution_row,
            )
            .with_context(|| format!("Execution {} not found", execution_id))?;
        Ok(exec)
    }

    pub fn get_execution_by_key(&self, idempotency_key: &str) -> Result<Option<Execution>> {
        let conn = self.lock();
        let exec = conn
            .query_row(
                "SELECT id, idempotency_key, mode, action, user_id, strategy_id, chain,
                        token_mint, amount_sol, fee_sol, net_amount_sol, slippage_bps,
                        tx_signature, status, error_code, error_message,
                        created_at, updated_at, completed_at
                 FROM executions WHERE idempotency_key = ?1",
                [idempotency_key],
                map_execution_row,
            )
            .optional()?;
        Ok(exec)
    }

    /// Maintenance: executions stuck in RESERVED/SUBMITTED past the grace
    /// window never got a confirmation and are failed with a distinguishing
    /// code. Returns the affected ids.
    pub fn fail_stuck_executions(&self, grace_minutes: i64) -> Result<Vec<i64>> {
        let cutoff = super::to_ts(&(Utc::now() - Duration::minutes(grace_minutes)));
        let conn = self.lock();
        immediate_tx(&conn, |conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM executions
                 WHERE status IN ('RESERVED', 'SUBMITTED') AND updated_at < ?1",
            )?;
            let ids: Vec<i64> = stmt
                .query_map([&cutoff], |r| r.get(0))?
                .collect::<std::result::Result<_, _>>()?;
            drop(stmt);

            let ts = now_ts();
            for id in &ids {
                conn.execute(
                    "UPDATE executions SET status = 'FAILED', error_code = ?2,
                       error_message = 'No confirmation observed before grace window',
                       updated_at = ?3, completed_at = ?3
                     WHERE id = ?1",
                    params![id, ErrorCode::Abandoned.as_str(), ts],
                )?;
                warn!("Execution {} abandoned after {}m grace", id, grace_minutes);
            }
            Ok(ids)
        })
    }

    /// Ledger-vs-fee-events reconciliation hook used by tests and ops
    /// tooling: total fees recorded per execution must match the row.
    pub fn fee_ledger_total(&self, execution_id: i64) -> Result<f64> {
        let conn = self.lock();
        let total: f64 = conn.query_row(
            "SELECT COALESCE(SUM(fee_sol), 0.0) FROM fee_events WHERE execution_id = ?1",
            [execution_id],
            |r| r.get(0),
        )?;
        Ok(total)
    }
}

fn map_execution_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Execution> {
    Ok(Execution {
        id: row.get(0)?,
        idempotency_key: row.get(1)?,
        mode: TradeMode::from_str(&row.get::<_, String>(2)?).unwrap_or(TradeMode::Manual),
        action: TradeAction::from_str(&row.get::<_, String>(3)?).unwrap_or(TradeAction::Buy),
        user_id: row.get(4)?,
        strategy_id: row.get(5)?,
        chain: Chain::from_str(&row.get::<_, String>(6)?).unwrap_or(Chain::Solana),
        token_mint: row.get(7)?,
        amount_sol: row.get(8)?,
        fee_sol: row.get(9)?,
        net_amount_sol: row.get(10)?,
        slippage_bps: row.get(11)?,
        tx_signature: row.get(12)?,
        status: ExecutionStatus::from_str(&row.get::<_, String>(13)?)
            .unwrap_or(ExecutionStatus::Failed),
        error_code: row.get(14)?,
        error_message: row.get(15)?,
        created_at: parse_ts(&row.get::<_, String>(16)?),
        updated_at: parse_ts(&row.get::<_, String>(17)?),
        completed_at: parse_ts_opt(row.get(18)?),
    })
}

/// Per-strategy budget. Per-trade window caps the single amount; daily
/// window caps the trailing-24h cumulative spend including live
/// reservations.
fn strategy_budget_denial(
    conn: &Connection,
    strategy_id: i64,
    amount_sol: f64,
) -> Result<Option<String>> {
    let row: Option<(f64, String)> = conn
        .query_row(
            "SELECT max_sol_per_trade, budget_window FROM strategies WHERE id = ?1",
            [strategy_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let Some((max_sol, window)) = row else {
        return Ok(Some("Strategy not found".to_string()));
    };

    match window.as_str() {
        "daily" => {
            let since = super::to_ts(&(Utc::now() - Duration::hours(24)));
            let spent: f64 = conn.query_row(
                "SELECT COALESCE(SUM(amount_sol), 0.0) FROM executions
                 WHERE strategy_id = ?1 AND action = 'BUY' AND status != 'FAILED'
                   AND created_at >= ?2",
                params![strategy_id, since],
                |r| r.get(0),
            )?;
            if spent + amount_sol > max_sol {
                return Ok(Some("Strategy daily budget exceeded".to_string()));
            }
        }
        _ => {
            if amount_sol > max_sol {
                return Ok(Some("Strategy per-trade budget exceeded".to_string()));
            }
        }
    }
    Ok(None)
}

/// Per-user daily cap, if the user configured one.
fn user_budget_denial(conn: &Connection, user_id: i64, amount_sol: f64) -> Result<Option<String>> {
    let cap: Option<f64> = conn
        .query_row(
            "SELECT max_daily_sol FROM users WHERE id = ?1",
            [user_id],
            |r| r.get(0),
        )
        .optional()?
        .flatten();
    let Some(cap) = cap else { return Ok(None) };

    let since = super::to_ts(&(Utc::now() - Duration::hours(24)));
    let spent: f64 = conn.query_row(
        "SELECT COALESCE(SUM(amount_sol), 0.0) FROM executions
         WHERE user_id = ?1 AND action = 'BUY' AND status != 'FAILED'
           AND created_at >= ?2",
        params![user_id, since],
        |r| r.get(0),
    )?;
    if spent + amount_sol > cap {
        return Ok(Some("User daily budget exceeded".to_string()));
    }
    Ok(None)
}
