//! Safety controls
//! Mission: pause switches and the circuit breaker, with hard fail-closed
//! reads. Every caller that cannot read the controls must behave as if
//! trading is paused and both modes are disabled.

use anyhow::Result;
use chrono::{Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{error, warn};

use super::executions::immediate_tx;
use super::{now_ts, parse_ts_opt, to_ts, Database};
use crate::models::SafetyControls;

pub(crate) fn read_controls_opt_in_tx(
    conn: &Connection,
    scope: &str,
) -> Result<Option<SafetyControls>> {
    let row = conn
        .query_row(
            "SELECT scope, trading_paused, auto_execute_enabled, manual_trading_enabled,
                    consecutive_failures, circuit_breaker_threshold, circuit_open_until
             FROM safety_controls WHERE scope = ?1",
            [scope],
            |r| {
                Ok(SafetyControls {
                    scope: r.get(0)?,
                    trading_paused: r.get::<_, i64>(1)? != 0,
                    auto_execute_enabled: r.get::<_, i64>(2)? != 0,
                    manual_trading_enabled: r.get::<_, i64>(3)? != 0,
                    consecutive_failures: r.get(4)?,
                    circuit_breaker_threshold: r.get(5)?,
                    circuit_open_until: parse_ts_opt(r.get(6)?),
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Global scope must exist (seeded at init); treat a missing row as a read
/// failure so the caller denies.
pub(crate) fn read_controls_in_tx(conn: &Connection, scope: &str) -> Result<SafetyControls> {
    read_controls_opt_in_tx(conn, scope)?
        .ok_or_else(|| anyhow::anyhow!("safety_controls row missing for scope {}", scope))
}

impl Database {
    /// Fail-closed read: any error surfaces as the restrictive value, never
    /// as an `Err`. Callers can always branch on the result directly.
    pub fn get_safety_controls(&self, scope: &str) -> SafetyControls {
        let conn = self.lock();
        match read_controls_opt_in_tx(&conn, scope) {
            Ok(Some(c)) => c,
            // A missing per-user row inherits the global defaults; a missing
            // GLOBAL row is a broken store and reads restrictive.
            Ok(None) if scope != "GLOBAL" => SafetyControls {
                scope: scope.to_string(),
                trading_paused: false,
                auto_execute_enabled: true,
                manual_trading_enabled: true,
                consecutive_failures: 0,
                circuit_breaker_threshold: 5,
                circuit_open_until: None,
            },
            Ok(None) => {
                error!("GLOBAL safety_controls row missing; reading restrictive");
                SafetyControls::restrictive(scope)
            }
            Err(e) => {
                error!("Safety controls read failed ({}); reading restrictive", e);
                SafetyControls::restrictive(scope)
            }
        }
    }

    pub fn set_global_pause(&self, paused: bool) -> Result<()> {
        self.set_pause("GLOBAL", paused)
    }

    pub fn set_user_pause(&self, user_id: i64, paused: bool) -> Result<()> {
        self.set_pause(&user_id.to_string(), paused)
    }

    fn set_pause(&self, scope: &str, paused: bool) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO safety_controls (scope, trading_paused, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(scope) DO UPDATE SET trading_paused = ?2, updated_at = ?3",
            params![scope, paused as i64, now_ts()],
        )?;
        if paused {
            warn!("Trading paused for scope {}", scope);
        }
        Ok(())
    }

    pub fn set_mode_enabled(&self, scope: &str, auto: bool, manual: bool) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO safety_controls (scope, auto_execute_enabled, manual_trading_enabled, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(scope) DO UPDATE SET
               auto_execute_enabled = ?2, manual_trading_enabled = ?3, updated_at = ?4",
            params![scope, auto as i64, manual as i64, now_ts()],
        )?;
        Ok(())
    }

    /// Circuit breaker: a terminal execution failure bumps the consecutive
    /// counter; hitting the threshold opens the circuit for `cooldown_secs`.
    pub fn record_trade_failure(&self, scope: &str, cooldown_secs: i64) -> Result<bool> {
        let conn = self.lock();
        immediate_tx(&conn, |conn| {
            let ts = now_ts();
            conn.execute(
                "INSERT INTO safety_controls (scope, consecutive_failures, updated_at)
                 VALUES (?1, 1, ?2)
                 ON CONFLICT(scope) DO UPDATE SET
                   consecutive_failures = consecutive_failures + 1, updated_at = ?2",
                params![scope, ts],
            )?;
            let (failures, threshold): (i64, i64) = conn.query_row(
                "SELECT consecutive_failures, circuit_breaker_threshold
                 FROM safety_controls WHERE scope = ?1",
                [scope],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )?;
            if threshold > 0 && failures >= threshold {
                let until = to_ts(&(Utc::now() + Duration::seconds(cooldown_secs)));
                conn.execute(
                    "UPDATE safety_controls
                     SET circuit_open_until = ?2, consecutive_failures = 0, updated_at = ?3
                     WHERE scope = ?1",
                    params![scope, until, ts],
                )?;
                warn!(
                    "Circuit breaker opened for scope {} ({}s cooldown)",
                    scope, cooldown_secs
                );
                return Ok(true);
            }
            Ok(false)
        })
    }

    /// A confirmed trade resets the consecutive-failure counter.
    pub fn record_trade_success(&self, scope: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE safety_controls SET consecutive_failures = 0, updated_at = ?2
             WHERE scope = ?1",
            params![scope, now_ts()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::temp_db;
    use super::*;

    #[test]
    fn test_fail_closed_on_broken_store() {
        let (db, _dir, _) = temp_db();
        db.lock()
            .execute_batch("DROP TABLE safety_controls")
            .unwrap();

        let c = db.get_safety_controls("GLOBAL");
        assert!(c.trading_paused);
        assert!(!c.auto_execute_enabled);
        assert!(!c.manual_trading_enabled);
    }

    #[test]
    fn test_missing_user_scope_inherits_permissive_defaults() {
        let (db, _dir, _) = temp_db();
        let c = db.get_safety_controls("42");
        assert!(!c.trading_paused);
        assert!(c.auto_execute_enabled);
    }

    #[test]
    fn test_circuit_opens_at_threshold_and_success_resets() {
        let (db, _dir, _) = temp_db();

        // Threshold is seeded at 5 for GLOBAL
        for i in 0..4 {
            assert!(!db.record_trade_failure("GLOBAL", 60).unwrap(), "i={}", i);
        }
        assert!(db.record_trade_failure("GLOBAL", 60).unwrap());

        let c = db.get_safety_controls("GLOBAL");
        assert!(c.circuit_open(Utc::now()));
        assert_eq!(c.consecutive_failures, 0);

        // A success after the cooldown keeps the counter flat
        db.record_trade_success("GLOBAL").unwrap();
        let c = db.get_safety_controls("GLOBAL");
        assert_eq!(c.consecutive_failures, 0);
    }

    #[test]
    fn test_user_pause_is_scoped() {
        let (db, _dir, _) = temp_db();
        db.set_user_pause(7, true).unwrap();
        assert!(db.get_safety_controls("7").trading_paused);
        assert!(!db.get_safety_controls("GLOBAL").trading_paused);
    }
}
