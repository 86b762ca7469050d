//! Position store
//! Mission: lifecycle is monotonic, graduation is atomic, and the trigger
//! flag is a one-way gate that serializes exit evaluation per position.

use anyhow::{bail, Context, Result};
use rusqlite::{params, OptionalExtension};
use tracing::{debug, info};
use uuid::Uuid;

use super::executions::immediate_tx;
use super::{now_ts, parse_ts, Database};
use crate::models::{
    Chain, LifecycleState, Position, PositionStatus, PricingSource, TriggerState,
};

/// Everything needed to open a position off a confirmed buy.
#[derive(Debug, Clone)]
pub struct OpenPosition {
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
    pub bonding_curve: Option<String>,
}

/// What a confirmed sell did to the position.
#[derive(Debug, Clone, PartialEq)]
pub struct SellOutcome {
    pub closed: bool,
    pub sold_tokens: f64,
    pub remaining_tokens: f64,
}

impl Database {
    /// Open a position for a confirmed buy. Always starts pre-graduation on
    /// curve pricing with the peak pinned to entry.
    pub fn open_position(&self, p: &OpenPosition) -> Result<Position> {
        let id = Uuid::new_v4().to_string();
        let ts = now_ts();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO positions
             (id, user_id, strategy_id, chain, token_mint, token_symbol,
              entry_execution_id, entry_tx_sig, entry_cost_sol, entry_price, size_tokens,
              peak_price, current_price, lifecycle_state, pricing_source, trigger_state,
              status, bonding_curve, opened_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
                     ?10, ?10, 'PRE_GRADUATION', 'BONDING_CURVE', 'MONITORING',
                     'ACTIVE', ?12, ?13, ?13)",
            params![
                id,
                p.user_id,
                p.strategy_id,
                p.chain.as_str(),
                p.token_mint,
                p.token_symbol,
                p.entry_execution_id,
                p.entry_tx_sig,
                p.entry_cost_sol,
                p.entry_price,
                p.size_tokens,
                p.bonding_curve,
                ts,
            ],
        )?;
        info!(
            "Opened position {} for user {} ({} tokens of {})",
            id, p.user_id, p.size_tokens, p.token_mint
        );
        drop(conn);
        self.get_position(&id)
    }

    pub fn get_position(&self, id: &str) -> Result<Position> {
        let conn = self.lock();
        conn.query_row(
            &format!("{} WHERE id = ?1", SELECT_POSITION),
            [id],
            map_position_row,
        )
        .with_context(|| format!("Position {} not found", id))
    }

    /// Positions the exit poller should look at: active, unarmed, not
    /// already closed out of their lifecycle.
    pub fn list_exit_candidates(&self) -> Result<Vec<Position>> {
        self.query_positions(
            "WHERE status = 'ACTIVE' AND trigger_state = 'MONITORING'
               AND lifecycle_state != 'CLOSED'",
        )
    }

    pub fn list_pre_graduation_positions(&self) -> Result<Vec<Position>> {
        self.query_positions("WHERE status = 'ACTIVE' AND lifecycle_state = 'PRE_GRADUATION'")
    }

    pub fn list_positions_for_user(&self, user_id: i64) -> Result<Vec<Position>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE user_id = ?1 ORDER BY opened_at DESC",
            SELECT_POSITION
        ))?;
        let rows = stmt
            .query_map([user_id], map_position_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn query_positions(&self, where_clause: &str) -> Result<Vec<Position>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!("{} {}", SELECT_POSITION, where_clause))?;
        let rows = stmt
            .query_map([], map_position_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Record an observed price. The peak ratchets: it never decreases.
    pub fn update_market_price(&self, id: &str, price: f64) -> Result<()> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE positions SET
               current_price = ?2,
               peak_price = MAX(peak_price, ?2),
               updated_at = ?3
             WHERE id = ?1",
            params![id, price, now_ts()],
        )?;
        if updated == 0 {
            bail!("Position {} not found", id);
        }
        Ok(())
    }

    /// Arm the exit gate. Succeeds for exactly one caller: the conditional
    /// WHERE loses for anyone who arrives after the first writer.
    pub fn arm_trigger(&self, id: &str, state: TriggerState) -> Result<bool> {
        if state == TriggerState::Monitoring {
            bail!("arm_trigger cannot reset to MONITORING");
        }
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE positions SET trigger_state = ?2, updated_at = ?3
             WHERE id = ?1 AND trigger_state = 'MONITORING' AND status = 'ACTIVE'",
            params![id, state.as_str(), now_ts()],
        )?;
        Ok(updated == 1)
    }

    /// Return an armed position to monitoring (failed exit, or a partial
    /// sell leaving a remainder to watch).
    pub fn reset_trigger(&self, id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE positions SET trigger_state = 'MONITORING', status = 'ACTIVE', updated_at = ?2
             WHERE id = ?1 AND status != 'CLOSED'",
            params![id, now_ts()],
        )?;
        Ok(())
    }

    pub fn set_position_closing(&self, id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE positions SET status = 'CLOSING', updated_at = ?2
             WHERE id = ?1 AND status = 'ACTIVE'",
            params![id, now_ts()],
        )?;
        Ok(())
    }

    /// Graduation: PRE -> POST and curve -> AMM pricing in one conditional
    /// update. True for exactly one caller per position, ever.
    pub fn graduate_position_atomically(&self, id: &str, pool_address: &str) -> Result<bool> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE positions SET
               lifecycle_state = 'POST_GRADUATION',
               pricing_source = 'AMM_POOL',
               pool_address = ?2,
               updated_at = ?3
             WHERE id = ?1 AND lifecycle_state = 'PRE_GRADUATION'",
            params![id, pool_address, now_ts()],
        )?;
        if updated == 1 {
            info!("Position {} graduated to AMM pool {}", id, pool_address);
        }
        Ok(updated == 1)
    }

    /// Apply a confirmed sell. Full sells close the position; partial sells
    /// (moon bag) scale down size and cost basis and re-arm monitoring.
    pub fn apply_sell(&self, id: &str, sell_percent: f64) -> Result<SellOutcome> {
        let pct = sell_percent.clamp(0.0, 100.0);
        let conn = self.lock();
        immediate_tx(&conn, |conn| {
            let (size, status): (f64, String) = conn
                .query_row(
                    "SELECT size_tokens, status FROM positions WHERE id = ?1",
                    [id],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?
                .with_context(|| format!("Position {} not found", id))?;
            if status == "CLOSED" {
                bail!("Position {} already closed", id);
            }

            let sold = size * pct / 100.0;
            let remaining = size - sold;
            let ts = now_ts();
            let full = pct >= 100.0 - 1e-9;

            if full {
                conn.execute(
                    "UPDATE positions SET
                       size_tokens = 0.0, status = 'CLOSED', lifecycle_state = 'CLOSED',
                       trigger_state = 'TRIGGERED', closed_at = ?2, updated_at = ?2
                     WHERE id = ?1",
                    params![id, ts],
                )?;
                info!("Position {} closed ({} tokens sold)", id, sold);
            } else {
                let keep = remaining / size;
                conn.execute(
                    "UPDATE positions SET
                       size_tokens = ?2,
                       entry_cost_sol = entry_cost_sol * ?3,
                       trigger_state = 'MONITORING', status = 'ACTIVE', updated_at = ?4
                     WHERE id = ?1",
                    params![id, remaining, keep, ts],
                )?;
                debug!(
                    "Position {} partial sell: {} sold, {} remaining",
                    id, sold, remaining
                );
            }
            Ok(SellOutcome {
                closed: full,
                sold_tokens: sold,
                remaining_tokens: remaining,
            })
        })
    }
}

const SELECT_POSITION: &str = "SELECT id, user_id, strategy_id, chain, token_mint, token_symbol,
        entry_execution_id, entry_tx_sig, entry_cost_sol, entry_price, size_tokens,
        peak_price, current_price, lifecycle_state, pricing_source, trigger_state,
        status, bonding_curve, pool_address, opened_at, closed_at
 FROM positions";

fn map_position_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Position> {
    Ok(Position {
        id: r.get(0)?,
        user_id: r.get(1)?,
        strategy_id: r.get(2)?,
        chain: Chain::from_str(&r.get::<_, String>(3)?).unwrap_or(Chain::Solana),
        token_mint: r.get(4)?,
        token_symbol: r.get(5)?,
        entry_execution_id: r.get(6)?,
        entry_tx_sig: r.get(7)?,
        entry_cost_sol: r.get(8)?,
        entry_price: r.get(9)?,
        size_tokens: r.get(10)?,
        peak_price: r.get(11)?,
        current_price: r.get(12)?,
        lifecycle_state: LifecycleState::from_str(&r.get::<_, String>(13)?)
            .unwrap_or(LifecycleState::Closed),
        pricing_source: PricingSource::from_str(&r.get::<_, String>(14)?)
            .unwrap_or(PricingSource::BondingCurve),
        trigger_state: TriggerState::from_str(&r.get::<_, String>(15)?)
            .unwrap_or(TriggerState::Triggered),
        status: PositionStatus::from_str(&r.get::<_, String>(16)?)
            .unwrap_or(PositionStatus::Closed),
        bonding_curve: r.get(17)?,
        pool_address: r.get(18)?,
        opened_at: parse_ts(&r.get::<_, String>(19)?),
        closed_at: r.get::<_, Option<String>>(20)?.as_deref().map(parse_ts),
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_util::temp_db;
    use super::*;

    fn seed_position(db: &Database) -> Position {
        let user = db.get_or_create_user("chat-pos").unwrap().id;
        let reserve = db
            .reserve_trade_budget(
                crate::models::TradeMode::Manual,
                user,
                None,
                Chain::Solana,
                crate::models::TradeAction::Buy,
                "MintAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
                0.5,
                100,
                &format!("pos-key-{}", Uuid::new_v4()),
            )
            .unwrap();
        db.open_position(&OpenPosition {
            user_id: user,
            strategy_id: None,
            chain: Chain::Solana,
            token_mint: "MintAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".to_string(),
            token_symbol: Some("TEST".to_string()),
            entry_execution_id: reserve.execution_id.unwrap(),
            entry_tx_sig: Some("sig".to_string()),
            entry_cost_sol: 0.495,
            entry_price: 1.0e-6,
            size_tokens: 495_000.0,
            bonding_curve: Some("CurveAddr".to_string()),
        })
        .unwrap()
    }

    #[test]
    fn test_open_position_defaults() {
        let (db, _dir, _) = temp_db();
        let p = seed_position(&db);
        assert_eq!(p.lifecycle_state, LifecycleState::PreGraduation);
        assert_eq!(p.pricing_source, PricingSource::BondingCurve);
        assert_eq!(p.trigger_state, TriggerState::Monitoring);
        assert_eq!(p.peak_price, p.entry_price);
    }

    #[test]
    fn test_peak_price_only_ratchets_up() {
        let (db, _dir, _) = temp_db();
        let p = seed_position(&db);

        db.update_market_price(&p.id, 2.0e-6).unwrap();
        db.update_market_price(&p.id, 1.2e-6).unwrap();

        let p = db.get_position(&p.id).unwrap();
        assert_eq!(p.current_price, 1.2e-6);
        assert_eq!(p.peak_price, 2.0e-6);
        assert!(p.peak_price >= p.entry_price);
    }

    #[test]
    fn test_arm_trigger_is_single_winner() {
        let (db, _dir, _) = temp_db();
        let p = seed_position(&db);

        assert!(db.arm_trigger(&p.id, TriggerState::Triggered).unwrap());
        // Second arm attempt loses: the gate is already closed
        assert!(!db.arm_trigger(&p.id, TriggerState::Triggered).unwrap());

        // And the poller no longer sees it
        assert!(db.list_exit_candidates().unwrap().is_empty());
    }

    #[test]
    fn test_arm_trigger_concurrent_single_winner() {
        let (db, _dir, path) = temp_db();
        let p = seed_position(&db);

        let mut handles = Vec::new();
        for _ in 0..6 {
            let path = path.clone();
            let id = p.id.clone();
            handles.push(std::thread::spawn(move || {
                let db = Database::open(&path).unwrap();
                db.arm_trigger(&id, TriggerState::Triggered).unwrap()
            }));
        }
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(winners, 1, "exactly one evaluator may arm the trigger");

        let p = db.get_position(&p.id).unwrap();
        assert_eq!(p.trigger_state, TriggerState::Triggered);
    }

    #[test]
    fn test_graduation_happens_exactly_once() {
        let (db, _dir, path) = temp_db();
        let p = seed_position(&db);

        let mut handles = Vec::new();
        for _ in 0..6 {
            let path = path.clone();
            let id = p.id.clone();
            handles.push(std::thread::spawn(move || {
                let db = Database::open(&path).unwrap();
                db.graduate_position_atomically(&id, "PoolAddr").unwrap()
            }));
        }
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(winners, 1);

        let p = db.get_position(&p.id).unwrap();
        assert_eq!(p.lifecycle_state, LifecycleState::PostGraduation);
        assert_eq!(p.pricing_source, PricingSource::AmmPool);
        assert_eq!(p.pool_address.as_deref(), Some("PoolAddr"));
    }

    #[test]
    fn test_lifecycle_never_regresses() {
        let (db, _dir, _) = temp_db();
        let p = seed_position(&db);
        assert!(db.graduate_position_atomically(&p.id, "Pool1").unwrap());
        // A second graduation (e.g. a concurrent monitor) is a no-op
        assert!(!db.graduate_position_atomically(&p.id, "Pool2").unwrap());
        let p = db.get_position(&p.id).unwrap();
        assert_eq!(p.pool_address.as_deref(), Some("Pool1"));
    }

    #[test]
    fn test_full_sell_closes_position() {
        let (db, _dir, _) = temp_db();
        let p = seed_position(&db);
        let out = db.apply_sell(&p.id, 100.0).unwrap();
        assert!(out.closed);
        assert_eq!(out.remaining_tokens, 0.0);

        let p = db.get_position(&p.id).unwrap();
        assert_eq!(p.status, PositionStatus::Closed);
        assert_eq!(p.lifecycle_state, LifecycleState::Closed);
        assert!(p.closed_at.is_some());

        // Closed positions cannot be sold again or graduated
        assert!(db.apply_sell(&p.id, 100.0).is_err());
        assert!(!db.graduate_position_atomically(&p.id, "Pool").unwrap());
    }

    #[test]
    fn test_partial_sell_keeps_moon_bag_monitored() {
        let (db, _dir, _) = temp_db();
        let p = seed_position(&db);
        db.arm_trigger(&p.id, TriggerState::Triggered).unwrap();

        let out = db.apply_sell(&p.id, 75.0).unwrap();
        assert!(!out.closed);
        assert!((out.sold_tokens - 371_250.0).abs() < 1e-6);
        assert!((out.remaining_tokens - 123_750.0).abs() < 1e-6);

        let p2 = db.get_position(&p.id).unwrap();
        assert_eq!(p2.status, PositionStatus::Active);
        assert_eq!(p2.trigger_state, TriggerState::Monitoring);
        assert!((p2.size_tokens - 123_750.0).abs() < 1e-6);
        // Cost basis scales with the remainder
        assert!((p2.entry_cost_sol - 0.495 * 0.25).abs() < 1e-9);
    }
}
