//! Strategy rows

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};

use super::{now_ts, Database};
use crate::models::{BudgetWindow, Chain, DiscoveryMethod, Strategy};

impl Database {
    /// Minimal insert used by tests and the settings flow; tuning fields
    /// keep their schema defaults until edited.
    pub fn insert_strategy(
        &self,
        user_id: i64,
        name: &str,
        max_sol_per_trade: f64,
        budget_window: BudgetWindow,
    ) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO strategies (user_id, name, chain, enabled, max_sol_per_trade,
                                     budget_window, created_at)
             VALUES (?1, ?2, 'solana', 1, ?3, ?4, ?5)",
            params![
                user_id,
                name,
                max_sol_per_trade,
                budget_window.as_str(),
                now_ts()
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_strategy(&self, s: &Strategy) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE strategies SET
               name = ?2, enabled = ?3, max_sol_per_trade = ?4, budget_window = ?5,
               slippage_bps = ?6, take_profit_pct = ?7, stop_loss_pct = ?8,
               max_hold_minutes = ?9, trailing_activation_pct = ?10,
               trailing_distance_pct = ?11, moon_bag_pct = ?12, min_score = ?13,
               min_initial_liquidity_sol = ?14, allowed_sources = ?15,
               denylisted_mints = ?16, denylisted_deployers = ?17
             WHERE id = ?1",
            params![
                s.id,
                s.name,
                s.enabled as i64,
                s.max_sol_per_trade,
                s.budget_window.as_str(),
                s.slippage_bps,
                s.take_profit_pct,
                s.stop_loss_pct,
                s.max_hold_minutes,
                s.trailing_activation_pct,
                s.trailing_distance_pct,
                s.moon_bag_pct,
                s.min_score,
                s.min_initial_liquidity_sol,
                serde_json::to_string(
                    &s.allowed_sources.iter().map(|m| m.as_str()).collect::<Vec<_>>()
                )?,
                serde_json::to_string(&s.denylisted_mints)?,
                serde_json::to_string(&s.denylisted_deployers)?,
            ],
        )?;
        Ok(())
    }

    pub fn set_strategy_enabled(&self, strategy_id: i64, enabled: bool) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE strategies SET enabled = ?2 WHERE id = ?1",
            params![strategy_id, enabled as i64],
        )?;
        Ok(())
    }

    pub fn get_strategy(&self, strategy_id: i64) -> Result<Strategy> {
        let conn = self.lock();
        conn.query_row(
            &format!("{} WHERE id = ?1", SELECT_STRATEGY),
            [strategy_id],
            map_strategy_row,
        )
        .with_context(|| format!("Strategy {} not found", strategy_id))
    }

    pub fn get_strategy_opt(&self, strategy_id: i64) -> Result<Option<Strategy>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_STRATEGY),
                [strategy_id],
                map_strategy_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Enabled auto strategies for a chain: the matcher's working set.
    pub fn list_enabled_strategies(&self, chain: Chain) -> Result<Vec<Strategy>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE enabled = 1 AND chain = ?1 ORDER BY id ASC",
            SELECT_STRATEGY
        ))?;
        let rows = stmt
            .query_map([chain.as_str()], map_strategy_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

const SELECT_STRATEGY: &str = "SELECT id, user_id, name, chain, enabled, max_sol_per_trade, budget_window,
        slippage_bps, take_profit_pct, stop_loss_pct, max_hold_minutes,
        trailing_activation_pct, trailing_distance_pct, moon_bag_pct, min_score,
        min_initial_liquidity_sol, allowed_sources, denylisted_mints, denylisted_deployers
 FROM strategies";

fn map_strategy_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Strategy> {
    let sources: String = r.get(16)?;
    let mints: String = r.get(17)?;
    let deployers: String = r.get(18)?;
    let sources: Vec<String> = serde_json::from_str(&sources).unwrap_or_default();
    Ok(Strategy {
        id: r.get(0)?,
        user_id: r.get(1)?,
        name: r.get(2)?,
        chain: Chain::from_str(&r.get::<_, String>(3)?).unwrap_or(Chain::Solana),
        enabled: r.get::<_, i64>(4)? != 0,
        max_sol_per_trade: r.get(5)?,
        budget_window: BudgetWindow::from_str(&r.get::<_, String>(6)?)
            .unwrap_or(BudgetWindow::PerTrade),
        slippage_bps: r.get(7)?,
        take_profit_pct: r.get(8)?,
        stop_loss_pct: r.get(9)?,
        max_hold_minutes: r.get(10)?,
        trailing_activation_pct: r.get(11)?,
        trailing_distance_pct: r.get(12)?,
        moon_bag_pct: r.get(13)?,
        min_score: r.get(14)?,
        min_initial_liquidity_sol: r.get(15)?,
        allowed_sources: sources
            .iter()
            .filter_map(|s| DiscoveryMethod::from_str(s))
            .collect(),
        denylisted_mints: serde_json::from_str(&mints).unwrap_or_default(),
        denylisted_deployers: serde_json::from_str(&deployers).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_util::temp_db;
    use super::*;

    #[test]
    fn test_strategy_round_trip() {
        let (db, _dir, _) = temp_db();
        let user = db.get_or_create_user("chat-s").unwrap().id;
        let id = db
            .insert_strategy(user, "default", 1.0, BudgetWindow::PerTrade)
            .unwrap();

        let mut s = db.get_strategy(id).unwrap();
        assert!(s.enabled);
        assert_eq!(s.allowed_sources.len(), 2);

        s.take_profit_pct = 80.0;
        s.moon_bag_pct = 25.0;
        s.allowed_sources = vec![DiscoveryMethod::Onchain];
        s.denylisted_mints = vec!["BadMint".to_string()];
        db.update_strategy(&s).unwrap();

        let s2 = db.get_strategy(id).unwrap();
        assert_eq!(s2.take_profit_pct, 80.0);
        assert_eq!(s2.moon_bag_pct, 25.0);
        assert_eq!(s2.allowed_sources, vec![DiscoveryMethod::Onchain]);
        assert_eq!(s2.denylisted_mints, vec!["BadMint".to_string()]);
    }

    #[test]
    fn test_disabled_strategies_excluded_from_matcher_set() {
        let (db, _dir, _) = temp_db();
        let user = db.get_or_create_user("chat-s2").unwrap().id;
        let a = db
            .insert_strategy(user, "on", 1.0, BudgetWindow::PerTrade)
            .unwrap();
        let b = db
            .insert_strategy(user, "off", 1.0, BudgetWindow::PerTrade)
            .unwrap();
        db.set_strategy_enabled(b, false).unwrap();

        let enabled = db.list_enabled_strategies(Chain::Solana).unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, a);
    }
}
