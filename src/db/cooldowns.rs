//! Cooldown keys
//! Mission: per-(user, mint) post-buy silence and per-user rate limits,
//! persisted so every process observes the same windows.

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use tracing::debug;

use super::{now_ts, parse_ts, to_ts, Database};
use crate::models::Chain;

/// Cooldown kinds are plain tags; the pair (kind, target) identifies the
/// throttled thing.
pub const COOLDOWN_POST_BUY: &str = "post_buy";
pub const COOLDOWN_USER_RATE: &str = "user_rate";

impl Database {
    pub fn set_cooldown(
        &self,
        chain: Chain,
        kind: &str,
        target: &str,
        until: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO cooldowns (chain, kind, target, until) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(chain, kind, target) DO UPDATE SET until = MAX(until, ?4)",
            params![chain.as_str(), kind, target, to_ts(&until)],
        )?;
        debug!("Cooldown {} on {} until {}", kind, target, until);
        Ok(())
    }

    pub fn cooldown_active(&self, chain: Chain, kind: &str, target: &str) -> Result<bool> {
        let conn = self.lock();
        let until: Option<String> = conn
            .query_row(
                "SELECT until FROM cooldowns WHERE chain = ?1 AND kind = ?2 AND target = ?3",
                params![chain.as_str(), kind, target],
                |r| r.get(0),
            )
            .ok();
        Ok(matches!(until, Some(u) if parse_ts(&u) > Utc::now()))
    }

    /// Maintenance: drop past-due rows.
    pub fn purge_expired_cooldowns(&self) -> Result<usize> {
        let conn = self.lock();
        let n = conn.execute("DELETE FROM cooldowns WHERE until < ?1", [now_ts()])?;
        Ok(n)
    }
}
