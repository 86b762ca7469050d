//! Users and wallet rows
//! Mission: idempotent user/wallet creation. The wallet generator runs only
//! for the first inserter; concurrent callers all receive the same row.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension};
use tracing::info;

use super::executions::immediate_tx;
use super::{now_ts, Database};
use crate::models::Chain;

#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: i64,
    pub chat_id: String,
    pub priority_fee_lamports: u64,
    pub default_slippage_bps: u32,
    pub max_daily_sol: Option<f64>,
}

/// A wallet row. `secret_b58` is the sealed material handed to the signer;
/// it is read per-trade and never cached.
#[derive(Debug, Clone)]
pub struct WalletRecord {
    pub id: i64,
    pub user_id: i64,
    pub chain: Chain,
    pub pubkey: String,
    pub secret_b58: String,
}

impl Database {
    pub fn get_or_create_user(&self, chat_id: &str) -> Result<UserRecord> {
        let conn = self.lock();
        immediate_tx(&conn, |conn| {
            if let Some(user) = query_user_by_chat(conn, chat_id)? {
                return Ok(user);
            }
            conn.execute(
                "INSERT INTO users (chat_id, created_at) VALUES (?1, ?2)",
                params![chat_id, now_ts()],
            )?;
            info!("Registered user for chat {}", chat_id);
            query_user_by_chat(conn, chat_id)?.context("User row vanished after insert")
        })
    }

    pub fn get_user(&self, user_id: i64) -> Result<UserRecord> {
        let conn = self.lock();
        conn.query_row(
            "SELECT id, chat_id, priority_fee_lamports, default_slippage_bps, max_daily_sol
             FROM users WHERE id = ?1",
            [user_id],
            map_user_row,
        )
        .with_context(|| format!("User {} not found", user_id))
    }

    pub fn set_user_trade_prefs(
        &self,
        user_id: i64,
        priority_fee_lamports: u64,
        default_slippage_bps: u32,
        max_daily_sol: Option<f64>,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE users SET priority_fee_lamports = ?2, default_slippage_bps = ?3,
                    max_daily_sol = ?4
             WHERE id = ?1",
            params![
                user_id,
                priority_fee_lamports as i64,
                default_slippage_bps,
                max_daily_sol
            ],
        )?;
        Ok(())
    }

    /// Idempotent wallet creation, gated by `(user_id, chain)`. The
    /// generator is invoked only when no row exists yet; it runs inside the
    /// insert transaction so a concurrent caller waits and then reads the
    /// winner's row instead of generating a second key.
    pub fn get_or_create_user_wallet(
        &self,
        user_id: i64,
        chain: Chain,
        generator: impl FnOnce() -> Result<(String, String)>,
    ) -> Result<WalletRecord> {
        let conn = self.lock();
        immediate_tx(&conn, |conn| {
            if let Some(wallet) = query_wallet(conn, user_id, chain)? {
                return Ok(wallet);
            }
            let (pubkey, secret_b58) = generator()?;
            conn.execute(
                "INSERT INTO wallets (user_id, chain, pubkey, secret_b58, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(user_id, chain) DO NOTHING",
                params![user_id, chain.as_str(), pubkey, secret_b58, now_ts()],
            )?;
            info!("Created {} wallet for user {}", chain.as_str(), user_id);
            query_wallet(conn, user_id, chain)?.context("Wallet row vanished after insert")
        })
    }

    /// Per-trade wallet read. No caching: key material never sits in a
    /// shared map.
    pub fn get_user_wallet(&self, user_id: i64, chain: Chain) -> Result<Option<WalletRecord>> {
        let conn = self.lock();
        query_wallet(&conn, user_id, chain)
    }
}

fn map_user_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<UserRecord> {
    Ok(UserRecord {
        id: r.get(0)?,
        chat_id: r.get(1)?,
        priority_fee_lamports: r.get::<_, i64>(2)? as u64,
        default_slippage_bps: r.get(3)?,
        max_daily_sol: r.get(4)?,
    })
}

fn query_user_by_chat(conn: &rusqlite::Connection, chat_id: &str) -> Result<Option<UserRecord>> {
    let row = conn
        .query_row(
            "SELECT id, chat_id, priority_fee_lamports, default_slippage_bps, max_daily_sol
             FROM users WHERE chat_id = ?1",
            [chat_id],
            map_user_row,
        )
        .optional()?;
    Ok(row)
}

fn query_wallet(
    conn: &rusqlite::Connection,
    user_id: i64,
    chain: Chain,
) -> Result<Option<WalletRecord>> {
    let row = conn
        .query_row(
            "SELECT id, user_id, chain, pubkey, secret_b58
             FROM wallets WHERE user_id = ?1 AND chain = ?2",
            params![user_id, chain.as_str()],
            |r| {
                Ok(WalletRecord {
                    id: r.get(0)?,
                    user_id: r.get(1)?,
                    chain: Chain::from_str(&r.get::<_, String>(2)?).unwrap_or(Chain::Solana),
                    pubkey: r.get(3)?,
                    secret_b58: r.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}
