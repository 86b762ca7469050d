//! Typed notification constructors over the notification sink
//! Mission: users hear about outcomes in bounded, pre-translated messages.
//! A failed notification write never fails a trade.

use serde_json::json;
use tracing::warn;

use crate::db::Database;
use crate::errors::ErrorCode;
use crate::models::TradeAction;

#[derive(Clone)]
pub struct Notifier {
    db: Database,
}

impl Notifier {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn emit(&self, user_id: i64, kind: &str, payload: serde_json::Value) {
        if let Err(e) = self.db.insert_notification(user_id, kind, &payload) {
            warn!("Notification write failed ({}): {}", kind, e);
        }
    }

    pub fn buy_confirmed(
        &self,
        user_id: i64,
        mint: &str,
        net_sol: f64,
        tokens: f64,
        signature: &str,
    ) {
        self.emit(
            user_id,
            "buy_confirmed",
            json!({
                "mint": mint,
                "net_sol": net_sol,
                "tokens": tokens,
                "signature": signature,
            }),
        );
    }

    pub fn sell_confirmed(
        &self,
        user_id: i64,
        mint: &str,
        net_sol: f64,
        pnl_sol: f64,
        closed: bool,
        signature: &str,
    ) {
        self.emit(
            user_id,
            "sell_confirmed",
            json!({
                "mint": mint,
                "net_sol": net_sol,
                "pnl_sol": pnl_sol,
                "position_closed": closed,
                "signature": signature,
            }),
        );
    }

    /// Bounded translation only; raw provider strings stay in the logs.
    pub fn trade_failed(&self, user_id: i64, mint: &str, action: TradeAction, code: ErrorCode) {
        self.emit(
            user_id,
            "trade_failed",
            json!({
                "mint": mint,
                "action": action.as_str(),
                "reason": code.user_message(),
                "code": code.as_str(),
            }),
        );
    }

    /// Wallet integrity failures are security events: recorded separately
    /// and worded for the user to act on.
    pub fn security_event(&self, user_id: i64, detail: &str) {
        self.emit(
            user_id,
            "security_event",
            json!({
                "message": ErrorCode::WalletMismatch.user_message(),
                "detail": detail,
            }),
        );
    }
}
