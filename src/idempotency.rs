//! Idempotency key derivation
//! Mission: a trade intent's semantic identity becomes one stable
//! content-addressed key; the executions ledger enforces at-most-once on it.
//!
//! Keys are SHA-256 over a tag plus length-delimited field bytes, rendered as
//! fixed-width lowercase hex (64 chars / 32 bytes). Amounts are folded in as
//! lamport-precision integers so float formatting can never split a key.

use sha2::{Digest, Sha256};

use crate::models::{Chain, ExitTrigger};

const LAMPORTS_PER_SOL: f64 = 1_000_000_000.0;

fn hash_fields(tag: &str, fields: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tag.as_bytes());
    for field in fields {
        // Length prefix keeps ("ab","c") distinct from ("a","bc")
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field);
    }
    hex::encode(hasher.finalize())
}

fn sol_to_lamports(amount_sol: f64) -> u64 {
    (amount_sol * LAMPORTS_PER_SOL).round() as u64
}

/// Manual buy: keyed on the chat callback id, so one tap is one trade no
/// matter how many workers see it.
pub fn manual_buy_key(
    chain: Chain,
    user_id: i64,
    mint: &str,
    slippage_bps: u32,
    amount_sol: f64,
    external_event_id: &str,
) -> String {
    hash_fields(
        "MB",
        &[
            chain.as_str().as_bytes(),
            user_id.to_string().as_bytes(),
            mint.as_bytes(),
            slippage_bps.to_string().as_bytes(),
            sol_to_lamports(amount_sol).to_string().as_bytes(),
            external_event_id.as_bytes(),
        ],
    )
}

/// Auto buy: keyed on (strategy, opportunity), so the matcher can re-run over
/// the same opportunity without double-buying.
pub fn auto_buy_key(
    chain: Chain,
    strategy_id: i64,
    opportunity_id: i64,
    mint: &str,
    amount_sol: f64,
    slippage_bps: u32,
) -> String {
    hash_fields(
        "AB",
        &[
            chain.as_str().as_bytes(),
            strategy_id.to_string().as_bytes(),
            opportunity_id.to_string().as_bytes(),
            mint.as_bytes(),
            sol_to_lamports(amount_sol).to_string().as_bytes(),
            slippage_bps.to_string().as_bytes(),
        ],
    )
}

/// Exit sell: keyed on (position, trigger, percent) so the poller and the
/// event listener can both fire without producing two sells.
pub fn exit_sell_key(
    chain: Chain,
    position_id: &str,
    trigger: ExitTrigger,
    sell_percent: f64,
) -> String {
    hash_fields(
        "XS",
        &[
            chain.as_str().as_bytes(),
            position_id.as_bytes(),
            trigger.as_str().as_bytes(),
            format!("{:.2}", sell_percent).as_bytes(),
        ],
    )
}

/// Manual sell: keyed on the chat callback id.
pub fn manual_sell_key(
    chain: Chain,
    user_id: i64,
    position_id: &str,
    external_event_id: &str,
) -> String {
    hash_fields(
        "MS",
        &[
            chain.as_str().as_bytes(),
            user_id.to_string().as_bytes(),
            position_id.as_bytes(),
            external_event_id.as_bytes(),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_stable_and_fixed_width() {
        let a = manual_buy_key(Chain::Solana, 7, "MintA", 50, 0.5, "cb-1");
        let b = manual_buy_key(Chain::Solana, 7, "MintA", 50, 0.5, "cb-1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_any_field_change_changes_the_key() {
        let base = manual_buy_key(Chain::Solana, 7, "MintA", 50, 0.5, "cb-1");
        assert_ne!(base, manual_buy_key(Chain::Solana, 8, "MintA", 50, 0.5, "cb-1"));
        assert_ne!(base, manual_buy_key(Chain::Solana, 7, "MintB", 50, 0.5, "cb-1"));
        assert_ne!(base, manual_buy_key(Chain::Solana, 7, "MintA", 51, 0.5, "cb-1"));
        assert_ne!(base, manual_buy_key(Chain::Solana, 7, "MintA", 50, 0.6, "cb-1"));
        assert_ne!(base, manual_buy_key(Chain::Solana, 7, "MintA", 50, 0.5, "cb-2"));
    }

    #[test]
    fn test_shapes_never_collide() {
        // Same raw fields under different tags must produce different keys.
        let buy = manual_buy_key(Chain::Solana, 1, "M", 0, 0.0, "E");
        let sell = manual_sell_key(Chain::Solana, 1, "M", "E");
        assert_ne!(buy, sell);
    }

    #[test]
    fn test_exit_key_distinguishes_trigger_and_percent() {
        let tp = exit_sell_key(Chain::Solana, "pos-1", ExitTrigger::TakeProfit, 75.0);
        let sl = exit_sell_key(Chain::Solana, "pos-1", ExitTrigger::StopLoss, 75.0);
        let tp_full = exit_sell_key(Chain::Solana, "pos-1", ExitTrigger::TakeProfit, 100.0);
        assert_ne!(tp, sl);
        assert_ne!(tp, tp_full);
    }

    #[test]
    fn test_lamport_folding_ignores_float_noise() {
        // 0.1 + 0.2 style float drift below lamport precision must not fork keys
        let a = manual_buy_key(Chain::Solana, 1, "M", 0, 0.30000000000000004, "E");
        let b = manual_buy_key(Chain::Solana, 1, "M", 0, 0.3, "E");
        assert_eq!(a, b);
    }
}
