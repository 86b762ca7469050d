//! Callback matcher
//! Mission: the chat layer's dynamic callback strings become typed intents
//! here; the core never consumes the raw string. The callback's event id is
//! what makes manual trades idempotent, so it rides along untouched.

#[derive(Debug, Clone, PartialEq)]
pub enum CallbackIntent {
    BuyToken { mint: String, amount_sol: f64 },
    SellPosition { position_id: String, percent: f64 },
    ToggleStrategy { strategy_id: i64, enable: bool },
    PauseTrading,
    ResumeTrading,
    ShowPosition { position_id: String },
    Cancel,
}

/// One callback interaction as delivered by the chat platform. The
/// `external_event_id` is unique per user tap.
#[derive(Debug, Clone)]
pub struct CallbackEvent {
    pub external_event_id: String,
    pub chat_id: String,
    pub data: String,
}

/// Parse `data` into an intent. Unknown shapes yield `None`; the chat layer
/// answers those with a refresh, never the core.
pub fn parse_callback(data: &str) -> Option<CallbackIntent> {
    let mut parts = data.split(':');
    match parts.next()? {
        "buy" => {
            let mint = parts.next()?.to_string();
            let amount_sol: f64 = parts.next()?.parse().ok()?;
            if mint.is_empty() || amount_sol <= 0.0 || !amount_sol.is_finite() {
                return None;
            }
            Some(CallbackIntent::BuyToken { mint, amount_sol })
        }
        "sell" => {
            let position_id = parts.next()?.to_string();
            let percent: f64 = match parts.next() {
                None => 100.0,
                Some(p) => p.parse().ok()?,
            };
            if position_id.is_empty() || !(0.0..=100.0).contains(&percent) || percent == 0.0 {
                return None;
            }
            Some(CallbackIntent::SellPosition {
                position_id,
                percent,
            })
        }
        "strategy" => {
            let strategy_id: i64 = parts.next()?.parse().ok()?;
            let enable = match parts.next()? {
                "on" => true,
                "off" => false,
                _ => return None,
            };
            Some(CallbackIntent::ToggleStrategy {
                strategy_id,
                enable,
            })
        }
        "pause" => Some(CallbackIntent::PauseTrading),
        "resume" => Some(CallbackIntent::ResumeTrading),
        "position" => Some(CallbackIntent::ShowPosition {
            position_id: parts.next()?.to_string(),
        }),
        "cancel" => Some(CallbackIntent::Cancel),
        _ => None,
    }
}
