//! Command grammar
//! `/command [arg ...]`, with the bot-mention suffix (`/snipe@SomeBot`)
//! tolerated. Anything malformed is a typed error, never a guess.

use crate::models::Chain;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start,
    Menu,
    Wallet,
    Balance,
    Deposit,
    Withdraw,
    Positions,
    Hunt,
    Snipe {
        mint: String,
        amount_sol: f64,
        chain: Chain,
    },
    Sell,
    Settings,
    Strategy,
    History,
    Help,
    Backup,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandError {
    NotACommand,
    Unknown(String),
    BadArgs(&'static str),
}

fn mint_shaped(s: &str) -> bool {
    (32..=44).contains(&s.len())
        && bs58::decode(s)
            .into_vec()
            .map(|b| b.len() == 32)
            .unwrap_or(false)
}

pub fn parse_command(text: &str) -> Result<Command, CommandError> {
    let trimmed = text.trim();
    if !trimmed.starts_with('/') {
        return Err(CommandError::NotACommand);
    }
    let mut parts = trimmed.split_whitespace();
    let head = parts.next().unwrap_or("");
    // "/snipe@SomeBot" -> "snipe"
    let name = head[1..].split('@').next().unwrap_or("").to_lowercase();

    match name.as_str() {
        "start" => Ok(Command::Start),
        "menu" => Ok(Command::Menu),
        "wallet" => Ok(Command::Wallet),
        "balance" => Ok(Command::Balance),
        "deposit" => Ok(Command::Deposit),
        "withdraw" => Ok(Command::Withdraw),
        "positions" => Ok(Command::Positions),
        "hunt" => Ok(Command::Hunt),
        "sell" => Ok(Command::Sell),
        "settings" => Ok(Command::Settings),
        "strategy" => Ok(Command::Strategy),
        "history" => Ok(Command::History),
        "help" => Ok(Command::Help),
        "backup" => Ok(Command::Backup),
        "snipe" => {
            let mint = parts
                .next()
                .ok_or(CommandError::BadArgs("usage: /snipe <mint> <amount> <chain>"))?;
            if !mint_shaped(mint) {
                return Err(CommandError::BadArgs("mint is not a valid address"));
            }
            let amount_sol: f64 = parts
                .next()
                .and_then(|a| a.parse().ok())
                .ok_or(CommandError::BadArgs("amount must be a number"))?;
            if amount_sol <= 0.0 || !amount_sol.is_finite() {
                return Err(CommandError::BadArgs("amount must be positive"));
            }
            let chain = match parts.next() {
                None => Chain::Solana,
                Some(c) => Chain::from_str(c)
                    .ok_or(CommandError::BadArgs("unsupported chain"))?,
            };
            Ok(Command::Snipe {
                mint: mint.to_string(),
                amount_sol,
                chain,
            })
        }
        other => Err(CommandError::Unknown(other.to_string())),
    }
}
