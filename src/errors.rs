//! Bounded error codes for trade execution
//! Mission: every venue/provider failure collapses into one enum that decides
//! retryability and the user-facing message. Nothing else classifies errors.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Transient: retried with backoff up to max_attempts
    RpcTimeout,
    RpcRateLimited,
    BlockhashExpired,
    BundleFailed,
    NetworkError,
    // Permanent: terminal on first occurrence
    InsufficientFunds,
    SlippageExceeded,
    SimulationFailed,
    TokenGraduated,
    SafetyPaused,
    CircuitOpen,
    BudgetExceeded,
    CooldownActive,
    WalletMismatch,
    Abandoned,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::RpcTimeout => "RPC_TIMEOUT",
            ErrorCode::RpcRateLimited => "RPC_RATE_LIMITED",
            ErrorCode::BlockhashExpired => "BLOCKHASH_EXPIRED",
            ErrorCode::BundleFailed => "JITO_BUNDLE_FAILED",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorCode::SlippageExceeded => "SLIPPAGE_EXCEEDED",
            ErrorCode::SimulationFailed => "SIMULATION_FAILED",
            ErrorCode::TokenGraduated => "TOKEN_GRADUATED",
            ErrorCode::SafetyPaused => "SAFETY_PAUSED",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::BudgetExceeded => "BUDGET_EXCEEDED",
            ErrorCode::CooldownActive => "COOLDOWN_ACTIVE",
            ErrorCode::WalletMismatch => "WALLET_MISMATCH",
            ErrorCode::Abandoned => "ABANDONED",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "RPC_TIMEOUT" => Some(ErrorCode::RpcTimeout),
            "RPC_RATE_LIMITED" => Some(ErrorCode::RpcRateLimited),
            "BLOCKHASH_EXPIRED" => Some(ErrorCode::BlockhashExpired),
            "JITO_BUNDLE_FAILED" => Some(ErrorCode::BundleFailed),
            "NETWORK_ERROR" => Some(ErrorCode::NetworkError),
            "INSUFFICIENT_FUNDS" => Some(ErrorCode::InsufficientFunds),
            "SLIPPAGE_EXCEEDED" => Some(ErrorCode::SlippageExceeded),
            "SIMULATION_FAILED" => Some(ErrorCode::SimulationFailed),
            "TOKEN_GRADUATED" => Some(ErrorCode::TokenGraduated),
            "SAFETY_PAUSED" => Some(ErrorCode::SafetyPaused),
            "CIRCUIT_OPEN" => Some(ErrorCode::CircuitOpen),
            "BUDGET_EXCEEDED" => Some(ErrorCode::BudgetExceeded),
            "COOLDOWN_ACTIVE" => Some(ErrorCode::CooldownActive),
            "WALLET_MISMATCH" => Some(ErrorCode::WalletMismatch),
            "ABANDONED" => Some(ErrorCode::Abandoned),
            "INTERNAL" => Some(ErrorCode::Internal),
            _ => None,
        }
    }

    /// The single retryability table. A retryable failure re-queues the job
    /// with exponential backoff; everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::RpcTimeout
                | ErrorCode::RpcRateLimited
                | ErrorCode::BlockhashExpired
                | ErrorCode::BundleFailed
                | ErrorCode::NetworkError
        )
    }

    /// Short message safe to surface through the notification channel. Raw
    /// provider strings never pass this boundary.
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorCode::RpcTimeout | ErrorCode::NetworkError => {
                "Network congestion, the trade was retried"
            }
            ErrorCode::RpcRateLimited => "RPC rate limited, the trade was retried",
            ErrorCode::BlockhashExpired => "Transaction expired, the trade was retried",
            ErrorCode::BundleFailed => "Bundle submission failed, the trade was retried",
            ErrorCode::InsufficientFunds => "Insufficient SOL balance for this trade",
            ErrorCode::SlippageExceeded => "Price moved beyond your slippage tolerance",
            ErrorCode::SimulationFailed => "Trade simulation failed, nothing was sent",
            ErrorCode::TokenGraduated => "Token has migrated venues, please retry",
            ErrorCode::SafetyPaused => "Trading is currently paused",
            ErrorCode::CircuitOpen => "Trading temporarily halted after repeated failures",
            ErrorCode::BudgetExceeded => "Trade exceeds your configured budget",
            ErrorCode::CooldownActive => "You recently traded this token, cooldown active",
            ErrorCode::WalletMismatch => {
                "Wallet integrity check failed, please recreate your wallet"
            }
            ErrorCode::Abandoned => "Trade confirmation was never observed",
            ErrorCode::Internal => "Internal error, the team has been notified",
        }
    }
}

/// A classified execution failure: the bounded code plus an operator-facing
/// detail string that stays in logs and ledger rows.
#[derive(Debug, Clone)]
pub struct TradeError {
    pub code: ErrorCode,
    pub detail: String,
}

impl TradeError {
    pub fn new(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }
}

impl std::fmt::Display for TradeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.detail)
    }
}

impl std::error::Error for TradeError {}

/// Best-effort classification of transport errors coming out of reqwest.
pub fn classify_http_error(err: &reqwest::Error) -> ErrorCode {
    if err.is_timeout() {
        ErrorCode::RpcTimeout
    } else if err
        .status()
        .map(|s| s.as_u16() == 429)
        .unwrap_or(false)
    {
        ErrorCode::RpcRateLimited
    } else {
        ErrorCode::NetworkError
    }
}
