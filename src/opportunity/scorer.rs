//! Launch scoring
//! Mission: a 0..100 score from weighted categories, with hard stops that
//! reject outright no matter the score. Missing evidence counts against the
//! score; missing *sellability* evidence is a hard stop.

use serde::{Deserialize, Serialize};

use crate::models::DiscoveryMethod;

/// Category weights (sum 100).
const W_SELLABILITY: u32 = 25;
const W_SUPPLY: u32 = 20;
const W_LIQUIDITY: u32 = 20;
const W_DISTRIBUTION: u32 = 10;
const W_DEPLOYER: u32 = 10;
const W_CONTROLS: u32 = 10;
const W_EXECUTION: u32 = 5;

/// Hard-stop thresholds.
const MAX_TOP_HOLDER_PCT: f64 = 30.0;
const MAX_TRANSFER_TAX_BPS: u32 = 500;

/// Liquidity at which the liquidity category saturates.
const LIQUIDITY_TARGET_SOL: f64 = 10.0;
/// A launch older than this stops earning freshness points.
const FRESH_WINDOW_SECS: i64 = 120;

/// Evidence gathered about a launch. `None` means the probe failed or was
/// not run; every consumer treats that conservatively.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenMetrics {
    pub can_sell: Option<bool>,
    pub top_holder_pct: Option<f64>,
    pub initial_liquidity_sol: Option<f64>,
    pub holder_count: Option<u32>,
    pub deployer: Option<String>,
    pub deployer_prior_rugs: Option<u32>,
    pub mint_authority_revoked: Option<bool>,
    pub freeze_authority_revoked: Option<bool>,
    pub transfer_tax_bps: Option<u32>,
    pub seconds_since_launch: Option<i64>,
    pub source: Option<DiscoveryMethod>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub total: u32,
    pub reasons: Vec<String>,
    pub hard_stop: bool,
}

pub fn score_candidate(metrics: &TokenMetrics, deployer_denylist: &[String]) -> ScoreBreakdown {
    let mut reasons = Vec::new();
    let mut hard_stop = false;

    // Hard stops first: any single one rejects.
    match metrics.can_sell {
        Some(false) => {
            hard_stop = true;
            reasons.push("honeypot_indicator".to_string());
        }
        None => {
            hard_stop = true;
            reasons.push("missing_sellability_evidence".to_string());
        }
        Some(true) => {}
    }
    if let Some(pct) = metrics.top_holder_pct {
        if pct > MAX_TOP_HOLDER_PCT {
            hard_stop = true;
            reasons.push(format!("supply_concentration:{:.0}pct", pct));
        }
    }
    if let Some(tax) = metrics.transfer_tax_bps {
        if tax > MAX_TRANSFER_TAX_BPS {
            hard_stop = true;
            reasons.push(format!("extractable_tax:{}bps", tax));
        }
    }
    if let Some(deployer) = &metrics.deployer {
        if deployer_denylist.iter().any(|d| d == deployer) {
            hard_stop = true;
            reasons.push("deployer_denylisted".to_string());
        }
    }

    let mut total = 0u32;

    // Sellability
    if metrics.can_sell == Some(true) {
        total += W_SELLABILITY;
    }

    // Supply integrity: revoked authorities
    let mut supply = 0;
    if metrics.mint_authority_revoked == Some(true) {
        supply += W_SUPPLY / 2;
    } else {
        reasons.push("mint_authority_live".to_string());
    }
    if metrics.freeze_authority_revoked == Some(true) {
        supply += W_SUPPLY / 2;
    } else {
        reasons.push("freeze_authority_live".to_string());
    }
    total += supply;

    // Liquidity, scaled against the target
    match metrics.initial_liquidity_sol {
        Some(liq) if liq > 0.0 => {
            let frac = (liq / LIQUIDITY_TARGET_SOL).min(1.0);
            total += (W_LIQUIDITY as f64 * frac).round() as u32;
            if frac < 0.25 {
                reasons.push("thin_liquidity".to_string());
            }
        }
        _ => reasons.push("liquidity_unknown".to_string()),
    }

    // Distribution
    match (metrics.holder_count, metrics.top_holder_pct) {
        (Some(holders), Some(top)) => {
            let mut dist = 0;
            if holders >= 20 {
                dist += W_DISTRIBUTION / 2;
            }
            if top <= 15.0 {
                dist += W_DISTRIBUTION / 2;
            }
            total += dist;
        }
        _ => reasons.push("distribution_unknown".to_string()),
    }

    // Deployer provenance
    match metrics.deployer_prior_rugs {
        Some(0) => total += W_DEPLOYER,
        Some(n) => reasons.push(format!("deployer_prior_rugs:{}", n)),
        None => reasons.push("deployer_unknown".to_string()),
    }

    // Post-launch controls: taxless transfers
    match metrics.transfer_tax_bps {
        Some(0) => total += W_CONTROLS,
        Some(_) => {}
        None => reasons.push("controls_unknown".to_string()),
    }

    // Execution risk: freshness
    if let Some(age) = metrics.seconds_since_launch {
        if age <= FRESH_WINDOW_SECS {
            total += W_EXECUTION;
        } else {
            reasons.push("stale_launch".to_string());
        }
    }

    ScoreBreakdown {
        total: if hard_stop { 0 } else { total.min(100) },
        reasons,
        hard_stop,
    }
}
