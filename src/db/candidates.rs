//! Launch candidates and opportunities
//! Mission: the merge-upsert is the authoritative dedup for both discovery
//! sources. Discovery method only upgrades, status never regresses, raw
//! payloads shallow-merge with new fields overriding.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::{debug, info};

use super::executions::immediate_tx;
use super::{now_ts, parse_ts, to_ts, Database};
use crate::models::{
    CandidateStatus, Chain, DiscoveryMethod, LaunchCandidate, Opportunity, OpportunityStatus,
};

/// Opportunities expire this long after detection if never promoted.
pub const OPPORTUNITY_TTL_SECS: i64 = 60;

impl Database {
    /// Merge-upsert a discovered launch. Returns the stored (merged) row.
    pub fn upsert_launch_candidate(&self, incoming: &LaunchCandidate) -> Result<LaunchCandidate> {
        let conn = self.lock();
        immediate_tx(&conn, |conn| {
            let existing: Option<(String, String, Option<String>, Option<String>, Option<String>, Option<String>, String, String)> = conn
                .query_row(
                    "SELECT discovery_method, status, symbol, name, creator, bonding_curve,
                            raw_payload, first_seen_at
                     FROM launch_candidates WHERE mint = ?1 AND chain = ?2",
                    params![incoming.mint, incoming.chain.as_str()],
                    |r| {
                        Ok((
                            r.get(0)?,
                            r.get(1)?,
                            r.get(2)?,
                            r.get(3)?,
                            r.get(4)?,
                            r.get(5)?,
                            r.get(6)?,
                            r.get(7)?,
                        ))
                    },
                )
                .optional()?;

            let ts = now_ts();
            let merged = match existing {
                None => {
                    conn.execute(
                        "INSERT INTO launch_candidates
                         (mint, chain, discovery_method, status, symbol, name, creator,
                          bonding_curve, raw_payload, first_seen_at, updated_at)
                         VALUES (?1, ?2, ?3, 'new', ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                        params![
                            incoming.mint,
                            incoming.chain.as_str(),
                            incoming.discovery_method.as_str(),
                            incoming.symbol,
                            incoming.name,
                            incoming.creator,
                            incoming.bonding_curve,
                            serde_json::to_string(&incoming.raw_payload)?,
                            ts,
                        ],
                    )?;
                    info!(
                        "New launch candidate {} via {}",
                        incoming.mint,
                        incoming.discovery_method.as_str()
                    );
                    LaunchCandidate {
                        status: CandidateStatus::New,
                        first_seen_at: Utc::now(),
                        ..incoming.clone()
                    }
                }
                Some((method, status, symbol, name, creator, curve, payload, first_seen)) => {
                    let old_method =
                        DiscoveryMethod::from_str(&method).unwrap_or(DiscoveryMethod::Telegram);
                    let old_status =
                        CandidateStatus::from_str(&status).unwrap_or(CandidateStatus::New);

                    // Monotonic upgrade only; telegram never overwrites onchain.
                    let new_method = if incoming.discovery_method.rank() > old_method.rank() {
                        incoming.discovery_method
                    } else {
                        old_method
                    };

                    let merged_payload =
                        shallow_merge(&payload, &incoming.raw_payload)?;

                    conn.execute(
                        "UPDATE launch_candidates SET
                           discovery_method = ?3,
                           symbol = COALESCE(?4, symbol),
                           name = COALESCE(?5, name),
                           creator = COALESCE(?6, creator),
                           bonding_curve = COALESCE(?7, bonding_curve),
                           raw_payload = ?8,
                           updated_at = ?9
                         WHERE mint = ?1 AND chain = ?2",
                        params![
                            incoming.mint,
                            incoming.chain.as_str(),
                            new_method.as_str(),
                            incoming.symbol,
                            incoming.name,
                            incoming.creator,
                            incoming.bonding_curve,
                            serde_json::to_string(&merged_payload)?,
                            ts,
                        ],
                    )?;
                    debug!("Merged duplicate signal for {}", incoming.mint);
                    LaunchCandidate {
                        mint: incoming.mint.clone(),
                        chain: incoming.chain,
                        discovery_method: new_method,
                        // Status is owned by the matcher; duplicates never reset it.
                        status: old_status,
                        symbol: incoming.symbol.clone().or(symbol),
                        name: incoming.name.clone().or(name),
                        creator: incoming.creator.clone().or(creator),
                        bonding_curve: incoming.bonding_curve.clone().or(curve),
                        raw_payload: merged_payload,
                        first_seen_at: parse_ts(&first_seen),
                    }
                }
            };
            Ok(merged)
        })
    }

    pub fn get_launch_candidate(
        &self,
        mint: &str,
        chain: Chain,
    ) -> Result<Option<LaunchCandidate>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT mint, chain, discovery_method, status, symbol, name, creator,
                        bonding_curve, raw_payload, first_seen_at
                 FROM launch_candidates WHERE mint = ?1 AND chain = ?2",
                params![mint, chain.as_str()],
                map_candidate_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Candidates the matcher has not looked at yet, oldest first.
    pub fn list_new_candidates(&self, limit: usize) -> Result<Vec<LaunchCandidate>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT mint, chain, discovery_method, status, symbol, name, creator,
                    bonding_curve, raw_payload, first_seen_at
             FROM launch_candidates WHERE status = 'new'
             ORDER BY first_seen_at ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], map_candidate_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_candidate_status(
        &self,
        mint: &str,
        chain: Chain,
        status: CandidateStatus,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE launch_candidates SET status = ?3, updated_at = ?4
             WHERE mint = ?1 AND chain = ?2",
            params![mint, chain.as_str(), status.as_str(), now_ts()],
        )?;
        Ok(())
    }

    pub fn create_opportunity(
        &self,
        mint: &str,
        chain: Chain,
        score: u32,
        reasons: &[String],
        hard_stop: bool,
    ) -> Result<i64> {
        let conn = self.lock();
        let ts = now_ts();
        conn.execute(
            "INSERT INTO opportunities
             (mint, chain, score, reasons, hard_stop, status, detected_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'NEW', ?6, ?6)",
            params![
                mint,
                chain.as_str(),
                score,
                serde_json::to_string(reasons)?,
                hard_stop as i64,
                ts,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_opportunity(&self, id: i64) -> Result<Opportunity> {
        let conn = self.lock();
        let opp = conn
            .query_row(
                "SELECT id, mint, chain, score, reasons, hard_stop, matched_strategy_ids,
                        status, detected_at
                 FROM opportunities WHERE id = ?1",
                [id],
                map_opportunity_row,
            )
            .with_context(|| format!("Opportunity {} not found", id))?;
        Ok(opp)
    }

    pub fn set_opportunity_status(&self, id: i64, status: OpportunityStatus) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE opportunities SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), now_ts()],
        )?;
        Ok(())
    }

    pub fn set_opportunity_matches(&self, id: i64, strategy_ids: &[i64]) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE opportunities SET matched_strategy_ids = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, serde_json::to_string(strategy_ids)?, now_ts()],
        )?;
        Ok(())
    }

    /// Maintenance: NEW opportunities older than the TTL flip to EXPIRED.
    pub fn expire_stale_opportunities(&self) -> Result<usize> {
        let cutoff = to_ts(&(Utc::now() - Duration::seconds(OPPORTUNITY_TTL_SECS)));
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE opportunities SET status = 'EXPIRED', updated_at = ?2
             WHERE status = 'NEW' AND detected_at < ?1",
            params![cutoff, now_ts()],
        )?;
        if n > 0 {
            debug!("Expired {} stale opportunities", n);
        }
        Ok(n)
    }
}

fn map_candidate_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<LaunchCandidate> {
    let payload: String = r.get(8)?;
    Ok(LaunchCandidate {
        mint: r.get(0)?,
        chain: Chain::from_str(&r.get::<_, String>(1)?).unwrap_or(Chain::Solana),
        discovery_method: DiscoveryMethod::from_str(&r.get::<_, String>(2)?)
            .unwrap_or(DiscoveryMethod::Telegram),
        status: CandidateStatus::from_str(&r.get::<_, String>(3)?).unwrap_or(CandidateStatus::New),
        symbol: r.get(4)?,
        name: r.get(5)?,
        creator: r.get(6)?,
        bonding_curve: r.get(7)?,
        raw_payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        first_seen_at: parse_ts(&r.get::<_, String>(9)?),
    })
}

fn map_opportunity_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Opportunity> {
    let reasons: String = r.get(4)?;
    let matched: String = r.get(6)?;
    Ok(Opportunity {
        id: r.get(0)?,
        mint: r.get(1)?,
        chain: Chain::from_str(&r.get::<_, String>(2)?).unwrap_or(Chain::Solana),
        score: r.get(3)?,
        reasons: serde_json::from_str(&reasons).unwrap_or_default(),
        hard_stop: r.get::<_, i64>(5)? != 0,
        matched_strategy_ids: serde_json::from_str(&matched).unwrap_or_default(),
        status: OpportunityStatus::from_str(&r.get::<_, String>(7)?)
            .unwrap_or(OpportunityStatus::Expired),
        detected_at: parse_ts(&r.get::<_, String>(8)?),
    })
}

/// Object-level merge: keys from `incoming` override, everything else from
/// the stored payload survives. Non-object payloads fall back to override.
fn shallow_merge(stored: &str, incoming: &serde_json::Value) -> Result<serde_json::Value> {
    let stored: serde_json::Value = serde_json::from_str(stored).unwrap_or(serde_json::json!({}));
    match (stored, incoming) {
        (serde_json::Value::Object(mut base), serde_json::Value::Object(new)) => {
            for (k, v) in new {
                base.insert(k.clone(), v.clone());
            }
            Ok(serde_json::Value::Object(base))
        }
        (_, v) => Ok(v.clone()),
    }
}
