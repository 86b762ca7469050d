//! Trade job outbox
//! Mission: lease-based dispatch. A job is processed by at most one worker
//! at a time; a crashed worker's lease expires and the next claim takes the
//! job over.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::{debug, info, warn};

use super::executions::immediate_tx;
use super::{now_ts, parse_ts, to_ts, Database};
use crate::models::{Chain, JobPayload, JobStatus, TradeAction, TradeJob, TradeMode};

/// Exits run before buys: freeing capital and cutting losses beats opening
/// new exposure.
pub const PRIORITY_EXIT: i64 = 0;
pub const PRIORITY_BUY: i64 = 10;

const BACKOFF_BASE_SECS: i64 = 5;

/// Retry delay after the attempt that just failed: 5 * 2^(attempts-1).
pub fn backoff_delay_secs(attempts: i64) -> i64 {
    BACKOFF_BASE_SECS * 2_i64.pow((attempts.max(1) - 1).min(16) as u32)
}

/// Producer-side description of a job to insert.
#[derive(Debug, Clone)]
pub struct EnqueueJob {
    pub chain: Chain,
    pub action: TradeAction,
    pub mode: TradeMode,
    pub user_id: i64,
    pub strategy_id: Option<i64>,
    pub opportunity_id: Option<i64>,
    pub idempotency_key: String,
    pub payload: JobPayload,
    pub priority: i64,
    pub max_attempts: i64,
    pub run_after: Option<DateTime<Utc>>,
}

impl Database {
    /// Insert a job. Returns `None` when a job with the same idempotency key
    /// already exists; producers treat that as success.
    pub fn enqueue_job(&self, job: &EnqueueJob) -> Result<Option<i64>> {
        let payload = serde_json::to_string(&job.payload)?;
        let ts = now_ts();
        let run_after = job
            .run_after
            .map(|d| to_ts(&d))
            .unwrap_or_else(|| ts.clone());

        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT INTO trade_jobs
             (chain, action, mode, user_id, strategy_id, opportunity_id, idempotency_key,
              payload, status, priority, attempts, max_attempts, run_after, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'QUEUED', ?9, 0, ?10, ?11, ?12)
             ON CONFLICT(idempotency_key) DO NOTHING",
            params![
                job.chain.as_str(),
                job.action.as_str(),
                job.mode.as_str(),
                job.user_id,
                job.strategy_id,
                job.opportunity_id,
                job.idempotency_key,
                payload,
                job.priority,
                job.max_attempts,
                run_after,
                ts,
            ],
        )?;
        if inserted == 0 {
            debug!(
                "Job with key {}.. already queued, skipping",
                &job.idempotency_key[..12.min(job.idempotency_key.len())]
            );
            return Ok(None);
        }
        let id = conn.last_insert_rowid();
        info!(
            "Enqueued {} job {} (priority {}, user {})",
            job.action.as_str(),
            id,
            job.priority,
            job.user_id
        );
        Ok(Some(id))
    }

    /// Claim up to `max_count` runnable jobs under a fresh lease. Runnable:
    /// QUEUED with run_after due, or CLAIMED with an expired lease (stale
    /// worker takeover). The whole selection+update is one immediate
    /// transaction, so no row is ever handed to two workers.
    pub fn claim_jobs(
        &self,
        worker_id: &str,
        max_count: usize,
        now: DateTime<Utc>,
        lease_ttl_secs: u64,
    ) -> Result<Vec<TradeJob>> {
        let now_s = to_ts(&now);
        let lease = to_ts(&(now + Duration::seconds(lease_ttl_secs as i64)));

        let conn = self.lock();
        immediate_tx(&conn, |conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM trade_jobs
                 WHERE (status = 'QUEUED' AND run_after <= ?1)
                    OR (status = 'CLAIMED' AND lease_expires_at < ?1)
                 ORDER BY priority ASC, created_at ASC
                 LIMIT ?2",
            )?;
            let ids: Vec<i64> = stmt
                .query_map(params![now_s, max_count as i64], |r| r.get(0))?
                .collect::<std::result::Result<_, _>>()?;
            drop(stmt);

            let mut claimed = Vec::with_capacity(ids.len());
            for id in ids {
                let prev_owner: Option<String> = conn
                    .query_row(
                        "SELECT lease_owner FROM trade_jobs WHERE id = ?1 AND status = 'CLAIMED'",
                        [id],
                        |r| r.get(0),
                    )
                    .optional()?
                    .flatten();
                if let Some(prev) = prev_owner {
                    warn!("Taking over stale job {} from worker {}", id, prev);
                }
                conn.execute(
                    "UPDATE trade_jobs SET
                       status = 'CLAIMED', lease_owner = ?2, lease_expires_at = ?3,
                       attempts = attempts + 1
                     WHERE id = ?1",
                    params![id, worker_id, lease],
                )?;
                claimed.push(get_job_in_tx(conn, id)?);
            }
            Ok(claimed)
        })
    }

    /// Extend the lease on a job this worker owns.
    pub fn heartbeat_job(&self, job_id: i64, worker_id: &str, lease_ttl_secs: u64) -> Result<()> {
        let lease = to_ts(&(Utc::now() + Duration::seconds(lease_ttl_secs as i64)));
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE trade_jobs SET lease_expires_at = ?3
             WHERE id = ?1 AND lease_owner = ?2 AND status = 'CLAIMED'",
            params![job_id, worker_id, lease],
        )?;
        if updated == 0 {
            bail!("Heartbeat rejected: job {} not claimed by {}", job_id, worker_id);
        }
        Ok(())
    }

    /// Terminal bookkeeping for a processed job. Only the lease owner may
    /// finalize. A retryable failure under the attempt cap re-queues with
    /// exponential backoff; everything else is terminal.
    pub fn finalize_job(
        &self,
        job_id: i64,
        worker_id: &str,
        status: JobStatus,
        retryable: bool,
        error: Option<&str>,
    ) -> Result<()> {
        if !matches!(status, JobStatus::Done | JobStatus::Failed | JobStatus::Canceled) {
            bail!("finalize_job only accepts DONE, FAILED or CANCELED");
        }
        let conn = self.lock();
        immediate_tx(&conn, |conn| {
            let (owner, job_status, attempts, max_attempts): (Option<String>, String, i64, i64) =
                conn.query_row(
                    "SELECT lease_owner, status, attempts, max_attempts
                     FROM trade_jobs WHERE id = ?1",
                    [job_id],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
                )
                .with_context(|| format!("Job {} not found", job_id))?;

            if job_status != "CLAIMED" || owner.as_deref() != Some(worker_id) {
                bail!(
                    "finalize rejected: job {} is {} owned by {:?}, not {}",
                    job_id,
                    job_status,
                    owner,
                    worker_id
                );
            }

            let ts = now_ts();
            match status {
                JobStatus::Failed if retryable && attempts < max_attempts => {
                    let delay = backoff_delay_secs(attempts);
                    let run_after = to_ts(&(Utc::now() + Duration::seconds(delay)));
                    conn.execute(
                        "UPDATE trade_jobs SET
                           status = 'QUEUED', lease_owner = NULL, lease_expires_at = NULL,
                           run_after = ?2, last_error = ?3
                         WHERE id = ?1",
                        params![job_id, run_after, error],
                    )?;
                    info!(
                        "Job {} re-queued after attempt {}/{} ({}s backoff)",
                        job_id, attempts, max_attempts, delay
                    );
                }
                JobStatus::Failed => {
                    conn.execute(
                        "UPDATE trade_jobs SET
                           status = 'FAILED', lease_owner = NULL, lease_expires_at = NULL,
                           last_error = ?2, completed_at = ?3
                         WHERE id = ?1",
                        params![job_id, error, ts],
                    )?;
                    warn!(
                        "Job {} failed terminally after {} attempt(s): {}",
                        job_id,
                        attempts,
                        error.unwrap_or("-")
                    );
                }
                JobStatus::Done | JobStatus::Canceled => {
                    conn.execute(
                        "UPDATE trade_jobs SET
                           status = ?2, lease_owner = NULL, lease_expires_at = NULL,
                           last_error = ?3, completed_at = ?4
                         WHERE id = ?1",
                        params![job_id, status.as_str(), error, ts],
                    )?;
                }
                _ => unreachable!(),
            }
            Ok(())
        })
    }

    pub fn get_job(&self, job_id: i64) -> Result<TradeJob> {
        let conn = self.lock();
        get_job_in_tx(&conn, job_id)
    }

    pub fn count_jobs_with_status(&self, status: JobStatus) -> Result<i64> {
        let conn = self.lock();
        let n = conn.query_row(
            "SELECT COUNT(*) FROM trade_jobs WHERE status = ?1",
            [status.as_str()],
            |r| r.get(0),
        )?;
        Ok(n)
    }
}

struct RawJobRow {
    id: i64,
    chain: String,
    action: String,
    mode: String,
    user_id: i64,
    strategy_id: Option<i64>,
    opportunity_id: Option<i64>,
    idempotency_key: String,
    payload: String,
    status: String,
    priority: i64,
    attempts: i64,
    max_attempts: i64,
    run_after: String,
    lease_owner: Option<String>,
    lease_expires_at: Option<String>,
    last_error: Option<String>,
    created_at: String,
    completed_at: Option<String>,
}

fn get_job_in_tx(conn: &rusqlite::Connection, job_id: i64) -> Result<TradeJob> {
    let raw = conn
        .query_row(
            "SELECT id, chain, action, mode, user_id, strategy_id, opportunity_id,
                    idempotency_key, payload, status, priority, attempts, max_attempts,
                    run_after, lease_owner, lease_expires_at, last_error,
                    created_at, completed_at
             FROM trade_jobs WHERE id = ?1",
            [job_id],
            |r| {
                Ok(RawJobRow {
                    id: r.get(0)?,
                    chain: r.get(1)?,
                    action: r.get(2)?,
                    mode: r.get(3)?,
                    user_id: r.get(4)?,
                    strategy_id: r.get(5)?,
                    opportunity_id: r.get(6)?,
                    idempotency_key: r.get(7)?,
                    payload: r.get(8)?,
                    status: r.get(9)?,
                    priority: r.get(10)?,
                    attempts: r.get(11)?,
                    max_attempts: r.get(12)?,
                    run_after: r.get(13)?,
                    lease_owner: r.get(14)?,
                    lease_expires_at: r.get(15)?,
                    last_error: r.get(16)?,
                    created_at: r.get(17)?,
                    completed_at: r.get(18)?,
                })
            },
        )
        .with_context(|| format!("Job {} not found", job_id))?;

    let payload: JobPayload = serde_json::from_str(&raw.payload)
        .with_context(|| format!("Job {} payload is not valid JSON", raw.id))?;
    Ok(TradeJob {
        id: raw.id,
        chain: Chain::from_str(&raw.chain).unwrap_or(Chain::Solana),
        action: TradeAction::from_str(&raw.action).unwrap_or(TradeAction::Buy),
        mode: TradeMode::from_str(&raw.mode).unwrap_or(TradeMode::Auto),
        user_id: raw.user_id,
        strategy_id: raw.strategy_id,
        opportunity_id: raw.opportunity_id,
        idempotency_key: raw.idempotency_key,
        payload,
        status: JobStatus::from_str(&raw.status).unwrap_or(JobStatus::Failed),
        priority: raw.priority,
        attempts: raw.attempts,
        max_attempts: raw.max_attempts,
        run_after: parse_ts(&raw.run_after),
        lease_owner: raw.lease_owner,
        lease_expires_at: raw.lease_expires_at.as_deref().map(parse_ts),
        last_error: raw.last_error,
        created_at: parse_ts(&raw.created_at),
        completed_at: raw.completed_at.as_deref().map(parse_ts),
    })
}
