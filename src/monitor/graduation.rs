//! Graduation monitor
//! Mission: notice when a position's bonding curve completes and rewire its
//! pricing to the AMM pool, exactly once per position. The monitor never
//! trades; subsequent exits pick the AMM venue through the router because
//! the lifecycle state changed.

use anyhow::Result;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::models::Position;
use crate::providers::launchpad::{fetch_curve_state, LaunchpadApiClient};
use crate::providers::rpc::RpcClient;

pub struct GraduationMonitor {
    db: Database,
    rpc: Arc<RpcClient>,
    api: Arc<LaunchpadApiClient>,
    poll_interval_secs: u64,
}

impl GraduationMonitor {
    pub fn new(
        db: Database,
        rpc: Arc<RpcClient>,
        api: Arc<LaunchpadApiClient>,
        poll_interval_secs: u64,
    ) -> Self {
        Self {
            db,
            rpc,
            api,
            poll_interval_secs,
        }
    }

    pub async fn run(self: Arc<Self>) {
        info!(
            "Graduation monitor polling every {}s",
            self.poll_interval_secs
        );
        let mut tick = interval(Duration::from_secs(self.poll_interval_secs.max(1)));
        loop {
            tick.tick().await;
            let positions = match self.db.list_pre_graduation_positions() {
                Ok(p) => p,
                Err(e) => {
                    warn!("Graduation scan failed: {}", e);
                    continue;
                }
            };
            for position in positions {
                if let Err(e) = self.check_position(&position).await {
                    debug!("Graduation check failed for {}: {}", position.id, e);
                }
            }
        }
    }

    /// Poll the curve; once complete and the pool is known, perform the
    /// atomic transition. Concurrent monitors are safe: the database update
    /// is conditional, so at most one sees `true`.
    pub async fn check_position(&self, position: &Position) -> Result<()> {
        let complete = match &position.bonding_curve {
            Some(curve) => match fetch_curve_state(&self.rpc, curve).await {
                Ok(Some(state)) => state.complete,
                Ok(None) => false,
                Err(e) => {
                    debug!("Curve read failed for {}: {}", position.id, e);
                    false
                }
            },
            None => false,
        };

        // The REST mirror both confirms completion and names the pool.
        let info = match self.api.coin_info(&position.token_mint).await {
            Ok(info) => info,
            Err(e) => {
                if !complete {
                    return Ok(());
                }
                debug!("Coin info failed for {}: {}", position.token_mint, e);
                return Ok(());
            }
        };

        if !(complete || info.complete) {
            return Ok(());
        }
        let Some(pool) = info.raydium_pool else {
            // Complete but not yet migrated: try again next tick.
            debug!(
                "Curve complete for {} but pool unknown, waiting",
                position.token_mint
            );
            return Ok(());
        };

        if self.db.graduate_position_atomically(&position.id, &pool)? {
            info!(
                "Position {} graduated: {} now prices from pool {}",
                position.id, position.token_mint, pool
            );
        }
        Ok(())
    }
}
