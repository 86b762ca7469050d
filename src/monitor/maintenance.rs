//! Maintenance sweep
//! Mission: the slow janitor. Expires never-promoted opportunities, fails
//! executions that lost their worker, purges delivered notifications and
//! dead cooldowns.

use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{info, warn};

use crate::db::Database;

const SWEEP_INTERVAL_SECS: u64 = 60;
/// RESERVED/SUBMITTED executions older than this are abandoned.
const EXECUTION_GRACE_MINUTES: i64 = 5;
const NOTIFICATION_RETENTION_HOURS: i64 = 24;

pub struct MaintenanceLoop {
    db: Database,
}

impl MaintenanceLoop {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn run(self: Arc<Self>) {
        info!("Maintenance loop sweeping every {}s", SWEEP_INTERVAL_SECS);
        let mut tick = interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
        loop {
            tick.tick().await;
            self.sweep_once();
        }
    }

    pub fn sweep_once(&self) {
        match self.db.expire_stale_opportunities() {
            Ok(n) if n > 0 => info!("Expired {} opportunities", n),
            Ok(_) => {}
            Err(e) => warn!("Opportunity expiry failed: {}", e),
        }
        match self.db.fail_stuck_executions(EXECUTION_GRACE_MINUTES) {
            Ok(ids) if !ids.is_empty() => {
                warn!("Abandoned {} stuck execution(s): {:?}", ids.len(), ids)
            }
            Ok(_) => {}
            Err(e) => warn!("Stuck-execution sweep failed: {}", e),
        }
        match self
            .db
            .purge_delivered_notifications(NOTIFICATION_RETENTION_HOURS)
        {
            Ok(n) if n > 0 => info!("Purged {} delivered notifications", n),
            Ok(_) => {}
            Err(e) => warn!("Notification purge failed: {}", e),
        }
        match self.db.purge_expired_cooldowns() {
            Ok(n) if n > 0 => info!("Purged {} expired cooldowns", n),
            Ok(_) => {}
            Err(e) => warn!("Cooldown purge failed: {}", e),
        }
    }
}
