//! Notification sink
//! Mission: a pure outbox for the chat layer. Delivery is someone else's
//! job; maintenance purges delivered rows after a day.

use anyhow::Result;
use chrono::{Duration, Utc};
use rusqlite::params;

use super::{now_ts, to_ts, Database};

#[derive(Debug, Clone)]
pub struct NotificationRow {
    pub id: i64,
    pub user_id: i64,
    pub kind: String,
    pub payload: serde_json::Value,
}

impl Database {
    pub fn insert_notification(
        &self,
        user_id: i64,
        kind: &str,
        payload: &serde_json::Value,
    ) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO notifications (user_id, type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_id, kind, serde_json::to_string(payload)?, now_ts()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Undelivered rows, oldest first, for the external delivery loop.
    pub fn pending_notifications(&self, limit: usize) -> Result<Vec<NotificationRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, type, payload FROM notifications
             WHERE delivered_at IS NULL ORDER BY created_at ASC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |r| {
                let payload: String = r.get(3)?;
                Ok(NotificationRow {
                    id: r.get(0)?,
                    user_id: r.get(1)?,
                    kind: r.get(2)?,
                    payload: serde_json::from_str(&payload)
                        .unwrap_or(serde_json::Value::Null),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn mark_notification_delivered(&self, id: i64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE notifications SET delivered_at = ?2 WHERE id = ?1",
            params![id, now_ts()],
        )?;
        Ok(())
    }

    /// Maintenance: delivered rows older than `hours` are deleted.
    pub fn purge_delivered_notifications(&self, hours: i64) -> Result<usize> {
        let cutoff = to_ts(&(Utc::now() - Duration::hours(hours)));
        let conn = self.lock();
        let n = conn.execute(
            "DELETE FROM notifications WHERE delivered_at IS NOT NULL AND delivered_at < ?1",
            [cutoff],
        )?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_util::temp_db;
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pending_and_delivery_flow() {
        let (db, _dir, _) = temp_db();
        let id = db
            .insert_notification(1, "buy_confirmed", &json!({"mint": "M"}))
            .unwrap();

        let pending = db.pending_notifications(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, "buy_confirmed");

        db.mark_notification_delivered(id).unwrap();
        assert!(db.pending_notifications(10).unwrap().is_empty());
    }

    #[test]
    fn test_purge_keeps_undelivered() {
        let (db, _dir, _) = temp_db();
        let delivered = db.insert_notification(1, "a", &json!({})).unwrap();
        db.insert_notification(1, "b", &json!({})).unwrap();
        db.mark_notification_delivered(delivered).unwrap();

        // Backdate the delivery past the retention window
        db.lock()
            .execute(
                "UPDATE notifications SET delivered_at = ?2 WHERE id = ?1",
                params![delivered, to_ts(&(Utc::now() - Duration::hours(25)))],
            )
            .unwrap();

        assert_eq!(db.purge_delivered_notifications(24).unwrap(), 1);
        assert_eq!(db.pending_notifications(10).unwrap().len(), 1);
    }
}
