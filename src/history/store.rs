//! Membership interval ledger (SQLite).

use crate::error::Result;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use sqlx::{Row as _, SqlitePool};

/// One join/leave cycle of a user in a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub channel_id: String,
    pub user_id: String,
    /// Epoch milliseconds.
    pub join_time: i64,
    /// Epoch milliseconds; `None` while the user is still present.
    pub leave_time: Option<i64>,
}

impl HistoryRecord {
    pub fn is_open(&self) -> bool {
        self.leave_time.is_none()
    }
}

/// A user's presence in a channel as reported to export callers.
///
/// For channels answered from the membership snapshot the times are the
/// query window, not observed join and leave events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberInterval {
    pub channel_id: String,
    pub user_id: String,
    /// `None` when the user row no longer exists.
    pub user_email: Option<String>,
    pub username: Option<String>,
    pub is_bot: bool,
    pub user_delete_at: i64,
    pub join_time: i64,
    pub leave_time: Option<i64>,
}

/// Ledger of channel membership intervals.
///
/// Reads and writes go straight to the pool; every write touches the rows of
/// a single `(channel_id, user_id)` pair, so callers need no extra locking.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Open a new interval for `user_id` in `channel_id`.
    ///
    /// Existing open intervals for the pair are left alone. Replaying the
    /// exact same join (same pair and time) does nothing.
    pub async fn log_join_event(
        &self,
        user_id: &str,
        channel_id: &str,
        join_time: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO channel_member_history (channel_id, user_id, join_time, leave_time) \
             VALUES (?, ?, ?, NULL) \
             ON CONFLICT (channel_id, user_id, join_time) DO NOTHING",
        )
        .bind(channel_id)
        .bind(user_id)
        .bind(join_time)
        .execute(&self.pool)
        .await
        .context("failed to log channel join event")?;

        if result.rows_affected() == 0 {
            tracing::debug!(%user_id, %channel_id, join_time, "duplicate join event ignored");
        }

        Ok(())
    }

    /// Close the newest open interval for the pair that started at or before
    /// `leave_time`.
    ///
    /// Returns `false` when there was nothing to close. That is not an error:
    /// leave signals can arrive for memberships that predate tracking.
    pub async fn log_leave_event(
        &self,
        user_id: &str,
        channel_id: &str,
        leave_time: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE channel_member_history
            SET leave_time = ?
            WHERE leave_time IS NULL
              AND rowid = (
                SELECT rowid FROM channel_member_history
                WHERE user_id = ? AND channel_id = ? AND leave_time IS NULL AND join_time <= ?
                ORDER BY join_time DESC
                LIMIT 1
              )
            "#,
        )
        .bind(leave_time)
        .bind(user_id)
        .bind(channel_id)
        .bind(leave_time)
        .execute(&self.pool)
        .await
        .context("failed to log channel leave event")?;

        let closed = result.rows_affected() > 0;
        if !closed {
            tracing::debug!(%user_id, %channel_id, leave_time, "leave event without open interval");
        }

        Ok(closed)
    }

    /// Every interval recorded for the pair, oldest join first.
    pub async fn records_for(&self, user_id: &str, channel_id: &str) -> Result<Vec<HistoryRecord>> {
        let rows = sqlx::query(
            "SELECT channel_id, user_id, join_time, leave_time FROM channel_member_history \
             WHERE user_id = ? AND channel_id = ? \
             ORDER BY join_time ASC",
        )
        .bind(user_id)
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to load channel member history")?;

        rows.into_iter().map(record_from_row).collect()
    }

    /// Number of intervals recorded for a channel.
    pub async fn count_for_channel(&self, channel_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM channel_member_history WHERE channel_id = ?",
        )
        .bind(channel_id)
        .fetch_one(&self.pool)
        .await
        .context("failed to count channel member history")?;

        Ok(count)
    }
}

fn record_from_row(row: sqlx::sqlite::SqliteRow) -> Result<HistoryRecord> {
    Ok(HistoryRecord {
        channel_id: row
            .try_get("channel_id")
            .context("failed to read history channel_id")?,
        user_id: row.try_get("user_id").context("failed to read history user_id")?,
        join_time: row
            .try_get("join_time")
            .context("failed to read history join_time")?,
        leave_time: row
            .try_get("leave_time")
            .context("failed to read history leave_time")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    async fn setup_store() -> HistoryStore {
        let db = Db::in_memory().await.expect("in-memory sqlite should open");
        HistoryStore::new(db.sqlite)
    }

    #[tokio::test]
    async fn join_opens_interval_and_leave_closes_it() {
        let store = setup_store().await;
        store
            .log_join_event("user-1", "channel-1", 1000)
            .await
            .expect("join");

        let records = store
            .records_for("user-1", "channel-1")
            .await
            .expect("records");
        assert_eq!(records.len(), 1);
        assert!(records[0].is_open());

        let closed = store
            .log_leave_event("user-1", "channel-1", 1500)
            .await
            .expect("leave");
        assert!(closed);

        let records = store
            .records_for("user-1", "channel-1")
            .await
            .expect("records");
        assert_eq!(records[0].join_time, 1000);
        assert_eq!(records[0].leave_time, Some(1500));
    }

    #[tokio::test]
    async fn leave_without_join_is_a_no_op() {
        let store = setup_store().await;

        let closed = store
            .log_leave_event("user-1", "channel-1", 1500)
            .await
            .expect("leave");
        assert!(!closed);
        let records = store
            .records_for("user-1", "channel-1")
            .await
            .expect("records");
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn leave_closes_only_the_newest_open_interval() {
        let store = setup_store().await;
        store
            .log_join_event("user-1", "channel-1", 1000)
            .await
            .expect("join");
        store
            .log_join_event("user-1", "channel-1", 2000)
            .await
            .expect("join");

        store
            .log_leave_event("user-1", "channel-1", 2500)
            .await
            .expect("leave");

        let records = store
            .records_for("user-1", "channel-1")
            .await
            .expect("records");
        assert_eq!(records[0].leave_time, None);
        assert_eq!(records[1].leave_time, Some(2500));

        store
            .log_leave_event("user-1", "channel-1", 3000)
            .await
            .expect("leave");
        let records = store
            .records_for("user-1", "channel-1")
            .await
            .expect("records");
        assert_eq!(records[0].leave_time, Some(3000));
        assert_eq!(records[1].leave_time, Some(2500));
    }

    #[tokio::test]
    async fn leave_never_precedes_the_join_it_closes() {
        let store = setup_store().await;
        store
            .log_join_event("user-1", "channel-1", 1000)
            .await
            .expect("join");
        store
            .log_join_event("user-1", "channel-1", 2000)
            .await
            .expect("join");

        // Out-of-order leave belongs to the earlier interval.
        store
            .log_leave_event("user-1", "channel-1", 1500)
            .await
            .expect("leave");

        let records = store
            .records_for("user-1", "channel-1")
            .await
            .expect("records");
        assert_eq!(records[0].leave_time, Some(1500));
        assert_eq!(records[1].leave_time, None);

        let closed = store
            .log_leave_event("user-1", "channel-1", 500)
            .await
            .expect("leave");
        assert!(!closed);
    }

    #[tokio::test]
    async fn replayed_join_is_ignored() {
        let store = setup_store().await;
        store
            .log_join_event("user-1", "channel-1", 1000)
            .await
            .expect("join");
        store
            .log_join_event("user-1", "channel-1", 1000)
            .await
            .expect("replayed join");

        assert_eq!(store.count_for_channel("channel-1").await.expect("count"), 1);
    }

    #[tokio::test]
    async fn closed_interval_is_not_reopened_or_moved() {
        let store = setup_store().await;
        store
            .log_join_event("user-1", "channel-1", 1000)
            .await
            .expect("join");
        store
            .log_leave_event("user-1", "channel-1", 1100)
            .await
            .expect("leave");

        let closed = store
            .log_leave_event("user-1", "channel-1", 1200)
            .await
            .expect("leave");
        assert!(!closed);

        let records = store
            .records_for("user-1", "channel-1")
            .await
            .expect("records");
        assert_eq!(records[0].leave_time, Some(1100));
    }
}
