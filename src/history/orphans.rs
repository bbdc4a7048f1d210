//! Cleanup of history rows whose channel no longer exists.

use crate::error::{HistoryError, Result};
use crate::history::store::HistoryStore;
use anyhow::Context as _;

impl HistoryStore {
    /// Delete up to `limit` rows referencing a channel with no `channels` row.
    ///
    /// Channel deletion does not cascade into the ledger, so this runs as its
    /// own bounded batch. Once no orphans remain it returns 0.
    pub async fn delete_orphaned_rows(&self, limit: i64) -> Result<i64> {
        HistoryError::check_limit("orphan cleanup", limit)?;
        if limit == 0 {
            return Ok(0);
        }

        let result = sqlx::query(
            r#"
            DELETE FROM channel_member_history WHERE rowid IN (
                SELECT h.rowid FROM channel_member_history h
                LEFT JOIN channels c ON c.id = h.channel_id
                WHERE c.id IS NULL
                LIMIT ?
            )
            "#,
        )
        .bind(limit)
        .execute(self.pool())
        .await
        .context("failed to delete orphaned channel member history")?;

        let deleted = result.rows_affected() as i64;
        if deleted > 0 {
            tracing::info!(rows_deleted = deleted, "deleted orphaned channel member history");
        }

        Ok(deleted)
    }
}
