//! Retention-policy driven batch deletion of closed intervals.

use crate::error::{HistoryError, Result};
use crate::history::store::HistoryStore;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};

pub const DAY_IN_MILLISECONDS: i64 = 24 * 60 * 60 * 1000;

/// Parameters for one purge batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionBatchConfig {
    /// Reference time for channel and team policy cutoffs, epoch ms.
    pub now: i64,
    /// Cutoff for channels without a channel or team policy. Values `<= 0`
    /// disable the global tier.
    pub global_policy_end_time: i64,
    /// Maximum rows deleted by this batch.
    pub limit: i64,
}

/// Caller-owned purge progress.
///
/// A tier is marked done once a batch deletes fewer of its rows than it was
/// allowed to, so the next batch starts at the following tier. Start each
/// maintenance pass from `RetentionCursor::default()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionCursor {
    pub channel_policies_done: bool,
    pub team_policies_done: bool,
    pub global_policies_done: bool,
}

impl RetentionCursor {
    pub fn is_complete(&self) -> bool {
        self.channel_policies_done && self.team_policies_done && self.global_policies_done
    }

    fn is_done(&self, tier: Tier) -> bool {
        match tier {
            Tier::Channel => self.channel_policies_done,
            Tier::Team => self.team_policies_done,
            Tier::Global => self.global_policies_done,
        }
    }

    fn mark_done(&mut self, tier: Tier) {
        match tier {
            Tier::Channel => self.channel_policies_done = true,
            Tier::Team => self.team_policies_done = true,
            Tier::Global => self.global_policies_done = true,
        }
    }
}

/// Policy scope deciding a row's cutoff. A channel policy wins over a team
/// policy, which wins over the global cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Channel,
    Team,
    Global,
}

impl Tier {
    const ALL: [Tier; 3] = [Tier::Channel, Tier::Team, Tier::Global];

    fn as_str(self) -> &'static str {
        match self {
            Tier::Channel => "channel",
            Tier::Team => "team",
            Tier::Global => "global",
        }
    }

    async fn delete(
        self,
        conn: &mut sqlx::SqliteConnection,
        config: &RetentionBatchConfig,
        limit: i64,
    ) -> Result<i64> {
        let query = match self {
            Tier::Channel => sqlx::query(
                r#"
                DELETE FROM channel_member_history WHERE rowid IN (
                    SELECT h.rowid FROM channel_member_history h
                    JOIN retention_policies_channels rpc ON rpc.channel_id = h.channel_id
                    JOIN retention_policies rp ON rp.id = rpc.policy_id
                    WHERE h.leave_time IS NOT NULL
                      AND h.leave_time <= ? - rp.post_duration_days * ?
                    LIMIT ?
                )
                "#,
            )
            .bind(config.now)
            .bind(DAY_IN_MILLISECONDS),
            Tier::Team => sqlx::query(
                r#"
                DELETE FROM channel_member_history WHERE rowid IN (
                    SELECT h.rowid FROM channel_member_history h
                    JOIN channels c ON c.id = h.channel_id
                    JOIN retention_policies_teams rpt ON rpt.team_id = c.team_id
                    JOIN retention_policies rp ON rp.id = rpt.policy_id
                    LEFT JOIN retention_policies_channels rpc ON rpc.channel_id = h.channel_id
                    WHERE rpc.channel_id IS NULL
                      AND h.leave_time IS NOT NULL
                      AND h.leave_time <= ? - rp.post_duration_days * ?
                    LIMIT ?
                )
                "#,
            )
            .bind(config.now)
            .bind(DAY_IN_MILLISECONDS),
            Tier::Global => sqlx::query(
                r#"
                DELETE FROM channel_member_history WHERE rowid IN (
                    SELECT h.rowid FROM channel_member_history h
                    LEFT JOIN channels c ON c.id = h.channel_id
                    LEFT JOIN retention_policies_channels rpc ON rpc.channel_id = h.channel_id
                    LEFT JOIN retention_policies_teams rpt ON rpt.team_id = c.team_id
                    WHERE rpc.channel_id IS NULL
                      AND rpt.team_id IS NULL
                      AND h.leave_time IS NOT NULL
                      AND h.leave_time <= ?
                    LIMIT ?
                )
                "#,
            )
            .bind(config.global_policy_end_time),
        };

        let result = query
            .bind(limit)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("failed to purge {} retention tier", self.as_str()))?;

        Ok(result.rows_affected() as i64)
    }
}

impl HistoryStore {
    /// Delete up to `config.limit` closed intervals that are past their
    /// retention cutoff, resuming from `cursor`.
    ///
    /// All deletions of one call commit together. Callers loop, feeding the
    /// returned cursor back, until a batch reports zero rows.
    pub async fn permanent_delete_batch_for_retention_policies(
        &self,
        config: RetentionBatchConfig,
        cursor: RetentionCursor,
    ) -> Result<(i64, RetentionCursor)> {
        HistoryError::check_limit("retention purge", config.limit)?;
        if config.limit == 0 {
            return Ok((0, cursor));
        }

        let mut tx = self
            .pool()
            .begin()
            .await
            .context("failed to open retention purge transaction")?;

        let mut next = cursor;
        let mut remaining = config.limit;
        let mut total = 0;

        for tier in Tier::ALL {
            if remaining == 0 {
                break;
            }
            if next.is_done(tier) {
                continue;
            }
            if tier == Tier::Global && config.global_policy_end_time <= 0 {
                next.mark_done(tier);
                continue;
            }

            let deleted = tier.delete(&mut *tx, &config, remaining).await?;
            if deleted < remaining {
                next.mark_done(tier);
            }
            total += deleted;
            remaining -= deleted;
        }

        tx.commit()
            .await
            .context("failed to commit retention purge transaction")?;

        if total > 0 {
            tracing::info!(
                rows_deleted = total,
                complete = next.is_complete(),
                "purged channel member history past retention"
            );
        }

        Ok((total, next))
    }
}
