//! Activity and presence queries over the ledger.

use crate::error::Result;
use crate::history::store::{HistoryStore, MemberInterval};
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use sqlx::Row as _;
use std::collections::HashSet;

/// Where a channel's presence answer comes from.
///
/// Once the ledger holds any row for a channel it is the only source for that
/// channel. A channel with no ledger rows never had history captured, so every
/// current member is assumed present for the whole window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceSource {
    Ledger,
    MembershipSnapshot,
}

impl HistoryStore {
    /// Channels with a join, leave, post or post edit inside `[start, end]`.
    pub async fn get_channels_with_activity_during(
        &self,
        start: i64,
        end: i64,
    ) -> Result<Vec<String>> {
        if start > end {
            return Ok(Vec::new());
        }

        let channel_ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT channel_id FROM channel_member_history
            WHERE join_time BETWEEN ? AND ? OR leave_time BETWEEN ? AND ?
            UNION
            SELECT channel_id FROM posts
            WHERE create_at BETWEEN ? AND ? OR update_at BETWEEN ? AND ?
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(start)
        .bind(end)
        .bind(start)
        .bind(end)
        .bind(start)
        .bind(end)
        .fetch_all(self.pool())
        .await
        .context("failed to query channels with activity")?;

        Ok(channel_ids)
    }

    /// Resolve the presence source for each distinct channel, in input order.
    pub async fn presence_sources<S: AsRef<str>>(
        &self,
        channel_ids: &[S],
    ) -> Result<Vec<(String, PresenceSource)>> {
        let mut conn = self
            .pool()
            .acquire()
            .await
            .context("failed to acquire connection for presence lookup")?;
        resolve_sources(&mut conn, &dedup(channel_ids)).await
    }

    /// Every interval overlapping `[start, end]` in the given channels.
    ///
    /// Ledger-backed channels report intervals with `join_time <= end` that
    /// were still open at `start`. Snapshot-backed channels report each
    /// current member with the window itself as the interval.
    ///
    /// Channel lists are bound as a single JSON array, so their length is not
    /// capped by SQLite's host parameter limit.
    pub async fn get_users_in_channel_during<S: AsRef<str>>(
        &self,
        start: i64,
        end: i64,
        channel_ids: &[S],
    ) -> Result<Vec<MemberInterval>> {
        let channel_ids = dedup(channel_ids);
        if channel_ids.is_empty() || start > end {
            return Ok(Vec::new());
        }

        let mut tx = self
            .pool()
            .begin()
            .await
            .context("failed to open presence query transaction")?;

        let sources = resolve_sources(&mut tx, &channel_ids).await?;
        let (ledger, snapshot): (Vec<_>, Vec<_>) = sources
            .into_iter()
            .map(|(channel_id, source)| (source, channel_id))
            .partition(|(source, _)| *source == PresenceSource::Ledger);
        let ledger: Vec<String> = ledger.into_iter().map(|(_, id)| id).collect();
        let snapshot: Vec<String> = snapshot.into_iter().map(|(_, id)| id).collect();

        let mut intervals = Vec::new();

        if !ledger.is_empty() {
            let rows = sqlx::query(
                r#"
                SELECT h.channel_id, h.user_id, u.email, u.username,
                       COALESCE(u.is_bot, 0) AS is_bot,
                       COALESCE(u.delete_at, 0) AS user_delete_at,
                       h.join_time, h.leave_time
                FROM channel_member_history h
                LEFT JOIN users u ON u.id = h.user_id
                WHERE h.channel_id IN (SELECT value FROM json_each(?))
                  AND h.join_time <= ?
                  AND (h.leave_time IS NULL OR h.leave_time >= ?)
                "#,
            )
            .bind(json_ids(&ledger)?)
            .bind(end)
            .bind(start)
            .fetch_all(&mut *tx)
            .await
            .context("failed to query channel member history")?;

            for row in rows {
                intervals.push(MemberInterval {
                    join_time: row.try_get("join_time").context("failed to read join_time")?,
                    leave_time: row
                        .try_get("leave_time")
                        .context("failed to read leave_time")?,
                    ..member_from_row(&row)?
                });
            }
        }

        if !snapshot.is_empty() {
            tracing::debug!(
                channels = snapshot.len(),
                "no history captured, falling back to current channel members"
            );

            let rows = sqlx::query(
                r#"
                SELECT m.channel_id, m.user_id, u.email, u.username,
                       COALESCE(u.is_bot, 0) AS is_bot,
                       COALESCE(u.delete_at, 0) AS user_delete_at
                FROM channel_members m
                LEFT JOIN users u ON u.id = m.user_id
                WHERE m.channel_id IN (SELECT value FROM json_each(?))
                "#,
            )
            .bind(json_ids(&snapshot)?)
            .fetch_all(&mut *tx)
            .await
            .context("failed to query current channel members")?;

            for row in rows {
                intervals.push(MemberInterval {
                    join_time: start,
                    leave_time: Some(end),
                    ..member_from_row(&row)?
                });
            }
        }

        tx.commit()
            .await
            .context("failed to close presence query transaction")?;

        intervals.sort_by(|a, b| {
            (&a.channel_id, a.join_time, &a.user_id).cmp(&(&b.channel_id, b.join_time, &b.user_id))
        });

        Ok(intervals)
    }

    /// Channels whose newest interval for `user_id` closed at or after `since`.
    ///
    /// A channel the user rejoined and is still in is excluded, whatever its
    /// older intervals say.
    pub async fn get_channels_left_since(&self, user_id: &str, since: i64) -> Result<Vec<String>> {
        let channel_ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT h.channel_id FROM channel_member_history h
            WHERE h.user_id = ?
              AND h.leave_time IS NOT NULL
              AND h.leave_time >= ?
              AND h.join_time = (
                SELECT MAX(latest.join_time) FROM channel_member_history latest
                WHERE latest.user_id = h.user_id AND latest.channel_id = h.channel_id
              )
            ORDER BY h.channel_id
            "#,
        )
        .bind(user_id)
        .bind(since)
        .fetch_all(self.pool())
        .await
        .context("failed to query channels left since")?;

        Ok(channel_ids)
    }
}

fn dedup<S: AsRef<str>>(channel_ids: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    channel_ids
        .iter()
        .map(|id| id.as_ref())
        .filter(|id| seen.insert(*id))
        .map(str::to_string)
        .collect()
}

/// Encode ids as a JSON array for `json_each(?)`.
fn json_ids(channel_ids: &[String]) -> Result<String> {
    let encoded = serde_json::to_string(channel_ids).context("failed to encode channel ids")?;
    Ok(encoded)
}

async fn resolve_sources(
    conn: &mut sqlx::SqliteConnection,
    channel_ids: &[String],
) -> Result<Vec<(String, PresenceSource)>> {
    if channel_ids.is_empty() {
        return Ok(Vec::new());
    }

    let tracked: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT DISTINCT channel_id FROM channel_member_history
        WHERE channel_id IN (SELECT value FROM json_each(?))
        "#,
    )
    .bind(json_ids(channel_ids)?)
    .fetch_all(&mut *conn)
    .await
    .context("failed to check channel member history presence")?;
    let tracked: HashSet<String> = tracked.into_iter().collect();

    Ok(channel_ids
        .iter()
        .map(|channel_id| {
            let source = if tracked.contains(channel_id) {
                PresenceSource::Ledger
            } else {
                PresenceSource::MembershipSnapshot
            };
            (channel_id.clone(), source)
        })
        .collect())
}

/// User columns shared by the ledger and snapshot queries. Times are filled
/// in by the caller.
fn member_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<MemberInterval> {
    Ok(MemberInterval {
        channel_id: row
            .try_get("channel_id")
            .context("failed to read member channel_id")?,
        user_id: row.try_get("user_id").context("failed to read member user_id")?,
        user_email: row.try_get("email").context("failed to read member email")?,
        username: row
            .try_get("username")
            .context("failed to read member username")?,
        is_bot: row
            .try_get::<i64, _>("is_bot")
            .context("failed to read member is_bot")?
            != 0,
        user_delete_at: row
            .try_get("user_delete_at")
            .context("failed to read member delete_at")?,
        join_time: 0,
        leave_time: None,
    })
}
