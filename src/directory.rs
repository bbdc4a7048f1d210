//! Channels, users, posts, memberships and retention policies (SQLite).
//!
//! These tables belong to the surrounding server. The history engine only
//! reads them; the writers here let tooling and tests populate a database.

use crate::error::Result;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub team_id: String,
    pub name: String,
    pub create_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub username: String,
    pub is_bot: bool,
    pub delete_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub channel_id: String,
    pub user_id: String,
    pub message: String,
    pub create_at: i64,
    pub update_at: i64,
}

/// A retention policy and the channels and teams it applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    pub id: String,
    pub display_name: String,
    pub post_duration_days: i64,
    #[serde(default)]
    pub channel_ids: Vec<String>,
    #[serde(default)]
    pub team_ids: Vec<String>,
}

impl RetentionPolicy {
    pub fn new(display_name: impl Into<String>, post_duration_days: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            display_name: display_name.into(),
            post_duration_days,
            channel_ids: Vec::new(),
            team_ids: Vec::new(),
        }
    }

    pub fn for_channels(
        mut self,
        channel_ids: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.channel_ids.extend(channel_ids.into_iter().map(Into::into));
        self
    }

    pub fn for_teams(mut self, team_ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.team_ids.extend(team_ids.into_iter().map(Into::into));
        self
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryStore {
    pool: SqlitePool,
}

impl DirectoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn save_channel(&self, channel: &Channel) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO channels (id, team_id, name, create_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                team_id = excluded.team_id,
                name = excluded.name
            "#,
        )
        .bind(&channel.id)
        .bind(&channel.team_id)
        .bind(&channel.name)
        .bind(channel.create_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save channel {}", channel.id))?;

        Ok(())
    }

    /// Hard-delete a channel. History rows referencing it are left behind.
    pub async fn delete_channel(&self, channel_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM channels WHERE id = ?")
            .bind(channel_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete channel {channel_id}"))?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn channel_exists(&self, channel_id: &str) -> Result<bool> {
        let exists: i64 = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM channels WHERE id = ?)")
            .bind(channel_id)
            .fetch_one(&self.pool)
            .await
            .context("failed to check channel existence")?;

        Ok(exists != 0)
    }

    pub async fn save_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, email, username, is_bot, delete_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                email = excluded.email,
                username = excluded.username,
                is_bot = excluded.is_bot,
                delete_at = excluded.delete_at
            "#,
        )
        .bind(&user.id)
        .bind(&user.email)
        .bind(&user.username)
        .bind(user.is_bot as i64)
        .bind(user.delete_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save user {}", user.id))?;

        Ok(())
    }

    pub async fn save_post(&self, post: &Post) -> Result<()> {
        sqlx::query(
            "INSERT INTO posts (id, channel_id, user_id, message, create_at, update_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&post.id)
        .bind(&post.channel_id)
        .bind(&post.user_id)
        .bind(&post.message)
        .bind(post.create_at)
        .bind(post.update_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save post {}", post.id))?;

        Ok(())
    }

    /// Edit a post's message, moving its `update_at`.
    pub async fn update_post(&self, post_id: &str, message: &str, update_at: i64) -> Result<bool> {
        let result = sqlx::query("UPDATE posts SET message = ?, update_at = ? WHERE id = ?")
            .bind(message)
            .bind(update_at)
            .bind(post_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to update post {post_id}"))?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn save_member(&self, channel_id: &str, user_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO channel_members (channel_id, user_id) VALUES (?, ?) \
             ON CONFLICT (channel_id, user_id) DO NOTHING",
        )
        .bind(channel_id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("failed to save channel member")?;

        Ok(())
    }

    pub async fn remove_member(&self, channel_id: &str, user_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM channel_members WHERE channel_id = ? AND user_id = ?")
            .bind(channel_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("failed to remove channel member")?;

        Ok(result.rows_affected() > 0)
    }

    /// Save a policy and replace its channel and team assignments.
    ///
    /// A channel or team belongs to at most one policy; assigning it here
    /// moves it away from any previous policy.
    pub async fn save_retention_policy(&self, policy: &RetentionPolicy) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to open retention policy transaction")?;

        sqlx::query(
            r#"
            INSERT INTO retention_policies (id, display_name, post_duration_days)
            VALUES (?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                post_duration_days = excluded.post_duration_days
            "#,
        )
        .bind(&policy.id)
        .bind(&policy.display_name)
        .bind(policy.post_duration_days)
        .execute(&mut *tx)
        .await
        .context("failed to save retention policy")?;

        sqlx::query("DELETE FROM retention_policies_channels WHERE policy_id = ?")
            .bind(&policy.id)
            .execute(&mut *tx)
            .await
            .context("failed to clear retention policy channels")?;
        sqlx::query("DELETE FROM retention_policies_teams WHERE policy_id = ?")
            .bind(&policy.id)
            .execute(&mut *tx)
            .await
            .context("failed to clear retention policy teams")?;

        for channel_id in &policy.channel_ids {
            sqlx::query(
                "INSERT INTO retention_policies_channels (policy_id, channel_id) VALUES (?, ?) \
                 ON CONFLICT(channel_id) DO UPDATE SET policy_id = excluded.policy_id",
            )
            .bind(&policy.id)
            .bind(channel_id)
            .execute(&mut *tx)
            .await
            .context("failed to assign retention policy channel")?;
        }

        for team_id in &policy.team_ids {
            sqlx::query(
                "INSERT INTO retention_policies_teams (policy_id, team_id) VALUES (?, ?) \
                 ON CONFLICT(team_id) DO UPDATE SET policy_id = excluded.policy_id",
            )
            .bind(&policy.id)
            .bind(team_id)
            .execute(&mut *tx)
            .await
            .context("failed to assign retention policy team")?;
        }

        tx.commit()
            .await
            .context("failed to commit retention policy transaction")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    #[tokio::test]
    async fn deleting_channel_removes_existence() {
        let db = Db::in_memory().await.expect("in-memory sqlite should open");
        let directory = DirectoryStore::new(db.sqlite);
        directory
            .save_channel(&Channel {
                id: "channel-1".into(),
                team_id: "team-1".into(),
                name: "town-square".into(),
                create_at: 1,
            })
            .await
            .expect("save channel");

        assert!(directory.channel_exists("channel-1").await.expect("exists"));
        assert!(directory.delete_channel("channel-1").await.expect("delete"));
        assert!(!directory.channel_exists("channel-1").await.expect("exists"));
        let removed = directory
            .delete_channel("channel-1")
            .await
            .expect("second delete");
        assert!(!removed);
    }

    #[tokio::test]
    async fn reassigning_channel_moves_it_between_policies() {
        let db = Db::in_memory().await.expect("in-memory sqlite should open");
        let pool = db.sqlite.clone();
        let directory = DirectoryStore::new(db.sqlite);

        let first = RetentionPolicy::new("first", 30).for_channels(["channel-1"]);
        let second = RetentionPolicy::new("second", 90).for_channels(["channel-1"]);
        directory
            .save_retention_policy(&first)
            .await
            .expect("first policy");
        directory
            .save_retention_policy(&second)
            .await
            .expect("second policy");

        let policy_id: String = sqlx::query_scalar(
            "SELECT policy_id FROM retention_policies_channels WHERE channel_id = 'channel-1'",
        )
        .fetch_one(&pool)
        .await
        .expect("assignment row");
        assert_eq!(policy_id, second.id);
    }
}
