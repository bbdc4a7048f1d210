//! Background retention purge and orphan cleanup.
//!
//! A pass drives the retention purger until a batch comes back empty, then
//! reaps orphaned rows. Both work in bounded batches and yield between them,
//! so ledger writers and readers are never held off for long.

use crate::config::MaintenanceConfig;
use crate::error::Result;
use crate::history::{DAY_IN_MILLISECONDS, HistoryStore, RetentionBatchConfig, RetentionCursor};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Duration;

/// Totals for one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub rows_purged: i64,
    pub purge_batches: u32,
    pub orphans_deleted: i64,
    pub orphan_batches: u32,
}

/// Periodic retention purge and orphan reaper over one history store.
#[derive(Debug)]
pub struct Maintenance {
    store: HistoryStore,
    config: MaintenanceConfig,
}

impl Maintenance {
    pub fn new(store: HistoryStore, config: MaintenanceConfig) -> Self {
        Self { store, config }
    }

    /// Batch parameters for a pass starting at `now`.
    pub fn retention_config(&self, now: i64) -> RetentionBatchConfig {
        let global_policy_end_time = self
            .config
            .global_retention_days
            .map(|days| now - i64::from(days) * DAY_IN_MILLISECONDS)
            .unwrap_or(0);

        RetentionBatchConfig {
            now,
            global_policy_end_time,
            limit: self.config.purge_batch_size,
        }
    }

    pub async fn run_once(&self) -> Result<MaintenanceReport> {
        self.run_once_at(chrono::Utc::now().timestamp_millis())
            .await
    }

    /// One maintenance pass using `now` as the retention reference time.
    pub async fn run_once_at(&self, now: i64) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::default();
        let retention = self.retention_config(now);

        let mut cursor = RetentionCursor::default();
        while report.purge_batches < self.config.max_batches {
            let (deleted, next) = self
                .store
                .permanent_delete_batch_for_retention_policies(retention, cursor)
                .await?;
            report.purge_batches += 1;
            report.rows_purged += deleted;
            cursor = next;
            if deleted == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }

        while report.orphan_batches < self.config.max_batches {
            let deleted = self
                .store
                .delete_orphaned_rows(self.config.orphan_batch_size)
                .await?;
            report.orphan_batches += 1;
            report.orphans_deleted += deleted;
            if deleted < self.config.orphan_batch_size {
                break;
            }
            tokio::task::yield_now().await;
        }

        if report.purge_batches >= self.config.max_batches && !cursor.is_complete() {
            tracing::warn!(
                max_batches = self.config.max_batches,
                "retention purge hit its batch budget, remaining rows wait for the next pass"
            );
        }

        Ok(report)
    }

    /// Run a pass every `interval_secs` until `shutdown` turns true.
    ///
    /// The first pass runs immediately. A failed pass is logged and retried
    /// on the next tick.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                match self.run_once().await {
                    Ok(report) => tracing::info!(
                        rows_purged = report.rows_purged,
                        orphans_deleted = report.orphans_deleted,
                        purge_batches = report.purge_batches,
                        orphan_batches = report.orphan_batches,
                        "maintenance pass complete"
                    ),
                    Err(error) => tracing::warn!(%error, "maintenance pass failed"),
                }
            }

            tracing::debug!("maintenance loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::directory::{Channel, DirectoryStore};

    fn config(batch_size: i64, global_retention_days: Option<u32>) -> MaintenanceConfig {
        MaintenanceConfig {
            interval_secs: 1,
            purge_batch_size: batch_size,
            orphan_batch_size: batch_size,
            max_batches: 100,
            global_retention_days,
        }
    }

    async fn seed() -> (HistoryStore, DirectoryStore) {
        let db = Db::in_memory().await.expect("in-memory sqlite should open");
        let history = HistoryStore::new(db.sqlite.clone());
        let directory = DirectoryStore::new(db.sqlite);

        directory
            .save_channel(&Channel {
                id: "channel-1".into(),
                team_id: "team-1".into(),
                name: "general".into(),
                create_at: 0,
            })
            .await
            .expect("save channel");

        for n in 0..5 {
            let user = format!("user-{n}");
            history
                .log_join_event(&user, "channel-1", 1000 + n)
                .await
                .expect("join");
            history
                .log_leave_event(&user, "channel-1", 2000 + n)
                .await
                .expect("leave");
        }
        history
            .log_join_event("user-open", "channel-1", 1000)
            .await
            .expect("join");
        for n in 0..3 {
            history
                .log_join_event(&format!("user-{n}"), "channel-gone", 5_000_000_000 + n)
                .await
                .expect("join");
        }

        (history, directory)
    }

    #[tokio::test]
    async fn pass_purges_to_convergence_then_reaps() {
        let (history, _directory) = seed().await;
        let maintenance = Maintenance::new(history.clone(), config(2, Some(1)));

        let report = maintenance
            .run_once_at(2004 + DAY_IN_MILLISECONDS)
            .await
            .expect("pass should succeed");

        assert_eq!(report.rows_purged, 5);
        assert_eq!(report.purge_batches, 4);
        assert_eq!(report.orphans_deleted, 3);
        assert_eq!(report.orphan_batches, 2);
        assert_eq!(history.count_for_channel("channel-1").await.expect("count"), 1);

        let again = maintenance
            .run_once_at(2004 + DAY_IN_MILLISECONDS)
            .await
            .expect("second pass should succeed");
        assert_eq!(again.rows_purged, 0);
        assert_eq!(again.orphans_deleted, 0);
    }

    #[tokio::test]
    async fn disabled_global_retention_keeps_history() {
        let (history, _directory) = seed().await;
        let maintenance = Maintenance::new(history.clone(), config(10, None));

        assert_eq!(maintenance.retention_config(10_000).global_policy_end_time, 0);
        let report = maintenance.run_once_at(i64::MAX / 2).await.expect("pass");

        assert_eq!(report.rows_purged, 0);
        assert_eq!(report.purge_batches, 1);
        assert_eq!(history.count_for_channel("channel-1").await.expect("count"), 6);
    }

    #[tokio::test]
    async fn batch_budget_bounds_a_pass() {
        let (history, _directory) = seed().await;
        let mut budget = config(1, Some(1));
        budget.max_batches = 2;
        let maintenance = Maintenance::new(history.clone(), budget);

        let report = maintenance
            .run_once_at(2004 + DAY_IN_MILLISECONDS)
            .await
            .expect("pass");

        assert_eq!(report.rows_purged, 2);
        assert_eq!(report.orphans_deleted, 2);
        assert_eq!(history.count_for_channel("channel-1").await.expect("count"), 4);
    }

    #[tokio::test]
    async fn spawned_loop_runs_and_stops_on_shutdown() {
        let (history, _directory) = seed().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = Maintenance::new(history.clone(), config(100, None)).spawn(shutdown_rx);

        let mut remaining = history
            .count_for_channel("channel-gone")
            .await
            .expect("count");
        for _ in 0..200 {
            if remaining == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            remaining = history
                .count_for_channel("channel-gone")
                .await
                .expect("count");
        }
        assert_eq!(remaining, 0, "orphans should be reaped by the first pass");

        shutdown_tx.send(true).expect("loop should still be listening");
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop should stop")
            .expect("loop should not panic");
    }
}
