//! channel-history CLI entry point.

use anyhow::Context as _;
use channel_history::config::Config;
use channel_history::db::Db;
use channel_history::history::{HistoryStore, RetentionBatchConfig, RetentionCursor};
use channel_history::maintenance::Maintenance;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "channel-history")]
#[command(about = "Channel membership history for compliance export")]
struct Cli {
    /// Path to config file (optional)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record that a user joined a channel
    Join {
        user_id: String,
        channel_id: String,
        /// Epoch milliseconds, defaults to now
        #[arg(long)]
        at: Option<i64>,
    },
    /// Record that a user left a channel
    Leave {
        user_id: String,
        channel_id: String,
        /// Epoch milliseconds, defaults to now
        #[arg(long)]
        at: Option<i64>,
    },
    /// Channels with membership changes or posts in a window
    Active { start: i64, end: i64 },
    /// Members of the given channels during a window
    Members {
        start: i64,
        end: i64,
        #[arg(required = true)]
        channel_ids: Vec<String>,
    },
    /// Channels a user has left since a time
    LeftSince { user_id: String, since: i64 },
    /// Run one retention purge batch
    Purge {
        /// Rows to delete at most
        #[arg(long, default_value_t = 1000)]
        limit: i64,
        /// Global cutoff in epoch milliseconds, 0 disables the global tier
        #[arg(long, default_value_t = 0)]
        global_end_time: i64,
        /// Cursor JSON printed by a previous batch
        #[arg(long)]
        cursor: Option<String>,
    },
    /// Delete one batch of rows whose channel no longer exists
    Reap {
        #[arg(long, default_value_t = 1000)]
        limit: i64,
    },
    /// Run the maintenance loop until interrupted
    Maintain,
}

#[derive(Serialize)]
struct PurgeOutput {
    deleted: i64,
    cursor: RetentionCursor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)
            .with_context(|| format!("failed to load config from {}", config_path.display()))?
    } else {
        Config::load().context("failed to load configuration")?
    };

    tracing::debug!(database = %config.database_path.display(), "configuration loaded");

    let db = Db::connect(&config.database_path)
        .await
        .context("failed to open history database")?;
    let store = HistoryStore::new(db.sqlite.clone());

    let result = run(cli.command, store, &config).await;
    db.close().await;
    result
}

async fn run(command: Command, store: HistoryStore, config: &Config) -> anyhow::Result<()> {
    let now = chrono::Utc::now().timestamp_millis();

    match command {
        Command::Join {
            user_id,
            channel_id,
            at,
        } => {
            store
                .log_join_event(&user_id, &channel_id, at.unwrap_or(now))
                .await?;
        }
        Command::Leave {
            user_id,
            channel_id,
            at,
        } => {
            let closed = store
                .log_leave_event(&user_id, &channel_id, at.unwrap_or(now))
                .await?;
            print_json(&closed)?;
        }
        Command::Active { start, end } => {
            print_json(&store.get_channels_with_activity_during(start, end).await?)?;
        }
        Command::Members {
            start,
            end,
            channel_ids,
        } => {
            print_json(
                &store
                    .get_users_in_channel_during(start, end, channel_ids.as_slice())
                    .await?,
            )?;
        }
        Command::LeftSince { user_id, since } => {
            print_json(&store.get_channels_left_since(&user_id, since).await?)?;
        }
        Command::Purge {
            limit,
            global_end_time,
            cursor,
        } => {
            let cursor = match cursor {
                Some(raw) => serde_json::from_str(&raw).context("invalid --cursor JSON")?,
                None => RetentionCursor::default(),
            };
            let batch = RetentionBatchConfig {
                now,
                global_policy_end_time: global_end_time,
                limit,
            };
            let (deleted, cursor) = store
                .permanent_delete_batch_for_retention_policies(batch, cursor)
                .await?;
            print_json(&PurgeOutput { deleted, cursor })?;
        }
        Command::Reap { limit } => {
            print_json(&store.delete_orphaned_rows(limit).await?)?;
        }
        Command::Maintain => {
            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            let handle = Maintenance::new(store, config.maintenance).spawn(shutdown_rx);

            tracing::info!(
                interval_secs = config.maintenance.interval_secs,
                "maintenance loop started"
            );
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for shutdown signal")?;
            tracing::info!("shutdown signal received");

            shutdown_tx.send(true).ok();
            handle.await.context("maintenance loop panicked")?;
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render output")?;
    println!("{rendered}");
    Ok(())
}
