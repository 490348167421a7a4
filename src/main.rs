use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;

use briefed::config::Config;
use briefed::feed::{
    build_http_client, FeedFetcher, FeedStatus, IngestOutcome, Ingestor, UpdateSummary,
};
use briefed::storage::{Database, DatabaseError};
use briefed::util::{Shutdown, ShutdownTrigger};

/// Get the config directory path (~/.config/briefed/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    let config_dir = PathBuf::from(home).join(".config").join("briefed");
    Ok(config_dir)
}

#[derive(Parser, Debug)]
#[command(name = "briefed", about = "RSS/Atom feed ingestion with deduplication")]
struct Args {
    /// Config file (default: ~/.config/briefed/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Database file, overriding `database_path` from the config
    #[arg(long, global = true, value_name = "FILE")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Subscribe to a feed and ingest its current articles
    Subscribe { url: String },
    /// List subscribed feeds
    Feeds,
    /// Poll every active feed
    Update {
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Poll one feed
    UpdateFeed { id: i64 },
    /// Re-fetch a feed and correct stored publish dates
    ResyncDates { id: i64 },
    /// Delete articles and tombstones past their retention period
    Prune,
    /// Delete one article; it will not be ingested again
    DeleteArticle { id: i64 },
    /// Poll on the configured interval until interrupted
    Daemon,
}

/// Create the config directory with user-only permissions.
fn ensure_config_dir(config_dir: &Path) -> Result<()> {
    if !config_dir.exists() {
        std::fs::create_dir_all(config_dir).context("Failed to create config directory")?;
        tracing::info!(path = %config_dir.display(), "Created config directory");
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        match std::fs::metadata(config_dir) {
            Ok(metadata) => {
                let mut perms = metadata.permissions();
                perms.set_mode(0o700);
                if let Err(e) = std::fs::set_permissions(config_dir, perms) {
                    tracing::warn!(
                        path = %config_dir.display(),
                        error = %e,
                        "Failed to set config directory permissions to 0700"
                    );
                }
            }
            Err(e) => {
                tracing::warn!(
                    path = %config_dir.display(),
                    error = %e,
                    "Failed to read config directory metadata"
                );
            }
        }
    }
    Ok(())
}

async fn open_database(path: &Path) -> Result<Database> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create '{}'", parent.display()))?;
    }
    let path_str = path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;

    match Database::open(path_str).await {
        Ok(db) => Ok(db),
        Err(DatabaseError::Locked) => {
            eprintln!(
                "Error: Another instance of briefed appears to be writing to {}. Please try again later.",
                path.display()
            );
            std::process::exit(1);
        }
        Err(e) => Err(anyhow::anyhow!("Failed to open database: {}", e)),
    }
}

/// Fire the shutdown trigger on Ctrl-C or SIGTERM.
fn spawn_signal_handler(trigger: ShutdownTrigger) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        trigger.trigger();
    });
}

fn format_timestamp(ts: Option<i64>) -> String {
    ts.and_then(|t| DateTime::<Utc>::from_timestamp(t, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "never".to_string())
}

fn describe_outcome(outcome: &IngestOutcome) -> String {
    match outcome {
        IngestOutcome::Succeeded { inserted } => format!("{} new articles", inserted),
        IngestOutcome::PartiallyRecovered { inserted, skipped } => format!(
            "{} new articles, {} skipped (already stored by another feed)",
            inserted, skipped
        ),
        IngestOutcome::Failed(e) => format!("failed: {}", e),
        IngestOutcome::Skipped => "skipped: already being updated".to_string(),
    }
}

fn print_summary(summary: &UpdateSummary) {
    for report in &summary.reports {
        let status = match report.status {
            FeedStatus::Succeeded => "ok",
            FeedStatus::PartiallyRecovered => "partial",
            FeedStatus::Failed => "FAILED",
            FeedStatus::Skipped => "skipped",
        };
        match &report.message {
            Some(message) => println!("[{:>7}] {} - {}", status, report.title, message),
            None => println!(
                "[{:>7}] {} (+{})",
                status, report.title, report.inserted
            ),
        }
    }
    println!(
        "{} feeds: {} succeeded, {} failed, {} skipped; {} new articles",
        summary.total, summary.succeeded, summary.failed, summary.skipped, summary.inserted
    );
}

async fn run_daemon(ingestor: &Ingestor, config: &Config, shutdown: &Shutdown) -> Result<()> {
    let retention = config.retention();
    let mut poll = tokio::time::interval(config.refresh_interval());
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut prune = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
    prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    tracing::info!(
        interval_minutes = config.refresh_interval_minutes,
        "Daemon started"
    );

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            _ = poll.tick() => {
                if let Err(e) = ingestor.update_all_feeds().await {
                    tracing::error!(error = %e, "Feed update failed");
                }
            }
            _ = prune.tick() => {
                if let Err(e) = ingestor.prune(&retention).await {
                    tracing::error!(error = %e, "Prune failed");
                }
            }
        }
    }

    tracing::info!("Daemon stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing for debug logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_dir = get_config_dir()?;
    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => {
            ensure_config_dir(&config_dir)?;
            config_dir.join("config.toml")
        }
    };
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let db_path = args
        .db
        .clone()
        .unwrap_or_else(|| config.database_path_or(&config_dir));
    let db = open_database(&db_path).await?;

    let (trigger, shutdown) = Shutdown::channel();
    spawn_signal_handler(trigger);

    let client =
        build_http_client(&config.http_settings()).context("Failed to build HTTP client")?;
    let fetcher = FeedFetcher::new(client, config.retry_policy(), shutdown.clone());
    let ingestor = Ingestor::new(db.clone(), fetcher, config.ingest_options());

    match args.command {
        Command::Subscribe { url } => {
            let subscription = ingestor
                .subscribe(&url)
                .await
                .with_context(|| format!("Failed to subscribe to {}", url))?;
            if subscription.created {
                let outcome = subscription
                    .outcome
                    .as_ref()
                    .map(describe_outcome)
                    .unwrap_or_default();
                println!(
                    "Subscribed to \"{}\" (id {}): {}",
                    subscription.feed.title, subscription.feed.id, outcome
                );
            } else {
                println!(
                    "Already subscribed to \"{}\" (id {})",
                    subscription.feed.title, subscription.feed.id
                );
            }
        }
        Command::Feeds => {
            let feeds = db.load_all_feeds().await.context("Failed to load feeds")?;
            if feeds.is_empty() {
                println!("No feeds. Add one with: briefed subscribe <URL>");
            }
            for feed in feeds {
                let state = if feed.is_active { "" } else { " (inactive)" };
                println!("{:>4}  {}{}", feed.id, feed.title, state);
                println!(
                    "      {}  last fetched: {}",
                    feed.url,
                    format_timestamp(feed.last_fetched_at)
                );
                if let Some(error) = feed.last_error {
                    println!("      error: {}", error);
                }
            }
        }
        Command::Update { json } => {
            let summary = ingestor
                .update_all_feeds()
                .await
                .context("Failed to update feeds")?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&summary).context("Failed to encode summary")?
                );
            } else {
                print_summary(&summary);
            }
        }
        Command::UpdateFeed { id } => {
            let outcome = ingestor
                .update_feed(id)
                .await
                .with_context(|| format!("Failed to update feed {}", id))?;
            println!("Feed {}: {}", id, describe_outcome(&outcome));
            if matches!(outcome, IngestOutcome::Failed(_)) {
                std::process::exit(1);
            }
        }
        Command::ResyncDates { id } => {
            let changed = ingestor
                .resync_article_dates(id)
                .await
                .with_context(|| format!("Failed to resync dates for feed {}", id))?;
            println!("Feed {}: corrected {} publish dates", id, changed);
        }
        Command::Prune => {
            let report = ingestor
                .prune(&config.retention())
                .await
                .context("Failed to prune")?;
            println!(
                "Removed {} articles and {} tombstones",
                report.articles, report.tombstones
            );
        }
        Command::DeleteArticle { id } => {
            if db
                .delete_article(id)
                .await
                .context("Failed to delete article")?
            {
                println!("Deleted article {}", id);
            } else {
                anyhow::bail!("No article with id {}", id);
            }
        }
        Command::Daemon => {
            if let Err(e) = db.backfill_favicons().await {
                tracing::warn!(error = %e, "Favicon backfill failed");
            }
            run_daemon(&ingestor, &config, &shutdown).await?;
        }
    }

    Ok(())
}
