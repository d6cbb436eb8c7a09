mod commands;
mod config;
mod knowledge;
mod parser;
mod platform;
mod router;
mod scheduler;
mod session;
#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::builtin::builtin_registry;
use crate::commands::Services;
use crate::config::Config;
use crate::knowledge::loader::load_wiki_dir;
use crate::knowledge::KnowledgeStore;
use crate::parser::InputParser;
use crate::platform::gitter::GitterBackend;
use crate::platform::retry::RetryPolicy;
use crate::router::Router;
use crate::scheduler::tasks::{register_builtin_tasks, run_announcer, run_rescan_listener};
use crate::scheduler::Scheduler;
use crate::session::RoomSessionManager;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,roombot=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Bot: {} v{} ({})", config.bot.name, config.bot.version, config.bot.env);
    info!("  Rooms: {}", config.rooms.len());
    info!("  Wiki: {}", config.knowledge.directory.display());

    // Knowledge base
    let replies = config.knowledge.static_replies.clone();
    let store = match &config.knowledge.database_path {
        Some(path) => KnowledgeStore::open(path, replies)?,
        None => KnowledgeStore::open_in_memory(replies)?,
    };
    load_wiki_dir(&config.knowledge.directory, &store).await?;

    // Commands and routing
    let commands = builtin_registry()?.freeze();
    let rescan = Arc::new(Notify::new());
    let (announcements, announce_queue) = unbounded_channel();
    let services = Arc::new(Services {
        config: config.clone(),
        knowledge: Arc::new(store),
        rescan: Arc::clone(&rescan),
        announcements,
    });
    let router = Arc::new(Router::new(commands, services));

    // Rooms
    let backend = Arc::new(GitterBackend::new(config.gitter.clone()));
    let sessions = RoomSessionManager::new(
        backend,
        router,
        InputParser::new(&config.bot.name)?,
        RetryPolicy::from_config(&config.backend),
        &config.bot.name,
    );

    info!("Bot is starting...");
    sessions.start(&config.rooms).await;
    sessions.scan_rooms().await;
    info!("Tracking {} rooms", sessions.sessions().await.len());
    let unreachable = sessions.unreachable_rooms().await;
    if !unreachable.is_empty() {
        tracing::warn!("Unreachable rooms, retrying on scan: {:?}", unreachable);
    }

    // Background tasks
    let mut scheduler = Scheduler::new().await?;
    register_builtin_tasks(&mut scheduler, Arc::clone(&sessions), &config.scan.cron).await?;
    scheduler.start().await?;

    let cancel = CancellationToken::new();
    let rescan_task = tokio::spawn(run_rescan_listener(
        Arc::clone(&sessions),
        rescan,
        cancel.clone(),
    ));
    let announce_task = tokio::spawn(run_announcer(
        Arc::clone(&sessions),
        announce_queue,
        cancel.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutting down...");

    cancel.cancel();
    for task in [rescan_task, announce_task] {
        if let Err(e) = task.await {
            tracing::warn!("Background task ended abnormally: {}", e);
        }
    }
    scheduler.shutdown().await?;
    sessions.shutdown().await;

    Ok(())
}
