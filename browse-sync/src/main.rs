//! browse-sync - live session viewer for a coordinator
//!
//! Commands:
//! - `status`: show configuration and whether the coordinator is reachable
//! - `messages <session>` / `files <session>` / `hooks <session>`: print one page (or more) of a list
//! - `watch <session>`: follow a session as the coordinator pushes changes
//!
//! Uses XDG Base Directory specification for file locations:
//! - Config: $XDG_CONFIG_HOME/browse-sync/config.toml (~/.config/browse-sync/config.toml)
//! - Logs: $XDG_STATE_HOME/browse-sync/browse-sync.log (~/.local/state/browse-sync/browse-sync.log)

mod render;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use browse_sync_core::pagination::PaginationCoordinator;
use browse_sync_core::projection;
use browse_sync_core::{
    Config, ConnectionKey, ConnectionManager, CoordinatorClient, Direction, EntityKind, FileChange,
    HookExecution, Message, Store, StoreChange, SyncEngine, WsOptions,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "browse-sync")]
#[command(about = "Browse live coding-agent sessions from a coordinator")]
#[command(version)]
struct Args {
    /// Items per page (default: from config)
    #[arg(long, global = true)]
    page_size: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show configuration and coordinator reachability
    Status,

    /// Print the newest messages of a session
    Messages {
        session: String,

        /// Additional older pages to load
        #[arg(long, default_value = "0")]
        older: usize,

        /// Print raw JSON records instead of rows
        #[arg(long)]
        json: bool,
    },

    /// Print the file changes of a session
    Files {
        session: String,

        #[arg(long)]
        json: bool,
    },

    /// Print the hook executions of a session
    Hooks {
        session: String,

        #[arg(long)]
        json: bool,
    },

    /// Follow a session until interrupted
    Watch { session: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = Config::load().context("failed to load configuration")?;
    if let Some(page_size) = args.page_size {
        config.sync.page_size = page_size;
    }
    config.validate().context("invalid configuration")?;

    let _log_guard =
        browse_sync_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("browse-sync starting");

    match args.command {
        Command::Status => cmd_status(&config).await,
        Command::Messages {
            session,
            older,
            json,
        } => cmd_messages(&config, &session, older, json).await,
        Command::Files { session, json } => cmd_files(&config, &session, json).await,
        Command::Hooks { session, json } => cmd_hooks(&config, &session, json).await,
        Command::Watch { session } => cmd_watch(&config, &session).await,
    }
}

async fn cmd_status(config: &Config) -> Result<()> {
    println!("browse-sync Configuration");
    println!("=========================");
    println!();

    let coordinator = &config.coordinator;
    println!("Config File:     {}", Config::config_path().display());
    println!("Log File:        {}", Config::log_path().display());
    println!("HTTP URL:        {}", coordinator.http_url);
    println!("WebSocket URL:   {}", coordinator.ws_url);
    println!(
        "API Key:         {}",
        if coordinator.api_key.is_some() {
            "<set>"
        } else {
            "<not set>"
        }
    );
    println!("Timeout:         {}s", coordinator.timeout_secs);
    println!("Reconnect Delay: {}s", coordinator.reconnect_delay_secs);
    println!("Page Size:       {}", config.sync.page_size);

    let client = CoordinatorClient::new(coordinator).context("failed to create coordinator client")?;
    let reachable = client.health_check().await?;

    println!();
    if reachable {
        println!("Coordinator: reachable");
    } else {
        println!("Coordinator: unreachable (is it running at {}?)", coordinator.base_url());
    }

    Ok(())
}

/// Load the first page of `key` plus `older` more pages into a fresh store.
async fn load_list(config: &Config, key: &ConnectionKey, older: usize) -> Result<Store> {
    let client = CoordinatorClient::new(&config.coordinator)
        .context("failed to create coordinator client")?;
    let mut pager = PaginationCoordinator::new(Arc::new(client), config.sync.page_size);
    let mut store = Store::new(&config.sync);

    pager
        .load_initial(&mut store, key)
        .await
        .with_context(|| format!("failed to load {key}"))?;

    // Messages page backward into history; newest-first lists page forward
    let direction = match key.list {
        browse_sync_core::ListKind::Messages => Direction::Backward,
        _ => Direction::Forward,
    };
    for _ in 0..older {
        let added = pager
            .load_more(&mut store, key, direction)
            .await
            .with_context(|| format!("failed to load more of {key}"))?;
        if added == 0 {
            break;
        }
    }

    Ok(store)
}

fn print_more_hint(store: &Store, key: &ConnectionKey) {
    if let Some(state) = store.connection(key) {
        let more = state.page_info().has_previous_page || state.page_info().has_next_page;
        println!();
        println!(
            "{} of {} loaded{}",
            state.len(),
            state.total_count(),
            if more { " (use --older to load more)" } else { "" }
        );
    }
}

async fn cmd_messages(config: &Config, session: &str, older: usize, json: bool) -> Result<()> {
    let key = ConnectionKey::messages(session);
    let store = load_list(config, &key, older).await?;

    if json {
        let records: Vec<Message> = store.connection_nodes(&key);
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    let now = Utc::now();
    let messages: Vec<Message> = store.connection_nodes(&key);
    if messages.is_empty() {
        println!("No messages in session {}", session);
        return Ok(());
    }
    for msg in &messages {
        println!("{}", render::message_line(msg, now));
    }
    print_more_hint(&store, &key);
    Ok(())
}

async fn cmd_files(config: &Config, session: &str, json: bool) -> Result<()> {
    let key = ConnectionKey::file_changes(session);
    let store = load_list(config, &key, 0).await?;
    let changes: Vec<FileChange> = store.connection_nodes(&key);

    if json {
        println!("{}", serde_json::to_string_pretty(&changes)?);
        return Ok(());
    }

    if changes.is_empty() {
        println!("No file changes in session {}", session);
        return Ok(());
    }
    let now = Utc::now();
    for change in &changes {
        println!("{}", render::file_change_line(change, now));
    }
    print_more_hint(&store, &key);
    Ok(())
}

async fn cmd_hooks(config: &Config, session: &str, json: bool) -> Result<()> {
    let key = ConnectionKey::hook_executions(session);
    let store = load_list(config, &key, 0).await?;
    let hooks: Vec<HookExecution> = store.connection_nodes(&key);

    if json {
        println!("{}", serde_json::to_string_pretty(&hooks)?);
        return Ok(());
    }

    if hooks.is_empty() {
        println!("No hook executions in session {}", session);
        return Ok(());
    }
    for hook in &hooks {
        println!("{}", render::hook_line(hook));
    }

    let stats = projection::hook_stats(&store, session);
    println!();
    println!(
        "Passed: {}",
        browse_sync_core::format::ratio(stats.passed_hooks, stats.total_hooks)
    );
    print_more_hint(&store, &key);
    Ok(())
}

async fn cmd_watch(config: &Config, session: &str) -> Result<()> {
    let client = CoordinatorClient::new(&config.coordinator)
        .context("failed to create coordinator client")?;
    let connection = ConnectionManager::connect(WsOptions::from(&config.coordinator));
    let engine = SyncEngine::start(&config.sync, Arc::new(client), connection);

    let mut changes = engine.changes();
    let watch = engine
        .watch_session(session)
        .await
        .with_context(|| format!("failed to watch session {session}"))?;

    println!("Watching session {} (Ctrl-C to stop)", session);

    let key = ConnectionKey::messages(session);
    let mut printed: HashSet<String> = HashSet::new();
    let mut last_summary = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            change = changes.recv() => match change {
                Ok(StoreChange::Connection { key: changed }) if changed == key => {
                    print_new_messages(&engine, &key, &mut printed).await?;
                }
                Ok(StoreChange::Record { kind: EntityKind::Session, .. })
                | Ok(StoreChange::Connection { .. }) => {
                    let session_id = session.to_string();
                    let summary = engine
                        .read(move |store, _| {
                            projection::session_summary(store, &session_id, Utc::now())
                        })
                        .await?;
                    // Only reprint when something besides the clock moved
                    let comparable = (
                        summary.message_count,
                        summary.file_change_count,
                        summary.todo_counts,
                        summary.hook_stats.total_hooks,
                        summary.is_active,
                    );
                    if last_summary != Some(comparable) {
                        for line in render::summary_lines(&summary, Utc::now()) {
                            println!("{}", line);
                        }
                        last_summary = Some(comparable);
                    }
                }
                Ok(StoreChange::Stale { key }) => {
                    tracing::debug!(connection = %key, "List went stale");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Viewer fell behind, catching up");
                    print_new_messages(&engine, &key, &mut printed).await?;
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    drop(watch);
    engine.shutdown().await?;
    println!();
    println!("Stopped watching {}", session);
    Ok(())
}

/// Print messages of `key` that have not been printed yet, in list order.
async fn print_new_messages(
    engine: &SyncEngine,
    key: &ConnectionKey,
    printed: &mut HashSet<String>,
) -> Result<()> {
    let k = key.clone();
    let messages: Vec<Message> = engine.read(move |store, _| store.connection_nodes(&k)).await?;
    let now = Utc::now();
    for msg in messages {
        if printed.insert(msg.id.clone()) {
            println!("{}", render::message_line(&msg, now));
        }
    }
    Ok(())
}
