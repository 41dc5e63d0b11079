//! Command-line surface.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use miru_js_runtime::{ExtensionRuntime, LoadOutcome};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::AppConfig;

/// Miru extension runtime
#[derive(Parser, Debug)]
#[command(name = "miru")]
#[command(about = "Run and query Miru JavaScript extensions", long_about = None)]
pub struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "miru.toml")]
    pub config: PathBuf,

    /// Extension directory (overrides the config file)
    #[arg(short, long)]
    pub extensions: Option<PathBuf>,

    /// Start every extension during the scan instead of on first call
    #[arg(long)]
    pub eager: bool,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Load every extension, watch the directory and keep running
    Run,
    /// Print every registered extension and its status
    List,
    /// Latest items of a package
    Latest {
        package: String,
        #[arg(default_value_t = 1)]
        page: i64,
    },
    /// Search a package
    Search {
        package: String,
        keyword: String,
        #[arg(long, default_value_t = 1)]
        page: i64,
        /// Filter selection as JSON
        #[arg(long)]
        filter: Option<String>,
    },
    /// Detail page of an item
    Detail { package: String, url: String },
    /// Playable or readable content of an episode
    Watch { package: String, url: String },
    /// Filter definitions of a package
    Filter {
        package: String,
        /// Current filter selection as JSON
        #[arg(long)]
        filter: Option<String>,
    },
    /// Latest episode marker of an item
    CheckUpdate { package: String, url: String },
}

impl Args {
    /// Apply flag overrides on top of the file configuration.
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(dir) = &self.extensions {
            config.runtime.extension_dir = dir.clone();
            let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            config.resolve_paths(&cwd);
        }
        if self.eager {
            config.runtime.eager_init = true;
        }
        if self.log_json {
            config.log.json = true;
        }
    }
}

fn parse_filter(filter: Option<&str>) -> Result<Option<Value>> {
    filter
        .map(|raw| serde_json::from_str(raw).with_context(|| format!("Invalid filter JSON: {}", raw)))
        .transpose()
}

/// Run a one-shot command against a scanned runtime and return its JSON
/// result.
pub async fn execute(runtime: &ExtensionRuntime, command: &Command) -> Result<Value> {
    let value = match command {
        Command::Run => anyhow::bail!("`run` is not a one-shot command"),
        Command::List => serde_json::to_value(runtime.list_extensions())?,
        Command::Latest { package, page } => serde_json::to_value(
            runtime
                .latest(package, *page)
                .await
                .with_context(|| format!("latest failed for {}", package))?,
        )?,
        Command::Search {
            package,
            keyword,
            page,
            filter,
        } => {
            let filter = parse_filter(filter.as_deref())?;
            serde_json::to_value(
                runtime
                    .search(package, *page, keyword, filter)
                    .await
                    .with_context(|| format!("search failed for {}", package))?,
            )?
        }
        Command::Detail { package, url } => serde_json::to_value(
            runtime
                .detail(package, url)
                .await
                .with_context(|| format!("detail failed for {}", package))?,
        )?,
        Command::Watch { package, url } => serde_json::to_value(
            runtime
                .watch(package, url)
                .await
                .with_context(|| format!("watch failed for {}", package))?,
        )?,
        Command::Filter { package, filter } => {
            let filter = parse_filter(filter.as_deref())?;
            serde_json::to_value(
                runtime
                    .create_filter(package, filter)
                    .await
                    .with_context(|| format!("createFilter failed for {}", package))?,
            )?
        }
        Command::CheckUpdate { package, url } => Value::String(
            runtime
                .check_update(package, url)
                .await
                .with_context(|| format!("checkUpdate failed for {}", package))?,
        ),
    };
    Ok(value)
}

/// Scan, log what was found and report broken extensions.
pub async fn scan(runtime: &ExtensionRuntime) -> Result<Vec<LoadOutcome>> {
    let dir = runtime.config().extension_dir.display().to_string();
    let outcomes = runtime
        .scan()
        .await
        .with_context(|| format!("Failed to scan extension directory {}", dir))?;

    for outcome in &outcomes {
        if let LoadOutcome::Unhealthy { package, error } = outcome {
            warn!("Extension {} is unavailable: {}", package, error);
        }
    }
    Ok(outcomes)
}

/// Long-running mode: watch the directory and log registry changes until
/// a shutdown signal arrives.
pub async fn run(runtime: &ExtensionRuntime) -> Result<()> {
    let outcomes = scan(runtime).await?;
    info!("Loaded {} extensions", outcomes.len());

    let watcher = runtime
        .watch_directory()
        .context("Failed to start extension watcher")?;
    tokio::spawn(watcher.run());
    info!("Extension watcher started");

    let mut events = runtime.subscribe();
    let log_events = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => info!(target: "miru::registry", "{}", json),
                    Err(e) => warn!("Failed to encode registry event: {}", e),
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Dropped {} registry events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    shutdown_signal().await;
    log_events.abort();
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}
