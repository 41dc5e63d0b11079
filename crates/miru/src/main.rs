//! Miru
//!
//! Loads JavaScript extensions from a directory and answers queries against
//! them, or keeps running and hot-reloads them as files change.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use miru::cli::{self, Args, Command};
use miru::config::AppConfig;
use miru::logging;
use miru_js_runtime::ExtensionRuntime;

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(&args.config)?;
    args.apply(&mut config);
    logging::init(&config.log);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?
        .block_on(async_main(args, config))
}

async fn async_main(args: Args, config: AppConfig) -> Result<()> {
    info!("Starting Miru v{}", env!("CARGO_PKG_VERSION"));
    info!("Extension directory: {}", config.runtime.extension_dir.display());

    let runtime = ExtensionRuntime::in_memory(config.runtime).context("Failed to create extension runtime")?;

    if args.command == Command::Run {
        return cli::run(&runtime).await;
    }

    cli::scan(&runtime).await?;
    let output = cli::execute(&runtime, &args.command).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
