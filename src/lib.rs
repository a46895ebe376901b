pub mod cli;
mod commands;
pub mod config;
pub mod database;
pub mod error;
pub mod feeds;
pub mod progress;
pub mod supervisor;
pub mod worker;

use clap::Parser;
use cli::{Cli, Commands};

/// Parse the command line, set up logging and dispatch. Returns the process exit code.
pub fn run() -> anyhow::Result<i32> {
    let cli = Cli::parse();

    // Respect RUST_LOG if set, otherwise pick defaults from the verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "podcast_orchestrator=debug".to_string()
        } else {
            "podcast_orchestrator=info".to_string()
        }
    });

    // Logs go to stderr so `stats` and `recover` can print JSON on stdout
    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    let config = config::load_config_or_default(cli.config.as_deref())?;

    match cli.command {
        Commands::Supervise => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(commands::supervise(config, cli.config))?;
            Ok(0)
        }
        Commands::Worker { stage, feed } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(commands::run_worker(&config, stage, &feed))
        }
        Commands::Discover { feed } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(commands::discover(&config, feed.as_deref()))?;
            Ok(0)
        }
        Commands::Recover => {
            commands::recover(&config)?;
            Ok(0)
        }
        Commands::Stats { queue } => {
            commands::stats(&config, queue.as_deref())?;
            Ok(0)
        }
    }
}
