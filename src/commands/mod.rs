//! Entry points for each CLI subcommand.

mod discover;
mod recover;
mod stats;
mod supervise;
mod worker;

pub use discover::discover;
pub use recover::recover;
pub use stats::stats;
pub use supervise::supervise;
pub use worker::run_worker;

use crate::config::OrchestratorConfig;
use crate::database::Database;
use anyhow::Context;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn open_database(config: &OrchestratorConfig) -> anyhow::Result<Arc<Database>> {
    let db = Database::new(&config.database_path)
        .with_context(|| format!("Failed to open database at {:?}", config.database_path))?;
    Ok(Arc::new(db))
}

/// Cancel `token` on ctrl-c or SIGTERM.
fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        token.cancel();
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {}", e);
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
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    log::info!("Shutdown signal received");
}
