use super::{cancel_on_signal, open_database};
use crate::config::OrchestratorConfig;
use crate::feeds::{resolve_totals, CatalogTotals, StaticTotals, StoreTotals};
use crate::progress::count_source;
use crate::supervisor::process::ProcessLauncher;
use crate::supervisor::Supervisor;
use anyhow::Context;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Recover, resolve feed totals, then run the control loop until a shutdown signal.
pub async fn supervise(
    config: OrchestratorConfig,
    config_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    let db = open_database(&config)?;

    std::fs::create_dir_all(&config.log_dir)
        .with_context(|| format!("Failed to create log directory {:?}", config.log_dir))?;
    let launcher = ProcessLauncher::current_exe(config_path, config.log_dir.clone())
        .context("Failed to locate the orchestrator executable")?;

    let feeds = config.feeds.clone();
    let counts = count_source(&config, db.clone());
    let mut supervisor = Supervisor::new(config, db.clone(), counts, launcher);

    let recovered = supervisor.startup().context("Startup recovery failed")?;
    if recovered.total() > 0 || recovered.locks_cleared > 0 {
        log::warn!(
            "Recovered {} stuck items ({} orphaned), cleared {} locks",
            recovered.total(),
            recovered.orphaned,
            recovered.locks_cleared
        );
    }

    let static_totals = StaticTotals::from_feeds(&feeds);
    let needs_catalog: Vec<_> = feeds.iter().filter(|f| f.total.is_none()).cloned().collect();
    let catalog_totals = CatalogTotals::discover(&db, &needs_catalog).await;
    let store_totals = StoreTotals::new(db.clone());

    let totals = resolve_totals(&feeds, &[&static_totals, &catalog_totals, &store_totals]);
    for (feed, total) in &totals {
        log::info!("Feed {}: {} items expected", feed, total);
    }
    supervisor.set_totals(totals);

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());
    supervisor.run(cancel).await;

    Ok(())
}
