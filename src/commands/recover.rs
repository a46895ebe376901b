use super::open_database;
use crate::config::OrchestratorConfig;
use anyhow::Context;
use serde::Serialize;

#[derive(Serialize)]
struct RecoverOutput {
    downloading: usize,
    transcribing: usize,
    enriching: usize,
    orphaned: usize,
    locks_cleared: usize,
    stale_locks_swept: usize,
}

/// Demote every stuck in-progress item and clear stale locks, printing a JSON report.
///
/// Only safe while no workers are running.
pub fn recover(config: &OrchestratorConfig) -> anyhow::Result<()> {
    let db = open_database(config)?;

    let report = db.recover_stuck().context("Crash recovery failed")?;
    let swept = db
        .sweep_stale(config.stale_lock_age())
        .context("Stale lock sweep failed")?;

    let output = RecoverOutput {
        downloading: report.downloading,
        transcribing: report.transcribing,
        enriching: report.enriching,
        orphaned: report.orphaned,
        locks_cleared: report.locks_cleared,
        stale_locks_swept: swept,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
