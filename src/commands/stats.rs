use super::open_database;
use crate::config::OrchestratorConfig;
use crate::database::{ItemStatus, QueueStats};
use anyhow::Context;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Serialize)]
struct StatsOutput {
    schema_version: i64,
    statuses: BTreeMap<ItemStatus, i64>,
    queues: Vec<QueueStats>,
    locks: i64,
}

/// Print status counts (optionally for one queue), per-queue rollups and the
/// live lock count as JSON.
pub fn stats(config: &OrchestratorConfig, queue: Option<&str>) -> anyhow::Result<()> {
    let db = open_database(config)?;

    if let Some(queue) = queue {
        if !db.queue_names()?.iter().any(|name| name == queue) {
            log::warn!("Queue {} has no items", queue);
        }
    }

    let output = StatsOutput {
        schema_version: db.schema_version()?,
        statuses: db.stats(queue).context("Failed to count items")?,
        queues: db.queue_stats().context("Failed to read queue stats")?,
        locks: db.count_locks()?,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
