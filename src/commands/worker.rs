use super::{cancel_on_signal, open_database};
use crate::config::OrchestratorConfig;
use crate::database::Stage;
use crate::supervisor::process::{EXIT_STORE_ERROR, EXIT_TRANSIENT};
use crate::worker::executor::CommandExecutor;
use crate::worker::Worker;
use anyhow::anyhow;
use tokio_util::sync::CancellationToken;

/// Run one worker to completion and return its process exit code.
pub async fn run_worker(
    config: &OrchestratorConfig,
    stage: Stage,
    feed: &str,
) -> anyhow::Result<i32> {
    let spec = config
        .executors
        .for_stage(stage)
        .cloned()
        .ok_or_else(|| anyhow!("No executor configured for the {} stage", stage))?;

    let db = open_database(config)?;
    let executor = CommandExecutor::new(spec)?;
    let worker = Worker::new(db, executor, stage, feed, config.claim_batch);

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());

    match worker.run(&cancel).await {
        Ok(outcome) => {
            log::info!(
                "Worker {} for {} finished: {} processed, {} failed, {} contended",
                worker.worker_id(),
                feed,
                outcome.processed,
                outcome.failed,
                outcome.contended
            );
            Ok(if outcome.rate_limited { EXIT_TRANSIENT } else { 0 })
        }
        Err(e) => {
            log::error!("Worker {} for {} stopped on store error: {}", worker.worker_id(), feed, e);
            Ok(EXIT_STORE_ERROR)
        }
    }
}
