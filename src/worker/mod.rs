//! A single stage worker: claims items of one feed, runs the stage executor
//! on each and records the result.

pub mod executor;

use crate::database::{Database, ItemStatus, Stage, WorkItem};
use crate::error::StoreResult;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use executor::{CommandExecutor, ExecutorError, StageExecutor};

/// Summary of one worker run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerOutcome {
    pub processed: usize,
    pub failed: usize,
    /// Items skipped because another worker held their lock.
    pub contended: usize,
    /// Stopped early on a transient upstream failure.
    pub rate_limited: bool,
    pub interrupted: bool,
}

enum ItemResult {
    Done,
    Failed,
    Transient,
    Interrupted,
}

/// Releases a claimed lock however the claim ends.
struct LockGuard<'a> {
    db: &'a Database,
    item_id: i64,
    worker_id: &'a str,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        match self.db.release(self.item_id, self.worker_id) {
            Ok(true) => {}
            Ok(false) => log::warn!(
                "Lock on item {} was no longer held by {}",
                self.item_id,
                self.worker_id
            ),
            Err(e) => log::error!("Failed to release lock on item {}: {}", self.item_id, e),
        }
    }
}

pub struct Worker<E: StageExecutor> {
    db: Arc<Database>,
    executor: E,
    stage: Stage,
    feed: String,
    worker_id: String,
    claim_batch: usize,
}

impl<E: StageExecutor> Worker<E> {
    pub fn new(db: Arc<Database>, executor: E, stage: Stage, feed: &str, claim_batch: usize) -> Self {
        let worker_id = format!(
            "{}-{}-{}",
            stage,
            std::process::id(),
            uuid::Uuid::new_v4().simple()
        );
        Self {
            db,
            executor,
            stage,
            feed: feed.to_string(),
            worker_id,
            claim_batch: claim_batch.max(1),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim and process items until the feed has none left for this stage,
    /// the executor reports a transient failure, or `cancel` fires.
    ///
    /// Store errors end the run; whatever lock is held at that point is
    /// released on the way out.
    pub async fn run(&self, cancel: &CancellationToken) -> StoreResult<WorkerOutcome> {
        log::info!(
            "{} worker {} started for {}",
            self.stage,
            self.worker_id,
            self.feed
        );
        let mut outcome = WorkerOutcome::default();

        'claim: loop {
            if cancel.is_cancelled() {
                outcome.interrupted = true;
                break;
            }

            let candidates = self.db.list_by_status(
                self.stage.input_status(),
                Some(&self.feed),
                self.claim_batch,
            )?;
            if candidates.is_empty() {
                log::info!("No {} items left for {}", self.stage.input_status(), self.feed);
                break;
            }

            let mut claimed = false;
            for candidate in candidates {
                if cancel.is_cancelled() {
                    outcome.interrupted = true;
                    break 'claim;
                }

                if !self.db.acquire(candidate.id, &self.worker_id)? {
                    log::debug!("Item {} is held by another worker, skipping", candidate.id);
                    outcome.contended += 1;
                    continue;
                }
                let _guard = LockGuard {
                    db: &self.db,
                    item_id: candidate.id,
                    worker_id: &self.worker_id,
                };
                claimed = true;

                // Another worker may have finished it between listing and locking
                let Some(item) = self.db.get(candidate.id)? else {
                    continue;
                };
                if item.status != self.stage.input_status() {
                    continue;
                }

                match self.process(&item, cancel).await? {
                    ItemResult::Done => outcome.processed += 1,
                    ItemResult::Failed => outcome.failed += 1,
                    ItemResult::Transient => {
                        outcome.rate_limited = true;
                        break 'claim;
                    }
                    ItemResult::Interrupted => {
                        outcome.interrupted = true;
                        break 'claim;
                    }
                }
            }

            if !claimed {
                log::info!("Every remaining item for {} is held by other workers", self.feed);
                break;
            }
        }

        log::info!(
            "{} worker {} finished for {}: {} processed, {} failed",
            self.stage,
            self.worker_id,
            self.feed,
            outcome.processed,
            outcome.failed
        );
        Ok(outcome)
    }

    async fn process(&self, item: &WorkItem, cancel: &CancellationToken) -> StoreResult<ItemResult> {
        self.db
            .transition(item.id, self.stage.active_status(), None, None)?;
        log::info!("{} {}: {}", self.stage, item.id, item.item_title);

        let result = tokio::select! {
            _ = cancel.cancelled() => None,
            result = self.executor.execute(item) => Some(result),
        };

        match result {
            None => {
                log::info!("Interrupted while processing item {}, giving it back", item.id);
                self.db.demote(item.id)?;
                Ok(ItemResult::Interrupted)
            }
            Some(Ok(artifact)) => {
                self.db
                    .transition(item.id, self.stage.done_status(), None, Some(&artifact))?;
                log::info!("{} complete for item {}: {}", self.stage, item.id, artifact);
                Ok(ItemResult::Done)
            }
            Some(Err(ExecutorError::Transient(message))) => {
                log::warn!("Transient failure on item {}: {}", item.id, message);
                self.db.demote(item.id)?;
                Ok(ItemResult::Transient)
            }
            Some(Err(ExecutorError::Permanent(message))) => {
                log::error!("{} failed for item {}: {}", self.stage, item.id, message);
                self.db
                    .transition(item.id, ItemStatus::Failed, Some(&message), None)?;
                Ok(ItemResult::Failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Executor scripted per item title; unscripted items succeed.
    #[derive(Default)]
    struct ScriptedExecutor {
        results: Mutex<HashMap<String, ExecutorError>>,
        seen: Mutex<Vec<i64>>,
        hang: bool,
    }

    impl ScriptedExecutor {
        fn fail(self, title: &str, error: ExecutorError) -> Self {
            self.results.lock().unwrap().insert(title.to_string(), error);
            self
        }
    }

    impl StageExecutor for ScriptedExecutor {
        async fn execute(&self, item: &WorkItem) -> Result<String, ExecutorError> {
            self.seen.lock().unwrap().push(item.id);
            if self.hang {
                std::future::pending::<()>().await;
            }
            match self.results.lock().unwrap().remove(&item.item_title) {
                Some(error) => Err(error),
                None => Ok(format!("/artifacts/{}", item.id)),
            }
        }
    }

    fn setup(titles: &[&str]) -> (Arc<Database>, TempDir, Vec<i64>) {
        let temp = TempDir::new().unwrap();
        let db = Arc::new(Database::new(&temp.path().join("test.db")).unwrap());
        let ids = titles
            .iter()
            .map(|t| db.upsert("PodX", t, None, None).unwrap())
            .collect();
        (db, temp, ids)
    }

    #[tokio::test]
    async fn test_drains_feed_in_order() {
        let (db, _temp, ids) = setup(&["Ep1", "Ep2", "Ep3"]);
        db.upsert("PodY", "Other", None, None).unwrap();
        let worker = Worker::new(db.clone(), ScriptedExecutor::default(), Stage::Download, "PodX", 2);

        let outcome = worker.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.processed, 3);
        assert!(!outcome.rate_limited);
        assert_eq!(*worker.executor.seen.lock().unwrap(), ids);

        for id in &ids {
            let item = db.get(*id).unwrap().unwrap();
            assert_eq!(item.status, ItemStatus::Downloaded);
            assert_eq!(item.audio_path, Some(format!("/artifacts/{}", id)));
        }
        assert_eq!(db.count_locks().unwrap(), 0);
        let other = db.find("PodY", "Other").unwrap().unwrap();
        assert_eq!(other.status, ItemStatus::Pending);
    }

    #[tokio::test]
    async fn test_permanent_failure_marks_item_failed_and_continues() {
        let (db, _temp, ids) = setup(&["Ep1", "Ep2"]);
        let executor = ScriptedExecutor::default()
            .fail("Ep1", ExecutorError::Permanent("404 from host".to_string()));
        let worker = Worker::new(db.clone(), executor, Stage::Download, "PodX", 10);

        let outcome = worker.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.processed, 1);

        let failed = db.get(ids[0]).unwrap().unwrap();
        assert_eq!(failed.status, ItemStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some("404 from host"));
        assert_eq!(db.count_locks().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_gives_item_back_and_stops() {
        let (db, _temp, ids) = setup(&["Ep1", "Ep2"]);
        let executor = ScriptedExecutor::default()
            .fail("Ep1", ExecutorError::Transient("429".to_string()));
        let worker = Worker::new(db.clone(), executor, Stage::Download, "PodX", 10);

        let outcome = worker.run(&CancellationToken::new()).await.unwrap();
        assert!(outcome.rate_limited);
        assert_eq!(outcome.processed, 0);
        assert_eq!(db.get(ids[0]).unwrap().unwrap().status, ItemStatus::Pending);
        assert_eq!(db.get(ids[1]).unwrap().unwrap().status, ItemStatus::Pending);
        assert_eq!(db.count_locks().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_locked_items_are_skipped() {
        let (db, _temp, ids) = setup(&["Ep1", "Ep2"]);
        assert!(db.acquire(ids[0], "someone-else").unwrap());
        let worker = Worker::new(db.clone(), ScriptedExecutor::default(), Stage::Download, "PodX", 10);

        let outcome = worker.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.processed, 1);
        assert!(outcome.contended >= 1);
        // Loser never touched the contended item
        assert_eq!(db.get(ids[0]).unwrap().unwrap().status, ItemStatus::Pending);
        assert_eq!(db.lock_holder(ids[0]).unwrap().unwrap().worker_id, "someone-else");
    }

    #[tokio::test]
    async fn test_transcribe_stage_only_takes_downloaded_items() {
        let (db, _temp, ids) = setup(&["Ep1", "Ep2"]);
        db.transition(ids[1], ItemStatus::Downloading, None, None).unwrap();
        db.transition(ids[1], ItemStatus::Downloaded, None, Some("/a.mp3")).unwrap();
        let worker = Worker::new(db.clone(), ScriptedExecutor::default(), Stage::Transcribe, "PodX", 10);

        let outcome = worker.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.processed, 1);
        let item = db.get(ids[1]).unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Transcribed);
        assert!(item.transcript_path.is_some());
        assert_eq!(db.get(ids[0]).unwrap().unwrap().status, ItemStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancel_mid_item_demotes_and_releases() {
        let (db, _temp, ids) = setup(&["Ep1"]);
        let executor = ScriptedExecutor {
            hang: true,
            ..Default::default()
        };
        let worker = Worker::new(db.clone(), executor, Stage::Download, "PodX", 10);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcome = worker.run(&cancel).await.unwrap();
        assert!(outcome.interrupted);
        assert_eq!(db.get(ids[0]).unwrap().unwrap().status, ItemStatus::Pending);
        assert_eq!(db.count_locks().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_feed_exits_immediately() {
        let (db, _temp, _ids) = setup(&[]);
        let worker = Worker::new(db, ScriptedExecutor::default(), Stage::Enrich, "PodX", 10);
        let outcome = worker.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, WorkerOutcome::default());
    }
}
