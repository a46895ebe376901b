use super::process::{ExitKind, ProcessHandle};
use crate::database::Stage;
use std::time::Instant;

/// A worker process launched by this supervisor.
pub struct TrackedWorker {
    pub stage: Stage,
    pub feed: String,
    pub pid: u32,
    pub launched_at: Instant,
    /// Feed finished this stage; no longer counted against the feed.
    pub retired: bool,
    handle: Box<dyn ProcessHandle>,
}

/// A tracked worker that has exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapedWorker {
    pub stage: Stage,
    pub feed: String,
    pub pid: u32,
    pub exit: ExitKind,
}

/// Structured table of launched workers, replacing process-list discovery.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: Vec<TrackedWorker>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, stage: Stage, feed: &str, handle: Box<dyn ProcessHandle>, now: Instant) {
        self.workers.push(TrackedWorker {
            stage,
            feed: feed.to_string(),
            pid: handle.pid(),
            launched_at: now,
            retired: false,
            handle,
        });
    }

    /// Remove and return every worker whose process has exited.
    pub fn reap(&mut self) -> Vec<ReapedWorker> {
        let mut reaped = Vec::new();

        self.workers.retain_mut(|worker| {
            let exit = match worker.handle.poll_exit() {
                Ok(exit) => exit,
                Err(e) => {
                    log::warn!("Failed to poll worker {}: {}", worker.pid, e);
                    if worker.handle.is_alive() {
                        None
                    } else {
                        Some(ExitKind::Failed(None))
                    }
                }
            };

            match exit {
                Some(exit) => {
                    reaped.push(ReapedWorker {
                        stage: worker.stage,
                        feed: worker.feed.clone(),
                        pid: worker.pid,
                        exit,
                    });
                    false
                }
                None => true,
            }
        });

        reaped
    }

    /// Stop counting live workers of `stage` against `feed`. Returns how many
    /// were newly retired.
    pub fn retire(&mut self, stage: Stage, feed: &str) -> usize {
        let mut count = 0;
        for worker in &mut self.workers {
            if worker.stage == stage && worker.feed == feed && !worker.retired {
                worker.retired = true;
                count += 1;
            }
        }
        count
    }

    /// Live workers of `stage`, retired ones included: they still hold a slot
    /// until their process exits.
    pub fn live_count(&self, stage: Stage) -> usize {
        self.workers.iter().filter(|w| w.stage == stage).count()
    }

    /// Workers of `stage` currently assigned to `feed`.
    pub fn assigned(&self, stage: Stage, feed: &str) -> usize {
        self.workers
            .iter()
            .filter(|w| w.stage == stage && w.feed == feed && !w.retired)
            .count()
    }

    pub fn workers(&self) -> impl Iterator<Item = &TrackedWorker> {
        self.workers.iter()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Kill every tracked worker and forget them.
    pub fn terminate_all(&mut self) {
        for worker in &mut self.workers {
            log::info!(
                "Terminating {} worker for {} (pid: {})",
                worker.stage,
                worker.feed,
                worker.pid
            );
            if let Err(e) = worker.handle.terminate() {
                log::warn!("Failed to terminate worker {}: {}", worker.pid, e);
            }
        }
        self.workers.clear();
    }
}
