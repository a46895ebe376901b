//! The control loop: one tick every `tick_interval_secs` that reaps finished
//! workers, recomputes feed progress and tops up each stage's worker pool.

pub mod backoff;
pub mod process;
pub mod registry;

use crate::config::{FeedConfig, OrchestratorConfig};
use crate::database::{Database, RecoveryReport, Stage};
use crate::error::AppError;
use crate::progress::{sort_by_priority, CountSource, FeedProgress, StallDetector};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use backoff::{BackoffPolicy, BackoffState, FailureAction};
use process::{ExitKind, WorkerLauncher};
use registry::{ReapedWorker, WorkerRegistry};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchedWorker {
    pub stage: Stage,
    pub feed: String,
    pub pid: u32,
}

/// Everything one tick did, for logging and tests.
#[derive(Debug, Default)]
pub struct TickReport {
    pub launched: Vec<LaunchedWorker>,
    pub reaped: Vec<ReapedWorker>,
    pub retired: usize,
    pub locks_swept: usize,
    pub stalled: Vec<String>,
    pub manual_mode: Vec<String>,
    pub manual_launched: Vec<String>,
    /// `(scope, message)` for anything that went wrong; scope is a feed name
    /// or the subsystem.
    pub errors: Vec<(String, String)>,
    pub workers: BTreeMap<Stage, usize>,
    pub progress: Vec<FeedProgress>,
}

impl TickReport {
    pub fn launched_for(&self, stage: Stage, feed: &str) -> usize {
        self.launched
            .iter()
            .filter(|l| l.stage == stage && l.feed == feed)
            .count()
    }
}

/// Workers a feed may hold for one stage.
///
/// Backlogs of at least `threshold` items get one worker per `threshold`
/// items; everything else gets one.
pub fn fan_out_allowance(stage_remaining: u64, threshold: u64) -> usize {
    if threshold == 0 || stage_remaining < threshold {
        return 1;
    }
    usize::try_from(stage_remaining / threshold)
        .unwrap_or(usize::MAX)
        .max(1)
}

pub struct Supervisor<L: WorkerLauncher> {
    config: OrchestratorConfig,
    db: Arc<Database>,
    counts: Box<dyn CountSource>,
    totals: HashMap<String, u64>,
    registry: WorkerRegistry,
    backoff: HashMap<String, BackoffState>,
    policy: BackoffPolicy,
    stall: StallDetector,
    launcher: L,
}

impl<L: WorkerLauncher> Supervisor<L> {
    pub fn new(
        config: OrchestratorConfig,
        db: Arc<Database>,
        counts: Box<dyn CountSource>,
        launcher: L,
    ) -> Self {
        let backoff = config
            .feeds
            .iter()
            .filter(|f| f.rate_limited)
            .map(|f| (f.name.clone(), BackoffState::new()))
            .collect();

        for stage in Stage::ALL {
            if config.executors.for_stage(stage).is_none() && config.workers.for_stage(stage) > 0 {
                log::warn!("No executor configured for the {} stage, it will not be scheduled", stage);
            }
        }

        Self {
            policy: BackoffPolicy::from(&config.backoff),
            stall: StallDetector::new(config.stall_window),
            config,
            db,
            counts,
            totals: HashMap::new(),
            registry: WorkerRegistry::new(),
            backoff,
            launcher,
        }
    }

    /// Crash recovery, run once before any worker is launched.
    pub fn startup(&mut self) -> Result<RecoveryReport, AppError> {
        let report = self.db.recover_stuck()?;
        self.db.sweep_stale(self.config.stale_lock_age())?;
        Ok(report)
    }

    /// Install the external totals, resolved once at startup.
    pub fn set_totals(&mut self, totals: HashMap<String, u64>) {
        self.totals = totals;
    }

    pub fn backoff_state(&self, feed: &str) -> Option<&BackoffState> {
        self.backoff.get(feed)
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn tick(&mut self, now: Instant) -> TickReport {
        let mut report = TickReport::default();

        self.reap_workers(now, &mut report);
        self.poll_manual_processes();

        match self.db.sweep_stale(self.config.stale_lock_age()) {
            Ok(count) => report.locks_swept = count,
            Err(e) => {
                log::warn!("Stale lock sweep failed: {}", e);
                report.errors.push(("locks".to_string(), e.to_string()));
            }
        }

        let mut feeds = self.compute_progress(&mut report);
        self.prune_stall_history(&feeds);

        for feed in &feeds {
            if self.stall.observe(feed) {
                log::warn!(
                    "Feed {} stalled: {} of {} downloaded with no progress for {} ticks",
                    feed.name,
                    feed.downloaded,
                    feed.total,
                    self.config.stall_window
                );
                report.stalled.push(feed.name.clone());
            }
        }

        for feed in &feeds {
            for stage in Stage::ALL {
                if feed.is_complete(stage) {
                    let retired = self.registry.retire(stage, &feed.name);
                    if retired > 0 {
                        log::info!("{} complete for {}, retired {} workers", stage, feed.name, retired);
                        report.retired += retired;
                    }
                }
            }
        }

        report.manual_mode = self
            .backoff
            .iter()
            .filter(|(_, state)| state.is_manual_mode())
            .map(|(name, _)| name.clone())
            .collect();
        report.manual_mode.sort();

        sort_by_priority(&mut feeds);
        for stage in Stage::ALL {
            self.fill_stage(stage, &feeds, now, &mut report);
        }

        for stage in Stage::ALL {
            report.workers.insert(stage, self.registry.live_count(stage));
        }
        report.progress = feeds;
        report
    }

    fn reap_workers(&mut self, now: Instant, report: &mut TickReport) {
        for reaped in self.registry.reap() {
            log::debug!(
                "{} worker for {} exited (pid: {}, {:?})",
                reaped.stage,
                reaped.feed,
                reaped.pid,
                reaped.exit
            );

            if reaped.stage == Stage::Download {
                self.observe_outcome(&reaped.feed, reaped.exit, now, report);
            }
            report.reaped.push(reaped);
        }
    }

    /// Feed a download worker's exit into the feed's back-off state.
    fn observe_outcome(&mut self, feed: &str, exit: ExitKind, now: Instant, report: &mut TickReport) {
        let Some(state) = self.backoff.get_mut(feed) else {
            return;
        };

        if exit.is_success() {
            if state.failure_count() > 0 {
                log::info!("{}: Download succeeded, resetting backoff", feed);
            }
            state.record_success();
            return;
        }

        let ran_for = state
            .last_attempt()
            .map(|at| now.saturating_duration_since(at).as_secs())
            .unwrap_or(0);

        match state.record_failure(now, &self.policy) {
            FailureAction::RetryAt(at) => {
                log::warn!(
                    "{}: Download failed after {}s (failure #{}), retry in {}s",
                    feed,
                    ran_for,
                    state.failure_count(),
                    at.saturating_duration_since(now).as_secs()
                );
            }
            FailureAction::EnterManualMode => {
                let command = self
                    .config
                    .feed(feed)
                    .and_then(|f| f.manual_command.as_ref());
                let Some(command) = command else {
                    log::warn!(
                        "{}: {} failures but no manual command configured, staying in backoff",
                        feed,
                        state.failure_count()
                    );
                    return;
                };

                match self.launcher.launch_manual(feed, command) {
                    Ok(handle) => {
                        log::info!(
                            "{}: Switching to manual process after {} failures (pid: {})",
                            feed,
                            state.failure_count(),
                            handle.pid()
                        );
                        state.enter_manual_mode(handle);
                        report.manual_launched.push(feed.to_string());
                    }
                    Err(e) => {
                        log::error!("{}: Failed to launch manual process: {}", feed, e);
                        report.errors.push((feed.to_string(), e.to_string()));
                    }
                }
            }
        }
    }

    fn poll_manual_processes(&mut self) {
        for (feed, state) in &mut self.backoff {
            if state.poll_manual() {
                log::info!("{}: Manual process completed, resuming automated downloads", feed);
            }
        }
    }

    /// Progress for every configured feed. A feed whose counts fail is
    /// reported and left out of this tick.
    fn compute_progress(&self, report: &mut TickReport) -> Vec<FeedProgress> {
        let mut feeds = Vec::with_capacity(self.config.feeds.len());

        for feed in &self.config.feeds {
            match self.counts.counts(&feed.name) {
                Ok(counts) => {
                    let total = self
                        .totals
                        .get(&feed.name)
                        .copied()
                        .unwrap_or(counts.downloaded);
                    feeds.push(FeedProgress::compute(&feed.name, total, counts, feed.priority));
                }
                Err(e) => {
                    log::error!("Failed to compute progress for {}: {}", feed.name, e);
                    report.errors.push((feed.name.clone(), e.to_string()));
                }
            }
        }

        feeds
    }

    /// Forget stall history for feeds that produced no sample this tick, so a
    /// window never spans a gap.
    fn prune_stall_history(&mut self, feeds: &[FeedProgress]) {
        self.stall
            .retain(|name| feeds.iter().any(|feed| feed.name == name));
    }

    fn feed_config(&self, name: &str) -> Option<&FeedConfig> {
        self.config.feed(name)
    }

    fn fill_stage(
        &mut self,
        stage: Stage,
        feeds: &[FeedProgress],
        now: Instant,
        report: &mut TickReport,
    ) {
        if self.config.executors.for_stage(stage).is_none() {
            return;
        }

        let target = self.config.workers.for_stage(stage);
        let current = self.registry.live_count(stage);
        if current >= target {
            return;
        }
        let mut available = target - current;

        for feed in feeds {
            if available == 0 {
                break;
            }
            if !feed.needs(stage) {
                continue;
            }

            if let Some(state) = self.backoff.get(&feed.name) {
                if !state.is_eligible(now) {
                    if state.is_manual_mode() {
                        log::debug!("{}: manual process active, skipping {}", feed.name, stage);
                    } else if let Some(wait) = state.cooldown_remaining(now) {
                        log::debug!("{}: in backoff, retry in {}s", feed.name, wait.as_secs());
                    }
                    continue;
                }
            }

            let rate_limited = self
                .feed_config(&feed.name)
                .map(|f| f.rate_limited)
                .unwrap_or(false);

            let mut allowance =
                fan_out_allowance(feed.remaining_for(stage), self.config.fan_out_threshold);
            if rate_limited && stage == Stage::Download {
                allowance = 1;
            }

            let assigned = self.registry.assigned(stage, &feed.name);
            let wanted = allowance.saturating_sub(assigned).min(available);

            for _ in 0..wanted {
                match self.launcher.launch_worker(stage, &feed.name) {
                    Ok(handle) => {
                        let pid = handle.pid();
                        log::info!("Launched {} worker: {} (pid: {})", stage, feed.name, pid);
                        self.registry.add(stage, &feed.name, handle, now);
                        if stage == Stage::Download {
                            if let Some(state) = self.backoff.get_mut(&feed.name) {
                                state.record_attempt(now);
                            }
                        }
                        report.launched.push(LaunchedWorker {
                            stage,
                            feed: feed.name.clone(),
                            pid,
                        });
                        available -= 1;
                    }
                    Err(e) => {
                        log::error!("Failed to launch {} worker for {}: {}", stage, feed.name, e);
                        report.errors.push((feed.name.clone(), e.to_string()));
                        break;
                    }
                }
            }
        }
    }

    /// Tick until `cancel` fires, then optionally stop every tracked worker.
    pub async fn run(&mut self, cancel: CancellationToken) {
        log::info!(
            "Supervisor started: {} feeds, targets download={} transcribe={} enrich={}",
            self.config.feeds.len(),
            self.config.workers.download,
            self.config.workers.transcribe,
            self.config.workers.enrich
        );

        loop {
            let report = self.tick(Instant::now());
            log_summary(&report);

            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("Shutdown requested, stopping supervisor");
                    break;
                }
                _ = tokio::time::sleep(self.config.tick_interval()) => {}
            }
        }

        if self.config.terminate_workers_on_exit {
            self.registry.terminate_all();
        } else if !self.registry.is_empty() {
            log::info!("Leaving {} workers running", self.registry.len());
            let now = Instant::now();
            for worker in self.registry.workers() {
                log::info!(
                    "  {} worker for {} (pid: {}, up {}s)",
                    worker.stage,
                    worker.feed,
                    worker.pid,
                    now.saturating_duration_since(worker.launched_at).as_secs()
                );
            }
        }

        log::info!("Supervisor stopped");
    }
}

fn log_summary(report: &TickReport) {
    let (memory_mb, memory_pct) = process::memory_info();
    let count = |stage| report.workers.get(&stage).copied().unwrap_or(0);

    log::info!(
        "Tick: workers download={} transcribe={} enrich={}, launched {}, reaped {}, stalled {}, manual {}, memory {:.0} MB ({:.1}%)",
        count(Stage::Download),
        count(Stage::Transcribe),
        count(Stage::Enrich),
        report.launched.len(),
        report.reaped.len(),
        report.stalled.len(),
        report.manual_mode.len(),
        memory_mb,
        memory_pct
    );
    for (scope, message) in &report.errors {
        log::warn!("Tick error in {}: {}", scope, message);
    }
}
