//! Exponential back-off with escalation to a manual process for feeds whose
//! upstream is known to rate-limit.

use super::process::ProcessHandle;
use crate::config::BackoffConfig;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub manual_failover_threshold: u32,
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            base_delay: Duration::from_secs(config.base_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
            manual_failover_threshold: config.manual_failover_threshold,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next attempt once `failures` consecutive failures
    /// have been seen: `base * 2^(failures - 1)`, capped at `max`.
    pub fn delay_after(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.checked_pow(failures - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Coarse phase, for logging and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffPhase {
    Healthy,
    Backoff(u32),
    ManualMode,
}

/// What the caller must do after recording a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Wait until the given instant before scheduling the feed again.
    RetryAt(Instant),
    /// The threshold was reached; start the manual process.
    EnterManualMode,
}

/// Per-feed state, owned by the supervisor for its process lifetime.
pub struct BackoffState {
    failure_count: u32,
    last_attempt: Option<Instant>,
    retry_at: Option<Instant>,
    manual_mode: bool,
    manual_handle: Option<Box<dyn ProcessHandle>>,
}

impl std::fmt::Debug for BackoffState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffState")
            .field("failure_count", &self.failure_count)
            .field("last_attempt", &self.last_attempt)
            .field("retry_at", &self.retry_at)
            .field("manual_mode", &self.manual_mode)
            .field("manual_pid", &self.manual_handle.as_ref().map(|h| h.pid()))
            .finish()
    }
}

impl Default for BackoffState {
    fn default() -> Self {
        Self::new()
    }
}

impl BackoffState {
    pub fn new() -> Self {
        Self {
            failure_count: 0,
            last_attempt: None,
            retry_at: None,
            manual_mode: false,
            manual_handle: None,
        }
    }

    pub fn phase(&self) -> BackoffPhase {
        if self.manual_mode {
            BackoffPhase::ManualMode
        } else if self.failure_count > 0 {
            BackoffPhase::Backoff(self.failure_count)
        } else {
            BackoffPhase::Healthy
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn is_manual_mode(&self) -> bool {
        self.manual_mode
    }

    pub fn last_attempt(&self) -> Option<Instant> {
        self.last_attempt
    }

    pub fn manual_pid(&self) -> Option<u32> {
        self.manual_handle.as_ref().map(|h| h.pid())
    }

    pub fn record_attempt(&mut self, now: Instant) {
        self.last_attempt = Some(now);
    }

    /// Count a failed attempt.
    pub fn record_failure(&mut self, now: Instant, policy: &BackoffPolicy) -> FailureAction {
        self.failure_count = self.failure_count.saturating_add(1);
        let retry_at = now + policy.delay_after(self.failure_count);
        self.retry_at = Some(retry_at);

        if !self.manual_mode && self.failure_count >= policy.manual_failover_threshold {
            FailureAction::EnterManualMode
        } else {
            FailureAction::RetryAt(retry_at)
        }
    }

    /// A worker succeeded: forget every failure.
    ///
    /// A manual process still running is left alone; it is only dropped from
    /// tracking.
    pub fn record_success(&mut self) {
        self.failure_count = 0;
        self.retry_at = None;
        self.manual_mode = false;
        self.manual_handle = None;
    }

    pub fn enter_manual_mode(&mut self, handle: Box<dyn ProcessHandle>) {
        self.manual_mode = true;
        self.manual_handle = Some(handle);
    }

    /// Whether an automatic worker may be launched at `now`.
    pub fn is_eligible(&self, now: Instant) -> bool {
        if self.manual_mode {
            return false;
        }
        match self.retry_at {
            Some(at) => now >= at,
            None => true,
        }
    }

    /// Time left in the current cool-down, if any.
    pub fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        self.retry_at
            .filter(|at| *at > now)
            .map(|at| at.duration_since(now))
    }

    /// Check the manual process; returns true when it has just exited and the
    /// feed went back to Healthy.
    pub fn poll_manual(&mut self) -> bool {
        if !self.manual_mode {
            return false;
        }

        let exited = match self.manual_handle.as_mut() {
            Some(handle) => match handle.poll_exit() {
                Ok(Some(_)) => true,
                Ok(None) => false,
                Err(e) => {
                    log::warn!("Failed to poll manual process {}: {}", handle.pid(), e);
                    !handle.is_alive()
                }
            },
            None => true,
        };

        if exited {
            self.record_success();
        }
        exited
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::process::test_support::FakeHandle;
    use crate::supervisor::process::ExitKind;

    fn policy(threshold: u32) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(1800),
            manual_failover_threshold: threshold,
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let p = policy(3);
        assert_eq!(p.delay_after(0), Duration::ZERO);
        assert_eq!(p.delay_after(1), Duration::from_secs(60));
        assert_eq!(p.delay_after(2), Duration::from_secs(120));
        assert_eq!(p.delay_after(3), Duration::from_secs(240));
        assert_eq!(p.delay_after(6), Duration::from_secs(1800));
        assert_eq!(p.delay_after(40), Duration::from_secs(1800));
    }

    #[test]
    fn test_failure_sets_cooldown() {
        let p = policy(3);
        let now = Instant::now();
        let mut state = BackoffState::new();
        assert!(state.is_eligible(now));

        let action = state.record_failure(now, &p);
        assert_eq!(action, FailureAction::RetryAt(now + Duration::from_secs(60)));
        assert_eq!(state.phase(), BackoffPhase::Backoff(1));
        assert!(!state.is_eligible(now + Duration::from_secs(59)));
        assert!(state.is_eligible(now + Duration::from_secs(60)));
        assert_eq!(
            state.cooldown_remaining(now + Duration::from_secs(20)),
            Some(Duration::from_secs(40))
        );
    }

    #[test]
    fn test_threshold_enters_manual_mode() {
        let p = policy(3);
        let now = Instant::now();
        let mut state = BackoffState::new();

        assert!(matches!(state.record_failure(now, &p), FailureAction::RetryAt(_)));
        assert!(matches!(state.record_failure(now, &p), FailureAction::RetryAt(_)));
        assert_eq!(state.record_failure(now, &p), FailureAction::EnterManualMode);

        let handle = FakeHandle::running(4242);
        state.enter_manual_mode(Box::new(handle.clone()));
        assert_eq!(state.phase(), BackoffPhase::ManualMode);
        assert_eq!(state.manual_pid(), Some(4242));
        assert!(!state.is_eligible(now + Duration::from_secs(100_000)));

        // Still running
        assert!(!state.poll_manual());
        assert!(state.is_manual_mode());

        handle.finish(ExitKind::Success);
        assert!(state.poll_manual());
        assert_eq!(state.phase(), BackoffPhase::Healthy);
        assert_eq!(state.failure_count(), 0);
        assert!(state.is_eligible(now));
    }

    #[test]
    fn test_success_resets_backoff() {
        let p = policy(3);
        let now = Instant::now();
        let mut state = BackoffState::new();
        state.record_failure(now, &p);
        state.record_failure(now, &p);
        state.record_success();
        assert_eq!(state.phase(), BackoffPhase::Healthy);
        assert!(state.is_eligible(now));
    }

    #[test]
    fn test_failure_in_manual_mode_does_not_reescalate() {
        let p = policy(1);
        let now = Instant::now();
        let mut state = BackoffState::new();
        assert_eq!(state.record_failure(now, &p), FailureAction::EnterManualMode);
        state.enter_manual_mode(Box::new(FakeHandle::running(1)));
        assert!(matches!(state.record_failure(now, &p), FailureAction::RetryAt(_)));
    }
}
