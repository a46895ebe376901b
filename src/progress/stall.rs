use super::FeedProgress;
use std::collections::{HashMap, VecDeque};

/// Feeds within this many items of their total are never flagged.
const MIN_REMAINING_FOR_STALL: u64 = 5;
/// Feeds at or above this completion are never flagged.
const MAX_COMPLETION_PCT_FOR_STALL: f64 = 99.0;

/// Tracks a sliding window of downloaded counts per feed.
#[derive(Debug)]
pub struct StallDetector {
    window: usize,
    history: HashMap<String, VecDeque<u64>>,
}

impl StallDetector {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            history: HashMap::new(),
        }
    }

    /// Record this tick's sample for `feed` and report whether it is stalled.
    pub fn observe(&mut self, feed: &FeedProgress) -> bool {
        let samples = self
            .history
            .entry(feed.name.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.window));
        samples.push_back(feed.downloaded);
        while samples.len() > self.window {
            samples.pop_front();
        }
        is_stalled(samples, self.window, feed)
    }

    /// Drop history for feeds no longer being tracked.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&str) -> bool,
    {
        self.history.retain(|name, _| keep(name));
    }

    pub fn history(&self, feed: &str) -> Option<&VecDeque<u64>> {
        self.history.get(feed)
    }
}

/// A feed is stalled when a full window shows no download progress and the
/// feed is not plausibly finished.
pub fn is_stalled(samples: &VecDeque<u64>, window: usize, feed: &FeedProgress) -> bool {
    let Some(first) = samples.front() else {
        return false;
    };

    samples.len() >= window
        && samples.iter().all(|v| v == first)
        && !feed.is_download_complete
        && feed.remaining > MIN_REMAINING_FOR_STALL
        && feed.completion_pct() < MAX_COMPLETION_PCT_FOR_STALL
}
