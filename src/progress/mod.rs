//! Per-feed stage counts and the derived progress used for scheduling.

pub mod stall;

use crate::config::{OrchestratorConfig, ProgressSource};
use crate::database::{Database, ItemStatus, Stage};
use crate::error::AppError;
use serde::Serialize;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use stall::StallDetector;

/// Raw per-stage counts for one feed, before clamping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageCounts {
    pub downloaded: u64,
    pub transcribed: u64,
    pub enriched: u64,
}

/// Anything that can report raw stage counts for a feed.
pub trait CountSource: Send + Sync {
    fn counts(&self, feed: &str) -> Result<StageCounts, AppError>;
}

/// Counts derived from item statuses in the store.
pub struct StoreCounts {
    db: Arc<Database>,
}

impl StoreCounts {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl CountSource for StoreCounts {
    fn counts(&self, feed: &str) -> Result<StageCounts, AppError> {
        let stats = self.db.stats(Some(feed))?;
        let mut counts = StageCounts::default();

        for (status, count) in stats {
            let count = count.max(0) as u64;
            // Side-exits count toward no stage
            if status.pipeline_rank().is_none() {
                continue;
            }
            if status >= ItemStatus::Downloaded {
                counts.downloaded += count;
            }
            if status >= ItemStatus::Transcribed {
                counts.transcribed += count;
            }
            if status == ItemStatus::Enriched {
                counts.enriched += count;
            }
        }

        Ok(counts)
    }
}

/// Degraded source that counts artifacts on disk.
///
/// Audio lives in `episodes_dir/<feed>`, transcripts (`*.txt`) and
/// enrichments (`*_enriched.json`) in `transcripts_dir/<feed>`. Audio files at
/// or under `min_audio_bytes` are treated as partial downloads.
pub struct FilesystemCounts {
    episodes_dir: PathBuf,
    transcripts_dir: PathBuf,
    min_audio_bytes: u64,
}

impl FilesystemCounts {
    pub fn new(episodes_dir: PathBuf, transcripts_dir: PathBuf, min_audio_bytes: u64) -> Self {
        Self {
            episodes_dir,
            transcripts_dir,
            min_audio_bytes,
        }
    }
}

impl CountSource for FilesystemCounts {
    fn counts(&self, feed: &str) -> Result<StageCounts, AppError> {
        let audio_dir = self.episodes_dir.join(feed);
        let transcript_dir = self.transcripts_dir.join(feed);

        let downloaded = count_files(&audio_dir, |name, size| {
            let lower = name.to_lowercase();
            (lower.ends_with(".mp3") || lower.ends_with(".m4a")) && size > self.min_audio_bytes
        })?;
        let transcribed = count_files(&transcript_dir, |name, _| name.ends_with(".txt"))?;
        let enriched = count_files(&transcript_dir, |name, _| name.ends_with("_enriched.json"))?;

        Ok(StageCounts {
            downloaded,
            transcribed,
            enriched,
        })
    }
}

/// Count regular files directly inside `dir` accepted by `accept(name, size)`.
/// A missing directory counts as empty.
fn count_files<F>(dir: &Path, accept: F) -> Result<u64, AppError>
where
    F: Fn(&str, u64) -> bool,
{
    if !dir.exists() {
        return Ok(0);
    }

    let mut count = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if !metadata.is_file() {
            continue;
        }
        let name = entry.file_name();
        if accept(&name.to_string_lossy(), metadata.len()) {
            count += 1;
        }
    }
    Ok(count)
}

/// Build the count source selected in config.
pub fn count_source(config: &OrchestratorConfig, db: Arc<Database>) -> Box<dyn CountSource> {
    match config.progress_source {
        ProgressSource::Store => Box::new(StoreCounts::new(db)),
        ProgressSource::Filesystem => Box::new(FilesystemCounts::new(
            config.episodes_dir.clone(),
            config.transcripts_dir.clone(),
            config.min_audio_bytes,
        )),
    }
}

/// Progress of one feed, recomputed every tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedProgress {
    pub name: String,
    pub total: u64,
    pub downloaded: u64,
    pub transcribed: u64,
    pub enriched: u64,
    /// Items still to download.
    pub remaining: u64,
    pub transcribe_remaining: u64,
    pub enrich_remaining: u64,
    pub priority: u32,
    pub is_download_complete: bool,
    pub is_transcribe_complete: bool,
    pub is_enrich_complete: bool,
}

impl FeedProgress {
    /// Derive progress from raw counts and the externally reported total.
    ///
    /// Counts are clamped so no stage can exceed the one before it. Once
    /// `downloaded` reaches `total` the feed is download-complete even if the
    /// reported total is stale.
    pub fn compute(name: &str, total: u64, counts: StageCounts, priority: u32) -> Self {
        let downloaded = counts.downloaded;
        let transcribed = counts.transcribed.min(downloaded);
        let enriched = counts.enriched.min(transcribed);

        Self {
            name: name.to_string(),
            total,
            downloaded,
            transcribed,
            enriched,
            remaining: total.saturating_sub(downloaded),
            transcribe_remaining: downloaded - transcribed,
            enrich_remaining: transcribed - enriched,
            priority,
            is_download_complete: downloaded >= total,
            is_transcribe_complete: downloaded > 0 && transcribed == downloaded,
            is_enrich_complete: transcribed > 0 && enriched == transcribed,
        }
    }

    /// Downloaded share of the total, 100 when the total is unknown.
    pub fn completion_pct(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.downloaded as f64 / self.total as f64 * 100.0).min(100.0)
    }

    pub fn remaining_for(&self, stage: Stage) -> u64 {
        match stage {
            Stage::Download => self.remaining,
            Stage::Transcribe => self.transcribe_remaining,
            Stage::Enrich => self.enrich_remaining,
        }
    }

    pub fn is_complete(&self, stage: Stage) -> bool {
        match stage {
            Stage::Download => self.is_download_complete,
            Stage::Transcribe => self.is_transcribe_complete,
            Stage::Enrich => self.is_enrich_complete,
        }
    }

    /// Whether a worker for `stage` would find anything to do right now.
    pub fn needs(&self, stage: Stage) -> bool {
        !self.is_complete(stage) && self.remaining_for(stage) > 0
    }
}

/// Scheduling order: fewest remaining downloads first, then higher priority.
pub fn priority_order(a: &FeedProgress, b: &FeedProgress) -> Ordering {
    a.remaining
        .cmp(&b.remaining)
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| a.name.cmp(&b.name))
}

pub fn sort_by_priority(feeds: &mut [FeedProgress]) {
    feeds.sort_by(priority_order);
}
