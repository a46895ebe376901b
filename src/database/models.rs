use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Status of a work item in the processing pipeline.
///
/// The active statuses form a strict linear order
/// `Pending → Downloading → Downloaded → Transcribing → Transcribed → Enriching → Enriched`.
/// `Failed` and `Skipped` are side-exits reachable from any non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Downloading,
    Downloaded,
    Transcribing,
    Transcribed,
    Enriching,
    Enriched,
    Failed,
    Skipped,
}

impl Default for ItemStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl ItemStatus {
    pub const ALL: [ItemStatus; 9] = [
        Self::Pending,
        Self::Downloading,
        Self::Downloaded,
        Self::Transcribing,
        Self::Transcribed,
        Self::Enriching,
        Self::Enriched,
        Self::Failed,
        Self::Skipped,
    ];

    /// Statuses that mean a worker is currently operating on the item.
    pub const IN_PROGRESS: [ItemStatus; 3] = [Self::Downloading, Self::Transcribing, Self::Enriching];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Transcribing => "transcribing",
            Self::Transcribed => "transcribed",
            Self::Enriching => "enriching",
            Self::Enriched => "enriched",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Position in the linear pipeline, `None` for the side-exits.
    pub fn pipeline_rank(&self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Downloading => Some(1),
            Self::Downloaded => Some(2),
            Self::Transcribing => Some(3),
            Self::Transcribed => Some(4),
            Self::Enriching => Some(5),
            Self::Enriched => Some(6),
            Self::Failed | Self::Skipped => None,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        Self::IN_PROGRESS.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Enriched | Self::Failed | Self::Skipped)
    }

    /// Whether a direct change from `self` to `next` is allowed.
    pub fn can_transition_to(&self, next: ItemStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Failed | Self::Skipped => true,
            _ => match (self.pipeline_rank(), next.pipeline_rank()) {
                (Some(from), Some(to)) => to == from + 1,
                _ => false,
            },
        }
    }

    /// The stable status an in-progress item falls back to after a crash.
    pub fn demoted(&self) -> Option<ItemStatus> {
        match self {
            Self::Downloading => Some(Self::Pending),
            Self::Transcribing => Some(Self::Downloaded),
            Self::Enriching => Some(Self::Transcribed),
            _ => None,
        }
    }

    /// Column that receives the artifact path when an item reaches this status.
    pub(crate) fn artifact_column(&self) -> Option<&'static str> {
        match self {
            Self::Downloaded => Some("audio_path"),
            Self::Transcribed => Some("transcript_path"),
            Self::Enriched => Some("enrichment_path"),
            _ => None,
        }
    }

    /// Timestamp column stamped when an item enters this status.
    pub(crate) fn timestamp_column(&self) -> Option<&'static str> {
        match self {
            Self::Downloading => Some("download_started_at"),
            Self::Downloaded => Some("download_completed_at"),
            Self::Transcribing => Some("transcribe_started_at"),
            Self::Transcribed => Some("transcribe_completed_at"),
            Self::Enriching => Some("enrich_started_at"),
            Self::Enriched => Some("enrich_completed_at"),
            _ => None,
        }
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown item status: {}", s))
    }
}

impl ToSql for ItemStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ItemStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        text.parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// One of the three pipeline stages a worker can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    Transcribe,
    Enrich,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Self::Download, Self::Transcribe, Self::Enrich];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Transcribe => "transcribe",
            Self::Enrich => "enrich",
        }
    }

    /// Status an item must hold before a worker of this stage may claim it.
    pub fn input_status(&self) -> ItemStatus {
        match self {
            Self::Download => ItemStatus::Pending,
            Self::Transcribe => ItemStatus::Downloaded,
            Self::Enrich => ItemStatus::Transcribed,
        }
    }

    pub fn active_status(&self) -> ItemStatus {
        match self {
            Self::Download => ItemStatus::Downloading,
            Self::Transcribe => ItemStatus::Transcribing,
            Self::Enrich => ItemStatus::Enriching,
        }
    }

    pub fn done_status(&self) -> ItemStatus {
        match self {
            Self::Download => ItemStatus::Downloaded,
            Self::Transcribe => ItemStatus::Transcribed,
            Self::Enrich => ItemStatus::Enriched,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "download" => Ok(Self::Download),
            "transcribe" => Ok(Self::Transcribe),
            "enrich" => Ok(Self::Enrich),
            other => Err(format!("unknown stage: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    pub queue_name: String,
    pub item_title: String,
    pub url: Option<String>,
    pub guid: Option<String>,
    pub status: ItemStatus,
    pub error_message: Option<String>,
    pub audio_path: Option<String>,
    pub transcript_path: Option<String>,
    pub enrichment_path: Option<String>,
    pub download_started_at: Option<String>,
    pub download_completed_at: Option<String>,
    pub transcribe_started_at: Option<String>,
    pub transcribe_completed_at: Option<String>,
    pub enrich_started_at: Option<String>,
    pub enrich_completed_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingLock {
    pub item_id: i64,
    pub worker_id: String,
    pub locked_at: String,
}

/// Per-queue rollup used by the `stats` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_name: String,
    pub total: i64,
    pub enriched: i64,
    pub failed: i64,
    pub pending: i64,
}

/// Counts of demoted items per in-progress status, returned by crash recovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub downloading: usize,
    pub transcribing: usize,
    pub enriching: usize,
    /// In-progress items that had no lock row at all.
    pub orphaned: usize,
    pub locks_cleared: usize,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.downloading + self.transcribing + self.enriching
    }
}
