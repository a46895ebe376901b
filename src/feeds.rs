//! Feed discovery from RSS and the external per-feed totals.

use crate::config::FeedConfig;
use crate::database::Database;
use crate::error::AppError;
use regex::Regex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// One audio episode found in a feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub title: String,
    pub audio_url: String,
    pub guid: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Catalog {
    pub entries: Vec<CatalogEntry>,
    /// Entries dropped because their normalised title was already seen.
    pub duplicates: usize,
}

/// Collapses titles that differ only in punctuation, case or spacing.
pub struct TitleNormalizer {
    punctuation: Regex,
    whitespace: Regex,
}

impl TitleNormalizer {
    pub fn new() -> Result<Self, AppError> {
        Ok(Self {
            punctuation: Regex::new(r"[^\w\s-]").map_err(|e| AppError::Other(e.to_string()))?,
            whitespace: Regex::new(r"\s+").map_err(|e| AppError::Other(e.to_string()))?,
        })
    }

    pub fn normalize(&self, title: &str) -> String {
        let lower = title.to_lowercase();
        let stripped = self.punctuation.replace_all(&lower, "");
        self.whitespace.replace_all(&stripped, " ").trim().to_string()
    }
}

/// Download and parse a feed.
pub async fn fetch_feed(url: &str) -> Result<Catalog, AppError> {
    log::info!("Fetching RSS from: {}", url);

    let response = reqwest::get(url).await?.error_for_status()?;
    let body = response.bytes().await?;
    parse_catalog(&body)
}

/// Parse feed XML into the deduplicated list of audio entries.
pub fn parse_catalog(body: &[u8]) -> Result<Catalog, AppError> {
    let feed = feed_rs::parser::parse(body)
        .map_err(|e| AppError::Feed(format!("Failed to parse RSS: {}", e)))?;
    let normalizer = TitleNormalizer::new()?;

    let mut seen = HashSet::new();
    let mut catalog = Catalog::default();

    for entry in feed.entries {
        // Get audio URL from enclosure
        let audio_url = entry
            .media
            .iter()
            .flat_map(|m| m.content.iter())
            .find(|c| {
                c.content_type
                    .as_ref()
                    .map_or(true, |mime| mime.to_string().starts_with("audio/"))
            })
            .and_then(|c| c.url.as_ref())
            .map(|u| u.to_string())
            .or_else(|| {
                entry
                    .links
                    .iter()
                    .find(|l| {
                        l.media_type
                            .as_deref()
                            .is_some_and(|t| t.starts_with("audio/"))
                    })
                    .map(|l| l.href.clone())
            });

        let Some(audio_url) = audio_url else {
            continue; // Skip entries without audio
        };

        let title = entry
            .title
            .map(|t| t.content.trim().to_string())
            .unwrap_or_default();
        if title.is_empty() {
            continue;
        }

        if !seen.insert(normalizer.normalize(&title)) {
            catalog.duplicates += 1;
            continue;
        }

        let guid = Some(entry.id).filter(|id| !id.is_empty());
        catalog.entries.push(CatalogEntry {
            title,
            audio_url,
            guid,
        });
    }

    log::debug!(
        "Parsed {} audio entries ({} duplicates)",
        catalog.entries.len(),
        catalog.duplicates
    );
    Ok(catalog)
}

/// Upsert every catalog entry into `queue_name`, returning `(added, updated)`.
pub fn sync_catalog(
    db: &Database,
    queue_name: &str,
    catalog: &Catalog,
) -> Result<(usize, usize), AppError> {
    let mut added = 0;
    let mut updated = 0;

    for entry in &catalog.entries {
        let (_, is_new) = db.upsert_item(
            queue_name,
            &entry.title,
            Some(&entry.audio_url),
            entry.guid.as_deref(),
        )?;
        if is_new {
            added += 1;
        } else {
            updated += 1;
        }
    }

    Ok((added, updated))
}

/// Fetch one feed and record its entries as items.
pub async fn sync_feed(
    db: &Database,
    queue_name: &str,
    url: &str,
) -> Result<(usize, usize), AppError> {
    let catalog = fetch_feed(url).await?;
    let (added, updated) = sync_catalog(db, queue_name, &catalog)?;
    log::info!(
        "Synced {}: {} added, {} updated",
        queue_name,
        added,
        updated
    );
    Ok((added, updated))
}

// ── Total sources ──────────────────────────────────────────────────────────

/// External estimate of how many items a feed will eventually have.
pub trait TotalSource: Send + Sync {
    /// `None` when this source has no opinion about `queue_name`.
    fn total_items(&self, queue_name: &str) -> Result<Option<u64>, AppError>;
}

/// Totals fixed in config.
#[derive(Debug, Default)]
pub struct StaticTotals(HashMap<String, u64>);

impl StaticTotals {
    pub fn from_feeds(feeds: &[FeedConfig]) -> Self {
        Self(
            feeds
                .iter()
                .filter_map(|f| f.total.map(|t| (f.name.clone(), t)))
                .collect(),
        )
    }
}

impl TotalSource for StaticTotals {
    fn total_items(&self, queue_name: &str) -> Result<Option<u64>, AppError> {
        Ok(self.0.get(queue_name).copied())
    }
}

/// Deduplicated audio-entry counts from each feed's RSS, plus its adjustment.
#[derive(Debug, Default)]
pub struct CatalogTotals(HashMap<String, u64>);

impl CatalogTotals {
    /// Fetch every feed with a URL and no static total, syncing entries into
    /// the store along the way. Feeds that fail or list nothing are left out.
    pub async fn discover(db: &Database, feeds: &[FeedConfig]) -> Self {
        let mut totals = HashMap::new();

        for feed in feeds {
            let Some(url) = feed.url.as_deref() else {
                continue;
            };

            let catalog = match fetch_feed(url).await {
                Ok(catalog) => catalog,
                Err(e) => {
                    log::warn!("Failed to fetch catalog for {}: {}", feed.name, e);
                    continue;
                }
            };

            if catalog.entries.is_empty() {
                log::warn!("Catalog for {} lists no audio entries", feed.name);
                continue;
            }

            if let Err(e) = sync_catalog(db, &feed.name, &catalog) {
                log::warn!("Failed to record catalog entries for {}: {}", feed.name, e);
            }

            let count = catalog.entries.len() as i64 + feed.total_adjustment;
            if feed.total_adjustment != 0 {
                log::info!("Adjusted {} total by {}", feed.name, feed.total_adjustment);
            }
            totals.insert(feed.name.clone(), count.max(0) as u64);
        }

        Self(totals)
    }

    pub fn from_map(totals: HashMap<String, u64>) -> Self {
        Self(totals)
    }
}

impl TotalSource for CatalogTotals {
    fn total_items(&self, queue_name: &str) -> Result<Option<u64>, AppError> {
        Ok(self.0.get(queue_name).copied())
    }
}

/// Last resort: whatever the store already knows about.
pub struct StoreTotals {
    db: Arc<Database>,
}

impl StoreTotals {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl TotalSource for StoreTotals {
    fn total_items(&self, queue_name: &str) -> Result<Option<u64>, AppError> {
        let count = self.db.count_items(queue_name)?;
        Ok(Some(count.max(0) as u64))
    }
}

/// Resolve a total for every feed, asking `sources` in order.
pub fn resolve_totals(
    feeds: &[FeedConfig],
    sources: &[&dyn TotalSource],
) -> HashMap<String, u64> {
    let mut totals = HashMap::new();

    for feed in feeds {
        let mut resolved = None;
        for source in sources {
            match source.total_items(&feed.name) {
                Ok(Some(total)) => {
                    resolved = Some(total);
                    break;
                }
                Ok(None) => {}
                Err(e) => log::warn!("Total lookup failed for {}: {}", feed.name, e),
            }
        }
        totals.insert(feed.name.clone(), resolved.unwrap_or(0));
    }

    totals
}
