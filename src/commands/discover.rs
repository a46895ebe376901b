use super::open_database;
use crate::config::OrchestratorConfig;
use crate::feeds::sync_feed;
use anyhow::bail;
use serde::Serialize;

#[derive(Serialize)]
struct DiscoverOutput {
    feed: String,
    added: usize,
    updated: usize,
    error: Option<String>,
}

/// Sync feed catalogs into the store and print what changed as JSON.
///
/// A feed that fails to fetch is reported and does not stop the others.
pub async fn discover(config: &OrchestratorConfig, only: Option<&str>) -> anyhow::Result<()> {
    if let Some(name) = only {
        if config.feed(name).is_none() {
            bail!("Unknown feed: {}", name);
        }
    }

    let db = open_database(config)?;
    let mut results = Vec::new();

    for feed in &config.feeds {
        if only.is_some_and(|name| name != feed.name) {
            continue;
        }
        let Some(url) = feed.url.as_deref() else {
            log::debug!("{} has no feed URL, skipping", feed.name);
            continue;
        };

        let result = match sync_feed(&db, &feed.name, url).await {
            Ok((added, updated)) => DiscoverOutput {
                feed: feed.name.clone(),
                added,
                updated,
                error: None,
            },
            Err(e) => {
                log::warn!("Failed to sync {}: {}", feed.name, e);
                DiscoverOutput {
                    feed: feed.name.clone(),
                    added: 0,
                    updated: 0,
                    error: Some(e.to_string()),
                }
            }
        };
        results.push(result);
    }

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
