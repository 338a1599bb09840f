//! RSS/Atom feed adapter.

use async_trait::async_trait;
use tracing::{debug, info};

use regwatch_shared::{CandidateRecord, RegwatchError, SourceConfig, SourceLimits};

use super::{AdapterOutput, SourceAdapter, resolve_link};
use crate::fetch::HttpFetcher;

/// Reads RSS 2.0, Atom and JSON feeds through `feed-rs`.
#[derive(Debug, Clone)]
pub struct FeedAdapter {
    fetcher: HttpFetcher,
}

impl FeedAdapter {
    pub fn new(fetcher: HttpFetcher) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl SourceAdapter for FeedAdapter {
    async fn fetch(&self, source: &SourceConfig, limits: &SourceLimits) -> AdapterOutput {
        let mut output = AdapterOutput::default();

        for feed_url in &source.urls {
            let body = match self.fetcher.get_text(&source.code, feed_url, limits.timeout).await {
                Ok(body) => body,
                Err(e) => {
                    output.note_error(e);
                    continue;
                }
            };

            match parse_feed(&source.code, feed_url, body.as_bytes()) {
                Ok(records) => {
                    info!(source = %source.code, feed_url, items = records.len(), "feed: parsed");
                    output.records.extend(records);
                }
                Err(e) => output.note_error(e),
            }
        }

        output
    }

    fn name(&self) -> &str {
        "feed"
    }
}

/// Parse a feed document into candidates, in document order.
pub fn parse_feed(
    authority: &str,
    feed_url: &str,
    bytes: &[u8],
) -> Result<Vec<CandidateRecord>, RegwatchError> {
    let feed = feed_rs::parser::parse(bytes)
        .map_err(|e| RegwatchError::adapter(authority, format!("{feed_url}: feed parse failed: {e}")))?;

    let records = feed
        .entries
        .into_iter()
        .map(|entry| {
            let url = entry
                .links
                .first()
                .map(|l| resolve_link(feed_url, &l.href))
                .or_else(|| entry.id.starts_with("http").then(|| entry.id.clone()))
                .unwrap_or_default();

            // feed-rs leaves unparseable dates as None.
            let published = entry
                .published
                .or(entry.updated)
                .map(|dt| dt.with_timezone(&chrono::Utc));

            let headline = entry.title.map(|t| t.content).unwrap_or_default();
            if url.is_empty() {
                debug!(authority, headline, "feed entry without link");
            }

            let mut record = CandidateRecord::new(headline, url, authority, published);
            if let Some(summary) = entry.summary {
                record = record.with_field("summary", summary.content);
            }
            let categories: Vec<serde_json::Value> = entry
                .categories
                .into_iter()
                .map(|c| serde_json::Value::String(c.label.unwrap_or(c.term)))
                .collect();
            if !categories.is_empty() {
                record = record.with_field("categories", categories);
            }
            record
        })
        .collect();

    Ok(records)
}
