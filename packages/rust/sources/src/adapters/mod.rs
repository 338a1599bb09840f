//! Source adapter trait and built-in adapters.
//!
//! An adapter turns one [`SourceConfig`] into candidate records. Adapters are
//! black boxes to the rest of the pipeline: they report what they found and
//! what went wrong, and never retry on their own.

mod feed;
mod listing;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use regwatch_shared::{CandidateRecord, RegwatchError, Result, SourceConfig, SourceKind, SourceLimits};

use crate::fetch::HttpFetcher;

pub use feed::FeedAdapter;
pub use listing::ListingAdapter;

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

/// What one adapter call produced: possibly partial records and the first error hit.
#[derive(Debug, Default)]
pub struct AdapterOutput {
    /// Candidates in discovery order.
    pub records: Vec<CandidateRecord>,
    pub error: Option<RegwatchError>,
}

impl AdapterOutput {
    pub fn ok(records: Vec<CandidateRecord>) -> Self {
        Self {
            records,
            error: None,
        }
    }

    pub fn failed(error: RegwatchError) -> Self {
        Self {
            records: Vec::new(),
            error: Some(error),
        }
    }

    /// Record `error` unless an earlier one is already held.
    pub fn note_error(&mut self, error: RegwatchError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Worth retrying: nothing came back and the failure was transient.
    pub fn is_retryable(&self) -> bool {
        self.records.is_empty() && self.error.as_ref().is_some_and(|e| e.is_transient())
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Fetches announcements from one kind of source.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Fetch candidates for `source`. Failures are reported in the output, never raised.
    async fn fetch(&self, source: &SourceConfig, limits: &SourceLimits) -> AdapterOutput;

    /// Human-readable adapter name for tracing.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Resolves the adapter for a source: per-source overrides first, then by kind.
#[derive(Clone)]
pub struct AdapterRegistry {
    by_kind: HashMap<SourceKind, Arc<dyn SourceAdapter>>,
    by_source: HashMap<String, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            by_kind: HashMap::new(),
            by_source: HashMap::new(),
        }
    }

    /// A registry with the built-in feed and listing adapters.
    pub fn new() -> Result<Self> {
        let fetcher = HttpFetcher::new()?;
        let mut registry = Self::empty();
        registry.register_kind(SourceKind::Feed, Arc::new(FeedAdapter::new(fetcher.clone())));
        registry.register_kind(SourceKind::HtmlListing, Arc::new(ListingAdapter::new(fetcher)));
        Ok(registry)
    }

    pub fn register_kind(&mut self, kind: SourceKind, adapter: Arc<dyn SourceAdapter>) {
        self.by_kind.insert(kind, adapter);
    }

    /// Use `adapter` for the source with this code, whatever its kind.
    pub fn register_source(&mut self, code: impl Into<String>, adapter: Arc<dyn SourceAdapter>) {
        self.by_source.insert(code.into(), adapter);
    }

    pub fn resolve(&self, source: &SourceConfig) -> Option<Arc<dyn SourceAdapter>> {
        self.by_source
            .get(&source.code)
            .or_else(|| self.by_kind.get(&source.kind))
            .cloned()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("kinds", &self.by_kind.keys().collect::<Vec<_>>())
            .field("sources", &self.by_source.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Resolve `href` against the page it was found on. Empty when unresolvable.
pub(crate) fn resolve_link(base: &str, href: &str) -> String {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with("javascript:") {
        return String::new();
    }
    match url::Url::parse(base).and_then(|b| b.join(href)) {
        Ok(u) => u.to_string(),
        Err(_) => String::new(),
    }
}
