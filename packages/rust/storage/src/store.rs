//! The storage interface shared by the database and file backends.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};

use regwatch_shared::{
    AiInsight, FeedbackAdjustment, InteractionEvent, PipelineRun, RecordId, RegwatchError, Result,
    RunId, StoredUpdate,
};

/// Durable state of the pipeline: stored updates and their caches, feedback,
/// interactions, watermarks and run history.
///
/// All writes to stored updates go through [`crate::DedupStore::upsert`] or
/// the enrichment/score setters below; nothing else mutates them.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Backend name for logs and `stats`.
    fn backend(&self) -> &'static str;

    // -- stored updates ------------------------------------------------------

    async fn get_update(&self, identity: &str) -> Result<Option<StoredUpdate>>;

    async fn get_update_by_id(&self, id: RecordId) -> Result<Option<StoredUpdate>>;

    /// Insert a new update. The identity must not exist yet.
    async fn insert_update(&self, update: &StoredUpdate) -> Result<()>;

    /// Overwrite the update with the same identity, including its relevance cache.
    async fn replace_update(&self, update: &StoredUpdate) -> Result<()>;

    /// All updates, oldest first.
    async fn list_updates(&self) -> Result<Vec<StoredUpdate>>;

    async fn count_updates(&self) -> Result<u64>;

    /// Attach (or clear) enrichment. Always drops the record's cached scores.
    async fn set_enrichment(&self, id: RecordId, insight: Option<&AiInsight>) -> Result<()>;

    /// Cache a computed relevance score for one profile.
    async fn set_relevance(&self, id: RecordId, profile_id: &str, score: f64) -> Result<()>;

    /// Drop every cached score for a profile. Returns how many were dropped.
    async fn invalidate_profile_scores(&self, profile_id: &str) -> Result<u64>;

    // -- feedback --------------------------------------------------------------

    /// Add each adjustment onto the stored row for its key, creating it if needed.
    async fn apply_feedback(&self, adjustments: &[FeedbackAdjustment]) -> Result<()>;

    async fn feedback_for(&self, profile_id: &str) -> Result<Vec<FeedbackAdjustment>>;

    /// Append an event to the interaction log and return its sequence number.
    /// Sequence numbers strictly increase in insertion order, whatever the
    /// event's `occurred_at`.
    async fn record_interaction(&self, event: &InteractionEvent) -> Result<u64>;

    /// Logged interactions with a sequence number above `after` (all when
    /// `None`), in insertion order.
    async fn interactions_after(&self, after: Option<u64>) -> Result<Vec<(u64, InteractionEvent)>>;

    /// Last interaction sequence number a named consumer has processed.
    async fn get_watermark(&self, name: &str) -> Result<Option<u64>>;

    async fn set_watermark(&self, name: &str, seq: u64) -> Result<()>;

    // -- runs ------------------------------------------------------------------

    /// Insert or overwrite a run record.
    async fn save_run(&self, run: &PipelineRun) -> Result<()>;

    async fn get_run(&self, run_id: RunId) -> Result<Option<PipelineRun>>;

    /// All runs, newest first.
    async fn list_runs(&self) -> Result<Vec<PipelineRun>>;
}

/// Fixed-width UTC timestamp text, so lexical order matches time order.
pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| RegwatchError::Storage(format!("bad timestamp '{s}': {e}")))
}
