//! Pipeline orchestration and domain logic for regwatch.
//!
//! This crate ties source adapters, normalization, deduplicated storage,
//! enrichment and relevance scoring into runs driven by the
//! [`IngestionCoordinator`].

pub mod coordinator;
pub mod enrichment;
pub mod feedback;
pub mod normalize;
pub mod progress;
pub mod retry;
pub mod scoring;
pub mod state;
pub mod urgency;

pub use coordinator::{
    CoordinatorBuilder, IngestionCoordinator, ItemIssue, ItemSummary, PipelineStats, RunReport,
};
pub use enrichment::{EnrichmentService, HttpEnrichmentService};
pub use feedback::{AggregationReport, FeedbackAggregator};
pub use progress::{ProgressReporter, SilentProgress};
pub use retry::RetryPolicy;
pub use scoring::RelevanceScorer;
