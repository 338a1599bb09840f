//! Shared types, error model, and configuration for regwatch.
//!
//! This crate is the foundation depended on by all other regwatch crates.
//! It provides:
//! - [`RegwatchError`]: the unified error type
//! - Domain types ([`CandidateRecord`], [`StoredUpdate`], [`AiInsight`], [`PipelineRun`], ...)
//! - Canonical identity keys and sector vocabulary
//! - Configuration ([`AppConfig`], [`SourceConfig`], config loading)

pub mod config;
pub mod error;
pub mod identity;
pub mod sectors;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DefaultsConfig, EnrichmentConfig, FeedbackWeights, IdentityStrategy,
    ListingSelectors, RetryConfig, ScoringConfig, ServerConfig, SourceConfig, SourceKind,
    SourceLimits, StorageConfig, UrgencyHeuristicConfig, config_dir, config_file_path,
    expand_home, init_config, load_config, load_config_from,
};
pub use error::{RegwatchError, Result, TransientKind};
pub use identity::{canonicalize_url, content_hash_identity, fingerprint};
pub use sectors::{canonical_sector, canonical_sectors};
pub use types::{
    AiInsight, BusinessImpact, CandidateRecord, EntityType, FeedbackAdjustment, FirmProfile,
    FirmSize, InsightType, InteractionEvent, InteractionKind, NormalizedRecord, PipelineRun,
    Priority, RawPayload, RecordId, RunId, RunKind, RunStatus, SourceCounts, Stage, StoredUpdate,
    UpsertOutcome, UrgencyLevel,
};
