//! Application configuration for regwatch.
//!
//! User config lives at `~/.regwatch/regwatch.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RegwatchError, Result};
use crate::types::FirmProfile;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "regwatch.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".regwatch";

/// Largest accepted `max_age_days`, about a century.
pub const MAX_AGE_DAYS_LIMIT: u32 = 36_500;

// ---------------------------------------------------------------------------
// Config structs (matching regwatch.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global adapter defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Retry/backoff policy for transient failures.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Storage backends.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Enrichment service settings.
    #[serde(default)]
    pub enrichment: EnrichmentConfig,

    /// Relevance scoring weights.
    #[serde(default)]
    pub scoring: ScoringConfig,

    /// Interaction weight table.
    #[serde(default)]
    pub feedback: FeedbackWeights,

    /// HTTP control surface.
    #[serde(default)]
    pub server: ServerConfig,

    /// Configured regulatory sources.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,

    /// Subscriber profiles.
    #[serde(default)]
    pub profiles: Vec<FirmProfile>,
}

impl AppConfig {
    /// Profiles with their sectors mapped onto the canonical vocabulary.
    pub fn normalized_profiles(&self) -> Vec<FirmProfile> {
        self.profiles.iter().cloned().map(FirmProfile::normalized).collect()
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.defaults.concurrency == 0 {
            return Err(RegwatchError::config("defaults.concurrency must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(RegwatchError::config("retry.max_attempts must be at least 1"));
        }
        if self.defaults.max_age_days > MAX_AGE_DAYS_LIMIT {
            return Err(RegwatchError::config(format!(
                "defaults.max_age_days must be at most {MAX_AGE_DAYS_LIMIT}"
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if source.code.trim().is_empty() {
                return Err(RegwatchError::config("source code must not be empty"));
            }
            if !seen.insert(source.code.as_str()) {
                return Err(RegwatchError::config(format!(
                    "duplicate source code '{}'",
                    source.code
                )));
            }
            if source.urls.is_empty() {
                return Err(RegwatchError::config(format!(
                    "source '{}' has no urls",
                    source.code
                )));
            }
            if source.max_age_days.is_some_and(|days| days > MAX_AGE_DAYS_LIMIT) {
                return Err(RegwatchError::config(format!(
                    "source '{}' max_age_days must be at most {MAX_AGE_DAYS_LIMIT}",
                    source.code
                )));
            }
            if source.kind == SourceKind::HtmlListing && source.selectors.is_none() {
                return Err(RegwatchError::config(format!(
                    "html_listing source '{}' needs [sources.selectors]",
                    source.code
                )));
            }
        }
        Ok(())
    }
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Worker pool size.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Cumulative timeout for one adapter call.
    #[serde(default = "default_adapter_timeout_secs")]
    pub adapter_timeout_secs: u64,

    /// Minimum delay between two calls to the same source.
    #[serde(default = "default_politeness_delay_ms")]
    pub politeness_delay_ms: u64,

    /// Maximum candidates kept per source call.
    #[serde(default = "default_max_items")]
    pub max_items: usize,

    /// Candidates older than this are dropped on incremental runs.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            adapter_timeout_secs: default_adapter_timeout_secs(),
            politeness_delay_ms: default_politeness_delay_ms(),
            max_items: default_max_items(),
            max_age_days: default_max_age_days(),
        }
    }
}

fn default_concurrency() -> usize {
    4
}
fn default_adapter_timeout_secs() -> u64 {
    30
}
fn default_politeness_delay_ms() -> u64 {
    1000
}
fn default_max_items() -> usize {
    50
}
fn default_max_age_days() -> u32 {
    30
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    250
}
fn default_max_delay_ms() -> u64 {
    10_000
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// libSQL database file.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// JSON snapshot used when the database cannot be opened.
    #[serde(default = "default_fallback_path")]
    pub fallback_path: String,

    /// Whether to fall back to the file store at all.
    #[serde(default = "default_true")]
    pub allow_fallback: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            fallback_path: default_fallback_path(),
            allow_fallback: true,
        }
    }
}

fn default_database_path() -> String {
    "~/.regwatch/regwatch.db".into()
}
fn default_fallback_path() -> String {
    "~/.regwatch/regwatch-fallback.json".into()
}
fn default_true() -> bool {
    true
}

/// `[enrichment]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    /// Analysis endpoint. Enrichment is disabled when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model identifier passed through to the service.
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_enrichment_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key_env: default_api_key_env(),
            model: default_model(),
            timeout_secs: default_enrichment_timeout_secs(),
        }
    }
}

impl EnrichmentConfig {
    /// Read the API key from the configured env var, if set and non-empty.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|v| !v.is_empty())
    }
}

fn default_api_key_env() -> String {
    "REGWATCH_ENRICHMENT_KEY".into()
}
fn default_model() -> String {
    "regulatory-analyst-v1".into()
}
fn default_enrichment_timeout_secs() -> u64 {
    20
}

/// `[scoring]` section. Weights of the base relevance score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_sector_weight")]
    pub sector_weight: f64,
    #[serde(default = "default_urgency_weight")]
    pub urgency_weight: f64,
    #[serde(default = "default_confidence_weight")]
    pub confidence_weight: f64,
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,

    /// Age at which the recency factor halves.
    #[serde(default = "default_recency_half_life_days")]
    pub recency_half_life_days: f64,

    /// Lower bound the recency factor decays toward.
    #[serde(default = "default_recency_floor")]
    pub recency_floor: f64,

    /// Largest share of the headroom (above the base score for positive
    /// feedback, below it for negative) feedback may take. Capped below 1.
    #[serde(default = "default_feedback_cap")]
    pub feedback_cap: f64,

    /// Weight-delta units that map to one full `feedback_cap`.
    #[serde(default = "default_feedback_scale")]
    pub feedback_scale: f64,

    #[serde(default)]
    pub urgency: UrgencyHeuristicConfig,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            sector_weight: default_sector_weight(),
            urgency_weight: default_urgency_weight(),
            confidence_weight: default_confidence_weight(),
            recency_weight: default_recency_weight(),
            recency_half_life_days: default_recency_half_life_days(),
            recency_floor: default_recency_floor(),
            feedback_cap: default_feedback_cap(),
            feedback_scale: default_feedback_scale(),
            urgency: UrgencyHeuristicConfig::default(),
        }
    }
}

fn default_sector_weight() -> f64 {
    0.4
}
fn default_urgency_weight() -> f64 {
    0.25
}
fn default_confidence_weight() -> f64 {
    0.15
}
fn default_recency_weight() -> f64 {
    0.2
}
fn default_recency_half_life_days() -> f64 {
    14.0
}
fn default_recency_floor() -> f64 {
    0.2
}
fn default_feedback_cap() -> f64 {
    0.15
}
fn default_feedback_scale() -> f64 {
    10.0
}

/// `[scoring.urgency]` section. Heuristic urgency weights and level thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrgencyHeuristicConfig {
    #[serde(default = "default_deadline_weight")]
    pub deadline_weight: f64,
    #[serde(default = "default_impact_weight")]
    pub impact_weight: f64,
    #[serde(default = "default_heuristic_confidence_weight")]
    pub confidence_weight: f64,
    #[serde(default = "default_relevance_weight")]
    pub relevance_weight: f64,

    /// Deadlines further out than this contribute nothing.
    #[serde(default = "default_deadline_horizon_days")]
    pub deadline_horizon_days: f64,

    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,
    #[serde(default = "default_high_threshold")]
    pub high_threshold: f64,
    #[serde(default = "default_medium_threshold")]
    pub medium_threshold: f64,
}

impl Default for UrgencyHeuristicConfig {
    fn default() -> Self {
        Self {
            deadline_weight: default_deadline_weight(),
            impact_weight: default_impact_weight(),
            confidence_weight: default_heuristic_confidence_weight(),
            relevance_weight: default_relevance_weight(),
            deadline_horizon_days: default_deadline_horizon_days(),
            critical_threshold: default_critical_threshold(),
            high_threshold: default_high_threshold(),
            medium_threshold: default_medium_threshold(),
        }
    }
}

fn default_deadline_weight() -> f64 {
    0.4
}
fn default_impact_weight() -> f64 {
    0.3
}
fn default_heuristic_confidence_weight() -> f64 {
    0.15
}
fn default_relevance_weight() -> f64 {
    0.15
}
fn default_deadline_horizon_days() -> f64 {
    90.0
}
fn default_critical_threshold() -> f64 {
    0.8
}
fn default_high_threshold() -> f64 {
    0.6
}
fn default_medium_threshold() -> f64 {
    0.35
}

/// `[feedback]` section. Weight delta contributed per interaction kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackWeights {
    #[serde(default = "default_pin")]
    pub pin: f64,
    #[serde(default = "default_dismiss")]
    pub dismiss: f64,
    #[serde(default = "default_workflow_start")]
    pub workflow_start: f64,
    #[serde(default = "default_workflow_complete")]
    pub workflow_complete: f64,
    #[serde(default = "default_persona_switch")]
    pub persona_switch: f64,
}

impl Default for FeedbackWeights {
    fn default() -> Self {
        Self {
            pin: default_pin(),
            dismiss: default_dismiss(),
            workflow_start: default_workflow_start(),
            workflow_complete: default_workflow_complete(),
            persona_switch: default_persona_switch(),
        }
    }
}

fn default_pin() -> f64 {
    3.0
}
fn default_dismiss() -> f64 {
    -1.0
}
fn default_workflow_start() -> f64 {
    1.0
}
fn default_workflow_complete() -> f64 {
    2.0
}
fn default_persona_switch() -> f64 {
    0.5
}

/// `[server]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8787".into()
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// How a source publishes its announcements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// RSS or Atom feed.
    #[default]
    Feed,
    /// HTML page listing announcements, scraped with CSS selectors.
    HtmlListing,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Feed => "feed",
            Self::HtmlListing => "html_listing",
        }
    }
}

/// How records from a source are keyed for deduplication.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStrategy {
    #[default]
    Url,
    /// For sources whose URLs change between fetches.
    ContentHash,
}

/// CSS selectors for an HTML listing page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingSelectors {
    /// One match per announcement.
    pub item: String,
    pub headline: String,
    /// Element carrying the `href`. Defaults to the headline element.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// `[[sources]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Authority code stamped on every record (e.g. `FCA`).
    pub code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: SourceKind,
    pub urls: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub politeness_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_age_days: Option<u32>,

    #[serde(default)]
    pub identity: IdentityStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default)]
    pub sectors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selectors: Option<ListingSelectors>,
}

impl SourceConfig {
    pub fn new(code: impl Into<String>, kind: SourceKind, urls: Vec<String>) -> Self {
        let code = code.into();
        Self {
            name: code.clone(),
            code,
            kind,
            urls,
            timeout_secs: None,
            politeness_delay_ms: None,
            max_items: None,
            max_age_days: None,
            identity: IdentityStrategy::Url,
            country: None,
            sectors: Vec::new(),
            selectors: None,
        }
    }

    /// Resolve per-source overrides against the global defaults.
    pub fn limits(&self, defaults: &DefaultsConfig) -> SourceLimits {
        SourceLimits {
            timeout: Duration::from_secs(self.timeout_secs.unwrap_or(defaults.adapter_timeout_secs)),
            politeness_delay: Duration::from_millis(
                self.politeness_delay_ms.unwrap_or(defaults.politeness_delay_ms),
            ),
            max_items: self.max_items.unwrap_or(defaults.max_items),
            max_age_days: Some(self.max_age_days.unwrap_or(defaults.max_age_days)),
        }
    }
}

// ---------------------------------------------------------------------------
// Source limits (runtime, merged from defaults + per-source overrides)
// ---------------------------------------------------------------------------

/// Effective per-call limits for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceLimits {
    pub timeout: Duration,
    pub politeness_delay: Duration,
    pub max_items: usize,
    /// `None` disables the age cutoff (full runs).
    pub max_age_days: Option<u32>,
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.regwatch/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| RegwatchError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.regwatch/regwatch.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| RegwatchError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| RegwatchError::config(format!("failed to parse {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| RegwatchError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let content = toml::to_string_pretty(&AppConfig::default())
        .map_err(|e| RegwatchError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| RegwatchError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
