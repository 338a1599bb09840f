//! Core domain types for regwatch: candidates, stored updates, insights,
//! profiles, feedback and pipeline runs.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RegwatchError, Result};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for stored update identifiers (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Identifier of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// CandidateRecord / NormalizedRecord
// ---------------------------------------------------------------------------

/// Opaque source-specific fields carried by a candidate (country, sectors, priority, summary...).
pub type RawPayload = serde_json::Map<String, serde_json::Value>;

/// Output of a source adapter, before validation and persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub headline: String,
    /// Absolute URL as published by the source. Canonicalized during normalization.
    pub url: String,
    /// Source code of the issuing authority (e.g. `FCA`).
    pub authority: String,
    /// `None` when the source date is missing or could not be parsed.
    pub published_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub raw_payload: RawPayload,
}

impl CandidateRecord {
    pub fn new(
        headline: impl Into<String>,
        url: impl Into<String>,
        authority: impl Into<String>,
        published_date: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            headline: headline.into(),
            url: url.into(),
            authority: authority.into(),
            published_date,
            raw_payload: RawPayload::new(),
        }
    }

    /// Attach a raw payload field.
    pub fn with_field(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.raw_payload.insert(key.to_string(), value.into());
        self
    }
}

/// Priority hint carried by some sources.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Lenient parse of a source-provided priority label or number.
    pub fn from_raw(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "high" | "urgent" | "critical" => Self::High,
                "low" | "minor" => Self::Low,
                _ => Self::Normal,
            },
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(v) if v >= 0.7 => Self::High,
                Some(v) if v < 0.3 => Self::Low,
                _ => Self::Normal,
            },
            _ => Self::Normal,
        }
    }
}

/// A candidate after validation: canonical identity plus strongly typed fields.
///
/// Nothing past the `normalized` stage reads the raw payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    /// Canonical identity key (canonical URL or `hash:` content key).
    pub identity: String,
    pub headline: String,
    pub url: String,
    pub authority: String,
    pub published_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    /// Canonical sector tags.
    #[serde(default)]
    pub sectors: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    /// Compliance deadline, when the source provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// StoredUpdate
// ---------------------------------------------------------------------------

/// The durable record, owned by the deduplication store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredUpdate {
    pub id: RecordId,
    #[serde(flatten)]
    pub record: NormalizedRecord,
    /// SHA-256 over headline, summary and published date.
    pub fingerprint: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment: Option<AiInsight>,
    /// Last computed score per profile id.
    #[serde(default)]
    pub relevance_cache: BTreeMap<String, f64>,
}

impl StoredUpdate {
    pub fn identity(&self) -> &str {
        &self.record.identity
    }

    /// The enrichment, unless it has expired at `now`.
    pub fn valid_insight(&self, now: DateTime<Utc>) -> Option<&AiInsight> {
        self.enrichment.as_ref().filter(|i| !i.is_expired(now))
    }
}

/// Result of a deduplicating upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created,
    Updated,
    Unchanged,
}

// ---------------------------------------------------------------------------
// AiInsight
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightType {
    Prediction,
    Pattern,
    Impact,
    Summary,
    Alert,
    Trend,
    Recommendation,
}

/// Urgency, ordered from least to most pressing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrgencyLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl UrgencyLevel {
    pub const ALL: [UrgencyLevel; 4] = [Self::Low, Self::Medium, Self::High, Self::Critical];

    /// 0 for low through 3 for critical.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Business impact sub-scores, each in `[0, 10]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BusinessImpact {
    pub financial: f64,
    pub operational: f64,
    pub compliance: f64,
    pub strategic: f64,
}

impl BusinessImpact {
    pub fn dimensions(&self) -> [(&'static str, f64); 4] {
        [
            ("financial", self.financial),
            ("operational", self.operational),
            ("compliance", self.compliance),
            ("strategic", self.strategic),
        ]
    }

    /// Mean of the four dimensions.
    pub fn overall(&self) -> f64 {
        (self.financial + self.operational + self.compliance + self.strategic) / 4.0
    }
}

/// AI-derived insight attached to a stored update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiInsight {
    pub insight_type: InsightType,
    pub confidence_score: f64,
    pub relevance_score: f64,
    pub urgency_level: UrgencyLevel,
    #[serde(default)]
    pub business_impact: BusinessImpact,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Float tolerance accepted at the `[0, 1]` boundaries before clamping.
const SCORE_EPSILON: f64 = 1e-9;

impl AiInsight {
    /// Reject out-of-range scores, then clamp boundary noise into range.
    pub fn validate(mut self) -> Result<Self> {
        for (name, value) in [
            ("confidence_score", self.confidence_score),
            ("relevance_score", self.relevance_score),
        ] {
            if !value.is_finite() || !(-SCORE_EPSILON..=1.0 + SCORE_EPSILON).contains(&value) {
                return Err(RegwatchError::validation(format!(
                    "{name} {value} outside [0, 1]"
                )));
            }
        }
        for (name, value) in self.business_impact.dimensions() {
            if !value.is_finite() || !(0.0..=10.0).contains(&value) {
                return Err(RegwatchError::validation(format!(
                    "business_impact.{name} {value} outside [0, 10]"
                )));
            }
        }
        self.confidence_score = self.confidence_score.clamp(0.0, 1.0);
        self.relevance_score = self.relevance_score.clamp(0.0, 1.0);
        Ok(self)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.valid_until.is_some_and(|until| until <= now)
    }
}

// ---------------------------------------------------------------------------
// FirmProfile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmSize {
    Small,
    #[default]
    Medium,
    Large,
}

/// Subscriber configuration. Read-only to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmProfile {
    pub id: String,
    #[serde(default)]
    pub primary_sectors: BTreeSet<String>,
    #[serde(default)]
    pub firm_size: FirmSize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
}

impl FirmProfile {
    pub fn new<I, S>(id: impl Into<String>, sectors: I, firm_size: FirmSize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            id: id.into(),
            primary_sectors: crate::sectors::canonical_sectors(sectors),
            firm_size,
            persona: None,
        }
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = Some(persona.into());
        self
    }

    /// Re-map sector labels onto the canonical vocabulary (used after config load).
    pub fn normalized(mut self) -> Self {
        self.primary_sectors = crate::sectors::canonical_sectors(&self.primary_sectors);
        self
    }
}

// ---------------------------------------------------------------------------
// Feedback
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Authority,
    Theme,
    Persona,
    WorkflowTemplate,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authority => "authority",
            Self::Theme => "theme",
            Self::Persona => "persona",
            Self::WorkflowTemplate => "workflow_template",
        }
    }
}

impl std::str::FromStr for EntityType {
    type Err = RegwatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "authority" => Ok(Self::Authority),
            "theme" => Ok(Self::Theme),
            "persona" => Ok(Self::Persona),
            "workflow_template" => Ok(Self::WorkflowTemplate),
            other => Err(RegwatchError::validation(format!("unknown entity type '{other}'"))),
        }
    }
}

/// Accumulated weight correction for one (profile, entity) key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackAdjustment {
    pub profile_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub weight_delta: f64,
    pub occurrences: u64,
    pub last_event_at: DateTime<Utc>,
}

impl FeedbackAdjustment {
    /// Fold another contribution for the same key into this one.
    pub fn absorb(&mut self, other: &FeedbackAdjustment) {
        self.weight_delta += other.weight_delta;
        self.occurrences += other.occurrences;
        self.last_event_at = self.last_event_at.max(other.last_event_at);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Pin,
    Dismiss,
    WorkflowStart,
    WorkflowComplete,
    PersonaSwitch,
}

/// One observed user interaction, the aggregator's input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionEvent {
    pub profile_id: String,
    pub kind: InteractionKind,
    pub occurred_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_id: Option<RecordId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authority: Option<String>,
    #[serde(default)]
    pub themes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_template: Option<String>,
}

impl InteractionEvent {
    pub fn new(profile_id: impl Into<String>, kind: InteractionKind, occurred_at: DateTime<Utc>) -> Self {
        Self {
            profile_id: profile_id.into(),
            kind,
            occurred_at,
            record_id: None,
            authority: None,
            themes: Vec::new(),
            persona: None,
            workflow_template: None,
        }
    }

    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = Some(authority.into());
        self
    }

    pub fn with_theme(mut self, theme: impl Into<String>) -> Self {
        self.themes.push(theme.into());
        self
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = Some(persona.into());
        self
    }

    pub fn with_workflow_template(mut self, template: impl Into<String>) -> Self {
        self.workflow_template = Some(template.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Pipeline runs
// ---------------------------------------------------------------------------

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Discover,
    Fetch,
    Normalize,
    Dedup,
    Persist,
    Enrich,
    Score,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discover => "discover",
            Self::Fetch => "fetch",
            Self::Normalize => "normalize",
            Self::Dedup => "dedup",
            Self::Persist => "persist",
            Self::Enrich => "enrich",
            Self::Score => "score",
            Self::Done => "done",
        }
    }

    /// Stages that can be replayed over stored records without fresh source data.
    pub fn is_backfillable(&self) -> bool {
        matches!(self, Self::Enrich | Self::Score)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Stage {
    type Err = RegwatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "discover" => Ok(Self::Discover),
            "fetch" => Ok(Self::Fetch),
            "normalize" => Ok(Self::Normalize),
            "dedup" => Ok(Self::Dedup),
            "persist" => Ok(Self::Persist),
            "enrich" | "enrichment" => Ok(Self::Enrich),
            "score" | "scoring" => Ok(Self::Score),
            "done" => Ok(Self::Done),
            other => Err(RegwatchError::not_found(format!("stage '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Cancelled,
    /// Aborted by a run-level error. Resumable.
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Paused)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = RegwatchError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            other => Err(RegwatchError::Storage(format!("unknown run status '{other}'"))),
        }
    }
}

/// What a run does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunKind {
    /// Normal scheduled cycle, honoring `max_age_days`.
    Incremental,
    /// Full pipeline from stage 1, ignoring the age cutoff.
    Full,
    /// Replay of one stage over stored records.
    Backfill {
        stage: Stage,
        /// Only records without a valid insight (enrich backfills).
        #[serde(default)]
        missing_only: bool,
    },
}

/// Per-source counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCounts {
    pub fetched: u64,
    pub new: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub errors: u64,
    #[serde(default)]
    pub enrichment_failures: u64,
}

impl SourceCounts {
    pub fn add(&mut self, other: &SourceCounts) {
        self.fetched += other.fetched;
        self.new += other.new;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.errors += other.errors;
        self.enrichment_failures += other.enrichment_failures;
    }
}

/// One execution of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: RunId,
    pub kind: RunKind,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub stage_cursor: Stage,
    #[serde(default)]
    pub per_source_counts: BTreeMap<String, SourceCounts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PipelineRun {
    pub fn new(kind: RunKind) -> Self {
        Self {
            run_id: RunId::new(),
            kind,
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Pending,
            stage_cursor: Stage::Discover,
            per_source_counts: BTreeMap::new(),
            last_error: None,
        }
    }

    pub fn counts_mut(&mut self, source: &str) -> &mut SourceCounts {
        self.per_source_counts.entry(source.to_string()).or_default()
    }

    /// Sum of the per-source counters.
    pub fn totals(&self) -> SourceCounts {
        let mut total = SourceCounts::default();
        for counts in self.per_source_counts.values() {
            total.add(counts);
        }
        total
    }

    /// Wall time since start, frozen once the run has finished.
    pub fn elapsed(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.finished_at.unwrap_or(now) - self.started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insight(confidence: f64, relevance: f64) -> AiInsight {
        AiInsight {
            insight_type: InsightType::Impact,
            confidence_score: confidence,
            relevance_score: relevance,
            urgency_level: UrgencyLevel::High,
            business_impact: BusinessImpact {
                financial: 4.0,
                operational: 2.0,
                compliance: 8.0,
                strategic: 6.0,
            },
            valid_until: None,
            summary: None,
        }
    }

    #[test]
    fn record_id_roundtrip() {
        let id = RecordId::new();
        let parsed: RecordId = id.to_string().parse().expect("parse RecordId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn insight_validation_rejects_out_of_range() {
        assert!(insight(1.2, 0.5).validate().is_err());
        assert!(insight(0.5, -0.1).validate().is_err());
        assert!(insight(f64::NAN, 0.5).validate().is_err());

        let mut bad_impact = insight(0.5, 0.5);
        bad_impact.business_impact.compliance = 11.0;
        assert!(bad_impact.validate().is_err());
    }

    #[test]
    fn insight_validation_clamps_boundary_noise() {
        let v = insight(1.0 + 1e-12, 0.0 - 1e-12).validate().expect("valid");
        assert_eq!(v.confidence_score, 1.0);
        assert_eq!(v.relevance_score, 0.0);
    }

    #[test]
    fn insight_expiry() {
        let now = Utc::now();
        let mut i = insight(0.5, 0.5);
        assert!(!i.is_expired(now));
        i.valid_until = Some(now - chrono::Duration::hours(1));
        assert!(i.is_expired(now));
    }

    #[test]
    fn urgency_is_ordered() {
        assert!(UrgencyLevel::Low < UrgencyLevel::Medium);
        assert!(UrgencyLevel::High < UrgencyLevel::Critical);
        assert_eq!(UrgencyLevel::Critical.rank(), 3);
    }

    #[test]
    fn stage_parse_and_backfillable() {
        assert_eq!("Enrich".parse::<Stage>().unwrap(), Stage::Enrich);
        assert_eq!("scoring".parse::<Stage>().unwrap(), Stage::Score);
        assert!("teleport".parse::<Stage>().is_err());
        assert!(Stage::Enrich.is_backfillable());
        assert!(!Stage::Fetch.is_backfillable());
    }

    #[test]
    fn stored_update_flattens_record() {
        let now = Utc::now();
        let update = StoredUpdate {
            id: RecordId::new(),
            record: NormalizedRecord {
                identity: "https://fca.org.uk/news/ps24-1".into(),
                headline: "Policy statement".into(),
                url: "https://fca.org.uk/news/ps24-1".into(),
                authority: "FCA".into(),
                published_date: None,
                summary: None,
                country: Some("UK".into()),
                sectors: vec!["banking".into()],
                priority: Priority::High,
                deadline: None,
            },
            fingerprint: "abc".into(),
            first_seen_at: now,
            last_updated_at: now,
            enrichment: None,
            relevance_cache: BTreeMap::new(),
        };
        let json = serde_json::to_value(&update).expect("serialize");
        assert_eq!(json["identity"], "https://fca.org.uk/news/ps24-1");
        assert!(json["published_date"].is_null());
        let back: StoredUpdate = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, update);
    }

    #[test]
    fn run_totals_sum_sources() {
        let mut run = PipelineRun::new(RunKind::Incremental);
        run.counts_mut("FCA").fetched = 3;
        run.counts_mut("SEC").fetched = 2;
        run.counts_mut("SEC").errors = 1;
        let totals = run.totals();
        assert_eq!(totals.fetched, 5);
        assert_eq!(totals.errors, 1);
    }

    #[test]
    fn adjustment_absorb_sums() {
        let t0 = Utc::now();
        let mut a = FeedbackAdjustment {
            profile_id: "p".into(),
            entity_type: EntityType::Authority,
            entity_id: "FCA".into(),
            weight_delta: 3.0,
            occurrences: 1,
            last_event_at: t0,
        };
        let b = FeedbackAdjustment {
            weight_delta: -1.0,
            occurrences: 2,
            last_event_at: t0 + chrono::Duration::seconds(5),
            ..a.clone()
        };
        a.absorb(&b);
        assert_eq!(a.weight_delta, 2.0);
        assert_eq!(a.occurrences, 3);
        assert_eq!(a.last_event_at, b.last_event_at);
    }

    #[test]
    fn priority_from_raw() {
        assert_eq!(Priority::from_raw(&"URGENT".into()), Priority::High);
        assert_eq!(Priority::from_raw(&serde_json::json!(0.1)), Priority::Low);
        assert_eq!(Priority::from_raw(&serde_json::Value::Null), Priority::Normal);
    }
}
