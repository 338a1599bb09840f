//! Relevance scoring of stored updates against firm profiles.

use chrono::{DateTime, Utc};

use regwatch_shared::{
    EntityType, FeedbackAdjustment, FirmProfile, Priority, ScoringConfig, StoredUpdate,
};

/// Sector factor when the record carries no sector tags at all.
const UNTAGGED_SECTOR_MATCH: f64 = 0.25;
/// Sector factor for records tagged `general` that match nothing specific.
const GENERAL_SECTOR_MATCH: f64 = 0.5;
/// Confidence assumed when there is no valid insight.
const NEUTRAL_CONFIDENCE: f64 = 0.5;
/// Upper bound on the effective feedback cap; at 1 the result would stop
/// depending on the base score.
const MAX_FEEDBACK_SHARE: f64 = 0.95;

/// Computes bounded relevance scores in `[0, 1]`.
///
/// Pure and deterministic: the same inputs always give the same score, and
/// nothing is cached or written here.
#[derive(Debug, Clone, Default)]
pub struct RelevanceScorer {
    config: ScoringConfig,
}

impl RelevanceScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Score `update` for `profile`, given that profile's feedback adjustments.
    ///
    /// `now` anchors recency decay and insight expiry. Feedback moves the base
    /// score a fraction of the way toward 1 (or 0), so the result stays in
    /// `[0, 1]` and strictly increases with the base score.
    pub fn score(
        &self,
        update: &StoredUpdate,
        profile: &FirmProfile,
        adjustments: &[FeedbackAdjustment],
        now: DateTime<Utc>,
    ) -> f64 {
        let base = self.base_score(update, profile, now);
        let delta = self.feedback_delta(update, profile, adjustments);
        if delta >= 0.0 {
            base + delta * (1.0 - base)
        } else {
            base + delta * base
        }
    }

    /// Weighted mean of sector overlap, urgency, confidence and recency.
    pub fn base_score(&self, update: &StoredUpdate, profile: &FirmProfile, now: DateTime<Utc>) -> f64 {
        let c = &self.config;
        let insight = update.valid_insight(now);

        let urgency = match insight {
            Some(i) => f64::from(i.urgency_level.rank()) / 3.0,
            None => match update.record.priority {
                Priority::Low => 0.0,
                Priority::Normal => 1.0 / 3.0,
                Priority::High => 2.0 / 3.0,
            },
        };
        let confidence = insight.map_or(NEUTRAL_CONFIDENCE, |i| i.confidence_score);

        let parts = [
            (c.sector_weight, sector_overlap(&update.record.sectors, profile)),
            (c.urgency_weight, urgency),
            (c.confidence_weight, confidence),
            (c.recency_weight, self.recency(update, now)),
        ];
        let total: f64 = parts.iter().map(|(w, _)| w.max(0.0)).sum();
        if total <= 0.0 {
            return 0.0;
        }
        let weighted: f64 = parts.iter().map(|(w, v)| w.max(0.0) * v).sum();
        (weighted / total).clamp(0.0, 1.0)
    }

    /// Decays from 1 toward `recency_floor` with the configured half-life.
    fn recency(&self, update: &StoredUpdate, now: DateTime<Utc>) -> f64 {
        let c = &self.config;
        let floor = c.recency_floor.clamp(0.0, 1.0);
        let seen = update.record.published_date.unwrap_or(update.first_seen_at);
        let age_days = ((now - seen).num_seconds() as f64 / 86_400.0).max(0.0);
        if c.recency_half_life_days <= 0.0 {
            return floor;
        }
        let decay = 0.5_f64.powf(age_days / c.recency_half_life_days);
        floor + (1.0 - floor) * decay
    }

    /// Feedback for the record's authority, its themes and the profile persona,
    /// squashed into `(-cap, cap)` where `cap` is `feedback_cap` bounded by
    /// `MAX_FEEDBACK_SHARE`.
    pub fn feedback_delta(
        &self,
        update: &StoredUpdate,
        profile: &FirmProfile,
        adjustments: &[FeedbackAdjustment],
    ) -> f64 {
        let c = &self.config;
        let raw: f64 = adjustments
            .iter()
            .filter(|a| a.profile_id == profile.id)
            .filter(|a| match a.entity_type {
                EntityType::Authority => a.entity_id.eq_ignore_ascii_case(&update.record.authority),
                EntityType::Theme => update.record.sectors.iter().any(|s| *s == a.entity_id),
                EntityType::Persona => profile.persona.as_deref() == Some(a.entity_id.as_str()),
                EntityType::WorkflowTemplate => false,
            })
            .map(|a| a.weight_delta)
            .sum();
        if raw == 0.0 || c.feedback_scale <= 0.0 {
            return 0.0;
        }
        let cap = c.feedback_cap.abs().min(MAX_FEEDBACK_SHARE);
        cap * (raw / c.feedback_scale).tanh()
    }
}

/// Share of the record's sectors the profile cares about.
fn sector_overlap(sectors: &[String], profile: &FirmProfile) -> f64 {
    if sectors.is_empty() {
        return UNTAGGED_SECTOR_MATCH;
    }
    let matched = sectors
        .iter()
        .filter(|s| profile.primary_sectors.contains(*s))
        .count();
    if matched > 0 {
        let denom = sectors.len().min(profile.primary_sectors.len().max(1));
        return (matched as f64 / denom as f64).min(1.0);
    }
    if sectors.iter().any(|s| s == "general") {
        GENERAL_SECTOR_MATCH
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use regwatch_shared::{
        AiInsight, BusinessImpact, FirmSize, InsightType, NormalizedRecord, RecordId, UrgencyLevel,
    };

    fn update(sectors: &[&str], insight: Option<AiInsight>, age_days: i64, now: DateTime<Utc>) -> StoredUpdate {
        StoredUpdate {
            id: RecordId::new(),
            record: NormalizedRecord {
                identity: "https://fca.org.uk/a".into(),
                headline: "A".into(),
                url: "https://fca.org.uk/a".into(),
                authority: "FCA".into(),
                published_date: Some(now - Duration::days(age_days)),
                summary: None,
                country: None,
                sectors: sectors.iter().map(|s| s.to_string()).collect(),
                priority: Priority::Normal,
                deadline: None,
            },
            fingerprint: "fp".into(),
            first_seen_at: now,
            last_updated_at: now,
            enrichment: insight,
            relevance_cache: Default::default(),
        }
    }

    fn insight(level: UrgencyLevel) -> AiInsight {
        AiInsight {
            insight_type: InsightType::Impact,
            confidence_score: 0.6,
            relevance_score: 0.5,
            urgency_level: level,
            business_impact: BusinessImpact::default(),
            valid_until: None,
            summary: None,
        }
    }

    fn profile() -> FirmProfile {
        FirmProfile::new("acme", ["banking", "payments"], FirmSize::Medium).with_persona("compliance")
    }

    fn adj(entity_type: EntityType, id: &str, delta: f64) -> FeedbackAdjustment {
        FeedbackAdjustment {
            profile_id: "acme".into(),
            entity_type,
            entity_id: id.into(),
            weight_delta: delta,
            occurrences: 1,
            last_event_at: Utc::now(),
        }
    }

    #[test]
    fn urgency_is_strictly_monotonic() {
        let now = Utc::now();
        let scorer = RelevanceScorer::default();
        let scores: Vec<f64> = UrgencyLevel::ALL
            .iter()
            .map(|level| scorer.score(&update(&["banking"], Some(insight(*level)), 3, now), &profile(), &[], now))
            .collect();
        for pair in scores.windows(2) {
            assert!(pair[1] > pair[0], "{scores:?}");
        }
    }

    #[test]
    fn urgency_stays_monotonic_under_strong_feedback() {
        let now = Utc::now();
        let scorer = RelevanceScorer::default();
        // Three pins on the authority.
        let boost = [adj(EntityType::Authority, "FCA", 9.0)];
        let scores: Vec<f64> = UrgencyLevel::ALL
            .iter()
            .map(|level| {
                let u = update(&["banking"], Some(insight(*level)), 3, now);
                scorer.score(&u, &profile(), &boost, now)
            })
            .collect();
        for pair in scores.windows(2) {
            assert!(pair[1] > pair[0], "{scores:?}");
        }
        assert!(scores.iter().all(|s| (0.0..=1.0).contains(s)), "{scores:?}");

        // Even with the cap configured past the headroom.
        let greedy = RelevanceScorer::new(ScoringConfig {
            feedback_cap: 5.0,
            ..Default::default()
        });
        let flood = [adj(EntityType::Authority, "FCA", 1e6)];
        let bury = [adj(EntityType::Authority, "FCA", -1e6)];
        for adjustments in [&flood, &bury] {
            let scores: Vec<f64> = UrgencyLevel::ALL
                .iter()
                .map(|level| {
                    let u = update(&["banking"], Some(insight(*level)), 3, now);
                    greedy.score(&u, &profile(), adjustments, now)
                })
                .collect();
            for pair in scores.windows(2) {
                assert!(pair[1] > pair[0], "{scores:?}");
            }
            assert!(scores.iter().all(|s| (0.0..=1.0).contains(s)), "{scores:?}");
        }
    }

    #[test]
    fn deterministic_and_bounded() {
        let now = Utc::now();
        let scorer = RelevanceScorer::default();
        let u = update(&["banking", "payments"], Some(insight(UrgencyLevel::Critical)), 0, now);
        let boost = [adj(EntityType::Authority, "FCA", 1_000.0)];
        let a = scorer.score(&u, &profile(), &boost, now);
        let b = scorer.score(&u, &profile(), &boost, now);
        assert_eq!(a, b);
        assert!((0.0..=1.0).contains(&a));

        let bury = [adj(EntityType::Authority, "FCA", -1_000.0)];
        let low = scorer.score(&update(&["crypto"], None, 400, now), &profile(), &bury, now);
        assert!((0.0..=1.0).contains(&low));
    }

    #[test]
    fn sector_overlap_matters() {
        let now = Utc::now();
        let scorer = RelevanceScorer::default();
        let hit = scorer.score(&update(&["banking"], None, 1, now), &profile(), &[], now);
        let general = scorer.score(&update(&["general"], None, 1, now), &profile(), &[], now);
        let miss = scorer.score(&update(&["insurance"], None, 1, now), &profile(), &[], now);
        assert!(hit > general && general > miss);
    }

    #[test]
    fn recency_decays_toward_floor() {
        let now = Utc::now();
        let scorer = RelevanceScorer::default();
        let fresh = scorer.recency(&update(&[], None, 0, now), now);
        let half = scorer.recency(&update(&[], None, 14, now), now);
        let ancient = scorer.recency(&update(&[], None, 3_650, now), now);
        assert!((fresh - 1.0).abs() < 1e-9);
        assert!((half - 0.6).abs() < 1e-6);
        assert!(ancient > 0.2 - 1e-9 && ancient < 0.2 + 1e-6);
    }

    #[test]
    fn feedback_delta_is_capped_and_scoped() {
        let now = Utc::now();
        let scorer = RelevanceScorer::default();
        let u = update(&["payments"], None, 1, now);
        let cap = scorer.config().feedback_cap;

        let huge = [adj(EntityType::Authority, "fca", 1e6)];
        let d = scorer.feedback_delta(&u, &profile(), &huge);
        assert!(d > 0.0 && d <= cap);

        let theme = [adj(EntityType::Theme, "payments", -3.0)];
        assert!(scorer.feedback_delta(&u, &profile(), &theme) < 0.0);

        let persona = [adj(EntityType::Persona, "compliance", 2.0)];
        assert!(scorer.feedback_delta(&u, &profile(), &persona) > 0.0);

        let unrelated = [
            adj(EntityType::Authority, "SEC", 5.0),
            adj(EntityType::WorkflowTemplate, "gap-analysis", 5.0),
        ];
        assert_eq!(scorer.feedback_delta(&u, &profile(), &unrelated), 0.0);

        let mut other_profile = adj(EntityType::Authority, "FCA", 5.0);
        other_profile.profile_id = "globex".into();
        assert_eq!(scorer.feedback_delta(&u, &profile(), &[other_profile]), 0.0);
    }

    #[test]
    fn expired_insight_is_ignored() {
        let now = Utc::now();
        let scorer = RelevanceScorer::default();
        let mut stale = insight(UrgencyLevel::Critical);
        stale.valid_until = Some(now - Duration::hours(1));
        let with_stale = scorer.score(&update(&["banking"], Some(stale), 1, now), &profile(), &[], now);
        let without = scorer.score(&update(&["banking"], None, 1, now), &profile(), &[], now);
        assert_eq!(with_stale, without);
    }
}
