//! Heuristic urgency from deadline proximity, business impact, confidence and relevance.
//!
//! The stored urgency is never lower than what the service reported: the
//! heuristic can only raise it.

use chrono::{DateTime, Utc};

use regwatch_shared::{AiInsight, NormalizedRecord, UrgencyHeuristicConfig, UrgencyLevel};

/// Deadline pressure in `[0, 1]`: 1 at or past the deadline, 0 beyond the horizon.
fn deadline_pressure(deadline: Option<DateTime<Utc>>, now: DateTime<Utc>, horizon_days: f64) -> f64 {
    let Some(deadline) = deadline else {
        return 0.0;
    };
    if horizon_days <= 0.0 {
        return 0.0;
    }
    let days_left = (deadline - now).num_seconds() as f64 / 86_400.0;
    if days_left <= 0.0 {
        1.0
    } else {
        (1.0 - days_left / horizon_days).clamp(0.0, 1.0)
    }
}

/// Weighted urgency score in `[0, 1]`.
pub fn urgency_score(
    record: &NormalizedRecord,
    insight: &AiInsight,
    config: &UrgencyHeuristicConfig,
    now: DateTime<Utc>,
) -> f64 {
    let parts = [
        (
            config.deadline_weight,
            deadline_pressure(record.deadline, now, config.deadline_horizon_days),
        ),
        (config.impact_weight, insight.business_impact.overall() / 10.0),
        (config.confidence_weight, insight.confidence_score),
        (config.relevance_weight, insight.relevance_score),
    ];
    let total_weight: f64 = parts.iter().map(|(w, _)| w.max(0.0)).sum();
    if total_weight <= 0.0 {
        return 0.0;
    }
    let weighted: f64 = parts.iter().map(|(w, v)| w.max(0.0) * v).sum();
    (weighted / total_weight).clamp(0.0, 1.0)
}

pub fn level_for(score: f64, config: &UrgencyHeuristicConfig) -> UrgencyLevel {
    if score >= config.critical_threshold {
        UrgencyLevel::Critical
    } else if score >= config.high_threshold {
        UrgencyLevel::High
    } else if score >= config.medium_threshold {
        UrgencyLevel::Medium
    } else {
        UrgencyLevel::Low
    }
}

/// Raise the insight's urgency to the heuristic level when that is higher.
pub fn apply_heuristic(
    record: &NormalizedRecord,
    mut insight: AiInsight,
    config: &UrgencyHeuristicConfig,
    now: DateTime<Utc>,
) -> AiInsight {
    let heuristic = level_for(urgency_score(record, &insight, config, now), config);
    insight.urgency_level = insight.urgency_level.max(heuristic);
    insight
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use regwatch_shared::{BusinessImpact, InsightType, Priority};

    fn record(deadline: Option<DateTime<Utc>>) -> NormalizedRecord {
        NormalizedRecord {
            identity: "https://eba.europa.eu/x".into(),
            headline: "Guidelines".into(),
            url: "https://eba.europa.eu/x".into(),
            authority: "EBA".into(),
            published_date: None,
            summary: None,
            country: None,
            sectors: vec![],
            priority: Priority::Normal,
            deadline,
        }
    }

    fn insight(level: UrgencyLevel, impact: f64, confidence: f64) -> AiInsight {
        AiInsight {
            insight_type: InsightType::Impact,
            confidence_score: confidence,
            relevance_score: confidence,
            urgency_level: level,
            business_impact: BusinessImpact {
                financial: impact,
                operational: impact,
                compliance: impact,
                strategic: impact,
            },
            valid_until: None,
            summary: None,
        }
    }

    #[test]
    fn close_deadline_and_high_impact_escalate() {
        let now = Utc::now();
        let cfg = UrgencyHeuristicConfig::default();
        let r = record(Some(now + Duration::days(3)));
        let out = apply_heuristic(&r, insight(UrgencyLevel::Low, 9.0, 0.9), &cfg, now);
        assert_eq!(out.urgency_level, UrgencyLevel::Critical);
    }

    #[test]
    fn heuristic_never_lowers_service_level() {
        let now = Utc::now();
        let cfg = UrgencyHeuristicConfig::default();
        let out = apply_heuristic(&record(None), insight(UrgencyLevel::High, 0.0, 0.1), &cfg, now);
        assert_eq!(out.urgency_level, UrgencyLevel::High);
    }

    #[test]
    fn deadline_pressure_bounds() {
        let now = Utc::now();
        assert_eq!(deadline_pressure(None, now, 90.0), 0.0);
        assert_eq!(deadline_pressure(Some(now - Duration::days(1)), now, 90.0), 1.0);
        assert_eq!(deadline_pressure(Some(now + Duration::days(200)), now, 90.0), 0.0);
        let mid = deadline_pressure(Some(now + Duration::days(45)), now, 90.0);
        assert!((mid - 0.5).abs() < 1e-3);
    }

    #[test]
    fn thresholds_map_to_levels() {
        let cfg = UrgencyHeuristicConfig::default();
        assert_eq!(level_for(0.1, &cfg), UrgencyLevel::Low);
        assert_eq!(level_for(0.35, &cfg), UrgencyLevel::Medium);
        assert_eq!(level_for(0.61, &cfg), UrgencyLevel::High);
        assert_eq!(level_for(0.95, &cfg), UrgencyLevel::Critical);
    }
}
