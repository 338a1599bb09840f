//! Feedback aggregation: interaction events into additive weight adjustments.
//!
//! Runs on a forward-moving watermark over the interaction log's sequence
//! numbers, so late or equal-timestamp events are still picked up. Replaying
//! a batch counts it again; the watermark is what keeps normal operation from
//! double counting.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, instrument};

use regwatch_shared::{
    EntityType, FeedbackAdjustment, FeedbackWeights, InteractionEvent, InteractionKind, Result,
    canonical_sector,
};
use regwatch_storage::RecordStore;

/// Watermark name for the aggregator's position in the interaction log.
pub const FEEDBACK_WATERMARK: &str = "feedback";

/// One `(entity, delta)` contribution derived from an event.
#[derive(Debug, Clone, PartialEq)]
pub struct Contribution {
    pub entity_type: EntityType,
    pub entity_id: String,
    pub weight_delta: f64,
}

/// Outcome of one aggregation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregationReport {
    pub events: usize,
    pub adjustments: usize,
    pub profiles: Vec<String>,
    pub invalidated_scores: u64,
    /// Last interaction sequence number covered.
    pub watermark: Option<u64>,
}

pub struct FeedbackAggregator {
    store: Arc<dyn RecordStore>,
    weights: FeedbackWeights,
}

impl FeedbackAggregator {
    pub fn new(store: Arc<dyn RecordStore>, weights: FeedbackWeights) -> Self {
        Self { store, weights }
    }

    pub fn weight_for(&self, kind: InteractionKind) -> f64 {
        let w = &self.weights;
        match kind {
            InteractionKind::Pin => w.pin,
            InteractionKind::Dismiss => w.dismiss,
            InteractionKind::WorkflowStart => w.workflow_start,
            InteractionKind::WorkflowComplete => w.workflow_complete,
            InteractionKind::PersonaSwitch => w.persona_switch,
        }
    }

    /// Every entity the event references gets the event's full weight.
    pub fn contributions(&self, event: &InteractionEvent) -> Vec<Contribution> {
        let weight = self.weight_for(event.kind);
        if weight == 0.0 {
            return Vec::new();
        }
        let mut out = Vec::new();
        let mut push = |entity_type, entity_id: String| {
            out.push(Contribution {
                entity_type,
                entity_id,
                weight_delta: weight,
            });
        };

        if let Some(authority) = event.authority.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
            push(EntityType::Authority, authority.to_ascii_uppercase());
        }
        let themes: BTreeSet<String> = event.themes.iter().filter_map(|t| canonical_sector(t)).collect();
        for theme in themes {
            push(EntityType::Theme, theme);
        }
        if let Some(persona) = event.persona.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            push(EntityType::Persona, persona.to_string());
        }
        if let Some(template) = event
            .workflow_template
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
        {
            push(EntityType::WorkflowTemplate, template.to_string());
        }
        out
    }

    /// Group by profile, then entity key, summing deltas and occurrences.
    pub fn aggregate(&self, events: &[InteractionEvent]) -> Vec<FeedbackAdjustment> {
        let mut grouped: BTreeMap<(String, EntityType, String), FeedbackAdjustment> = BTreeMap::new();
        for event in events {
            for c in self.contributions(event) {
                let next = FeedbackAdjustment {
                    profile_id: event.profile_id.clone(),
                    entity_type: c.entity_type,
                    entity_id: c.entity_id,
                    weight_delta: c.weight_delta,
                    occurrences: 1,
                    last_event_at: event.occurred_at,
                };
                let key = (next.profile_id.clone(), next.entity_type, next.entity_id.clone());
                grouped
                    .entry(key)
                    .and_modify(|existing| existing.absorb(&next))
                    .or_insert(next);
            }
        }
        grouped.into_values().collect()
    }

    /// Store an event for the next aggregation pass.
    pub async fn record(&self, event: &InteractionEvent) -> Result<u64> {
        self.store.record_interaction(event).await
    }

    /// Aggregate everything after the persisted watermark, flush, invalidate
    /// the touched profiles' cached scores, then advance the watermark.
    #[instrument(skip_all)]
    pub async fn run(&self) -> Result<AggregationReport> {
        let since = self.store.get_watermark(FEEDBACK_WATERMARK).await?;
        let logged = self.store.interactions_after(since).await?;
        let Some(last_seq) = logged.iter().map(|(seq, _)| *seq).max() else {
            debug!(?since, "no new interactions");
            return Ok(AggregationReport {
                watermark: since,
                ..Default::default()
            });
        };
        let events: Vec<InteractionEvent> = logged.into_iter().map(|(_, event)| event).collect();

        let adjustments = self.aggregate(&events);
        self.store.apply_feedback(&adjustments).await?;

        let profiles: BTreeSet<String> = adjustments.iter().map(|a| a.profile_id.clone()).collect();
        let mut invalidated = 0;
        for profile in &profiles {
            invalidated += self.store.invalidate_profile_scores(profile).await?;
        }

        self.store.set_watermark(FEEDBACK_WATERMARK, last_seq).await?;

        info!(
            events = events.len(),
            adjustments = adjustments.len(),
            profiles = profiles.len(),
            invalidated,
            "feedback aggregated"
        );
        Ok(AggregationReport {
            events: events.len(),
            adjustments: adjustments.len(),
            profiles: profiles.into_iter().collect(),
            invalidated_scores: invalidated,
            watermark: Some(last_seq),
        })
    }
}
