//! Multi-signal attribution of historical respondents to collectors.
//!
//! Signals are independent capabilities behind [`SimilaritySignal`]. Each yields a
//! normalized score or no signal at all; [`WeightedAggregator`] combines whatever is
//! present using configured weights. Nothing here writes an attribution.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

use crate::config::{
    AttributionConfig, SIGNAL_DEVICE, SIGNAL_RESPONSE_PATTERN, SIGNAL_TEMPORAL,
};
use crate::{
    count_f64, ordered_timeline, BundleKey, CollectorId, ReconcileError, Respondent, RespondentId,
    Response,
};

/// Hour-of-day and day-of-week collection counts, bucketed in UTC.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemporalHistogram {
    pub hours: [u32; 24],
    pub weekdays: [u32; 7],
}

impl TemporalHistogram {
    pub fn record(&mut self, at: OffsetDateTime) {
        let at = at.to_offset(UtcOffset::UTC);
        let hour = usize::from(at.hour());
        let weekday = usize::from(at.weekday().number_days_from_monday());
        self.hours[hour] = self.hours[hour].saturating_add(1);
        self.weekdays[weekday] = self.weekdays[weekday].saturating_add(1);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hours.iter().all(|count| *count == 0)
    }
}

fn histogram_intersection(lhs: &[u32], rhs: &[u32]) -> Option<f64> {
    let lhs_total = lhs.iter().map(|count| f64::from(*count)).sum::<f64>();
    let rhs_total = rhs.iter().map(|count| f64::from(*count)).sum::<f64>();
    if lhs_total == 0.0 || rhs_total == 0.0 {
        return None;
    }
    Some(
        lhs.iter()
            .zip(rhs)
            .map(|(l, r)| (f64::from(*l) / lhs_total).min(f64::from(*r) / rhs_total))
            .sum(),
    )
}

/// Observed behaviour of one respondent or one collector.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActivityProfile {
    pub devices: BTreeSet<String>,
    pub temporal: TemporalHistogram,
    /// Answer-value sequences in timeline order, grouped by bundle.
    pub sequences: BTreeMap<BundleKey, Vec<Vec<String>>>,
}

impl ActivityProfile {
    /// Fold one respondent's responses into the profile.
    pub fn absorb(&mut self, bundle_key: Option<&BundleKey>, responses: &[Response]) {
        let ordered = ordered_timeline(responses);
        for response in &ordered {
            if let Some(device) = &response.device {
                self.devices.extend(device.attribute_set());
            }
            self.temporal.record(response.collected_at);
        }
        if let Some(key) = bundle_key {
            let values = ordered.iter().map(|response| response.value.clone()).collect::<Vec<_>>();
            if !values.is_empty() {
                self.sequences.entry(key.clone()).or_default().push(values);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RespondentProfile {
    pub respondent_id: RespondentId,
    pub activity: ActivityProfile,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectorProfile {
    pub collector_id: CollectorId,
    pub tracked_respondents: usize,
    pub activity: ActivityProfile,
}

/// Historical respondents and the collector profiles they are compared against.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfilePool {
    pub historical: Vec<RespondentProfile>,
    pub collectors: Vec<CollectorProfile>,
}

impl ProfilePool {
    #[must_use]
    pub fn historical(&self, respondent_id: RespondentId) -> Option<&RespondentProfile> {
        self.historical.iter().find(|profile| profile.respondent_id == respondent_id)
    }
}

/// Split a project's respondents into historical profiles and per-collector profiles.
///
/// A respondent is historical when it has at least one response, none of its
/// responses carry a collector reference, and no collector has been accepted for it.
/// A response's collector is its own reference, falling back to the respondent's
/// accepted collector; it contributes to that collector's profile.
#[must_use]
pub fn build_profiles(respondents: &[Respondent], responses: &[Response]) -> ProfilePool {
    let mut by_respondent: BTreeMap<RespondentId, Vec<Response>> = BTreeMap::new();
    for response in responses {
        by_respondent.entry(response.respondent_id).or_default().push(response.clone());
    }

    let mut historical = Vec::new();
    let mut collectors: BTreeMap<CollectorId, CollectorProfile> = BTreeMap::new();
    for respondent in respondents {
        let Some(timeline) = by_respondent.get(&respondent.respondent_id) else {
            continue;
        };
        let bundle_key = respondent.bundle_key();

        let collector_of =
            |response: &Response| response.collector_id.or(respondent.collector_id);
        if timeline.iter().all(|response| collector_of(response).is_none()) {
            let mut activity = ActivityProfile::default();
            activity.absorb(bundle_key.as_ref(), timeline);
            historical.push(RespondentProfile { respondent_id: respondent.respondent_id, activity });
            continue;
        }

        let mut per_collector: BTreeMap<CollectorId, Vec<Response>> = BTreeMap::new();
        for response in timeline {
            if let Some(collector_id) = collector_of(response) {
                per_collector.entry(collector_id).or_default().push(response.clone());
            }
        }
        for (collector_id, tracked) in per_collector {
            let profile = collectors.entry(collector_id).or_insert_with(|| CollectorProfile {
                collector_id,
                tracked_respondents: 0,
                activity: ActivityProfile::default(),
            });
            profile.tracked_respondents += 1;
            profile.activity.absorb(bundle_key.as_ref(), &tracked);
        }
    }

    historical.sort_by_key(|profile| profile.respondent_id);
    ProfilePool { historical, collectors: collectors.into_values().collect() }
}

/// A single similarity measure between a respondent and a collector.
pub trait SimilaritySignal: Send + Sync {
    fn name(&self) -> &'static str;

    /// Score in `[0, 1]`, or `None` when either side lacks the inputs this signal needs.
    fn score(&self, respondent: &ActivityProfile, collector: &ActivityProfile) -> Option<f64>;
}

/// Jaccard overlap of `key=value` device attributes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceOverlapSignal;

impl SimilaritySignal for DeviceOverlapSignal {
    fn name(&self) -> &'static str {
        SIGNAL_DEVICE
    }

    fn score(&self, respondent: &ActivityProfile, collector: &ActivityProfile) -> Option<f64> {
        if respondent.devices.is_empty() || collector.devices.is_empty() {
            return None;
        }
        let shared = respondent.devices.intersection(&collector.devices).count();
        let union = respondent.devices.union(&collector.devices).count();
        Some(count_f64(shared) / count_f64(union))
    }
}

/// Mean of hour-of-day and day-of-week histogram intersections.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemporalPatternSignal;

impl SimilaritySignal for TemporalPatternSignal {
    fn name(&self) -> &'static str {
        SIGNAL_TEMPORAL
    }

    fn score(&self, respondent: &ActivityProfile, collector: &ActivityProfile) -> Option<f64> {
        if respondent.temporal.is_empty() || collector.temporal.is_empty() {
            return None;
        }
        let hours = histogram_intersection(&respondent.temporal.hours, &collector.temporal.hours)?;
        let weekdays =
            histogram_intersection(&respondent.temporal.weekdays, &collector.temporal.weekdays)?;
        Some((hours + weekdays) / 2.0)
    }
}

/// Ordered answer-sequence similarity within shared bundles.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResponsePatternSignal;

impl SimilaritySignal for ResponsePatternSignal {
    fn name(&self) -> &'static str {
        SIGNAL_RESPONSE_PATTERN
    }

    fn score(&self, respondent: &ActivityProfile, collector: &ActivityProfile) -> Option<f64> {
        let per_bundle = respondent
            .sequences
            .iter()
            .filter_map(|(key, own)| {
                let theirs = collector.sequences.get(key)?;
                own.iter()
                    .flat_map(|lhs| theirs.iter().map(move |rhs| sequence_similarity(lhs, rhs)))
                    .max_by(f64::total_cmp)
            })
            .collect::<Vec<_>>();
        if per_bundle.is_empty() {
            return None;
        }
        Some(per_bundle.iter().sum::<f64>() / count_f64(per_bundle.len()))
    }
}

/// `LCS(a, b) / max(|a|, |b|)`; two empty sequences score 0.
fn sequence_similarity(lhs: &[String], rhs: &[String]) -> f64 {
    let longest = lhs.len().max(rhs.len());
    if longest == 0 {
        return 0.0;
    }
    count_f64(longest_common_subsequence(lhs, rhs)) / count_f64(longest)
}

fn longest_common_subsequence(lhs: &[String], rhs: &[String]) -> usize {
    let mut previous = vec![0_usize; rhs.len() + 1];
    let mut current = vec![0_usize; rhs.len() + 1];
    for left in lhs {
        for (column, right) in rhs.iter().enumerate() {
            current[column + 1] = if left == right {
                previous[column] + 1
            } else {
                previous[column + 1].max(current[column])
            };
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[rhs.len()]
}

#[must_use]
pub fn default_signals() -> Vec<Box<dyn SimilaritySignal>> {
    vec![
        Box::new(DeviceOverlapSignal),
        Box::new(TemporalPatternSignal),
        Box::new(ResponsePatternSignal),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalScore {
    pub signal: String,
    pub weight: f64,
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateScore {
    pub collector_id: CollectorId,
    pub score: f64,
    pub signals: Vec<SignalScore>,
}

/// Combines signal scores with configured weights, renormalized over present signals.
pub struct WeightedAggregator {
    entries: Vec<(Box<dyn SimilaritySignal>, f64)>,
}

impl std::fmt::Debug for WeightedAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(signal, weight)| (signal.name(), weight)))
            .finish()
    }
}

impl WeightedAggregator {
    /// Pair each signal with its configured weight. Signals without a weight are ignored.
    ///
    /// # Errors
    /// Returns [`ReconcileError::Validation`] for negative or non-finite weights, weights
    /// naming an unknown signal, or when no signal ends up with a positive weight.
    pub fn new(
        signals: Vec<Box<dyn SimilaritySignal>>,
        weights: &BTreeMap<String, f64>,
    ) -> Result<Self, ReconcileError> {
        for (name, weight) in weights {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(ReconcileError::Validation(format!(
                    "weight for signal {name} MUST be a finite number >= 0"
                )));
            }
            if !signals.iter().any(|signal| signal.name() == name) {
                return Err(ReconcileError::Validation(format!("unknown signal {name}")));
            }
        }

        let entries = signals
            .into_iter()
            .filter_map(|signal| {
                let weight = weights.get(signal.name()).copied()?;
                Some((signal, weight))
            })
            .collect::<Vec<_>>();
        if !entries.iter().any(|(_, weight)| *weight > 0.0) {
            return Err(ReconcileError::Validation(
                "at least one signal MUST have a positive weight".to_string(),
            ));
        }
        Ok(Self { entries })
    }

    /// Aggregator over [`default_signals`] with the configured weights.
    ///
    /// # Errors
    /// Same as [`WeightedAggregator::new`].
    pub fn from_config(config: &AttributionConfig) -> Result<Self, ReconcileError> {
        Self::new(default_signals(), &config.weights)
    }

    #[must_use]
    pub fn score(&self, respondent: &ActivityProfile, collector: &CollectorProfile) -> CandidateScore {
        let signals = self
            .entries
            .iter()
            .map(|(signal, weight)| SignalScore {
                signal: signal.name().to_string(),
                weight: *weight,
                score: signal.score(respondent, &collector.activity).map(|s| s.clamp(0.0, 1.0)),
            })
            .collect::<Vec<_>>();

        let (weighted, total_weight) = signals
            .iter()
            .filter_map(|entry| entry.score.map(|score| (score * entry.weight, entry.weight)))
            .fold((0.0, 0.0), |(sum, total), (value, weight)| (sum + value, total + weight));
        let score =
            if total_weight > 0.0 { (weighted / total_weight).clamp(0.0, 1.0) } else { 0.0 };

        CandidateScore { collector_id: collector.collector_id, score, signals }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AttributionOutcome {
    Recommended { collector_id: CollectorId, score: f64 },
    Ambiguous { first: CollectorId, second: CollectorId, margin: f64 },
    BelowThreshold { best_score: f64, threshold: f64 },
    NoCandidates,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttributionRanking {
    pub respondent_id: RespondentId,
    pub candidates: Vec<CandidateScore>,
    pub outcome: AttributionOutcome,
}

impl AttributionRanking {
    #[must_use]
    pub fn ambiguity(&self) -> Option<ReconcileError> {
        match self.outcome {
            AttributionOutcome::Ambiguous { first, second, margin } => {
                Some(ReconcileError::AmbiguousAttribution { first, second, margin })
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn recommended(&self) -> Option<CollectorId> {
        match self.outcome {
            AttributionOutcome::Recommended { collector_id, .. } => Some(collector_id),
            _ => None,
        }
    }
}

/// Rank every collector for one historical respondent.
///
/// Candidates are ordered by score descending with collector id ascending as
/// tie-breaker. When the top two are closer than `ambiguity_margin` no candidate is
/// recommended; otherwise the top one is recommended only at or above
/// `acceptance_threshold`.
#[must_use]
pub fn rank_candidates(
    respondent: &RespondentProfile,
    collectors: &[CollectorProfile],
    aggregator: &WeightedAggregator,
    config: &AttributionConfig,
) -> AttributionRanking {
    let mut candidates = collectors
        .iter()
        .map(|collector| aggregator.score(&respondent.activity, collector))
        .collect::<Vec<_>>();
    candidates.sort_by(|lhs, rhs| {
        rhs.score.total_cmp(&lhs.score).then_with(|| lhs.collector_id.cmp(&rhs.collector_id))
    });

    let outcome = match candidates.as_slice() {
        [] => AttributionOutcome::NoCandidates,
        [first, second, ..] if first.score - second.score < config.ambiguity_margin => {
            AttributionOutcome::Ambiguous {
                first: first.collector_id,
                second: second.collector_id,
                margin: first.score - second.score,
            }
        }
        [first, ..] if first.score >= config.acceptance_threshold => {
            AttributionOutcome::Recommended { collector_id: first.collector_id, score: first.score }
        }
        [first, ..] => AttributionOutcome::BelowThreshold {
            best_score: first.score,
            threshold: config.acceptance_threshold,
        },
    };

    AttributionRanking { respondent_id: respondent.respondent_id, candidates, outcome }
}
