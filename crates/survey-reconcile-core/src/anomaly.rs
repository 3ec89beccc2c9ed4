use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::config::AnomalyConfig;
use crate::{
    ordered_timeline, BundleKey, ProjectId, ProposalId, ReconcileError, RespondentId, Response,
    ResponseId,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    Gap,
    Duplicate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlaggedResponse {
    pub response_id: ResponseId,
    /// Position in the respondent's timeline.
    pub index: usize,
    pub kind: AnomalyKind,
    /// Gap between this response and its predecessor.
    pub delta_secs: f64,
    pub orphan: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnomalyScan {
    pub respondent_id: RespondentId,
    pub deltas_secs: Vec<f64>,
    pub median_delta_secs: Option<f64>,
    pub flagged: Vec<FlaggedResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManualReview {
    pub flagged: FlaggedResponse,
    pub reason: String,
}

/// Where a proposal applies and what the bundle looked like when it was computed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepairContext {
    pub project_id: ProjectId,
    pub respondent_id: RespondentId,
    pub bundle_key: Option<BundleKey>,
    /// Unanswered bundle questions; `None` when the respondent has no template.
    pub open_slots: Option<usize>,
}

/// Read-only outcome of the propose phase. Nothing is deleted until it is committed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnomalyProposal {
    pub proposal_id: ProposalId,
    pub project_id: ProjectId,
    pub respondent_id: RespondentId,
    pub bundle_key: Option<BundleKey>,
    #[serde(with = "time::serde::rfc3339")]
    pub proposed_at: OffsetDateTime,
    pub orphan_count: usize,
    pub open_slots: Option<usize>,
    pub median_delta_secs: Option<f64>,
    pub removals: Vec<FlaggedResponse>,
    pub manual_review: Vec<ManualReview>,
}

impl AnomalyProposal {
    #[must_use]
    pub fn is_actionable(&self) -> bool {
        !self.removals.is_empty()
    }

    /// Re-check the auto-removal conditions against the current state of the timeline.
    ///
    /// # Errors
    /// Returns [`ReconcileError::PreconditionRevalidationFailed`] when any proposed
    /// response disappeared, was linked, became first in the sequence, or when the
    /// removal would no longer leave exactly one orphan per open bundle slot.
    pub fn revalidate(
        &self,
        current_timeline: &[Response],
        current_open_slots: Option<usize>,
    ) -> Result<(), ReconcileError> {
        if self.removals.is_empty() {
            return Err(ReconcileError::PreconditionRevalidationFailed(
                "proposal contains no removals".to_string(),
            ));
        }

        let ordered = ordered_timeline(current_timeline);
        for removal in &self.removals {
            let Some(index) =
                ordered.iter().position(|response| response.response_id == removal.response_id)
            else {
                return Err(ReconcileError::PreconditionRevalidationFailed(format!(
                    "response {} no longer exists",
                    removal.response_id
                )));
            };
            if index == 0 {
                return Err(ReconcileError::PreconditionRevalidationFailed(format!(
                    "response {} is now first in the sequence",
                    removal.response_id
                )));
            }
            if let Some(question_id) = ordered[index].question_id {
                return Err(ReconcileError::PreconditionRevalidationFailed(format!(
                    "response {} has since been linked to question {question_id}",
                    removal.response_id
                )));
            }
        }

        let Some(open_slots) = current_open_slots else {
            return Err(ReconcileError::PreconditionRevalidationFailed(
                "respondent no longer resolves to a bundle".to_string(),
            ));
        };

        let orphans = ordered.iter().filter(|response| response.is_orphan()).count();
        let orphans_after = orphans.saturating_sub(self.removals.len());
        if orphans_after != open_slots {
            return Err(ReconcileError::PreconditionRevalidationFailed(format!(
                "removal would leave {orphans_after} orphans against {open_slots} open slots"
            )));
        }

        Ok(())
    }
}

fn delta_secs(earlier: &Response, later: &Response) -> f64 {
    (later.collected_at - earlier.collected_at).as_seconds_f64()
}

fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Flag gap and duplicate anomalies in one respondent's timeline.
///
/// A response is a gap anomaly when the delta from its predecessor exceeds the
/// median delta by more than `gap_threshold_secs`, and a duplicate when it repeats
/// its predecessor's value within `duplicate_window_secs`. The first response has
/// no predecessor and is never flagged.
#[must_use]
pub fn scan_timeline(
    respondent_id: RespondentId,
    timeline: &[Response],
    config: &AnomalyConfig,
) -> AnomalyScan {
    let ordered = ordered_timeline(timeline);
    let deltas_secs =
        ordered.windows(2).map(|pair| delta_secs(pair[0], pair[1])).collect::<Vec<_>>();
    let median_delta_secs = median(&deltas_secs);

    let mut flagged = Vec::new();
    if let Some(median_delta) = median_delta_secs {
        for (offset, delta) in deltas_secs.iter().copied().enumerate() {
            let index = offset + 1;
            let (previous, current) = (ordered[offset], ordered[index]);
            let kind = if current.value == previous.value && delta <= config.duplicate_window_secs
            {
                Some(AnomalyKind::Duplicate)
            } else if delta - median_delta > config.gap_threshold_secs {
                Some(AnomalyKind::Gap)
            } else {
                None
            };

            if let Some(kind) = kind {
                flagged.push(FlaggedResponse {
                    response_id: current.response_id,
                    index,
                    kind,
                    delta_secs: delta,
                    orphan: current.is_orphan(),
                });
            }
        }
    }

    AnomalyScan { respondent_id, deltas_secs, median_delta_secs, flagged }
}

/// Propose repairs for one respondent without mutating anything.
///
/// A flagged response is proposed for removal only when it is not first, is still an
/// orphan, and removing it leaves exactly one orphan per open bundle slot. When more
/// than one flagged response qualifies, none is chosen and all go to manual review.
#[must_use]
pub fn propose_repairs(
    context: RepairContext,
    timeline: &[Response],
    config: &AnomalyConfig,
    proposed_at: OffsetDateTime,
) -> AnomalyProposal {
    let scan = scan_timeline(context.respondent_id, timeline, config);
    let orphan_count = timeline.iter().filter(|response| response.is_orphan()).count();

    let mut eligible = Vec::new();
    let mut manual_review = Vec::new();
    for flagged in scan.flagged {
        match removal_blocker(&flagged, orphan_count, context.open_slots) {
            Some(reason) => manual_review.push(ManualReview { flagged, reason }),
            None => eligible.push(flagged),
        }
    }

    let removals = if eligible.len() > 1 {
        let count = eligible.len();
        manual_review.extend(eligible.into_iter().map(|flagged| ManualReview {
            flagged,
            reason: format!("ambiguous: {count} flagged responses each satisfy the count match"),
        }));
        manual_review.sort_by_key(|review| review.flagged.index);
        Vec::new()
    } else {
        eligible
    };

    AnomalyProposal {
        proposal_id: ProposalId::new(),
        project_id: context.project_id,
        respondent_id: context.respondent_id,
        bundle_key: context.bundle_key,
        proposed_at,
        orphan_count,
        open_slots: context.open_slots,
        median_delta_secs: scan.median_delta_secs,
        removals,
        manual_review,
    }
}

fn removal_blocker(
    flagged: &FlaggedResponse,
    orphan_count: usize,
    open_slots: Option<usize>,
) -> Option<String> {
    if flagged.index == 0 {
        return Some("first response in sequence; start latency is not an anomaly".to_string());
    }
    if !flagged.orphan {
        return Some("response is linked; removal would not change the orphan count".to_string());
    }
    let Some(open_slots) = open_slots else {
        return Some("respondent has no resolved bundle".to_string());
    };
    let orphans_after = orphan_count.saturating_sub(1);
    if orphans_after != open_slots {
        return Some(format!(
            "removal leaves {orphans_after} orphans against {open_slots} open slots"
        ));
    }
    None
}
