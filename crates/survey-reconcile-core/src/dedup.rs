use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{ProjectId, ProposalId, Question, QuestionId, ReconcileError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DuplicateQuestion {
    pub question_id: QuestionId,
    pub canonical_question_id: QuestionId,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DedupPlan {
    pub proposal_id: ProposalId,
    pub project_id: ProjectId,
    #[serde(with = "time::serde::rfc3339")]
    pub proposed_at: OffsetDateTime,
    pub scanned: usize,
    pub canonical_kept: usize,
    pub duplicates: Vec<DuplicateQuestion>,
}

impl DedupPlan {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.duplicates.is_empty()
    }

    /// Confirm each planned duplicate still has the same canonical copy.
    ///
    /// # Errors
    /// Returns [`ReconcileError::PreconditionRevalidationFailed`] when a planned
    /// duplicate or its canonical question is gone, or an earlier question with the
    /// same text has appeared since the plan was made.
    pub fn revalidate(&self, current_questions: &[Question]) -> Result<(), ReconcileError> {
        let current = plan_dedup(self.project_id, current_questions, self.proposed_at);
        let canonical_by_duplicate = current
            .duplicates
            .iter()
            .map(|duplicate| (duplicate.question_id, duplicate.canonical_question_id))
            .collect::<BTreeMap<_, _>>();

        for planned in &self.duplicates {
            match canonical_by_duplicate.get(&planned.question_id) {
                Some(canonical) if *canonical == planned.canonical_question_id => {}
                Some(canonical) => {
                    return Err(ReconcileError::PreconditionRevalidationFailed(format!(
                        "question {} now duplicates {canonical} instead of {}",
                        planned.question_id, planned.canonical_question_id
                    )));
                }
                None => {
                    return Err(ReconcileError::PreconditionRevalidationFailed(format!(
                        "question {} is no longer a duplicate of {}",
                        planned.question_id, planned.canonical_question_id
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Operator-facing result of a dedup run.
///
/// A run never deletes anything. Outside dry-run mode the plan is recorded as a
/// pending proposal and `proposal_id` names it for the commit step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DedupSummary {
    pub project_id: ProjectId,
    pub dry_run: bool,
    pub scanned: usize,
    pub canonical_kept: usize,
    pub would_remove: usize,
    pub proposal_id: Option<ProposalId>,
    pub duplicates: Vec<DuplicateQuestion>,
}

impl DedupSummary {
    #[must_use]
    pub fn from_plan(plan: &DedupPlan, dry_run: bool, proposal_id: Option<ProposalId>) -> Self {
        Self {
            project_id: plan.project_id,
            dry_run,
            scanned: plan.scanned,
            canonical_kept: plan.canonical_kept,
            would_remove: plan.duplicates.len(),
            proposal_id,
            duplicates: plan.duplicates.clone(),
        }
    }
}

/// Find questions whose exact text repeats an earlier-created question.
///
/// Questions from other projects are ignored. Order is creation time ascending with
/// the identifier as tie-breaker, so the canonical choice does not depend on input
/// order.
#[must_use]
pub fn plan_dedup(
    project_id: ProjectId,
    questions: &[Question],
    proposed_at: OffsetDateTime,
) -> DedupPlan {
    let mut ordered =
        questions.iter().filter(|question| question.project_id == project_id).collect::<Vec<_>>();
    ordered.sort_by(|lhs, rhs| lhs.catalog_cmp(rhs));

    let mut canonical: BTreeMap<&str, QuestionId> = BTreeMap::new();
    let mut duplicates = Vec::new();
    for question in &ordered {
        match canonical.get(question.text.as_str()) {
            Some(canonical_question_id) => duplicates.push(DuplicateQuestion {
                question_id: question.question_id,
                canonical_question_id: *canonical_question_id,
                text: question.text.clone(),
                created_at: question.created_at,
            }),
            None => {
                canonical.insert(question.text.as_str(), question.question_id);
            }
        }
    }

    DedupPlan {
        proposal_id: ProposalId::new(),
        project_id,
        proposed_at,
        scanned: ordered.len(),
        canonical_kept: canonical.len(),
        duplicates,
    }
}
