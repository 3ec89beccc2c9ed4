use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::bundle::Bundle;
use crate::{
    ordered_timeline, BundleKey, Question, QuestionBankContext, QuestionId, ReconcileError,
    RespondentId, Response, ResponseId,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProposedLink {
    pub response_id: ResponseId,
    pub question_id: QuestionId,
    /// Zero-based position in the orphan sequence.
    pub position: usize,
    /// Set only when the response's context snapshot was empty.
    pub backfill: Option<QuestionBankContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkPlan {
    pub respondent_id: RespondentId,
    pub bundle_key: BundleKey,
    pub bundle_len: usize,
    pub already_linked: usize,
    pub open_slots: usize,
    pub links: Vec<ProposedLink>,
    /// Open questions past the last orphan, in bundle order.
    pub missing_question_ids: Vec<QuestionId>,
    pub branching_question_ids: Vec<QuestionId>,
}

impl LinkPlan {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.links.is_empty()
    }
}

/// Per-respondent link report handed to operator tooling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkSummary {
    pub respondent_id: RespondentId,
    pub bundle_key: BundleKey,
    pub bundle_len: usize,
    pub already_linked: usize,
    pub linked: usize,
    pub writes: usize,
    pub unmatched_tail: usize,
    pub count_mismatch: bool,
    pub surplus: Option<usize>,
    pub missing_question_ids: Vec<QuestionId>,
    pub branching_question_ids: Vec<QuestionId>,
}

impl LinkSummary {
    /// Summarize an applied plan; `writes` counts rows the store actually changed.
    #[must_use]
    pub fn from_plan(plan: &LinkPlan, writes: usize) -> Self {
        Self {
            respondent_id: plan.respondent_id,
            bundle_key: plan.bundle_key.clone(),
            bundle_len: plan.bundle_len,
            already_linked: plan.already_linked,
            linked: plan.links.len(),
            writes,
            unmatched_tail: plan.missing_question_ids.len(),
            count_mismatch: false,
            surplus: None,
            missing_question_ids: plan.missing_question_ids.clone(),
            branching_question_ids: plan.branching_question_ids.clone(),
        }
    }

    #[must_use]
    pub fn count_mismatch(
        respondent_id: RespondentId,
        bundle: &Bundle,
        already_linked: usize,
        surplus: usize,
    ) -> Self {
        Self {
            respondent_id,
            bundle_key: bundle.key.clone(),
            bundle_len: bundle.len(),
            already_linked,
            linked: 0,
            writes: 0,
            unmatched_tail: 0,
            count_mismatch: true,
            surplus: Some(surplus),
            missing_question_ids: Vec::new(),
            branching_question_ids: bundle.branching_question_ids(),
        }
    }
}

/// Questions of `bundle` not yet answered by any linked response in `timeline`.
#[must_use]
pub fn open_slots<'a>(bundle: &'a Bundle, timeline: &[Response]) -> Vec<&'a Question> {
    let answered = answered_question_ids(bundle, timeline);
    bundle.questions.iter().filter(|question| !answered.contains(&question.question_id)).collect()
}

fn answered_question_ids(bundle: &Bundle, timeline: &[Response]) -> BTreeSet<QuestionId> {
    timeline
        .iter()
        .filter_map(|response| response.question_id)
        .filter(|question_id| bundle.contains(*question_id))
        .collect()
}

/// Orphaned responses in timeline order.
#[must_use]
pub fn orphan_sequence(timeline: &[Response]) -> Vec<&Response> {
    ordered_timeline(timeline).into_iter().filter(|response| response.is_orphan()).collect()
}

/// Positionally match a respondent's orphans onto the open slots of its bundle.
///
/// The i-th orphan by collection time is paired with the i-th open question in
/// bundle order. Response values never influence the pairing.
///
/// # Errors
/// Returns [`ReconcileError::Validation`] when `timeline` mixes respondents, or
/// [`ReconcileError::CountMismatch`] when orphans outnumber open slots. No links are
/// planned in either case.
pub fn plan_links(
    respondent_id: RespondentId,
    bundle: &Bundle,
    timeline: &[Response],
) -> Result<LinkPlan, ReconcileError> {
    if let Some(foreign) = timeline.iter().find(|response| response.respondent_id != respondent_id)
    {
        return Err(ReconcileError::Validation(format!(
            "response {} belongs to respondent {}, not {respondent_id}",
            foreign.response_id, foreign.respondent_id
        )));
    }

    let slots = open_slots(bundle, timeline);
    let orphans = orphan_sequence(timeline);
    let already_linked = bundle.len() - slots.len();

    if orphans.len() > slots.len() {
        return Err(ReconcileError::CountMismatch {
            orphans: orphans.len(),
            open_slots: slots.len(),
            surplus: orphans.len() - slots.len(),
        });
    }

    let links = orphans
        .iter()
        .zip(slots.iter())
        .enumerate()
        .map(|(position, (response, question))| ProposedLink {
            response_id: response.response_id,
            question_id: question.question_id,
            position,
            backfill: response
                .context
                .is_empty()
                .then(|| QuestionBankContext::from_bundle_key(&bundle.key)),
        })
        .collect::<Vec<_>>();

    let missing_question_ids =
        slots.iter().skip(orphans.len()).map(|question| question.question_id).collect();

    Ok(LinkPlan {
        respondent_id,
        bundle_key: bundle.key.clone(),
        bundle_len: bundle.len(),
        already_linked,
        open_slots: slots.len(),
        links,
        missing_question_ids,
        branching_question_ids: bundle.branching_question_ids(),
    })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::bundle::resolve_bundles;
    use crate::fixtures::*;

    /// In-memory stand-in for the store's conditional `question_id IS NULL` update.
    fn apply_plan(plan: &LinkPlan, timeline: &mut [Response]) -> usize {
        let mut writes = 0;
        for link in &plan.links {
            let Some(response) = timeline
                .iter_mut()
                .find(|response| response.response_id == link.response_id && response.is_orphan())
            else {
                continue;
            };
            response.question_id = Some(link.question_id);
            writes += 1;
        }
        writes
    }
    use crate::ProjectId;

    fn cocoa_bundle(project_id: ProjectId, count: usize) -> Bundle {
        let key = cocoa_key();
        let resolution = resolve_bundles(&mk_bundle_questions(project_id, &key, count));
        match resolution.bundle(&key) {
            Ok(bundle) => bundle.clone(),
            Err(err) => panic!("fixture bundle should resolve: {err}"),
        }
    }

    #[test]
    fn five_orphans_link_positionally_onto_five_questions() {
        let project_id = ProjectId::new();
        let respondent_id = RespondentId::new();
        let bundle = cocoa_bundle(project_id, 5);
        // Inserted out of time order to prove ordering is temporal.
        let timeline = mk_orphans(project_id, respondent_id, &[40, 0, 10, 30, 20]);

        let plan = match plan_links(respondent_id, &bundle, &timeline) {
            Ok(plan) => plan,
            Err(err) => panic!("plan should succeed: {err}"),
        };

        let by_time = ordered_timeline(&timeline);
        assert_eq!(plan.links.len(), 5);
        for (index, link) in plan.links.iter().enumerate() {
            assert_eq!(link.response_id, by_time[index].response_id);
            assert_eq!(link.question_id, bundle.questions[index].question_id);
            assert_eq!(link.position, index);
        }
        assert!(plan.missing_question_ids.is_empty());
        assert_eq!(LinkSummary::from_plan(&plan, 5).unmatched_tail, 0);
    }

    #[test]
    fn six_orphans_against_five_questions_is_count_mismatch() {
        let project_id = ProjectId::new();
        let respondent_id = RespondentId::new();
        let bundle = cocoa_bundle(project_id, 5);
        let timeline = mk_orphans(project_id, respondent_id, &[0, 10, 20, 30, 40, 50]);

        assert_eq!(
            plan_links(respondent_id, &bundle, &timeline),
            Err(ReconcileError::CountMismatch { orphans: 6, open_slots: 5, surplus: 1 })
        );
    }

    #[test]
    fn short_sequence_reports_missing_tail() {
        let project_id = ProjectId::new();
        let respondent_id = RespondentId::new();
        let bundle = cocoa_bundle(project_id, 5);
        let timeline = mk_orphans(project_id, respondent_id, &[0, 10, 20]);

        let plan = match plan_links(respondent_id, &bundle, &timeline) {
            Ok(plan) => plan,
            Err(err) => panic!("plan should succeed: {err}"),
        };

        assert_eq!(plan.links.len(), 3);
        assert_eq!(
            plan.missing_question_ids,
            vec![bundle.questions[3].question_id, bundle.questions[4].question_id]
        );
    }

    #[test]
    fn backfill_only_targets_empty_context() {
        let project_id = ProjectId::new();
        let respondent_id = RespondentId::new();
        let bundle = cocoa_bundle(project_id, 2);
        let mut timeline = mk_orphans(project_id, respondent_id, &[0, 10]);
        timeline[1].context.partner_name = Some("Cooperative A".to_string());

        let plan = match plan_links(respondent_id, &bundle, &timeline) {
            Ok(plan) => plan,
            Err(err) => panic!("plan should succeed: {err}"),
        };

        assert_eq!(plan.links[0].backfill, Some(QuestionBankContext::from_bundle_key(&bundle.key)));
        assert_eq!(plan.links[1].backfill, None);
    }

    #[test]
    fn relinking_a_fully_linked_respondent_is_a_noop() {
        let project_id = ProjectId::new();
        let respondent_id = RespondentId::new();
        let bundle = cocoa_bundle(project_id, 4);
        let mut timeline = mk_orphans(project_id, respondent_id, &[0, 10, 20, 30]);

        let first = match plan_links(respondent_id, &bundle, &timeline) {
            Ok(plan) => plan,
            Err(err) => panic!("first plan should succeed: {err}"),
        };
        assert_eq!(apply_plan(&first, &mut timeline), 4);
        assert_eq!(apply_plan(&first, &mut timeline), 0);

        let second = match plan_links(respondent_id, &bundle, &timeline) {
            Ok(plan) => plan,
            Err(err) => panic!("second plan should succeed: {err}"),
        };
        assert!(second.is_noop());
        assert_eq!(second.already_linked, 4);
        assert_eq!(second.open_slots, 0);
        assert!(second.missing_question_ids.is_empty());
    }

    #[test]
    fn foreign_responses_are_rejected() {
        let project_id = ProjectId::new();
        let respondent_id = RespondentId::new();
        let bundle = cocoa_bundle(project_id, 2);
        let timeline = mk_orphans(project_id, RespondentId::new(), &[0]);

        assert!(matches!(
            plan_links(respondent_id, &bundle, &timeline),
            Err(ReconcileError::Validation(_))
        ));
    }

    proptest! {
        #[test]
        fn property_links_plus_tail_cover_the_bundle(
            bundle_len in 1_usize..12,
            offsets in proptest::collection::vec(0_i64..10_000, 0..12),
        ) {
            let project_id = ProjectId::new();
            let respondent_id = RespondentId::new();
            let bundle = cocoa_bundle(project_id, bundle_len);
            let timeline = mk_orphans(project_id, respondent_id, &offsets);

            match plan_links(respondent_id, &bundle, &timeline) {
                Ok(plan) => {
                    prop_assert!(offsets.len() <= bundle_len);
                    prop_assert_eq!(plan.links.len() + plan.missing_question_ids.len(), bundle_len);
                }
                Err(ReconcileError::CountMismatch { surplus, .. }) => {
                    prop_assert_eq!(surplus, offsets.len() - bundle_len);
                }
                Err(err) => prop_assert!(false, "unexpected error: {}", err),
            }
        }
    }
}
