use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{missing_components, BundleKey, Question, QuestionId, ReconcileError};

/// Ordered question template for one bundle key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bundle {
    pub key: BundleKey,
    pub questions: Vec<Question>,
}

impl Bundle {
    #[must_use]
    pub fn len(&self) -> usize {
        self.questions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }

    #[must_use]
    pub fn question_ids(&self) -> Vec<QuestionId> {
        self.questions.iter().map(|question| question.question_id).collect()
    }

    /// Questions that only appear when a parent answer satisfies their predicate.
    #[must_use]
    pub fn branching_question_ids(&self) -> Vec<QuestionId> {
        self.questions
            .iter()
            .filter(|question| question.is_branching())
            .map(|question| question.question_id)
            .collect()
    }

    #[must_use]
    pub fn contains(&self, question_id: QuestionId) -> bool {
        self.questions.iter().any(|question| question.question_id == question_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnassignableQuestion {
    pub question_id: QuestionId,
    pub text: String,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BundleResolution {
    /// Sorted by bundle key.
    pub bundles: Vec<Bundle>,
    pub unassignable: Vec<UnassignableQuestion>,
}

impl BundleResolution {
    /// Look up the template for `key`.
    ///
    /// # Errors
    /// Returns [`ReconcileError::IncompleteBundle`] when no question resolved to `key`.
    pub fn bundle(&self, key: &BundleKey) -> Result<&Bundle, ReconcileError> {
        self.bundles
            .binary_search_by(|bundle| bundle.key.cmp(key))
            .ok()
            .and_then(|index| self.bundles.get(index))
            .filter(|bundle| !bundle.is_empty())
            .ok_or_else(|| ReconcileError::IncompleteBundle { bundle_key: key.to_string() })
    }

    #[must_use]
    pub fn question_count(&self) -> usize {
        self.bundles.iter().map(Bundle::len).sum()
    }
}

/// Group a project's questions into ordered templates.
///
/// Questions are ordered by creation time with the identifier as tie-breaker, so the
/// result does not depend on input order. Questions with any blank key component are
/// reported as unassignable instead of being placed in a bundle.
#[must_use]
pub fn resolve_bundles(questions: &[Question]) -> BundleResolution {
    let mut grouped: BTreeMap<BundleKey, Vec<Question>> = BTreeMap::new();
    let mut unassignable = Vec::new();

    for question in questions {
        match question.bundle_key() {
            Some(key) => grouped.entry(key).or_default().push(question.clone()),
            None => unassignable.push(UnassignableQuestion {
                question_id: question.question_id,
                text: question.text.clone(),
                missing: missing_components(
                    question.category.as_deref(),
                    question.commodity.as_deref(),
                    question.country.as_deref(),
                ),
            }),
        }
    }

    unassignable.sort_by(|lhs, rhs| lhs.question_id.cmp(&rhs.question_id));

    let bundles = grouped
        .into_iter()
        .map(|(key, mut questions)| {
            questions.sort_by(Question::catalog_cmp);
            Bundle { key, questions }
        })
        .collect();

    BundleResolution { bundles, unassignable }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::fixtures::*;
    use crate::ProjectId;

    #[test]
    fn questions_are_grouped_and_ordered_by_creation() {
        let project_id = ProjectId::new();
        let cocoa = cocoa_key();
        let coffee = BundleKey::new("farmer", "coffee", "Kenya");

        let q_late = mk_question(project_id, "How many hectares?", Some(&cocoa), 30);
        let q_early = mk_question(project_id, "What is your age?", Some(&cocoa), 10);
        let q_coffee = mk_question(project_id, "Coffee variety?", Some(&coffee), 5);

        let resolution = resolve_bundles(&[q_late.clone(), q_coffee.clone(), q_early.clone()]);

        assert_eq!(resolution.bundles.len(), 2);
        let bundle = match resolution.bundle(&cocoa) {
            Ok(bundle) => bundle,
            Err(err) => panic!("cocoa bundle should resolve: {err}"),
        };
        assert_eq!(bundle.question_ids(), vec![q_early.question_id, q_late.question_id]);
        assert!(resolution.unassignable.is_empty());
        assert_eq!(resolution.question_count(), 3);
    }

    #[test]
    fn creation_ties_break_by_question_id() {
        let project_id = ProjectId::new();
        let key = cocoa_key();
        let mut first = mk_question(project_id, "A", Some(&key), 0);
        let mut second = mk_question(project_id, "B", Some(&key), 0);
        first.question_id = QuestionId(fixture_ulid("01HZY9D4Q3SG7PV9A6EXJ8N2E1"));
        second.question_id = QuestionId(fixture_ulid("01HZY9D4Q3SG7PV9A6EXJ8N2E2"));

        let resolution = resolve_bundles(&[second.clone(), first.clone()]);
        let bundle = match resolution.bundle(&key) {
            Ok(bundle) => bundle,
            Err(err) => panic!("bundle should resolve: {err}"),
        };
        assert_eq!(bundle.question_ids(), vec![first.question_id, second.question_id]);
    }

    #[test]
    fn questions_missing_key_components_are_unassignable() {
        let project_id = ProjectId::new();
        let mut partial = mk_question(project_id, "Which cooperative?", Some(&cocoa_key()), 0);
        partial.country = None;
        partial.commodity = Some(" ".to_string());

        let resolution = resolve_bundles(&[partial.clone()]);

        assert!(resolution.bundles.is_empty());
        assert_eq!(resolution.unassignable.len(), 1);
        assert_eq!(resolution.unassignable[0].question_id, partial.question_id);
        assert_eq!(resolution.unassignable[0].missing, vec!["commodity", "country"]);
    }

    #[test]
    fn unknown_bundle_key_is_incomplete_bundle_error() {
        let resolution = resolve_bundles(&[]);
        let key = BundleKey::new("trader", "cashew", "Benin");
        assert_eq!(
            resolution.bundle(&key),
            Err(ReconcileError::IncompleteBundle { bundle_key: "trader/cashew/Benin".to_string() })
        );
    }

    proptest! {
        #[test]
        fn property_every_keyed_question_lands_in_exactly_one_bundle(
            shape in proptest::collection::vec((0_u8..3, 0_u8..3, 0_i64..50, any::<bool>()), 0..40)
        ) {
            let project_id = ProjectId::new();
            let questions = shape
                .iter()
                .enumerate()
                .map(|(index, (commodity, country, offset, keyed))| {
                    let key = BundleKey::new("farmer", format!("c{commodity}"), format!("k{country}"));
                    let key = keyed.then_some(&key);
                    mk_question(project_id, &format!("q{index}"), key, *offset)
                })
                .collect::<Vec<_>>();

            let resolution = resolve_bundles(&questions);
            let keyed = questions.iter().filter(|question| question.bundle_key().is_some()).count();

            prop_assert_eq!(resolution.question_count(), keyed);
            prop_assert_eq!(resolution.unassignable.len(), questions.len() - keyed);
            for bundle in &resolution.bundles {
                for pair in bundle.questions.windows(2) {
                    prop_assert!(pair[0].catalog_cmp(&pair[1]).is_lt());
                }
            }
        }
    }
}
