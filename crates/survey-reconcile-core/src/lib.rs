use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

pub mod anomaly;
pub mod attribution;
pub mod bundle;
pub mod config;
pub mod dedup;
pub mod linker;

pub use anomaly::{
    propose_repairs, scan_timeline, AnomalyKind, AnomalyProposal, AnomalyScan, FlaggedResponse,
    ManualReview, RepairContext,
};
pub use attribution::{
    build_profiles, default_signals, rank_candidates, ActivityProfile, AttributionOutcome,
    AttributionRanking, CandidateScore, CollectorProfile, DeviceOverlapSignal, ProfilePool,
    ResponsePatternSignal, RespondentProfile, SignalScore, SimilaritySignal, TemporalHistogram,
    TemporalPatternSignal, WeightedAggregator,
};
pub use bundle::{resolve_bundles, Bundle, BundleResolution, UnassignableQuestion};
pub use config::{AnomalyConfig, AttributionConfig, BatchConfig, EngineConfig, LockConfig};
pub use dedup::{plan_dedup, DedupPlan, DedupSummary, DuplicateQuestion};
pub use linker::{plan_links, LinkPlan, LinkSummary, ProposedLink};

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ReconcileError {
    #[error("incomplete bundle: no questions resolved for bundle key {bundle_key}")]
    IncompleteBundle { bundle_key: String },
    #[error(
        "count mismatch: {orphans} orphaned responses exceed {open_slots} open bundle slots (surplus={surplus})"
    )]
    CountMismatch { orphans: usize, open_slots: usize, surplus: usize },
    #[error(
        "ambiguous attribution: collectors {first} and {second} are separated by less than {margin}"
    )]
    AmbiguousAttribution { first: CollectorId, second: CollectorId, margin: f64 },
    #[error("precondition revalidation failed: {0}")]
    PreconditionRevalidationFailed(String),
    #[error("validation error: {0}")]
    Validation(String),
}

impl ReconcileError {
    /// Domain outcomes that mean "nothing to do for this entity" rather than a failure.
    #[must_use]
    pub fn is_skip(&self) -> bool {
        matches!(
            self,
            Self::IncompleteBundle { .. }
                | Self::CountMismatch { .. }
                | Self::AmbiguousAttribution { .. }
        )
    }
}

macro_rules! ulid_id {
    ($name:ident, $label:literal) => {
        #[derive(
            Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash,
        )]
        pub struct $name(pub Ulid);

        impl $name {
            #[must_use]
            pub fn new() -> Self {
                Self(Ulid::new())
            }

            /// Parse an identifier from its ULID string form.
            ///
            /// # Errors
            /// Returns [`ReconcileError::Validation`] when `raw` is not a valid ULID.
            pub fn parse(raw: &str) -> Result<Self, ReconcileError> {
                Ulid::from_string(raw.trim()).map(Self).map_err(|err| {
                    ReconcileError::Validation(format!("invalid {} `{raw}`: {err}", $label))
                })
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

ulid_id!(ProjectId, "project_id");
ulid_id!(QuestionBankId, "question_bank_id");
ulid_id!(QuestionId, "question_id");
ulid_id!(RespondentId, "respondent_id");
ulid_id!(ResponseId, "response_id");
ulid_id!(CollectorId, "collector_id");
ulid_id!(ProposalId, "proposal_id");

/// Template key shared by a respondent and the questions generated for it.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BundleKey {
    pub category: String,
    pub commodity: String,
    pub country: String,
}

impl BundleKey {
    #[must_use]
    pub fn new(
        category: impl Into<String>,
        commodity: impl Into<String>,
        country: impl Into<String>,
    ) -> Self {
        Self { category: category.into(), commodity: commodity.into(), country: country.into() }
    }

    /// Build a key only when every component is present and non-blank.
    #[must_use]
    pub fn from_parts(
        category: Option<&str>,
        commodity: Option<&str>,
        country: Option<&str>,
    ) -> Option<Self> {
        let category = non_blank(category)?;
        let commodity = non_blank(commodity)?;
        let country = non_blank(country)?;
        Some(Self::new(category, commodity, country))
    }
}

impl Display for BundleKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.category, self.commodity, self.country)
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn missing_components(
    category: Option<&str>,
    commodity: Option<&str>,
    country: Option<&str>,
) -> Vec<String> {
    [("category", category), ("commodity", commodity), ("country", country)]
        .into_iter()
        .filter(|(_, value)| non_blank(*value).is_none())
        .map(|(name, _)| name.to_string())
        .collect()
}

fn describe_partial_key(
    category: Option<&str>,
    commodity: Option<&str>,
    country: Option<&str>,
) -> String {
    [category, commodity, country]
        .into_iter()
        .map(|value| non_blank(value).unwrap_or("-"))
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Owned,
    Public,
}

impl Visibility {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Owned => "owned",
            Self::Public => "public",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ConditionalLogic {
    pub parent_question_bank_id: Option<QuestionBankId>,
    pub show_if: Option<String>,
}

impl ConditionalLogic {
    /// A question only branches when it depends on a parent answer.
    #[must_use]
    pub fn is_branching(&self) -> bool {
        self.parent_question_bank_id.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub project_id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub target_categories: BTreeSet<String>,
    #[serde(default)]
    pub target_commodities: BTreeSet<String>,
    #[serde(default)]
    pub target_countries: BTreeSet<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Project {
    /// # Errors
    /// Returns [`ReconcileError::Validation`] when the project has no name.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.name.trim().is_empty() {
            return Err(ReconcileError::Validation("project name MUST be provided".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuestionBank {
    pub question_bank_id: QuestionBankId,
    pub text: String,
    pub category: Option<String>,
    pub conditional: Option<ConditionalLogic>,
    pub visibility: Visibility,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Question {
    pub question_id: QuestionId,
    pub project_id: ProjectId,
    pub text: String,
    pub category: Option<String>,
    pub commodity: Option<String>,
    pub country: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub question_bank_id: Option<QuestionBankId>,
    pub conditional: Option<ConditionalLogic>,
}

impl Question {
    #[must_use]
    pub fn bundle_key(&self) -> Option<BundleKey> {
        BundleKey::from_parts(
            self.category.as_deref(),
            self.commodity.as_deref(),
            self.country.as_deref(),
        )
    }

    #[must_use]
    pub fn is_branching(&self) -> bool {
        self.conditional.as_ref().is_some_and(ConditionalLogic::is_branching)
    }

    /// Catalog order: creation time ascending, identifier as tie-breaker.
    #[must_use]
    pub fn catalog_cmp(&self, other: &Self) -> Ordering {
        self.created_at.cmp(&other.created_at).then_with(|| self.question_id.cmp(&other.question_id))
    }

    /// # Errors
    /// Returns [`ReconcileError::Validation`] when the question text is blank.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.text.trim().is_empty() {
            return Err(ReconcileError::Validation(format!(
                "question {} MUST have non-empty text",
                self.question_id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Respondent {
    pub respondent_id: RespondentId,
    pub project_id: ProjectId,
    pub external_id: String,
    pub category: Option<String>,
    pub commodity: Option<String>,
    pub country: Option<String>,
    pub collector_id: Option<CollectorId>,
    pub created_by: Option<String>,
}

impl Respondent {
    #[must_use]
    pub fn bundle_key(&self) -> Option<BundleKey> {
        BundleKey::from_parts(
            self.category.as_deref(),
            self.commodity.as_deref(),
            self.country.as_deref(),
        )
    }

    /// Resolve the respondent's bundle key, treating a partial key as "no template".
    ///
    /// # Errors
    /// Returns [`ReconcileError::IncompleteBundle`] when any key component is missing.
    pub fn require_bundle_key(&self) -> Result<BundleKey, ReconcileError> {
        self.bundle_key().ok_or_else(|| ReconcileError::IncompleteBundle {
            bundle_key: describe_partial_key(
                self.category.as_deref(),
                self.commodity.as_deref(),
                self.country.as_deref(),
            ),
        })
    }

    /// # Errors
    /// Returns [`ReconcileError::Validation`] when the external identifier is blank.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.external_id.trim().is_empty() {
            return Err(ReconcileError::Validation(format!(
                "respondent {} MUST have an external identifier",
                self.respondent_id
            )));
        }
        Ok(())
    }
}

/// Best-effort snapshot of question-bank context captured at collection time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct QuestionBankContext {
    pub category: Option<String>,
    pub commodity: Option<String>,
    pub country: Option<String>,
    pub data_source: Option<String>,
    pub partner_name: Option<String>,
    pub work_package: Option<String>,
}

impl QuestionBankContext {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        [
            &self.category,
            &self.commodity,
            &self.country,
            &self.data_source,
            &self.partner_name,
            &self.work_package,
        ]
        .into_iter()
        .all(|value| non_blank(value.as_deref()).is_none())
    }

    #[must_use]
    pub fn from_bundle_key(key: &BundleKey) -> Self {
        Self {
            category: Some(key.category.clone()),
            commodity: Some(key.commodity.clone()),
            country: Some(key.country.clone()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn bundle_key(&self) -> Option<BundleKey> {
        BundleKey::from_parts(
            self.category.as_deref(),
            self.commodity.as_deref(),
            self.country.as_deref(),
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct DeviceFingerprint {
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl DeviceFingerprint {
    /// Attributes flattened to `key=value` tokens for set comparison.
    #[must_use]
    pub fn attribute_set(&self) -> BTreeSet<String> {
        self.attributes
            .iter()
            .filter(|(key, value)| !key.trim().is_empty() && !value.trim().is_empty())
            .map(|(key, value)| format!("{}={}", key.trim(), value.trim()))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Response {
    pub response_id: ResponseId,
    pub project_id: ProjectId,
    pub respondent_id: RespondentId,
    /// Store insertion order; breaks ties between identical `collected_at` values.
    #[serde(default)]
    pub sequence: i64,
    pub value: String,
    #[serde(with = "time::serde::rfc3339")]
    pub collected_at: OffsetDateTime,
    pub question_id: Option<QuestionId>,
    #[serde(default)]
    pub context: QuestionBankContext,
    pub collector_id: Option<CollectorId>,
    pub device: Option<DeviceFingerprint>,
}

impl Response {
    #[must_use]
    pub fn is_orphan(&self) -> bool {
        self.question_id.is_none()
    }

    /// Timeline order: `collected_at` ascending, then insertion sequence, then id.
    #[must_use]
    pub fn timeline_cmp(&self, other: &Self) -> Ordering {
        self.collected_at
            .cmp(&other.collected_at)
            .then_with(|| self.sequence.cmp(&other.sequence))
            .then_with(|| self.response_id.cmp(&other.response_id))
    }
}

/// Borrow `responses` in timeline order without reordering the caller's slice.
#[must_use]
pub fn ordered_timeline(responses: &[Response]) -> Vec<&Response> {
    let mut ordered = responses.iter().collect::<Vec<_>>();
    ordered.sort_by(|lhs, rhs| lhs.timeline_cmp(rhs));
    ordered
}

/// Envelope persisted between the propose and commit phases of a repair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "proposal", rename_all = "snake_case")]
pub enum RepairProposal {
    Anomaly(AnomalyProposal),
    Dedup(DedupPlan),
}

impl RepairProposal {
    #[must_use]
    pub fn proposal_id(&self) -> ProposalId {
        match self {
            Self::Anomaly(proposal) => proposal.proposal_id,
            Self::Dedup(plan) => plan.proposal_id,
        }
    }

    #[must_use]
    pub fn project_id(&self) -> ProjectId {
        match self {
            Self::Anomaly(proposal) => proposal.project_id,
            Self::Dedup(plan) => plan.project_id,
        }
    }

    #[must_use]
    pub fn kind(&self) -> ProposalKind {
        match self {
            Self::Anomaly(_) => ProposalKind::Anomaly,
            Self::Dedup(_) => ProposalKind::Dedup,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProposalKind {
    Anomaly,
    Dedup,
}

impl ProposalKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anomaly => "anomaly",
            Self::Dedup => "dedup",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "anomaly" => Some(Self::Anomaly),
            "dedup" => Some(Self::Dedup),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Committed,
    Aborted,
}

impl ProposalStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "committed" => Some(Self::Committed),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }
}

/// Lossless-enough conversion of counts to `f64` for ratio math.
pub(crate) fn count_f64(value: usize) -> f64 {
    f64::from(u32::try_from(value).unwrap_or(u32::MAX))
}
