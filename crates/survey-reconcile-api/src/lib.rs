use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use survey_reconcile_core::linker::open_slots;
use survey_reconcile_core::{
    build_profiles, plan_dedup, plan_links, propose_repairs, rank_candidates, resolve_bundles,
    AnomalyProposal, AttributionRanking, BundleResolution, CollectorId, DedupPlan, DedupSummary,
    EngineConfig, LinkSummary, ProjectId, ProposalId, ProposalStatus, ReconcileError,
    RepairContext, RepairProposal, RespondentId, WeightedAggregator,
};
use survey_reconcile_store_sqlite::{
    project_lock_scope, respondent_lock_scope, ImportSummary, Resolution, SchemaStatus,
    SqliteStore, StoredProposal,
};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use ulid::Ulid;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SucceededEntity<T> {
    pub entity_id: String,
    pub result: T,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SkippedEntity {
    pub entity_id: String,
    pub reason: String,
    pub detail: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedEntity {
    pub entity_id: String,
    pub reason: String,
}

/// Per-entity outcome of a batch run. Every entity lands in exactly one list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchSummary<T> {
    pub project_id: ProjectId,
    pub succeeded: Vec<SucceededEntity<T>>,
    pub skipped: Vec<SkippedEntity>,
    pub failed: Vec<FailedEntity>,
}

impl<T> BatchSummary<T> {
    #[must_use]
    pub fn new(project_id: ProjectId) -> Self {
        Self { project_id, succeeded: Vec::new(), skipped: Vec::new(), failed: Vec::new() }
    }

    pub fn push_success(&mut self, entity_id: impl ToString, result: T) {
        self.succeeded.push(SucceededEntity { entity_id: entity_id.to_string(), result });
    }

    pub fn push_skip(
        &mut self,
        entity_id: impl ToString,
        reason: impl Into<String>,
        detail: Option<serde_json::Value>,
    ) {
        self.skipped.push(SkippedEntity {
            entity_id: entity_id.to_string(),
            reason: reason.into(),
            detail,
        });
    }

    /// File an error as a skip when it is a recoverable domain condition, else a failure.
    pub fn push_error(&mut self, entity_id: impl ToString, err: &anyhow::Error) {
        if err.downcast_ref::<ReconcileError>().is_some_and(ReconcileError::is_skip) {
            self.push_skip(entity_id, format!("{err:#}"), None);
        } else {
            self.failed.push(FailedEntity { entity_id: entity_id.to_string(), reason: format!("{err:#}") });
        }
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.skipped.len() + self.failed.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnomalyCommit {
    pub proposal_id: ProposalId,
    pub respondent_id: RespondentId,
    pub removed: usize,
    pub orphans_after: usize,
    pub open_slots: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttributionAcceptance {
    pub respondent_id: RespondentId,
    pub collector_id: CollectorId,
    pub score: Option<f64>,
    pub recommended: bool,
    pub accepted_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DedupCommit {
    pub proposal_id: ProposalId,
    pub project_id: ProjectId,
    pub questions_removed: usize,
    pub responses_repointed: usize,
}

/// Load engine settings from a YAML file, or defaults when no path is given.
///
/// # Errors
/// Returns an error when the file cannot be read, parsed, or fails validation.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: EngineConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    config.validate().with_context(|| format!("invalid config file {}", path.display()))?;
    Ok(config)
}

#[derive(Debug, Clone)]
pub struct ReconcileEngine {
    db_path: PathBuf,
    config: EngineConfig,
}

impl ReconcileEngine {
    /// # Errors
    /// Returns an error when `config` fails validation.
    pub fn new(db_path: PathBuf, config: EngineConfig) -> Result<Self> {
        config.validate().context("invalid engine config")?;
        Ok(Self { db_path, config })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore> {
        let mut store = SqliteStore::open(&self.db_path)?;
        store.migrate()?;
        Ok(store)
    }

    fn stale_after(&self) -> Duration {
        Duration::from_secs(self.config.lock.stale_after_secs)
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = SqliteStore::open(&self.db_path)?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = SqliteStore::open(&self.db_path)?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when any file cannot be parsed or imported.
    pub fn import(&self, in_dir: &Path) -> Result<ImportSummary> {
        let mut store = self.open_store()?;
        store.import_ndjson(in_dir)
    }

    /// Group the project's questions into ordered bundle templates.
    ///
    /// # Errors
    /// Returns an error when the project does not exist or cannot be read.
    pub fn resolve_bundles(&self, project_id: ProjectId) -> Result<BundleResolution> {
        let store = self.open_store()?;
        store.require_project(project_id)?;
        let resolution = resolve_bundles(&store.list_questions(project_id)?);
        debug!(
            %project_id,
            bundles = resolution.bundles.len(),
            questions = resolution.question_count(),
            unassignable = resolution.unassignable.len(),
            "resolved bundles"
        );
        Ok(resolution)
    }

    /// Link one respondent's orphans under its respondent lock.
    ///
    /// A count mismatch is reported in the summary rather than returned as an error.
    ///
    /// # Errors
    /// Returns an error when the respondent has no resolvable bundle, belongs to
    /// another project, is locked elsewhere, or storage fails.
    pub fn link_respondent(
        &self,
        project_id: ProjectId,
        respondent_id: RespondentId,
    ) -> Result<LinkSummary> {
        let mut store = self.open_store()?;
        store.require_project(project_id)?;
        let holder = lock_holder();
        store.with_lock(
            &respondent_lock_scope(respondent_id),
            &holder,
            self.stale_after(),
            |store| link_locked(store, project_id, respondent_id),
        )
    }

    /// Link every respondent of the project, `batch.workers` respondents at a time.
    ///
    /// # Errors
    /// Returns an error only when the project is missing or storage cannot be opened.
    pub fn link_project(&self, project_id: ProjectId) -> Result<BatchSummary<LinkSummary>> {
        let store = self.open_store()?;
        store.require_project(project_id)?;
        let respondent_ids = respondent_ids(&store, project_id)?;
        drop(store);

        let holder = lock_holder();
        let stale_after = self.stale_after();
        let outcomes = self.run_per_respondent(&respondent_ids, |store, respondent_id| {
            store.with_lock(&respondent_lock_scope(respondent_id), &holder, stale_after, |store| {
                link_locked(store, project_id, respondent_id)
            })
        })?;

        let mut summary = BatchSummary::new(project_id);
        for (respondent_id, outcome) in outcomes {
            match outcome {
                Ok(link) if link.count_mismatch => {
                    let reason = format!(
                        "count mismatch: orphans exceed open slots by {}",
                        link.surplus.unwrap_or_default()
                    );
                    summary.push_skip(respondent_id, reason, serde_json::to_value(&link).ok());
                }
                Ok(link) => summary.push_success(respondent_id, link),
                Err(err) => summary.push_error(respondent_id, &err),
            }
        }
        info!(
            %project_id,
            succeeded = summary.succeeded.len(),
            skipped = summary.skipped.len(),
            failed = summary.failed.len(),
            "linked project"
        );
        Ok(summary)
    }

    /// Scan one respondent and persist a pending proposal when a removal is proposed.
    ///
    /// # Errors
    /// Returns an error when the respondent is missing, locked elsewhere, or storage fails.
    pub fn propose_anomalies(
        &self,
        project_id: ProjectId,
        respondent_id: RespondentId,
    ) -> Result<AnomalyProposal> {
        let mut store = self.open_store()?;
        store.require_project(project_id)?;
        let holder = lock_holder();
        store.with_lock(
            &respondent_lock_scope(respondent_id),
            &holder,
            self.stale_after(),
            |store| propose_locked(store, &self.config, project_id, respondent_id),
        )
    }

    /// Propose anomaly repairs for every respondent of the project.
    ///
    /// # Errors
    /// Returns an error only when the project is missing or storage cannot be opened.
    pub fn scan_project_anomalies(
        &self,
        project_id: ProjectId,
    ) -> Result<BatchSummary<AnomalyProposal>> {
        let store = self.open_store()?;
        store.require_project(project_id)?;
        let respondent_ids = respondent_ids(&store, project_id)?;
        drop(store);

        let holder = lock_holder();
        let stale_after = self.stale_after();
        let outcomes = self.run_per_respondent(&respondent_ids, |store, respondent_id| {
            store.with_lock(&respondent_lock_scope(respondent_id), &holder, stale_after, |store| {
                propose_locked(store, &self.config, project_id, respondent_id)
            })
        })?;

        let mut summary = BatchSummary::new(project_id);
        for (respondent_id, outcome) in outcomes {
            match outcome {
                Ok(proposal) => summary.push_success(respondent_id, proposal),
                Err(err) => summary.push_error(respondent_id, &err),
            }
        }
        Ok(summary)
    }

    /// Re-validate and apply a pending anomaly proposal.
    ///
    /// When the precondition no longer holds the proposal is marked aborted and the
    /// error wraps [`ReconcileError::PreconditionRevalidationFailed`]; nothing is deleted.
    ///
    /// # Errors
    /// Returns an error when the proposal is missing, not a pending anomaly proposal,
    /// fails re-validation, or storage fails.
    pub fn commit_anomaly_proposal(
        &self,
        proposal_id: ProposalId,
        operator: &str,
    ) -> Result<AnomalyCommit> {
        require_operator(operator)?;
        let mut store = self.open_store()?;
        let proposal = match pending_proposal(&store, proposal_id)? {
            RepairProposal::Anomaly(proposal) => proposal,
            RepairProposal::Dedup(_) => {
                return Err(anyhow!("proposal {proposal_id} is a dedup proposal"));
            }
        };

        let holder = lock_holder();
        let respondent_id = proposal.respondent_id;
        store.with_lock(
            &respondent_lock_scope(respondent_id),
            &holder,
            self.stale_after(),
            |store| {
                let respondent = store
                    .get_respondent(respondent_id)?
                    .ok_or_else(|| anyhow!("respondent not found: {respondent_id}"))?;
                let timeline = store.list_respondent_responses(respondent_id)?;
                let current_slots = current_open_slots(store, &respondent, &timeline)?;

                if let Err(err) = proposal.revalidate(&timeline, current_slots) {
                    warn!(%proposal_id, %respondent_id, reason = %err, "aborting anomaly proposal");
                    store.abort_proposal(proposal_id, operator)?;
                    return Err(err.into());
                }

                let response_ids =
                    proposal.removals.iter().map(|removal| removal.response_id).collect::<Vec<_>>();
                let removed = store
                    .commit_response_removals(&response_ids, Resolution { proposal_id, operator })?;

                let after = store.list_respondent_responses(respondent_id)?;
                let orphans_after = after.iter().filter(|response| response.is_orphan()).count();
                let open_slots = current_open_slots(store, &respondent, &after)?.unwrap_or_default();
                info!(%proposal_id, %respondent_id, removed, orphans_after, open_slots, "committed anomaly proposal");
                Ok(AnomalyCommit { proposal_id, respondent_id, removed, orphans_after, open_slots })
            },
        )
    }

    /// Rank collector candidates for every historical respondent of the project.
    ///
    /// Ambiguous rankings are reported as skips carrying the ranking as detail.
    ///
    /// # Errors
    /// Returns an error when the project is missing, weights are invalid, or storage fails.
    pub fn rank_attributions(
        &self,
        project_id: ProjectId,
    ) -> Result<BatchSummary<AttributionRanking>> {
        let store = self.open_store()?;
        store.require_project(project_id)?;
        let rankings = self.rankings(&store, project_id)?;

        let mut summary = BatchSummary::new(project_id);
        for ranking in rankings {
            let respondent_id = ranking.respondent_id;
            match ranking.ambiguity() {
                Some(err) => {
                    summary.push_skip(respondent_id, err.to_string(), serde_json::to_value(&ranking).ok());
                }
                None => summary.push_success(respondent_id, ranking),
            }
        }
        Ok(summary)
    }

    /// Explicitly accept `collector_id` as the collector of a historical respondent.
    ///
    /// # Errors
    /// Returns an error when the respondent is not historical in this project, the
    /// collector is unknown, the operator is blank, or storage fails.
    pub fn accept_attribution(
        &self,
        project_id: ProjectId,
        respondent_id: RespondentId,
        collector_id: CollectorId,
        operator: &str,
    ) -> Result<AttributionAcceptance> {
        require_operator(operator)?;
        let mut store = self.open_store()?;
        store.require_project(project_id)?;
        let ranking = self
            .rankings(&store, project_id)?
            .into_iter()
            .find(|ranking| ranking.respondent_id == respondent_id)
            .ok_or_else(|| {
                anyhow!("respondent {respondent_id} is not a historical respondent of {project_id}")
            })?;
        let candidate = ranking
            .candidates
            .iter()
            .find(|candidate| candidate.collector_id == collector_id)
            .ok_or_else(|| anyhow!("collector {collector_id} is not a candidate for {respondent_id}"))?;
        let score = Some(candidate.score);
        let recommended = ranking.recommended() == Some(collector_id);

        let holder = lock_holder();
        store.with_lock(
            &respondent_lock_scope(respondent_id),
            &holder,
            self.stale_after(),
            |store| store.accept_attribution(respondent_id, collector_id, score, operator),
        )?;
        info!(%respondent_id, %collector_id, recommended, "accepted attribution");
        Ok(AttributionAcceptance {
            respondent_id,
            collector_id,
            score,
            recommended,
            accepted_by: operator.to_string(),
        })
    }

    /// Plan a dedup under the project lock.
    ///
    /// Nothing is deleted here. Outside `dry_run` a plan that removes anything is
    /// recorded as a pending proposal whose id is returned for [`Self::commit_dedup`].
    ///
    /// # Errors
    /// Returns an error when the project is missing, locked elsewhere, or storage fails.
    pub fn dedup(&self, project_id: ProjectId, dry_run: bool) -> Result<DedupSummary> {
        let mut store = self.open_store()?;
        store.require_project(project_id)?;
        let holder = lock_holder();
        store.with_lock(&project_lock_scope(project_id), &holder, self.stale_after(), |store| {
            if dry_run {
                let plan = plan_dedup(
                    project_id,
                    &store.list_questions(project_id)?,
                    OffsetDateTime::now_utc(),
                );
                return Ok(DedupSummary::from_plan(&plan, true, None));
            }
            let plan = propose_dedup_locked(store, project_id)?;
            let proposal_id = (!plan.is_noop()).then_some(plan.proposal_id);
            Ok(DedupSummary::from_plan(&plan, false, proposal_id))
        })
    }

    /// Plan a dedup and persist it as a pending proposal when it removes anything.
    ///
    /// # Errors
    /// Returns an error when the project is missing, locked elsewhere, or storage fails.
    pub fn propose_dedup(&self, project_id: ProjectId) -> Result<DedupPlan> {
        let mut store = self.open_store()?;
        store.require_project(project_id)?;
        let holder = lock_holder();
        store.with_lock(&project_lock_scope(project_id), &holder, self.stale_after(), |store| {
            propose_dedup_locked(store, project_id)
        })
    }

    /// Re-validate and apply a pending dedup proposal under the project lock.
    ///
    /// # Errors
    /// Returns an error when the proposal is missing, not a pending dedup proposal,
    /// fails re-validation, or storage fails.
    pub fn commit_dedup(&self, proposal_id: ProposalId, operator: &str) -> Result<DedupCommit> {
        require_operator(operator)?;
        let mut store = self.open_store()?;
        let plan = match pending_proposal(&store, proposal_id)? {
            RepairProposal::Dedup(plan) => plan,
            RepairProposal::Anomaly(_) => {
                return Err(anyhow!("proposal {proposal_id} is an anomaly proposal"));
            }
        };

        let holder = lock_holder();
        let project_id = plan.project_id;
        store.with_lock(&project_lock_scope(project_id), &holder, self.stale_after(), |store| {
            let questions = store.list_questions(project_id)?;
            if let Err(err) = plan.revalidate(&questions) {
                warn!(%proposal_id, %project_id, reason = %err, "aborting dedup proposal");
                store.abort_proposal(proposal_id, operator)?;
                return Err(err.into());
            }
            let applied =
                store.apply_dedup(&plan.duplicates, Resolution { proposal_id, operator })?;
            info!(
                %proposal_id,
                %project_id,
                removed = applied.questions_removed,
                repointed = applied.responses_repointed,
                "committed dedup proposal"
            );
            Ok(DedupCommit {
                proposal_id,
                project_id,
                questions_removed: applied.questions_removed,
                responses_repointed: applied.responses_repointed,
            })
        })
    }

    /// # Errors
    /// Returns an error when the proposal does not exist or cannot be decoded.
    pub fn proposal_show(&self, proposal_id: ProposalId) -> Result<StoredProposal> {
        let store = self.open_store()?;
        store.get_proposal(proposal_id)?.ok_or_else(|| anyhow!("proposal not found: {proposal_id}"))
    }

    fn rankings(&self, store: &SqliteStore, project_id: ProjectId) -> Result<Vec<AttributionRanking>> {
        let aggregator = WeightedAggregator::from_config(&self.config.attribution)?;
        let pool =
            build_profiles(&store.list_respondents(project_id)?, &store.list_responses(project_id)?);
        Ok(pool
            .historical
            .iter()
            .map(|profile| {
                rank_candidates(profile, &pool.collectors, &aggregator, &self.config.attribution)
            })
            .collect())
    }

    /// Run `work` for each respondent across `batch.workers` threads, each with its
    /// own connection. Results keep the input order.
    fn run_per_respondent<T, F>(
        &self,
        respondent_ids: &[RespondentId],
        work: F,
    ) -> Result<Vec<(RespondentId, Result<T>)>>
    where
        T: Send,
        F: Fn(&mut SqliteStore, RespondentId) -> Result<T> + Sync,
    {
        if respondent_ids.is_empty() {
            return Ok(Vec::new());
        }
        let workers = self.config.batch.workers.clamp(1, respondent_ids.len());
        let chunk_size = respondent_ids.len().div_ceil(workers);
        let work = &work;

        let chunks = thread::scope(|scope| {
            let handles = respondent_ids
                .chunks(chunk_size)
                .map(|chunk| {
                    scope.spawn(move || -> Result<Vec<(RespondentId, Result<T>)>> {
                        let mut store = self.open_store()?;
                        Ok(chunk.iter().map(|id| (*id, work(&mut store, *id))).collect())
                    })
                })
                .collect::<Vec<_>>();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().map_err(|_| anyhow!("reconcile worker panicked")).and_then(|r| r)
                })
                .collect::<Result<Vec<_>>>()
        })?;

        Ok(chunks.into_iter().flatten().collect())
    }
}

fn lock_holder() -> String {
    format!("pid{}-{}", std::process::id(), Ulid::new())
}

fn require_operator(operator: &str) -> Result<()> {
    if operator.trim().is_empty() {
        return Err(anyhow!("operator MUST be provided"));
    }
    Ok(())
}

fn respondent_ids(store: &SqliteStore, project_id: ProjectId) -> Result<Vec<RespondentId>> {
    Ok(store
        .list_respondents(project_id)?
        .into_iter()
        .map(|respondent| respondent.respondent_id)
        .collect())
}

fn pending_proposal(store: &SqliteStore, proposal_id: ProposalId) -> Result<RepairProposal> {
    let stored = store
        .get_proposal(proposal_id)?
        .ok_or_else(|| anyhow!("proposal not found: {proposal_id}"))?;
    if stored.status != ProposalStatus::Pending {
        return Err(anyhow!("proposal {proposal_id} is {}", stored.status.as_str()));
    }
    Ok(stored.proposal)
}

fn load_respondent(
    store: &SqliteStore,
    project_id: ProjectId,
    respondent_id: RespondentId,
) -> Result<survey_reconcile_core::Respondent> {
    let respondent = store
        .get_respondent(respondent_id)?
        .ok_or_else(|| anyhow!("respondent not found: {respondent_id}"))?;
    if respondent.project_id != project_id {
        return Err(anyhow!("respondent {respondent_id} does not belong to project {project_id}"));
    }
    Ok(respondent)
}

/// Open slots for the respondent's bundle, or `None` when it has no template.
fn current_open_slots(
    store: &SqliteStore,
    respondent: &survey_reconcile_core::Respondent,
    timeline: &[survey_reconcile_core::Response],
) -> Result<Option<usize>> {
    let Ok(key) = respondent.require_bundle_key() else {
        return Ok(None);
    };
    let resolution = resolve_bundles(&store.list_questions(respondent.project_id)?);
    Ok(resolution.bundle(&key).ok().map(|bundle| open_slots(bundle, timeline).len()))
}

fn link_locked(
    store: &mut SqliteStore,
    project_id: ProjectId,
    respondent_id: RespondentId,
) -> Result<LinkSummary> {
    let respondent = load_respondent(store, project_id, respondent_id)?;
    let key = respondent.require_bundle_key()?;
    let resolution = resolve_bundles(&store.list_questions(project_id)?);
    let bundle = resolution.bundle(&key)?;
    let timeline = store.list_respondent_responses(respondent_id)?;

    match plan_links(respondent_id, bundle, &timeline) {
        Ok(plan) => {
            let writes = if plan.is_noop() { 0 } else { store.apply_link_plan(&plan)? };
            debug!(%respondent_id, linked = plan.links.len(), writes, "linked respondent");
            Ok(LinkSummary::from_plan(&plan, writes))
        }
        Err(ReconcileError::CountMismatch { surplus, .. }) => {
            let already_linked = bundle.len() - open_slots(bundle, &timeline).len();
            warn!(%respondent_id, surplus, "orphans exceed open bundle slots; skipping");
            Ok(LinkSummary::count_mismatch(respondent_id, bundle, already_linked, surplus))
        }
        Err(err) => Err(err.into()),
    }
}

fn propose_dedup_locked(store: &mut SqliteStore, project_id: ProjectId) -> Result<DedupPlan> {
    let plan = plan_dedup(project_id, &store.list_questions(project_id)?, OffsetDateTime::now_utc());
    if !plan.is_noop() {
        store.save_proposal(&RepairProposal::Dedup(plan.clone()))?;
        info!(
            %project_id,
            proposal_id = %plan.proposal_id,
            duplicates = plan.duplicates.len(),
            "proposed dedup"
        );
    }
    Ok(plan)
}

fn propose_locked(
    store: &mut SqliteStore,
    config: &EngineConfig,
    project_id: ProjectId,
    respondent_id: RespondentId,
) -> Result<AnomalyProposal> {
    let respondent = load_respondent(store, project_id, respondent_id)?;
    let timeline = store.list_respondent_responses(respondent_id)?;
    let open_slots = current_open_slots(store, &respondent, &timeline)?;
    let proposal = propose_repairs(
        RepairContext { project_id, respondent_id, bundle_key: respondent.bundle_key(), open_slots },
        &timeline,
        &config.anomaly,
        OffsetDateTime::now_utc(),
    );
    if proposal.is_actionable() {
        store.save_proposal(&RepairProposal::Anomaly(proposal.clone()))?;
        info!(
            %respondent_id,
            proposal_id = %proposal.proposal_id,
            removals = proposal.removals.len(),
            "proposed anomaly repair"
        );
    }
    Ok(proposal)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use survey_reconcile_core::{
        BundleKey, DeviceFingerprint, Project, Question, QuestionBankContext, QuestionId,
        Respondent, Response, ResponseId,
    };
    use time::Duration as TimeDuration;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("survey-reconcile-api-{}.sqlite3", Ulid::new()))
    }

    fn cleanup(db_path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let _ = fs::remove_file(format!("{}{suffix}", db_path.display()));
        }
    }

    fn base_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + TimeDuration::seconds(1_700_000_000)
    }

    fn cocoa() -> BundleKey {
        BundleKey::new("farmer", "cocoa", "Ghana")
    }

    struct Fixture {
        db_path: PathBuf,
        engine: ReconcileEngine,
        store: SqliteStore,
        project_id: ProjectId,
        questions: Vec<Question>,
    }

    impl Fixture {
        fn new(question_texts: &[&str]) -> Result<Self> {
            let db_path = unique_temp_db_path();
            let engine = ReconcileEngine::new(db_path.clone(), EngineConfig::default())?;
            let mut store = SqliteStore::open(&db_path)?;
            store.migrate()?;

            let project_id = ProjectId::new();
            store.insert_project(&Project {
                project_id,
                name: "Cocoa baseline".to_string(),
                target_categories: BTreeSet::from(["farmer".to_string()]),
                target_commodities: BTreeSet::from(["cocoa".to_string()]),
                target_countries: BTreeSet::from(["Ghana".to_string()]),
                created_at: base_time(),
            })?;

            let key = cocoa();
            let mut questions = Vec::new();
            for (index, text) in question_texts.iter().enumerate() {
                let question = Question {
                    question_id: QuestionId::new(),
                    project_id,
                    text: (*text).to_string(),
                    category: Some(key.category.clone()),
                    commodity: Some(key.commodity.clone()),
                    country: Some(key.country.clone()),
                    created_at: base_time() + TimeDuration::seconds(i64::try_from(index)?),
                    question_bank_id: None,
                    conditional: None,
                };
                store.insert_question(&question)?;
                questions.push(question);
            }

            Ok(Self { db_path, engine, store, project_id, questions })
        }

        fn respondent(&mut self, external_id: &str, key: Option<&BundleKey>) -> Result<RespondentId> {
            let respondent = Respondent {
                respondent_id: RespondentId::new(),
                project_id: self.project_id,
                external_id: external_id.to_string(),
                category: key.map(|key| key.category.clone()),
                commodity: key.map(|key| key.commodity.clone()),
                country: key.map(|key| key.country.clone()),
                collector_id: None,
                created_by: None,
            };
            self.store.insert_respondent(&respondent)?;
            Ok(respondent.respondent_id)
        }

        fn responses(
            &mut self,
            respondent_id: RespondentId,
            offsets: &[i64],
            collector_id: Option<CollectorId>,
            values: Option<&[&str]>,
        ) -> Result<Vec<ResponseId>> {
            let mut ids = Vec::new();
            for (index, offset) in offsets.iter().enumerate() {
                let value = values
                    .and_then(|values| values.get(index).copied())
                    .map_or_else(|| format!("answer-{index}"), str::to_string);
                let response = Response {
                    response_id: ResponseId::new(),
                    project_id: self.project_id,
                    respondent_id,
                    sequence: 0,
                    value,
                    collected_at: base_time() + TimeDuration::seconds(*offset),
                    question_id: None,
                    context: QuestionBankContext::default(),
                    collector_id,
                    device: Some(DeviceFingerprint {
                        attributes: [("model".to_string(), "Tecno Spark".to_string())].into(),
                    }),
                };
                self.store.insert_response(&response)?;
                ids.push(response.response_id);
            }
            Ok(ids)
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            cleanup(&self.db_path);
        }
    }

    #[test]
    fn link_project_isolates_per_respondent_outcomes() -> Result<()> {
        let mut fx = Fixture::new(&["Q1", "Q2", "Q3", "Q4", "Q5"])?;
        let exact = fx.respondent("R-exact", Some(&cocoa()))?;
        let surplus = fx.respondent("R-surplus", Some(&cocoa()))?;
        let partial_key = BundleKey::new("farmer", "cocoa", " ");
        let incomplete = fx.respondent("R-incomplete", Some(&partial_key))?;
        let exact_ids = fx.responses(exact, &[40, 30, 20, 10, 0], None, None)?;
        fx.responses(surplus, &[0, 10, 20, 30, 40, 50], None, None)?;
        fx.responses(incomplete, &[0], None, None)?;

        let summary = fx.engine.link_project(fx.project_id)?;
        assert_eq!(summary.total(), 3);
        assert_eq!(summary.succeeded.len(), 1);
        assert_eq!(summary.skipped.len(), 2);
        assert!(summary.failed.is_empty());

        let linked = &summary.succeeded[0].result;
        assert_eq!(linked.linked, 5);
        assert_eq!(linked.unmatched_tail, 0);
        let surplus_skip = summary
            .skipped
            .iter()
            .find(|skip| skip.entity_id == surplus.to_string())
            .ok_or_else(|| anyhow!("surplus respondent should be skipped"))?;
        assert!(surplus_skip.reason.contains("count mismatch"));

        let timeline = fx.store.list_respondent_responses(exact)?;
        let question_ids = fx.questions.iter().map(|q| q.question_id).collect::<Vec<_>>();
        for (offset_rank, response_id) in exact_ids.iter().rev().enumerate() {
            let response = timeline
                .iter()
                .find(|response| response.response_id == *response_id)
                .ok_or_else(|| anyhow!("response should still exist"))?;
            assert_eq!(response.question_id, Some(question_ids[offset_rank]));
        }

        let rerun = fx.engine.link_respondent(fx.project_id, exact)?;
        assert_eq!(rerun.writes, 0);
        assert_eq!(rerun.already_linked, 5);
        Ok(())
    }

    #[test]
    fn link_project_reports_a_locked_respondent_as_failed_without_stopping_others() -> Result<()> {
        let mut fx = Fixture::new(&["Q1", "Q2", "Q3"])?;
        let free = fx.respondent("R-free", Some(&cocoa()))?;
        let locked = fx.respondent("R-locked", Some(&cocoa()))?;
        let surplus = fx.respondent("R-surplus", Some(&cocoa()))?;
        fx.responses(free, &[0, 10, 20], None, None)?;
        fx.responses(locked, &[0, 10, 20], None, None)?;
        fx.responses(surplus, &[0, 10, 20, 30], None, None)?;

        let scope = respondent_lock_scope(locked);
        assert!(fx.store.try_acquire_lock(&scope, "field-sync", Duration::from_secs(900))?);

        let summary = fx.engine.link_project(fx.project_id)?;
        assert_eq!(summary.total(), 3);
        assert_eq!(summary.succeeded.len(), 1);
        assert_eq!(summary.succeeded[0].entity_id, free.to_string());
        assert_eq!(summary.skipped.len(), 1);
        assert_eq!(summary.skipped[0].entity_id, surplus.to_string());
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].entity_id, locked.to_string());
        assert!(summary.failed[0].reason.contains("is held by field-sync"));
        assert!(fx.store.list_respondent_responses(locked)?.iter().all(Response::is_orphan));

        fx.store.release_lock(&scope, "field-sync")?;
        let retried = fx.engine.link_respondent(fx.project_id, locked)?;
        assert_eq!(retried.linked, 3);
        Ok(())
    }

    #[test]
    fn anomaly_propose_then_commit_restores_count_match() -> Result<()> {
        let mut fx = Fixture::new(&["Q1", "Q2", "Q3", "Q4"])?;
        let respondent = fx.respondent("R-gap", Some(&cocoa()))?;
        let ids = fx.responses(respondent, &[0, 10, 22, 6_082, 6_093], None, None)?;

        let proposal = fx.engine.propose_anomalies(fx.project_id, respondent)?;
        assert_eq!(proposal.removals.len(), 1);
        assert_eq!(proposal.removals[0].response_id, ids[3]);
        let stored = fx.engine.proposal_show(proposal.proposal_id)?;
        assert_eq!(stored.status, ProposalStatus::Pending);

        let commit = fx.engine.commit_anomaly_proposal(proposal.proposal_id, "ops@example.org")?;
        assert_eq!(commit.removed, 1);
        assert_eq!(commit.orphans_after, 4);
        assert_eq!(commit.open_slots, 4);
        assert_eq!(
            fx.engine.proposal_show(proposal.proposal_id)?.status,
            ProposalStatus::Committed
        );

        let linked = fx.engine.link_respondent(fx.project_id, respondent)?;
        assert_eq!(linked.linked, 4);
        assert!(!linked.count_mismatch);
        Ok(())
    }

    #[test]
    fn anomaly_commit_aborts_when_timeline_changed() -> Result<()> {
        let mut fx = Fixture::new(&["Q1", "Q2", "Q3", "Q4"])?;
        let respondent = fx.respondent("R-gap", Some(&cocoa()))?;
        fx.responses(respondent, &[0, 10, 22, 6_082, 6_093], None, None)?;
        let proposal = fx.engine.propose_anomalies(fx.project_id, respondent)?;

        fx.responses(respondent, &[7_000], None, None)?;
        let Err(err) = fx.engine.commit_anomaly_proposal(proposal.proposal_id, "ops@example.org")
        else {
            return Err(anyhow!("commit should fail re-validation"));
        };
        assert!(matches!(
            err.downcast_ref::<ReconcileError>(),
            Some(ReconcileError::PreconditionRevalidationFailed(_))
        ));
        assert_eq!(fx.engine.proposal_show(proposal.proposal_id)?.status, ProposalStatus::Aborted);
        assert_eq!(fx.store.list_respondent_responses(respondent)?.len(), 6);
        Ok(())
    }

    #[test]
    fn dedup_run_records_a_proposal_and_deletes_only_on_commit() -> Result<()> {
        let fx = Fixture::new(&["Age?", "Age?", "Gender?", "Age?"])?;

        let dry = fx.engine.dedup(fx.project_id, true)?;
        assert_eq!(dry.would_remove, 2);
        assert_eq!(dry.proposal_id, None);
        assert_eq!(fx.store.list_questions(fx.project_id)?.len(), 4);

        let run = fx.engine.dedup(fx.project_id, false)?;
        assert_eq!(run.would_remove, 2);
        assert_eq!(run.canonical_kept, 2);
        let Some(proposal_id) = run.proposal_id else {
            return Err(anyhow!("a run with duplicates should record a proposal"));
        };
        assert_eq!(fx.store.list_questions(fx.project_id)?.len(), 4);
        assert_eq!(fx.engine.proposal_show(proposal_id)?.status, ProposalStatus::Pending);

        let commit = fx.engine.commit_dedup(proposal_id, "ops@example.org")?;
        assert_eq!(commit.questions_removed, 2);
        let remaining = fx.store.list_questions(fx.project_id)?;
        assert_eq!(
            remaining.iter().map(|q| q.question_id).collect::<Vec<_>>(),
            vec![fx.questions[0].question_id, fx.questions[2].question_id]
        );

        let again = fx.engine.dedup(fx.project_id, false)?;
        assert_eq!(again.would_remove, 0);
        assert_eq!(again.proposal_id, None);
        assert!(again.duplicates.is_empty());
        Ok(())
    }

    #[test]
    fn dedup_proposal_commit_revalidates() -> Result<()> {
        let fx = Fixture::new(&["Age?", "Age?"])?;
        let plan = fx.engine.propose_dedup(fx.project_id)?;
        assert_eq!(plan.duplicates.len(), 1);

        let commit = fx.engine.commit_dedup(plan.proposal_id, "ops@example.org")?;
        assert_eq!(commit.questions_removed, 1);
        assert!(fx.engine.commit_dedup(plan.proposal_id, "ops@example.org").is_err());
        assert!(fx.engine.propose_dedup(fx.project_id)?.is_noop());
        Ok(())
    }

    #[test]
    fn attribution_rank_and_explicit_accept() -> Result<()> {
        let mut fx = Fixture::new(&["Q1", "Q2"])?;
        let collector_id = CollectorId::new();
        let tracked = fx.respondent("R-tracked", Some(&cocoa()))?;
        let historical = fx.respondent("R-historical", Some(&cocoa()))?;
        fx.responses(tracked, &[0, 30], Some(collector_id), Some(&["yes", "4"]))?;
        fx.responses(historical, &[604_800, 604_830], None, Some(&["yes", "4"]))?;

        let summary = fx.engine.rank_attributions(fx.project_id)?;
        assert_eq!(summary.succeeded.len(), 1);
        let ranking = &summary.succeeded[0].result;
        assert_eq!(ranking.respondent_id, historical);
        assert_eq!(ranking.recommended(), Some(collector_id));

        assert!(fx
            .engine
            .accept_attribution(fx.project_id, historical, CollectorId::new(), "ops@example.org")
            .is_err());
        let accepted =
            fx.engine.accept_attribution(fx.project_id, historical, collector_id, "ops@example.org")?;
        assert!(accepted.recommended);

        let after = fx.engine.rank_attributions(fx.project_id)?;
        assert_eq!(after.total(), 0);
        Ok(())
    }

    #[test]
    fn yaml_config_overrides_defaults_and_rejects_unknown_keys() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("survey-reconcile-config-{}", Ulid::new()));
        fs::create_dir_all(&dir)?;
        let good = dir.join("good.yaml");
        fs::write(&good, "anomaly:\n  gap_threshold_secs: 120\nbatch:\n  workers: 2\n")?;
        let config = load_config(Some(&good))?;
        assert!((config.anomaly.gap_threshold_secs - 120.0).abs() < f64::EPSILON);
        assert_eq!(config.batch.workers, 2);
        assert_eq!(config.lock.stale_after_secs, 900);

        let bad = dir.join("bad.yaml");
        fs::write(&bad, "anomaly:\n  gap_threshold: 120\n")?;
        assert!(load_config(Some(&bad)).is_err());

        let misspelled = dir.join("misspelled.yaml");
        fs::write(&misspelled, "attribution:\n  weights:\n    keystroke: 1.0\n")?;
        let Err(err) = load_config(Some(&misspelled)) else {
            return Err(anyhow!("unknown signal weight should be rejected at load time"));
        };
        assert!(format!("{err:#}").contains("keystroke"));

        let invalid = dir.join("invalid.yaml");
        fs::write(&invalid, "batch:\n  workers: 0\n")?;
        assert!(load_config(Some(&invalid)).is_err());

        assert_eq!(load_config(None)?, EngineConfig::default());
        fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
