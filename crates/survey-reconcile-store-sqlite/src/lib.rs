use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use survey_reconcile_core::{
    CollectorId, ConditionalLogic, DeviceFingerprint, DuplicateQuestion, LinkPlan, Project,
    ProjectId, ProposalId, ProposalKind, ProposalStatus, Question, QuestionBank,
    QuestionBankContext, QuestionBankId, QuestionId, RepairProposal, Respondent, RespondentId,
    Response, ResponseId,
};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS projects (
  project_id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  target_categories_json TEXT NOT NULL,
  target_commodities_json TEXT NOT NULL,
  target_countries_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS question_banks (
  question_bank_id TEXT PRIMARY KEY,
  text TEXT NOT NULL,
  category TEXT,
  conditional_json TEXT,
  visibility TEXT NOT NULL CHECK (visibility IN ('owned','public')),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS questions (
  question_id TEXT PRIMARY KEY,
  project_id TEXT NOT NULL,
  text TEXT NOT NULL,
  category TEXT,
  commodity TEXT,
  country TEXT,
  created_at TEXT NOT NULL,
  question_bank_id TEXT,
  conditional_json TEXT,
  FOREIGN KEY (project_id) REFERENCES projects(project_id),
  FOREIGN KEY (question_bank_id) REFERENCES question_banks(question_bank_id)
);

CREATE TABLE IF NOT EXISTS respondents (
  respondent_id TEXT PRIMARY KEY,
  project_id TEXT NOT NULL,
  external_id TEXT NOT NULL,
  category TEXT,
  commodity TEXT,
  country TEXT,
  collector_id TEXT,
  created_by TEXT,
  UNIQUE(project_id, external_id),
  FOREIGN KEY (project_id) REFERENCES projects(project_id)
);

CREATE TABLE IF NOT EXISTS responses (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  response_id TEXT NOT NULL UNIQUE,
  project_id TEXT NOT NULL,
  respondent_id TEXT NOT NULL,
  question_id TEXT,
  value TEXT NOT NULL,
  collected_at TEXT NOT NULL,
  context_json TEXT NOT NULL,
  collector_id TEXT,
  device_json TEXT,
  FOREIGN KEY (project_id) REFERENCES projects(project_id),
  FOREIGN KEY (respondent_id) REFERENCES respondents(respondent_id),
  FOREIGN KEY (question_id) REFERENCES questions(question_id)
);

CREATE TABLE IF NOT EXISTS repair_proposals (
  proposal_id TEXT PRIMARY KEY,
  kind TEXT NOT NULL CHECK (kind IN ('anomaly','dedup')),
  project_id TEXT NOT NULL,
  respondent_id TEXT,
  status TEXT NOT NULL CHECK (status IN ('pending','committed','aborted')),
  proposed_at TEXT NOT NULL,
  resolved_at TEXT,
  resolved_by TEXT,
  proposal_json TEXT NOT NULL,
  FOREIGN KEY (project_id) REFERENCES projects(project_id)
);

CREATE TABLE IF NOT EXISTS attribution_acceptances (
  respondent_id TEXT PRIMARY KEY,
  collector_id TEXT NOT NULL,
  score REAL,
  accepted_by TEXT NOT NULL,
  accepted_at TEXT NOT NULL,
  FOREIGN KEY (respondent_id) REFERENCES respondents(respondent_id)
);

CREATE TABLE IF NOT EXISTS reconcile_locks (
  scope TEXT PRIMARY KEY,
  holder TEXT NOT NULL,
  acquired_at_unix INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_questions_project ON questions(project_id, created_at);
CREATE INDEX IF NOT EXISTS idx_respondents_project ON respondents(project_id);
CREATE INDEX IF NOT EXISTS idx_responses_respondent ON responses(respondent_id);
CREATE INDEX IF NOT EXISTS idx_responses_question ON responses(question_id);
CREATE INDEX IF NOT EXISTS idx_repair_proposals_project ON repair_proposals(project_id, status);
";

const RESPONSE_COLUMNS: &str = "seq, response_id, project_id, respondent_id, question_id, value,
    collected_at, context_json, collector_id, device_json";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub projects: usize,
    pub question_banks: usize,
    pub questions: usize,
    pub respondents: usize,
    pub responses: usize,
}

/// A persisted repair proposal with its lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredProposal {
    pub status: ProposalStatus,
    pub resolved_at: Option<String>,
    pub resolved_by: Option<String>,
    #[serde(flatten)]
    pub proposal: RepairProposal,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DedupApplied {
    pub questions_removed: usize,
    pub responses_repointed: usize,
}

/// Marks the proposal a mutation resolves and who approved it.
#[derive(Debug, Clone, Copy)]
pub struct Resolution<'a> {
    pub proposal_id: ProposalId,
    pub operator: &'a str,
}

#[must_use]
pub fn respondent_lock_scope(respondent_id: RespondentId) -> String {
    format!("respondent:{respondent_id}")
}

#[must_use]
pub fn project_lock_scope(project_id: ProjectId) -> String {
    format!("project:{project_id}")
}

impl SqliteStore {
    /// Open a SQLite-backed reconciliation store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version == 0 {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            debug!(version = 1, "applied schema migration");
            return Ok(());
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// # Errors
    /// Returns an error when validation fails or the insert is rejected.
    pub fn insert_project(&mut self, project: &Project) -> Result<()> {
        insert_project_row(&self.conn, project)
    }

    /// # Errors
    /// Returns an error when the insert is rejected.
    pub fn insert_question_bank(&mut self, bank: &QuestionBank) -> Result<()> {
        insert_question_bank_row(&self.conn, bank)
    }

    /// # Errors
    /// Returns an error when validation fails or the insert is rejected.
    pub fn insert_question(&mut self, question: &Question) -> Result<()> {
        insert_question_row(&self.conn, question)
    }

    /// # Errors
    /// Returns an error when validation fails or the insert is rejected.
    pub fn insert_respondent(&mut self, respondent: &Respondent) -> Result<()> {
        insert_respondent_row(&self.conn, respondent)
    }

    /// Insert one response and return its store sequence.
    ///
    /// The sequence is assigned by the store in insertion order; any value carried
    /// on `response` is ignored.
    ///
    /// # Errors
    /// Returns an error when the insert is rejected.
    pub fn insert_response(&mut self, response: &Response) -> Result<i64> {
        insert_response_row(&self.conn, response)
    }

    /// # Errors
    /// Returns an error when the lookup or decoding fails.
    pub fn get_project(&self, project_id: ProjectId) -> Result<Option<Project>> {
        let mut stmt = self.conn.prepare(
            "SELECT project_id, name, target_categories_json, target_commodities_json,
                    target_countries_json, created_at
             FROM projects WHERE project_id = ?1",
        )?;
        let mut rows = stmt.query(params![project_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(Project {
                project_id: ProjectId(parse_ulid(&row.get::<_, String>(0)?)?),
                name: row.get(1)?,
                target_categories: parse_json_set(&row.get::<_, String>(2)?)?,
                target_commodities: parse_json_set(&row.get::<_, String>(3)?)?,
                target_countries: parse_json_set(&row.get::<_, String>(4)?)?,
                created_at: parse_rfc3339(&row.get::<_, String>(5)?)?,
            })),
            None => Ok(None),
        }
    }

    /// Like [`SqliteStore::get_project`], but a missing project is an error.
    ///
    /// # Errors
    /// Returns an error when the project does not exist or cannot be read.
    pub fn require_project(&self, project_id: ProjectId) -> Result<Project> {
        self.get_project(project_id)?.ok_or_else(|| anyhow!("project not found: {project_id}"))
    }

    /// Questions of one project in catalog order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_questions(&self, project_id: ProjectId) -> Result<Vec<Question>> {
        let mut stmt = self.conn.prepare(
            "SELECT question_id, project_id, text, category, commodity, country, created_at,
                    question_bank_id, conditional_json
             FROM questions WHERE project_id = ?1
             ORDER BY created_at ASC, question_id ASC",
        )?;
        let mut rows = stmt.query(params![project_id.to_string()])?;
        let mut questions = Vec::new();
        while let Some(row) = rows.next()? {
            questions.push(read_question(row)?);
        }
        questions.sort_by(Question::catalog_cmp);
        Ok(questions)
    }

    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_respondents(&self, project_id: ProjectId) -> Result<Vec<Respondent>> {
        let mut stmt = self.conn.prepare(
            "SELECT respondent_id, project_id, external_id, category, commodity, country,
                    collector_id, created_by
             FROM respondents WHERE project_id = ?1
             ORDER BY respondent_id ASC",
        )?;
        let mut rows = stmt.query(params![project_id.to_string()])?;
        let mut respondents = Vec::new();
        while let Some(row) = rows.next()? {
            respondents.push(read_respondent(row)?);
        }
        Ok(respondents)
    }

    /// # Errors
    /// Returns an error when the lookup or decoding fails.
    pub fn get_respondent(&self, respondent_id: RespondentId) -> Result<Option<Respondent>> {
        let mut stmt = self.conn.prepare(
            "SELECT respondent_id, project_id, external_id, category, commodity, country,
                    collector_id, created_by
             FROM respondents WHERE respondent_id = ?1",
        )?;
        let mut rows = stmt.query(params![respondent_id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_respondent(row)?)),
            None => Ok(None),
        }
    }

    /// Every response of a project, in store insertion order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_responses(&self, project_id: ProjectId) -> Result<Vec<Response>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RESPONSE_COLUMNS} FROM responses WHERE project_id = ?1 ORDER BY seq ASC"
        ))?;
        let mut rows = stmt.query(params![project_id.to_string()])?;
        let mut responses = Vec::new();
        while let Some(row) = rows.next()? {
            responses.push(read_response(row)?);
        }
        Ok(responses)
    }

    /// One respondent's responses, in store insertion order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_respondent_responses(&self, respondent_id: RespondentId) -> Result<Vec<Response>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RESPONSE_COLUMNS} FROM responses WHERE respondent_id = ?1 ORDER BY seq ASC"
        ))?;
        let mut rows = stmt.query(params![respondent_id.to_string()])?;
        let mut responses = Vec::new();
        while let Some(row) = rows.next()? {
            responses.push(read_response(row)?);
        }
        Ok(responses)
    }

    /// Write the planned links in one transaction.
    ///
    /// Each update only touches a response that is still unlinked, so applying the same
    /// plan twice writes nothing the second time. Returns the number of rows written.
    ///
    /// # Errors
    /// Returns an error when serialization or any write in the transaction fails.
    pub fn apply_link_plan(&mut self, plan: &LinkPlan) -> Result<usize> {
        let tx = self.conn.transaction().context("failed to start link transaction")?;
        let mut writes = 0;
        for link in &plan.links {
            let changed = match &link.backfill {
                Some(context) => tx.execute(
                    "UPDATE responses SET question_id = ?1, context_json = ?2
                     WHERE response_id = ?3 AND question_id IS NULL",
                    params![
                        link.question_id.to_string(),
                        serde_json::to_string(context)
                            .context("failed to serialize backfilled context")?,
                        link.response_id.to_string(),
                    ],
                ),
                None => tx.execute(
                    "UPDATE responses SET question_id = ?1
                     WHERE response_id = ?2 AND question_id IS NULL",
                    params![link.question_id.to_string(), link.response_id.to_string()],
                ),
            }
            .with_context(|| format!("failed to link response {}", link.response_id))?;
            writes += changed;
        }
        tx.commit().context("failed to commit link transaction")?;
        debug!(respondent_id = %plan.respondent_id, writes, "applied link plan");
        Ok(writes)
    }

    /// Persist a pending repair proposal.
    ///
    /// # Errors
    /// Returns an error when serialization or the insert fails.
    pub fn save_proposal(&mut self, proposal: &RepairProposal) -> Result<()> {
        let (respondent_id, proposed_at) = match proposal {
            RepairProposal::Anomaly(anomaly) => {
                (Some(anomaly.respondent_id.to_string()), anomaly.proposed_at)
            }
            RepairProposal::Dedup(plan) => (None, plan.proposed_at),
        };
        self.conn
            .execute(
                "INSERT INTO repair_proposals(
                    proposal_id, kind, project_id, respondent_id, status, proposed_at, proposal_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    proposal.proposal_id().to_string(),
                    proposal.kind().as_str(),
                    proposal.project_id().to_string(),
                    respondent_id,
                    ProposalStatus::Pending.as_str(),
                    rfc3339(proposed_at)?,
                    serde_json::to_string(proposal).context("failed to serialize proposal")?,
                ],
            )
            .context("failed to persist repair proposal")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when lookup or JSON deserialization fails.
    pub fn get_proposal(&self, proposal_id: ProposalId) -> Result<Option<StoredProposal>> {
        let mut stmt = self.conn.prepare(
            "SELECT kind, status, resolved_at, resolved_by, proposal_json
             FROM repair_proposals WHERE proposal_id = ?1",
        )?;
        let mut rows = stmt.query(params![proposal_id.to_string()])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        let kind_raw: String = row.get(0)?;
        let status_raw: String = row.get(1)?;
        let json: String = row.get(4)?;
        let kind = ProposalKind::parse(&kind_raw)
            .ok_or_else(|| anyhow!("unknown proposal kind: {kind_raw}"))?;
        let proposal: RepairProposal =
            serde_json::from_str(&json).context("failed to deserialize stored proposal")?;
        if proposal.kind() != kind {
            return Err(anyhow!(
                "stored proposal {proposal_id} has kind {kind_raw} but payload {}",
                proposal.kind().as_str()
            ));
        }

        Ok(Some(StoredProposal {
            status: ProposalStatus::parse(&status_raw)
                .ok_or_else(|| anyhow!("unknown proposal status: {status_raw}"))?,
            resolved_at: row.get(2)?,
            resolved_by: row.get(3)?,
            proposal,
        }))
    }

    /// Mark a pending proposal aborted without touching any other record.
    ///
    /// # Errors
    /// Returns an error when the proposal is not pending or the update fails.
    pub fn abort_proposal(&mut self, proposal_id: ProposalId, operator: &str) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start abort transaction")?;
        resolve_proposal(
            &tx,
            Resolution { proposal_id, operator },
            ProposalStatus::Aborted,
        )?;
        tx.commit().context("failed to commit abort transaction")?;
        Ok(())
    }

    /// Delete the given orphan responses and mark the proposal committed, atomically.
    ///
    /// Fails without deleting anything when any response is gone or has been linked.
    ///
    /// # Errors
    /// Returns an error when a response no longer qualifies, the proposal is not
    /// pending, or any write fails.
    pub fn commit_response_removals(
        &mut self,
        response_ids: &[ResponseId],
        resolution: Resolution<'_>,
    ) -> Result<usize> {
        let tx = self.conn.transaction().context("failed to start removal transaction")?;
        let mut removed = 0;
        for response_id in response_ids {
            let changed = tx
                .execute(
                    "DELETE FROM responses WHERE response_id = ?1 AND question_id IS NULL",
                    params![response_id.to_string()],
                )
                .with_context(|| format!("failed to delete response {response_id}"))?;
            if changed == 0 {
                return Err(anyhow!("response {response_id} is missing or already linked"));
            }
            removed += changed;
        }
        resolve_proposal(&tx, resolution, ProposalStatus::Committed)?;
        tx.commit().context("failed to commit removal transaction")?;
        info!(proposal_id = %resolution.proposal_id, removed, "committed response removals");
        Ok(removed)
    }

    /// Re-point responses from each duplicate to its canonical question, then delete
    /// the duplicate. The proposal is marked committed in the same transaction.
    ///
    /// # Errors
    /// Returns an error when a duplicate no longer exists, the proposal is not pending,
    /// or any write fails.
    pub fn apply_dedup(
        &mut self,
        duplicates: &[DuplicateQuestion],
        resolution: Resolution<'_>,
    ) -> Result<DedupApplied> {
        let tx = self.conn.transaction().context("failed to start dedup transaction")?;
        let mut applied = DedupApplied::default();
        for duplicate in duplicates {
            applied.responses_repointed += tx
                .execute(
                    "UPDATE responses SET question_id = ?1 WHERE question_id = ?2",
                    params![
                        duplicate.canonical_question_id.to_string(),
                        duplicate.question_id.to_string()
                    ],
                )
                .with_context(|| {
                    format!("failed to re-point responses from question {}", duplicate.question_id)
                })?;
            let removed = tx
                .execute(
                    "DELETE FROM questions WHERE question_id = ?1",
                    params![duplicate.question_id.to_string()],
                )
                .with_context(|| format!("failed to delete question {}", duplicate.question_id))?;
            if removed == 0 {
                return Err(anyhow!("question {} no longer exists", duplicate.question_id));
            }
            applied.questions_removed += removed;
        }
        resolve_proposal(&tx, resolution, ProposalStatus::Committed)?;
        tx.commit().context("failed to commit dedup transaction")?;
        Ok(applied)
    }

    /// Record an explicitly accepted attribution and set the respondent's collector.
    ///
    /// # Errors
    /// Returns an error when the operator is blank, the respondent already has a
    /// collector, or any write fails.
    pub fn accept_attribution(
        &mut self,
        respondent_id: RespondentId,
        collector_id: CollectorId,
        score: Option<f64>,
        operator: &str,
    ) -> Result<()> {
        if operator.trim().is_empty() {
            return Err(anyhow!("operator MUST be provided for every attribution"));
        }

        let tx = self.conn.transaction().context("failed to start attribution transaction")?;
        let changed = tx
            .execute(
                "UPDATE respondents SET collector_id = ?1
                 WHERE respondent_id = ?2 AND collector_id IS NULL",
                params![collector_id.to_string(), respondent_id.to_string()],
            )
            .context("failed to set respondent collector")?;
        if changed == 0 {
            return Err(anyhow!(
                "respondent {respondent_id} does not exist or already has a collector"
            ));
        }
        tx.execute(
            "INSERT INTO attribution_acceptances(
                respondent_id, collector_id, score, accepted_by, accepted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                respondent_id.to_string(),
                collector_id.to_string(),
                score,
                operator,
                now_rfc3339()?,
            ],
        )
        .context("failed to record attribution acceptance")?;
        tx.commit().context("failed to commit attribution transaction")?;
        Ok(())
    }

    /// Try to take the named lock. Returns `false` when another holder has it.
    ///
    /// A lock older than `stale_after` is treated as abandoned and reclaimed.
    ///
    /// # Errors
    /// Returns an error when the lock table cannot be read or written.
    pub fn try_acquire_lock(
        &mut self,
        scope: &str,
        holder: &str,
        stale_after: Duration,
    ) -> Result<bool> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let stale_secs = i64::try_from(stale_after.as_secs()).unwrap_or(i64::MAX);
        let cutoff = now.saturating_sub(stale_secs);

        let tx = self.conn.transaction().context("failed to start lock transaction")?;
        let reclaimed = tx
            .execute(
                "DELETE FROM reconcile_locks WHERE scope = ?1 AND acquired_at_unix < ?2",
                params![scope, cutoff],
            )
            .context("failed to reclaim stale lock")?;
        if reclaimed > 0 {
            warn!(scope, "reclaimed stale reconcile lock");
        }
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO reconcile_locks(scope, holder, acquired_at_unix)
                 VALUES (?1, ?2, ?3)",
                params![scope, holder, now],
            )
            .context("failed to insert reconcile lock")?;
        tx.commit().context("failed to commit lock transaction")?;
        Ok(inserted == 1)
    }

    /// # Errors
    /// Returns an error when the delete fails.
    pub fn release_lock(&mut self, scope: &str, holder: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM reconcile_locks WHERE scope = ?1 AND holder = ?2",
                params![scope, holder],
            )
            .with_context(|| format!("failed to release lock {scope}"))?;
        Ok(())
    }

    /// Run `work` while holding the named lock, releasing it on every exit path.
    ///
    /// # Errors
    /// Returns an error when the lock is held elsewhere, when `work` fails, or when the
    /// lock cannot be released.
    pub fn with_lock<T>(
        &mut self,
        scope: &str,
        holder: &str,
        stale_after: Duration,
        work: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        if !self.try_acquire_lock(scope, holder, stale_after)? {
            let current = self
                .conn
                .query_row(
                    "SELECT holder FROM reconcile_locks WHERE scope = ?1",
                    params![scope],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
                .unwrap_or_default();
            return Err(anyhow!("lock {scope} is held by {current}"));
        }

        let outcome = work(self);
        let released = self.release_lock(scope, holder);
        let value = outcome?;
        released?;
        Ok(value)
    }

    /// Import NDJSON files from `in_dir` in one transaction.
    ///
    /// Recognized files are `projects`, `question_banks`, `questions`, `respondents`
    /// and `responses` with an `.ndjson` extension; missing files are skipped.
    ///
    /// # Errors
    /// Returns an error when migration, parsing, validation or any insert fails.
    pub fn import_ndjson(&mut self, in_dir: &Path) -> Result<ImportSummary> {
        self.migrate()?;
        let projects = read_optional_ndjson::<Project>(&in_dir.join("projects.ndjson"))?;
        let banks = read_optional_ndjson::<QuestionBank>(&in_dir.join("question_banks.ndjson"))?;
        let questions = read_optional_ndjson::<Question>(&in_dir.join("questions.ndjson"))?;
        let respondents = read_optional_ndjson::<Respondent>(&in_dir.join("respondents.ndjson"))?;
        let responses = read_optional_ndjson::<Response>(&in_dir.join("responses.ndjson"))?;

        let tx = self.conn.transaction().context("failed to start import transaction")?;
        for project in &projects {
            insert_project_row(&tx, project)?;
        }
        for bank in &banks {
            insert_question_bank_row(&tx, bank)?;
        }
        for question in &questions {
            insert_question_row(&tx, question)?;
        }
        for respondent in &respondents {
            insert_respondent_row(&tx, respondent)?;
        }
        for response in &responses {
            insert_response_row(&tx, response)?;
        }
        tx.commit().context("failed to commit import transaction")?;

        let summary = ImportSummary {
            projects: projects.len(),
            question_banks: banks.len(),
            questions: questions.len(),
            respondents: respondents.len(),
            responses: responses.len(),
        };
        info!(
            projects = summary.projects,
            questions = summary.questions,
            respondents = summary.respondents,
            responses = summary.responses,
            "imported ndjson snapshot"
        );
        Ok(summary)
    }
}

fn insert_project_row(conn: &Connection, project: &Project) -> Result<()> {
    project.validate().context("project validation failed")?;
    conn.execute(
        "INSERT INTO projects(
            project_id, name, target_categories_json, target_commodities_json,
            target_countries_json, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            project.project_id.to_string(),
            project.name,
            serde_json::to_string(&project.target_categories)?,
            serde_json::to_string(&project.target_commodities)?,
            serde_json::to_string(&project.target_countries)?,
            rfc3339(project.created_at)?,
        ],
    )
    .with_context(|| format!("failed to insert project {}", project.project_id))?;
    Ok(())
}

fn insert_question_bank_row(conn: &Connection, bank: &QuestionBank) -> Result<()> {
    conn.execute(
        "INSERT INTO question_banks(
            question_bank_id, text, category, conditional_json, visibility, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            bank.question_bank_id.to_string(),
            bank.text,
            bank.category,
            bank.conditional.as_ref().map(serde_json::to_string).transpose()?,
            bank.visibility.as_str(),
            rfc3339(bank.created_at)?,
        ],
    )
    .with_context(|| format!("failed to insert question bank {}", bank.question_bank_id))?;
    Ok(())
}

fn insert_question_row(conn: &Connection, question: &Question) -> Result<()> {
    question.validate().context("question validation failed")?;
    conn.execute(
        "INSERT INTO questions(
            question_id, project_id, text, category, commodity, country, created_at,
            question_bank_id, conditional_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            question.question_id.to_string(),
            question.project_id.to_string(),
            question.text,
            question.category,
            question.commodity,
            question.country,
            rfc3339(question.created_at)?,
            question.question_bank_id.map(|id| id.to_string()),
            question.conditional.as_ref().map(serde_json::to_string).transpose()?,
        ],
    )
    .with_context(|| format!("failed to insert question {}", question.question_id))?;
    Ok(())
}

fn insert_respondent_row(conn: &Connection, respondent: &Respondent) -> Result<()> {
    respondent.validate().context("respondent validation failed")?;
    conn.execute(
        "INSERT INTO respondents(
            respondent_id, project_id, external_id, category, commodity, country,
            collector_id, created_by
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            respondent.respondent_id.to_string(),
            respondent.project_id.to_string(),
            respondent.external_id,
            respondent.category,
            respondent.commodity,
            respondent.country,
            respondent.collector_id.map(|id| id.to_string()),
            respondent.created_by,
        ],
    )
    .with_context(|| format!("failed to insert respondent {}", respondent.respondent_id))?;
    Ok(())
}

fn insert_response_row(conn: &Connection, response: &Response) -> Result<i64> {
    conn.execute(
        "INSERT INTO responses(
            response_id, project_id, respondent_id, question_id, value, collected_at,
            context_json, collector_id, device_json
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            response.response_id.to_string(),
            response.project_id.to_string(),
            response.respondent_id.to_string(),
            response.question_id.map(|id| id.to_string()),
            response.value,
            rfc3339(response.collected_at)?,
            serde_json::to_string(&response.context)?,
            response.collector_id.map(|id| id.to_string()),
            response.device.as_ref().map(serde_json::to_string).transpose()?,
        ],
    )
    .with_context(|| format!("failed to insert response {}", response.response_id))?;
    Ok(conn.last_insert_rowid())
}

fn resolve_proposal(
    conn: &Connection,
    resolution: Resolution<'_>,
    status: ProposalStatus,
) -> Result<()> {
    if resolution.operator.trim().is_empty() {
        return Err(anyhow!("operator MUST be provided to resolve a proposal"));
    }
    let changed = conn
        .execute(
            "UPDATE repair_proposals SET status = ?1, resolved_at = ?2, resolved_by = ?3
             WHERE proposal_id = ?4 AND status = 'pending'",
            params![
                status.as_str(),
                now_rfc3339()?,
                resolution.operator,
                resolution.proposal_id.to_string(),
            ],
        )
        .context("failed to update proposal status")?;
    if changed == 0 {
        return Err(anyhow!("proposal {} is not pending", resolution.proposal_id));
    }
    Ok(())
}

fn read_question(row: &Row<'_>) -> Result<Question> {
    let bank_raw: Option<String> = row.get(7)?;
    Ok(Question {
        question_id: QuestionId(parse_ulid(&row.get::<_, String>(0)?)?),
        project_id: ProjectId(parse_ulid(&row.get::<_, String>(1)?)?),
        text: row.get(2)?,
        category: row.get(3)?,
        commodity: row.get(4)?,
        country: row.get(5)?,
        created_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
        question_bank_id: bank_raw.as_deref().map(parse_ulid).transpose()?.map(QuestionBankId),
        conditional: parse_optional_json::<ConditionalLogic>(row.get(8)?)?,
    })
}

fn read_respondent(row: &Row<'_>) -> Result<Respondent> {
    let collector_raw: Option<String> = row.get(6)?;
    Ok(Respondent {
        respondent_id: RespondentId(parse_ulid(&row.get::<_, String>(0)?)?),
        project_id: ProjectId(parse_ulid(&row.get::<_, String>(1)?)?),
        external_id: row.get(2)?,
        category: row.get(3)?,
        commodity: row.get(4)?,
        country: row.get(5)?,
        collector_id: collector_raw.as_deref().map(parse_ulid).transpose()?.map(CollectorId),
        created_by: row.get(7)?,
    })
}

fn read_response(row: &Row<'_>) -> Result<Response> {
    let question_raw: Option<String> = row.get(4)?;
    let collector_raw: Option<String> = row.get(8)?;
    let context_json: String = row.get(7)?;
    Ok(Response {
        sequence: row.get(0)?,
        response_id: ResponseId(parse_ulid(&row.get::<_, String>(1)?)?),
        project_id: ProjectId(parse_ulid(&row.get::<_, String>(2)?)?),
        respondent_id: RespondentId(parse_ulid(&row.get::<_, String>(3)?)?),
        question_id: question_raw.as_deref().map(parse_ulid).transpose()?.map(QuestionId),
        value: row.get(5)?,
        collected_at: parse_rfc3339(&row.get::<_, String>(6)?)?,
        context: serde_json::from_str::<QuestionBankContext>(&context_json)
            .context("failed to deserialize response context")?,
        collector_id: collector_raw.as_deref().map(parse_ulid).transpose()?.map(CollectorId),
        device: parse_optional_json::<DeviceFingerprint>(row.get(9)?)?,
    })
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}

fn parse_json_set(raw: &str) -> Result<BTreeSet<String>> {
    serde_json::from_str(raw).context("failed to deserialize JSON string set")
}

fn parse_optional_json<T: DeserializeOwned>(raw: Option<String>) -> Result<Option<T>> {
    raw.map(|json| serde_json::from_str(&json).context("failed to deserialize JSON column"))
        .transpose()
}

fn read_optional_ndjson<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        debug!(path = %path.display(), "ndjson file not present; skipping");
        return Ok(Vec::new());
    }
    read_ndjson_file(path)
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}
