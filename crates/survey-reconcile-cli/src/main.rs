use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use survey_reconcile_api::{load_config, ReconcileEngine, API_CONTRACT_VERSION};
use survey_reconcile_core::{CollectorId, ProjectId, ProposalId, RespondentId};
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "srx")]
#[command(about = "Survey response attribution and reconciliation")]
struct Cli {
    #[arg(long, global = true, default_value = "./survey_reconcile.sqlite3")]
    db: PathBuf,

    /// YAML engine settings; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, short, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Bundles {
        #[command(subcommand)]
        command: BundlesCommand,
    },
    Link {
        #[command(subcommand)]
        command: LinkCommand,
    },
    Anomaly {
        #[command(subcommand)]
        command: AnomalyCommand,
    },
    Attribution {
        #[command(subcommand)]
        command: AttributionCommand,
    },
    Dedup {
        #[command(subcommand)]
        command: DedupCommand,
    },
    Proposal {
        #[command(subcommand)]
        command: ProposalCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DryRunArgs),
    Import(ImportArgs),
}

#[derive(Debug, Subcommand)]
enum BundlesCommand {
    Resolve(ProjectArgs),
}

#[derive(Debug, Subcommand)]
enum LinkCommand {
    Respondent(RespondentArgs),
    Project(ProjectArgs),
}

#[derive(Debug, Subcommand)]
enum AnomalyCommand {
    Propose(RespondentArgs),
    Scan(ProjectArgs),
    Commit(CommitArgs),
}

#[derive(Debug, Subcommand)]
enum AttributionCommand {
    Rank(ProjectArgs),
    Accept(AcceptArgs),
}

#[derive(Debug, Subcommand)]
enum DedupCommand {
    Run(DedupRunArgs),
    Propose(ProjectArgs),
    Commit(CommitArgs),
}

#[derive(Debug, Subcommand)]
enum ProposalCommand {
    Show(ProposalArgs),
}

#[derive(Debug, Args)]
struct DryRunArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct ImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct ProjectArgs {
    #[arg(long)]
    project: String,
}

#[derive(Debug, Args)]
struct RespondentArgs {
    #[arg(long)]
    project: String,
    #[arg(long)]
    respondent: String,
}

#[derive(Debug, Args)]
struct ProposalArgs {
    #[arg(long)]
    proposal_id: String,
}

#[derive(Debug, Args)]
struct CommitArgs {
    #[arg(long)]
    proposal_id: String,
    #[arg(long)]
    operator: String,
}

#[derive(Debug, Args)]
struct AcceptArgs {
    #[arg(long)]
    project: String,
    #[arg(long)]
    respondent: String,
    #[arg(long)]
    collector: String,
    #[arg(long)]
    operator: String,
}

#[derive(Debug, Args)]
struct DedupRunArgs {
    #[arg(long)]
    project: String,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            object.insert(
                "api_contract_version".to_string(),
                Value::String(API_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "api_contract_version": API_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn emit<T: Serialize>(value: &T) -> Result<()> {
    emit_json(serde_json::to_value(value)?)
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(cli.config.as_deref())?;
    debug!(db = %cli.db.display(), "opening reconcile engine");
    let engine = ReconcileEngine::new(cli.db, config)?;
    match cli.command {
        Command::Db { command } => run_db(command, &engine),
        Command::Bundles { command } => run_bundles(command, &engine),
        Command::Link { command } => run_link(command, &engine),
        Command::Anomaly { command } => run_anomaly(command, &engine),
        Command::Attribution { command } => run_attribution(command, &engine),
        Command::Dedup { command } => run_dedup(command, &engine),
        Command::Proposal { command } => run_proposal(command, &engine),
    }
}

fn run_db(command: DbCommand, engine: &ReconcileEngine) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = engine.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => emit(&engine.migrate(args.dry_run)?),
        DbCommand::Import(args) => emit(&engine.import(&args.input)?),
    }
}

fn run_bundles(command: BundlesCommand, engine: &ReconcileEngine) -> Result<()> {
    match command {
        BundlesCommand::Resolve(args) => {
            let resolution = engine.resolve_bundles(ProjectId::parse(&args.project)?)?;
            emit(&resolution)
        }
    }
}

fn run_link(command: LinkCommand, engine: &ReconcileEngine) -> Result<()> {
    match command {
        LinkCommand::Respondent(args) => {
            let summary = engine.link_respondent(
                ProjectId::parse(&args.project)?,
                RespondentId::parse(&args.respondent)?,
            )?;
            emit(&summary)
        }
        LinkCommand::Project(args) => emit(&engine.link_project(ProjectId::parse(&args.project)?)?),
    }
}

fn run_anomaly(command: AnomalyCommand, engine: &ReconcileEngine) -> Result<()> {
    match command {
        AnomalyCommand::Propose(args) => {
            let proposal = engine.propose_anomalies(
                ProjectId::parse(&args.project)?,
                RespondentId::parse(&args.respondent)?,
            )?;
            emit_json(serde_json::json!({
                "persisted": proposal.is_actionable(),
                "proposal": proposal
            }))
        }
        AnomalyCommand::Scan(args) => {
            emit(&engine.scan_project_anomalies(ProjectId::parse(&args.project)?)?)
        }
        AnomalyCommand::Commit(args) => {
            let commit = engine
                .commit_anomaly_proposal(ProposalId::parse(&args.proposal_id)?, &args.operator)?;
            emit(&commit)
        }
    }
}

fn run_attribution(command: AttributionCommand, engine: &ReconcileEngine) -> Result<()> {
    match command {
        AttributionCommand::Rank(args) => {
            emit(&engine.rank_attributions(ProjectId::parse(&args.project)?)?)
        }
        AttributionCommand::Accept(args) => {
            let acceptance = engine.accept_attribution(
                ProjectId::parse(&args.project)?,
                RespondentId::parse(&args.respondent)?,
                CollectorId::parse(&args.collector)?,
                &args.operator,
            )?;
            emit(&acceptance)
        }
    }
}

fn run_dedup(command: DedupCommand, engine: &ReconcileEngine) -> Result<()> {
    match command {
        DedupCommand::Run(args) => {
            emit(&engine.dedup(ProjectId::parse(&args.project)?, args.dry_run)?)
        }
        DedupCommand::Propose(args) => {
            let plan = engine.propose_dedup(ProjectId::parse(&args.project)?)?;
            emit_json(serde_json::json!({
                "persisted": !plan.is_noop(),
                "proposal": plan
            }))
        }
        DedupCommand::Commit(args) => {
            let commit =
                engine.commit_dedup(ProposalId::parse(&args.proposal_id)?, &args.operator)?;
            emit(&commit)
        }
    }
}

fn run_proposal(command: ProposalCommand, engine: &ReconcileEngine) -> Result<()> {
    match command {
        ProposalCommand::Show(args) => {
            emit(&engine.proposal_show(ProposalId::parse(&args.proposal_id)?)?)
        }
    }
}
