use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use entity_kernel_api::{ApiConfig, ReconciliationApi, API_CONTRACT_VERSION};
use entity_kernel_core::{KindRegistry, RecordDraft};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const DEFAULT_LOG_FILTER: &str = "warn";

#[derive(Debug, Parser)]
#[command(name = "ek")]
#[command(about = "Entity Kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./entity_kernel.sqlite3")]
    db: PathBuf,

    /// YAML file with engine and API settings.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Tracing filter directive; overrides `RUST_LOG`.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Entity {
        #[command(subcommand)]
        command: Box<EntityCommand>,
    },
    Key {
        #[command(subcommand)]
        command: Box<KeyCommand>,
    },
    Kinds {
        #[command(subcommand)]
        command: KindsCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
    PurgeExpired(DbPurgeArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = false)]
    skip_existing: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Args)]
struct DbPurgeArgs {
    /// RFC3339 cutoff; defaults to the current time.
    #[arg(long)]
    now: Option<String>,
}

#[derive(Debug, Subcommand)]
enum EntityCommand {
    Observe(EntityObserveArgs),
    Show(EntityShowArgs),
    List,
}

#[derive(Debug, Args)]
struct EntityObserveArgs {
    /// Record draft JSON file, or `-` for stdin.
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
struct EntityShowArgs {
    #[arg(long)]
    key: String,
}

#[derive(Debug, Subcommand)]
enum KeyCommand {
    Derive(KeyDeriveArgs),
}

#[derive(Debug, Args)]
struct KeyDeriveArgs {
    #[arg(long)]
    kind: String,
    #[arg(long)]
    scope: String,
    #[arg(long)]
    strong: Option<String>,
    #[arg(long)]
    weak: Option<String>,
}

#[derive(Debug, Subcommand)]
enum KindsCommand {
    List,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_logging(log_level: Option<&str>) -> Result<()> {
    let filter = match log_level {
        Some(directive) => EnvFilter::try_new(directive)
            .with_context(|| format!("invalid --log-level directive: {directive}"))?,
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|err| anyhow!("failed to initialize logging: {err}"))
}

fn load_config(path: Option<&Path>) -> Result<ApiConfig> {
    let Some(path) = path else {
        return Ok(ApiConfig::default());
    };

    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: ApiConfig = serde_yaml::from_str(&body)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid config file {}", path.display()))?;
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref())?;

    let config = load_config(cli.config.as_deref())?;
    let registry = Arc::new(KindRegistry::with_builtin_kinds()?);
    debug!(db = %cli.db.display(), ?config, "starting ek");
    let api = ReconciliationApi::new(cli.db, registry, config)?;

    match cli.command {
        Command::Db { command } => run_db(*command, &api),
        Command::Entity { command } => run_entity(*command, &api),
        Command::Key { command } => run_key(*command, &api),
        Command::Kinds { command } => run_kinds(&command, &api),
    }
}

fn run_db(command: DbCommand, api: &ReconciliationApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(api),
        DbCommand::Migrate(args) => run_db_migrate(&args, api),
        DbCommand::Export(args) => run_db_export(&args, api),
        DbCommand::Import(args) => run_db_import(&args, api),
        DbCommand::Backup(args) => run_db_backup(&args, api),
        DbCommand::Restore(args) => run_db_restore(&args, api),
        DbCommand::IntegrityCheck => run_db_integrity_check(api),
        DbCommand::PurgeExpired(args) => run_db_purge_expired(&args, api),
    }
}

fn run_db_schema_version(api: &ReconciliationApi) -> Result<()> {
    let status = api.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, api: &ReconciliationApi) -> Result<()> {
    let result = api.migrate(args.dry_run)?;
    emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
}

fn run_db_export(args: &DbExportArgs, api: &ReconciliationApi) -> Result<()> {
    let manifest = api.export_snapshot(&args.out)?;
    emit_json(serde_json::json!({
        "out_dir": args.out,
        "manifest": manifest
    }))
}

fn run_db_import(args: &DbImportArgs, api: &ReconciliationApi) -> Result<()> {
    let summary = api.import_snapshot(&args.input, args.skip_existing)?;
    emit_json(serde_json::json!({
        "in_dir": args.input,
        "skip_existing": args.skip_existing,
        "summary": summary
    }))
}

fn run_db_backup(args: &DbBackupArgs, api: &ReconciliationApi) -> Result<()> {
    api.backup_database(&args.out)?;
    emit_json(serde_json::json!({
        "backup_path": args.out,
        "status": "ok"
    }))
}

fn run_db_restore(args: &DbRestoreArgs, api: &ReconciliationApi) -> Result<()> {
    api.restore_database(&args.input)?;
    let status = api.schema_status()?;
    emit_json(serde_json::json!({
        "restored_from": args.input,
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions
    }))
}

fn run_db_integrity_check(api: &ReconciliationApi) -> Result<()> {
    let report = api.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn run_db_purge_expired(args: &DbPurgeArgs, api: &ReconciliationApi) -> Result<()> {
    let now = match args.now.as_deref() {
        Some(value) => parse_rfc3339(value)?,
        None => OffsetDateTime::now_utc(),
    };
    let summary = api.purge_expired(now)?;
    emit_json(serde_json::json!({
        "cutoff": format_rfc3339(now)?,
        "summary": summary
    }))
}

fn run_entity(command: EntityCommand, api: &ReconciliationApi) -> Result<()> {
    match command {
        EntityCommand::Observe(args) => {
            let draft = read_draft(&args.file)?;
            let result = api.observe(draft)?;
            emit_json(serde_json::json!({
                "api_contract_version": API_CONTRACT_VERSION,
                "result": result
            }))
        }
        EntityCommand::Show(args) => {
            let stored =
                api.get(&args.key)?.ok_or_else(|| anyhow!("entity not found: {}", args.key))?;
            emit_json(serde_json::to_value(&stored).context("failed to serialize entity record")?)
        }
        EntityCommand::List => {
            let records = api.list()?;
            emit_json(serde_json::json!({
                "count": records.len(),
                "records": records
            }))
        }
    }
}

fn run_key(command: KeyCommand, api: &ReconciliationApi) -> Result<()> {
    match command {
        KeyCommand::Derive(args) => {
            let key =
                api.derive_key(&args.kind, &args.scope, args.strong.as_deref(), args.weak.as_deref())?;
            emit_json(serde_json::json!({
                "key": key,
                "length": key.len(),
                "max_key_length": api.config().engine.max_key_length,
                "truncation": api.config().engine.truncation.as_str()
            }))
        }
    }
}

fn run_kinds(command: &KindsCommand, api: &ReconciliationApi) -> Result<()> {
    match command {
        KindsCommand::List => {
            let registry = api.registry();
            let kinds = registry
                .schemas()
                .map(|schema| {
                    serde_json::json!({
                        "kind": schema.kind,
                        "label": schema.label(),
                        "labels": registry.labels_for(schema.kind),
                        "scope_style": schema.scope_style(),
                        "default_ttl_seconds": schema.default_ttl_seconds,
                        "history_cap": schema.history_cap,
                        "fields": schema.fields
                    })
                })
                .collect::<Vec<_>>();
            emit_json(serde_json::json!({ "kinds": kinds }))
        }
    }
}

fn read_draft(path: &Path) -> Result<RecordDraft> {
    let body = if path == Path::new("-") {
        let mut body = String::new();
        io::stdin().read_to_string(&mut body).context("failed to read record draft from stdin")?;
        body
    } else {
        fs::read_to_string(path)
            .with_context(|| format!("failed to read record draft {}", path.display()))?
    };
    serde_json::from_str(&body).context("failed to parse record draft JSON")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn format_rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
