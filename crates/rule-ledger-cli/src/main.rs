use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use rule_ledger_api::{MoveTarget, Placement, RuleLedgerApi};
use rule_ledger_core::{Endpoint, Rule, RuleId, RulePayload};
use rule_ledger_store_sqlite::SqliteStore;
use serde_json::Value;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "rules")]
#[command(about = "Rule ledger CLI")]
struct Cli {
    #[arg(long, default_value = "./rule_ledger.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Rule {
        #[command(subcommand)]
        command: Box<RuleCommand>,
    },
    Order {
        #[command(subcommand)]
        command: Box<OrderCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
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

#[derive(Debug, Subcommand)]
enum RuleCommand {
    Add(RuleAddArgs),
    Update(RuleUpdateArgs),
    Delete(RuleIdArg),
    Show(RuleIdArg),
    List(RuleListArgs),
    Count,
}

#[derive(Debug, Args)]
struct RuleAddArgs {
    #[arg(long)]
    name: String,
    /// Endpoint as NAME=EMAIL; repeatable.
    #[arg(long = "source")]
    sources: Vec<String>,
    /// Endpoint as NAME=EMAIL; repeatable.
    #[arg(long = "destination")]
    destinations: Vec<String>,
    #[arg(long, conflicts_with = "before")]
    first: bool,
    #[arg(long)]
    before: Option<String>,
}

#[derive(Debug, Args)]
struct RuleUpdateArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    name: String,
    #[arg(long = "source")]
    sources: Vec<String>,
    #[arg(long = "destination")]
    destinations: Vec<String>,
}

#[derive(Debug, Args)]
struct RuleIdArg {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct RuleListArgs {
    #[arg(long, default_value_t = 1)]
    page: u64,
    #[arg(long, default_value_t = 50)]
    page_size: u64,
}

#[derive(Debug, Subcommand)]
enum OrderCommand {
    Move(OrderMoveArgs),
    Renormalize(OrderRenormalizeArgs),
}

#[derive(Debug, Args)]
struct OrderMoveArgs {
    #[arg(long)]
    id: String,
    /// Move before this rule; omit to move to the end of the order.
    #[arg(long)]
    before: Option<String>,
}

#[derive(Debug, Args)]
struct OrderRenormalizeArgs {
    #[arg(long, default_value_t = false)]
    only_if_needed: bool,
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

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(*command, &mut store)
        }
        Command::Rule { command } => {
            let mut ledger = RuleLedgerApi::open(&cli.db)?;
            run_rule(*command, &mut ledger)
        }
        Command::Order { command } => {
            let mut ledger = RuleLedgerApi::open(&cli.db)?;
            run_order(*command, &mut ledger)
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => {
            let before = store.schema_status()?;
            if args.dry_run {
                return emit_json(serde_json::json!({
                    "dry_run": true,
                    "current_version": before.current_version,
                    "target_version": before.target_version,
                    "would_apply_versions": before.pending_versions
                }));
            }

            store.migrate()?;
            let after = store.schema_status()?;
            emit_json(serde_json::json!({
                "dry_run": false,
                "before_version": before.current_version,
                "applied_versions": before.pending_versions,
                "after_version": after.current_version,
                "target_version": after.target_version,
                "up_to_date": after.pending_versions.is_empty()
            }))
        }
        DbCommand::Backup(args) => {
            store.migrate()?;
            store.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Restore(args) => {
            store.restore_database(&args.input)?;
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
        DbCommand::IntegrityCheck => {
            store.migrate()?;
            let report = store.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
    }
}

fn run_rule(command: RuleCommand, ledger: &mut RuleLedgerApi) -> Result<()> {
    match command {
        RuleCommand::Add(args) => {
            let placement = if args.first {
                Placement::First
            } else {
                match args.before.as_deref() {
                    Some(raw) => Placement::Before(parse_rule_id(raw)?),
                    None => Placement::Last,
                }
            };
            let payload = RulePayload {
                name: args.name,
                sources: parse_endpoints(&args.sources)?,
                destinations: parse_endpoints(&args.destinations)?,
            };
            let rule = ledger.create_rule(payload, placement)?;
            emit_rule(&rule)
        }
        RuleCommand::Update(args) => {
            let payload = RulePayload {
                name: args.name,
                sources: parse_endpoints(&args.sources)?,
                destinations: parse_endpoints(&args.destinations)?,
            };
            let rule = ledger.update_rule(parse_rule_id(&args.id)?, payload)?;
            emit_rule(&rule)
        }
        RuleCommand::Delete(args) => {
            let id = parse_rule_id(&args.id)?;
            ledger.delete_rule(id)?;
            emit_json(serde_json::json!({
                "rule_id": id.to_string(),
                "deleted": true
            }))
        }
        RuleCommand::Show(args) => {
            let rule = ledger.get_rule(parse_rule_id(&args.id)?)?;
            emit_rule(&rule)
        }
        RuleCommand::List(args) => {
            let page = ledger.list_page(args.page, args.page_size)?;
            emit_json(serde_json::to_value(&page).context("failed to serialize rule page")?)
        }
        RuleCommand::Count => {
            let total = ledger.count_rules()?;
            emit_json(serde_json::json!({ "total": total }))
        }
    }
}

fn run_order(command: OrderCommand, ledger: &mut RuleLedgerApi) -> Result<()> {
    match command {
        OrderCommand::Move(args) => {
            let id = parse_rule_id(&args.id)?;
            let target = match args.before.as_deref() {
                Some(raw) => MoveTarget::Before(parse_rule_id(raw)?),
                None => MoveTarget::End,
            };
            let rule = ledger.move_rule(id, target)?;
            emit_rule(&rule)
        }
        OrderCommand::Renormalize(args) => {
            if args.only_if_needed {
                let ran = ledger.renormalize_if_needed()?;
                let rules = if ran { ledger.count_rules()? } else { 0 };
                emit_json(serde_json::json!({ "ran": ran, "rules": rules }))
            } else {
                let renumbered = ledger.renormalize()?;
                emit_json(serde_json::json!({ "ran": true, "rules": renumbered }))
            }
        }
    }
}

fn emit_rule(rule: &Rule) -> Result<()> {
    emit_json(serde_json::to_value(rule).context("failed to serialize rule")?)
}

fn parse_rule_id(value: &str) -> Result<RuleId> {
    RuleId::from_str(value).map_err(|err| anyhow!("{err}"))
}

fn parse_endpoints(raw: &[String]) -> Result<Vec<Endpoint>> {
    raw.iter()
        .map(|entry| {
            let (name, email) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("endpoint MUST be NAME=EMAIL (received: {entry})"))?;
            Ok(Endpoint { name: name.to_string(), email: email.to_string() })
        })
        .collect()
}
