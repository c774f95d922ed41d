//! Embedded command surface for the change ledger.
//!
//! Host applications should embed ledger behavior through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_ledger_with_db`] for direct [`LedgerCommand`] execution against a DB path.
//! - [`run_ledger`] for execution against an existing [`SqliteWorkflowStore`].

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use change_ledger_core::{
    now_utc, parse_rfc3339_utc, ActorRef, AttemptInput, AuditId, EntityId, EventType, RequestId,
    RequestMeta, RiskPolicy,
};
use change_ledger_store_sqlite::SqliteWorkflowStore;
use clap::{Args, Parser, Subcommand, ValueEnum};
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "clg")]
#[command(about = "Change Ledger CLI")]
pub struct Cli {
    #[arg(long, default_value = "./change_ledger.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: LedgerCommand,
}

#[derive(Debug, Subcommand)]
pub enum LedgerCommand {
    Entity {
        #[command(subcommand)]
        command: Box<EntityCommand>,
    },
    Change {
        #[command(subcommand)]
        command: Box<ChangeCommand>,
    },
    Approval {
        #[command(subcommand)]
        command: Box<ApprovalCommand>,
    },
    Version {
        #[command(subcommand)]
        command: Box<VersionCommand>,
    },
    Policy {
        #[command(subcommand)]
        command: Box<PolicyCommand>,
    },
    Check,
}

#[derive(Debug, Subcommand)]
pub enum EntityCommand {
    Create(EntityCreateArgs),
    Show {
        #[arg(long)]
        id: String,
    },
}

#[derive(Debug, Args)]
pub struct EntityCreateArgs {
    #[arg(long)]
    name: String,
    #[arg(long, default_value = "{}")]
    payload_json: String,
    #[command(flatten)]
    actor: ActorArgs,
    #[command(flatten)]
    meta: MetaArgs,
}

#[derive(Debug, Subcommand)]
pub enum ChangeCommand {
    Record(RecordArgs),
    Show {
        #[arg(long)]
        id: String,
    },
    History {
        #[arg(long)]
        entity_id: String,
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Debug, Args)]
pub struct RecordArgs {
    #[arg(long)]
    entity_id: String,
    #[arg(long)]
    event: EventArg,
    #[arg(long, default_value = "{}")]
    payload_json: String,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long)]
    batch_id: Option<String>,
    #[arg(long)]
    parent_audit_id: Option<String>,
    #[arg(long)]
    expected_checksum: Option<String>,
    #[command(flatten)]
    actor: ActorArgs,
    #[command(flatten)]
    meta: MetaArgs,
}

#[derive(Debug, Subcommand)]
pub enum ApprovalCommand {
    Approve {
        #[arg(long)]
        id: String,
        #[arg(long)]
        approver: String,
        #[arg(long)]
        comments: Option<String>,
    },
    Reject {
        #[arg(long)]
        id: String,
        #[arg(long)]
        approver: String,
        #[arg(long)]
        reason: String,
    },
    Delegate {
        #[arg(long)]
        id: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        reason: Option<String>,
    },
    Escalate {
        #[arg(long)]
        id: String,
        #[arg(long)]
        to: String,
        #[arg(long)]
        reason: Option<String>,
    },
    Show {
        #[arg(long)]
        id: String,
    },
    Pending {
        #[arg(long)]
        approver: String,
    },
    Sweep {
        #[arg(long)]
        now: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum VersionCommand {
    List {
        #[arg(long)]
        entity_id: String,
    },
    Rollback(RollbackArgs),
    Merge(MergeArgs),
}

#[derive(Debug, Args)]
pub struct RollbackArgs {
    #[arg(long)]
    entity_id: String,
    #[arg(long)]
    version: u32,
    #[command(flatten)]
    actor: ActorArgs,
    #[command(flatten)]
    meta: MetaArgs,
}

#[derive(Debug, Args)]
pub struct MergeArgs {
    #[arg(long)]
    entity_id: String,
    #[arg(long = "source")]
    sources: Vec<u32>,
    #[arg(long)]
    payload_json: String,
    #[arg(long, default_value_t = 0)]
    conflicts: u32,
    #[command(flatten)]
    actor: ActorArgs,
    #[command(flatten)]
    meta: MetaArgs,
}

#[derive(Debug, Subcommand)]
pub enum PolicyCommand {
    Show,
    List,
    Load {
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Debug, Args)]
pub struct ActorArgs {
    #[arg(long)]
    user: String,
    #[arg(long)]
    role: String,
    #[arg(long)]
    actor_name: Option<String>,
}

#[derive(Debug, Args)]
pub struct MetaArgs {
    #[arg(long)]
    ip: Option<String>,
    #[arg(long)]
    user_agent: Option<String>,
    #[arg(long)]
    session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum EventArg {
    Updated,
    Deleted,
    Restored,
    BulkUpdate,
    BulkDelete,
    Import,
    Export,
    Merge,
    Split,
}

pub fn run_cli(cli: Cli) -> Result<()> {
    run_ledger_with_db(&cli.db, cli.command)
}

pub fn run_ledger_with_db(db_path: &std::path::Path, command: LedgerCommand) -> Result<()> {
    let mut store = SqliteWorkflowStore::open(db_path)?;
    store.migrate()?;
    run_ledger(command, &mut store)
}

pub fn run_ledger(command: LedgerCommand, store: &mut SqliteWorkflowStore) -> Result<()> {
    match command {
        LedgerCommand::Entity { command } => run_entity(*command, store),
        LedgerCommand::Change { command } => run_change(*command, store),
        LedgerCommand::Approval { command } => run_approval(*command, store),
        LedgerCommand::Version { command } => run_version(*command, store),
        LedgerCommand::Policy { command } => run_policy(*command, store),
        LedgerCommand::Check => {
            let report = store.integrity_check()?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn run_entity(command: EntityCommand, store: &mut SqliteWorkflowStore) -> Result<()> {
    match command {
        EntityCommand::Create(args) => {
            let payload = parse_payload_json(&args.payload_json)?;
            let receipt = store.create_entity(
                &args.name,
                &payload,
                &actor_from(&args.actor),
                &meta_from(&args.meta),
            )?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
            Ok(())
        }
        EntityCommand::Show { id } => {
            let entity = store.get_entity(parse_entity_id(&id)?)?;
            println!("{}", serde_json::to_string_pretty(&entity)?);
            Ok(())
        }
    }
}

fn run_change(command: ChangeCommand, store: &mut SqliteWorkflowStore) -> Result<()> {
    match command {
        ChangeCommand::Record(args) => {
            let input = AttemptInput {
                entity_id: parse_entity_id(&args.entity_id)?,
                event_type: map_event(args.event),
                new_value: parse_payload_json(&args.payload_json)?,
                actor: actor_from(&args.actor),
                request_meta: meta_from(&args.meta),
                tags: args.tags.clone(),
                batch_id: args.batch_id.clone(),
                parent_audit_id: args
                    .parent_audit_id
                    .as_deref()
                    .map(parse_audit_id)
                    .transpose()?,
                expected_checksum: args.expected_checksum.clone(),
            };
            let receipt = store.record_attempt(&input)?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
            Ok(())
        }
        ChangeCommand::Show { id } => {
            let audit = store.get_audit(parse_audit_id(&id)?)?;
            println!("{}", serde_json::to_string_pretty(&audit)?);
            Ok(())
        }
        ChangeCommand::History { entity_id, limit } => {
            let history = store.history_for_entity(parse_entity_id(&entity_id)?, limit)?;
            println!("{}", serde_json::to_string_pretty(&history)?);
            Ok(())
        }
    }
}

fn run_approval(command: ApprovalCommand, store: &mut SqliteWorkflowStore) -> Result<()> {
    match command {
        ApprovalCommand::Approve {
            id,
            approver,
            comments,
        } => {
            let decision = store.approve(parse_request_id(&id)?, &approver, comments)?;
            println!("{}", serde_json::to_string_pretty(&decision)?);
            Ok(())
        }
        ApprovalCommand::Reject {
            id,
            approver,
            reason,
        } => {
            let decision = store.reject(parse_request_id(&id)?, &approver, &reason)?;
            println!("{}", serde_json::to_string_pretty(&decision)?);
            Ok(())
        }
        ApprovalCommand::Delegate {
            id,
            from,
            to,
            reason,
        } => {
            let decision = store.delegate(parse_request_id(&id)?, &from, &to, reason)?;
            println!("{}", serde_json::to_string_pretty(&decision)?);
            Ok(())
        }
        ApprovalCommand::Escalate { id, to, reason } => {
            let decision = store.escalate(parse_request_id(&id)?, &to, reason)?;
            println!("{}", serde_json::to_string_pretty(&decision)?);
            Ok(())
        }
        ApprovalCommand::Show { id } => {
            let request = store.get_request(parse_request_id(&id)?)?;
            println!("{}", serde_json::to_string_pretty(&request)?);
            Ok(())
        }
        ApprovalCommand::Pending { approver } => {
            let requests = store.list_pending_for_approver(&approver)?;
            println!("{}", serde_json::to_string_pretty(&requests)?);
            Ok(())
        }
        ApprovalCommand::Sweep { now } => {
            let report = store.expire_sweep(parse_optional_utc(now.as_deref())?)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn run_version(command: VersionCommand, store: &mut SqliteWorkflowStore) -> Result<()> {
    match command {
        VersionCommand::List { entity_id } => {
            let versions = store.versions_for_entity(parse_entity_id(&entity_id)?)?;
            println!("{}", serde_json::to_string_pretty(&versions)?);
            Ok(())
        }
        VersionCommand::Rollback(args) => {
            let receipt = store.rollback(
                parse_entity_id(&args.entity_id)?,
                args.version,
                &actor_from(&args.actor),
                &meta_from(&args.meta),
            )?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
            Ok(())
        }
        VersionCommand::Merge(args) => {
            let payload = parse_payload_json(&args.payload_json)?;
            let receipt = store.merge_versions(
                parse_entity_id(&args.entity_id)?,
                &args.sources,
                &payload,
                &actor_from(&args.actor),
                &meta_from(&args.meta),
                args.conflicts,
            )?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
            Ok(())
        }
    }
}

fn run_policy(command: PolicyCommand, store: &mut SqliteWorkflowStore) -> Result<()> {
    match command {
        PolicyCommand::Show => {
            let policy = store.current_policy()?;
            println!("{}", serde_json::to_string_pretty(&policy)?);
            Ok(())
        }
        PolicyCommand::List => {
            let policies = store.get_policies()?;
            println!("{}", serde_json::to_string_pretty(&policies)?);
            Ok(())
        }
        PolicyCommand::Load { file } => {
            let body = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read policy file {}", file.display()))?;
            let value: serde_json::Value = serde_json::from_str(&body)
                .with_context(|| format!("policy file {} is not valid JSON", file.display()))?;
            let policy = RiskPolicy::from_json(&value).map_err(|err| anyhow!(err.to_string()))?;
            store.upsert_policy(&policy)?;
            println!("{}", serde_json::to_string_pretty(&policy)?);
            Ok(())
        }
    }
}

fn actor_from(args: &ActorArgs) -> ActorRef {
    ActorRef {
        user_id: args.user.clone(),
        role: args.role.clone(),
        name: args.actor_name.clone().unwrap_or_else(|| args.user.clone()),
    }
}

fn meta_from(args: &MetaArgs) -> RequestMeta {
    RequestMeta {
        ip: args.ip.clone(),
        user_agent: args.user_agent.clone(),
        session_id: args.session_id.clone(),
    }
}

fn map_event(value: EventArg) -> EventType {
    match value {
        EventArg::Updated => EventType::Updated,
        EventArg::Deleted => EventType::Deleted,
        EventArg::Restored => EventType::Restored,
        EventArg::BulkUpdate => EventType::BulkUpdate,
        EventArg::BulkDelete => EventType::BulkDelete,
        EventArg::Import => EventType::Import,
        EventArg::Export => EventType::Export,
        EventArg::Merge => EventType::Merge,
        EventArg::Split => EventType::Split,
    }
}

fn parse_payload_json(raw: &str) -> Result<serde_json::Value> {
    serde_json::from_str(raw).with_context(|| format!("payload_json must be valid JSON: {raw}"))
}

fn parse_optional_utc(raw: Option<&str>) -> Result<time::OffsetDateTime> {
    match raw {
        Some(value) => parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid timestamp: {err}")),
        None => Ok(now_utc()),
    }
}

fn parse_entity_id(raw: &str) -> Result<EntityId> {
    parse_ulid(raw).map(EntityId)
}

fn parse_audit_id(raw: &str) -> Result<AuditId> {
    parse_ulid(raw).map(AuditId)
}

fn parse_request_id(raw: &str) -> Result<RequestId> {
    parse_ulid(raw).map(RequestId)
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("change-ledger-cli-{}.sqlite3", Ulid::new()))
    }

    fn execute_cli(args: Vec<&str>) -> Result<()> {
        let cli = Cli::try_parse_from(args)?;
        run_cli(cli)
    }

    #[test]
    fn parse_payload_accepts_valid_json() {
        let value = must(parse_payload_json(r#"{"key":"value"}"#));
        assert_eq!(value["key"], json!("value"));
    }

    #[test]
    fn parse_payload_rejects_invalid_json() {
        assert!(parse_payload_json("{").is_err());
    }

    #[test]
    fn parse_optional_utc_rejects_non_utc() {
        assert!(parse_optional_utc(Some("2026-02-07T12:00:00+02:00")).is_err());
    }

    #[test]
    fn parse_ids_reject_garbage() {
        assert!(parse_entity_id("not-a-ulid").is_err());
        assert!(parse_request_id("").is_err());
    }

    #[test]
    fn event_arg_covers_every_recordable_event() {
        assert_eq!(map_event(EventArg::BulkDelete), EventType::BulkDelete);
        assert_eq!(map_event(EventArg::Merge), EventType::Merge);
    }

    #[test]
    fn entity_create_and_check_run_against_a_fresh_db() {
        let db = temp_db_path();
        let db_arg = db.display().to_string();

        must(execute_cli(vec![
            "clg",
            "--db",
            db_arg.as_str(),
            "entity",
            "create",
            "--name",
            "Class 10A",
            "--payload-json",
            r#"{"name":"Class 10A","capacity":30}"#,
            "--user",
            "u-100",
            "--role",
            "registrar",
        ]));

        must(execute_cli(vec!["clg", "--db", db_arg.as_str(), "check"]));
        must(execute_cli(vec!["clg", "--db", db_arg.as_str(), "policy", "show"]));

        let _ = fs::remove_file(&db);
    }

    #[test]
    fn ledger_commands_drive_an_existing_store() {
        let db = temp_db_path();
        let mut store = must(SqliteWorkflowStore::open(&db));
        must(store.migrate());

        let receipt = must(store.create_entity(
            "Class 10A",
            &json!({"name": "Class 10A", "capacity": 30}),
            &ActorRef {
                user_id: "u-100".to_string(),
                role: "registrar".to_string(),
                name: "Registrar".to_string(),
            },
            &RequestMeta::default(),
        ));
        let entity_arg = receipt.entity.entity_id.to_string();

        must(run_ledger(
            LedgerCommand::Change {
                command: Box::new(ChangeCommand::Record(RecordArgs {
                    entity_id: entity_arg.clone(),
                    event: EventArg::Updated,
                    payload_json: r#"{"name":"Class 10A","capacity":32}"#.to_string(),
                    tags: vec!["capacity".to_string()],
                    batch_id: None,
                    parent_audit_id: None,
                    expected_checksum: None,
                    actor: ActorArgs {
                        user: "u-100".to_string(),
                        role: "registrar".to_string(),
                        actor_name: None,
                    },
                    meta: MetaArgs {
                        ip: None,
                        user_agent: None,
                        session_id: None,
                    },
                })),
            },
            &mut store,
        ));

        must(run_ledger(
            LedgerCommand::Version {
                command: Box::new(VersionCommand::List {
                    entity_id: entity_arg.clone(),
                }),
            },
            &mut store,
        ));

        let entity = must(store.get_entity(receipt.entity.entity_id));
        assert_eq!(entity.current_version, 2);

        let _ = fs::remove_file(&db);
    }
}
