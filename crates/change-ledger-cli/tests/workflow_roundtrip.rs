use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use change_ledger_cli::{run_cli, Cli};
use change_ledger_core::{ActorRef, ApprovalStatus, EntityStatus, RequestMeta};
use change_ledger_store_sqlite::SqliteWorkflowStore;
use clap::Parser;
use serde_json::json;
use ulid::Ulid;

fn must<T>(result: Result<T>) -> T {
    match result {
        Ok(value) => value,
        Err(err) => panic!("test failure: {err:#}"),
    }
}

fn temp_db_path() -> PathBuf {
    std::env::temp_dir().join(format!("change-ledger-it-{}.sqlite3", Ulid::new()))
}

fn execute(args: &[&str]) -> Result<()> {
    let cli = Cli::try_parse_from(args.iter().copied())?;
    run_cli(cli)
}

fn fixture_actor() -> ActorRef {
    ActorRef {
        user_id: "u-100".to_string(),
        role: "registrar".to_string(),
        name: "Registrar".to_string(),
    }
}

#[test]
fn deletion_is_held_and_approved_through_the_command_surface() {
    let db = temp_db_path();
    let db_arg = db.display().to_string();

    let created = {
        let mut store = must(SqliteWorkflowStore::open(&db));
        must(store.migrate());
        must(store.create_entity(
            "Class 10A",
            &json!({"name": "Class 10A", "capacity": 30}),
            &fixture_actor(),
            &RequestMeta::default(),
        ))
    };
    let entity_arg = created.entity.entity_id.to_string();

    must(execute(&[
        "clg",
        "--db",
        db_arg.as_str(),
        "change",
        "record",
        "--entity-id",
        entity_arg.as_str(),
        "--event",
        "deleted",
        "--user",
        "u-100",
        "--role",
        "registrar",
    ]));

    let pending = {
        let store = must(SqliteWorkflowStore::open(&db));
        must(store.list_pending_for_approver("approver-1"))
    };
    assert_eq!(pending.len(), 1);

    must(execute(&[
        "clg",
        "--db",
        db_arg.as_str(),
        "approval",
        "approve",
        "--id",
        &pending[0].request_id.to_string(),
        "--approver",
        "approver-1",
        "--comments",
        "confirmed by the registrar",
    ]));

    let store = must(SqliteWorkflowStore::open(&db));
    let entity = must(store.get_entity(created.entity.entity_id));
    assert_eq!(entity.status, EntityStatus::Archived);
    assert_eq!(entity.current_version, 2);

    let audit = must(store.get_audit(pending[0].audit_id));
    assert_eq!(audit.approval_status, ApprovalStatus::Approved);

    must(execute(&["clg", "--db", db_arg.as_str(), "check"]));

    let _ = fs::remove_file(&db);
}

#[test]
fn rollback_and_history_round_trip_through_the_cli() {
    let db = temp_db_path();
    let db_arg = db.display().to_string();

    let created = {
        let mut store = must(SqliteWorkflowStore::open(&db));
        must(store.migrate());
        must(store.create_entity(
            "Class 10A",
            &json!({"name": "Class 10A", "capacity": 30}),
            &fixture_actor(),
            &RequestMeta::default(),
        ))
    };
    let entity_arg = created.entity.entity_id.to_string();

    must(execute(&[
        "clg",
        "--db",
        db_arg.as_str(),
        "change",
        "record",
        "--entity-id",
        entity_arg.as_str(),
        "--event",
        "updated",
        "--payload-json",
        r#"{"name":"Class 10A","capacity":35}"#,
        "--user",
        "u-100",
        "--role",
        "registrar",
    ]));

    must(execute(&[
        "clg",
        "--db",
        db_arg.as_str(),
        "version",
        "rollback",
        "--entity-id",
        entity_arg.as_str(),
        "--version",
        "1",
        "--user",
        "u-100",
        "--role",
        "registrar",
    ]));

    let store = must(SqliteWorkflowStore::open(&db));
    let entity = must(store.get_entity(created.entity.entity_id));
    assert_eq!(entity.current_version, 3);
    assert_eq!(entity.payload, created.entity.payload);

    let history = must(store.history_for_entity(created.entity.entity_id, None));
    assert_eq!(history.len(), 3);

    must(execute(&[
        "clg",
        "--db",
        db_arg.as_str(),
        "change",
        "history",
        "--entity-id",
        entity_arg.as_str(),
    ]));

    let _ = fs::remove_file(&db);
}

#[test]
fn unknown_entity_id_surfaces_as_an_error() {
    let db = temp_db_path();

    {
        let store = must(SqliteWorkflowStore::open(&db));
        must(store.migrate());
    }

    let db_arg = db.display().to_string();
    let result = execute(&[
        "clg",
        "--db",
        db_arg.as_str(),
        "entity",
        "show",
        "--id",
        &Ulid::new().to_string(),
    ]);
    assert!(result.is_err());

    let _ = fs::remove_file(&db);
}
