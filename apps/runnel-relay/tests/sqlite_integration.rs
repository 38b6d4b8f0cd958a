//! SQLite-backed integration test for the core relay flows.
//!
//! Runs against `sqlite::memory:` so no external service is needed. The
//! pool is capped at one connection because every in-memory SQLite
//! connection is its own database.

use chrono::{Duration, Utc};
use sqlx::sqlite::SqlitePoolOptions;

use runnel_proto::{CommandReport, CommandState};
use runnel_relay::state::{AppState, CommandFilter, StateError};

async fn sqlite_state() -> AppState {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("open in-memory sqlite");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("apply migrations");
    AppState::with_db(pool).with_admin(Some("admin-1".into()))
}

#[tokio::test]
async fn sqlite_end_to_end_command_flow() {
    let state = sqlite_state().await;

    // Admin bootstraps authorization for a regular user.
    let admin = state.ensure_user("admin-1", Some("Admin")).await.unwrap();
    assert!(admin.is_admin && admin.is_allowed);
    state.set_allowed("admin-1", "user-1", true).await.unwrap();
    let user = state.ensure_user("user-1", None).await.unwrap();
    assert!(user.is_allowed && !user.is_admin);

    let machine = state.register_machine("web-01").await.unwrap();
    state
        .authenticate_machine(&machine.machine_id, &machine.secret)
        .await
        .unwrap();

    state
        .register_script("user-1", "ping", "echo pong")
        .await
        .unwrap();
    let err = state
        .register_script("user-1", "ping", "echo again")
        .await
        .unwrap_err();
    assert!(matches!(err, StateError::ScriptNameTaken));

    let command = state
        .create_command("user-1", "ping", &machine.machine_id)
        .await
        .unwrap();
    assert_eq!(command.state, CommandState::Pending);

    let pending = state
        .pending_for_machine(&machine.machine_id)
        .await
        .unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].script_content, "echo pong");

    // The conditional update admits exactly one claim.
    state
        .claim_command(command.command_id, &machine.machine_id)
        .await
        .unwrap();
    let err = state
        .claim_command(command.command_id, &machine.machine_id)
        .await
        .unwrap_err();
    assert!(matches!(err, StateError::AlreadyClaimed));

    let finished = state
        .report_result(
            command.command_id,
            &machine.machine_id,
            &CommandReport::success("pong\n"),
        )
        .await
        .unwrap();
    assert_eq!(finished.state, CommandState::Completed);
    assert_eq!(finished.output.as_deref(), Some("pong\n"));

    // Late duplicate report: terminal, discarded.
    let err = state
        .report_result(
            command.command_id,
            &machine.machine_id,
            &CommandReport::success("pong\n"),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StateError::CommandFinished(CommandState::Completed)
    ));

    let listed = state
        .list_commands(&CommandFilter {
            state: Some(CommandState::Completed),
            ..CommandFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].command_id, command.command_id);
}

#[tokio::test]
async fn sqlite_watchdog_sweeps_overdue_commands() {
    let state = sqlite_state()
        .await
        .with_timeouts(Duration::zero(), Duration::zero(), Duration::seconds(300));
    state.set_allowed("admin-1", "user-1", true).await.unwrap();
    let machine = state.register_machine("web-01").await.unwrap();
    state
        .register_script("user-1", "ping", "echo pong")
        .await
        .unwrap();

    let unclaimed = state
        .create_command("user-1", "ping", &machine.machine_id)
        .await
        .unwrap();
    let hung = state
        .create_command("user-1", "ping", &machine.machine_id)
        .await
        .unwrap();
    state
        .claim_command(hung.command_id, &machine.machine_id)
        .await
        .unwrap();

    let outcome = state.expire_overdue(Utc::now()).await.unwrap();
    assert_eq!(outcome.expired, 1);
    assert_eq!(outcome.failed, 1);

    let unclaimed = state.get_command(unclaimed.command_id).await.unwrap();
    assert_eq!(unclaimed.state, CommandState::Expired);
    let hung = state.get_command(hung.command_id).await.unwrap();
    assert_eq!(hung.state, CommandState::Failed);
    assert!(hung.error.is_some());

    assert!(state
        .pending_for_machine(&machine.machine_id)
        .await
        .unwrap()
        .is_empty());
}
