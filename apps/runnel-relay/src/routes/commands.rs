use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use tracing::{debug, info, warn};

use runnel_proto::{
    CommandReport, CommandState, CommandView, CreateCommandRequest, PendingCommand,
    RegisterScriptRequest, ScriptCreated,
};

use crate::state::{AppState, CommandFilter, StateError};

use super::{map_state_err, ApiError, ApiResult, FrontEndUser, MachineCredentials};

#[derive(Debug, Deserialize)]
pub struct CommandListQuery {
    pub machine_id: Option<String>,
    pub state: Option<CommandState>,
    #[serde(default)]
    pub mine: bool,
}

pub async fn register_script(
    State(state): State<AppState>,
    user: FrontEndUser,
    Json(request): Json<RegisterScriptRequest>,
) -> ApiResult<ScriptCreated> {
    state.require_allowed(&user.id).await.map_err(map_state_err)?;
    let name = request.name.trim();
    if name.is_empty() || request.content.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "script name and content required".into(),
        ));
    }
    let created = state
        .register_script(&user.id, name, &request.content)
        .await
        .map_err(map_state_err)?;
    info!(script = %created.name, owner = %user.id, "registered script");
    Ok(Json(created))
}

pub async fn create_command(
    State(state): State<AppState>,
    user: FrontEndUser,
    Json(request): Json<CreateCommandRequest>,
) -> ApiResult<CommandView> {
    state.require_allowed(&user.id).await.map_err(map_state_err)?;
    let command = state
        .create_command(&user.id, &request.script_name, &request.machine_id)
        .await
        .map_err(map_state_err)?;
    info!(
        command = command.command_id,
        script = %command.script_name,
        machine = %command.target_machine_id,
        requested_by = %user.id,
        "queued command"
    );
    Ok(Json(command))
}

pub async fn list_commands(
    State(state): State<AppState>,
    user: FrontEndUser,
    Query(query): Query<CommandListQuery>,
) -> ApiResult<Vec<CommandView>> {
    state.require_allowed(&user.id).await.map_err(map_state_err)?;
    let filter = CommandFilter {
        machine_id: query.machine_id,
        state: query.state,
        requested_by: query.mine.then(|| user.id.clone()),
    };
    let commands = state.list_commands(&filter).await.map_err(map_state_err)?;
    Ok(Json(commands))
}

pub async fn get_command(
    State(state): State<AppState>,
    user: FrontEndUser,
    Path(command_id): Path<i64>,
) -> ApiResult<CommandView> {
    state.require_allowed(&user.id).await.map_err(map_state_err)?;
    let command = state.get_command(command_id).await.map_err(map_state_err)?;
    Ok(Json(command))
}

/// Agent poll. Authentication doubles as the machine's liveness ping.
pub async fn poll_pending(
    State(state): State<AppState>,
    credentials: MachineCredentials,
) -> ApiResult<Vec<PendingCommand>> {
    state
        .authenticate_machine(&credentials.machine_id, &credentials.secret)
        .await
        .map_err(map_state_err)?;
    let pending = state
        .pending_for_machine(&credentials.machine_id)
        .await
        .map_err(map_state_err)?;
    if !pending.is_empty() {
        debug!(
            machine = %credentials.machine_id,
            count = pending.len(),
            "served pending commands"
        );
    }
    Ok(Json(pending))
}

pub async fn claim_command(
    State(state): State<AppState>,
    credentials: MachineCredentials,
    Path(command_id): Path<i64>,
) -> ApiResult<serde_json::Value> {
    state
        .authenticate_machine(&credentials.machine_id, &credentials.secret)
        .await
        .map_err(map_state_err)?;
    state
        .claim_command(command_id, &credentials.machine_id)
        .await
        .map_err(map_state_err)?;
    debug!(command = command_id, machine = %credentials.machine_id, "command claimed");
    Ok(Json(serde_json::json!({ "claimed": true })))
}

pub async fn report_result(
    State(state): State<AppState>,
    credentials: MachineCredentials,
    Path(command_id): Path<i64>,
    Json(report): Json<CommandReport>,
) -> ApiResult<CommandView> {
    if report.output.is_some() == report.error.is_some() {
        return Err(ApiError::BadRequest(
            "exactly one of output or error must be set".into(),
        ));
    }
    state
        .authenticate_machine(&credentials.machine_id, &credentials.secret)
        .await
        .map_err(map_state_err)?;
    match state
        .report_result(command_id, &credentials.machine_id, &report)
        .await
    {
        Ok(command) => {
            info!(
                command = command_id,
                machine = %credentials.machine_id,
                state = %command.state,
                "recorded command result"
            );
            Ok(Json(command))
        }
        Err(StateError::CommandFinished(state)) => {
            // Late result after a watchdog transition: expected, discarded.
            warn!(
                command = command_id,
                machine = %credentials.machine_id,
                %state,
                "discarding result for already-finished command"
            );
            Err(ApiError::Gone("command already finished"))
        }
        Err(err) => Err(map_state_err(err)),
    }
}
