use axum::{extract::State, Json};
use tracing::info;

use runnel_proto::{MachineSummary, RegisterMachineRequest, RegisterMachineResponse};

use crate::state::AppState;

use super::{map_state_err, ApiError, ApiResult, FrontEndUser};

/// Agent-side registration. Unauthenticated: this is the call that issues
/// the credentials everything else requires.
pub async fn register_machine(
    State(state): State<AppState>,
    Json(request): Json<RegisterMachineRequest>,
) -> ApiResult<RegisterMachineResponse> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("machine name required".into()));
    }
    let response = state.register_machine(name).await.map_err(map_state_err)?;
    info!(machine = %response.machine_id, name, "registered machine");
    Ok(Json(response))
}

pub async fn list_machines(
    State(state): State<AppState>,
    user: FrontEndUser,
) -> ApiResult<Vec<MachineSummary>> {
    state.require_allowed(&user.id).await.map_err(map_state_err)?;
    let machines = state.list_machines().await.map_err(map_state_err)?;
    Ok(Json(machines))
}
