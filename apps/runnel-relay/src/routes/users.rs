use axum::{
    extract::{Path, State},
    Json,
};
use tracing::info;

use runnel_proto::{SetAllowedRequest, UserView};

use crate::state::AppState;

use super::{map_state_err, ApiResult, FrontEndUser};

/// Open to any authenticated front-end identity; creates the user row on
/// first sight so later admin decisions have something to point at.
pub async fn whoami(State(state): State<AppState>, user: FrontEndUser) -> ApiResult<UserView> {
    let view = state
        .ensure_user(&user.id, user.display_name.as_deref())
        .await
        .map_err(map_state_err)?;
    Ok(Json(view))
}

pub async fn set_allowed(
    State(state): State<AppState>,
    user: FrontEndUser,
    Path(platform_user_id): Path<String>,
    Json(body): Json<SetAllowedRequest>,
) -> ApiResult<UserView> {
    let view = state
        .set_allowed(&user.id, &platform_user_id, body.allowed)
        .await
        .map_err(map_state_err)?;
    info!(
        actor = %user.id,
        target = %platform_user_id,
        allowed = body.allowed,
        "updated user authorization"
    );
    Ok(Json(view))
}
