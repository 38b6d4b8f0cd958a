mod auth;
mod commands;
mod machines;
mod users;

use axum::{
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tracing::error;

use crate::state::{AppState, StateError};

pub use auth::{FrontEndUser, MachineCredentials};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/whoami", get(users::whoami))
        .route("/users/:platform_user_id/allowed", post(users::set_allowed))
        .route("/machines", get(machines::list_machines))
        .route("/machines/register", post(machines::register_machine))
        .route("/scripts", post(commands::register_script))
        .route(
            "/commands",
            post(commands::create_command).get(commands::list_commands),
        )
        .route("/commands/pending", get(commands::poll_pending))
        .route("/commands/:command_id", get(commands::get_command))
        .route("/commands/:command_id/claim", post(commands::claim_command))
        .route("/commands/:command_id/result", post(commands::report_result))
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    Forbidden(&'static str),
    NotFound(&'static str),
    Conflict(&'static str),
    Gone(&'static str),
    BadRequest(String),
    Internal,
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = match self {
            ApiError::Unauthorized => (axum::http::StatusCode::UNAUTHORIZED, "unauthorized", None),
            ApiError::Forbidden(msg) => (
                axum::http::StatusCode::FORBIDDEN,
                "forbidden",
                Some(msg.to_string()),
            ),
            ApiError::NotFound(msg) => (
                axum::http::StatusCode::NOT_FOUND,
                "not_found",
                Some(msg.to_string()),
            ),
            ApiError::Conflict(msg) => (
                axum::http::StatusCode::CONFLICT,
                "conflict",
                Some(msg.to_string()),
            ),
            ApiError::Gone(msg) => (
                axum::http::StatusCode::GONE,
                "gone",
                Some(msg.to_string()),
            ),
            ApiError::BadRequest(msg) => (
                axum::http::StatusCode::BAD_REQUEST,
                "bad_request",
                Some(msg),
            ),
            ApiError::Internal => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                None,
            ),
        };
        (status, Json(ApiErrorBody { error, message })).into_response()
    }
}

pub(crate) fn map_state_err(err: StateError) -> ApiError {
    match err {
        StateError::MachineNotFound => ApiError::NotFound("machine not found"),
        StateError::ScriptNotFound => ApiError::NotFound("script not found"),
        StateError::CommandNotFound => ApiError::NotFound("command not found"),
        StateError::ScriptNameTaken => ApiError::Conflict("script name already registered"),
        StateError::AlreadyClaimed => ApiError::Conflict("command already claimed"),
        StateError::NotClaimant => ApiError::Forbidden("command was claimed by a different machine"),
        StateError::CommandFinished(_) => ApiError::Gone("command already finished"),
        StateError::Unauthorized => ApiError::Unauthorized,
        StateError::Forbidden => ApiError::Forbidden("operation not permitted for this user"),
        StateError::CorruptState(raw) => {
            error!(state = %raw, "corrupt command state in store");
            ApiError::Internal
        }
        StateError::Database(e) => {
            error!(error = %e, "database operation failed");
            ApiError::Internal
        }
    }
}
