use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};

use runnel_proto::{MACHINE_HEADER, USER_HEADER, USER_NAME_HEADER};

use crate::state::AppState;

use super::ApiError;

/// Acting chat identity forwarded by the front-end. When an API token is
/// configured, the front-end's shared bearer token must match before the
/// identity headers are trusted.
#[derive(Clone, Debug)]
pub struct FrontEndUser {
    pub id: String,
    pub display_name: Option<String>,
}

#[async_trait]
impl FromRequestParts<AppState> for FrontEndUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if let Some(expected) = state.api_token() {
            match bearer_token(&parts.headers) {
                Some(presented) if presented == expected => {}
                _ => return Err(ApiError::Unauthorized),
            }
        }
        let id = header_value(&parts.headers, USER_HEADER).ok_or(ApiError::Unauthorized)?;
        let display_name = header_value(&parts.headers, USER_NAME_HEADER);
        Ok(Self { id, display_name })
    }
}

/// Machine credentials presented on agent-facing calls. Extraction only
/// parses the headers; handlers verify them against the store before
/// touching the command queue.
#[derive(Clone, Debug)]
pub struct MachineCredentials {
    pub machine_id: String,
    pub secret: String,
}

#[async_trait]
impl<S> FromRequestParts<S> for MachineCredentials
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let machine_id =
            header_value(&parts.headers, MACHINE_HEADER).ok_or(ApiError::Unauthorized)?;
        let secret = bearer_token(&parts.headers)
            .map(str::to_owned)
            .ok_or(ApiError::Unauthorized)?;
        Ok(Self { machine_id, secret })
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_owned())
}
