use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};

use talkmore_types::api::Claims;
use talkmore_types::models::Profile;

use crate::auth::AppState;
use crate::error::ApiError;
use crate::tokens::INVALID_ACCESS_TOKEN;

/// The caller of an authenticated request, inserted as a request extension.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub claims: Claims,
    pub profile: Profile,
}

/// Bearer token from the `Authorization` header, if well formed.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .typed_get::<Authorization<Bearer>>()
        .map(|auth| auth.token().to_string())
}

/// Authenticate the bearer token and resolve the caller's identity before any
/// handler runs.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(req.headers()).ok_or(ApiError::Unauthorized(INVALID_ACCESS_TOKEN))?;
    let user = state.authenticate(&token).await?;

    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}
