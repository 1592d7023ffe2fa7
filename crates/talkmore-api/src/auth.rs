use std::str::FromStr;
use std::sync::Arc;

use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use rand_core::OsRng;
use tracing::info;
use uuid::Uuid;

use talkmore_db::{FanOut, Store};
use talkmore_types::api::{
    ApiResponse, RefreshTokenRequest, SignInRequest, SignInResponse, SignUpRequest,
};
use talkmore_types::models::{Profile, TokenPair};

use crate::error::{ApiError, ApiJson, ApiResult};
use crate::middleware::AuthUser;
use crate::tokens::{AuthMode, INVALID_ACCESS_TOKEN, TokenService};

const INVALID_CREDENTIALS: &str = "invalid email or password";

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub store: Store,
    pub fanout: FanOut,
    pub tokens: TokenService,
    pub logout_policy: LogoutPolicy,
}

impl AppStateInner {
    /// Resolve an access token to the caller. Used by the REST middleware and
    /// the socket upgrade.
    pub async fn authenticate(&self, token: &str) -> ApiResult<AuthUser> {
        let claims = self.tokens.authenticate(token).await?;
        let profile = self
            .store
            .get_profile(&claims.sub)
            .await?
            .ok_or(ApiError::Unauthorized(INVALID_ACCESS_TOKEN))?;
        Ok(AuthUser { claims, profile })
    }
}

/// What `POST /api/logout` does when tokens are not checked server-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutPolicy {
    /// Answer 400; the token stays valid until it expires.
    Reject,
    /// Answer success without doing anything.
    Noop,
}

impl FromStr for LogoutPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "noop" => Ok(Self::Noop),
            other => Err(format!("unknown logout policy '{}' (expected reject or noop)", other)),
        }
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

fn sign_in_response(user_id: String, pair: TokenPair) -> SignInResponse {
    SignInResponse {
        user_id,
        access_token: pair.access_token,
        refresh_token: pair.refresh_token,
    }
}

pub async fn signup(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<SignUpRequest>,
) -> ApiResult<impl IntoResponse> {
    let email = normalize_email(&req.email);
    if !email.contains('@') || email.len() > 254 {
        return Err(ApiError::Validation("a valid email is required".into()));
    }
    let first_name = req.first_name.trim();
    let last_name = req.last_name.trim();
    if first_name.is_empty() {
        return Err(ApiError::Validation("first name is required".into()));
    }
    if first_name.len() > 64 || last_name.len() > 64 {
        return Err(ApiError::Validation("names must be at most 64 characters".into()));
    }
    if req.password.len() < 8 {
        return Err(ApiError::Validation("password must be at least 8 characters".into()));
    }

    if state.store.get_user_by_email(&email).await?.is_some() {
        return Err(ApiError::Conflict("email already registered"));
    }

    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|e| ApiError::Internal(format!("password hashing failed: {}", e)))?
        .to_string();

    // The lookup above is only a fast path; a concurrent signup can still win the insert.
    let user_id = Uuid::new_v4().to_string();
    let created = state
        .store
        .create_user(&user_id, &email, &password_hash, first_name, last_name)
        .await?;
    if !created {
        return Err(ApiError::Conflict("email already registered"));
    }

    let pair = state.tokens.issue(&user_id, &email).await?;
    info!(user_id, "Account created");

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok("account created", sign_in_response(user_id, pair))),
    ))
}

pub async fn signin(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<SignInRequest>,
) -> ApiResult<Json<ApiResponse<SignInResponse>>> {
    let user = state
        .store
        .get_user_by_email(&normalize_email(&req.email))
        .await?
        .ok_or(ApiError::Unauthorized(INVALID_CREDENTIALS))?;

    let parsed_hash = PasswordHash::new(&user.password)
        .map_err(|e| ApiError::Internal(format!("stored password hash unreadable: {}", e)))?;
    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| ApiError::Unauthorized(INVALID_CREDENTIALS))?;

    let pair = state.tokens.issue(&user.id, &user.email).await?;
    info!(user_id = %user.id, "Signed in");

    Ok(Json(ApiResponse::ok("signed in", sign_in_response(user.id, pair))))
}

pub async fn refresh_token(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<RefreshTokenRequest>,
) -> ApiResult<Json<ApiResponse<TokenPair>>> {
    let pair = state.tokens.refresh(&req.refresh_token).await?;
    Ok(Json(ApiResponse::ok("token refreshed", pair)))
}

pub async fn logout(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<ApiResponse<()>>> {
    match (state.tokens.mode(), state.logout_policy) {
        (AuthMode::Checked, _) => {
            state.tokens.revoke(&user.profile.user_id).await?;
            info!(user_id = %user.profile.user_id, "Logged out");
        }
        (AuthMode::Stateless, LogoutPolicy::Reject) => return Err(ApiError::LogoutUnsupported),
        (AuthMode::Stateless, LogoutPolicy::Noop) => {}
    }
    Ok(Json(ApiResponse::empty("logged out")))
}

pub async fn my_profile(Extension(user): Extension<AuthUser>) -> Json<ApiResponse<Profile>> {
    Json(ApiResponse::ok("profile", user.profile))
}
