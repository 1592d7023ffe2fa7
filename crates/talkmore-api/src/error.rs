use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use tracing::error;

use talkmore_db::{DeliveryError, StoreError};
use talkmore_types::api::ApiResponse;

use crate::tokens::AuthError;

/// Handler error. Every variant renders as an [`ApiResponse`] envelope with
/// `success: false`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed or incomplete request body.
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthorized(&'static str),

    #[error("{0}")]
    Conflict(&'static str),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error("logout not supported in stateless mode")]
    LogoutUnsupported,

    #[error("{0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unauthorized(msg) => Self::Unauthorized(msg),
            AuthError::Storage(e) => Self::Storage(e),
            AuthError::UnknownUser(id) => Self::Internal(format!("no user record for {}", id)),
            AuthError::Signing(e) => Self::Internal(format!("token signing failed: {}", e)),
        }
    }
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            Self::Validation(msg) => (StatusCode::BAD_REQUEST, "invalid request", msg.clone()),
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, "unauthorized", msg.to_string()),
            Self::Conflict(msg) => (StatusCode::CONFLICT, "conflict", msg.to_string()),
            Self::Delivery(DeliveryError::Invalid(msg)) => {
                (StatusCode::BAD_REQUEST, "invalid request", msg.to_string())
            }
            Self::Delivery(e) => {
                error!(error = %e, "Message delivery failed");
                (StatusCode::BAD_GATEWAY, "delivery failed", e.to_string())
            }
            Self::Storage(e) => {
                error!(error = %e, "Storage error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "storage error",
                    "storage unavailable".to_string(),
                )
            }
            Self::LogoutUnsupported => (StatusCode::BAD_REQUEST, "invalid request", self.to_string()),
            Self::Internal(msg) => {
                error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error",
                    "an internal error occurred".to_string(),
                )
            }
        }
    }

    pub fn status(&self) -> StatusCode {
        self.parts().0
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, error) = self.parts();
        (status, Json(ApiResponse::<()>::failure(message, error))).into_response()
    }
}

/// `Json` extractor whose rejections use the envelope instead of a plain-text
/// body.
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(rejection.into()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}
