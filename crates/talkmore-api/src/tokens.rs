//! Session tokens: HS256 access/refresh pairs with server-side rotation and
//! revocation.
//!
//! Access tokens live for an hour and carry the rotation id of their pair in
//! `sid`. Refresh tokens live for 30 days and carry it in `jti`. The stored pair
//! on the user record is the source of truth for rotation and, in
//! [`AuthMode::Checked`], for every authenticated request.

use std::str::FromStr;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use tracing::debug;

use talkmore_db::{Store, StoreError};
use talkmore_types::api::Claims;
use talkmore_types::models::TokenPair;

pub const ISSUER: &str = "talkmore";

/// Access token lifetime in seconds.
pub const ACCESS_TOKEN_TTL_SECS: u64 = 60 * 60;
/// Refresh token lifetime in seconds.
pub const REFRESH_TOKEN_TTL_SECS: u64 = 30 * 24 * 60 * 60;

pub const INVALID_ACCESS_TOKEN: &str = "invalid or expired access token";
pub const INVALID_REFRESH_TOKEN: &str = "invalid or expired refresh token";

/// How authenticated requests are checked. Fixed at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// Signature and expiry only. Revocation has no effect until expiry.
    Stateless,
    /// Also require the token to be the user's current access token and the
    /// session not to be revoked.
    Checked,
}

impl FromStr for AuthMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stateless" => Ok(Self::Stateless),
            "checked" => Ok(Self::Checked),
            other => Err(format!("unknown auth mode '{}' (expected stateless or checked)", other)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The message names the token kind only, never the cause.
    #[error("{0}")]
    Unauthorized(&'static str),

    #[error("token storage failed: {0}")]
    Storage(#[from] StoreError),

    /// Tokens were requested for a user with no stored record.
    #[error("no user record for {0}")]
    UnknownUser(String),

    #[error("token signing failed: {0}")]
    Signing(#[from] jsonwebtoken::errors::Error),
}

#[derive(Clone)]
pub struct TokenService {
    store: Store,
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    mode: AuthMode,
}

impl TokenService {
    pub fn new(store: Store, secret: &str, mode: AuthMode) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);
        validation.leeway = 0;

        Self {
            store,
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            mode,
        }
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    /// Issue a fresh pair for a user who just proved their credentials.
    /// Replaces any stored pair and clears revocation.
    pub async fn issue(&self, user_id: &str, email: &str) -> Result<TokenPair, AuthError> {
        let (pair, rotation_id) = self.mint(user_id, email)?;
        let stored = self
            .store
            .store_tokens(user_id, &pair.access_token, &pair.refresh_token, &rotation_id)
            .await?;
        if !stored {
            return Err(AuthError::UnknownUser(user_id.to_string()));
        }
        debug!(user_id, "Issued token pair");
        Ok(pair)
    }

    /// Signature, issuer and expiry only.
    pub fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        self.decode(token, INVALID_ACCESS_TOKEN)
    }

    /// Trade a refresh token for a new pair. Each refresh token works once.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let claims = self.decode(refresh_token, INVALID_REFRESH_TOKEN)?;
        if claims.jti.is_none() {
            return Err(AuthError::Unauthorized(INVALID_REFRESH_TOKEN));
        }

        let user = self
            .store
            .get_user_by_id(&claims.sub)
            .await?
            .ok_or(AuthError::Unauthorized(INVALID_REFRESH_TOKEN))?;
        if user.revoked || user.refresh_token.as_deref() != Some(refresh_token) {
            return Err(AuthError::Unauthorized(INVALID_REFRESH_TOKEN));
        }

        let (pair, rotation_id) = self.mint(&user.id, &user.email)?;
        let rotated = self
            .store
            .rotate_tokens(
                &user.id,
                refresh_token,
                &pair.access_token,
                &pair.refresh_token,
                &rotation_id,
            )
            .await?;
        if !rotated {
            // Lost a race with another refresh or a revoke.
            return Err(AuthError::Unauthorized(INVALID_REFRESH_TOKEN));
        }

        debug!(user_id = %user.id, "Rotated token pair");
        Ok(pair)
    }

    pub async fn revoke(&self, user_id: &str) -> Result<(), AuthError> {
        self.store.revoke_tokens(user_id).await?;
        debug!(user_id, "Revoked session");
        Ok(())
    }

    /// Check an access token presented on an authenticated path.
    pub async fn authenticate(&self, token: &str) -> Result<Claims, AuthError> {
        let claims = self.decode(token, INVALID_ACCESS_TOKEN)?;
        if claims.jti.is_some() {
            // A refresh token is not an access token.
            return Err(AuthError::Unauthorized(INVALID_ACCESS_TOKEN));
        }

        match self.mode {
            AuthMode::Stateless => Ok(claims),
            AuthMode::Checked => {
                if self.store.access_token_active(&claims.sub, token).await? {
                    Ok(claims)
                } else {
                    Err(AuthError::Unauthorized(INVALID_ACCESS_TOKEN))
                }
            }
        }
    }

    fn decode(&self, token: &str, context: &'static str) -> Result<Claims, AuthError> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                debug!("Token rejected: {}", e);
                AuthError::Unauthorized(context)
            })
    }

    fn mint(&self, user_id: &str, email: &str) -> Result<(TokenPair, String), AuthError> {
        let now = Utc::now().timestamp().max(0) as u64;
        let rotation_id = hex::encode(rand::random::<[u8; 16]>());

        let access = Claims {
            sub: user_id.to_string(),
            email: Some(email.to_string()),
            iss: ISSUER.to_string(),
            iat: now,
            exp: now + ACCESS_TOKEN_TTL_SECS,
            jti: None,
            sid: Some(rotation_id.clone()),
        };
        let refresh = Claims {
            sub: user_id.to_string(),
            email: None,
            iss: ISSUER.to_string(),
            iat: now,
            exp: now + REFRESH_TOKEN_TTL_SECS,
            jti: Some(rotation_id.clone()),
            sid: None,
        };

        let header = Header::new(Algorithm::HS256);
        let pair = TokenPair {
            access_token: encode(&header, &access, &self.encoding)?,
            refresh_token: encode(&header, &refresh, &self.encoding)?,
        };
        Ok((pair, rotation_id))
    }
}
