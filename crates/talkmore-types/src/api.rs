use serde::{Deserialize, Serialize};

use crate::models::{Message, PeerSnapshot, Profile};

// -- JWT Claims --

/// JWT claims shared across talkmore-api (REST middleware, token service) and
/// the server's WebSocket upgrade handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    /// Present on access tokens only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub iss: String,
    pub iat: u64,
    pub exp: u64,
    /// Rotation id. Present on refresh tokens only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    /// Rotation id of the pair an access token was issued with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
}

// -- Envelope --

/// Every REST response is wrapped in this envelope. `data` and `error` are
/// always present, `null` when unused.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            error: None,
        }
    }

    pub fn empty(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            error: Some(error.into()),
        }
    }
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignUpRequest {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignInRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SignInResponse {
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefreshTokenRequest {
    pub refresh_token: String,
}

// -- Messages --

/// A chat message as submitted by a client, over REST or the socket.
///
/// `name`, `email` and `profile` describe the destination user as the sender
/// sees them; they become the sender's snapshot of the conversation peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub destination: String,
    pub message: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub profile: String,
}

impl OutgoingMessage {
    pub fn destination_snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            name: self.name.clone(),
            email: self.email.clone(),
            profile: self.profile.clone(),
        }
    }
}

/// Returned by `POST /api/message`: who the message went out as, and the
/// sender's stored copy.
#[derive(Debug, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub sender: Profile,
    pub message: Message,
}

#[derive(Debug, Deserialize)]
pub struct ChatListRequest {
    #[serde(default)]
    pub skip: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

#[derive(Debug, Deserialize)]
pub struct GetMessagesRequest {
    pub sub_id: String,
    #[serde(default)]
    pub skip: u32,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}
