use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Public identity of a user, as resolved from a bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    /// Avatar URL.
    pub profile: String,
}

impl Profile {
    pub fn display_name(&self) -> String {
        match (self.first_name.is_empty(), self.last_name.is_empty()) {
            (false, false) => format!("{} {}", self.first_name, self.last_name),
            (false, true) => self.first_name.clone(),
            (true, false) => self.last_name.clone(),
            (true, true) => String::new(),
        }
    }

    /// The identity fields that get denormalized into a peer's conversation.
    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            name: self.display_name(),
            email: self.email.clone(),
            profile: self.profile.clone(),
        }
    }
}

/// Display data copied into a conversation entry or message at send time.
/// Never updated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub name: String,
    pub email: String,
    pub profile: String,
}

/// A single chat message. Immutable once appended to a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender_id: String,
    pub destination: String,
    pub message: String,
    pub date: DateTime<Utc>,
    pub name: String,
    pub profile: String,
    pub email: String,
}

impl Message {
    /// Copy of this message carrying a different identity snapshot.
    pub fn with_snapshot(&self, snapshot: &PeerSnapshot) -> Self {
        Self {
            name: snapshot.name.clone(),
            profile: snapshot.profile.clone(),
            email: snapshot.email.clone(),
            ..self.clone()
        }
    }
}

/// Header of one conversation entry, without its message history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub sub_id: String,
    pub date: DateTime<Utc>,
    pub name: String,
    pub profile: String,
    pub is_unread: bool,
    pub last_message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}
