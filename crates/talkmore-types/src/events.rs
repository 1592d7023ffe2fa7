use serde::{Deserialize, Serialize};

use crate::models::{ConversationSummary, Message};

/// Events pushed over the `/ws/messages` connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms the connection is open and registered
    Ready { user_id: String, name: String },

    /// A conversation of this user gained a message. `revision` is the
    /// owner's record revision after the write.
    ConversationUpdated {
        revision: u64,
        chat: ConversationSummary,
        message: Message,
    },

    /// A message submitted on this connection could not be delivered
    DeliveryFailed { destination: String, reason: String },
}

impl GatewayEvent {
    /// Store revision carried by the event, if it reflects a stored change.
    pub fn revision(&self) -> Option<u64> {
        match self {
            Self::ConversationUpdated { revision, .. } => Some(*revision),
            _ => None,
        }
    }
}
