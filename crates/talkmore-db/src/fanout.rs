//! Fan-out coordinator: writes one logical message into both participants'
//! conversations. The REST send endpoint and the socket read loop both go
//! through [`FanOut::send`].

use chrono::Utc;
use tracing::{error, info};
use uuid::Uuid;

use talkmore_types::api::OutgoingMessage;
use talkmore_types::models::{Message, Profile};

use crate::store::{Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("invalid message: {0}")]
    Invalid(&'static str),

    /// Nothing was written.
    #[error("could not store the sender's copy: {0}")]
    SenderCopy(#[source] StoreError),

    /// The sender's copy exists but the receiver's does not. Not retried.
    #[error("stored for sender but not for receiver: {0}")]
    ReceiverCopy(#[source] StoreError),
}

#[derive(Clone)]
pub struct FanOut {
    store: Store,
}

impl FanOut {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Deliver `outgoing` from `sender` to its destination. Returns the
    /// sender's stored copy of the message.
    pub async fn send(
        &self,
        sender: &Profile,
        outgoing: OutgoingMessage,
    ) -> Result<Message, DeliveryError> {
        let destination = outgoing.destination.trim();
        if destination.is_empty() {
            return Err(DeliveryError::Invalid("destination is required"));
        }
        if outgoing.message.is_empty() {
            return Err(DeliveryError::Invalid("message is required"));
        }

        // The client describes the destination; that snapshot labels the
        // sender's side of the conversation.
        let destination_snapshot = outgoing.destination_snapshot();
        let sender_copy = Message {
            id: Uuid::new_v4(),
            sender_id: sender.user_id.clone(),
            destination: destination.to_string(),
            message: outgoing.message,
            date: Utc::now(),
            name: destination_snapshot.name.clone(),
            profile: destination_snapshot.profile.clone(),
            email: destination_snapshot.email.clone(),
        };

        self.store
            .append_message(&sender.user_id, destination, &sender_copy, &destination_snapshot)
            .await
            .map_err(DeliveryError::SenderCopy)?;

        // The receiver sees the sender's own identity.
        let sender_snapshot = sender.snapshot();
        let receiver_copy = sender_copy.with_snapshot(&sender_snapshot);

        if let Err(e) = self
            .store
            .append_message(destination, &sender.user_id, &receiver_copy, &sender_snapshot)
            .await
        {
            error!(
                sender = %sender.user_id,
                destination,
                message_id = %sender_copy.id,
                "Partial delivery, receiver copy missing: {}",
                e
            );
            return Err(DeliveryError::ReceiverCopy(e));
        }

        info!(
            sender = %sender.user_id,
            destination,
            message_id = %sender_copy.id,
            "Message delivered"
        );
        Ok(sender_copy)
    }
}
