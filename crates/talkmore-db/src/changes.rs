//! In-process change feed for chat records.
//!
//! Every committed append publishes a [`RecordChange`] carrying the touched
//! conversation header and the appended message. Subscribers receive only the
//! changes of the owner they asked for, in commit order.
//!
//! The feed only observes writes made through this process's [`Database`]
//! handles. Writers in other processes sharing the same file are not seen.
//!
//! [`Database`]: crate::Database

use tokio::sync::broadcast;
use tracing::warn;

use talkmore_types::models::{ConversationSummary, Message};

/// Buffered changes per subscriber before it is reported as lagging.
const FEED_CAPACITY: usize = 1024;

/// A committed mutation of one user's chat record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordChange {
    pub owner_id: String,
    pub revision: u64,
    pub chat: ConversationSummary,
    pub message: Message,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FeedError {
    /// The subscriber fell behind and `0` changes were dropped. Not terminal.
    #[error("change feed lagged by {0} changes")]
    Lagged(u64),
    /// The feed is gone; no further changes will arrive.
    #[error("change feed closed")]
    Closed,
}

#[derive(Clone)]
pub struct ChangeFeed {
    tx: broadcast::Sender<RecordChange>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, change: RecordChange) {
        // No subscribers is the normal idle state.
        let _ = self.tx.send(change);
    }

    pub fn subscribe(&self, owner_id: &str) -> ChangeStream {
        ChangeStream {
            owner_id: owner_id.to_string(),
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

/// Changes of a single owner's record.
pub struct ChangeStream {
    owner_id: String,
    rx: broadcast::Receiver<RecordChange>,
}

impl ChangeStream {
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Wait for the next change to this owner's record.
    pub async fn next(&mut self) -> Result<RecordChange, FeedError> {
        loop {
            match self.rx.recv().await {
                Ok(change) if change.owner_id == self.owner_id => return Ok(change),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(owner_id = %self.owner_id, "Change stream lagged by {} changes", n);
                    return Err(FeedError::Lagged(n));
                }
                Err(broadcast::error::RecvError::Closed) => return Err(FeedError::Closed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn change(owner: &str, revision: u64) -> RecordChange {
        let now = Utc::now();
        RecordChange {
            owner_id: owner.to_string(),
            revision,
            chat: ConversationSummary {
                sub_id: "peer".into(),
                date: now,
                name: String::new(),
                profile: String::new(),
                is_unread: true,
                last_message: "hi".into(),
            },
            message: Message {
                id: Uuid::new_v4(),
                sender_id: "peer".into(),
                destination: owner.to_string(),
                message: "hi".into(),
                date: now,
                name: String::new(),
                profile: String::new(),
                email: String::new(),
            },
        }
    }

    #[tokio::test]
    async fn stream_only_sees_its_owner() {
        let feed = ChangeFeed::new();
        let mut stream = feed.subscribe("u2");

        feed.publish(change("u1", 1));
        feed.publish(change("u2", 1));
        feed.publish(change("u2", 2));

        assert_eq!(stream.next().await.unwrap().revision, 1);
        let second = stream.next().await.unwrap();
        assert_eq!(second.owner_id, "u2");
        assert_eq!(second.revision, 2);
    }

    #[tokio::test]
    async fn dropping_the_feed_closes_streams() {
        let feed = ChangeFeed::new();
        let mut stream = feed.subscribe("u1");
        drop(feed);
        assert_eq!(stream.next().await, Err(FeedError::Closed));
    }
}
