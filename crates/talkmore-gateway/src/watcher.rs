//! Per-connection subscription to a user's chat record.
//!
//! A watcher turns each committed change of the user's record into a
//! [`GatewayEvent::ConversationUpdated`] and hands it to the registry, which
//! pushes it to every live connection of that user.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use talkmore_db::changes::{ChangeStream, FeedError, RecordChange};
use talkmore_types::events::GatewayEvent;

use crate::registry::ConnectionRegistry;

/// How a watcher stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEnd {
    Cancelled,
    /// The change feed went away. The watcher does not resubscribe.
    FeedClosed,
}

pub fn event_for(change: RecordChange) -> GatewayEvent {
    GatewayEvent::ConversationUpdated {
        revision: change.revision,
        chat: change.chat,
        message: change.message,
    }
}

/// Forward changes from `changes` until `cancel` fires or the feed closes.
pub async fn watch_user(
    mut changes: ChangeStream,
    registry: ConnectionRegistry,
    cancel: CancellationToken,
) -> WatchEnd {
    let user_id = changes.owner_id().to_string();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(user_id, "Watcher cancelled");
                return WatchEnd::Cancelled;
            }
            next = changes.next() => match next {
                Ok(change) => {
                    let revision = change.revision;
                    let delivered = registry.broadcast(&user_id, event_for(change)).await;
                    trace!(user_id, revision, delivered, "Pushed record change");
                }
                // Already reported by the stream; keep going with what is left.
                Err(FeedError::Lagged(_)) => continue,
                Err(FeedError::Closed) => {
                    error!(user_id, "Change feed closed, watcher stopping");
                    return WatchEnd::FeedClosed;
                }
            }
        }
    }
}

pub fn spawn_watcher(
    changes: ChangeStream,
    registry: ConnectionRegistry,
    cancel: CancellationToken,
) -> JoinHandle<WatchEnd> {
    tokio::spawn(watch_user(changes, registry, cancel))
}
