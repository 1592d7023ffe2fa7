use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tracing::debug;
use uuid::Uuid;

use talkmore_types::events::GatewayEvent;

/// Users are spread over this many independently locked shards.
const SHARD_COUNT: usize = 32;

pub type EventSender = mpsc::UnboundedSender<GatewayEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<GatewayEvent>;

/// user_id -> (conn_id -> sender)
type Shard = Mutex<HashMap<String, HashMap<Uuid, EventSender>>>;

/// Tracks every live connection by user and delivers events to them.
///
/// Operations on one user are serialized by that user's shard lock; users in
/// different shards never contend. Delivery is a non-blocking channel push,
/// so no socket I/O happens while a shard is locked.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    shards: Vec<Shard>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            inner: Arc::new(RegistryInner { shards }),
        }
    }

    fn shard(&self, user_id: &str) -> &Shard {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        &self.inner.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Register a new connection for `user_id`. Returns (conn_id, receiver).
    pub async fn register(&self, user_id: &str) -> (Uuid, EventReceiver) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.shard(user_id)
            .lock()
            .await
            .entry(user_id.to_string())
            .or_default()
            .insert(conn_id, tx);
        debug!(user_id, %conn_id, "Connection registered");
        (conn_id, rx)
    }

    /// Remove a connection. Removing one that is already gone is a no-op;
    /// returns whether anything was removed.
    pub async fn unregister(&self, user_id: &str, conn_id: Uuid) -> bool {
        let mut shard = self.shard(user_id).lock().await;
        let Some(conns) = shard.get_mut(user_id) else {
            return false;
        };
        let removed = conns.remove(&conn_id).is_some();
        if conns.is_empty() {
            shard.remove(user_id);
        }
        if removed {
            debug!(user_id, %conn_id, "Connection unregistered");
        }
        removed
    }

    /// Deliver `event` to every connection registered for `user_id` right now.
    /// Returns how many connections accepted it. Connections whose receiver
    /// has gone away are dropped from the registry.
    pub async fn broadcast(&self, user_id: &str, event: GatewayEvent) -> usize {
        let mut shard = self.shard(user_id).lock().await;
        let Some(conns) = shard.get_mut(user_id) else {
            return 0;
        };

        let before = conns.len();
        conns.retain(|_, tx| tx.send(event.clone()).is_ok());
        let delivered = conns.len();

        if delivered < before {
            debug!(user_id, dropped = before - delivered, "Pruned closed connections");
        }
        if conns.is_empty() {
            shard.remove(user_id);
        }
        delivered
    }

    /// Deliver `event` to one specific connection.
    pub async fn send_to_connection(&self, user_id: &str, conn_id: Uuid, event: GatewayEvent) -> bool {
        let shard = self.shard(user_id).lock().await;
        shard
            .get(user_id)
            .and_then(|conns| conns.get(&conn_id))
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    pub async fn connection_count(&self, user_id: &str) -> usize {
        self.shard(user_id)
            .lock()
            .await
            .get(user_id)
            .map_or(0, HashMap::len)
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
