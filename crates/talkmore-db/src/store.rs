//! Async access to the [`Database`] for request handlers and per-connection
//! tasks. Every call runs on the blocking pool and is bounded by a timeout so a
//! stalled disk cannot pin a task forever.

use std::sync::Arc;
use std::time::Duration;

use tracing::error;

use talkmore_types::models::{ConversationSummary, Message, PeerSnapshot, Profile};

use crate::Database;
use crate::changes::ChangeStream;
use crate::models::{AppendOutcome, UserRow};

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{op} timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },

    #[error("{op} failed: {source}")]
    Backend {
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("{op} task failed: {source}")]
    Task {
        op: &'static str,
        #[source]
        source: tokio::task::JoinError,
    },
}

#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
    timeout: Duration,
}

impl Store {
    pub fn new(db: Arc<Database>, timeout: Duration) -> Self {
        Self { db, timeout }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Run a blocking database call off the async runtime.
    ///
    /// On timeout the blocking call is not interrupted; it may still complete
    /// after the caller has given up.
    pub async fn run<F, T>(&self, op: &'static str, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        let task = tokio::task::spawn_blocking(move || f(&db));

        match tokio::time::timeout(self.timeout, task).await {
            Err(_) => {
                error!(op, timeout = ?self.timeout, "Store operation timed out");
                Err(StoreError::Timeout { op, timeout: self.timeout })
            }
            Ok(Err(source)) => {
                error!(op, "spawn_blocking join error: {}", source);
                Err(StoreError::Task { op, source })
            }
            Ok(Ok(result)) => result.map_err(|source| StoreError::Backend { op, source }),
        }
    }

    pub fn watch(&self, owner_id: &str) -> ChangeStream {
        self.db.watch(owner_id)
    }

    // -- Conversations --

    pub async fn append_message(
        &self,
        owner_id: &str,
        peer_id: &str,
        message: &Message,
        peer: &PeerSnapshot,
    ) -> Result<AppendOutcome, StoreError> {
        let owner_id = owner_id.to_string();
        let peer_id = peer_id.to_string();
        let message = message.clone();
        let peer = peer.clone();
        self.run("append_message", move |db| {
            db.append_message(&owner_id, &peer_id, &message, &peer)
        })
        .await
    }

    pub async fn list_conversations(
        &self,
        owner_id: &str,
        skip: u32,
        limit: u32,
    ) -> Result<Vec<ConversationSummary>, StoreError> {
        let owner_id = owner_id.to_string();
        self.run("list_conversations", move |db| {
            db.list_conversations(&owner_id, skip, limit)
        })
        .await
    }

    pub async fn get_messages(
        &self,
        owner_id: &str,
        sub_id: &str,
        skip: u32,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError> {
        let owner_id = owner_id.to_string();
        let sub_id = sub_id.to_string();
        self.run("get_messages", move |db| {
            db.get_messages(&owner_id, &sub_id, skip, limit)
        })
        .await
    }

    // -- Credentials & identity --

    pub async fn get_profile(&self, user_id: &str) -> Result<Option<Profile>, StoreError> {
        let user_id = user_id.to_string();
        self.run("get_profile", move |db| db.get_profile(&user_id)).await
    }

    pub async fn get_user_by_id(&self, user_id: &str) -> Result<Option<UserRow>, StoreError> {
        let user_id = user_id.to_string();
        self.run("get_user_by_id", move |db| db.get_user_by_id(&user_id)).await
    }

    pub async fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>, StoreError> {
        let email = email.to_string();
        self.run("get_user_by_email", move |db| db.get_user_by_email(&email)).await
    }

    pub async fn create_user(
        &self,
        id: &str,
        email: &str,
        password_hash: &str,
        first_name: &str,
        last_name: &str,
    ) -> Result<bool, StoreError> {
        let (id, email, password_hash, first_name, last_name) = (
            id.to_string(),
            email.to_string(),
            password_hash.to_string(),
            first_name.to_string(),
            last_name.to_string(),
        );
        self.run("create_user", move |db| {
            db.create_user(&id, &email, &password_hash, &first_name, &last_name)
        })
        .await
    }

    pub async fn store_tokens(
        &self,
        user_id: &str,
        access_token: &str,
        refresh_token: &str,
        refresh_id: &str,
    ) -> Result<bool, StoreError> {
        let (user_id, access, refresh, refresh_id) = (
            user_id.to_string(),
            access_token.to_string(),
            refresh_token.to_string(),
            refresh_id.to_string(),
        );
        self.run("store_tokens", move |db| {
            db.store_tokens(&user_id, &access, &refresh, &refresh_id)
        })
        .await
    }

    pub async fn rotate_tokens(
        &self,
        user_id: &str,
        expected_refresh: &str,
        access_token: &str,
        refresh_token: &str,
        refresh_id: &str,
    ) -> Result<bool, StoreError> {
        let (user_id, expected, access, refresh, refresh_id) = (
            user_id.to_string(),
            expected_refresh.to_string(),
            access_token.to_string(),
            refresh_token.to_string(),
            refresh_id.to_string(),
        );
        self.run("rotate_tokens", move |db| {
            db.rotate_tokens(&user_id, &expected, &access, &refresh, &refresh_id)
        })
        .await
    }

    pub async fn access_token_active(
        &self,
        user_id: &str,
        access_token: &str,
    ) -> Result<bool, StoreError> {
        let (user_id, access) = (user_id.to_string(), access_token.to_string());
        self.run("access_token_active", move |db| {
            db.access_token_active(&user_id, &access)
        })
        .await
    }

    pub async fn revoke_tokens(&self, user_id: &str) -> Result<bool, StoreError> {
        let user_id = user_id.to_string();
        self.run("revoke_tokens", move |db| db.revoke_tokens(&user_id)).await
    }
}
