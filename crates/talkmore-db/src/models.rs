/// Database row types. These map directly to SQLite rows.
/// Distinct from talkmore-types API models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub profile_url: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub refresh_id: Option<String>,
    pub revoked: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// Result of appending a message to one user's conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The message was written; the owner's record is now at `revision`.
    Appended { revision: u64, created_entry: bool },
    /// The same message id was already present in that conversation.
    AlreadyPresent,
}
