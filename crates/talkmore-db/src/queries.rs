use crate::models::UserRow;
use crate::Database;
use anyhow::Result;
use rusqlite::{Connection, ErrorCode, Row};
use talkmore_types::models::Profile;

const USER_COLUMNS: &str = "id, email, password, first_name, last_name, profile_url, \
     access_token, refresh_token, refresh_id, revoked, created_at, updated_at";

impl Database {
    // -- Users --

    /// Insert a new user. Returns false if the email is already taken.
    pub fn create_user(
        &self,
        id: &str,
        email: &str,
        password_hash: &str,
        first_name: &str,
        last_name: &str,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            match conn.execute(
                "INSERT INTO users (id, email, password, first_name, last_name) VALUES (?1, ?2, ?3, ?4, ?5)",
                (id, email, password_hash, first_name, last_name),
            ) {
                Ok(_) => Ok(true),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    Ok(false)
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "email", email))
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user(conn, "id", id))
    }

    /// Identity lookup: the public profile of a user.
    pub fn get_profile(&self, id: &str) -> Result<Option<Profile>> {
        Ok(self.get_user_by_id(id)?.map(|user| Profile {
            user_id: user.id,
            first_name: user.first_name,
            last_name: user.last_name,
            email: user.email,
            profile: user.profile_url,
        }))
    }

    // -- Tokens --

    /// Replace the user's token pair and clear the revoked flag.
    /// Returns false if the user does not exist.
    pub fn store_tokens(
        &self,
        user_id: &str,
        access_token: &str,
        refresh_token: &str,
        refresh_id: &str,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users
                 SET access_token = ?2, refresh_token = ?3, refresh_id = ?4,
                     revoked = 0, updated_at = datetime('now')
                 WHERE id = ?1",
                (user_id, access_token, refresh_token, refresh_id),
            )?;
            Ok(changed == 1)
        })
    }

    /// Swap in a new token pair only if `expected_refresh` is still the stored
    /// refresh token and the session is not revoked. Two refreshes racing on the
    /// same token cannot both win.
    pub fn rotate_tokens(
        &self,
        user_id: &str,
        expected_refresh: &str,
        access_token: &str,
        refresh_token: &str,
        refresh_id: &str,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users
                 SET access_token = ?3, refresh_token = ?4, refresh_id = ?5,
                     updated_at = datetime('now')
                 WHERE id = ?1 AND refresh_token = ?2 AND revoked = 0",
                (user_id, expected_refresh, access_token, refresh_token, refresh_id),
            )?;
            Ok(changed == 1)
        })
    }

    /// True when `access_token` is the user's current token and the session
    /// has not been revoked.
    pub fn access_token_active(&self, user_id: &str, access_token: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM users WHERE id = ?1 AND access_token = ?2 AND revoked = 0",
                    (user_id, access_token),
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    pub fn revoke_tokens(&self, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET revoked = 1, updated_at = datetime('now') WHERE id = ?1",
                [user_id],
            )?;
            Ok(changed == 1)
        })
    }
}

fn query_user(conn: &Connection, column: &str, value: &str) -> Result<Option<UserRow>> {
    let mut stmt =
        conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users WHERE {column} = ?1"))?;

    let row = stmt.query_row([value], user_from_row).optional()?;

    Ok(row)
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<UserRow> {
    Ok(UserRow {
        id: row.get(0)?,
        email: row.get(1)?,
        password: row.get(2)?,
        first_name: row.get(3)?,
        last_name: row.get(4)?,
        profile_url: row.get(5)?,
        access_token: row.get(6)?,
        refresh_token: row.get(7)?,
        refresh_id: row.get(8)?,
        revoked: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

/// Extension trait for optional query results
pub(crate) trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
