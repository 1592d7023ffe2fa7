use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Row, TransactionBehavior};
use tracing::debug;

use talkmore_types::models::{ConversationSummary, Message, PeerSnapshot};

use crate::changes::RecordChange;
use crate::models::AppendOutcome;
use crate::queries::OptionalExt;
use crate::Database;

impl Database {
    /// Append `message` to `owner_id`'s conversation with `peer_id`, creating
    /// the owner's record and the conversation entry on first contact.
    ///
    /// Runs as one IMMEDIATE transaction: the conversation entry is written with
    /// a single `ON CONFLICT` upsert against `UNIQUE(owner_id, sub_id)`, so
    /// concurrent first messages from the same peer converge on one entry.
    /// Replaying a message id already in the conversation changes nothing.
    pub fn append_message(
        &self,
        owner_id: &str,
        peer_id: &str,
        message: &Message,
        peer: &PeerSnapshot,
    ) -> Result<AppendOutcome> {
        let date = timestamp(&message.date);
        let message_id = message.id.to_string();
        let is_unread = owner_id != message.sender_id;

        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let replay = tx
                .query_row(
                    "SELECT 1 FROM messages WHERE owner_id = ?1 AND sub_id = ?2 AND id = ?3",
                    (owner_id, peer_id, &message_id),
                    |_| Ok(()),
                )
                .optional()?;
            if replay.is_some() {
                return Ok(AppendOutcome::AlreadyPresent);
            }

            let revision: i64 = tx.query_row(
                "INSERT INTO chat_records (owner_id, revision, updated_at) VALUES (?1, 1, ?2)
                 ON CONFLICT(owner_id) DO UPDATE
                    SET revision = revision + 1, updated_at = excluded.updated_at
                 RETURNING revision",
                (owner_id, timestamp(&Utc::now())),
                |row| row.get(0),
            )?;

            let existed = tx
                .query_row(
                    "SELECT 1 FROM conversations WHERE owner_id = ?1 AND sub_id = ?2",
                    (owner_id, peer_id),
                    |_| Ok(()),
                )
                .optional()?
                .is_some();

            tx.execute(
                "INSERT INTO conversations (owner_id, sub_id, date, name, profile, is_unread, last_message)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(owner_id, sub_id) DO UPDATE SET
                    date = excluded.date,
                    name = excluded.name,
                    profile = excluded.profile,
                    is_unread = excluded.is_unread,
                    last_message = excluded.last_message",
                rusqlite::params![
                    owner_id,
                    peer_id,
                    date,
                    peer.name,
                    peer.profile,
                    is_unread,
                    message.message
                ],
            )?;

            tx.execute(
                "INSERT INTO messages
                    (owner_id, sub_id, id, sender_id, destination, body, date, name, profile, email)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    owner_id,
                    peer_id,
                    message_id,
                    message.sender_id,
                    message.destination,
                    message.message,
                    date,
                    message.name,
                    message.profile,
                    message.email
                ],
            )?;

            tx.commit()?;

            let revision = revision as u64;
            if existed {
                debug!(owner_id, sub_id = peer_id, revision, "Appended message to conversation");
            } else {
                debug!(owner_id, sub_id = peer_id, revision, "Created conversation");
            }

            // Published under the connection lock so changes from this handle
            // leave in revision order.
            self.changes().publish(RecordChange {
                owner_id: owner_id.to_string(),
                revision,
                chat: ConversationSummary {
                    sub_id: peer_id.to_string(),
                    date: message.date,
                    name: peer.name.clone(),
                    profile: peer.profile.clone(),
                    is_unread,
                    last_message: message.message.clone(),
                },
                message: message.clone(),
            });

            Ok(AppendOutcome::Appended {
                revision,
                created_entry: !existed,
            })
        })
    }

    /// A page of the owner's conversations, most recent activity first.
    pub fn list_conversations(
        &self,
        owner_id: &str,
        skip: u32,
        limit: u32,
    ) -> Result<Vec<ConversationSummary>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT sub_id, date, name, profile, is_unread, last_message
                 FROM conversations
                 WHERE owner_id = ?1
                 ORDER BY date DESC, id DESC
                 LIMIT ?2 OFFSET ?3",
            )?;

            let rows = stmt
                .query_map(rusqlite::params![owner_id, limit, skip], summary_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    pub fn get_conversation(
        &self,
        owner_id: &str,
        sub_id: &str,
    ) -> Result<Option<ConversationSummary>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT sub_id, date, name, profile, is_unread, last_message
                 FROM conversations
                 WHERE owner_id = ?1 AND sub_id = ?2",
                (owner_id, sub_id),
                summary_from_row,
            )
            .optional()
        })
    }

    /// A page of one conversation's messages, newest first.
    pub fn get_messages(
        &self,
        owner_id: &str,
        sub_id: &str,
        skip: u32,
        limit: u32,
    ) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sender_id, destination, body, date, name, profile, email
                 FROM messages
                 WHERE owner_id = ?1 AND sub_id = ?2
                 ORDER BY seq DESC
                 LIMIT ?3 OFFSET ?4",
            )?;

            let rows = stmt
                .query_map(rusqlite::params![owner_id, sub_id, limit, skip], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Number of conversation entries the owner has with `sub_id`.
    pub fn count_conversations_with(&self, owner_id: &str, sub_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM conversations WHERE owner_id = ?1 AND sub_id = ?2",
                (owner_id, sub_id),
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }

    pub fn record_revision(&self, owner_id: &str) -> Result<u64> {
        self.with_conn(|conn| {
            let revision: Option<i64> = conn
                .query_row(
                    "SELECT revision FROM chat_records WHERE owner_id = ?1",
                    [owner_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(revision.unwrap_or(0) as u64)
        })
    }
}

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
fn timestamp(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<ConversationSummary> {
    Ok(ConversationSummary {
        sub_id: row.get(0)?,
        date: timestamp_column(row, 1)?,
        name: row.get(2)?,
        profile: row.get(3)?,
        is_unread: row.get(4)?,
        last_message: row.get(5)?,
    })
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    let raw_id: String = row.get(0)?;
    let id = raw_id
        .parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;

    Ok(Message {
        id,
        sender_id: row.get(1)?,
        destination: row.get(2)?,
        message: row.get(3)?,
        date: timestamp_column(row, 4)?,
        name: row.get(5)?,
        profile: row.get(6)?,
        email: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use uuid::Uuid;

    fn message(sender: &str, destination: &str, body: &str) -> Message {
        Message {
            id: Uuid::new_v4(),
            sender_id: sender.to_string(),
            destination: destination.to_string(),
            message: body.to_string(),
            date: Utc::now(),
            name: String::new(),
            profile: String::new(),
            email: String::new(),
        }
    }

    fn peer(name: &str) -> PeerSnapshot {
        PeerSnapshot {
            name: name.to_string(),
            email: format!("{}@example.com", name),
            profile: String::new(),
        }
    }

    #[test]
    fn first_message_creates_record_and_entry() {
        let db = Database::open_in_memory().unwrap();
        let msg = message("u1", "u2", "hi");

        let outcome = db.append_message("u1", "u2", &msg, &peer("bob")).unwrap();
        assert_eq!(
            outcome,
            AppendOutcome::Appended { revision: 1, created_entry: true }
        );

        let chat = db.get_conversation("u1", "u2").unwrap().unwrap();
        assert_eq!(chat.name, "bob");
        assert_eq!(chat.last_message, "hi");
        assert!(!chat.is_unread, "sender's own copy is read");

        let stored = db.get_messages("u1", "u2", 0, 10).unwrap();
        assert_eq!(stored, vec![msg]);
    }

    #[test]
    fn receiver_copy_is_unread() {
        let db = Database::open_in_memory().unwrap();
        let msg = message("u1", "u2", "hi");

        db.append_message("u2", "u1", &msg, &peer("alice")).unwrap();

        let chat = db.get_conversation("u2", "u1").unwrap().unwrap();
        assert!(chat.is_unread);
        assert_eq!(chat.last_message, "hi");
    }

    #[test]
    fn appends_keep_completion_order() {
        let db = Database::open_in_memory().unwrap();
        let sent: Vec<Message> = (0..20)
            .map(|i| message("u1", "u2", &format!("m{}", i)))
            .collect();

        for msg in &sent {
            db.append_message("u1", "u2", msg, &peer("bob")).unwrap();
        }

        let mut stored = db.get_messages("u1", "u2", 0, 100).unwrap();
        stored.reverse();
        assert_eq!(stored, sent);
        assert_eq!(db.record_revision("u1").unwrap(), 20);

        let page = db.get_messages("u1", "u2", 2, 3).unwrap();
        let bodies: Vec<&str> = page.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(bodies, vec!["m17", "m16", "m15"]);
    }

    #[test]
    fn replayed_message_is_not_duplicated() {
        let db = Database::open_in_memory().unwrap();
        let msg = message("u1", "u2", "hi");

        db.append_message("u1", "u2", &msg, &peer("bob")).unwrap();
        let again = db.append_message("u1", "u2", &msg, &peer("bob")).unwrap();

        assert_eq!(again, AppendOutcome::AlreadyPresent);
        assert_eq!(db.get_messages("u1", "u2", 0, 10).unwrap().len(), 1);
        assert_eq!(db.record_revision("u1").unwrap(), 1);
    }

    #[test]
    fn chat_list_is_newest_activity_first() {
        let db = Database::open_in_memory().unwrap();
        let start = Utc::now();
        for (i, peer_id) in ["u2", "u3", "u4"].into_iter().enumerate() {
            let mut msg = message("u1", peer_id, peer_id);
            msg.date = start + chrono::Duration::seconds(i as i64);
            db.append_message("u1", peer_id, &msg, &peer(peer_id)).unwrap();
        }
        let mut reply = message("u2", "u1", "again");
        reply.date = start + chrono::Duration::seconds(10);
        db.append_message("u1", "u2", &reply, &peer("u2")).unwrap();

        let chats = db.list_conversations("u1", 0, 10).unwrap();
        let order: Vec<&str> = chats.iter().map(|c| c.sub_id.as_str()).collect();
        assert_eq!(order, vec!["u2", "u4", "u3"]);

        let page = db.list_conversations("u1", 1, 1).unwrap();
        assert_eq!(page[0].sub_id, "u4");
    }

    #[test]
    fn unknown_owner_reads_as_empty() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.list_conversations("ghost", 0, 10).unwrap().is_empty());
        assert!(db.get_messages("ghost", "u1", 0, 10).unwrap().is_empty());
        assert_eq!(db.record_revision("ghost").unwrap(), 0);
    }

    /// Two first-contact messages from the same peer used to race between
    /// "find the entry" and "insert a new entry", leaving two entries for one
    /// peer. Hammer that window from several connections to the same file.
    #[test]
    fn concurrent_first_contact_creates_single_entry() {
        const WRITERS: usize = 8;
        const ROUNDS: usize = 10;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("race.db");

        // Open sequentially so migrations don't race each other.
        let handles: Vec<Arc<Database>> = (0..WRITERS)
            .map(|_| Arc::new(Database::open(&path).unwrap()))
            .collect();

        for round in 0..ROUNDS {
            let owner = format!("owner-{}", round);
            let barrier = Arc::new(Barrier::new(WRITERS));

            let threads: Vec<_> = handles
                .iter()
                .cloned()
                .map(|db| {
                    let barrier = barrier.clone();
                    let owner = owner.clone();
                    thread::spawn(move || {
                        let msg = message("peer", &owner, "first!");
                        barrier.wait();
                        db.append_message(&owner, "peer", &msg, &peer("peer")).unwrap()
                    })
                })
                .collect();

            let created = threads
                .into_iter()
                .map(|t| t.join().unwrap())
                .filter(|outcome| {
                    matches!(outcome, AppendOutcome::Appended { created_entry: true, .. })
                })
                .count();

            let db = &handles[0];
            assert_eq!(db.count_conversations_with(&owner, "peer").unwrap(), 1);
            assert_eq!(created, 1, "exactly one writer creates the entry");
            assert_eq!(db.get_messages(&owner, "peer", 0, 100).unwrap().len(), WRITERS);
            assert_eq!(db.record_revision(&owner).unwrap(), WRITERS as u64);
        }
    }
}
