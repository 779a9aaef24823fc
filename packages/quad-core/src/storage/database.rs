//! # Database
//!
//! SQLite-backed reference implementation of [`ChatBackend`] and
//! [`ProfileSource`].
//!
//! ## Database Operations
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      DATABASE OPERATIONS                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────┐                                                   │
//! │  │   ChatSession   │                                                   │
//! │  └────────┬────────┘                                                   │
//! │           │ ChatBackend                                                │
//! │           ▼                                                             │
//! │  ┌─────────────────┐        ┌──────────────────┐                       │
//! │  │    Database     │───────▶│ LocalChangeFeed  │  row changes,         │
//! │  │   (this file)   │        └──────────────────┘  published after      │
//! │  │                 │                              the lock is released │
//! │  │  - authorization (membership, mute, admin-only, manage rights)     │
//! │  │  - overview maintenance (derived per member on every write)        │
//! │  │  - ensure_direct_conversation (idempotent)                         │
//! │  └────────┬────────┘                                                   │
//! │           ▼                                                             │
//! │  ┌─────────────────┐                                                   │
//! │  │    rusqlite     │  In-memory for tests, file for the demo           │
//! │  └─────────────────┘                                                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::HashMap;
use std::sync::Arc;

use super::records::{
    ConversationRow, MembershipRow, MessageRow, NewMessage, OverviewEntry, OverviewLastMessage,
};
use super::{schema, ChatBackend};
use crate::error::{Error, Result};
use crate::identity::{Profile, ProfileSource};
use crate::model::{ConversationKind, Member, Partner, Reaction, Role};
use crate::realtime::{ChangeEvent, LocalChangeFeed, Row};
use crate::time::{Clock, SystemClock};

const MEMBER_COLUMNS: &str = "conversation_id, user_id, role, can_post, can_manage_members, \
     can_manage_messages, mute_expires_at, last_read_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, ciphertext, created_at, \
     edited_at, deleted, reply_to, forwarded_from";

const CONVERSATION_COLUMNS: &str = "id, kind, name, team_id, recruitment_id, created_at, archived";

/// Deterministic id of the direct conversation between two users
pub fn direct_conversation_id(user1: &str, user2: &str) -> String {
    use sha2::{Digest, Sha256};

    // Sort to make the id independent of who initiates
    let (first, second) = if user1 < user2 { (user1, user2) } else { (user2, user1) };

    let mut hasher = Sha256::new();
    hasher.update(first.as_bytes());
    hasher.update(b"|");
    hasher.update(second.as_bytes());

    let hash = hasher.finalize();
    hex::encode(&hash[..16])
}

/// The reference database
///
/// Wraps a SQLite connection and plays the role of the server: it stores
/// rows, authorizes mutations and publishes row changes.
pub struct Database {
    /// The underlying SQLite connection
    conn: Arc<Mutex<Connection>>,
    /// Where row changes are published
    feed: Option<Arc<LocalChangeFeed>>,
    /// Server time
    clock: Arc<dyn Clock>,
}

impl Database {
    /// Open or create a database
    ///
    /// If path is None, creates an in-memory database (useful for testing).
    pub async fn open(path: Option<&str>) -> Result<Self> {
        let conn = match path {
            Some(p) => Connection::open(p)
                .map_err(|e| Error::DatabaseError(format!("Failed to open database: {}", e)))?,
            None => Connection::open_in_memory().map_err(|e| {
                Error::DatabaseError(format!("Failed to create in-memory database: {}", e))
            })?,
        };

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            feed: None,
            clock: Arc::new(SystemClock),
        };

        db.init_schema()?;

        Ok(db)
    }

    /// Publish row changes to `feed`
    pub fn with_change_feed(mut self, feed: Arc<LocalChangeFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Use `clock` for server-assigned timestamps
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Initialize the database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(|e| Error::DatabaseError(format!("Failed to enable foreign keys: {}", e)))?;

        let version: Option<i32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .ok();

        match version {
            None => {
                conn.execute_batch(schema::CREATE_TABLES)
                    .map_err(|e| Error::DatabaseError(format!("Failed to create tables: {}", e)))?;

                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    params![schema::SCHEMA_VERSION],
                )
                .map_err(|e| Error::DatabaseError(format!("Failed to set schema version: {}", e)))?;

                tracing::info!("Database schema created (version {})", schema::SCHEMA_VERSION);
            }
            Some(v) => {
                tracing::debug!("Database schema version: {}", v);
            }
        }

        Ok(())
    }

    fn publish(&self, events: Vec<ChangeEvent>) {
        if let Some(feed) = &self.feed {
            for event in events {
                feed.publish(event);
            }
        }
    }

    // ========================================================================
    // SEEDING
    // ========================================================================

    /// Insert or update a user profile
    pub fn upsert_user(&self, id: &str, name: &str, handle: &str, avatar: Option<&str>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO users (id, name, handle, avatar) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, handle = excluded.handle,
                 avatar = excluded.avatar",
            params![id, name, handle, avatar],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to upsert user: {}", e)))?;
        Ok(())
    }

    /// Create a conversation with no members
    pub fn create_conversation(&self, conversation: &ConversationRow) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO conversations (id, kind, name, team_id, recruitment_id, created_at, archived)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                conversation.id,
                conversation.kind.as_str(),
                conversation.name,
                conversation.team_id,
                conversation.recruitment_id,
                conversation.created_at,
                conversation.archived,
            ],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to create conversation: {}", e)))?;
        Ok(())
    }

    /// Add a member (and their overview entry)
    pub fn add_member(&self, member: &Member) -> Result<()> {
        let now = self.clock.now_millis();
        let row = {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO members (conversation_id, user_id, role, can_post, can_manage_members,
                     can_manage_messages, mute_expires_at, last_read_at, joined_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    member.conversation_id,
                    member.user_id,
                    member.role.as_str(),
                    member.can_post,
                    member.can_manage_members,
                    member.can_manage_messages,
                    member.mute_expires_at,
                    member.last_read_at,
                    now,
                ],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to add member: {}", e)))?;

            refresh_overview(&conn, &member.conversation_id, &member.user_id)?;
            membership_row(&conn, &member.conversation_id, &member.user_id)?
        };

        if let Some(row) = row {
            self.publish(vec![ChangeEvent::insert(Row::Membership(row))]);
        }
        Ok(())
    }

    /// Write an overview entry directly, bypassing the membership ledger.
    ///
    /// Reproduces the state where the denormalized feed is ahead of the
    /// ledger (e.g. right after a friend request is accepted).
    pub fn upsert_overview(&self, viewer: &str, entry: &OverviewEntry) -> Result<()> {
        let conn = self.conn.lock();
        let partner = entry.partner.as_ref();
        let last = entry.last_message.as_ref();
        conn.execute(
            "INSERT INTO overview (viewer_id, conversation_id, kind, name, partner_id, partner_name,
                 partner_handle, partner_avatar, last_message_id, last_sender_id, last_ciphertext,
                 last_at, unread_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(viewer_id, conversation_id) DO UPDATE SET
                 kind = excluded.kind, name = excluded.name, partner_id = excluded.partner_id,
                 partner_name = excluded.partner_name, partner_handle = excluded.partner_handle,
                 partner_avatar = excluded.partner_avatar, last_message_id = excluded.last_message_id,
                 last_sender_id = excluded.last_sender_id, last_ciphertext = excluded.last_ciphertext,
                 last_at = excluded.last_at, unread_count = excluded.unread_count,
                 created_at = excluded.created_at",
            params![
                viewer,
                entry.conversation_id,
                entry.kind.as_str(),
                entry.name,
                partner.map(|p| p.user_id.as_str()),
                partner.map(|p| p.profile.name.as_str()),
                partner.map(|p| p.profile.handle.as_str()),
                partner.and_then(|p| p.profile.avatar.as_deref()),
                last.map(|m| m.message_id.as_str()),
                last.map(|m| m.sender_id.as_str()),
                last.map(|m| m.ciphertext.as_str()),
                last.map(|m| m.at),
                entry.unread_count,
                entry.created_at,
            ],
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to upsert overview: {}", e)))?;
        Ok(())
    }

    /// Hard-delete soft-deleted messages created before `before`.
    ///
    /// Subscribers see these as `Delete` changes.
    pub fn purge_deleted_messages(&self, before: i64) -> Result<usize> {
        let purged = {
            let conn = self.conn.lock();
            let rows = select_messages(
                &conn,
                &format!(
                    "SELECT {} FROM messages WHERE deleted = 1 AND created_at < ?1",
                    MESSAGE_COLUMNS
                ),
                params![before],
            )?;
            conn.execute(
                "DELETE FROM messages WHERE deleted = 1 AND created_at < ?1",
                params![before],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to purge messages: {}", e)))?;
            rows
        };

        let count = purged.len();
        self.publish(
            purged
                .into_iter()
                .map(|row| ChangeEvent::delete(Row::Message(row)))
                .collect(),
        );
        Ok(count)
    }

    // ========================================================================
    // READS
    // ========================================================================

    /// Membership rows of `viewer`
    pub fn get_memberships(&self, viewer: &str) -> Result<Vec<MembershipRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT conversation_id, user_id, role, last_read_at, joined_at
                 FROM members WHERE user_id = ? ORDER BY joined_at, conversation_id",
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params![viewer], membership_from_row)
            .map_err(|e| Error::DatabaseError(format!("Failed to query memberships: {}", e)))?;

        let mut memberships = Vec::new();
        for row in rows {
            memberships.push(
                row.map_err(|e| Error::DatabaseError(format!("Failed to read membership: {}", e)))?,
            );
        }
        Ok(memberships)
    }

    /// Overview feed of `viewer`, most recent first
    pub fn get_overview(&self, viewer: &str) -> Result<Vec<OverviewEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(
                "SELECT conversation_id, kind, name, partner_id, partner_name, partner_handle,
                     partner_avatar, last_message_id, last_sender_id, last_ciphertext, last_at,
                     unread_count, created_at
                 FROM overview WHERE viewer_id = ?
                 ORDER BY COALESCE(last_at, created_at) DESC, conversation_id",
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params![viewer], |row| {
                let kind: String = row.get(1)?;
                let partner_id: Option<String> = row.get(3)?;
                let last_message_id: Option<String> = row.get(7)?;

                let partner = match partner_id {
                    Some(user_id) => Some(Partner {
                        profile: Profile {
                            name: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                            handle: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                            avatar: row.get(6)?,
                        },
                        user_id,
                    }),
                    None => None,
                };

                let last_message = match last_message_id {
                    Some(message_id) => Some(OverviewLastMessage {
                        message_id,
                        sender_id: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
                        ciphertext: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
                        at: row.get::<_, Option<i64>>(10)?.unwrap_or_default(),
                    }),
                    None => None,
                };

                Ok(OverviewEntry {
                    conversation_id: row.get(0)?,
                    kind: ConversationKind::parse(&kind).unwrap_or(ConversationKind::Group),
                    name: row.get(2)?,
                    partner,
                    last_message,
                    unread_count: row.get(11)?,
                    created_at: row.get(12)?,
                })
            })
            .map_err(|e| Error::DatabaseError(format!("Failed to query overview: {}", e)))?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(
                row.map_err(|e| Error::DatabaseError(format!("Failed to read overview: {}", e)))?,
            );
        }
        Ok(entries)
    }

    /// Conversation rows for `ids`
    pub fn get_conversations(&self, ids: &[String]) -> Result<Vec<ConversationRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM conversations WHERE id IN ({})",
            CONVERSATION_COLUMNS,
            placeholders(ids.len())
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params_from_iter(ids.iter()), conversation_from_row)
            .map_err(|e| Error::DatabaseError(format!("Failed to query conversations: {}", e)))?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(
                row.map_err(|e| Error::DatabaseError(format!("Failed to read conversation: {}", e)))?,
            );
        }
        Ok(conversations)
    }

    /// Roster rows for all `ids`
    pub fn get_rosters(&self, ids: &[String]) -> Result<Vec<Member>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {} FROM members WHERE conversation_id IN ({})
             ORDER BY conversation_id, joined_at, user_id",
            MEMBER_COLUMNS,
            placeholders(ids.len())
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;

        let rows = stmt
            .query_map(params_from_iter(ids.iter()), member_from_row)
            .map_err(|e| Error::DatabaseError(format!("Failed to query rosters: {}", e)))?;

        let mut members = Vec::new();
        for row in rows {
            members.push(row.map_err(|e| Error::DatabaseError(format!("Failed to read member: {}", e)))?);
        }
        Ok(members)
    }

    /// Messages for a conversation, oldest first
    pub fn get_messages(&self, conversation_id: &str, limit: usize, offset: usize) -> Result<Vec<MessageRow>> {
        let conn = self.conn.lock();
        let mut messages = select_messages(
            &conn,
            &format!(
                "SELECT {} FROM messages WHERE conversation_id = ?1
                 ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
                MESSAGE_COLUMNS
            ),
            params![conversation_id, limit as i64, offset as i64],
        )?;

        // Reverse to get chronological order
        messages.reverse();

        attach_reactions(&conn, &mut messages)?;
        Ok(messages)
    }

    /// Get a single message by ID
    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        let conn = self.conn.lock();
        let mut messages = select_messages(
            &conn,
            &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
            params![id],
        )?;
        attach_reactions(&conn, &mut messages)?;
        Ok(messages.pop())
    }

    // ========================================================================
    // MESSAGE WRITES
    // ========================================================================

    /// Store a new message on behalf of its sender
    pub fn store_message(&self, message: NewMessage) -> Result<MessageRow> {
        if message.ciphertext.is_empty() {
            return Err(Error::InvalidMessageContent("Message body is empty".into()));
        }
        let now = self.clock.now_millis();

        let row = {
            let conn = self.conn.lock();
            if conversation_kind(&conn, &message.conversation_id)?.is_none() {
                return Err(Error::ConversationNotFound);
            }

            let sender = load_member(&conn, &message.conversation_id, &message.sender_id)?
                .ok_or_else(|| {
                    Error::PermissionDenied("Sender is not a member of this conversation".into())
                })?;
            if let Some(until) = sender.mute_expires_at.filter(|t| *t > now) {
                return Err(Error::PermissionDenied(format!("Sender is muted until {}", until)));
            }
            if !sender.can_post && is_admin_only(&conn, &message.conversation_id)? {
                return Err(Error::PermissionDenied(
                    "Only admins can post in this conversation".into(),
                ));
            }

            let row = MessageRow {
                id: uuid::Uuid::new_v4().to_string(),
                conversation_id: message.conversation_id,
                sender_id: message.sender_id,
                ciphertext: message.ciphertext,
                created_at: now,
                edited_at: None,
                deleted: false,
                reply_to: message.reply_to,
                forwarded_from: message.forwarded_from,
                reactions: Some(Vec::new()),
            };

            conn.execute(
                "INSERT INTO messages (id, conversation_id, sender_id, ciphertext, created_at,
                     reply_to, forwarded_from)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    row.id,
                    row.conversation_id,
                    row.sender_id,
                    row.ciphertext,
                    row.created_at,
                    row.reply_to,
                    row.forwarded_from,
                ],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to store message: {}", e)))?;

            refresh_overview_all(&conn, &row.conversation_id)?;
            row
        };

        self.publish(vec![ChangeEvent::insert(Row::Message(row.clone()))]);
        Ok(row)
    }

    /// Replace a message's encoded body
    pub fn update_message_body(&self, id: &str, ciphertext: &str, edited_at: i64) -> Result<MessageRow> {
        let (before, after) = {
            let conn = self.conn.lock();
            let before = load_message(&conn, id)?.ok_or(Error::MessageNotFound)?;
            if before.deleted {
                return Err(Error::InvalidOperation("Cannot edit a deleted message".into()));
            }
            conn.execute(
                "UPDATE messages SET ciphertext = ?1, edited_at = ?2 WHERE id = ?3",
                params![ciphertext, edited_at, id],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to edit message: {}", e)))?;
            refresh_overview_all(&conn, &before.conversation_id)?;

            let after = load_message(&conn, id)?.ok_or(Error::MessageNotFound)?;
            (before, after)
        };

        self.publish(vec![ChangeEvent::update(
            Some(Row::Message(before)),
            Row::Message(after.clone()),
        )]);
        Ok(after)
    }

    /// Soft-delete a message
    pub fn soft_delete_message(&self, id: &str) -> Result<()> {
        let (before, after) = {
            let conn = self.conn.lock();
            let before = load_message(&conn, id)?.ok_or(Error::MessageNotFound)?;
            conn.execute(
                "UPDATE messages SET deleted = 1, ciphertext = '' WHERE id = ?1",
                params![id],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to delete message: {}", e)))?;
            refresh_overview_all(&conn, &before.conversation_id)?;

            let after = load_message(&conn, id)?.ok_or(Error::MessageNotFound)?;
            (before, after)
        };

        self.publish(vec![ChangeEvent::update(Some(Row::Message(before)), Row::Message(after))]);
        Ok(())
    }

    /// Add or remove a reaction and publish the message with its full reaction set
    fn change_reaction(&self, message_id: &str, user_id: &str, symbol: &str, add: bool) -> Result<()> {
        let now = self.clock.now_millis();
        let after = {
            let conn = self.conn.lock();
            let message = load_message(&conn, message_id)?.ok_or(Error::MessageNotFound)?;
            if load_member(&conn, &message.conversation_id, user_id)?.is_none() {
                return Err(Error::PermissionDenied("Not a member of this conversation".into()));
            }

            let changed = if add {
                conn.execute(
                    "INSERT OR IGNORE INTO reactions (message_id, user_id, symbol, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![message_id, user_id, symbol, now],
                )
            } else {
                conn.execute(
                    "DELETE FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND symbol = ?3",
                    params![message_id, user_id, symbol],
                )
            }
            .map_err(|e| Error::DatabaseError(format!("Failed to change reaction: {}", e)))?;

            if changed == 0 {
                return Ok(());
            }

            let mut rows = vec![message];
            attach_reactions(&conn, &mut rows)?;
            rows.pop()
        };

        if let Some(after) = after {
            self.publish(vec![ChangeEvent::update(None, Row::Message(after))]);
        }
        Ok(())
    }

    // ========================================================================
    // CONVERSATION PROCEDURES
    // ========================================================================

    /// Find or create the direct conversation of `viewer` and `partner`
    pub fn ensure_direct(&self, viewer: &str, partner: &str) -> Result<String> {
        if viewer == partner {
            return Err(Error::InvalidOperation(
                "A direct conversation needs two distinct users".into(),
            ));
        }
        let now = self.clock.now_millis();

        let (id, inserted) = {
            let conn = self.conn.lock();
            let (id, created_at) = find_direct(&conn, viewer, partner)?
                .unwrap_or_else(|| (direct_conversation_id(viewer, partner), now));

            conn.execute(
                "INSERT OR IGNORE INTO conversations (id, kind, created_at) VALUES (?1, 'direct', ?2)",
                params![id, created_at],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to create conversation: {}", e)))?;

            let mut inserted = Vec::new();
            for user in [viewer, partner] {
                let changed = conn
                    .execute(
                        "INSERT OR IGNORE INTO members (conversation_id, user_id, role, joined_at)
                         VALUES (?1, ?2, 'member', ?3)",
                        params![id, user, now],
                    )
                    .map_err(|e| Error::DatabaseError(format!("Failed to add member: {}", e)))?;
                if changed > 0 {
                    if let Some(row) = membership_row(&conn, &id, user)? {
                        inserted.push(row);
                    }
                }
            }
            refresh_overview_all(&conn, &id)?;
            (id, inserted)
        };

        if !inserted.is_empty() {
            tracing::info!("Direct conversation {} now has {} new member rows", id, inserted.len());
        }
        self.publish(
            inserted
                .into_iter()
                .map(|row| ChangeEvent::insert(Row::Membership(row)))
                .collect(),
        );
        Ok(id)
    }

    /// Delete a conversation and everything in it
    pub fn remove_conversation(&self, id: &str) -> Result<()> {
        let removed = {
            let conn = self.conn.lock();
            if conversation_kind(&conn, id)?.is_none() {
                return Err(Error::ConversationNotFound);
            }
            let removed = memberships_of(&conn, id)?;
            conn.execute_batch("BEGIN")
                .map_err(|e| Error::DatabaseError(format!("Failed to begin transaction: {}", e)))?;
            let result = (|| -> rusqlite::Result<()> {
                conn.execute(
                    "DELETE FROM reactions WHERE message_id IN
                         (SELECT id FROM messages WHERE conversation_id = ?1)",
                    params![id],
                )?;
                conn.execute("DELETE FROM messages WHERE conversation_id = ?1", params![id])?;
                conn.execute("DELETE FROM members WHERE conversation_id = ?1", params![id])?;
                conn.execute("DELETE FROM overview WHERE conversation_id = ?1", params![id])?;
                conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
                Ok(())
            })();
            match result {
                Ok(()) => conn
                    .execute_batch("COMMIT")
                    .map_err(|e| Error::DatabaseError(format!("Failed to commit: {}", e)))?,
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(Error::DatabaseError(format!("Failed to delete conversation: {}", e)));
                }
            }
            removed
        };

        tracing::info!("Deleted conversation {} ({} members)", id, removed.len());
        self.publish(
            removed
                .into_iter()
                .map(|row| ChangeEvent::delete(Row::Membership(row)))
                .collect(),
        );
        Ok(())
    }

    /// Remove `user_id` from a conversation
    pub fn leave(&self, id: &str, user_id: &str) -> Result<()> {
        let row = {
            let conn = self.conn.lock();
            let kind = conversation_kind(&conn, id)?.ok_or(Error::ConversationNotFound)?;
            let member = load_member(&conn, id, user_id)?.ok_or(Error::NotMember)?;
            if member.role == Role::Owner && !kind.is_direct() {
                return Err(Error::InvalidOperation(
                    "Owner cannot leave. Transfer ownership first.".into(),
                ));
            }
            let row = membership_row(&conn, id, user_id)?;
            delete_membership(&conn, id, user_id)?;
            row
        };

        if let Some(row) = row {
            self.publish(vec![ChangeEvent::delete(Row::Membership(row))]);
        }
        Ok(())
    }

    /// Move the read marker of `user_id` forward to `at`
    pub fn mark_read_until(&self, id: &str, user_id: &str, at: i64) -> Result<()> {
        let (before, after) = {
            let conn = self.conn.lock();
            let before = membership_row(&conn, id, user_id)?.ok_or(Error::NotMember)?;
            conn.execute(
                "UPDATE members SET last_read_at = MAX(COALESCE(last_read_at, 0), ?1)
                 WHERE conversation_id = ?2 AND user_id = ?3",
                params![at, id, user_id],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to update read marker: {}", e)))?;
            refresh_overview(&conn, id, user_id)?;
            let after = membership_row(&conn, id, user_id)?.ok_or(Error::NotMember)?;
            (before, after)
        };

        if before != after {
            self.publish(vec![ChangeEvent::update(
                Some(Row::Membership(before)),
                Row::Membership(after),
            )]);
        }
        Ok(())
    }

    // ========================================================================
    // MEMBER MANAGEMENT
    // ========================================================================

    /// Authorize `actor` to manage `target` in `conversation_id`
    fn authorize_manager(conn: &Connection, actor: &str, conversation_id: &str, target: &str) -> Result<Member> {
        let actor = load_member(conn, conversation_id, actor)?
            .ok_or_else(|| Error::PermissionDenied("Actor is not a member".into()))?;
        if !actor.can_manage_members {
            return Err(Error::PermissionDenied("Missing member management right".into()));
        }
        let target = load_member(conn, conversation_id, target)?.ok_or(Error::NotMember)?;
        if target.role == Role::Owner && actor.role != Role::Owner {
            return Err(Error::PermissionDenied("Only the owner can modify the owner".into()));
        }
        Ok(target)
    }

    /// Persist a member's role, rights and mute
    pub fn save_member(&self, actor: &str, member: &Member) -> Result<()> {
        let (before, after) = {
            let conn = self.conn.lock();
            Self::authorize_manager(&conn, actor, &member.conversation_id, &member.user_id)?;
            let before = membership_row(&conn, &member.conversation_id, &member.user_id)?;
            conn.execute(
                "UPDATE members SET role = ?1, can_post = ?2, can_manage_members = ?3,
                     can_manage_messages = ?4, mute_expires_at = ?5
                 WHERE conversation_id = ?6 AND user_id = ?7",
                params![
                    member.role.as_str(),
                    member.can_post,
                    member.can_manage_members,
                    member.can_manage_messages,
                    member.mute_expires_at,
                    member.conversation_id,
                    member.user_id,
                ],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to update member: {}", e)))?;
            let after = membership_row(&conn, &member.conversation_id, &member.user_id)?;
            (before, after)
        };

        if let Some(after) = after {
            self.publish(vec![ChangeEvent::update(
                before.map(Row::Membership),
                Row::Membership(after),
            )]);
        }
        Ok(())
    }

    /// Remove (ban) a member
    pub fn ban(&self, actor: &str, conversation_id: &str, user_id: &str) -> Result<()> {
        let row = {
            let conn = self.conn.lock();
            Self::authorize_manager(&conn, actor, conversation_id, user_id)?;
            let row = membership_row(&conn, conversation_id, user_id)?;
            delete_membership(&conn, conversation_id, user_id)?;
            row
        };

        if let Some(row) = row {
            self.publish(vec![ChangeEvent::delete(Row::Membership(row))]);
        }
        Ok(())
    }

    /// Clear mutes that expired at or before `now`
    pub fn clear_expired_mutes(&self, now: i64) -> Result<usize> {
        let updated = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare(
                    "SELECT conversation_id, user_id FROM members
                     WHERE mute_expires_at IS NOT NULL AND mute_expires_at <= ?1",
                )
                .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;
            let keys = stmt
                .query_map(params![now], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
                .map_err(|e| Error::DatabaseError(format!("Failed to query mutes: {}", e)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            drop(stmt);

            conn.execute(
                "UPDATE members SET mute_expires_at = NULL
                 WHERE mute_expires_at IS NOT NULL AND mute_expires_at <= ?1",
                params![now],
            )
            .map_err(|e| Error::DatabaseError(format!("Failed to clear mutes: {}", e)))?;

            let mut updated = Vec::with_capacity(keys.len());
            for (conversation_id, user_id) in keys {
                if let Some(row) = membership_row(&conn, &conversation_id, &user_id)? {
                    updated.push(row);
                }
            }
            updated
        };

        let count = updated.len();
        if count > 0 {
            tracing::debug!("Cleared {} expired mutes", count);
        }
        self.publish(
            updated
                .into_iter()
                .map(|row| ChangeEvent::update(None, Row::Membership(row)))
                .collect(),
        );
        Ok(count)
    }

    // ========================================================================
    // PROFILES
    // ========================================================================

    /// Profiles of the given users
    pub fn get_profiles(&self, user_ids: &[String]) -> Result<HashMap<String, Profile>> {
        if user_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT id, name, handle, avatar FROM users WHERE id IN ({})",
            placeholders(user_ids.len())
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;
        let rows = stmt
            .query_map(params_from_iter(user_ids.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    Profile {
                        name: row.get(1)?,
                        handle: row.get(2)?,
                        avatar: row.get(3)?,
                    },
                ))
            })
            .map_err(|e| Error::DatabaseError(format!("Failed to query users: {}", e)))?;

        let mut profiles = HashMap::new();
        for row in rows {
            let (id, profile) =
                row.map_err(|e| Error::DatabaseError(format!("Failed to read user: {}", e)))?;
            profiles.insert(id, profile);
        }
        Ok(profiles)
    }
}

#[async_trait]
impl ChatBackend for Database {
    async fn memberships(&self, viewer: &str) -> Result<Vec<MembershipRow>> {
        self.get_memberships(viewer)
    }

    async fn overview(&self, viewer: &str) -> Result<Vec<OverviewEntry>> {
        self.get_overview(viewer)
    }

    async fn conversations(&self, ids: &[String]) -> Result<Vec<ConversationRow>> {
        self.get_conversations(ids)
    }

    async fn rosters(&self, ids: &[String]) -> Result<Vec<Member>> {
        self.get_rosters(ids)
    }

    async fn messages(&self, conversation_id: &str, limit: usize, offset: usize) -> Result<Vec<MessageRow>> {
        self.get_messages(conversation_id, limit, offset)
    }

    async fn message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.get_message(id)
    }

    async fn insert_message(&self, message: NewMessage) -> Result<MessageRow> {
        self.store_message(message)
    }

    async fn edit_message(&self, id: &str, ciphertext: &str, edited_at: i64) -> Result<MessageRow> {
        self.update_message_body(id, ciphertext, edited_at)
    }

    async fn delete_message(&self, id: &str) -> Result<()> {
        self.soft_delete_message(id)
    }

    async fn add_reaction(&self, message_id: &str, user_id: &str, symbol: &str) -> Result<()> {
        self.change_reaction(message_id, user_id, symbol, true)
    }

    async fn remove_reaction(&self, message_id: &str, user_id: &str, symbol: &str) -> Result<()> {
        self.change_reaction(message_id, user_id, symbol, false)
    }

    async fn ensure_direct_conversation(&self, viewer: &str, partner: &str) -> Result<String> {
        self.ensure_direct(viewer, partner)
    }

    async fn delete_conversation(&self, id: &str) -> Result<()> {
        self.remove_conversation(id)
    }

    async fn leave_conversation(&self, id: &str, user_id: &str) -> Result<()> {
        self.leave(id, user_id)
    }

    async fn update_last_read(&self, id: &str, user_id: &str, at: i64) -> Result<()> {
        self.mark_read_until(id, user_id, at)
    }

    async fn update_member(&self, actor: &str, member: &Member) -> Result<()> {
        self.save_member(actor, member)
    }

    async fn remove_member(&self, actor: &str, conversation_id: &str, user_id: &str) -> Result<()> {
        self.ban(actor, conversation_id, user_id)
    }

    async fn sweep_expired_mutes(&self, now: i64) -> Result<usize> {
        self.clear_expired_mutes(now)
    }
}

#[async_trait]
impl ProfileSource for Database {
    async fn profiles(&self, user_ids: &[String]) -> Result<HashMap<String, Profile>> {
        self.get_profiles(user_ids)
    }
}

// ============================================================================
// ROW HELPERS
// ============================================================================

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn membership_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MembershipRow> {
    let role: String = row.get(2)?;
    Ok(MembershipRow {
        conversation_id: row.get(0)?,
        user_id: row.get(1)?,
        role: Role::parse(&role).unwrap_or(Role::Member),
        last_read_at: row.get(3)?,
        joined_at: row.get(4)?,
    })
}

fn member_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Member> {
    let role: String = row.get(2)?;
    Ok(Member {
        conversation_id: row.get(0)?,
        user_id: row.get(1)?,
        role: Role::parse(&role).unwrap_or(Role::Member),
        can_post: row.get(3)?,
        can_manage_members: row.get(4)?,
        can_manage_messages: row.get(5)?,
        mute_expires_at: row.get(6)?,
        last_read_at: row.get(7)?,
        profile: None,
    })
}

fn conversation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    let kind: String = row.get(1)?;
    Ok(ConversationRow {
        id: row.get(0)?,
        kind: ConversationKind::parse(&kind).unwrap_or(ConversationKind::Group),
        name: row.get(2)?,
        team_id: row.get(3)?,
        recruitment_id: row.get(4)?,
        created_at: row.get(5)?,
        archived: row.get(6)?,
    })
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender_id: row.get(2)?,
        ciphertext: row.get(3)?,
        created_at: row.get(4)?,
        edited_at: row.get(5)?,
        deleted: row.get(6)?,
        reply_to: row.get(7)?,
        forwarded_from: row.get(8)?,
        reactions: None,
    })
}

fn select_messages<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<Vec<MessageRow>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;
    let rows = stmt
        .query_map(params, message_from_row)
        .map_err(|e| Error::DatabaseError(format!("Failed to query messages: {}", e)))?;

    let mut messages = Vec::new();
    for row in rows {
        messages.push(row.map_err(|e| Error::DatabaseError(format!("Failed to read message: {}", e)))?);
    }
    Ok(messages)
}

fn load_message(conn: &Connection, id: &str) -> Result<Option<MessageRow>> {
    let mut rows = select_messages(
        conn,
        &format!("SELECT {} FROM messages WHERE id = ?1", MESSAGE_COLUMNS),
        params![id],
    )?;
    Ok(rows.pop())
}

/// Fill `reactions` of every message with one query
fn attach_reactions(conn: &Connection, messages: &mut [MessageRow]) -> Result<()> {
    if messages.is_empty() {
        return Ok(());
    }
    let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
    let sql = format!(
        "SELECT message_id, user_id, symbol FROM reactions WHERE message_id IN ({})
         ORDER BY created_at, user_id, symbol",
        placeholders(ids.len())
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;
    let rows = stmt
        .query_map(params_from_iter(ids.iter()), |row| {
            Ok((row.get::<_, String>(0)?, Reaction::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?)))
        })
        .map_err(|e| Error::DatabaseError(format!("Failed to query reactions: {}", e)))?;

    let mut by_message: HashMap<String, Vec<Reaction>> = HashMap::new();
    for row in rows {
        let (message_id, reaction) =
            row.map_err(|e| Error::DatabaseError(format!("Failed to read reaction: {}", e)))?;
        by_message.entry(message_id).or_default().push(reaction);
    }

    for message in messages.iter_mut() {
        message.reactions = Some(by_message.remove(&message.id).unwrap_or_default());
    }
    Ok(())
}

fn conversation_kind(conn: &Connection, id: &str) -> Result<Option<ConversationKind>> {
    let kind: Option<String> = conn
        .query_row("SELECT kind FROM conversations WHERE id = ?1", params![id], |row| row.get(0))
        .optional()?;
    Ok(kind.and_then(|k| ConversationKind::parse(&k)))
}

/// Some member below admin has lost the posting right
fn is_admin_only(conn: &Connection, conversation_id: &str) -> Result<bool> {
    let restricted: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM members
             WHERE conversation_id = ?1 AND can_post = 0 AND role NOT IN ('owner', 'admin'))",
        params![conversation_id],
        |row| row.get(0),
    )?;
    Ok(restricted)
}

fn load_member(conn: &Connection, conversation_id: &str, user_id: &str) -> Result<Option<Member>> {
    let member = conn
        .query_row(
            &format!(
                "SELECT {} FROM members WHERE conversation_id = ?1 AND user_id = ?2",
                MEMBER_COLUMNS
            ),
            params![conversation_id, user_id],
            member_from_row,
        )
        .optional()?;
    Ok(member)
}

fn membership_row(conn: &Connection, conversation_id: &str, user_id: &str) -> Result<Option<MembershipRow>> {
    let row = conn
        .query_row(
            "SELECT conversation_id, user_id, role, last_read_at, joined_at
             FROM members WHERE conversation_id = ?1 AND user_id = ?2",
            params![conversation_id, user_id],
            membership_from_row,
        )
        .optional()?;
    Ok(row)
}

fn memberships_of(conn: &Connection, conversation_id: &str) -> Result<Vec<MembershipRow>> {
    let mut stmt = conn
        .prepare(
            "SELECT conversation_id, user_id, role, last_read_at, joined_at
             FROM members WHERE conversation_id = ?1",
        )
        .map_err(|e| Error::DatabaseError(format!("Failed to prepare query: {}", e)))?;
    let rows = stmt
        .query_map(params![conversation_id], membership_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn delete_membership(conn: &Connection, conversation_id: &str, user_id: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM members WHERE conversation_id = ?1 AND user_id = ?2",
        params![conversation_id, user_id],
    )
    .map_err(|e| Error::DatabaseError(format!("Failed to remove member: {}", e)))?;
    conn.execute(
        "DELETE FROM overview WHERE conversation_id = ?1 AND viewer_id = ?2",
        params![conversation_id, user_id],
    )
    .map_err(|e| Error::DatabaseError(format!("Failed to remove overview entry: {}", e)))?;
    Ok(())
}

/// Locate an existing direct conversation of the pair.
///
/// The viewer's overview entry naming the partner wins, then any direct
/// conversation both users already appear in.
fn find_direct(conn: &Connection, viewer: &str, partner: &str) -> Result<Option<(String, i64)>> {
    let from_overview = conn
        .query_row(
            "SELECT conversation_id, created_at FROM overview
             WHERE viewer_id = ?1 AND partner_id = ?2 AND kind = 'direct'
             ORDER BY created_at LIMIT 1",
            params![viewer, partner],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    if from_overview.is_some() {
        return Ok(from_overview);
    }

    let from_members = conn
        .query_row(
            "SELECT c.id, c.created_at FROM conversations c
             WHERE c.kind = 'direct'
               AND EXISTS (SELECT 1 FROM members m WHERE m.conversation_id = c.id AND m.user_id = ?1)
               AND EXISTS (SELECT 1 FROM members m WHERE m.conversation_id = c.id AND m.user_id = ?2)
             ORDER BY c.created_at LIMIT 1",
            params![viewer, partner],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(from_members)
}

/// Recompute the overview entries of every member of a conversation
fn refresh_overview_all(conn: &Connection, conversation_id: &str) -> Result<()> {
    let members: Vec<String> = memberships_of(conn, conversation_id)?
        .into_iter()
        .map(|m| m.user_id)
        .collect();
    for user_id in members {
        refresh_overview(conn, conversation_id, &user_id)?;
    }
    Ok(())
}

/// Recompute one viewer's overview entry from the ledger tables
fn refresh_overview(conn: &Connection, conversation_id: &str, viewer: &str) -> Result<()> {
    let conversation = conn
        .query_row(
            &format!("SELECT {} FROM conversations WHERE id = ?1", CONVERSATION_COLUMNS),
            params![conversation_id],
            conversation_from_row,
        )
        .optional()?;
    let Some(conversation) = conversation else {
        return Ok(());
    };

    let partner: Option<(String, String, String, Option<String>)> = if conversation.kind.is_direct() {
        conn.query_row(
            "SELECT m.user_id, COALESCE(u.name, m.user_id), COALESCE(u.handle, m.user_id), u.avatar
             FROM members m LEFT JOIN users u ON u.id = m.user_id
             WHERE m.conversation_id = ?1 AND m.user_id != ?2
             ORDER BY m.joined_at LIMIT 1",
            params![conversation_id, viewer],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?
    } else {
        None
    };

    let last: Option<(String, String, String, i64)> = conn
        .query_row(
            "SELECT id, sender_id, ciphertext, created_at FROM messages
             WHERE conversation_id = ?1 AND deleted = 0
             ORDER BY created_at DESC, id DESC LIMIT 1",
            params![conversation_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .optional()?;

    let unread: u32 = conn.query_row(
        "SELECT COUNT(*) FROM messages
         WHERE conversation_id = ?1 AND deleted = 0 AND sender_id != ?2
           AND created_at > COALESCE(
               (SELECT last_read_at FROM members WHERE conversation_id = ?1 AND user_id = ?2), -1)",
        params![conversation_id, viewer],
        |row| row.get(0),
    )?;

    conn.execute(
        "INSERT INTO overview (viewer_id, conversation_id, kind, name, partner_id, partner_name,
             partner_handle, partner_avatar, last_message_id, last_sender_id, last_ciphertext,
             last_at, unread_count, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(viewer_id, conversation_id) DO UPDATE SET
             kind = excluded.kind, name = excluded.name,
             partner_id = COALESCE(excluded.partner_id, overview.partner_id),
             partner_name = COALESCE(excluded.partner_name, overview.partner_name),
             partner_handle = COALESCE(excluded.partner_handle, overview.partner_handle),
             partner_avatar = COALESCE(excluded.partner_avatar, overview.partner_avatar),
             last_message_id = excluded.last_message_id, last_sender_id = excluded.last_sender_id,
             last_ciphertext = excluded.last_ciphertext, last_at = excluded.last_at,
             unread_count = excluded.unread_count",
        params![
            viewer,
            conversation_id,
            conversation.kind.as_str(),
            conversation.name,
            partner.as_ref().map(|p| p.0.as_str()),
            partner.as_ref().map(|p| p.1.as_str()),
            partner.as_ref().map(|p| p.2.as_str()),
            partner.as_ref().and_then(|p| p.3.as_deref()),
            last.as_ref().map(|m| m.0.as_str()),
            last.as_ref().map(|m| m.1.as_str()),
            last.as_ref().map(|m| m.2.as_str()),
            last.as_ref().map(|m| m.3),
            unread,
            conversation.created_at,
        ],
    )
    .map_err(|e| Error::DatabaseError(format!("Failed to update overview: {}", e)))?;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
