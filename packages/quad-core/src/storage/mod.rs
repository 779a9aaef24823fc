//! # Storage Module
//!
//! The [`ChatBackend`] trait is everything the sync engine asks of the
//! server: ledger and overview reads, bulk hydration queries, message
//! writes and the conversation procedures.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        STORAGE ARCHITECTURE                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    ChatBackend (trait)                          │   │
//! │  │                                                                 │   │
//! │  │  memberships / overview        ◀── Membership Resolver          │   │
//! │  │  conversations / rosters       ◀── Roster Hydrator (bulk)       │   │
//! │  │  messages / insert / edit ...  ◀── ChatSession                  │   │
//! │  │  ensure_direct_conversation    ◀── repair                       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                          │                                              │
//! │                          ▼                                              │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 Database (rusqlite, reference)                  │   │
//! │  │                                                                 │   │
//! │  │  users │ conversations │ members │ messages │ reactions │       │   │
//! │  │  overview (per viewer)                                          │   │
//! │  │                          │                                      │   │
//! │  │                          └──▶ LocalChangeFeed (row changes)     │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod database;
mod records;
mod schema;

pub use database::{direct_conversation_id, Database};
pub use records::{
    ConversationRow, MembershipRow, MessageRow, NewMessage, OverviewEntry, OverviewLastMessage,
};

use async_trait::async_trait;

use crate::error::Result;
use crate::model::Member;

/// Storage/query collaborator
///
/// Mutations are authorized server-side; a rejected mutation returns
/// [`Error::PermissionDenied`](crate::Error::PermissionDenied).
#[async_trait]
pub trait ChatBackend: Send + Sync {
    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Membership ledger rows for the viewer
    async fn memberships(&self, viewer: &str) -> Result<Vec<MembershipRow>>;

    /// The viewer's overview feed
    async fn overview(&self, viewer: &str) -> Result<Vec<OverviewEntry>>;

    /// Conversation rows for all `ids` in one query
    async fn conversations(&self, ids: &[String]) -> Result<Vec<ConversationRow>>;

    /// Roster rows for all `ids` in one query
    async fn rosters(&self, ids: &[String]) -> Result<Vec<Member>>;

    /// A page of messages, oldest first. `offset` counts back from the newest.
    async fn messages(&self, conversation_id: &str, limit: usize, offset: usize) -> Result<Vec<MessageRow>>;

    /// A single message
    async fn message(&self, id: &str) -> Result<Option<MessageRow>>;

    // ------------------------------------------------------------------
    // Message writes
    // ------------------------------------------------------------------

    /// Insert a message and return the confirmed row
    async fn insert_message(&self, message: NewMessage) -> Result<MessageRow>;

    /// Replace a message body
    async fn edit_message(&self, id: &str, ciphertext: &str, edited_at: i64) -> Result<MessageRow>;

    /// Soft-delete a message
    async fn delete_message(&self, id: &str) -> Result<()>;

    /// Add a reaction (no-op if already present)
    async fn add_reaction(&self, message_id: &str, user_id: &str, symbol: &str) -> Result<()>;

    /// Remove a reaction
    async fn remove_reaction(&self, message_id: &str, user_id: &str, symbol: &str) -> Result<()>;

    // ------------------------------------------------------------------
    // Conversation procedures
    // ------------------------------------------------------------------

    /// Create (or find) the direct conversation of two users, making sure
    /// both have a membership row. Idempotent. Returns the conversation id.
    async fn ensure_direct_conversation(&self, viewer: &str, partner: &str) -> Result<String>;

    /// Delete a conversation for all members
    async fn delete_conversation(&self, id: &str) -> Result<()>;

    /// Remove only `user_id`'s membership
    async fn leave_conversation(&self, id: &str, user_id: &str) -> Result<()>;

    /// Move `user_id`'s read marker and reset their unread count
    async fn update_last_read(&self, id: &str, user_id: &str, at: i64) -> Result<()>;

    // ------------------------------------------------------------------
    // Member management
    // ------------------------------------------------------------------

    /// Persist role, posting right and mute expiry of `member`, acting as `actor`
    async fn update_member(&self, actor: &str, member: &Member) -> Result<()>;

    /// Remove (ban) `user_id`, acting as `actor`
    async fn remove_member(&self, actor: &str, conversation_id: &str, user_id: &str) -> Result<()>;

    /// Clear mutes that expired before `now`. Returns the number cleared.
    async fn sweep_expired_mutes(&self, now: i64) -> Result<usize>;
}
