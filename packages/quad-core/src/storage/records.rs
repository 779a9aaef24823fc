//! Rows as returned by a [`ChatBackend`](super::ChatBackend).

use serde::{Deserialize, Serialize};

use crate::model::{ConversationKind, Partner, Reaction, Role};

/// A row of the membership ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipRow {
    /// Conversation id
    pub conversation_id: String,
    /// Member user id
    pub user_id: String,
    /// Role
    pub role: Role,
    /// Last read marker (Unix ms)
    pub last_read_at: Option<i64>,
    /// When the user joined (Unix ms)
    pub joined_at: i64,
}

/// A conversation row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRow {
    /// Conversation id
    pub id: String,
    /// Kind
    pub kind: ConversationKind,
    /// Display name
    pub name: Option<String>,
    /// Linked team
    pub team_id: Option<String>,
    /// Linked recruitment posting
    pub recruitment_id: Option<String>,
    /// Creation time (Unix ms)
    pub created_at: i64,
    /// Archived
    pub archived: bool,
}

/// Newest message as carried by the overview feed (still encoded)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverviewLastMessage {
    /// Server id
    pub message_id: String,
    /// Author
    pub sender_id: String,
    /// Encoded body
    pub ciphertext: String,
    /// Creation time (Unix ms)
    pub at: i64,
}

/// One entry of the per-viewer overview feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverviewEntry {
    /// Conversation id
    pub conversation_id: String,
    /// Kind
    pub kind: ConversationKind,
    /// Display name
    pub name: Option<String>,
    /// Partner (two-party only)
    pub partner: Option<Partner>,
    /// Newest message
    pub last_message: Option<OverviewLastMessage>,
    /// Unread count for the viewer
    pub unread_count: u32,
    /// Creation time (Unix ms)
    pub created_at: i64,
}

impl OverviewEntry {
    /// A direct conversation that names its partner
    pub fn is_two_party(&self) -> bool {
        self.kind.is_direct() && self.partner.is_some()
    }
}

/// A stored message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRow {
    /// Server id
    pub id: String,
    /// Conversation id
    pub conversation_id: String,
    /// Author
    pub sender_id: String,
    /// Encoded body
    pub ciphertext: String,
    /// Creation time (Unix ms)
    pub created_at: i64,
    /// Last edit time (Unix ms)
    pub edited_at: Option<i64>,
    /// Soft-deleted
    pub deleted: bool,
    /// Reply target
    pub reply_to: Option<String>,
    /// Forward source
    pub forwarded_from: Option<String>,
    /// Reactions; `None` when the payload does not carry them
    pub reactions: Option<Vec<Reaction>>,
}

/// A message to insert; the backend assigns id and timestamp
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    /// Conversation id
    pub conversation_id: String,
    /// Author
    pub sender_id: String,
    /// Encoded body
    pub ciphertext: String,
    /// Reply target
    pub reply_to: Option<String>,
    /// Forward source
    pub forwarded_from: Option<String>,
}
