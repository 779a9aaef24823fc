//! Messages and reactions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::identity::Profile;

/// Message identity: local until the server confirms it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "state", content = "id", rename_all = "snake_case")]
pub enum MessageId {
    /// Client-generated id of an optimistic message
    Pending(String),
    /// Server-assigned id
    Confirmed(String),
}

impl MessageId {
    /// A fresh pending id
    pub fn pending() -> Self {
        MessageId::Pending(uuid::Uuid::new_v4().to_string())
    }

    /// The raw id, whichever state it is in
    pub fn as_str(&self) -> &str {
        match self {
            MessageId::Pending(id) | MessageId::Confirmed(id) => id,
        }
    }

    /// Whether the server has not confirmed this message yet
    pub fn is_pending(&self) -> bool {
        matches!(self, MessageId::Pending(_))
    }

    /// The server id, if confirmed
    pub fn confirmed(&self) -> Option<&str> {
        match self {
            MessageId::Confirmed(id) => Some(id),
            MessageId::Pending(_) => None,
        }
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reaction; a user holds at most one of each symbol per message
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reaction {
    /// Reacting user
    pub user_id: String,
    /// Emoji or short symbol
    pub symbol: String,
}

impl Reaction {
    /// Create a reaction
    pub fn new(user_id: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            symbol: symbol.into(),
        }
    }
}

/// Delivery status of a message as seen by its author
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MessageStatus {
    /// Optimistically shown, insert in flight
    Sending,
    /// Confirmed by the server
    Sent,
    /// Insert failed; can be retried
    Failed {
        /// Failure description
        reason: String,
    },
}

impl MessageStatus {
    /// Status as a string
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed { .. } => "failed",
        }
    }
}

/// A message in a conversation log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Id
    pub id: MessageId,
    /// Conversation id
    pub conversation_id: String,
    /// Author
    pub sender_id: String,
    /// Opaque encoded body
    pub ciphertext: String,
    /// Decoded body (blank when deleted)
    pub text: String,
    /// Creation time (Unix ms)
    pub created_at: i64,
    /// Last edit time (Unix ms)
    pub edited_at: Option<i64>,
    /// Soft-deleted tombstone
    pub deleted: bool,
    /// Message this one replies to
    pub reply_to: Option<String>,
    /// Message this one was forwarded from
    pub forwarded_from: Option<String>,
    /// Reactions
    pub reactions: BTreeSet<Reaction>,
    /// Delivery status
    pub status: MessageStatus,
    /// Author profile from the identity cache
    pub sender: Option<Profile>,
}

impl Message {
    /// Build an optimistic message authored by `sender_id`
    pub fn optimistic(
        conversation_id: impl Into<String>,
        sender_id: impl Into<String>,
        text: impl Into<String>,
        created_at: i64,
    ) -> Self {
        Self {
            id: MessageId::pending(),
            conversation_id: conversation_id.into(),
            sender_id: sender_id.into(),
            ciphertext: String::new(),
            text: text.into(),
            created_at,
            edited_at: None,
            deleted: false,
            reply_to: None,
            forwarded_from: None,
            reactions: BTreeSet::new(),
            status: MessageStatus::Sending,
            sender: None,
        }
    }

    /// Total order key: `(created_at, id)`
    pub fn sort_key(&self) -> (i64, &str) {
        (self.created_at, self.id.as_str())
    }

    /// Whether `viewer` authored this message
    pub fn is_outgoing(&self, viewer: &str) -> bool {
        self.sender_id == viewer
    }

    /// Add the reaction if absent, remove it if present. Returns `true` if added.
    pub fn toggle_reaction(&mut self, user_id: &str, symbol: &str) -> bool {
        let reaction = Reaction::new(user_id, symbol);
        if self.reactions.remove(&reaction) {
            false
        } else {
            self.reactions.insert(reaction);
            true
        }
    }

    /// Turn the message into a tombstone in place
    pub fn tombstone(&mut self) {
        self.deleted = true;
        self.text.clear();
        self.ciphertext.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_ids_are_unique() {
        let a = MessageId::pending();
        let b = MessageId::pending();
        assert_ne!(a, b);
        assert!(a.is_pending());
        assert_eq!(a.confirmed(), None);
    }

    #[test]
    fn test_toggle_reaction_set_semantics() {
        let mut msg = Message::optimistic("c1", "alice", "hi", 1);
        assert!(msg.toggle_reaction("bob", "👍"));
        assert_eq!(msg.reactions.len(), 1);
        assert!(!msg.toggle_reaction("bob", "👍"));
        assert!(msg.reactions.is_empty());
    }

    #[test]
    fn test_tombstone_blanks_body() {
        let mut msg = Message::optimistic("c1", "alice", "secret", 1);
        msg.ciphertext = "abc".into();
        msg.tombstone();
        assert!(msg.deleted);
        assert!(msg.text.is_empty());
        assert!(msg.ciphertext.is_empty());
    }

    #[test]
    fn test_sort_key_breaks_ties_by_id() {
        let mut a = Message::optimistic("c1", "alice", "a", 5);
        let mut b = Message::optimistic("c1", "alice", "b", 5);
        a.id = MessageId::Confirmed("m1".into());
        b.id = MessageId::Confirmed("m2".into());
        assert!(a.sort_key() < b.sort_key());
    }
}
