//! # Realtime
//!
//! Row-level change notifications and the bridge that turns them into
//! debounced refreshes.
//!
//! ## Event Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         REALTIME EVENT FLOW                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   ChangeFeed::subscribe(entity, filter) ──▶ BoxStream<ChangeEvent>     │
//! │                                                                         │
//! │   Membership (filter: viewer)                                          │
//! │        └──▶ list RefreshTimer (100ms) ──▶ refresh_conversations        │
//! │                                                                         │
//! │   Message (filter: open conversation)                                  │
//! │        └──▶ buffer ──▶ conversation RefreshTimer (80ms)                │
//! │                          └──▶ apply_message_changes(batch)             │
//! │                                                                         │
//! │   Message (filter: all visible)                                        │
//! │        └──▶ apply_summary_change (last message, unread)                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod bridge;
mod debounce;
mod feed;

pub use bridge::{RealtimeBridge, RealtimeHandler};
pub use debounce::RefreshTimer;
pub use feed::LocalChangeFeed;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::storage::{MembershipRow, MessageRow};

/// Kind of row change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    /// Row created
    Insert,
    /// Row modified
    Update,
    /// Row removed
    Delete,
}

/// Which table a subscription watches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Entity {
    /// `messages`
    Message,
    /// `members`
    Membership,
}

/// Row payload of a change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity", content = "row", rename_all = "snake_case")]
pub enum Row {
    /// A message row
    Message(MessageRow),
    /// A membership row
    Membership(MembershipRow),
}

impl Row {
    /// The entity this row belongs to
    pub fn entity(&self) -> Entity {
        match self {
            Row::Message(_) => Entity::Message,
            Row::Membership(_) => Entity::Membership,
        }
    }

    /// Conversation the row belongs to
    pub fn conversation_id(&self) -> &str {
        match self {
            Row::Message(m) => &m.conversation_id,
            Row::Membership(m) => &m.conversation_id,
        }
    }

    /// User the row is about (author or member)
    pub fn user_id(&self) -> &str {
        match self {
            Row::Message(m) => &m.sender_id,
            Row::Membership(m) => &m.user_id,
        }
    }
}

/// Row filter of a subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Filter {
    /// Every row the viewer may see
    All,
    /// Rows of one conversation
    Conversation(String),
    /// Rows about one user
    User(String),
}

impl Filter {
    /// Whether `row` passes this filter
    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::All => true,
            Filter::Conversation(id) => row.conversation_id() == id,
            Filter::User(id) => row.user_id() == id,
        }
    }
}

/// One row change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Operation
    pub op: ChangeOp,
    /// Row before the change (updates and deletes)
    pub before: Option<Row>,
    /// Row after the change (inserts and updates)
    pub after: Option<Row>,
}

impl ChangeEvent {
    /// An insert of `row`
    pub fn insert(row: Row) -> Self {
        Self { op: ChangeOp::Insert, before: None, after: Some(row) }
    }

    /// An update from `before` to `after`
    pub fn update(before: Option<Row>, after: Row) -> Self {
        Self { op: ChangeOp::Update, before, after: Some(after) }
    }

    /// A delete of `row`
    pub fn delete(row: Row) -> Self {
        Self { op: ChangeOp::Delete, before: Some(row), after: None }
    }

    /// The most recent row image
    pub fn row(&self) -> Option<&Row> {
        self.after.as_ref().or(self.before.as_ref())
    }

    /// Entity of the changed row
    pub fn entity(&self) -> Option<Entity> {
        self.row().map(Row::entity)
    }

    /// The message row, if this is a message change
    pub fn message(&self) -> Option<&MessageRow> {
        match self.row() {
            Some(Row::Message(m)) => Some(m),
            _ => None,
        }
    }

    /// Whether the change passes `filter` (either row image may match)
    pub fn matches(&self, filter: &Filter) -> bool {
        self.after.iter().chain(self.before.iter()).any(|row| filter.matches(row))
    }
}

/// Source of row change notifications
pub trait ChangeFeed: Send + Sync {
    /// Subscribe to changes of `entity` that pass `filter`
    fn subscribe(&self, entity: Entity, filter: Filter) -> BoxStream<'static, ChangeEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    fn membership(conversation_id: &str, user_id: &str) -> Row {
        Row::Membership(MembershipRow {
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
            role: Role::Member,
            last_read_at: None,
            joined_at: 0,
        })
    }

    #[test]
    fn test_filters() {
        let row = membership("c1", "alice");
        assert!(Filter::All.matches(&row));
        assert!(Filter::Conversation("c1".into()).matches(&row));
        assert!(!Filter::Conversation("c2".into()).matches(&row));
        assert!(Filter::User("alice".into()).matches(&row));
        assert!(!Filter::User("bob".into()).matches(&row));
    }

    #[test]
    fn test_delete_matches_on_before_image() {
        let event = ChangeEvent::delete(membership("c1", "alice"));
        assert!(event.matches(&Filter::User("alice".into())));
        assert_eq!(event.entity(), Some(Entity::Membership));
        assert!(event.message().is_none());
    }
}
