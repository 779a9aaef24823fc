//! # Data Model
//!
//! Client-side records the sync engine builds and keeps consistent.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            DATA MODEL                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Conversation ─────────┬──── Member (conversation_id, user_id)          │
//! │  │ kind                │     role, can_post, can_manage_*               │
//! │  │ admin_only (derived)│     mute_expires_at, last_read_at              │
//! │  │ last_message        │                                                │
//! │  │ unread_count        └──── Partner (direct only)                      │
//! │  │ placeholder                                                          │
//! │  │                                                                      │
//! │  └── Message ───────────────  Reaction (user_id, symbol)                │
//! │      MessageId::Pending | MessageId::Confirmed                          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod conversation;
mod member;
mod message;

pub use conversation::{Conversation, ConversationKind, LastMessage, Partner};
pub use member::{Member, Role};
pub use message::{Message, MessageId, MessageStatus, Reaction};
