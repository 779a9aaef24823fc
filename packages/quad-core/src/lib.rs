//! # Quad Core
//!
//! Conversation synchronization engine for the Quad campus app. Keeps a
//! signed-in user's conversation list and open message thread consistent
//! with a remote backend, under partial fetch failures, bursts of realtime
//! events and optimistic local sends.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          QUAD CORE MODULES                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │                        ┌──────────────────────┐                         │
//! │                        │     ChatSession      │                         │
//! │                        │                      │                         │
//! │                        │ - list / open thread │                         │
//! │                        │ - optimistic sends   │                         │
//! │                        │ - moderation         │                         │
//! │                        └──────────┬───────────┘                         │
//! │            ┌──────────────────────┼──────────────────────┐              │
//! │            ▼                      ▼                      ▼              │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌──────────────────┐       │
//! │  │      Sync        │  │    Messaging     │  │    Realtime      │       │
//! │  │                  │  │                  │  │                  │       │
//! │  │ - Resolver       │  │ - MessageLog     │  │ - ChangeFeed     │       │
//! │  │ - Hydrator       │  │ - Reconcile      │  │ - Debounce       │       │
//! │  │ - Dedup          │  │ - Hydrate rows   │  │ - Bridge         │       │
//! │  │ - Permissions    │  │                  │  │                  │       │
//! │  └────────┬─────────┘  └────────┬─────────┘  └────────┬─────────┘       │
//! │           └─────────────────────┼─────────────────────┘                 │
//! │                                 ▼                                       │
//! │  ┌─────────────┐  ┌──────────────────────┐  ┌─────────────┐             │
//! │  │  Identity   │  │       Storage        │  │   Crypto    │             │
//! │  │             │  │                      │  │             │             │
//! │  │ - Profiles  │  │ - ChatBackend trait  │  │ - Cipher    │             │
//! │  │ - Cache     │  │ - SQLite Database    │  │ - AES-GCM   │             │
//! │  └─────────────┘  └──────────────────────┘  └─────────────┘             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire library
//! - [`config`] - Debounce windows, tolerances, page sizes
//! - [`model`] - Conversations, members, messages
//! - [`storage`] - Backend collaborator trait and the SQLite reference backend
//! - [`realtime`] - Change events, the local feed, debounced subscriptions
//! - [`identity`] - Profile lookup through an injected, session-scoped cache
//! - [`crypto`] - Opaque content encoding of message bodies
//! - [`sync`] - Membership resolution, hydration, dedup, permission checks
//! - [`messaging`] - The per-conversation message log
//! - [`session`] - The signed-in user's synchronized view
//! - [`time`] - Injectable clocks

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod config;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod messaging;
pub mod model;
pub mod realtime;
pub mod session;
pub mod storage;
pub mod sync;
/// Injectable wall clocks.
pub mod time;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use config::SyncConfig;
pub use crypto::{AesContentCipher, ContentCipher, PlainContentCipher};
pub use error::{Error, Result};
pub use identity::{IdentityCache, Profile};
pub use model::{
    Conversation, ConversationKind, Member, Message, MessageId, MessageStatus, Role,
};
pub use realtime::{ChangeFeed, LocalChangeFeed};
pub use session::{ChatSession, Services, SyncEvent};
pub use storage::{ChatBackend, Database};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Returns the version of Quad Core
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
