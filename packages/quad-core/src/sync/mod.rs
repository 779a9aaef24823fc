//! # Conversation Sync
//!
//! Builds the viewer's conversation list from two sources that disagree.
//!
//! ## Pipeline
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        CONVERSATION SYNC PIPELINE                       │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   membership ledger ─┐                                                  │
//! │                      ├──▶ MembershipResolver ──▶ Resolution             │
//! │   overview feed ─────┘        │                     │                   │
//! │                               │ repair (once)       │                   │
//! │                               ▼                     ▼                   │
//! │                 ensure_direct_conversation    RosterHydrator            │
//! │                                                (1 bulk conversations,   │
//! │                                                 1 bulk roster query)    │
//! │                                                     │                   │
//! │                                                     ▼                   │
//! │                                               deduplicate               │
//! │                                                (richness score,         │
//! │                                                 recency order)          │
//! │                                                     │                   │
//! │                                                     ▼                   │
//! │                                             Vec<Conversation>           │
//! │                                                                         │
//! │   permissions: pure checks over hydrated rosters, used on demand        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod dedup;
pub mod hydrator;
pub mod permissions;
pub mod resolver;

pub use dedup::{deduplicate, richness_score, sort_by_activity, ConversationArena};
pub use hydrator::{derive_admin_only, synthesize_placeholder, RosterHydrator};
pub use permissions::{
    can_manage_message, can_post, check_can_post, check_privileged, is_muted, PrivilegedAction,
};
pub use resolver::{MembershipResolver, Resolution};
