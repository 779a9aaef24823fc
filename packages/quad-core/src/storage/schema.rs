//! # Database Schema
//!
//! SQL schema for the reference [`Database`](super::Database).
//!
//! ## Schema Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         DATABASE SCHEMA                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────┐    ┌─────────────────┐      ┌─────────────────┐    │
//! │  │     users       │    │  conversations  │      │    messages     │    │
//! │  ├─────────────────┤    ├─────────────────┤      ├─────────────────┤    │
//! │  │ id              │    │ id              │◄─────│ conversation_id │    │
//! │  │ name            │    │ kind            │      │ id              │    │
//! │  │ handle          │    │ name            │      │ sender_id       │    │
//! │  │ avatar          │    │ team_id         │      │ ciphertext      │    │
//! │  └─────────────────┘    │ recruitment_id  │      │ created_at      │    │
//! │                         │ created_at      │      │ edited_at       │    │
//! │                         │ archived        │      │ deleted         │    │
//! │                         └─────────────────┘      │ reply_to        │    │
//! │                                  ▲               │ forwarded_from  │    │
//! │  ┌─────────────────┐             │               └─────────────────┘    │
//! │  │    members      │─────────────┘                        ▲             │
//! │  ├─────────────────┤                             ┌─────────────────┐    │
//! │  │ conversation_id │    ┌─────────────────┐      │   reactions     │    │
//! │  │ user_id         │    │    overview     │      ├─────────────────┤    │
//! │  │ role            │    ├─────────────────┤      │ message_id      │    │
//! │  │ can_post        │    │ viewer_id       │      │ user_id         │    │
//! │  │ can_manage_*    │    │ conversation_id │      │ symbol          │    │
//! │  │ mute_expires_at │    │ partner_*       │      └─────────────────┘    │
//! │  │ last_read_at    │    │ last_*          │                             │
//! │  │ joined_at       │    │ unread_count    │                             │
//! │  └─────────────────┘    └─────────────────┘                             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `overview` is denormalized and maintained separately from `members`,
//! so the two can disagree. That disagreement is what the Membership
//! Resolver repairs.

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL to create all tables
pub const CREATE_TABLES: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY
);

-- Public profiles
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    handle TEXT NOT NULL UNIQUE,
    avatar TEXT
);

-- Conversations
-- kind: 'direct' | 'group' | 'team' | 'recruitment'
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    name TEXT,
    team_id TEXT,
    recruitment_id TEXT,
    created_at INTEGER NOT NULL,
    archived INTEGER NOT NULL DEFAULT 0
);

-- Membership ledger and roster
-- role: 'owner' | 'admin' | 'moderator' | 'member'
CREATE TABLE IF NOT EXISTS members (
    conversation_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'member',
    can_post INTEGER NOT NULL DEFAULT 1,
    can_manage_members INTEGER NOT NULL DEFAULT 0,
    can_manage_messages INTEGER NOT NULL DEFAULT 0,
    mute_expires_at INTEGER,
    last_read_at INTEGER,
    joined_at INTEGER NOT NULL,
    PRIMARY KEY (conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

-- Messages (body is opaque ciphertext)
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    sender_id TEXT NOT NULL,
    ciphertext TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    edited_at INTEGER,
    deleted INTEGER NOT NULL DEFAULT 0,
    reply_to TEXT,
    forwarded_from TEXT,
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

-- Reactions (one per user per symbol per message)
CREATE TABLE IF NOT EXISTS reactions (
    message_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    UNIQUE(message_id, user_id, symbol),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

-- Per-viewer conversation summaries
CREATE TABLE IF NOT EXISTS overview (
    viewer_id TEXT NOT NULL,
    conversation_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    name TEXT,
    partner_id TEXT,
    partner_name TEXT,
    partner_handle TEXT,
    partner_avatar TEXT,
    last_message_id TEXT,
    last_sender_id TEXT,
    last_ciphertext TEXT,
    last_at INTEGER,
    unread_count INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (viewer_id, conversation_id)
);

CREATE INDEX IF NOT EXISTS idx_members_user ON members(user_id);
CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, created_at);
CREATE INDEX IF NOT EXISTS idx_reactions_message ON reactions(message_id);
"#;
