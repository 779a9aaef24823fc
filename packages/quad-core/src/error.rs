//! # Error Handling
//!
//! Error types for the Quad conversation sync engine.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Sync Errors (100-199)                                             │
//! │  │   ├── TransientFetch         - Storage/network unavailable          │
//! │  │   └── InconsistentMembership - Overview entry without membership    │
//! │  │                                                                      │
//! │  ├── Permission Errors (200-299)                                       │
//! │  │   ├── PermissionDenied       - Server rejected a mutation           │
//! │  │   ├── NotMember              - Viewer has no roster row             │
//! │  │   ├── PostingRestricted      - Admin-only conversation              │
//! │  │   ├── Muted                  - Mute has not expired yet             │
//! │  │   ├── ReadOnlyConversation   - Client-only placeholder              │
//! │  │   ├── CannotModifySelf       - Self-protection invariant            │
//! │  │   └── CannotModifyOwner      - Owner protection                     │
//! │  │                                                                      │
//! │  ├── Crypto Errors (300-399)                                           │
//! │  │   ├── EncryptionFailed                                              │
//! │  │   └── DecryptionFailed       - Isolated per message                 │
//! │  │                                                                      │
//! │  ├── Storage Errors (400-499)                                          │
//! │  │   ├── DatabaseError                                                 │
//! │  │   └── SerializationError                                            │
//! │  │                                                                      │
//! │  ├── Message Errors (700-799)                                          │
//! │  │   ├── ConversationNotFound                                          │
//! │  │   ├── MessageNotFound                                               │
//! │  │   ├── InvalidMessageContent                                         │
//! │  │   └── InvalidOperation                                              │
//! │  │                                                                      │
//! │  └── Internal (900-999)                                                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every failure that reaches the session boundary is also published as a
//! [`SyncEvent::Notice`](crate::session::SyncEvent::Notice) so the UI can
//! show a non-blocking notification while keeping the previous state.

use thiserror::Error;

/// Result type alias for Quad Core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Quad Core
#[derive(Error, Debug, Clone)]
pub enum Error {
    // ========================================================================
    // Sync Errors (100-199)
    // ========================================================================

    /// Storage or network was unavailable; prior state is kept
    #[error("Temporarily unable to reach the server: {0}")]
    TransientFetch(String),

    /// An overview entry has no matching membership row and repair is exhausted
    #[error("Conversation {conversation_id} is missing a membership record")]
    InconsistentMembership {
        /// The conversation that could not be repaired
        conversation_id: String,
    },

    // ========================================================================
    // Permission Errors (200-299)
    // ========================================================================

    /// The server rejected a mutation (usually stale client permission state)
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// The viewer is not a member of the conversation
    #[error("You are not a member of this conversation.")]
    NotMember,

    /// Only owners and admins may post in this conversation
    #[error("Only admins can post in this conversation.")]
    PostingRestricted,

    /// The member is muted
    #[error("You are muted until {until}.")]
    Muted {
        /// Mute expiry (Unix ms)
        until: i64,
    },

    /// The conversation is a client-only placeholder
    #[error("This conversation is read-only until it finishes syncing.")]
    ReadOnlyConversation,

    /// Self-targeted downgrade, mute or ban
    #[error("You cannot apply this action to yourself.")]
    CannotModifySelf,

    /// Only the owner may act on the owner
    #[error("The conversation owner cannot be modified.")]
    CannotModifyOwner,

    // ========================================================================
    // Crypto Errors (300-399)
    // ========================================================================

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    // ========================================================================
    // Storage Errors (400-499)
    // ========================================================================

    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    // ========================================================================
    // Message Errors (700-799)
    // ========================================================================

    /// Conversation not found
    #[error("Conversation not found.")]
    ConversationNotFound,

    /// Message not found
    #[error("Message not found.")]
    MessageNotFound,

    /// Invalid message content
    #[error("Invalid message content: {0}")]
    InvalidMessageContent(String),

    /// Operation not allowed in the current state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get the numeric error code
    ///
    /// - 100-199: Sync
    /// - 200-299: Permissions
    /// - 300-399: Crypto
    /// - 400-499: Storage
    /// - 700-799: Messages
    /// - 900-999: Internal
    pub fn code(&self) -> i32 {
        match self {
            Error::TransientFetch(_) => 100,
            Error::InconsistentMembership { .. } => 101,

            Error::PermissionDenied(_) => 200,
            Error::NotMember => 201,
            Error::PostingRestricted => 202,
            Error::Muted { .. } => 203,
            Error::ReadOnlyConversation => 204,
            Error::CannotModifySelf => 205,
            Error::CannotModifyOwner => 206,

            Error::EncryptionFailed(_) => 300,
            Error::DecryptionFailed(_) => 301,

            Error::DatabaseError(_) => 400,
            Error::SerializationError(_) => 401,

            Error::ConversationNotFound => 700,
            Error::MessageNotFound => 701,
            Error::InvalidMessageContent(_) => 702,
            Error::InvalidOperation(_) => 703,

            Error::Internal(_) => 900,
        }
    }

    /// Check if this error is recoverable by an explicit user retry
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::TransientFetch(_) | Error::DatabaseError(_))
    }

    /// Whether the client should roll back optimistic state for this error
    pub fn requires_rollback(&self) -> bool {
        matches!(
            self,
            Error::PermissionDenied(_) | Error::NotMember | Error::CannotModifyOwner
        )
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::DatabaseError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================
