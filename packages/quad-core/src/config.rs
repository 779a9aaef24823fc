//! # Sync Configuration
//!
//! Tunables for the conversation sync engine. Every field has a default,
//! so a partial JSON document (or none at all) is a valid configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::Result;

/// Default debounce for list-level refreshes (membership events)
pub const DEFAULT_LIST_DEBOUNCE_MS: u64 = 100;

/// Default debounce for the open conversation's targeted refresh
pub const DEFAULT_CONVERSATION_DEBOUNCE_MS: u64 = 80;

/// Default window in which an optimistic message may match its confirmed echo.
///
/// Observed echoes arrive within a few seconds; this is a heuristic, not a
/// protocol bound.
pub const DEFAULT_RECONCILE_TOLERANCE_MS: i64 = 10_000;

/// Default number of messages fetched per page
pub const DEFAULT_PAGE_SIZE: usize = 50;

/// Default length (in characters) of a last-message preview
pub const DEFAULT_PREVIEW_LEN: usize = 80;

/// Configuration for a [`ChatSession`](crate::session::ChatSession)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Debounce applied to list-level refreshes (ms)
    pub list_debounce_ms: u64,
    /// Debounce applied to the open conversation's refresh (ms)
    pub conversation_debounce_ms: u64,
    /// Optimistic reconcile window (ms)
    pub reconcile_tolerance_ms: i64,
    /// Messages per page
    pub page_size: usize,
    /// Preview length in characters
    pub preview_len: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            list_debounce_ms: DEFAULT_LIST_DEBOUNCE_MS,
            conversation_debounce_ms: DEFAULT_CONVERSATION_DEBOUNCE_MS,
            reconcile_tolerance_ms: DEFAULT_RECONCILE_TOLERANCE_MS,
            page_size: DEFAULT_PAGE_SIZE,
            preview_len: DEFAULT_PREVIEW_LEN,
        }
    }
}

impl SyncConfig {
    /// Parse a configuration from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// List-level debounce as a [`Duration`]
    pub fn list_debounce(&self) -> Duration {
        Duration::from_millis(self.list_debounce_ms)
    }

    /// Conversation-level debounce as a [`Duration`]
    pub fn conversation_debounce(&self) -> Duration {
        Duration::from_millis(self.conversation_debounce_ms)
    }
}
