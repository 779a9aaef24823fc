//! # Messaging
//!
//! Per-conversation message logs and the helpers that turn stored rows
//! into displayable messages.
//!
//! ## Optimistic Send
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         OPTIMISTIC SEND                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  send_message("hello")                                                  │
//! │       │                                                                 │
//! │       ├──▶ append_optimistic  [Pending(local), Sending]                 │
//! │       │                                                                 │
//! │       ├──▶ ChatBackend::insert_message ──▶ confirmed row                │
//! │       │                                        │                        │
//! │       │         realtime echo (same row) ──────┤                        │
//! │       │                                        ▼                        │
//! │       └──────────────────────────────▶ reconcile(confirmed)             │
//! │                                                                         │
//! │  Whichever arrives first replaces the pending entry (same sender,       │
//! │  same content fingerprint, within the tolerance window). The second     │
//! │  finds the confirmed id already present and replaces it in place.       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

mod store;

pub use store::{MessageLog, MessageStore, ReconcileOutcome};

use sha2::{Digest, Sha256};

use crate::crypto::{decode_or_sentinel, ContentCipher};
use crate::model::{Message, MessageId, MessageStatus};
use crate::storage::MessageRow;

/// SHA-256 of a message body, hex encoded
pub fn content_fingerprint(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// First `max` characters of `text`, with an ellipsis when truncated
pub fn preview(text: &str, max: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max).collect();
    if chars.next().is_some() {
        format!("{}…", head)
    } else {
        head
    }
}

/// Turn a stored row into a message, decoding its body.
///
/// A body that fails to decode becomes the decryption sentinel; deleted
/// rows stay blank.
pub fn hydrate_message(row: MessageRow, cipher: &dyn ContentCipher) -> Message {
    let text = if row.deleted || row.ciphertext.is_empty() {
        String::new()
    } else {
        decode_or_sentinel(cipher, &row.id, &row.ciphertext)
    };

    Message {
        id: MessageId::Confirmed(row.id),
        conversation_id: row.conversation_id,
        sender_id: row.sender_id,
        ciphertext: row.ciphertext,
        text,
        created_at: row.created_at,
        edited_at: row.edited_at,
        deleted: row.deleted,
        reply_to: row.reply_to,
        forwarded_from: row.forwarded_from,
        reactions: row.reactions.unwrap_or_default().into_iter().collect(),
        status: MessageStatus::Sent,
        sender: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AesContentCipher, DECRYPTION_SENTINEL};
    use crate::model::Reaction;

    fn row(ciphertext: &str) -> MessageRow {
        MessageRow {
            id: "m1".into(),
            conversation_id: "c1".into(),
            sender_id: "alice".into(),
            ciphertext: ciphertext.into(),
            created_at: 10,
            edited_at: None,
            deleted: false,
            reply_to: None,
            forwarded_from: None,
            reactions: Some(vec![Reaction::new("bob", "👍")]),
        }
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(content_fingerprint("hello"), content_fingerprint("hello"));
        assert_ne!(content_fingerprint("hello"), content_fingerprint("hello "));
        assert_eq!(content_fingerprint("").len(), 64);
    }

    #[test]
    fn test_preview_is_char_safe() {
        assert_eq!(preview("short", 80), "short");
        assert_eq!(preview("héllo wörld", 5), "héllo…");
        assert_eq!(preview("🎉🎉🎉", 2), "🎉🎉…");
    }

    #[test]
    fn test_hydrate_decodes_body() {
        let cipher = AesContentCipher::new(b"k");
        let msg = hydrate_message(row(&cipher.encode("hi").unwrap()), &cipher);
        assert_eq!(msg.text, "hi");
        assert_eq!(msg.id, MessageId::Confirmed("m1".into()));
        assert_eq!(msg.reactions.len(), 1);
        assert_eq!(msg.status, MessageStatus::Sent);
    }

    #[test]
    fn test_hydrate_isolates_decrypt_failure() {
        let cipher = AesContentCipher::new(b"k");
        let msg = hydrate_message(row("garbage"), &cipher);
        assert_eq!(msg.text, DECRYPTION_SENTINEL);
    }
}
