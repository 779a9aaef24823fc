//! # Content Encoding
//!
//! Message bodies cross the sync engine as opaque strings. The engine never
//! looks inside them; it only calls a [`ContentCipher`] at the edges:
//!
//! ```text
//!   send:     text ──encode──▶ ciphertext ──▶ ChatBackend::insert_message
//!   receive:  ChangeEvent / page ──▶ ciphertext ──decode──▶ text
//!                                                  │
//!                                        failure ──┴──▶ "[unable to decrypt]"
//! ```
//!
//! A decode failure is isolated to the one message: it is logged and the
//! body is replaced with [`DECRYPTION_SENTINEL`]. It never fails a page, a
//! refresh or a realtime batch.

mod encryption;

pub use encryption::{AesContentCipher, KEY_SIZE, NONCE_SIZE};

use crate::error::Result;

/// Text shown in place of a body that could not be decoded
pub const DECRYPTION_SENTINEL: &str = "[unable to decrypt]";

/// Opaque encode/decode boundary for message bodies
pub trait ContentCipher: Send + Sync {
    /// Encode plaintext into its wire form
    fn encode(&self, plaintext: &str) -> Result<String>;

    /// Decode the wire form back to plaintext
    fn decode(&self, ciphertext: &str) -> Result<String>;
}

/// Decode `ciphertext`, substituting [`DECRYPTION_SENTINEL`] on failure
pub fn decode_or_sentinel(cipher: &dyn ContentCipher, message_id: &str, ciphertext: &str) -> String {
    match cipher.decode(ciphertext) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!("Could not decode message {}: {}", message_id, e);
            DECRYPTION_SENTINEL.to_string()
        }
    }
}

/// Pass-through cipher for unencrypted deployments
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainContentCipher;

impl ContentCipher for PlainContentCipher {
    fn encode(&self, plaintext: &str) -> Result<String> {
        Ok(plaintext.to_string())
    }

    fn decode(&self, ciphertext: &str) -> Result<String> {
        Ok(ciphertext.to_string())
    }
}
