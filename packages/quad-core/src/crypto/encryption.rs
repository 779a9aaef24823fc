//! # AES-256-GCM Content Cipher
//!
//! Reference [`ContentCipher`] used by the demo and tests.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      CONTENT ENCRYPTION FLOW                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Step 1: Derive Content Key (once per session)                         │
//! │  ┌─────────────────────────────────────────────────────────────┐       │
//! │  │  HKDF-SHA256(                                                │       │
//! │  │    ikm  = session secret,                                   │       │
//! │  │    salt = none,                                             │       │
//! │  │    info = "quad-message-content-v1"                         │       │
//! │  │  ) → 32-byte key                                            │       │
//! │  └─────────────────────────────────────────────────────────────┘       │
//! │                                                                         │
//! │  Step 2: Encrypt (per message)                                         │
//! │  ┌─────────────────────────────────────────────────────────────┐       │
//! │  │  nonce = 12 random bytes (OsRng)                            │       │
//! │  │  AES-256-GCM(key, nonce, plaintext) → ciphertext + tag      │       │
//! │  └─────────────────────────────────────────────────────────────┘       │
//! │                                                                         │
//! │  Wire form: base64( nonce ‖ ciphertext ‖ tag )                         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce as AesNonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::ZeroizeOnDrop;

use super::ContentCipher;
use crate::error::{Error, Result};

/// Size of the AES-GCM nonce in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Size of the content key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

const CONTENT_KEY_INFO: &[u8] = b"quad-message-content-v1";

/// Zeroized when dropped.
#[derive(ZeroizeOnDrop)]
struct ContentKey([u8; KEY_SIZE]);

/// AES-256-GCM cipher keyed from a session secret
pub struct AesContentCipher {
    key: ContentKey,
}

impl AesContentCipher {
    /// Derive the content key from `secret` via HKDF-SHA256
    pub fn new(secret: &[u8]) -> Self {
        let hkdf = Hkdf::<Sha256>::new(None, secret);
        let mut key = [0u8; KEY_SIZE];
        // 32 bytes is always a valid HKDF-SHA256 output length
        if hkdf.expand(CONTENT_KEY_INFO, &mut key).is_err() {
            tracing::error!("HKDF expansion rejected a {}-byte output", KEY_SIZE);
        }
        Self { key: ContentKey(key) }
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key.0)
            .map_err(|e| Error::Internal(format!("Invalid content key: {}", e)))
    }
}

impl ContentCipher for AesContentCipher {
    fn encode(&self, plaintext: &str) -> Result<String> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher()?
            .encrypt(AesNonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| Error::EncryptionFailed(format!("Encryption failed: {}", e)))?;

        let mut wire = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        wire.extend_from_slice(&nonce);
        wire.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(wire))
    }

    fn decode(&self, ciphertext: &str) -> Result<String> {
        let wire = STANDARD
            .decode(ciphertext)
            .map_err(|e| Error::DecryptionFailed(format!("Invalid encoding: {}", e)))?;
        if wire.len() < NONCE_SIZE {
            return Err(Error::DecryptionFailed("Ciphertext too short".into()));
        }

        let (nonce, body) = wire.split_at(NONCE_SIZE);
        let plaintext = self
            .cipher()?
            .decrypt(AesNonce::from_slice(nonce), body)
            .map_err(|_| {
                Error::DecryptionFailed("Decryption failed: authentication tag mismatch".into())
            })?;

        String::from_utf8(plaintext)
            .map_err(|e| Error::DecryptionFailed(format!("Invalid UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let cipher = AesContentCipher::new(b"session secret");
        let wire = cipher.encode("meet at the library").unwrap();
        assert_ne!(wire, "meet at the library");
        assert_eq!(cipher.decode(&wire).unwrap(), "meet at the library");
    }

    #[test]
    fn test_nonces_differ() {
        let cipher = AesContentCipher::new(b"session secret");
        assert_ne!(cipher.encode("same").unwrap(), cipher.encode("same").unwrap());
    }

    #[test]
    fn test_wrong_key_fails() {
        let alice = AesContentCipher::new(b"alice");
        let mallory = AesContentCipher::new(b"mallory");
        let wire = alice.encode("hello").unwrap();
        assert!(matches!(mallory.decode(&wire), Err(Error::DecryptionFailed(_))));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let cipher = AesContentCipher::new(b"session secret");
        let mut wire = STANDARD.decode(cipher.encode("hello").unwrap()).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        assert!(cipher.decode(&STANDARD.encode(wire)).is_err());
    }

    #[test]
    fn test_short_input_fails() {
        let cipher = AesContentCipher::new(b"session secret");
        assert!(cipher.decode(&STANDARD.encode([1u8, 2, 3])).is_err());
    }
}
