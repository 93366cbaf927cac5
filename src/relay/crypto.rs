use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Directional session identifier for a device pair.
/// `session_id(a, b) != session_id(b, a)`; each direction carries its own key.
pub fn session_id(sender_device: Uuid, recipient_device: Uuid) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", sender_device, recipient_device).as_bytes());
    hex::encode(hasher.finalize())
}

/// Per-recipient-device sealing with ChaCha20-Poly1305.
///
/// The relay never sees conversation plaintext; what gets sealed here is the
/// sender's already-encrypted payload, wrapped once more for the specific
/// recipient device so a mailbox row is useless to any other device.
pub struct PayloadSealer {
    cipher: ChaCha20Poly1305,
}

/// Base64 ciphertext plus the base64 nonce it was sealed under.
pub struct SealedPayload {
    pub ciphertext: String,
    pub nonce: String,
}

impl PayloadSealer {
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != 32 {
            anyhow::bail!("Session key must be exactly 32 bytes, got {}", key.len());
        }
        let cipher = ChaCha20Poly1305::new(key.into());
        Ok(Self { cipher })
    }

    /// Seal a payload under a fresh random nonce. Nonces are never reused:
    /// every mailbox row gets its own.
    pub fn seal(&self, payload: &str) -> Result<SealedPayload> {
        let mut nonce_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, payload.as_bytes())
            .map_err(|e| anyhow::anyhow!("Sealing failed: {}", e))?;

        Ok(SealedPayload {
            ciphertext: BASE64.encode(ciphertext),
            nonce: BASE64.encode(nonce_bytes),
        })
    }

    pub fn open(&self, ciphertext_b64: &str, nonce_b64: &str) -> Result<String> {
        let ciphertext = BASE64
            .decode(ciphertext_b64)
            .context("Invalid base64 in sealed payload")?;
        let nonce_bytes = BASE64.decode(nonce_b64).context("Invalid base64 in nonce")?;
        if nonce_bytes.len() != 12 {
            anyhow::bail!("Nonce must be 12 bytes, got {}", nonce_bytes.len());
        }
        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext.as_slice())
            .map_err(|e| anyhow::anyhow!("Opening failed: {}", e))?;

        String::from_utf8(plaintext).context("Opened payload is not valid UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_is_directional() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert_ne!(session_id(a, b), session_id(b, a));
        assert_eq!(session_id(a, b), session_id(a, b));
        assert_eq!(session_id(a, b).len(), 64);
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = [7u8; 32];
        let sealer = PayloadSealer::new(&key).unwrap();

        let sealed = sealer.seal("opaque-client-ciphertext").unwrap();
        let opened = sealer.open(&sealed.ciphertext, &sealed.nonce).unwrap();

        assert_eq!(opened, "opaque-client-ciphertext");
    }

    #[test]
    fn test_seal_uses_fresh_nonces() {
        let key = [7u8; 32];
        let sealer = PayloadSealer::new(&key).unwrap();

        let first = sealer.seal("payload").unwrap();
        let second = sealer.seal("payload").unwrap();

        assert_ne!(first.nonce, second.nonce);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn test_wrong_key_fails_to_open() {
        let sealer = PayloadSealer::new(&[1u8; 32]).unwrap();
        let other = PayloadSealer::new(&[2u8; 32]).unwrap();

        let sealed = sealer.seal("payload").unwrap();
        assert!(other.open(&sealed.ciphertext, &sealed.nonce).is_err());
    }

    #[test]
    fn test_rejects_short_key() {
        assert!(PayloadSealer::new(&[0u8; 16]).is_err());
    }
}
