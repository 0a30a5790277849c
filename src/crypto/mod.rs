//! Crypto Module
//!
//! The two primitives the engine consumes: a symmetric cipher for shard
//! files and a keyed one-way hash for transaction log tokens.
//!
//! - Cipher: AES-256-GCM, key = SHA-256 of the configured passphrase,
//!   random 96-bit nonce per envelope.
//! - Keyed hash: HMAC-SHA256 over `iv || plaintext`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Result, ShardKvError};

type HmacSha256 = Hmac<Sha256>;

/// GCM nonce length in bytes
const NONCE_LEN: usize = 12;

/// Encrypted payload as stored on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Hex nonce
    pub iv: String,
    /// Hex ciphertext (with tag)
    pub data: String,
}

/// Symmetric cipher bound to one key
#[derive(Clone)]
pub struct Cipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Cipher(..)")
    }
}

impl Cipher {
    pub fn new(passphrase: &str) -> Result<Self> {
        let key = Sha256::digest(passphrase.as_bytes());
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| ShardKvError::Crypto(format!("invalid key: {e}")))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<Envelope> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let data = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| ShardKvError::Crypto(format!("encryption failed: {e}")))?;

        Ok(Envelope {
            iv: hex::encode(nonce_bytes),
            data: hex::encode(data),
        })
    }

    pub fn decrypt(&self, envelope: &Envelope) -> Result<String> {
        let nonce_bytes = hex::decode(&envelope.iv)
            .map_err(|e| ShardKvError::Crypto(format!("bad iv: {e}")))?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(ShardKvError::Crypto(format!(
                "bad iv length {}",
                nonce_bytes.len()
            )));
        }
        let data = hex::decode(&envelope.data)
            .map_err(|e| ShardKvError::Crypto(format!("bad ciphertext: {e}")))?;

        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), data.as_slice())
            .map_err(|e| ShardKvError::Crypto(format!("decryption failed: {e}")))?;

        String::from_utf8(plaintext).map_err(|e| ShardKvError::Crypto(e.to_string()))
    }

    /// Encrypt and wrap into the on-disk JSON text
    pub fn seal(&self, plaintext: &str) -> Result<String> {
        Ok(serde_json::to_string(&self.encrypt(plaintext)?)?)
    }

    /// Inverse of `seal`
    pub fn open(&self, sealed: &str) -> Result<String> {
        let envelope: Envelope = serde_json::from_str(sealed)
            .map_err(|e| ShardKvError::Crypto(format!("bad envelope: {e}")))?;
        self.decrypt(&envelope)
    }
}

/// Keyed one-way token of `plaintext` (hex)
pub fn keyed_hash(plaintext: &str, key: &[u8], iv: &[u8]) -> Result<String> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| ShardKvError::Crypto(format!("invalid hash key: {e}")))?;
    mac.update(iv);
    mac.update(plaintext.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}
