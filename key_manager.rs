//! Encryption key material.
//!
//! This module provides [`KeyManager`], which turns the operator-supplied
//! secret into the single 256-bit key used for every blob.
//!
//! ## Secret Formats
//!
//! - 32 bytes encoded as standard base64 or as hex are used verbatim
//! - Anything else is a passphrase, stretched with PBKDF2-HMAC-SHA256
//! - No secret at all selects a development-only key and logs a warning
//!
//! The key is derived lazily on first use and zeroized on drop.

use crate::config::Config;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use tracing::{debug, warn};
use zeroize::Zeroize;

/// Key length in bytes (AES-256)
pub const KEY_LEN: usize = 32;

const KDF_SALT: &[u8] = b"vaultfs-static-salt-v1";
const KDF_ROUNDS: u32 = 100_000;
const DEV_KEY_SEED: &[u8] = b"vaultfs-development-key-do-not-use";

/// Holds the process encryption key.
/// Construct once at startup and share behind an `Arc`.
pub struct KeyManager {
    secret: Option<String>,
    key: OnceLock<[u8; KEY_LEN]>,
}

impl Drop for KeyManager {
    fn drop(&mut self) {
        if let Some(secret) = self.secret.as_mut() {
            secret.zeroize();
        }
        if let Some(key) = self.key.get_mut() {
            key.zeroize();
        }
    }
}

impl KeyManager {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret,
            key: OnceLock::new(),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.encryption_secret.clone())
    }

    /// Use raw key bytes directly, skipping derivation.
    pub fn from_key_bytes(key: [u8; KEY_LEN]) -> Self {
        let manager = Self::new(None);
        let _ = manager.key.set(key);
        manager
    }

    /// True when no operator secret is configured.
    pub fn is_development(&self) -> bool {
        self.key.get().is_none() && secret_or_none(self.secret.as_deref()).is_none()
    }

    /// The derived key, computed on first call.
    pub fn key(&self) -> &[u8; KEY_LEN] {
        self.key
            .get_or_init(|| derive_key(secret_or_none(self.secret.as_deref())))
    }
}

/// Fresh random secret in the base64 form [`KeyManager`] uses verbatim.
pub fn generate_secret() -> String {
    let mut raw = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut raw);
    let encoded = BASE64.encode(raw);
    raw.zeroize();
    encoded
}

fn secret_or_none(secret: Option<&str>) -> Option<&str> {
    secret.map(str::trim).filter(|s| !s.is_empty())
}

fn derive_key(secret: Option<&str>) -> [u8; KEY_LEN] {
    let Some(secret) = secret else {
        warn!("no encryption secret configured - using the development key, do not use in production");
        return Sha256::digest(DEV_KEY_SEED).into();
    };

    if let Some(key) = decode_exact(BASE64.decode(secret).ok()) {
        debug!("using base64 encryption secret as raw key");
        return key;
    }
    if let Some(key) = decode_exact(hex::decode(secret).ok()) {
        debug!("using hex encryption secret as raw key");
        return key;
    }

    debug!(rounds = KDF_ROUNDS, "deriving encryption key from passphrase");
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(secret.as_bytes(), KDF_SALT, KDF_ROUNDS, &mut key);
    key
}

fn decode_exact(decoded: Option<Vec<u8>>) -> Option<[u8; KEY_LEN]> {
    let mut bytes = decoded?;
    let key = if bytes.len() == KEY_LEN {
        let mut arr = [0u8; KEY_LEN];
        arr.copy_from_slice(&bytes);
        Some(arr)
    } else {
        None
    };
    bytes.zeroize();
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_secret_is_used_verbatim() {
        let raw = [7u8; KEY_LEN];
        let km = KeyManager::new(Some(BASE64.encode(raw)));
        assert_eq!(km.key(), &raw);
        assert!(!km.is_development());
    }

    #[test]
    fn hex_secret_is_used_verbatim() {
        let raw: [u8; KEY_LEN] = core::array::from_fn(|i| i as u8);
        let km = KeyManager::new(Some(hex::encode(raw)));
        assert_eq!(km.key(), &raw);
    }

    #[test]
    fn passphrase_is_stretched_deterministically() {
        let a = KeyManager::new(Some("correct horse battery staple".into()));
        let b = KeyManager::new(Some("correct horse battery staple".into()));
        let c = KeyManager::new(Some("another passphrase".into()));
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn missing_secret_falls_back_to_development_key() {
        let km = KeyManager::new(None);
        assert!(km.is_development());
        let blank = KeyManager::new(Some("   ".into()));
        assert_eq!(km.key(), blank.key());
        let expected: [u8; KEY_LEN] = Sha256::digest(DEV_KEY_SEED).into();
        assert_eq!(km.key(), &expected);
    }

    #[test]
    fn generated_secret_decodes_to_a_raw_key() {
        let secret = generate_secret();
        assert_ne!(secret, generate_secret());
        let decoded = BASE64.decode(&secret).expect("base64");
        let km = KeyManager::new(Some(secret));
        assert_eq!(km.key().as_slice(), decoded.as_slice());
    }

    #[test]
    fn explicit_key_bytes_are_not_development() {
        let km = KeyManager::from_key_bytes([0x42; KEY_LEN]);
        assert!(!km.is_development());
        assert_eq!(km.key(), &[0x42; KEY_LEN]);
    }
}
