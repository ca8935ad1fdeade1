//! Nonce minting from a process-lifetime secret key.
//!
//! Every unguessable identifier the broker hands out — conversation ids,
//! session cookie bodies, CSRF tokens — comes from the same place: a
//! 128-byte random key read once at startup, combined with a monotonic
//! counter under HMAC-SHA256.

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use rand::{RngCore, rngs::OsRng};
use sha2::Sha256;
use std::sync::atomic::{AtomicU64, Ordering};
use zeroize::Zeroize;

const KEY_LEN: usize = 128;

/// Startup-random key material, overwritten when the broker goes away.
struct SecretKey([u8; KEY_LEN]);

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

pub struct NonceFactory {
    key: SecretKey,
    counter: AtomicU64,
}

impl NonceFactory {
    /// # Errors
    /// Returns an error if the OS RNG cannot supply key material; callers
    /// treat this as fatal at startup.
    pub fn new() -> Result<Self> {
        let mut key = [0u8; KEY_LEN];
        OsRng
            .try_fill_bytes(&mut key)
            .context("couldn't read random key")?;
        Ok(Self {
            key: SecretKey(key),
            counter: AtomicU64::new(0),
        })
    }

    /// Mint a fresh nonce: lowercase hex of HMAC-SHA256(key, counter).
    ///
    /// Unique for the lifetime of the factory under standard cryptographic
    /// assumptions; no collision handling is needed.
    pub fn mint(&self) -> String {
        let seed = self.counter.fetch_add(1, Ordering::Relaxed);
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key.0)
            .expect("HMAC accepts keys of any length");
        mac.update(&seed.to_le_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn mint_is_hex_of_digest_size() {
        let nonces = NonceFactory::new().expect("rng");
        let nonce = nonces.mint();
        assert_eq!(nonce.len(), 64);
        assert!(nonce.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(nonce, nonce.to_lowercase());
    }

    #[test]
    fn mint_never_repeats() {
        let nonces = NonceFactory::new().expect("rng");
        let minted: HashSet<String> = (0..1000).map(|_| nonces.mint()).collect();
        assert_eq!(minted.len(), 1000);
    }

    #[test]
    fn factories_do_not_share_streams() {
        let a = NonceFactory::new().expect("rng");
        let b = NonceFactory::new().expect("rng");
        assert_ne!(a.mint(), b.mint());
    }
}
