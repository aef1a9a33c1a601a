//! Process key material.
//!
//! Derives the symmetric key the envelope codec uses for cluster frames:
//! from an externally supplied passphrase (hashed), or secure-random when no
//! passphrase exists. The key is held XOR-masked with a random pad so a
//! casual memory dump does not expose it directly; [`SecretKeys::remask`]
//! rotates the pad in place.
//!
//! This is an explicit context object passed into the codec — initialize it
//! once at process start and share it (`Arc` or borrow) with every bus that
//! must interoperate. Two processes exchange cluster frames only if they were
//! built from the same passphrase.

use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Key length in bytes (XChaCha20-Poly1305).
pub const KEY_LEN: usize = 32;

/// Process-wide symmetric key material, XOR-masked at rest.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretKeys {
    masked: [u8; KEY_LEN],
    mask: [u8; KEY_LEN],
}

impl SecretKeys {
    /// Derives key material from an externally supplied passphrase.
    ///
    /// The passphrase itself is never stored; only its SHA-256 digest
    /// survives, masked.
    #[must_use]
    pub fn from_passphrase(passphrase: &str) -> Self {
        let mut key: [u8; KEY_LEN] = Sha256::digest(passphrase.as_bytes()).into();
        let keys = Self::masked(&key);
        key.zeroize();
        keys
    }

    /// Generates random key material (the fallback when no passphrase was
    /// supplied; such a process can only talk to itself).
    #[must_use]
    pub fn random() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        let keys = Self::masked(&key);
        key.zeroize();
        keys
    }

    /// Masks `key` with a fresh random pad.
    fn masked(key: &[u8; KEY_LEN]) -> Self {
        let mut mask = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut mask);
        let mut masked = [0u8; KEY_LEN];
        for i in 0..KEY_LEN {
            masked[i] = key[i] ^ mask[i];
        }
        Self { masked, mask }
    }

    /// Rotates the at-rest mask without changing the key.
    pub fn remask(&mut self) {
        let mut fresh = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut fresh);
        for i in 0..KEY_LEN {
            self.masked[i] ^= self.mask[i] ^ fresh[i];
            self.mask[i] = fresh[i];
        }
    }

    /// Reconstructs the key for one codec call. The returned buffer zeroes
    /// itself when it leaves scope.
    pub(crate) fn unmask(&self) -> Zeroizing<[u8; KEY_LEN]> {
        let mut key = [0u8; KEY_LEN];
        for i in 0..KEY_LEN {
            key[i] = self.masked[i] ^ self.mask[i];
        }
        Zeroizing::new(key)
    }
}

impl std::fmt::Debug for SecretKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKeys(..)")
    }
}

// ===========================================================================
// Tests
// ===========================================================================
