//! Cryptographic primitives for Nightdrop
//!
//! This module provides the key material handling for the messaging core:
//! - X25519 long-term identity keypairs and Diffie-Hellman shared secrets
//! - The identity vault holding the current keypair plus rotated-out secrets
//! - SHA-256 digests for persistence key derivation

pub mod random;

use std::time::SystemTime;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};
use crate::protocol::PeerId;

/// X25519 keypair for identity and key agreement
#[derive(Clone)]
pub struct NightdropKeypair {
    secret: StaticSecret,
    public: PeerId,
}

impl NightdropKeypair {
    /// Generate a new keypair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = X25519Public::from(&secret).to_bytes();
        Self { secret, public }
    }

    /// Create from existing secret key bytes
    pub fn from_secret_bytes(secret_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(secret_bytes);
        let public = X25519Public::from(&secret).to_bytes();
        Self { secret, public }
    }

    /// Get public key bytes
    pub fn public_key(&self) -> PeerId {
        self.public
    }

    /// Borrow the secret half
    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

impl std::fmt::Debug for NightdropKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NightdropKeypair")
            .field("public", &hex::encode(self.public))
            .finish_non_exhaustive()
    }
}

/// X25519 shared secret between a secret key and a peer public key
pub fn shared_secret(secret: &StaticSecret, peer_pk: &PeerId) -> [u8; 32] {
    let their_public = X25519Public::from(*peer_pk);
    secret.diffie_hellman(&their_public).to_bytes()
}

/// SHA-256 digest, used to derive persistence keys from key material
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    out
}

/// A rotated-out long-term secret retained for decrypting older traffic
#[derive(Zeroize, ZeroizeOnDrop)]
struct RetiredSecret {
    bytes: [u8; 32],
}

/// Holds the current long-term keypair and the secrets it replaced.
///
/// Rotation swaps the keypair atomically; readers observe either the old or
/// the new identity, never a mix. Previous secrets stay available so that
/// messages sealed against a pre-rotation key still decrypt.
pub struct IdentityVault {
    inner: RwLock<VaultInner>,
}

struct VaultInner {
    current: NightdropKeypair,
    previous: Vec<RetiredSecret>,
    rotated_at: SystemTime,
}

impl IdentityVault {
    pub fn new(keypair: NightdropKeypair) -> Self {
        Self {
            inner: RwLock::new(VaultInner {
                current: keypair,
                previous: Vec::new(),
                rotated_at: SystemTime::now(),
            }),
        }
    }

    /// Current public key
    pub fn public_key(&self) -> PeerId {
        self.inner.read().current.public_key()
    }

    /// Clone of the current keypair
    pub fn current_keypair(&self) -> NightdropKeypair {
        self.inner.read().current.clone()
    }

    /// Age of the current keypair
    pub fn key_age(&self) -> std::time::Duration {
        let inner = self.inner.read();
        SystemTime::now()
            .duration_since(inner.rotated_at)
            .unwrap_or_default()
    }

    /// Every secret key that may decrypt inbound traffic: current first,
    /// then retired keys from newest to oldest.
    pub fn all_secrets(&self) -> Vec<StaticSecret> {
        let inner = self.inner.read();
        let mut secrets = vec![inner.current.secret().clone()];
        secrets.extend(
            inner
                .previous
                .iter()
                .rev()
                .map(|retired| StaticSecret::from(retired.bytes)),
        );
        secrets
    }

    /// Replace the current keypair, retiring the old secret.
    ///
    /// Returns the new public key.
    pub fn rotate(&self) -> PeerId {
        let fresh = NightdropKeypair::generate();
        let mut inner = self.inner.write();
        let old_bytes = inner.current.secret().to_bytes();
        inner.previous.push(RetiredSecret { bytes: old_bytes });
        inner.current = fresh;
        inner.rotated_at = SystemTime::now();
        inner.current.public_key()
    }

    /// Rotate when the current key is older than `max_age`.
    pub fn rotate_if_older_than(&self, max_age: std::time::Duration) -> Option<PeerId> {
        if self.key_age() >= max_age {
            Some(self.rotate())
        } else {
            None
        }
    }
}

/// Validate that a byte slice is a plausible 32-byte public key
pub fn peer_id_from_slice(bytes: &[u8]) -> Result<PeerId> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Crypto(format!("expected 32-byte key, got {}", bytes.len())))?;
    Ok(arr)
}
