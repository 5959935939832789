//! One-time pre-key bundles and their store
//!
//! Each peer we talk to gets a bundle of one-time X25519 key pairs. A key is
//! consumed exactly once: consuming it is what gives the channel forward
//! secrecy. Bundles live behind a single write lock with atomic snapshot
//! replacement, so readers observe either the old bundle or the fully built
//! replacement and never a half-initialized one. Mutations persist
//! write-through to encrypted per-peer files.

pub mod persistence;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};
use crate::protocol::constants::{PRE_KEYS_PER_PEER, REFRESH_THRESHOLD};
use crate::protocol::wire::PreKeyPublic;
use crate::protocol::{short_hex, timestamp_nanos, PeerId};

pub use persistence::PreKeyPersistence;

/// Default lifetime of a bundle before `cleanup_expired` removes it
pub const DEFAULT_BUNDLE_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

/// Secret half of a one-time pre-key, zeroized when dropped
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct PreKeySecret([u8; 32]);

/// One single-use key pair
#[derive(Clone, Serialize, Deserialize)]
pub struct PreKey {
    pub id: u32,
    pub public_key: [u8; 32],
    secret_key: PreKeySecret,
    pub used: bool,
    /// Unix nanoseconds
    pub created_at: i64,
}

impl PreKey {
    fn generate(id: u32) -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public_key = X25519Public::from(&secret).to_bytes();
        Self {
            id,
            public_key,
            secret_key: PreKeySecret(secret.to_bytes()),
            used: false,
            created_at: timestamp_nanos(),
        }
    }

    /// The secret half, for key agreement on the receive path
    pub fn secret(&self) -> StaticSecret {
        StaticSecret::from(self.secret_key.0)
    }
}

impl std::fmt::Debug for PreKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreKey")
            .field("id", &self.id)
            .field("public_key", &hex::encode(self.public_key))
            .field("used", &self.used)
            .finish_non_exhaustive()
    }
}

/// A peer's bundle of one-time pre-keys
#[derive(Clone, Serialize, Deserialize)]
pub struct PreKeyBundle {
    pub peer_pk: PeerId,
    /// Unconsumed keys in FIFO order
    keys: VecDeque<PreKey>,
    /// Consumed key records, kept so replays are detectable
    consumed: Vec<PreKey>,
    /// Number of keys ever consumed from this bundle (monotonic)
    pub used_count: u64,
    /// Unix nanoseconds
    pub created_at: i64,
    /// Unix nanoseconds
    pub last_refresh_at: i64,
    /// Next id to hand out; preserved across refreshes and restarts
    next_key_id: u32,
}

impl PreKeyBundle {
    /// Build a fully initialized bundle of `PRE_KEYS_PER_PEER` fresh keys
    /// with sequential ids starting at `base_id`.
    pub fn generate(peer_pk: PeerId, base_id: u32) -> Self {
        let now = timestamp_nanos();
        let keys = (0..PRE_KEYS_PER_PEER as u32)
            .map(|offset| PreKey::generate(base_id + offset))
            .collect();
        Self {
            peer_pk,
            keys,
            consumed: Vec::new(),
            used_count: 0,
            created_at: now,
            last_refresh_at: now,
            next_key_id: base_id + PRE_KEYS_PER_PEER as u32,
        }
    }

    /// Unconsumed keys currently held
    pub fn remaining(&self) -> usize {
        self.keys.len()
    }

    pub fn next_key_id(&self) -> u32 {
        self.next_key_id
    }

    /// Public view of the unconsumed keys, in consumption order
    pub fn public_view(&self) -> Vec<PreKeyPublic> {
        self.keys
            .iter()
            .map(|k| PreKeyPublic {
                id: k.id,
                public_key: k.public_key,
            })
            .collect()
    }

    /// Look up a key by id, consumed or not
    pub fn get(&self, id: u32) -> Option<&PreKey> {
        self.keys
            .iter()
            .find(|k| k.id == id)
            .or_else(|| self.consumed.iter().find(|k| k.id == id))
    }

    /// Pop the FIFO-first unconsumed key, marking it used.
    fn consume_front(&mut self) -> Option<PreKey> {
        let mut key = self.keys.pop_front()?;
        key.used = true;
        self.consumed.push(key.clone());
        self.used_count += 1;
        Some(key)
    }

    /// Mark the key with `id` used. Idempotent; `false` if no such key.
    fn consume_by_id(&mut self, id: u32) -> bool {
        let pos = self.keys.iter().position(|k| k.id == id);
        match pos.and_then(|p| self.keys.remove(p)) {
            Some(mut key) => {
                key.used = true;
                self.consumed.push(key);
                self.used_count += 1;
                true
            }
            None => self.consumed.iter().any(|k| k.id == id),
        }
    }
}

impl std::fmt::Debug for PreKeyBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PreKeyBundle")
            .field("peer_pk", &short_hex(&self.peer_pk))
            .field("remaining", &self.remaining())
            .field("used_count", &self.used_count)
            .field("next_key_id", &self.next_key_id)
            .finish()
    }
}

/// Store of per-peer bundles with encrypted persistence
pub struct PreKeyStore {
    bundles: RwLock<HashMap<PeerId, Arc<PreKeyBundle>>>,
    persistence: Option<PreKeyPersistence>,
    bundle_ttl: Duration,
}

impl PreKeyStore {
    /// Volatile store; nothing touches disk. Used by tests and by callers
    /// that manage persistence themselves.
    pub fn new_in_memory() -> Self {
        Self {
            bundles: RwLock::new(HashMap::new()),
            persistence: None,
            bundle_ttl: DEFAULT_BUNDLE_TTL,
        }
    }

    /// Open a persistent store: derive the file key from `key_material`
    /// (typically the owner's long-term secret) and load every readable
    /// bundle from `dir`.
    pub async fn open(dir: impl AsRef<std::path::Path>, key_material: &[u8]) -> Result<Self> {
        let persistence = PreKeyPersistence::new(dir, key_material)?;
        let loaded = persistence.load_all().await;
        let mut bundles = HashMap::with_capacity(loaded.len());
        for bundle in loaded {
            bundles.insert(bundle.peer_pk, Arc::new(bundle));
        }
        log::info!("pre-key store opened with {} bundle(s)", bundles.len());
        Ok(Self {
            bundles: RwLock::new(bundles),
            persistence: Some(persistence),
            bundle_ttl: DEFAULT_BUNDLE_TTL,
        })
    }

    /// Override the bundle TTL used by [`cleanup_expired`](Self::cleanup_expired)
    pub fn with_bundle_ttl(mut self, ttl: Duration) -> Self {
        self.bundle_ttl = ttl;
        self
    }

    /// Generate a fresh bundle for `peer_pk`, continuing the peer's id
    /// sequence where the previous bundle (if any) left off.
    pub async fn generate(&self, peer_pk: PeerId) -> Result<Arc<PreKeyBundle>> {
        let mut bundles = self.bundles.write().await;
        let base_id = bundles
            .get(&peer_pk)
            .map(|b| b.next_key_id())
            .unwrap_or(0);
        let bundle = Arc::new(PreKeyBundle::generate(peer_pk, base_id));
        bundles.insert(peer_pk, bundle.clone());
        self.persist(&bundle).await?;
        log::debug!(
            "generated bundle for peer {} (ids {}..{})",
            short_hex(&peer_pk),
            base_id,
            bundle.next_key_id()
        );
        Ok(bundle)
    }

    /// Pop the first unused key atomically, mark it used, persist.
    pub async fn get_available(&self, peer_pk: &PeerId) -> Result<PreKey> {
        let mut bundles = self.bundles.write().await;
        let bundle = bundles
            .get(peer_pk)
            .ok_or_else(|| Error::NoPreKeys(short_hex(peer_pk)))?;
        let mut updated = (**bundle).clone();
        let key = updated.consume_front().ok_or_else(|| {
            Error::InsufficientPreKeys(short_hex(peer_pk), 0, 1)
        })?;
        let updated = Arc::new(updated);
        bundles.insert(*peer_pk, updated.clone());
        self.persist(&updated).await?;
        Ok(key)
    }

    /// Look up a pre-key record (including its `used` flag) by the sending
    /// peer and key id.
    pub async fn get_by_id(&self, peer_pk: &PeerId, id: u32) -> Result<PreKey> {
        let bundles = self.bundles.read().await;
        let bundle = bundles
            .get(peer_pk)
            .ok_or_else(|| Error::NoPreKeys(short_hex(peer_pk)))?;
        bundle
            .get(id)
            .cloned()
            .ok_or(Error::PreKeyNotFound {
                peer: short_hex(peer_pk),
                id,
            })
    }

    /// Mark a key used. Idempotent; persists on state change.
    pub async fn mark_used(&self, peer_pk: &PeerId, id: u32) -> Result<()> {
        let mut bundles = self.bundles.write().await;
        let bundle = bundles
            .get(peer_pk)
            .ok_or_else(|| Error::NoPreKeys(short_hex(peer_pk)))?;
        if bundle.get(id).map(|k| k.used) == Some(true) {
            return Ok(());
        }
        let mut updated = (**bundle).clone();
        if !updated.consume_by_id(id) {
            return Err(Error::PreKeyNotFound {
                peer: short_hex(peer_pk),
                id,
            });
        }
        let updated = Arc::new(updated);
        bundles.insert(*peer_pk, updated.clone());
        self.persist(&updated).await?;
        Ok(())
    }

    /// Unconsumed keys currently held for a peer
    pub async fn remaining(&self, peer_pk: &PeerId) -> Result<usize> {
        let bundles = self.bundles.read().await;
        bundles
            .get(peer_pk)
            .map(|b| b.remaining())
            .ok_or_else(|| Error::NoPreKeys(short_hex(peer_pk)))
    }

    /// True once the bundle has run down to the refresh threshold
    pub async fn needs_refresh(&self, peer_pk: &PeerId) -> Result<bool> {
        Ok(self.remaining(peer_pk).await? <= REFRESH_THRESHOLD)
    }

    /// Replace the peer's bundle with a fully built fresh one in a single
    /// critical section. Readers observe the old bundle or the new one,
    /// never anything in between.
    pub async fn refresh(&self, peer_pk: &PeerId) -> Result<Arc<PreKeyBundle>> {
        let mut bundles = self.bundles.write().await;
        let base_id = bundles
            .get(peer_pk)
            .map(|b| b.next_key_id())
            .unwrap_or(0);
        let bundle = Arc::new(PreKeyBundle::generate(*peer_pk, base_id));
        bundles.insert(*peer_pk, bundle.clone());
        self.persist(&bundle).await?;
        log::debug!("refreshed bundle for peer {}", short_hex(peer_pk));
        Ok(bundle)
    }

    /// Shared snapshot of a peer's bundle
    pub async fn bundle(&self, peer_pk: &PeerId) -> Option<Arc<PreKeyBundle>> {
        self.bundles.read().await.get(peer_pk).cloned()
    }

    /// Remove bundles older than the configured TTL. Returns how many were
    /// removed.
    pub async fn cleanup_expired(&self) -> usize {
        let cutoff = timestamp_nanos() - self.bundle_ttl.as_nanos() as i64;
        let mut bundles = self.bundles.write().await;
        let expired: Vec<PeerId> = bundles
            .iter()
            .filter(|(_, b)| b.created_at < cutoff)
            .map(|(pk, _)| *pk)
            .collect();
        for peer_pk in &expired {
            bundles.remove(peer_pk);
            if let Some(persistence) = &self.persistence {
                if let Err(e) = persistence.remove(peer_pk).await {
                    log::warn!(
                        "failed to remove expired bundle file for {}: {}",
                        short_hex(peer_pk),
                        e
                    );
                }
            }
        }
        if !expired.is_empty() {
            log::info!("removed {} expired pre-key bundle(s)", expired.len());
        }
        expired.len()
    }

    async fn persist(&self, bundle: &PreKeyBundle) -> Result<()> {
        if let Some(persistence) = &self.persistence {
            persistence.save(bundle).await?;
        }
        Ok(())
    }
}
