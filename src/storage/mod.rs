//! Message store for storage nodes
//!
//! Capacity-bounded, time-bounded storage of obfuscated messages, indexed
//! both by message id and by pseudonym×epoch. A legacy recipient-keyed index
//! is retained for backward compatibility and shares the same capacity
//! budget; all new traffic takes the obfuscated path. One reader-writer lock
//! guards both indexes; retrieval copies messages out under the read lock.

pub mod node;

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use crate::epoch::EpochClock;
use crate::error::{Error, Result};
use crate::protocol::constants::{
    ENCRYPTION_OVERHEAD, ESTIMATED_MESSAGE_SIZE, MAX_EPOCH_LAG, MAX_MESSAGES_PER_RECIPIENT,
    MAX_PADDED_MESSAGE_SIZE, MAX_STORAGE_CAPACITY, MIN_STORAGE_CAPACITY, STORAGE_DISK_PERCENT,
};
use crate::protocol::wire::{ForwardSecureMessage, ObfuscatedMessage};
use crate::protocol::{timestamp_nanos, MessageId, PeerId, Pseudonym};

/// Counters exposed for monitoring; obfuscated and legacy messages share the
/// capacity budget, so the totals here sum both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub obfuscated_count: usize,
    pub legacy_count: usize,
    pub pseudonym_count: usize,
    pub capacity: usize,
}

struct StoreInner {
    by_id: HashMap<MessageId, ObfuscatedMessage>,
    /// pseudonym → epoch → message ids in insertion order
    by_pseudonym: HashMap<Pseudonym, BTreeMap<u64, Vec<MessageId>>>,
    legacy: HashMap<PeerId, Vec<ForwardSecureMessage>>,
    capacity: usize,
}

impl StoreInner {
    fn total(&self) -> usize {
        self.by_id.len() + self.legacy.values().map(Vec::len).sum::<usize>()
    }

    fn pseudonym_total(&self, pseudo: &Pseudonym) -> usize {
        self.by_pseudonym
            .get(pseudo)
            .map(|epochs| epochs.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    fn remove_from_pseudonym_index(&mut self, pseudo: &Pseudonym, epoch: u64, id: &MessageId) {
        if let Some(epochs) = self.by_pseudonym.get_mut(pseudo) {
            if let Some(ids) = epochs.get_mut(&epoch) {
                ids.retain(|stored| stored != id);
                if ids.is_empty() {
                    epochs.remove(&epoch);
                }
            }
            if epochs.is_empty() {
                self.by_pseudonym.remove(pseudo);
            }
        }
    }
}

/// Dual-index message store with deterministic epoch rotation
pub struct MessageStore {
    clock: EpochClock,
    inner: RwLock<StoreInner>,
}

/// Capacity from available disk space: one percent of it, divided by the
/// estimated per-message footprint, clamped to the protocol bounds.
pub fn capacity_for_disk(available_bytes: u64) -> usize {
    let budget = available_bytes * STORAGE_DISK_PERCENT / 100;
    let capacity = (budget / ESTIMATED_MESSAGE_SIZE) as usize;
    capacity.clamp(MIN_STORAGE_CAPACITY, MAX_STORAGE_CAPACITY)
}

impl MessageStore {
    /// Store sized from the disk space available to this node
    pub fn new(clock: EpochClock, available_disk_bytes: u64) -> Self {
        Self::with_capacity(clock, capacity_for_disk(available_disk_bytes))
    }

    /// Store with an explicit capacity
    pub fn with_capacity(clock: EpochClock, capacity: usize) -> Self {
        Self {
            clock,
            inner: RwLock::new(StoreInner {
                by_id: HashMap::new(),
                by_pseudonym: HashMap::new(),
                legacy: HashMap::new(),
                capacity,
            }),
        }
    }

    /// Recompute capacity after a disk-space rebalance. Existing messages
    /// above a shrunken capacity stay until they expire; only new admissions
    /// are bounded by the new value.
    pub fn update_capacity(&self, available_disk_bytes: u64) {
        let capacity = capacity_for_disk(available_disk_bytes);
        let mut inner = self.inner.write();
        if inner.capacity != capacity {
            log::info!("storage capacity {} -> {}", inner.capacity, capacity);
            inner.capacity = capacity;
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.read().capacity
    }

    /// Admit an obfuscated message into both indexes.
    pub fn store(&self, msg: ObfuscatedMessage) -> Result<()> {
        let now = timestamp_nanos();
        let current = self.clock.current_epoch();
        if !self.clock.is_valid(msg.epoch) {
            return Err(Error::InvalidEpoch {
                epoch: msg.epoch,
                current,
            });
        }
        if now >= msg.expires_at {
            return Err(Error::MessageExpired);
        }
        if msg.encrypted_payload.is_empty() {
            return Err(Error::EmptyMessage);
        }
        // Payloads are padded to a standard bucket before sealing, so the
        // admission ceiling is the largest bucket plus the cipher overhead
        if msg.encrypted_payload.len() > MAX_PADDED_MESSAGE_SIZE + ENCRYPTION_OVERHEAD {
            return Err(Error::TooLarge {
                size: msg.encrypted_payload.len(),
                max: MAX_PADDED_MESSAGE_SIZE + ENCRYPTION_OVERHEAD,
            });
        }

        let mut inner = self.inner.write();
        if inner.total() >= inner.capacity {
            return Err(Error::StorageFull {
                count: inner.total(),
                capacity: inner.capacity,
            });
        }
        let per_pseudonym = inner.pseudonym_total(&msg.recipient_pseudonym);
        if per_pseudonym >= MAX_MESSAGES_PER_RECIPIENT {
            return Err(Error::TooManyForPseudonym(per_pseudonym));
        }

        inner
            .by_pseudonym
            .entry(msg.recipient_pseudonym)
            .or_default()
            .entry(msg.epoch)
            .or_default()
            .push(msg.message_id);
        inner.by_id.insert(msg.message_id, msg);
        Ok(())
    }

    /// Copy out every unexpired message held for `pseudo` in the given
    /// epochs, preserving insertion order within each epoch.
    pub fn retrieve_by_pseudonym(
        &self,
        pseudo: &Pseudonym,
        epochs: &[u64],
    ) -> Result<Vec<ObfuscatedMessage>> {
        let now = timestamp_nanos();
        let inner = self.inner.read();
        let mut results = Vec::new();
        if let Some(by_epoch) = inner.by_pseudonym.get(pseudo) {
            for epoch in epochs {
                if let Some(ids) = by_epoch.get(epoch) {
                    for id in ids {
                        if let Some(msg) = inner.by_id.get(id) {
                            if msg.expires_at > now {
                                results.push(msg.clone());
                            }
                        }
                    }
                }
            }
        }
        if results.is_empty() {
            return Err(Error::MessageNotFound);
        }
        Ok(results)
    }

    /// Retrieve across the acceptance window's recent epochs
    pub fn retrieve_recent(&self, pseudo: &Pseudonym) -> Result<Vec<ObfuscatedMessage>> {
        self.retrieve_by_pseudonym(pseudo, &self.clock.recent_epochs())
    }

    /// Remove one message. The caller must present the pseudonym the message
    /// is stored under; anything else reads as not-found.
    pub fn delete(&self, message_id: &MessageId, pseudo: &Pseudonym) -> Result<()> {
        let mut inner = self.inner.write();
        let (epoch, stored_pseudo) = match inner.by_id.get(message_id) {
            Some(msg) => (msg.epoch, msg.recipient_pseudonym),
            None => return Err(Error::MessageNotFound),
        };
        if &stored_pseudo != pseudo {
            return Err(Error::MessageNotFound);
        }
        inner.by_id.remove(message_id);
        inner.remove_from_pseudonym_index(&stored_pseudo, epoch, message_id);
        Ok(())
    }

    /// Drop every message past its expiry. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = timestamp_nanos();
        let mut inner = self.inner.write();

        let expired: Vec<(MessageId, Pseudonym, u64)> = inner
            .by_id
            .values()
            .filter(|msg| now > msg.expires_at)
            .map(|msg| (msg.message_id, msg.recipient_pseudonym, msg.epoch))
            .collect();
        for (id, pseudo, epoch) in &expired {
            inner.by_id.remove(id);
            inner.remove_from_pseudonym_index(pseudo, *epoch, id);
        }

        let mut legacy_removed = 0;
        inner.legacy.retain(|_, msgs| {
            let before = msgs.len();
            msgs.retain(|m| now <= m.expires_at);
            legacy_removed += before - msgs.len();
            !msgs.is_empty()
        });

        let removed = expired.len() + legacy_removed;
        if removed > 0 {
            log::debug!("expired {} stored message(s)", removed);
        }
        removed
    }

    /// Drop every message whose epoch has fallen out of the acceptance
    /// window, independent of its explicit expiry.
    pub fn cleanup_old_epochs(&self) -> usize {
        let current = self.clock.current_epoch();
        let oldest_valid = current.saturating_sub(MAX_EPOCH_LAG);
        let mut inner = self.inner.write();

        let stale: Vec<(MessageId, Pseudonym, u64)> = inner
            .by_id
            .values()
            .filter(|msg| msg.epoch < oldest_valid)
            .map(|msg| (msg.message_id, msg.recipient_pseudonym, msg.epoch))
            .collect();
        for (id, pseudo, epoch) in &stale {
            inner.by_id.remove(id);
            inner.remove_from_pseudonym_index(pseudo, *epoch, id);
        }
        if !stale.is_empty() {
            log::debug!("dropped {} message(s) from stale epochs", stale.len());
        }
        stale.len()
    }

    /// Legacy recipient-keyed storage. Only the storage-layer test
    /// scaffolding writes here; the public sending surface is the obfuscated
    /// path.
    pub fn store_legacy(&self, msg: ForwardSecureMessage) -> Result<()> {
        let now = timestamp_nanos();
        if now >= msg.expires_at {
            return Err(Error::MessageExpired);
        }
        let mut inner = self.inner.write();
        if inner.total() >= inner.capacity {
            return Err(Error::StorageFull {
                count: inner.total(),
                capacity: inner.capacity,
            });
        }
        let slot = inner.legacy.entry(msg.recipient_pk).or_default();
        if slot.len() >= MAX_MESSAGES_PER_RECIPIENT {
            return Err(Error::TooManyForPseudonym(slot.len()));
        }
        slot.push(msg);
        Ok(())
    }

    /// Copy out a recipient's legacy messages
    pub fn retrieve_legacy(&self, recipient_pk: &PeerId) -> Result<Vec<ForwardSecureMessage>> {
        let now = timestamp_nanos();
        let inner = self.inner.read();
        let msgs: Vec<ForwardSecureMessage> = inner
            .legacy
            .get(recipient_pk)
            .map(|msgs| {
                msgs.iter()
                    .filter(|m| m.expires_at > now)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if msgs.is_empty() {
            return Err(Error::MessageNotFound);
        }
        Ok(msgs)
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read();
        StoreStats {
            obfuscated_count: inner.by_id.len(),
            legacy_count: inner.legacy.values().map(Vec::len).sum(),
            pseudonym_count: inner.by_pseudonym.len(),
            capacity: inner.capacity,
        }
    }

    /// Insert without admission checks, bypassing epoch and expiry
    /// validation. Test scaffolding only.
    #[cfg(test)]
    fn insert_unchecked(&self, msg: ObfuscatedMessage) {
        let mut inner = self.inner.write();
        inner
            .by_pseudonym
            .entry(msg.recipient_pseudonym)
            .or_default()
            .entry(msg.epoch)
            .or_default()
            .push(msg.message_id);
        inner.by_id.insert(msg.message_id, msg);
    }
}
