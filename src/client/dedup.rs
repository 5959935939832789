//! Message-id deduplication with a sliding window
//!
//! Three storage nodes holding the same message will all return it, so
//! duplicates at the decryption output are normal. Consumers feed decrypted
//! message ids through this window to drop the copies. Old entries age out
//! by time and by a hard entry cap.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::protocol::MessageId;

const DEFAULT_WINDOW: Duration = Duration::from_secs(24 * 3600);
const MAX_ENTRIES: usize = 100_000;

/// Sliding-window duplicate filter keyed by message id
pub struct MessageDeduplicator {
    inner: Mutex<DedupInner>,
    window: Duration,
    max_entries: usize,
}

struct DedupInner {
    seen: HashMap<MessageId, Instant>,
    order: VecDeque<(MessageId, Instant)>,
}

impl Default for MessageDeduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl MessageDeduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            inner: Mutex::new(DedupInner {
                seen: HashMap::new(),
                order: VecDeque::new(),
            }),
            window,
            max_entries: MAX_ENTRIES,
        }
    }

    /// Returns `true` the first time an id is seen inside the window,
    /// `false` for duplicates.
    pub fn check_and_insert(&self, id: &MessageId) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        // Age out entries that left the window
        while let Some(&(old_id, stamp)) = inner.order.front() {
            if now.duration_since(stamp) > self.window {
                inner.order.pop_front();
                inner.seen.remove(&old_id);
            } else {
                break;
            }
        }

        if inner.seen.contains_key(id) {
            return false;
        }

        inner.seen.insert(*id, now);
        inner.order.push_back((*id, now));
        if inner.order.len() > self.max_entries {
            if let Some((old_id, _)) = inner.order.pop_front() {
                inner.seen.remove(&old_id);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sighting_passes_duplicate_blocked() {
        let dedup = MessageDeduplicator::default();
        let id = [1u8; 32];
        assert!(dedup.check_and_insert(&id));
        assert!(!dedup.check_and_insert(&id));
        assert!(dedup.check_and_insert(&[2u8; 32]));
    }

    #[test]
    fn test_window_expiry_forgets_ids() {
        let dedup = MessageDeduplicator::new(Duration::from_millis(10));
        let id = [3u8; 32];
        assert!(dedup.check_and_insert(&id));
        std::thread::sleep(Duration::from_millis(20));
        assert!(dedup.check_and_insert(&id), "expired id is fresh again");
    }

    #[test]
    fn test_entry_cap_evicts_oldest() {
        let mut dedup = MessageDeduplicator::new(Duration::from_secs(3600));
        dedup.max_entries = 3;
        for seed in 0..4u8 {
            assert!(dedup.check_and_insert(&[seed; 32]));
        }
        assert_eq!(dedup.len(), 3);
        // The oldest entry was evicted and passes again
        assert!(dedup.check_and_insert(&[0u8; 32]));
    }
}
