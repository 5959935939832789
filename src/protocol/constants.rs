// src/protocol/constants.rs
use std::time::Duration;

// Message limits
pub const MAX_MESSAGE_SIZE: usize = 1372;
pub const ENCRYPTION_OVERHEAD: usize = 16;
pub const MAX_PADDED_MESSAGE_SIZE: usize = 16384;

// Padding size buckets; every stored message is one of these lengths
pub const PADDING_BUCKETS: [usize; 4] = [256, 1024, 4096, 16384];
pub const PADDING_PREFIX_SIZE: usize = 4;

// Storage limits
pub const MAX_STORAGE_TIME: Duration = Duration::from_secs(24 * 3600);
pub const MAX_MESSAGES_PER_RECIPIENT: usize = 100;
pub const MIN_STORAGE_CAPACITY: usize = 1536;
pub const MAX_STORAGE_CAPACITY: usize = 1_536_000;
/// Fraction of free disk space the store may claim, in percent
pub const STORAGE_DISK_PERCENT: u64 = 1;
/// Estimated on-disk footprint of one stored message
pub const ESTIMATED_MESSAGE_SIZE: u64 = 650;

// Epoch rotation
pub const EPOCH_DURATION: Duration = Duration::from_secs(6 * 3600);
/// Unix seconds of 2025-01-01T00:00:00Z, the network genesis instant
pub const GENESIS_UNIX_SECS: u64 = 1_735_689_600;
/// A message epoch may lag the current epoch by at most this many epochs
pub const MAX_EPOCH_LAG: u64 = 3;

// Pre-key bundle thresholds
pub const PRE_KEYS_PER_PEER: usize = 100;
pub const REFRESH_THRESHOLD: usize = 20;
pub const LOW_WATERMARK: usize = 10;
pub const MINIMUM_PRE_KEYS: usize = 5;

// Packet type constants (numeric values are this crate's choice)
pub const PACKET_TYPE_ASYNC_STORE: u8 = 0xA1;
pub const PACKET_TYPE_ASYNC_RETRIEVE: u8 = 0xA2;
pub const PACKET_TYPE_ASYNC_RETRIEVE_RESPONSE: u8 = 0xA3;
pub const PACKET_TYPE_ASYNC_PRE_KEY_EXCHANGE: u8 = 0xA4;

// Fan-out widths
pub const STORE_REPLICATION: usize = 3;
pub const RETRIEVE_FANOUT: usize = 5;
