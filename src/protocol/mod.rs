//! Protocol types for Nightdrop asynchronous messaging
//!
//! Core identifiers, message kinds, timestamps and the wire-level message
//! structures exchanged with storage nodes. Wire encodings are deterministic
//! and round-trip exact for every field.

pub mod constants;
pub mod wire;

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// A peer's long-term identity: its 32-byte X25519 public key
pub type PeerId = [u8; 32];

/// 32-byte identifier of an obfuscated message
pub type MessageId = [u8; 32];

/// 16-byte identifier used by the legacy recipient-keyed surface
pub type LegacyMessageId = [u8; 16];

/// 32-byte pseudonym standing in for a real public key on the storage network
pub type Pseudonym = [u8; 32];

/// 24-byte outer message nonce
pub type MessageNonce = [u8; 24];

/// Kind of a chat message carried end to end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    /// Regular chat text
    Normal = 0,
    /// Emote / action message
    Action = 1,
}

impl MessageKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(MessageKind::Normal),
            1 => Ok(MessageKind::Action),
            other => Err(Error::Serialization(format!(
                "unknown message kind {}",
                other
            ))),
        }
    }
}

/// Current wall-clock time as unix nanoseconds
pub fn timestamp_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Convert a `SystemTime` to unix nanoseconds, clamping pre-epoch times to 0
pub fn to_unix_nanos(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Convert unix nanoseconds back to a `SystemTime`
pub fn from_unix_nanos(nanos: i64) -> SystemTime {
    if nanos <= 0 {
        UNIX_EPOCH
    } else {
        UNIX_EPOCH + Duration::from_nanos(nanos as u64)
    }
}

/// Short hex form of a 32-byte identifier for log lines
pub fn short_hex(id: &[u8; 32]) -> String {
    hex::encode(&id[..4])
}
