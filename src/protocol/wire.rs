//! Wire message structures and deterministic encoding
//!
//! Every message that crosses the transport is a serde struct encoded with
//! bincode: length-prefixed byte fields, big-endian-free fixed arrays, and
//! round-trip equality for every field. The size-bucket padding applied to
//! plaintext before forward-secure sealing also lives here.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::constants::{PADDING_BUCKETS, PADDING_PREFIX_SIZE};
use crate::protocol::{MessageId, MessageNonce, PeerId, Pseudonym};

/// Inner forward-secure message, sealed with a one-time pre-key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardSecureMessage {
    pub message_id: MessageId,
    pub sender_pk: PeerId,
    pub recipient_pk: PeerId,
    pub pre_key_id: u32,
    #[serde(with = "serde_bytes")]
    pub encrypted_data: Vec<u8>,
    pub nonce: MessageNonce,
    pub msg_type: u8,
    /// Unix nanoseconds
    pub timestamp: i64,
    /// Unix nanoseconds
    pub expires_at: i64,
}

/// Outer obfuscated message as held by storage nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObfuscatedMessage {
    pub message_id: MessageId,
    pub sender_pseudonym: Pseudonym,
    pub recipient_pseudonym: Pseudonym,
    pub epoch: u64,
    pub message_nonce: MessageNonce,
    #[serde(with = "serde_bytes")]
    pub encrypted_payload: Vec<u8>,
    pub payload_nonce: [u8; 12],
    pub payload_tag: [u8; 16],
    pub recipient_proof: [u8; 32],
    /// Unix nanoseconds
    pub timestamp: i64,
    /// Unix nanoseconds
    pub expires_at: i64,
}

/// One advertised one-time pre-key: id plus X25519 public key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyPublic {
    pub id: u32,
    pub public_key: [u8; 32],
}

/// Pre-key exchange message: the public view of a peer's current bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyExchange {
    pub sender_pk: PeerId,
    pub pre_keys: Vec<PreKeyPublic>,
    /// Unix nanoseconds
    pub timestamp: i64,
}

/// Request for messages stored under a pseudonym in the given epochs.
///
/// `request_id` is a client-chosen correlation id the node echoes back, so
/// concurrent queries to one node cannot have their responses confused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrieveRequest {
    pub recipient_pseudonym: Pseudonym,
    pub epochs: Vec<u64>,
    pub request_id: u64,
}

/// Storage node's answer to a [`RetrieveRequest`], echoing its `request_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RetrieveResponse {
    pub request_id: u64,
    pub messages: Vec<ObfuscatedMessage>,
}

/// Encode a wire message deterministically
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    bincode::serialize(msg).map_err(Error::Bincode)
}

/// Decode a wire message
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(Error::Bincode)
}

/// Pad a buffer to the next standard size bucket.
///
/// Layout: `u32 BE length || data || CSPRNG fill`. The padded length is the
/// smallest of {256, 1024, 4096, 16384} that fits the prefix plus the data;
/// anything larger fails with [`Error::TooLarge`]. The send path pads the
/// serialized forward-secure message this way before sealing, so every
/// payload a storage node sees is exactly one of the bucket lengths.
pub fn pad_message(data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Err(Error::EmptyMessage);
    }
    let needed = PADDING_PREFIX_SIZE + data.len();
    let bucket = PADDING_BUCKETS
        .iter()
        .copied()
        .find(|&b| b >= needed)
        .ok_or(Error::TooLarge {
            size: data.len(),
            max: PADDING_BUCKETS[PADDING_BUCKETS.len() - 1] - PADDING_PREFIX_SIZE,
        })?;

    let mut padded = vec![0u8; bucket];
    BigEndian::write_u32(&mut padded[..PADDING_PREFIX_SIZE], data.len() as u32);
    padded[PADDING_PREFIX_SIZE..needed].copy_from_slice(data);
    crate::crypto::random::fill_random(&mut padded[needed..]);
    Ok(padded)
}

/// Strip the length prefix and random fill from a padded buffer.
pub fn unpad_message(padded: &[u8]) -> Result<Vec<u8>> {
    if padded.len() < PADDING_PREFIX_SIZE {
        return Err(Error::Serialization("padded buffer too short".into()));
    }
    let len = BigEndian::read_u32(&padded[..PADDING_PREFIX_SIZE]) as usize;
    if len == 0 {
        return Err(Error::EmptyMessage);
    }
    if PADDING_PREFIX_SIZE + len > padded.len() {
        return Err(Error::Serialization(format!(
            "padding length {} out of bounds for buffer of {}",
            len,
            padded.len()
        )));
    }
    Ok(padded[PADDING_PREFIX_SIZE..PADDING_PREFIX_SIZE + len].to_vec())
}
