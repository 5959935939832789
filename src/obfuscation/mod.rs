//! Identity-obfuscation engine
//!
//! The outer layer of every stored message. Storage nodes see only
//! pseudonyms: a deterministic recipient pseudonym both parties derive from
//! the recipient's key and the current epoch, and a sender pseudonym that is
//! fresh per message and therefore unlinkable across messages. An HMAC
//! recipient proof lets the real recipient (and nobody else) confirm the
//! sender knew its actual public key. All derivations are HKDF-SHA256 with
//! versioned, purpose-distinct labels.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use crate::crypto;
use crate::epoch::EpochClock;
use crate::error::{Error, Result};
use crate::protocol::constants::MAX_STORAGE_TIME;
use crate::protocol::wire::ObfuscatedMessage;
use crate::protocol::{timestamp_nanos, MessageId, MessageNonce, PeerId, Pseudonym};

const RECIPIENT_PSEUDO_INFO: &[u8] = b"TOX_RECIPIENT_PSEUDO_V1";
const SENDER_PSEUDO_INFO: &[u8] = b"TOX_SENDER_PSEUDO_V1";
const PAYLOAD_KEY_INFO: &[u8] = b"PAYLOAD_ENCRYPTION";

const GCM_TAG_SIZE: usize = 16;

type HmacSha256 = Hmac<Sha256>;

/// Deterministic recipient pseudonym for `(recipient_pk, epoch)`.
///
/// Both sender and recipient compute this without coordination; it rotates
/// every epoch so storage nodes cannot track a recipient across windows.
pub fn recipient_pseudonym(recipient_pk: &PeerId, epoch: u64) -> Pseudonym {
    hkdf_32(recipient_pk, &epoch.to_be_bytes(), RECIPIENT_PSEUDO_INFO)
}

/// Unlinkable sender pseudonym, unique per message because the nonce is
/// fresh random.
pub fn sender_pseudonym(
    sender_sk: &StaticSecret,
    recipient_pk: &PeerId,
    message_nonce: &MessageNonce,
) -> Pseudonym {
    let mut info = Vec::with_capacity(SENDER_PSEUDO_INFO.len() + 32 + 24);
    info.extend_from_slice(SENDER_PSEUDO_INFO);
    info.extend_from_slice(recipient_pk);
    info.extend_from_slice(message_nonce);
    hkdf_32(&sender_sk.to_bytes(), message_nonce, &info)
}

/// Per-message payload key bound to the epoch window
pub fn payload_key(shared_secret: &[u8; 32], message_nonce: &MessageNonce, epoch: u64) -> [u8; 32] {
    let mut info = Vec::with_capacity(PAYLOAD_KEY_INFO.len() + 8);
    info.extend_from_slice(PAYLOAD_KEY_INFO);
    info.extend_from_slice(&epoch.to_be_bytes());
    hkdf_32(shared_secret, message_nonce, &info)
}

/// Recipient-knowledge proof: HMAC keyed by the real recipient public key.
/// A storage node holding only the pseudonym cannot verify it; the
/// recipient can.
pub fn generate_proof(recipient_pk: &PeerId, message_id: &MessageId, epoch: u64) -> [u8; 32] {
    let mut mac = match <HmacSha256 as Mac>::new_from_slice(recipient_pk) {
        Ok(mac) => mac,
        // HMAC accepts any key length
        Err(_) => unreachable!("HMAC key of 32 bytes is always valid"),
    };
    mac.update(message_id);
    mac.update(&epoch.to_be_bytes());
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Constant-time proof verification
pub fn verify_proof(
    recipient_pk: &PeerId,
    message_id: &MessageId,
    epoch: u64,
    proof: &[u8; 32],
) -> bool {
    let expected = generate_proof(recipient_pk, message_id, epoch);
    constant_time_eq::constant_time_eq(&expected, proof)
}

fn hkdf_32(ikm: &[u8], salt: &[u8], info: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut out = [0u8; 32];
    if hk.expand(info, &mut out).is_err() {
        unreachable!("HKDF expand to 32 bytes cannot fail");
    }
    out
}

/// Seals and opens the obfuscated outer layer
pub struct ObfuscationEngine {
    clock: EpochClock,
}

impl ObfuscationEngine {
    pub fn new(clock: EpochClock) -> Self {
        Self { clock }
    }

    pub fn clock(&self) -> &EpochClock {
        &self.clock
    }

    /// Wrap a padded, serialized forward-secure message for storage under
    /// the current epoch's pseudonyms.
    pub fn create(
        &self,
        sender_sk: &StaticSecret,
        recipient_pk: &PeerId,
        payload: &[u8],
        shared_secret: &[u8; 32],
    ) -> Result<ObfuscatedMessage> {
        if payload.is_empty() {
            return Err(Error::EmptyMessage);
        }

        let epoch = self.clock.current_epoch();
        let message_id = crypto::random::random_32();
        let message_nonce = crypto::random::random_nonce_24();

        let key = payload_key(shared_secret, &message_nonce, epoch);
        let payload_nonce = crypto::random::random_nonce_12();
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));
        let mut sealed = cipher
            .encrypt(Nonce::from_slice(&payload_nonce), payload)
            .map_err(|_| Error::Crypto("payload seal failed".into()))?;

        // The tag travels in its own field; keep the ciphertext bare
        let tag_start = sealed.len() - GCM_TAG_SIZE;
        let mut payload_tag = [0u8; GCM_TAG_SIZE];
        payload_tag.copy_from_slice(&sealed[tag_start..]);
        sealed.truncate(tag_start);

        let now = timestamp_nanos();
        Ok(ObfuscatedMessage {
            message_id,
            sender_pseudonym: sender_pseudonym(sender_sk, recipient_pk, &message_nonce),
            recipient_pseudonym: recipient_pseudonym(recipient_pk, epoch),
            epoch,
            message_nonce,
            encrypted_payload: sealed,
            payload_nonce,
            payload_tag,
            recipient_proof: generate_proof(recipient_pk, &message_id, epoch),
            timestamp: now,
            expires_at: now + MAX_STORAGE_TIME.as_nanos() as i64,
        })
    }

    /// Unwrap an obfuscated message addressed to us, returning the padded
    /// forward-secure payload.
    pub fn open(
        &self,
        msg: &ObfuscatedMessage,
        recipient_sk: &StaticSecret,
        shared_secret: &[u8; 32],
    ) -> Result<Vec<u8>> {
        let recipient_pk = X25519Public::from(recipient_sk).to_bytes();

        let expected_pseudo = recipient_pseudonym(&recipient_pk, msg.epoch);
        if !constant_time_eq::constant_time_eq(&expected_pseudo, &msg.recipient_pseudonym) {
            return Err(Error::NotForUs);
        }

        if !verify_proof(&recipient_pk, &msg.message_id, msg.epoch, &msg.recipient_proof) {
            return Err(Error::InvalidProof);
        }

        if msg.encrypted_payload.is_empty() {
            return Err(Error::AuthenticationFailed("ciphertext too short".into()));
        }

        let key = payload_key(shared_secret, &msg.message_nonce, msg.epoch);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key));

        let mut sealed = Vec::with_capacity(msg.encrypted_payload.len() + GCM_TAG_SIZE);
        sealed.extend_from_slice(&msg.encrypted_payload);
        sealed.extend_from_slice(&msg.payload_tag);

        cipher
            .decrypt(Nonce::from_slice(&msg.payload_nonce), sealed.as_slice())
            .map_err(|_| Error::AuthenticationFailed("payload open failed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NightdropKeypair;

    fn engine() -> ObfuscationEngine {
        ObfuscationEngine::new(EpochClock::new())
    }

    #[test]
    fn test_recipient_pseudonym_deterministic_and_epoch_bound() {
        let pk = [7u8; 32];
        assert_eq!(recipient_pseudonym(&pk, 604), recipient_pseudonym(&pk, 604));
        assert_ne!(recipient_pseudonym(&pk, 604), recipient_pseudonym(&pk, 605));
        assert_ne!(recipient_pseudonym(&pk, 604), recipient_pseudonym(&[8u8; 32], 604));
    }

    #[test]
    fn test_sender_pseudonym_unlinkable_across_nonces() {
        let sender = NightdropKeypair::generate();
        let recipient_pk = [9u8; 32];
        let a = sender_pseudonym(sender.secret(), &recipient_pk, &[1u8; 24]);
        let b = sender_pseudonym(sender.secret(), &recipient_pk, &[2u8; 24]);
        assert_ne!(a, b);
        // Same inputs still agree
        let a2 = sender_pseudonym(sender.secret(), &recipient_pk, &[1u8; 24]);
        assert_eq!(a, a2);
    }

    #[test]
    fn test_proof_verifies_and_rejects_bit_flips() {
        let pk = [3u8; 32];
        let mid = [4u8; 32];
        let proof = generate_proof(&pk, &mid, 604);
        assert!(verify_proof(&pk, &mid, 604, &proof));

        let mut bad_proof = proof;
        bad_proof[0] ^= 0x01;
        assert!(!verify_proof(&pk, &mid, 604, &bad_proof));

        let mut bad_mid = mid;
        bad_mid[31] ^= 0x80;
        assert!(!verify_proof(&pk, &bad_mid, 604, &proof));
        assert!(!verify_proof(&[5u8; 32], &mid, 604, &proof));
        assert!(!verify_proof(&pk, &mid, 605, &proof));
    }

    #[test]
    fn test_create_open_round_trip() {
        let sender = NightdropKeypair::generate();
        let recipient = NightdropKeypair::generate();
        let shared = crypto::shared_secret(sender.secret(), &recipient.public_key());

        let engine = engine();
        let payload = b"serialized forward-secure message".to_vec();
        let msg = engine
            .create(sender.secret(), &recipient.public_key(), &payload, &shared)
            .unwrap();

        assert_eq!(msg.epoch, engine.clock().current_epoch());
        assert!(msg.expires_at > msg.timestamp);

        let shared_rx = crypto::shared_secret(recipient.secret(), &sender.public_key());
        let opened = engine.open(&msg, recipient.secret(), &shared_rx).unwrap();
        assert_eq!(opened, payload);
    }

    #[test]
    fn test_open_rejects_wrong_recipient() {
        let sender = NightdropKeypair::generate();
        let recipient = NightdropKeypair::generate();
        let carol = NightdropKeypair::generate();
        let shared = crypto::shared_secret(sender.secret(), &recipient.public_key());

        let engine = engine();
        let msg = engine
            .create(sender.secret(), &recipient.public_key(), b"payload", &shared)
            .unwrap();

        let carol_shared = crypto::shared_secret(carol.secret(), &sender.public_key());
        assert!(matches!(
            engine.open(&msg, carol.secret(), &carol_shared),
            Err(Error::NotForUs)
        ));
    }

    #[test]
    fn test_open_rejects_bad_proof() {
        let sender = NightdropKeypair::generate();
        let recipient = NightdropKeypair::generate();
        let shared = crypto::shared_secret(sender.secret(), &recipient.public_key());

        let engine = engine();
        let mut msg = engine
            .create(sender.secret(), &recipient.public_key(), b"payload", &shared)
            .unwrap();
        msg.recipient_proof[10] ^= 0xFF;

        let shared_rx = crypto::shared_secret(recipient.secret(), &sender.public_key());
        assert!(matches!(
            engine.open(&msg, recipient.secret(), &shared_rx),
            Err(Error::InvalidProof)
        ));
    }

    #[test]
    fn test_open_rejects_tampered_payload_and_tag() {
        let sender = NightdropKeypair::generate();
        let recipient = NightdropKeypair::generate();
        let shared = crypto::shared_secret(sender.secret(), &recipient.public_key());
        let shared_rx = crypto::shared_secret(recipient.secret(), &sender.public_key());

        let engine = engine();
        let msg = engine
            .create(sender.secret(), &recipient.public_key(), b"payload", &shared)
            .unwrap();

        let mut tampered = msg.clone();
        tampered.encrypted_payload[0] ^= 0x01;
        assert!(matches!(
            engine.open(&tampered, recipient.secret(), &shared_rx),
            Err(Error::AuthenticationFailed(_))
        ));

        let mut tampered = msg;
        tampered.payload_tag[0] ^= 0x01;
        assert!(matches!(
            engine.open(&tampered, recipient.secret(), &shared_rx),
            Err(Error::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_create_rejects_empty_payload() {
        let sender = NightdropKeypair::generate();
        let recipient = NightdropKeypair::generate();
        let shared = crypto::shared_secret(sender.secret(), &recipient.public_key());
        assert!(matches!(
            engine().create(sender.secret(), &recipient.public_key(), b"", &shared),
            Err(Error::EmptyMessage)
        ));
    }

    #[test]
    fn test_sender_pseudonyms_differ_across_messages() {
        let sender = NightdropKeypair::generate();
        let recipient = NightdropKeypair::generate();
        let shared = crypto::shared_secret(sender.secret(), &recipient.public_key());
        let engine = engine();

        let a = engine
            .create(sender.secret(), &recipient.public_key(), b"one", &shared)
            .unwrap();
        let b = engine
            .create(sender.secret(), &recipient.public_key(), b"two", &shared)
            .unwrap();
        assert_ne!(a.sender_pseudonym, b.sender_pseudonym);
        assert_eq!(a.recipient_pseudonym, b.recipient_pseudonym);
    }
}
