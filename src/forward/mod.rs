//! Forward-security manager
//!
//! Runs the pre-key exchange protocol and seals/opens the inner layer of
//! every message. Each outbound message consumes one of the recipient's
//! advertised one-time pre-keys; each inbound message consumes one of ours.
//! Consuming a key is irreversible, which is exactly what makes compromise
//! of a long-term key useless against recorded traffic.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use sha2::Sha256;
use tokio::sync::{Mutex, RwLock};

use crate::crypto::{self, IdentityVault};
use crate::error::{Error, Result};
use crate::prekey::PreKeyStore;
use crate::protocol::constants::{
    LOW_WATERMARK, MAX_MESSAGE_SIZE, MAX_STORAGE_TIME, MINIMUM_PRE_KEYS,
};
use crate::protocol::wire::{ForwardSecureMessage, PreKeyExchange, PreKeyPublic};
use crate::protocol::{short_hex, timestamp_nanos, MessageKind, PeerId};

const FORWARD_KEY_INFO: &[u8] = b"TOX_FORWARD_SECURE_V1";

/// Invoked (fire-and-forget) when a peer's advertised pre-keys run low and a
/// fresh exchange should be requested from that peer.
pub type RefreshCallback = Arc<dyn Fn(PeerId) + Send + Sync>;

/// Pre-key exchange state plus forward-secure seal/open
pub struct ForwardSecurityManager {
    identity: Arc<IdentityVault>,
    prekeys: Arc<PreKeyStore>,
    /// Pre-keys other peers advertised to us, consumed FIFO on send
    received: RwLock<HashMap<PeerId, VecDeque<PreKeyPublic>>>,
    refresh_callback: parking_lot::RwLock<Option<RefreshCallback>>,
    /// Peers with a refresh already in flight, so the callback fires once
    refresh_inflight: Mutex<HashSet<PeerId>>,
}

impl ForwardSecurityManager {
    pub fn new(identity: Arc<IdentityVault>, prekeys: Arc<PreKeyStore>) -> Self {
        Self {
            identity,
            prekeys,
            received: RwLock::new(HashMap::new()),
            refresh_callback: parking_lot::RwLock::new(None),
            refresh_inflight: Mutex::new(HashSet::new()),
        }
    }

    /// Install the low-watermark refresh callback
    pub fn set_refresh_callback(&self, callback: RefreshCallback) {
        *self.refresh_callback.write() = Some(callback);
    }

    /// Generate our pre-key bundle for `peer_pk`
    pub async fn generate_for(&self, peer_pk: PeerId) -> Result<()> {
        self.prekeys.generate(peer_pk).await?;
        Ok(())
    }

    /// Build the exchange message advertising our current bundle to
    /// `peer_pk`, refreshing it first when it has run low.
    pub async fn exchange(&self, peer_pk: PeerId) -> Result<PreKeyExchange> {
        let bundle = match self.prekeys.bundle(&peer_pk).await {
            None => self.prekeys.generate(peer_pk).await?,
            Some(bundle) => {
                if self.prekeys.needs_refresh(&peer_pk).await? {
                    self.prekeys.refresh(&peer_pk).await?
                } else {
                    bundle
                }
            }
        };
        Ok(PreKeyExchange {
            sender_pk: self.identity.public_key(),
            pre_keys: bundle.public_view(),
            timestamp: timestamp_nanos(),
        })
    }

    /// Accept a peer's exchange message, replacing whatever pre-keys we held
    /// for that peer in one atomic swap.
    pub async fn process_exchange(&self, msg: PreKeyExchange) -> Result<()> {
        if msg.pre_keys.is_empty() {
            return Err(Error::NoPreKeys(short_hex(&msg.sender_pk)));
        }
        let count = msg.pre_keys.len();
        self.received
            .write()
            .await
            .insert(msg.sender_pk, msg.pre_keys.into_iter().collect());
        self.refresh_inflight.lock().await.remove(&msg.sender_pk);
        log::debug!(
            "processed pre-key exchange from {}: {} key(s)",
            short_hex(&msg.sender_pk),
            count
        );
        Ok(())
    }

    /// Whether we hold enough of `peer_pk`'s pre-keys to send
    pub async fn can_send(&self, peer_pk: &PeerId) -> bool {
        self.received
            .read()
            .await
            .get(peer_pk)
            .map(|keys| keys.len() >= MINIMUM_PRE_KEYS)
            .unwrap_or(false)
    }

    /// Pre-keys we still hold for `peer_pk`
    pub async fn received_remaining(&self, peer_pk: &PeerId) -> usize {
        self.received
            .read()
            .await
            .get(peer_pk)
            .map(|keys| keys.len())
            .unwrap_or(0)
    }

    /// Seal `plaintext` for `recipient_pk`, consuming one of the recipient's
    /// advertised pre-keys.
    pub async fn send(
        &self,
        recipient_pk: PeerId,
        plaintext: &[u8],
        kind: MessageKind,
    ) -> Result<ForwardSecureMessage> {
        if plaintext.is_empty() {
            return Err(Error::EmptyMessage);
        }
        if plaintext.len() > MAX_MESSAGE_SIZE {
            return Err(Error::TooLarge {
                size: plaintext.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let (pre_key, remaining_after) = {
            let mut received = self.received.write().await;
            let keys = received
                .get_mut(&recipient_pk)
                .ok_or_else(|| Error::NoPreKeys(short_hex(&recipient_pk)))?;
            if keys.len() < MINIMUM_PRE_KEYS {
                return Err(Error::InsufficientPreKeys(
                    short_hex(&recipient_pk),
                    keys.len(),
                    MINIMUM_PRE_KEYS,
                ));
            }
            let pre_key = keys.pop_front().ok_or_else(|| {
                Error::NoPreKeys(short_hex(&recipient_pk))
            })?;
            (pre_key, keys.len())
        };

        let keypair = self.identity.current_keypair();
        let shared = crypto::shared_secret(keypair.secret(), &pre_key.public_key);
        let key = derive_forward_key(&shared);

        let nonce = crypto::random::random_nonce_24();
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        let encrypted_data = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| Error::Crypto("forward-secure seal failed".into()))?;

        let now = timestamp_nanos();
        let msg = ForwardSecureMessage {
            message_id: crypto::random::random_32(),
            sender_pk: keypair.public_key(),
            recipient_pk,
            pre_key_id: pre_key.id,
            encrypted_data,
            nonce,
            msg_type: kind.as_u8(),
            timestamp: now,
            expires_at: now + MAX_STORAGE_TIME.as_nanos() as i64,
        };

        if remaining_after <= LOW_WATERMARK {
            self.fire_refresh(recipient_pk).await;
        }

        Ok(msg)
    }

    /// Open an inbound forward-secure message, consuming our matching
    /// pre-key. A key that was already consumed rejects the message as a
    /// replay, deterministically.
    pub async fn receive(&self, msg: &ForwardSecureMessage) -> Result<Vec<u8>> {
        let record = self
            .prekeys
            .get_by_id(&msg.sender_pk, msg.pre_key_id)
            .await?;
        if record.used {
            return Err(Error::PreKeyReplay { id: msg.pre_key_id });
        }

        let shared = crypto::shared_secret(&record.secret(), &msg.sender_pk);
        let key = derive_forward_key(&shared);

        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        let plaintext = cipher
            .decrypt(XNonce::from_slice(&msg.nonce), msg.encrypted_data.as_slice())
            .map_err(|_| {
                Error::AuthenticationFailed("forward-secure open failed".into())
            })?;

        self.prekeys.mark_used(&msg.sender_pk, msg.pre_key_id).await?;
        Ok(plaintext)
    }

    /// Fire the refresh callback for `peer_pk` at most once per depletion.
    /// The spawned task owns everything it needs; it survives the caller.
    async fn fire_refresh(&self, peer_pk: PeerId) {
        let mut inflight = self.refresh_inflight.lock().await;
        if !inflight.insert(peer_pk) {
            return;
        }
        drop(inflight);

        let callback = self.refresh_callback.read().clone();
        match callback {
            Some(callback) => {
                log::info!(
                    "pre-keys for {} at low watermark, requesting refresh",
                    short_hex(&peer_pk)
                );
                tokio::spawn(async move {
                    callback(peer_pk);
                });
            }
            None => {
                log::warn!(
                    "pre-keys for {} at low watermark and no refresh callback installed",
                    short_hex(&peer_pk)
                );
            }
        }
    }
}

fn derive_forward_key(shared_secret: &[u8; 32]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = [0u8; 32];
    // 32 bytes is always a valid HKDF-SHA256 output length
    if hk.expand(FORWARD_KEY_INFO, &mut key).is_err() {
        unreachable!("HKDF expand to 32 bytes cannot fail");
    }
    key
}
