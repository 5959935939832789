//! Async messaging client
//!
//! Orchestrates the full send and retrieve paths: padding and queueing,
//! forward-secure sealing, obfuscation, fan-out to the XOR-closest storage
//! nodes, parallel retrieval with per-node and overall deadlines, response
//! correlation, trial decryption against known senders, and the offline
//! pending queue that drains when a peer comes online.

pub mod dedup;
pub mod kademlia;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use x25519_dalek::PublicKey as X25519Public;

use crate::crypto::{self, IdentityVault, NightdropKeypair};
use crate::epoch::EpochClock;
use crate::error::{Error, Result};
use crate::forward::ForwardSecurityManager;
use crate::obfuscation::{self, ObfuscationEngine};
use crate::prekey::PreKeyStore;
use crate::protocol::constants::{
    MAX_MESSAGE_SIZE, PACKET_TYPE_ASYNC_PRE_KEY_EXCHANGE, PACKET_TYPE_ASYNC_RETRIEVE,
    PACKET_TYPE_ASYNC_RETRIEVE_RESPONSE, PACKET_TYPE_ASYNC_STORE, RETRIEVE_FANOUT,
    STORE_REPLICATION,
};
use crate::protocol::wire::{
    self, ForwardSecureMessage, ObfuscatedMessage, PreKeyExchange, RetrieveRequest,
    RetrieveResponse,
};
use crate::protocol::{short_hex, MessageId, MessageKind, PeerId, Pseudonym};
use crate::transport::{Packet, Transport, TransportAddress};

/// Client-side timeouts and query strategy
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ClientConfig {
    /// Per-node retrieve timeout
    pub retrieve_timeout: Duration,
    /// Overall deadline for collecting one epoch's responses
    pub collection_timeout: Duration,
    /// Query storage nodes in parallel rather than sequentially
    pub parallelize_queries: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retrieve_timeout: Duration::from_secs(2),
            collection_timeout: Duration::from_secs(5),
            parallelize_queries: true,
        }
    }
}

/// Outcome of a successful `send`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Accepted by at least one storage node
    Stored,
    /// Queued locally until the peer comes online and pre-keys are exchanged
    Queued,
}

/// A fully decrypted inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub sender_pk: PeerId,
    pub kind: MessageKind,
    pub plaintext: Vec<u8>,
    /// Sender-stamped unix nanoseconds
    pub timestamp: i64,
}

/// Anything the retrieval scheduler can pull messages from
#[async_trait]
pub trait RetrieveSource: Send + Sync {
    async fn retrieve(&self) -> Result<Vec<ReceivedMessage>>;
}

#[derive(Debug, Clone)]
struct PendingMessage {
    plaintext: Vec<u8>,
    kind: MessageKind,
}

/// Single-slot channel for one in-flight retrieve, keyed by
/// `"<address>:<request id>"` in the response map
type ResponseSlot = oneshot::Sender<Vec<ObfuscatedMessage>>;

/// Asynchronous messaging client
pub struct AsyncClient {
    identity: Arc<IdentityVault>,
    forward: Arc<ForwardSecurityManager>,
    obfuscation: ObfuscationEngine,
    clock: EpochClock,
    /// Absent in queue-only mode; every networked method checks
    transport: Option<Arc<dyn Transport>>,
    config: ClientConfig,
    storage_nodes: RwLock<HashMap<PeerId, TransportAddress>>,
    peer_addresses: RwLock<HashMap<PeerId, TransportAddress>>,
    known_senders: RwLock<HashSet<PeerId>>,
    /// Peers we have already advertised our bundle to
    exchange_sent: RwLock<HashSet<PeerId>>,
    pending: Mutex<HashMap<PeerId, VecDeque<PendingMessage>>>,
    /// Response slots keyed by node address string plus a monotonic request
    /// id. The id travels in the request and is echoed in the response, so
    /// concurrent queries to one node can never have their replies confused.
    response_channels: DashMap<String, ResponseSlot>,
    request_counter: AtomicU64,
    last_retrieve: parking_lot::Mutex<Option<SystemTime>>,
}

impl AsyncClient {
    /// Build a client around a long-term keypair. Pass `None` for the
    /// transport to run in queue-only mode.
    pub fn new(
        keypair: NightdropKeypair,
        prekeys: Arc<PreKeyStore>,
        transport: Option<Arc<dyn Transport>>,
        config: ClientConfig,
    ) -> Arc<Self> {
        let identity = Arc::new(IdentityVault::new(keypair));
        let forward = Arc::new(ForwardSecurityManager::new(identity.clone(), prekeys));
        let clock = EpochClock::new();
        Arc::new(Self {
            identity,
            forward,
            obfuscation: ObfuscationEngine::new(clock.clone()),
            clock,
            transport,
            config,
            storage_nodes: RwLock::new(HashMap::new()),
            peer_addresses: RwLock::new(HashMap::new()),
            known_senders: RwLock::new(HashSet::new()),
            exchange_sent: RwLock::new(HashSet::new()),
            pending: Mutex::new(HashMap::new()),
            response_channels: DashMap::new(),
            request_counter: AtomicU64::new(0),
            last_retrieve: parking_lot::Mutex::new(None),
        })
    }

    pub fn public_key(&self) -> PeerId {
        self.identity.public_key()
    }

    pub fn identity(&self) -> &Arc<IdentityVault> {
        &self.identity
    }

    pub fn forward(&self) -> &Arc<ForwardSecurityManager> {
        &self.forward
    }

    pub fn last_retrieve(&self) -> Option<SystemTime> {
        *self.last_retrieve.lock()
    }

    fn transport(&self) -> Result<&Arc<dyn Transport>> {
        self.transport
            .as_ref()
            .ok_or_else(|| Error::TransportUnavailable("client has no transport".into()))
    }

    /// Wire this client's inbound handlers onto its transport
    pub fn register_handlers(self: &Arc<Self>) -> Result<()> {
        let transport = self.transport()?.clone();

        let client = self.clone();
        transport.register_handler(
            PACKET_TYPE_ASYNC_RETRIEVE_RESPONSE,
            Arc::new(move |packet, from| {
                client.on_retrieve_response(packet, from);
            }),
        );

        let client = self.clone();
        transport.register_handler(
            PACKET_TYPE_ASYNC_PRE_KEY_EXCHANGE,
            Arc::new(move |packet, from| {
                let client = client.clone();
                tokio::spawn(async move {
                    client.handle_pre_key_exchange(packet, from).await;
                });
            }),
        );
        Ok(())
    }

    /// Known storage node, keyed by its public key
    pub async fn add_storage_node(&self, node_pk: PeerId, address: TransportAddress) {
        self.storage_nodes.write().await.insert(node_pk, address);
    }

    /// Where to reach a friend directly (pre-key exchange traffic)
    pub async fn set_peer_address(&self, peer_pk: PeerId, address: TransportAddress) {
        self.peer_addresses.write().await.insert(peer_pk, address);
    }

    /// Add a peer whose messages we will try to decrypt. Trial decryption is
    /// linear in this set, so it should hold actual correspondents only.
    pub async fn add_known_sender(&self, peer_pk: PeerId) {
        self.known_senders.write().await.insert(peer_pk);
    }

    // ---- send path ----

    /// Send `plaintext` to `recipient_pk`. Messages to peers without a
    /// completed pre-key exchange are queued and flushed when the peer comes
    /// online; that still counts as success for the caller.
    pub async fn send(
        &self,
        recipient_pk: PeerId,
        plaintext: &[u8],
        kind: MessageKind,
    ) -> Result<SendStatus> {
        if plaintext.is_empty() {
            return Err(Error::EmptyMessage);
        }
        if plaintext.len() > MAX_MESSAGE_SIZE {
            return Err(Error::TooLarge {
                size: plaintext.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        if !self.forward.can_send(&recipient_pk).await {
            let mut pending = self.pending.lock().await;
            pending
                .entry(recipient_pk)
                .or_default()
                .push_back(PendingMessage {
                    plaintext: plaintext.to_vec(),
                    kind,
                });
            tracing::debug!(peer = %short_hex(&recipient_pk), "queued message for offline peer");
            return Ok(SendStatus::Queued);
        }

        let fs_msg = self.forward.send(recipient_pk, plaintext, kind).await?;
        let serialized = wire::encode(&fs_msg)?;
        // Pad the serialized message to a standard bucket so storage nodes
        // only ever see the bucket lengths, never the true message size
        let padded = wire::pad_message(&serialized)?;

        let keypair = self.identity.current_keypair();
        let shared = crypto::shared_secret(keypair.secret(), &recipient_pk);
        let obf = self
            .obfuscation
            .create(keypair.secret(), &recipient_pk, &padded, &shared)?;

        self.store_on_multiple_nodes(&obf).await?;
        Ok(SendStatus::Stored)
    }

    /// Offer the message to the `STORE_REPLICATION` nodes closest to its
    /// recipient pseudonym. One acceptance is success; node failures are
    /// logged and skipped.
    pub async fn store_on_multiple_nodes(&self, msg: &ObfuscatedMessage) -> Result<usize> {
        let transport = self.transport()?;
        let nodes = {
            let map = self.storage_nodes.read().await;
            kademlia::closest_nodes(&map, &msg.recipient_pseudonym, STORE_REPLICATION)
        };
        if nodes.is_empty() {
            return Err(Error::NoStorageNodes);
        }

        let data = wire::encode(msg)?;
        let mut accepted = 0;
        for (node_pk, address) in &nodes {
            let packet = Packet::new(PACKET_TYPE_ASYNC_STORE, data.clone());
            match transport.send(address, packet).await {
                Ok(()) => accepted += 1,
                Err(e) => {
                    log::warn!("storage node {} rejected store: {}", short_hex(node_pk), e)
                }
            }
        }
        if accepted == 0 {
            return Err(Error::Transport(
                "no storage node accepted the message".into(),
            ));
        }
        tracing::debug!(
            message = %short_hex(&msg.message_id),
            accepted,
            offered = nodes.len(),
            "stored message"
        );
        Ok(accepted)
    }

    // ---- retrieve path ----

    /// Query the recent epochs' pseudonyms across the closest storage nodes
    /// and decrypt whatever comes back. Partial results are normal; messages
    /// that fail decryption are dropped.
    pub async fn retrieve(self: &Arc<Self>) -> Result<Vec<ReceivedMessage>> {
        self.transport()?;
        let nodes_snapshot = self.storage_nodes.read().await.clone();
        if nodes_snapshot.is_empty() {
            return Err(Error::NoStorageNodes);
        }

        let my_pk = self.identity.public_key();
        let mut collected: Vec<ObfuscatedMessage> = Vec::new();
        for epoch in self.clock.recent_epochs() {
            let pseudo = obfuscation::recipient_pseudonym(&my_pk, epoch);
            let nodes = kademlia::closest_nodes(&nodes_snapshot, &pseudo, RETRIEVE_FANOUT);
            let epochs = vec![epoch];
            let messages = if self.config.parallelize_queries {
                self.collect_parallel(nodes, pseudo, epochs).await
            } else {
                self.collect_sequential(nodes, pseudo, epochs).await
            };
            collected.extend(messages);
        }

        let mut results = Vec::new();
        for obf in &collected {
            match self.decrypt_message(obf).await {
                Ok(msg) => results.push(msg),
                Err(e) => tracing::debug!(
                    message = %short_hex(&obf.message_id),
                    error = %e,
                    "dropping undecryptable message"
                ),
            }
        }

        *self.last_retrieve.lock() = Some(SystemTime::now());
        Ok(results)
    }

    /// One task per node, per-node timeout inside each, and an overall
    /// collection deadline that returns whatever has arrived so far.
    async fn collect_parallel(
        self: &Arc<Self>,
        nodes: Vec<(PeerId, TransportAddress)>,
        pseudo: Pseudonym,
        epochs: Vec<u64>,
    ) -> Vec<ObfuscatedMessage> {
        if nodes.is_empty() {
            return Vec::new();
        }
        let (tx, mut rx) = mpsc::channel(nodes.len());
        for (node_pk, address) in nodes {
            let client = self.clone();
            let tx = tx.clone();
            let epochs = epochs.clone();
            tokio::spawn(async move {
                let timeout = client.config.retrieve_timeout;
                let result = client
                    .retrieve_from_node(&address, &pseudo, &epochs, timeout)
                    .await;
                let _ = tx.send((node_pk, result)).await;
            });
        }
        drop(tx);

        let mut collected = Vec::new();
        let deadline = tokio::time::sleep(self.config.collection_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                item = rx.recv() => match item {
                    Some((_, Ok(messages))) => collected.extend(messages),
                    Some((node_pk, Err(e))) => {
                        log::debug!("node {} retrieve failed: {}", short_hex(&node_pk), e)
                    }
                    None => break,
                },
                _ = &mut deadline => {
                    tracing::debug!("collection deadline reached, returning partial results");
                    break;
                }
            }
        }
        collected
    }

    /// Sequential fallback: adapt the timeout downward after a failure and
    /// abandon the epoch after three consecutive failures.
    async fn collect_sequential(
        self: &Arc<Self>,
        nodes: Vec<(PeerId, TransportAddress)>,
        pseudo: Pseudonym,
        epochs: Vec<u64>,
    ) -> Vec<ObfuscatedMessage> {
        let mut collected = Vec::new();
        let mut timeout = self.config.retrieve_timeout;
        let mut consecutive_failures = 0u32;
        for (node_pk, address) in nodes {
            match self
                .retrieve_from_node(&address, &pseudo, &epochs, timeout)
                .await
            {
                Ok(messages) => {
                    collected.extend(messages);
                    consecutive_failures = 0;
                    timeout = self.config.retrieve_timeout;
                }
                Err(e) => {
                    log::debug!("node {} retrieve failed: {}", short_hex(&node_pk), e);
                    consecutive_failures += 1;
                    timeout /= 2;
                    if consecutive_failures >= 3 {
                        tracing::debug!("three consecutive node failures, abandoning epoch");
                        break;
                    }
                }
            }
        }
        collected
    }

    /// Ask one node for one pseudonym's messages. A transport send failure
    /// returns immediately; otherwise the registered response slot is awaited
    /// up to `timeout` and always unregistered afterwards.
    async fn retrieve_from_node(
        &self,
        address: &TransportAddress,
        pseudo: &Pseudonym,
        epochs: &[u64],
        timeout: Duration,
    ) -> Result<Vec<ObfuscatedMessage>> {
        let transport = self.transport()?;
        let request_id = self.request_counter.fetch_add(1, Ordering::Relaxed);
        let request = RetrieveRequest {
            recipient_pseudonym: *pseudo,
            epochs: epochs.to_vec(),
            request_id,
        };
        let data = wire::encode(&request)?;

        let key = format!("{}:{}", address, request_id);
        let (tx, rx) = oneshot::channel();
        self.response_channels.insert(key.clone(), tx);

        if let Err(e) = transport
            .send(address, Packet::new(PACKET_TYPE_ASYNC_RETRIEVE, data))
            .await
        {
            // Fast fail: no point waiting for a response to a packet that
            // never left
            self.response_channels.remove(&key);
            return Err(e);
        }

        let result = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(messages)) => Ok(messages),
            Ok(Err(_)) => Err(Error::Transport("response channel closed".into())),
            Err(_) => Err(Error::Timeout(timeout)),
        };
        self.response_channels.remove(&key);
        result
    }

    /// Inbound `ASYNC_RETRIEVE_RESPONSE` packets. The echoed request id
    /// routes each response to exactly the query that issued it; responses
    /// with no matching pending request are dropped silently as unsolicited.
    fn on_retrieve_response(&self, packet: Packet, from: TransportAddress) {
        let response: RetrieveResponse = match wire::decode(&packet.data) {
            Ok(response) => response,
            Err(e) => {
                log::warn!("undecodable retrieve response from {}: {}", from, e);
                return;
            }
        };

        let key = format!("{}:{}", from, response.request_id);
        let Some((_, slot)) = self.response_channels.remove(&key) else {
            tracing::debug!(
                from = %from,
                request_id = response.request_id,
                "dropping unsolicited retrieve response"
            );
            return;
        };
        // The receiver may have timed out already; that is its problem
        let _ = slot.send(response.messages);
    }

    /// Trial-decrypt an obfuscated message against every known sender, with
    /// the current secret key first and rotated-out keys after it. Cost is
    /// linear in the number of known senders.
    pub async fn decrypt_message(&self, obf: &ObfuscatedMessage) -> Result<ReceivedMessage> {
        let senders: Vec<PeerId> = {
            let set = self.known_senders.read().await;
            set.iter().copied().collect()
        };
        if senders.is_empty() {
            return Err(Error::NoKnownSenders);
        }

        for secret in self.identity.all_secrets() {
            let my_pk = X25519Public::from(&secret).to_bytes();
            for sender_pk in &senders {
                let shared = crypto::shared_secret(&secret, sender_pk);
                let padded = match self.obfuscation.open(obf, &secret, &shared) {
                    Ok(payload) => payload,
                    Err(_) => continue,
                };
                let serialized = match wire::unpad_message(&padded) {
                    Ok(serialized) => serialized,
                    Err(e) => {
                        log::warn!("outer layer opened but padding invalid: {}", e);
                        continue;
                    }
                };
                let fs_msg: ForwardSecureMessage = match wire::decode(&serialized) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::warn!("outer layer opened but payload undecodable: {}", e);
                        continue;
                    }
                };
                if fs_msg.recipient_pk != my_pk || &fs_msg.sender_pk != sender_pk {
                    continue;
                }
                let plaintext = self.forward.receive(&fs_msg).await?;
                return Ok(ReceivedMessage {
                    message_id: obf.message_id,
                    sender_pk: fs_msg.sender_pk,
                    kind: MessageKind::from_u8(fs_msg.msg_type)?,
                    plaintext,
                    timestamp: fs_msg.timestamp,
                });
            }
        }
        Err(Error::Undecryptable)
    }

    // ---- pre-key exchange and pending queue ----

    /// Advertise our pre-key bundle to a peer
    pub async fn send_pre_key_exchange(&self, peer_pk: PeerId) -> Result<()> {
        let transport = self.transport()?;
        let address = self
            .peer_addresses
            .read()
            .await
            .get(&peer_pk)
            .cloned()
            .ok_or_else(|| {
                Error::Transport(format!("no address for peer {}", short_hex(&peer_pk)))
            })?;
        let exchange = self.forward.exchange(peer_pk).await?;
        let packet = Packet::new(PACKET_TYPE_ASYNC_PRE_KEY_EXCHANGE, wire::encode(&exchange)?);
        transport.send(&address, packet).await?;
        self.exchange_sent.write().await.insert(peer_pk);
        Ok(())
    }

    async fn handle_pre_key_exchange(self: Arc<Self>, packet: Packet, from: TransportAddress) {
        let msg: PreKeyExchange = match wire::decode(&packet.data) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("undecodable pre-key exchange from {}: {}", from, e);
                return;
            }
        };
        let peer_pk = msg.sender_pk;
        if let Err(e) = self.forward.process_exchange(msg).await {
            log::warn!(
                "rejected pre-key exchange from {}: {}",
                short_hex(&peer_pk),
                e
            );
            return;
        }

        self.peer_addresses.write().await.insert(peer_pk, from);
        self.known_senders.write().await.insert(peer_pk);

        // Answer with our bundle so the exchange completes both ways
        if !self.exchange_sent.read().await.contains(&peer_pk) {
            if let Err(e) = self.send_pre_key_exchange(peer_pk).await {
                log::warn!(
                    "failed to answer pre-key exchange from {}: {}",
                    short_hex(&peer_pk),
                    e
                );
            }
        }

        self.flush_pending(peer_pk).await;
    }

    /// The surrounding chat system reports a peer online: complete the
    /// pre-key exchange if needed, then drain that peer's queue.
    pub async fn handle_peer_online(&self, peer_pk: PeerId) {
        if !self.forward.can_send(&peer_pk).await {
            if let Err(e) = self.send_pre_key_exchange(peer_pk).await {
                log::warn!(
                    "pre-key exchange with {} failed: {}",
                    short_hex(&peer_pk),
                    e
                );
            }
            // Queue drains when the peer's own exchange arrives
            return;
        }
        self.flush_pending(peer_pk).await;
    }

    /// Drain a peer's queued messages FIFO through the normal send path.
    /// Best effort: a queued message that fails to send is dropped with a
    /// warning, never returned to the original caller.
    pub async fn flush_pending(&self, peer_pk: PeerId) {
        let queued = {
            let mut pending = self.pending.lock().await;
            pending.remove(&peer_pk)
        };
        let Some(queued) = queued else { return };
        let total = queued.len();
        tracing::info!(peer = %short_hex(&peer_pk), total, "flushing pending messages");

        let mut iter = queued.into_iter();
        while let Some(msg) = iter.next() {
            match self.send(peer_pk, &msg.plaintext, msg.kind).await {
                Ok(SendStatus::Stored) => {}
                Ok(SendStatus::Queued) => {
                    // send() re-queued this message at the head of a fresh
                    // queue; keep the rest behind it in their original order
                    let rest: Vec<PendingMessage> = iter.collect();
                    let mut pending = self.pending.lock().await;
                    pending.entry(peer_pk).or_default().extend(rest);
                    break;
                }
                Err(e) => {
                    log::warn!(
                        "dropping queued message for {}: {}",
                        short_hex(&peer_pk),
                        e
                    );
                }
            }
        }
    }

    /// Messages queued for a peer (monitoring aid)
    pub async fn pending_count(&self, peer_pk: &PeerId) -> usize {
        self.pending
            .lock()
            .await
            .get(peer_pk)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    // ---- legacy surface ----

    /// Legacy recipient-keyed encryption without forward secrecy. Refused:
    /// the storage-layer test scaffolding is the only place the legacy
    /// format still exists.
    pub fn send_direct(&self, _recipient_pk: PeerId, _plaintext: &[u8]) -> Result<()> {
        Err(Error::Deprecated(
            "recipient-keyed direct send lacks forward secrecy; use send()",
        ))
    }
}

#[async_trait]
impl RetrieveSource for Arc<AsyncClient> {
    async fn retrieve(&self) -> Result<Vec<ReceivedMessage>> {
        AsyncClient::retrieve(self).await
    }
}

/// Periodic long-term key rotation.
///
/// Ticks once a day, rotating the identity keypair once it is older than the
/// configured age. The vault keeps rotated-out secrets so older traffic
/// still decrypts.
pub struct KeyRotationService {
    identity: Arc<IdentityVault>,
    check_interval: Duration,
    max_key_age: Duration,
}

impl KeyRotationService {
    pub fn new(identity: Arc<IdentityVault>) -> Self {
        Self {
            identity,
            check_interval: Duration::from_secs(24 * 3600),
            max_key_age: Duration::from_secs(7 * 24 * 3600),
        }
    }

    pub fn with_policy(mut self, check_interval: Duration, max_key_age: Duration) -> Self {
        self.check_interval = check_interval;
        self.max_key_age = max_key_age;
        self
    }

    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Some(new_pk) = self.identity.rotate_if_older_than(self.max_key_age) {
                    log::info!("rotated long-term key to {}", short_hex(&new_pk));
                }
            }
        })
    }
}
