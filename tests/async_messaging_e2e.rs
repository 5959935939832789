//! End-to-end scenarios for the asynchronous messaging core
//!
//! These tests run the full stack in-process: two clients, three storage
//! nodes, pre-key exchange over the wire, obfuscated store and retrieve,
//! and the offline pending queue.

use std::sync::Arc;
use std::time::Duration;

use nightdrop::client::{AsyncClient, ClientConfig, SendStatus};
use nightdrop::crypto::NightdropKeypair;
use nightdrop::epoch::EpochClock;
use nightdrop::error::Error;
use nightdrop::obfuscation;
use nightdrop::prekey::PreKeyStore;
use nightdrop::protocol::MessageKind;
use nightdrop::storage::node::StorageNode;
use nightdrop::storage::MessageStore;
use nightdrop::transport::memory::{MemoryHub, MemoryTransport};
use nightdrop::transport::Transport;

const NODE_COUNT: usize = 3;

struct TestNetwork {
    hub: Arc<MemoryHub>,
    nodes: Vec<TestNode>,
}

struct TestNode {
    node: Arc<StorageNode>,
    node_pk: [u8; 32],
    address: nightdrop::transport::TransportAddress,
}

struct TestPeer {
    client: Arc<AsyncClient>,
    prekeys: Arc<PreKeyStore>,
    transport: Arc<MemoryTransport>,
}

impl TestNetwork {
    fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let hub = MemoryHub::new();
        let mut nodes = Vec::new();
        for i in 0..NODE_COUNT {
            let transport = hub.endpoint(&format!("storage-{}", i));
            let address = transport.local_address();
            let store = Arc::new(MessageStore::with_capacity(EpochClock::new(), 10_000));
            let node = StorageNode::new(store, transport);
            node.register();
            let mut node_pk = [0u8; 32];
            node_pk[0] = 0xD0 + i as u8;
            nodes.push(TestNode {
                node,
                node_pk,
                address,
            });
        }
        Self { hub, nodes }
    }

    async fn peer(&self, name: &str) -> TestPeer {
        let transport = self.hub.endpoint(name);
        let prekeys = Arc::new(PreKeyStore::new_in_memory());
        let client = AsyncClient::new(
            NightdropKeypair::generate(),
            prekeys.clone(),
            Some(transport.clone() as Arc<dyn Transport>),
            ClientConfig {
                retrieve_timeout: Duration::from_millis(500),
                collection_timeout: Duration::from_secs(1),
                parallelize_queries: true,
            },
        );
        client.register_handlers().unwrap();
        for node in &self.nodes {
            client
                .add_storage_node(node.node_pk, node.address.clone())
                .await;
        }
        TestPeer {
            client,
            prekeys,
            transport,
        }
    }

    /// The copy of a stored message, wherever it landed
    fn find_stored(&self, pseudo: &[u8; 32]) -> Option<nightdrop::protocol::wire::ObfuscatedMessage> {
        for node in &self.nodes {
            if let Ok(msgs) = node.node.store().retrieve_recent(pseudo) {
                if let Some(msg) = msgs.into_iter().next() {
                    return Some(msg);
                }
            }
        }
        None
    }
}

async fn exchange_over_wire(alice: &TestPeer, bob: &TestPeer) {
    let bob_pk = bob.client.public_key();
    alice
        .client
        .set_peer_address(bob_pk, bob.transport.local_address())
        .await;
    alice.client.send_pre_key_exchange(bob_pk).await.unwrap();
    // Bob's handler processes and answers; give the spawned tasks a moment
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_round_trip_hello_bob() {
    let network = TestNetwork::new();
    let alice = network.peer("alice").await;
    let bob = network.peer("bob").await;
    let alice_pk = alice.client.public_key();
    let bob_pk = bob.client.public_key();

    exchange_over_wire(&alice, &bob).await;
    assert!(alice.client.forward().can_send(&bob_pk).await);
    assert!(bob.client.forward().can_send(&alice_pk).await);

    let status = alice
        .client
        .send(bob_pk, b"Hello, Bob!", MessageKind::Normal)
        .await
        .unwrap();
    assert_eq!(status, SendStatus::Stored);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The serialized message is padded to the smallest standard bucket, so
    // the storage node sees a payload of exactly 256 bytes
    let epoch = EpochClock::new().current_epoch();
    let pseudo = obfuscation::recipient_pseudonym(&bob_pk, epoch);
    let stored = network.find_stored(&pseudo).expect("message on some node");
    assert_eq!(stored.encrypted_payload.len(), 256);
    assert_eq!(stored.epoch, epoch);

    let received = bob.client.retrieve().await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].plaintext, b"Hello, Bob!");
    assert_eq!(received[0].sender_pk, alice_pk);
    assert_eq!(received[0].kind, MessageKind::Normal);

    // The consumed pre-key is burned: Bob's very first key for Alice
    let record = bob.prekeys.get_by_id(&alice_pk, 0).await.unwrap();
    assert!(record.used);
}

#[tokio::test]
async fn test_replay_rejected_after_retrieve() {
    let network = TestNetwork::new();
    let alice = network.peer("alice").await;
    let bob = network.peer("bob").await;
    let bob_pk = bob.client.public_key();

    exchange_over_wire(&alice, &bob).await;
    alice
        .client
        .send(bob_pk, b"only once", MessageKind::Normal)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let received = bob.client.retrieve().await.unwrap();
    assert_eq!(received.len(), 1);

    // The message is still on the nodes; decrypting it again must fail as
    // a replay, deterministically
    let epoch = EpochClock::new().current_epoch();
    let pseudo = obfuscation::recipient_pseudonym(&bob_pk, epoch);
    let stored = network.find_stored(&pseudo).expect("copy still stored");
    assert!(matches!(
        bob.client.decrypt_message(&stored).await,
        Err(Error::PreKeyReplay { .. })
    ));

    // And a second retrieve delivers nothing
    let again = bob.client.retrieve().await.unwrap();
    assert!(again.is_empty());
}

#[tokio::test]
async fn test_wrong_recipient_cannot_decrypt() {
    let network = TestNetwork::new();
    let alice = network.peer("alice").await;
    let bob = network.peer("bob").await;
    let carol = network.peer("carol").await;
    let alice_pk = alice.client.public_key();
    let bob_pk = bob.client.public_key();

    exchange_over_wire(&alice, &bob).await;
    alice
        .client
        .send(bob_pk, b"for bob only", MessageKind::Normal)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let epoch = EpochClock::new().current_epoch();
    let pseudo = obfuscation::recipient_pseudonym(&bob_pk, epoch);
    let stored = network.find_stored(&pseudo).expect("message stored");

    // Carol knows Alice but the pseudonym math is not hers
    carol.client.add_known_sender(alice_pk).await;
    assert!(matches!(
        carol.client.decrypt_message(&stored).await,
        Err(Error::Undecryptable)
    ));

    // Carol's own retrieve sees nothing either
    let received = carol.client.retrieve().await.unwrap();
    assert!(received.is_empty());
}

#[tokio::test]
async fn test_queue_and_flush_in_fifo_order() {
    let network = TestNetwork::new();
    let alice = network.peer("alice").await;
    let bob = network.peer("bob").await;
    let bob_pk = bob.client.public_key();

    // No exchange yet: both sends succeed by queueing
    assert_eq!(
        alice
            .client
            .send(bob_pk, b"m1", MessageKind::Normal)
            .await
            .unwrap(),
        SendStatus::Queued
    );
    assert_eq!(
        alice
            .client
            .send(bob_pk, b"m2", MessageKind::Normal)
            .await
            .unwrap(),
        SendStatus::Queued
    );
    assert_eq!(alice.client.pending_count(&bob_pk).await, 2);

    // Bob comes online: the exchange completes and the queue drains
    alice
        .client
        .set_peer_address(bob_pk, bob.transport.local_address())
        .await;
    alice.client.handle_peer_online(bob_pk).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(alice.client.pending_count(&bob_pk).await, 0);

    let received = bob.client.retrieve().await.unwrap();
    let texts: Vec<&[u8]> = received.iter().map(|m| m.plaintext.as_slice()).collect();
    assert_eq!(texts, vec![b"m1".as_slice(), b"m2".as_slice()]);
}

#[tokio::test]
async fn test_large_message_round_trip() {
    let network = TestNetwork::new();
    let alice = network.peer("alice").await;
    let bob = network.peer("bob").await;
    let bob_pk = bob.client.public_key();

    exchange_over_wire(&alice, &bob).await;

    // Every length up to the 1372-byte limit is sendable, including the
    // range whose padded form lands in the 4096 bucket
    let large = vec![0x42u8; 1100];
    let status = alice
        .client
        .send(bob_pk, &large, MessageKind::Normal)
        .await
        .unwrap();
    assert_eq!(status, SendStatus::Stored);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let epoch = EpochClock::new().current_epoch();
    let pseudo = obfuscation::recipient_pseudonym(&bob_pk, epoch);
    let stored = network.find_stored(&pseudo).expect("message on some node");
    assert_eq!(stored.encrypted_payload.len(), 4096);

    let received = bob.client.retrieve().await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].plaintext, large);

    // And the maximum-size plaintext goes through too
    let max = vec![0x17u8; 1372];
    let status = alice
        .client
        .send(bob_pk, &max, MessageKind::Normal)
        .await
        .unwrap();
    assert_eq!(status, SendStatus::Stored);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let received = bob.client.retrieve().await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].plaintext, max);
}

#[tokio::test]
async fn test_partial_results_with_dead_node() {
    let network = TestNetwork::new();
    let alice = network.peer("alice").await;
    let bob = network.peer("bob").await;
    let bob_pk = bob.client.public_key();

    exchange_over_wire(&alice, &bob).await;
    alice
        .client
        .send(bob_pk, b"survives outages", MessageKind::Normal)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // One storage node goes dark; retrieval still completes with what the
    // remaining nodes return
    network.hub.disconnect("storage-0");
    let received = bob.client.retrieve().await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].plaintext, b"survives outages");
}

#[tokio::test]
async fn test_action_message_kind_survives_transit() {
    let network = TestNetwork::new();
    let alice = network.peer("alice").await;
    let bob = network.peer("bob").await;
    let bob_pk = bob.client.public_key();

    exchange_over_wire(&alice, &bob).await;
    alice
        .client
        .send(bob_pk, b"waves", MessageKind::Action)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let received = bob.client.retrieve().await.unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].kind, MessageKind::Action);
}
