//! Scheduler behavior over the real client stack
//!
//! Drives the retrieval scheduler against an in-process network to check
//! that cover traffic is indistinguishable from real retrieval on the wire
//! while never reaching the consumer, and that real ticks deliver.

use std::sync::Arc;
use std::time::Duration;

use nightdrop::client::{AsyncClient, ClientConfig};
use nightdrop::crypto::NightdropKeypair;
use nightdrop::epoch::EpochClock;
use nightdrop::prekey::PreKeyStore;
use nightdrop::protocol::MessageKind;
use nightdrop::scheduler::{RetrievalScheduler, SchedulerConfig, SchedulerState};
use nightdrop::storage::node::StorageNode;
use nightdrop::storage::MessageStore;
use nightdrop::transport::memory::MemoryHub;
use nightdrop::transport::Transport;
use tokio::sync::mpsc;

struct Stack {
    alice: Arc<AsyncClient>,
    bob: Arc<AsyncClient>,
}

async fn stack_with_one_node() -> Stack {
    let _ = env_logger::builder().is_test(true).try_init();
    let hub = MemoryHub::new();
    let node_transport = hub.endpoint("node");
    let store = Arc::new(MessageStore::with_capacity(EpochClock::new(), 10_000));
    StorageNode::new(store, node_transport.clone()).register();
    let node_address = node_transport.local_address();

    let config = ClientConfig {
        retrieve_timeout: Duration::from_millis(500),
        collection_timeout: Duration::from_secs(1),
        parallelize_queries: true,
    };

    let alice_transport = hub.endpoint("alice");
    let alice = AsyncClient::new(
        NightdropKeypair::generate(),
        Arc::new(PreKeyStore::new_in_memory()),
        Some(alice_transport.clone() as Arc<dyn Transport>),
        config.clone(),
    );
    alice.register_handlers().unwrap();
    alice.add_storage_node([1u8; 32], node_address.clone()).await;

    let bob_transport = hub.endpoint("bob");
    let bob = AsyncClient::new(
        NightdropKeypair::generate(),
        Arc::new(PreKeyStore::new_in_memory()),
        Some(bob_transport.clone() as Arc<dyn Transport>),
        config,
    );
    bob.register_handlers().unwrap();
    bob.add_storage_node([1u8; 32], node_address).await;

    // Pre-key exchange over the wire
    let bob_pk = bob.public_key();
    alice
        .set_peer_address(bob_pk, bob_transport.local_address())
        .await;
    alice.send_pre_key_exchange(bob_pk).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    Stack { alice, bob }
}

#[tokio::test]
async fn test_cover_traffic_never_reaches_consumer() {
    let stack = stack_with_one_node().await;
    let bob_pk = stack.bob.public_key();

    stack
        .alice
        .send(bob_pk, b"invisible", MessageKind::Normal)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let scheduler = RetrievalScheduler::new(
        stack.bob.clone(),
        SchedulerConfig {
            cover_traffic_enabled: true,
            cover_traffic_ratio: 1.0,
            ..SchedulerConfig::default()
        },
        tx,
    );

    let empty_before = scheduler.consecutive_empty();
    scheduler.tick_once().await;

    assert!(rx.try_recv().is_err(), "cover traffic delivered a message");
    assert_eq!(scheduler.consecutive_empty(), empty_before);
    // The retrieval itself did happen: the client recorded it
    assert!(stack.bob.last_retrieve().is_some());
}

#[tokio::test]
async fn test_real_tick_delivers_to_consumer() {
    let stack = stack_with_one_node().await;
    let bob_pk = stack.bob.public_key();

    stack
        .alice
        .send(bob_pk, b"visible", MessageKind::Normal)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let scheduler = RetrievalScheduler::new(
        stack.bob.clone(),
        SchedulerConfig {
            cover_traffic_enabled: false,
            base_interval: Duration::from_millis(50),
            ..SchedulerConfig::default()
        },
        tx,
    );

    scheduler.tick_once().await;

    let delivered = rx.try_recv().expect("message delivered");
    assert_eq!(delivered.plaintext, b"visible");
    assert_eq!(delivered.sender_pk, stack.alice.public_key());
    assert_eq!(scheduler.consecutive_empty(), 0);
}

#[tokio::test]
async fn test_scheduler_loop_picks_up_message() {
    let stack = stack_with_one_node().await;
    let bob_pk = stack.bob.public_key();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let scheduler = RetrievalScheduler::new(
        stack.bob.clone(),
        SchedulerConfig {
            base_interval: Duration::from_millis(40),
            jitter_percent: 25,
            cover_traffic_enabled: false,
            ..SchedulerConfig::default()
        },
        tx,
    );
    let handle = scheduler.start().expect("scheduler started");
    assert_eq!(scheduler.state(), SchedulerState::Running);

    stack
        .alice
        .send(bob_pk, b"from the loop", MessageKind::Normal)
        .await
        .unwrap();

    let delivered = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("loop delivered within deadline")
        .expect("channel open");
    assert_eq!(delivered.plaintext, b"from the loop");

    scheduler.stop();
    handle.await.unwrap();
    assert_eq!(scheduler.state(), SchedulerState::Idle);
}

#[tokio::test]
async fn test_backoff_counter_grows_while_idle() {
    let stack = stack_with_one_node().await;

    let (tx, _rx) = mpsc::unbounded_channel();
    let scheduler = RetrievalScheduler::new(
        stack.bob.clone(),
        SchedulerConfig {
            cover_traffic_enabled: false,
            ..SchedulerConfig::default()
        },
        tx,
    );

    for _ in 0..3 {
        scheduler.tick_once().await;
    }
    assert_eq!(scheduler.consecutive_empty(), 3);
}
