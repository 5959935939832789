//! Storage-node packet service
//!
//! Wires a transport's `ASYNC_STORE` and `ASYNC_RETRIEVE` handlers to a
//! [`MessageStore`] and answers retrievals with `ASYNC_RETRIEVE_RESPONSE`
//! packets. Storage nodes are best-effort: admission failures are logged and
//! the packet dropped, never escalated. A maintenance task periodically runs
//! both cleanup passes.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::error::Result;
use crate::protocol::constants::{
    PACKET_TYPE_ASYNC_RETRIEVE, PACKET_TYPE_ASYNC_RETRIEVE_RESPONSE, PACKET_TYPE_ASYNC_STORE,
};
use crate::protocol::wire::{self, ObfuscatedMessage, RetrieveRequest, RetrieveResponse};
use crate::protocol::short_hex;
use crate::storage::MessageStore;
use crate::transport::{Packet, Transport, TransportAddress};

/// Default cadence of the maintenance task
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(600);

/// One storage node: a message store answering the async packet types
pub struct StorageNode {
    store: Arc<MessageStore>,
    transport: Arc<dyn Transport>,
}

impl StorageNode {
    pub fn new(store: Arc<MessageStore>, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self { store, transport })
    }

    pub fn store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    /// Register this node's packet handlers on its transport
    pub fn register(self: &Arc<Self>) {
        let node = self.clone();
        self.transport.register_handler(
            PACKET_TYPE_ASYNC_STORE,
            Arc::new(move |packet, from| {
                node.handle_store(&packet, &from);
            }),
        );

        let node = self.clone();
        self.transport.register_handler(
            PACKET_TYPE_ASYNC_RETRIEVE,
            Arc::new(move |packet, from| {
                let node = node.clone();
                tokio::spawn(async move {
                    node.handle_retrieve(&packet, from).await;
                });
            }),
        );
    }

    fn handle_store(&self, packet: &Packet, from: &TransportAddress) {
        let msg: ObfuscatedMessage = match wire::decode(&packet.data) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("undecodable store packet from {}: {}", from, e);
                return;
            }
        };
        let message_id = msg.message_id;
        match self.store.store(msg) {
            Ok(()) => {
                log::debug!("stored message {} from {}", short_hex(&message_id), from)
            }
            Err(e) => log::debug!(
                "rejected message {} from {}: {}",
                short_hex(&message_id),
                from,
                e
            ),
        }
    }

    async fn handle_retrieve(&self, packet: &Packet, from: TransportAddress) {
        let request: RetrieveRequest = match wire::decode(&packet.data) {
            Ok(request) => request,
            Err(e) => {
                log::warn!("undecodable retrieve packet from {}: {}", from, e);
                return;
            }
        };

        // Invalid or unknown epochs simply contribute nothing
        let messages = self
            .store
            .retrieve_by_pseudonym(&request.recipient_pseudonym, &request.epochs)
            .unwrap_or_default();
        let response = RetrieveResponse {
            request_id: request.request_id,
            messages,
        };

        if let Err(e) = self.reply(&from, &response).await {
            log::warn!("failed to answer retrieve from {}: {}", from, e);
        }
    }

    async fn reply(&self, to: &TransportAddress, response: &RetrieveResponse) -> Result<()> {
        let packet = Packet::new(PACKET_TYPE_ASYNC_RETRIEVE_RESPONSE, wire::encode(response)?);
        self.transport.send(to, packet).await
    }

    /// Spawn the periodic cleanup task
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let expired = node.store.cleanup_expired();
                let stale = node.store.cleanup_old_epochs();
                if expired + stale > 0 {
                    log::info!(
                        "storage maintenance: {} expired, {} stale-epoch message(s) dropped",
                        expired,
                        stale
                    );
                }
            }
        })
    }
}
