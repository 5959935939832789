//! In-process loopback transport
//!
//! A hub connecting named endpoints inside one process. Packets sent to an
//! endpoint are dispatched to the handler registered for their packet type on
//! a spawned task, with the sender's address attached so replies can find
//! their way back. Used by the test suites and by offline demos; the real
//! deployment plugs in the chat system's network transport instead.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::transport::{Packet, PacketHandler, Transport, TransportAddress};

/// Shared hub all loopback endpoints attach to
#[derive(Default)]
pub struct MemoryHub {
    endpoints: RwLock<HashMap<String, Arc<Endpoint>>>,
}

#[derive(Default)]
struct Endpoint {
    handlers: RwLock<HashMap<u8, PacketHandler>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a new endpoint with the given name
    pub fn endpoint(self: &Arc<Self>, name: &str) -> Arc<MemoryTransport> {
        let endpoint = Arc::new(Endpoint::default());
        self.endpoints
            .write()
            .insert(name.to_string(), endpoint.clone());
        Arc::new(MemoryTransport {
            hub: self.clone(),
            name: name.to_string(),
            endpoint,
        })
    }

    /// Detach an endpoint; subsequent sends to it fail
    pub fn disconnect(&self, name: &str) {
        self.endpoints.write().remove(name);
    }
}

/// One endpoint's view of the hub
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    name: String,
    endpoint: Arc<Endpoint>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, address: &TransportAddress, packet: Packet) -> Result<()> {
        let target = match address {
            TransportAddress::Local(name) => name.clone(),
            other => {
                return Err(Error::Transport(format!(
                    "loopback transport cannot reach {}",
                    other
                )))
            }
        };

        let endpoint = self
            .hub
            .endpoints
            .read()
            .get(&target)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("no endpoint {}", target)))?;

        let handler = endpoint.handlers.read().get(&packet.packet_type).cloned();
        match handler {
            Some(handler) => {
                let from = self.local_address();
                tokio::spawn(async move {
                    handler(packet, from);
                });
                Ok(())
            }
            None => {
                // Endpoint exists but ignores this packet type; the wire
                // accepted the packet, so the send itself succeeded.
                log::debug!(
                    "endpoint {} has no handler for packet type {:#04x}",
                    target,
                    packet.packet_type
                );
                Ok(())
            }
        }
    }

    fn register_handler(&self, packet_type: u8, handler: PacketHandler) {
        self.endpoint.handlers.write().insert(packet_type, handler);
    }

    fn local_address(&self) -> TransportAddress {
        TransportAddress::Local(self.name.clone())
    }
}
