//! Transport contract for Nightdrop
//!
//! The messaging core is transport-agnostic: anything that can send a typed
//! packet to an address and dispatch inbound packets to registered handlers
//! will do. The surrounding chat system supplies the real network transport;
//! an in-process loopback implementation lives in [`memory`] for tests and
//! demos.

pub mod memory;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Transport address types for different connection methods
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TransportAddress {
    Udp(SocketAddr),
    Tcp(SocketAddr),
    /// In-process endpoint name (loopback transport)
    Local(String),
}

impl std::fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportAddress::Udp(addr) => write!(f, "udp:{}", addr),
            TransportAddress::Tcp(addr) => write!(f, "tcp:{}", addr),
            TransportAddress::Local(name) => write!(f, "local:{}", name),
        }
    }
}

/// A typed packet crossing the transport
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: u8,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(packet_type: u8, data: Vec<u8>) -> Self {
        Self { packet_type, data }
    }
}

/// Handler invoked for each inbound packet of a registered type.
///
/// Handlers run on the transport's dispatch task and must not block; spawn
/// for anything that needs to await.
pub type PacketHandler = Arc<dyn Fn(Packet, TransportAddress) + Send + Sync>;

/// Packet transport abstraction consumed by the storage node and the client
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a packet to the given address
    async fn send(&self, address: &TransportAddress, packet: Packet) -> Result<()>;

    /// Register a handler for one packet type, replacing any previous handler
    fn register_handler(&self, packet_type: u8, handler: PacketHandler);

    /// The address other endpoints can reach this transport at
    fn local_address(&self) -> TransportAddress;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_string_forms_are_distinct() {
        let a = TransportAddress::Local("node-1".into());
        let b = TransportAddress::Local("node-2".into());
        assert_ne!(a.to_string(), b.to_string());
        assert_eq!(a.to_string(), "local:node-1");
    }

    #[test]
    fn test_packet_round_trip() {
        let packet = Packet::new(0xA1, vec![1, 2, 3]);
        let bytes = bincode::serialize(&packet).unwrap();
        let back: Packet = bincode::deserialize(&bytes).unwrap();
        assert_eq!(packet, back);
    }
}
