//! Endpoint notifications.
//!
//! Endpoints report lifecycle and traffic through observer traits whose
//! methods all default to no-ops, so callers implement only what they need.
//! Observers run on the endpoint's own tasks and must not block.
//!
//! For consumers that prefer a stream of records, both traits are
//! implemented for `mpsc::UnboundedSender` of [`ServerEvent`] /
//! [`ClientEvent`].
//!
//! # Example
//!
//! ```
//! use packetwire::{ConnectionId, ServerEvents};
//! use packetwire::protocol::Packet;
//!
//! struct Printer;
//!
//! impl ServerEvents for Printer {
//!     fn packet_received(&self, id: ConnectionId, packet: &Packet) {
//!         println!("{id}: command {:#04x}", packet.command());
//!     }
//! }
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

use crate::protocol::Packet;

/// Identity of one accepted connection, assigned at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Server-side notifications.
pub trait ServerEvents: Send + Sync + 'static {
    /// A connection was accepted.
    fn connected(&self, _id: ConnectionId, _peer: SocketAddr) {}

    /// The peer closed or reset the connection.
    fn disconnected(&self, _id: ConnectionId) {}

    /// A read completed with `bytes` bytes.
    fn data_received(&self, _id: ConnectionId, _bytes: usize) {}

    /// A complete, valid packet was reassembled.
    fn packet_received(&self, _id: ConnectionId, _packet: &Packet) {}

    /// A transport error other than a peer reset ended the read chain.
    fn transport_error(&self, _id: ConnectionId, _error: &std::io::Error) {}
}

/// Client-side notifications.
pub trait ClientEvents: Send + Sync + 'static {
    /// A send completed successfully, including any required reply.
    fn packet_sent(&self, _packet: &Packet, _peer: SocketAddr) {}

    /// A send failed terminally.
    fn packet_failed_to_send(&self, _packet: &Packet, _peer: SocketAddr) {}

    /// Bytes were written to the socket.
    fn data_sent(&self, _bytes: usize, _peer: SocketAddr) {}
}

/// Observer that ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEvents;

impl ServerEvents for NoopEvents {}
impl ClientEvents for NoopEvents {}

/// Server notification as a record.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Connected(ConnectionId, SocketAddr),
    Disconnected(ConnectionId),
    DataReceived(ConnectionId, usize),
    PacketReceived(ConnectionId, Packet),
    /// Error kind and rendered message.
    TransportError(ConnectionId, std::io::ErrorKind, String),
}

/// Client notification as a record.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    PacketSent(Packet, SocketAddr),
    PacketFailedToSend(Packet, SocketAddr),
    DataSent(usize, SocketAddr),
}

impl ServerEvents for mpsc::UnboundedSender<ServerEvent> {
    fn connected(&self, id: ConnectionId, peer: SocketAddr) {
        let _ = self.send(ServerEvent::Connected(id, peer));
    }

    fn disconnected(&self, id: ConnectionId) {
        let _ = self.send(ServerEvent::Disconnected(id));
    }

    fn data_received(&self, id: ConnectionId, bytes: usize) {
        let _ = self.send(ServerEvent::DataReceived(id, bytes));
    }

    fn packet_received(&self, id: ConnectionId, packet: &Packet) {
        let _ = self.send(ServerEvent::PacketReceived(id, packet.clone()));
    }

    fn transport_error(&self, id: ConnectionId, error: &std::io::Error) {
        let _ = self.send(ServerEvent::TransportError(id, error.kind(), error.to_string()));
    }
}

impl ClientEvents for mpsc::UnboundedSender<ClientEvent> {
    fn packet_sent(&self, packet: &Packet, peer: SocketAddr) {
        let _ = self.send(ClientEvent::PacketSent(packet.clone(), peer));
    }

    fn packet_failed_to_send(&self, packet: &Packet, peer: SocketAddr) {
        let _ = self.send(ClientEvent::PacketFailedToSend(packet.clone(), peer));
    }

    fn data_sent(&self, bytes: usize, peer: SocketAddr) {
        let _ = self.send(ClientEvent::DataSent(bytes, peer));
    }
}
