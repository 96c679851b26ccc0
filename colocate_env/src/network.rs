//! Network transport abstraction for Colocate participants.

use async_trait::async_trait;
use crate::error::EnvError;
use crate::types::{PeerId, TransportEvent};
use std::net::SocketAddr;

/// Abstraction for a connection-oriented byte transport.
///
/// The transport is expected to deliver bytes ordered and reliably per
/// connection (e.g. TCP). It does not frame messages: a `Received` event may
/// carry a partial frame or several frames back to back.
///
/// # Implementations
///
/// - **Production**: [`crate::TcpTransport`]
/// - **Simulation**: in-memory links with chunking, latency and severing
///
/// # Event Flow
///
/// ```text
/// Device A                  Transport                  Device B
///   |-- connect(addr) -------->|                          |
///   |<-- Connected(B) ---------|---- Connected(A) ------->|
///   |-- send(B, bytes) ------->|                          |
///   |                          |---- Received(A, ..) ---->|
/// ```
#[async_trait]
pub trait NetworkTransport: Send + Sync + 'static {
    /// Opens an outbound connection.
    ///
    /// A `Connected` event is emitted for the new peer as well.
    async fn connect(&self, addr: SocketAddr) -> Result<PeerId, EnvError>;

    /// Starts accepting inbound connections.
    ///
    /// # Returns
    /// The bound local address (useful when binding port 0).
    async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, EnvError>;

    /// Queues bytes for delivery on a connection.
    ///
    /// Never blocks: it is called from command handlers running on the
    /// receive loop.
    ///
    /// # Returns
    /// * `Ok(())` - Bytes queued for delivery
    /// * `Err(EnvError::PeerNotConnected)` - No live connection for `peer`
    fn send(&self, peer: PeerId, bytes: Vec<u8>) -> Result<(), EnvError>;

    /// Receives the next transport event.
    ///
    /// # Returns
    /// * `Some(event)` - A connect/disconnect/receive event
    /// * `None` - The transport was shut down
    async fn next_event(&self) -> Option<TransportEvent>;

    /// Closes one connection. A `Disconnected` event follows.
    fn disconnect(&self, peer: PeerId);

    /// Returns the currently connected peers.
    fn connections(&self) -> Vec<PeerId>;
}

/// Marker trait for link controllers in simulation.
///
/// Allows injecting faults into a link between two participants.
pub trait NetworkController: Send + Sync {
    /// Sets one-way latency for bytes sent by `from` to `to`.
    fn set_link_latency(&self, from: PeerId, to: PeerId, latency_ms: u64);

    /// Sets the largest chunk a send is split into (0 = never split).
    fn set_max_chunk(&self, from: PeerId, to: PeerId, max_chunk: usize);

    /// Tears the link down; both ends observe `Disconnected`.
    fn sever(&self, a: PeerId, b: PeerId);
}
