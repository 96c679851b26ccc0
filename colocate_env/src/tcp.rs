//! Production TCP transport.
//!
//! One reader task and one writer task per connection. Received bytes are
//! surfaced as they come off the socket; framing is left to the caller.

use crate::error::EnvError;
use crate::network::NetworkTransport;
use crate::types::{PeerId, TransportEvent};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Size of the per-connection read buffer.
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// A live connection's outbound queue and lifetime handle.
struct Connection {
    addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
}

struct Shared {
    connections: Mutex<HashMap<PeerId, Connection>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    shutdown: CancellationToken,
}

impl Shared {
    /// The table stays usable after a panicking holder; entries are plain data.
    fn table(&self) -> MutexGuard<'_, HashMap<PeerId, Connection>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) -> PeerId {
        let peer = PeerId::new();
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", addr, e);
        }
        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let cancel = self.shutdown.child_token();

        self.table().insert(peer, Connection { addr, outbound, cancel: cancel.clone() });
        let _ = self.events_tx.send(TransportEvent::Connected(peer));
        info!("Connected to {} as peer {}", addr, peer);

        tokio::spawn(write_loop(writer, outbound_rx, cancel.clone()));
        tokio::spawn(read_loop(Arc::clone(self), peer, reader, cancel));
        peer
    }

    fn close(&self, peer: PeerId) {
        let removed = self.table().remove(&peer);
        if let Some(connection) = removed {
            connection.cancel.cancel();
            let _ = self.events_tx.send(TransportEvent::Disconnected(peer));
            info!("Disconnected from {} (peer {})", connection.addr, peer);
        }
    }
}

async fn read_loop(shared: Arc<Shared>, peer: PeerId, mut reader: OwnedReadHalf, cancel: CancellationToken) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                let _ = shared.events_tx.send(TransportEvent::Received {
                    peer,
                    bytes: buf[..n].to_vec(),
                });
            }
            Err(e) => {
                warn!("Read from peer {} failed: {}", peer, e);
                break;
            }
        }
    }
    shared.close(peer);
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let bytes = tokio::select! {
            _ = cancel.cancelled() => break,
            bytes = outbound.recv() => bytes,
        };
        let Some(bytes) = bytes else { break };
        if let Err(e) = writer.write_all(&bytes).await {
            warn!("Write failed: {}", e);
            // Take the read side down too
            cancel.cancel();
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// TCP implementation of [`NetworkTransport`].
pub struct TcpTransport {
    shared: Arc<Shared>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
    connect_timeout: Duration,
}

impl TcpTransport {
    /// Creates a transport with no connections.
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                connections: Mutex::new(HashMap::new()),
                events_tx,
                shutdown: CancellationToken::new(),
            }),
            events_rx: tokio::sync::Mutex::new(events_rx),
            connect_timeout: Duration::from_secs(5),
        }
    }

    /// Sets the outbound connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Returns the remote address of a connection.
    pub fn peer_addr(&self, peer: PeerId) -> Option<SocketAddr> {
        self.shared.table().get(&peer).map(|c| c.addr)
    }

    /// Stops listening and closes every connection.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

#[async_trait]
impl NetworkTransport for TcpTransport {
    async fn connect(&self, addr: SocketAddr) -> Result<PeerId, EnvError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| EnvError::Timeout(self.connect_timeout.as_millis() as u64))?
            .map_err(|e| EnvError::ConnectionFailed(format!("TCP connect to {} failed: {}", addr, e)))?;
        Ok(self.shared.register(stream, addr))
    }

    async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, EnvError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| EnvError::ConnectionFailed(format!("TCP bind {} failed: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;
        info!("Listening on {}", local_addr);

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shared.shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, remote)) => {
                        shared.register(stream, remote);
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                }
            }
            debug!("Stopped listening on {}", local_addr);
        });

        Ok(local_addr)
    }

    fn send(&self, peer: PeerId, bytes: Vec<u8>) -> Result<(), EnvError> {
        let connections = self.shared.table();
        let connection = connections.get(&peer).ok_or_else(|| EnvError::not_connected(peer))?;
        connection
            .outbound
            .send(bytes)
            .map_err(|_| EnvError::network("connection closed"))
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        let mut rx = self.events_rx.lock().await;
        tokio::select! {
            _ = self.shared.shutdown.cancelled() => None,
            event = rx.recv() => event,
        }
    }

    fn disconnect(&self, peer: PeerId) {
        self.shared.close(peer);
    }

    fn connections(&self) -> Vec<PeerId> {
        self.shared.table().keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tcp_round_trip_bytes() {
        let server = TcpTransport::new();
        let addr = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let client = TcpTransport::new();
        let server_peer = client.connect(addr).await.unwrap();
        assert_eq!(client.next_event().await, Some(TransportEvent::Connected(server_peer)));

        let client_peer = match server.next_event().await {
            Some(TransportEvent::Connected(peer)) => peer,
            other => panic!("unexpected event: {:?}", other),
        };

        client.send(server_peer, b"hello".to_vec()).unwrap();

        let mut received = Vec::new();
        while received.len() < 5 {
            match server.next_event().await {
                Some(TransportEvent::Received { peer, bytes }) => {
                    assert_eq!(peer, client_peer);
                    received.extend(bytes);
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(received, b"hello");
    }

    #[tokio::test]
    async fn test_tcp_disconnect_emits_event_on_both_sides() {
        let server = TcpTransport::new();
        let addr = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let client = TcpTransport::new();
        let server_peer = client.connect(addr).await.unwrap();
        let _ = client.next_event().await;
        let client_peer = server.next_event().await.unwrap().peer();

        client.disconnect(server_peer);
        assert_eq!(client.next_event().await, Some(TransportEvent::Disconnected(server_peer)));
        assert_eq!(server.next_event().await, Some(TransportEvent::Disconnected(client_peer)));
        assert!(client.send(server_peer, vec![1]).is_err());
    }

    #[tokio::test]
    async fn test_poisoned_table_still_registers_connections() {
        let server = TcpTransport::new();
        let addr = server.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let client = TcpTransport::new();

        let shared = Arc::clone(&client.shared);
        let _ = std::thread::spawn(move || {
            let _held = shared.connections.lock().unwrap();
            panic!("poison the connection table");
        })
        .join();
        assert!(client.shared.connections.is_poisoned());

        let server_peer = client.connect(addr).await.unwrap();
        assert_eq!(client.connections(), vec![server_peer]);
        assert!(client.peer_addr(server_peer).is_some());
        client.send(server_peer, b"still here".to_vec()).unwrap();
    }
}
