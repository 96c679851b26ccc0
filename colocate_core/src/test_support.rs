//! Shared fixtures for unit tests.

use crate::wire::{split_command, FrameDecoder};
use async_trait::async_trait;
use colocate_env::{EnvError, NetworkTransport, PeerId, TransportEvent};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Transport that records every outbound frame and lets tests inject events.
pub struct RecordingTransport {
    connected: Mutex<HashSet<PeerId>>,
    sent: Mutex<HashMap<PeerId, Vec<Vec<u8>>>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            connected: Mutex::new(HashSet::new()),
            sent: Mutex::new(HashMap::new()),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
        }
    }

    pub fn connect_peer(&self, peer: PeerId) {
        self.connected.lock().unwrap().insert(peer);
        let _ = self.events_tx.send(TransportEvent::Connected(peer));
    }

    pub fn inject(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Every complete frame body sent to `peer`.
    pub fn sent_frames(&self, peer: PeerId) -> Vec<Vec<u8>> {
        let mut decoder = FrameDecoder::default();
        for chunk in self.sent.lock().unwrap().get(&peer).cloned().unwrap_or_default() {
            decoder.push(&chunk);
        }
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = decoder.next_frame() {
            frames.push(frame);
        }
        frames
    }

    /// `(command, payload)` for every frame sent to `peer`.
    pub fn sent_commands(&self, peer: PeerId) -> Vec<(String, Vec<u8>)> {
        self.sent_frames(peer)
            .iter()
            .map(|body| {
                let (name, mut reader) = split_command(body).unwrap();
                (name, reader.read_remaining().to_vec())
            })
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl NetworkTransport for RecordingTransport {
    async fn connect(&self, addr: SocketAddr) -> Result<PeerId, EnvError> {
        Err(EnvError::ConnectionFailed(addr.to_string()))
    }

    async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, EnvError> {
        Ok(addr)
    }

    fn send(&self, peer: PeerId, bytes: Vec<u8>) -> Result<(), EnvError> {
        if !self.connected.lock().unwrap().contains(&peer) {
            return Err(EnvError::not_connected(peer));
        }
        self.sent.lock().unwrap().entry(peer).or_default().push(bytes);
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        self.events_rx.lock().await.recv().await
    }

    fn disconnect(&self, peer: PeerId) {
        if self.connected.lock().unwrap().remove(&peer) {
            let _ = self.events_tx.send(TransportEvent::Disconnected(peer));
        }
    }

    fn connections(&self) -> Vec<PeerId> {
        self.connected.lock().unwrap().iter().copied().collect()
    }
}
