//! Scripted remote endpoint.
//!
//! A [`SimPeer`] sits on the simulated network like a device would, but
//! instead of running a manager it lets the scenario speak the protocol
//! frame by frame and inspect exactly what the device under test sent, in
//! order.

use crate::network::SimNode;
use colocate_core::command_channel::send_command;
use colocate_core::protocol::{
    COORDINATE_ASSIGNED, COORDINATE_FOUND, COORDINATE_STATE, DISCOVERY_REQUEST, LOCALIZATION_DATA,
};
use colocate_core::wire::split_command;
use colocate_core::{CommandReader, CommandWriter, FrameDecoder, Pose, WireError};
use colocate_env::{EnvError, LocalizerId, NetworkTransport, PeerId, TransportEvent};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One command frame received by a scripted peer.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerMessage {
    pub from: PeerId,
    pub command: String,
    pub payload: Vec<u8>,
}

/// Decoded `LocalizationData` traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMessage {
    DiscoveryRequest { localizer: LocalizerId, max_supported_id: i32 },
    CoordinateAssigned { localizer: LocalizerId, id: String },
    CoordinateFound { localizer: LocalizerId, id: String },
}

impl PeerMessage {
    /// Decodes a `LocalizationData` frame; `None` for anything else.
    pub fn session(&self) -> Option<SessionMessage> {
        if self.command != LOCALIZATION_DATA {
            return None;
        }
        decode_session(&mut CommandReader::new(&self.payload)).ok().flatten()
    }

    /// Decodes a `CoordinateState` frame into `(localizer, located, id)`.
    pub fn coordinate_state(&self) -> Option<(LocalizerId, bool, String)> {
        if self.command != COORDINATE_STATE {
            return None;
        }
        let mut reader = CommandReader::new(&self.payload);
        let localizer = LocalizerId(reader.read_uuid().ok()?);
        let located = reader.read_bool().ok()?;
        let id = reader.read_string().ok()?;
        Some((localizer, located, id))
    }
}

fn decode_session(reader: &mut CommandReader<'_>) -> Result<Option<SessionMessage>, WireError> {
    let localizer = LocalizerId(reader.read_uuid()?);
    let header = reader.read_string()?;
    let message = match header.as_str() {
        DISCOVERY_REQUEST => SessionMessage::DiscoveryRequest {
            localizer,
            max_supported_id: reader.read_i32()?,
        },
        COORDINATE_ASSIGNED => SessionMessage::CoordinateAssigned {
            localizer,
            id: reader.read_string()?,
        },
        COORDINATE_FOUND => SessionMessage::CoordinateFound {
            localizer,
            id: reader.read_string()?,
        },
        _ => return Ok(None),
    };
    Ok(Some(message))
}

struct PeerState {
    connected: HashSet<PeerId>,
    decoders: HashMap<PeerId, FrameDecoder>,
    log: Vec<PeerMessage>,
}

/// A scripted protocol endpoint on the simulated network.
pub struct SimPeer {
    node: Arc<SimNode>,
    state: Arc<Mutex<PeerState>>,
    inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<PeerMessage>>,
}

impl SimPeer {
    /// Wraps `node` and starts decoding its traffic.
    pub fn spawn(node: Arc<SimNode>) -> Arc<Self> {
        let state = Arc::new(Mutex::new(PeerState {
            connected: HashSet::new(),
            decoders: HashMap::new(),
            log: Vec::new(),
        }));
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(Arc::clone(&node), Arc::clone(&state), tx));
        Arc::new(Self {
            node,
            state,
            inbox: tokio::sync::Mutex::new(rx),
        })
    }

    pub fn id(&self) -> PeerId {
        self.node.id()
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        lock(&self.state).connected.contains(&peer)
    }

    /// Every frame received so far, in arrival order.
    pub fn log(&self) -> Vec<PeerMessage> {
        lock(&self.state).log.clone()
    }

    /// Sends an arbitrary command frame.
    pub fn send<F>(&self, to: PeerId, command: &str, write: F) -> Result<(), EnvError>
    where
        F: FnOnce(&mut CommandWriter),
    {
        send_command(self.node.as_ref(), to, command, write)
    }

    /// Sends raw bytes, bypassing framing.
    pub fn send_raw(&self, to: PeerId, bytes: Vec<u8>) -> Result<(), EnvError> {
        self.node.send(to, bytes)
    }

    fn send_session<F>(&self, to: PeerId, localizer: LocalizerId, header: &str, write: F) -> Result<(), EnvError>
    where
        F: FnOnce(&mut CommandWriter),
    {
        self.send(to, LOCALIZATION_DATA, |w| {
            w.write_uuid(&localizer.0);
            w.write_str(header);
            write(w);
        })
    }

    pub fn request_discovery(&self, to: PeerId, localizer: LocalizerId, max_supported_id: i32) -> Result<(), EnvError> {
        self.send_session(to, localizer, DISCOVERY_REQUEST, |w| w.write_i32(max_supported_id))
    }

    pub fn assign(&self, to: PeerId, localizer: LocalizerId, id: &str) -> Result<(), EnvError> {
        self.send_session(to, localizer, COORDINATE_ASSIGNED, |w| w.write_str(id))
    }

    pub fn found(&self, to: PeerId, localizer: LocalizerId, id: &str) -> Result<(), EnvError> {
        self.send_session(to, localizer, COORDINATE_FOUND, |w| w.write_str(id))
    }

    /// Reports that this side located `id` at `pose`.
    pub fn report_located(&self, to: PeerId, localizer: LocalizerId, id: &str, pose: &Pose) -> Result<(), EnvError> {
        self.send(to, COORDINATE_STATE, |w| {
            w.write_uuid(&localizer.0);
            w.write_bool(true);
            w.write_str(id);
            pose.write_to(w);
        })
    }

    /// Next received frame, or `None` if nothing arrives within `within`.
    pub async fn recv(&self, within: Duration) -> Option<PeerMessage> {
        let mut inbox = self.inbox.lock().await;
        tokio::time::timeout(within, inbox.recv()).await.ok().flatten()
    }

    /// Receives until a frame matches `predicate`, skipping the rest.
    pub async fn expect<P>(&self, within: Duration, predicate: P) -> Option<PeerMessage>
    where
        P: Fn(&PeerMessage) -> bool,
    {
        let deadline = tokio::time::Instant::now() + within;
        let mut inbox = self.inbox.lock().await;
        loop {
            let message = tokio::time::timeout_at(deadline, inbox.recv()).await.ok().flatten()?;
            if predicate(&message) {
                return Some(message);
            }
        }
    }

    /// Receives until a session message matches `predicate`.
    pub async fn expect_session<P>(&self, within: Duration, predicate: P) -> Option<SessionMessage>
    where
        P: Fn(&SessionMessage) -> bool,
    {
        self.expect(within, |m| m.session().as_ref().map_or(false, &predicate))
            .await
            .and_then(|m| m.session())
    }

    /// Discards everything received but not yet consumed.
    pub async fn drain(&self) -> usize {
        let mut inbox = self.inbox.lock().await;
        let mut dropped = 0;
        while inbox.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

async fn pump(node: Arc<SimNode>, state: Arc<Mutex<PeerState>>, inbox: mpsc::UnboundedSender<PeerMessage>) {
    while let Some(event) = node.next_event().await {
        let mut state = lock(&state);
        match event {
            TransportEvent::Connected(peer) => {
                state.connected.insert(peer);
                state.decoders.insert(peer, FrameDecoder::default());
            }
            TransportEvent::Disconnected(peer) => {
                state.connected.remove(&peer);
                state.decoders.remove(&peer);
            }
            TransportEvent::Received { peer, bytes } => {
                let mut frames = Vec::new();
                if let Some(decoder) = state.decoders.get_mut(&peer) {
                    decoder.push(&bytes);
                    loop {
                        match decoder.next_frame() {
                            Ok(Some(frame)) => frames.push(frame),
                            Ok(None) => break,
                            Err(e) => {
                                warn!("Sim peer dropped bad frame from {}: {}", peer, e);
                                break;
                            }
                        }
                    }
                }
                for body in frames {
                    let Ok((command, mut reader)) = split_command(&body) else {
                        warn!("Sim peer got a frame without a command from {}", peer);
                        continue;
                    };
                    let message = PeerMessage {
                        from: peer,
                        command,
                        payload: reader.read_remaining().to_vec(),
                    };
                    debug!("Sim peer {} <- {}: {}", node.id(), peer, message.command);
                    state.log.push(message.clone());
                    let _ = inbox.send(message);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{LinkConfig, SimNetwork};

    #[tokio::test(start_paused = true)]
    async fn test_peers_exchange_chunked_commands() {
        let network = SimNetwork::new(11, LinkConfig {
            latency: Duration::from_millis(5),
            max_chunk: 2,
        });
        let a = SimPeer::spawn(network.add_node(PeerId::from_seed(1)));
        let b = SimPeer::spawn(network.add_node(PeerId::from_seed(2)));
        network.link(a.id(), b.id()).unwrap();

        let localizer = LocalizerId::from_u128(5);
        a.request_discovery(b.id(), localizer, 3).unwrap();
        a.assign(b.id(), localizer, "0").unwrap();

        let first = b.recv(Duration::from_secs(1)).await.unwrap();
        assert_eq!(first.from, a.id());
        assert_eq!(
            first.session(),
            Some(SessionMessage::DiscoveryRequest {
                localizer,
                max_supported_id: 3
            })
        );
        let second = b
            .expect_session(Duration::from_secs(1), |m| {
                matches!(m, SessionMessage::CoordinateAssigned { .. })
            })
            .await;
        assert_eq!(
            second,
            Some(SessionMessage::CoordinateAssigned {
                localizer,
                id: "0".into()
            })
        );
        assert_eq!(b.log().len(), 2);
        assert!(b.is_connected(a.id()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expect_gives_up_after_deadline() {
        let network = SimNetwork::new(1, LinkConfig::default());
        let a = SimPeer::spawn(network.add_node(PeerId::from_seed(1)));
        assert!(a.expect(Duration::from_secs(2), |_| true).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_coordinate_state_decodes() {
        let network = SimNetwork::new(1, LinkConfig::default());
        let a = SimPeer::spawn(network.add_node(PeerId::from_seed(1)));
        let b = SimPeer::spawn(network.add_node(PeerId::from_seed(2)));
        network.link(a.id(), b.id()).unwrap();

        let localizer = LocalizerId::from_u128(9);
        a.report_located(b.id(), localizer, "7", &Pose::identity()).unwrap();

        let message = b.recv(Duration::from_secs(1)).await.unwrap();
        assert_eq!(message.coordinate_state(), Some((localizer, true, "7".to_string())));
        assert_eq!(message.session(), None);
    }
}
