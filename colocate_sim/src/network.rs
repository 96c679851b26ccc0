//! Simulated in-memory network with fault injection.
//!
//! Every node gets an inbox of [`TransportEvent`]s. A link between two nodes
//! is a pair of one-way pipes, each drained by its own delivery task, so
//! bytes on one pipe always arrive in send order no matter how latency
//! changes. Sends may be cut into random chunks to exercise frame
//! reassembly.
//!
//! ```text
//!   node A ── send ──► [split into chunks] ──► pipe A→B ── sleep_until(due) ──► inbox B
//!   node B ── send ──► [split into chunks] ──► pipe B→A ── sleep_until(due) ──► inbox A
//! ```
//!
//! The peer handle a node sees for a link is the remote node's id.

use async_trait::async_trait;
use colocate_env::{EnvError, NetworkController, NetworkTransport, PeerId, TransportEvent};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Behaviour of a freshly created link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// One-way latency (default: 0)
    pub latency: Duration,

    /// Largest chunk a send is cut into, 0 = never split (default: 0)
    pub max_chunk: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            max_chunk: 0,
        }
    }
}

/// Counters collected by the network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NetworkStats {
    /// Successful `send` calls
    pub sends: u64,

    /// Payload bytes accepted by `send`
    pub bytes_sent: u64,

    /// Chunks that reached an inbox
    pub chunks_delivered: u64,

    /// Links torn down by `sever` or node removal
    pub links_severed: u64,
}

/// One direction of a link.
struct Pipe {
    generation: u64,
    latency: Duration,
    max_chunk: usize,
    queue: mpsc::UnboundedSender<(Instant, Vec<u8>)>,
}

struct Fabric {
    inboxes: HashMap<PeerId, mpsc::UnboundedSender<TransportEvent>>,
    listeners: HashMap<SocketAddr, PeerId>,
    pipes: HashMap<(PeerId, PeerId), Pipe>,
    next_generation: u64,
    rng: ChaCha8Rng,
    stats: NetworkStats,
}

impl Fabric {
    fn notify(&self, node: PeerId, event: TransportEvent) {
        if let Some(inbox) = self.inboxes.get(&node) {
            let _ = inbox.send(event);
        }
    }

    fn is_live(&self, from: PeerId, to: PeerId, generation: u64) -> bool {
        self.pipes
            .get(&(from, to))
            .map_or(false, |pipe| pipe.generation == generation)
    }

    fn tear_down(&mut self, a: PeerId, b: PeerId) -> bool {
        let removed_ab = self.pipes.remove(&(a, b)).is_some();
        let removed_ba = self.pipes.remove(&(b, a)).is_some();
        if !(removed_ab || removed_ba) {
            return false;
        }
        self.stats.links_severed += 1;
        self.notify(a, TransportEvent::Disconnected(b));
        self.notify(b, TransportEvent::Disconnected(a));
        true
    }
}

fn lock(fabric: &Mutex<Fabric>) -> MutexGuard<'_, Fabric> {
    fabric.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The simulated network: a set of nodes and the links between them.
///
/// Cheap to clone; clones share the same fabric. Creating links spawns
/// delivery tasks, so it must happen inside a tokio runtime.
#[derive(Clone)]
pub struct SimNetwork {
    fabric: Arc<Mutex<Fabric>>,
    default_link: LinkConfig,
}

impl SimNetwork {
    /// Creates an empty network whose chunking is driven by `seed`.
    pub fn new(seed: u64, default_link: LinkConfig) -> Self {
        Self {
            fabric: Arc::new(Mutex::new(Fabric {
                inboxes: HashMap::new(),
                listeners: HashMap::new(),
                pipes: HashMap::new(),
                next_generation: 0,
                rng: ChaCha8Rng::seed_from_u64(seed),
                stats: NetworkStats::default(),
            })),
            default_link,
        }
    }

    /// Adds a node with the given identity.
    pub fn add_node(&self, id: PeerId) -> Arc<SimNode> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.fabric).inboxes.insert(id, tx);
        debug!("Sim node {} joined the network", id);
        Arc::new(SimNode {
            id,
            network: self.clone(),
            events: tokio::sync::Mutex::new(rx),
        })
    }

    /// Removes a node; its links are severed and its event stream ends.
    pub fn remove_node(&self, id: PeerId) {
        let mut fabric = lock(&self.fabric);
        for peer in Self::peers_of(&fabric, id) {
            fabric.tear_down(id, peer);
        }
        fabric.listeners.retain(|_, node| *node != id);
        fabric.inboxes.remove(&id);
    }

    /// Connects two nodes; both observe `Connected`.
    pub fn link(&self, a: PeerId, b: PeerId) -> Result<(), EnvError> {
        let mut fabric = lock(&self.fabric);
        if a == b {
            return Err(EnvError::ConnectionFailed(format!("{} cannot link to itself", a)));
        }
        for node in [a, b] {
            if !fabric.inboxes.contains_key(&node) {
                return Err(EnvError::ConnectionFailed(format!("no sim node {}", node)));
            }
        }
        if fabric.pipes.contains_key(&(a, b)) {
            return Err(EnvError::ConnectionFailed(format!("{} and {} already linked", a, b)));
        }

        for (from, to) in [(a, b), (b, a)] {
            let generation = fabric.next_generation;
            fabric.next_generation += 1;
            let (queue, pending) = mpsc::unbounded_channel();
            fabric.pipes.insert(
                (from, to),
                Pipe {
                    generation,
                    latency: self.default_link.latency,
                    max_chunk: self.default_link.max_chunk,
                    queue,
                },
            );
            tokio::spawn(deliver(Arc::downgrade(&self.fabric), from, to, generation, pending));
        }
        fabric.notify(a, TransportEvent::Connected(b));
        fabric.notify(b, TransportEvent::Connected(a));
        debug!("Linked sim nodes {} <-> {}", a, b);
        Ok(())
    }

    pub fn is_linked(&self, a: PeerId, b: PeerId) -> bool {
        lock(&self.fabric).pipes.contains_key(&(a, b))
    }

    pub fn stats(&self) -> NetworkStats {
        lock(&self.fabric).stats
    }

    fn listen(&self, node: PeerId, addr: SocketAddr) {
        lock(&self.fabric).listeners.insert(addr, node);
    }

    fn resolve(&self, addr: SocketAddr) -> Option<PeerId> {
        lock(&self.fabric).listeners.get(&addr).copied()
    }

    fn connections(&self, node: PeerId) -> Vec<PeerId> {
        Self::peers_of(&lock(&self.fabric), node)
    }

    fn peers_of(fabric: &Fabric, node: PeerId) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = fabric
            .pipes
            .keys()
            .filter(|(from, _)| *from == node)
            .map(|(_, to)| *to)
            .collect();
        peers.sort();
        peers
    }

    fn transmit(&self, from: PeerId, to: PeerId, bytes: Vec<u8>) -> Result<(), EnvError> {
        let mut guard = lock(&self.fabric);
        let Fabric { pipes, rng, stats, .. } = &mut *guard;
        let pipe = pipes.get(&(from, to)).ok_or_else(|| EnvError::not_connected(to))?;

        stats.sends += 1;
        stats.bytes_sent += bytes.len() as u64;
        let due = Instant::now() + pipe.latency;
        for chunk in split(bytes, pipe.max_chunk, rng) {
            trace!("{} -> {}: {} byte chunk due at {:?}", from, to, chunk.len(), due);
            pipe.queue
                .send((due, chunk))
                .map_err(|_| EnvError::network(format!("pipe {} -> {} closed", from, to)))?;
        }
        Ok(())
    }

    fn update_pipe(&self, from: PeerId, to: PeerId, update: impl FnOnce(&mut Pipe)) {
        if let Some(pipe) = lock(&self.fabric).pipes.get_mut(&(from, to)) {
            update(pipe);
        }
    }
}

impl NetworkController for SimNetwork {
    fn set_link_latency(&self, from: PeerId, to: PeerId, latency_ms: u64) {
        self.update_pipe(from, to, |pipe| pipe.latency = Duration::from_millis(latency_ms));
    }

    fn set_max_chunk(&self, from: PeerId, to: PeerId, max_chunk: usize) {
        self.update_pipe(from, to, |pipe| pipe.max_chunk = max_chunk);
    }

    fn sever(&self, a: PeerId, b: PeerId) {
        if lock(&self.fabric).tear_down(a, b) {
            debug!("Severed sim link {} <-> {}", a, b);
        }
    }
}

/// Cuts `bytes` into chunks of 1..=max_chunk bytes.
fn split(bytes: Vec<u8>, max_chunk: usize, rng: &mut ChaCha8Rng) -> Vec<Vec<u8>> {
    if bytes.is_empty() {
        return Vec::new();
    }
    if max_chunk == 0 || bytes.len() <= max_chunk {
        return vec![bytes];
    }
    let mut chunks = Vec::new();
    let mut rest = bytes.as_slice();
    while !rest.is_empty() {
        let size = rng.gen_range(1..=max_chunk).min(rest.len());
        let (head, tail) = rest.split_at(size);
        chunks.push(head.to_vec());
        rest = tail;
    }
    chunks
}

/// Drains one pipe into the receiving node's inbox.
async fn deliver(
    fabric: Weak<Mutex<Fabric>>,
    from: PeerId,
    to: PeerId,
    generation: u64,
    mut pending: mpsc::UnboundedReceiver<(Instant, Vec<u8>)>,
) {
    while let Some((due, chunk)) = pending.recv().await {
        tokio::time::sleep_until(due).await;
        let Some(fabric) = fabric.upgrade() else {
            break;
        };
        let mut fabric = lock(&fabric);
        if !fabric.is_live(from, to, generation) {
            break;
        }
        fabric.stats.chunks_delivered += 1;
        fabric.notify(to, TransportEvent::Received { peer: from, bytes: chunk });
    }
    trace!("Pipe {} -> {} closed", from, to);
}

/// One device's view of the simulated network.
pub struct SimNode {
    id: PeerId,
    network: SimNetwork,
    events: tokio::sync::Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl SimNode {
    /// This node's identity (the handle other nodes see for it).
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn network(&self) -> &SimNetwork {
        &self.network
    }

    /// Leaves the network; `next_event` returns `None` once drained.
    pub fn close(&self) {
        self.network.remove_node(self.id);
    }
}

impl std::fmt::Debug for SimNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimNode").field("id", &self.id).finish()
    }
}

#[async_trait]
impl NetworkTransport for SimNode {
    async fn connect(&self, addr: SocketAddr) -> Result<PeerId, EnvError> {
        let target = self
            .network
            .resolve(addr)
            .ok_or_else(|| EnvError::ConnectionFailed(addr.to_string()))?;
        self.network.link(self.id, target)?;
        Ok(target)
    }

    async fn listen(&self, addr: SocketAddr) -> Result<SocketAddr, EnvError> {
        self.network.listen(self.id, addr);
        Ok(addr)
    }

    fn send(&self, peer: PeerId, bytes: Vec<u8>) -> Result<(), EnvError> {
        self.network.transmit(self.id, peer, bytes)
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        self.events.lock().await.recv().await
    }

    fn disconnect(&self, peer: PeerId) {
        self.network.sever(self.id, peer);
    }

    fn connections(&self) -> Vec<PeerId> {
        self.network.connections(self.id)
    }
}
