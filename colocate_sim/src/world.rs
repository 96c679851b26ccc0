//! SimWorld - The simulation harness container.

use crate::context::SimContext;
use crate::error::SimError;
use crate::network::{LinkConfig, NetworkStats, SimNetwork, SimNode};
use crate::peer::SimPeer;
use crate::sensors::{SceneMarkerDetector, SceneTiming};

use colocate_core::localizer::{MarkerId, MarkerLocalizer, SimulatedLocalizer};
use colocate_core::{CoordinateSystemManager, ManagerConfig, Pose};
use colocate_env::PeerId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Configuration for a simulation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Master seed for determinism (default: 42)
    pub seed: u64,

    /// Latency and chunking of new links
    pub link: LinkConfig,

    /// Detection timing of every device's marker scene
    pub scene: SceneTiming,

    /// Configuration of every device's manager
    pub manager: ManagerConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            link: LinkConfig::default(),
            scene: SceneTiming::default(),
            manager: ManagerConfig::default(),
        }
    }
}

/// One simulated device: a manager wired to a node, a marker scene and the
/// built-in localizers.
pub struct SimDevice {
    pub name: String,
    pub node: Arc<SimNode>,
    pub manager: CoordinateSystemManager<SimContext>,
    pub markers: Arc<SceneMarkerDetector>,
    pub marker_localizer: Arc<MarkerLocalizer>,
    pub simulated: Arc<SimulatedLocalizer>,
}

impl SimDevice {
    pub fn id(&self) -> PeerId {
        self.node.id()
    }

    /// Puts marker `id` into this device's view at `pose` (local frame).
    pub fn place_marker(&self, id: u32, pose: Pose) {
        self.markers.place(MarkerId(id), pose);
    }
}

/// The SimWorld - container for the entire simulation.
///
/// Must be created inside a tokio runtime, ideally one with a paused clock.
pub struct SimWorld {
    /// Configuration
    pub config: SimConfig,

    /// Shared simulation context (virtual clock)
    pub context: Arc<SimContext>,

    /// Network fabric with fault injection
    pub network: SimNetwork,

    /// Nodes created so far
    nodes: u64,
}

impl SimWorld {
    /// Creates a new SimWorld.
    pub fn new(config: SimConfig) -> Self {
        let context = SimContext::shared(config.seed);
        let network = SimNetwork::new(context.derive_seed(0x6e6574), config.link);
        Self {
            config,
            context,
            network,
            nodes: 0,
        }
    }

    fn next_node_id(&mut self) -> PeerId {
        self.nodes += 1;
        PeerId::from_seed(self.context.derive_seed(self.nodes))
    }

    /// Adds a device running a full coordinate system manager.
    pub fn add_device(&mut self, name: impl Into<String>) -> Result<SimDevice, SimError> {
        let name = name.into();
        let id = self.next_node_id();
        let node = self.network.add_node(id);
        let manager = CoordinateSystemManager::new(Arc::clone(&self.context), self.config.manager.clone());

        let markers = Arc::new(SceneMarkerDetector::new(self.config.scene));
        let marker_localizer = Arc::new(MarkerLocalizer::marker_visual(markers.clone()));
        let simulated = Arc::new(SimulatedLocalizer::with_context(Arc::clone(&self.context)));
        manager.register_localizer(marker_localizer.clone())?;
        manager.register_localizer(simulated.clone())?;
        manager.register_network_manager(node.clone())?;

        debug!("Device '{}' is sim node {}", name, node.id());
        Ok(SimDevice {
            name,
            node,
            manager,
            markers,
            marker_localizer,
            simulated,
        })
    }

    /// Adds a scripted peer.
    pub fn add_peer(&mut self) -> Arc<SimPeer> {
        let id = self.next_node_id();
        let node = self.network.add_node(id);
        SimPeer::spawn(node)
    }

    pub fn connect(&self, a: PeerId, b: PeerId) -> Result<(), SimError> {
        Ok(self.network.link(a, b)?)
    }

    /// Lets every task run until the network is quiet.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(50) + self.config.link.latency * 2).await;
    }

    pub fn stats(&self) -> NetworkStats {
        self.network.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_devices_see_each_other_after_connect() {
        let mut world = SimWorld::new(SimConfig::default());
        let a = world.add_device("a").unwrap();
        let b = world.add_device("b").unwrap();
        assert_ne!(a.id(), b.id());

        world.connect(a.id(), b.id()).unwrap();
        world.settle().await;

        assert_eq!(a.manager.connected_peers(), vec![b.id()]);
        assert_eq!(b.manager.connected_peers(), vec![a.id()]);
        assert_eq!(a.manager.localizer_ids().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_seed_same_node_ids() {
        let mut first = SimWorld::new(SimConfig::default());
        let mut second = SimWorld::new(SimConfig::default());
        assert_eq!(first.add_peer().id(), second.add_peer().id());
    }

    #[test]
    fn test_sim_config_from_json_keeps_defaults() {
        let config: SimConfig = serde_json::from_str(r#"{"seed": 7}"#).unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.link, LinkConfig::default());
        assert_eq!(config.manager, ManagerConfig::default());
    }
}
