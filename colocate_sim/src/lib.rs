//! Colocate Deterministic Simulation Harness
//!
//! This crate runs whole localization exchanges (managers, sessions,
//! sensors and the links between devices) inside a single tokio runtime
//! whose clock is paused, so every run with the same seed takes the same
//! path.
//!
//! # Core Principle
//!
//! All sources of non-determinism are intercepted and controlled:
//! - **Time**: tokio's clock is paused; it jumps to the next timer only when
//!   every task is blocked
//! - **Network**: in-memory links with configurable latency, chunking and
//!   severing
//! - **Randomness**: chunk sizes and node ids derive from one 64-bit seed
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────── SimWorld ─────────────────────────────────┐
//! │  SimContext (paused clock + seed)                                         │
//! │                                                                           │
//! │  ┌───────────── SimDevice ─────────────┐        ┌──────── SimPeer ───────┐│
//! │  │ CoordinateSystemManager             │        │ scripted protocol side ││
//! │  │  ├─ MarkerLocalizer ◄─ SceneMarkers │        │ frame log for ordering ││
//! │  │  └─ SimulatedLocalizer              │        │ assertions             ││
//! │  └───────────────┬─────────────────────┘        └───────────┬────────────┘│
//! │                  │ SimNode                          SimNode │             │
//! │                  └──────────────► SimNetwork ◄──────────────┘             │
//! │                        latency · chunking · sever                         │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use colocate_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::Handshake);
//! assert!(result.passed);
//! ```

mod context;
mod error;
mod network;
mod peer;
mod runner;
mod sensors;
mod world;
pub mod scenarios;

pub use context::SimContext;
pub use error::{check, SimError};
pub use network::{LinkConfig, NetworkStats, SimNetwork, SimNode};
pub use peer::{PeerMessage, SessionMessage, SimPeer};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use sensors::{SceneMarkerDetector, SceneQrCodes, SceneTiming};
pub use world::{SimConfig, SimDevice, SimWorld};
