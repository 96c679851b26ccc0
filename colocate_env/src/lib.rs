//! Colocate Environment Abstraction Layer
//!
//! This crate provides the seams between the localization core and the
//! outside world, so the same engine runs against a real TCP link in
//! **Production** and against in-memory links in **Simulation**.
//!
//! # Core Concept
//!
//! The core never opens sockets or reads clocks directly:
//! - Time and task spawning go through [`ColocateContext`]
//! - Connections, bytes and connect/disconnect events go through [`NetworkTransport`]
//!
//! # Example
//!
//! ```ignore
//! use colocate_env::{NetworkTransport, TransportEvent};
//!
//! async fn pump<Net: NetworkTransport>(net: &Net) {
//!     while let Some(event) = net.next_event().await {
//!         match event {
//!             TransportEvent::Connected(peer) => on_connected(peer),
//!             TransportEvent::Disconnected(peer) => on_disconnected(peer),
//!             TransportEvent::Received { peer, bytes } => on_bytes(peer, &bytes),
//!         }
//!     }
//! }
//! ```

mod context;
mod network;
mod types;
mod error;
mod tokio_impl;
mod tcp;

pub use context::ColocateContext;
pub use network::{NetworkTransport, NetworkController};
pub use types::{PeerId, LocalizerId, TransportEvent};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
pub use tcp::TcpTransport;
