//! Bridge a live parameter stream to sACN lighting and WebSocket UI clients
//!
//! Parameter snapshots arrive as MessagePack datagrams over UDP. Each one is
//! diffed against the current session's state; when something changed the
//! bridge:
//!
//! - sends one E1.31 frame per touched universe to its multicast group
//! - publishes session and diff events to a broadcast hub, which mirrors the
//!   state for late joiners and fans events out to connected browsers
//!
//! # Quick Start
//!
//! ```no_run
//! use penumbra::{Bridge, ConfigStore, Dispatcher, Hub, HubOptions, Receiver};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Arc::new(ConfigStore::load("config.json")?);
//!
//!     let hub = Hub::spawn(HubOptions::default());
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await?;
//!     tokio::spawn(hub.clone().serve(listener));
//!
//!     let receiver = Receiver::bind("0.0.0.0:7000").await?;
//!     Bridge::new(hub, Dispatcher::new(), config).run(receiver).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **Receiver**: UDP socket and MessagePack decoding
//! - **StateMirror**: canonical session state and diff detection
//! - **Dispatcher**: E1.31 framing, per-universe sequencing and multicast send
//! - **Hub**: client registry, snapshot mirror and fan-out over WebSocket
//! - **Bridge**: the per-packet pipeline tying them together

mod bridge;
mod config;
pub mod e131;
mod error;
mod hub;
mod protocol;
mod receiver;
mod settings;
mod state;
mod subscriber;
mod types;

// Public exports
pub use bridge::Bridge;
pub use config::ConfigStore;
pub use e131::{Cid, Dispatcher, Transport, UdpTransport};
pub use error::{PenumbraError, Result};
pub use hub::{Hub, HubMirror, HubOptions, WS_PATH};
pub use protocol::{Event, ServerMessage, StatePacket};
pub use receiver::Receiver;
pub use settings::Settings;
pub use state::{MirrorSnapshot, StateMirror};
pub use subscriber::{ClientId, Subscriber};
pub use types::{
    Channel, Config, ConfigUpdate, ParameterMapping, ParameterState, Timestamp, UniverseConfig,
    UniverseId, UNIVERSE_SIZE,
};
