//! # matchbox-bridge
//!
//! Bridges a MATCHBOX coffee roaster, reachable over Bluetooth Low Energy,
//! to any number of WebSocket consumers.
//!
//! The roaster streams readings as ASCII frames (`[ET,BT,heater,fan]`) on a
//! notify characteristic and accepts short ASCII commands on a write
//! characteristic. This crate keeps that link alive and shares it:
//!
//! - **Protocol**: frame decoding and command encoding
//! - **Command Gate**: serialized, rate-limited writes with a settle delay
//! - **Link Session**: one live connection with a heartbeat that keeps the
//!   roaster from timing out
//! - **Reconnection Supervisor**: scan, connect, back off, cool down
//! - **State Broadcaster**: the latest state, pushed to every subscriber
//! - **Server**: JSON request/response and push messages over WebSocket
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use matchbox_bridge::{BleScanner, Bridge, Config, Result, WebSocketServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = Config::default();
//!     let scanner = BleScanner::new().await?;
//!     let bridge = Arc::new(Bridge::new(Arc::new(scanner), config.supervisor_config()));
//!
//!     tokio::spawn({
//!         let bridge = bridge.clone();
//!         async move { bridge.run().await }
//!     });
//!
//!     let server = WebSocketServer::bind(&config.server.bind_address(), bridge.clone()).await?;
//!     server.run().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission for the terminal or bundled app.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.

pub mod ble;
pub mod bridge;
pub mod broadcast;
pub mod config;
pub mod console;
pub mod data;
pub mod error;
pub mod gate;
pub mod pending;
pub mod protocol;
pub mod server;
pub mod session;
pub mod supervisor;

pub use ble::{BleScanner, ConnectionStatus, Link, MockTransport, Transport};
pub use bridge::{Bridge, CommandOutcome};
pub use broadcast::{StateBroadcaster, StateUpdate, SubscriberId};
pub use config::Config;
pub use console::Console;
pub use data::MachineState;
pub use error::{Error, Result};
pub use gate::{CommandGate, GatePolicy};
pub use protocol::{decode, encode, Command, FrameReading};
pub use server::WebSocketServer;
pub use session::{HeartbeatPolicy, LinkSession, SessionConfig};
pub use supervisor::{BackoffPolicy, ReconnectionSupervisor, SupervisorConfig};
