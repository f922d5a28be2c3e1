//! BLE communication module.
//!
//! This module provides the peripheral-facing side of the bridge: the
//! [`Transport`]/[`Link`] seam, its btleplug implementation, and a scripted
//! mock for running the bridge without hardware.

pub mod characteristics;
pub mod connection;
pub mod mock;
pub mod scanner;
pub mod transport;

pub use characteristics::BleLink;
pub use connection::ConnectionStatus;
pub use mock::{MockConnection, MockTransport};
pub use scanner::BleScanner;
pub use transport::{
    ChannelId, ChannelInfo, ChannelProperties, Link, NotificationHandler, PeripheralHandle,
    Transport,
};
