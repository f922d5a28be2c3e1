//! Error types for the matchbox-bridge crate.

use thiserror::Error;

use crate::protocol::DecodeError;

/// The main error type for this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Bluetooth is not available or is disabled on this system.
    #[error("Bluetooth not available or disabled")]
    BluetoothUnavailable,

    /// No peripheral matching the configured name prefix was found.
    #[error("No device starting with '{prefix}' found")]
    DeviceNotFound {
        /// The name prefix that was searched for.
        prefix: String,
    },

    /// The peripheral does not expose a required notify or write channel.
    #[error("Required {missing} channel not found")]
    ChannelDiscovery {
        /// Which capability was missing ("notify" or "write").
        missing: String,
    },

    /// Registering the notification handler failed.
    #[error("Failed to subscribe to notifications: {reason}")]
    Subscription {
        /// Description of why the subscription failed.
        reason: String,
    },

    /// A transient fault on the link during a read or write.
    #[error("Transport error: {reason}")]
    Transport {
        /// Description of the fault.
        reason: String,
    },

    /// Operation requires a connection but the peripheral is not connected.
    #[error("Peripheral not connected")]
    NotConnected,

    /// A notification frame could not be decoded.
    #[error("Invalid frame: {0}")]
    Decode(#[from] DecodeError),

    /// A command value is outside its declared range.
    #[error("Invalid parameter: {name} = {value}")]
    Validation {
        /// The name of the parameter.
        name: String,
        /// The invalid value that was provided.
        value: String,
    },

    /// The configuration could not be loaded.
    #[error("Invalid configuration: {reason}")]
    Config {
        /// Description of the problem.
        reason: String,
    },

    /// I/O error from sockets or the console.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
