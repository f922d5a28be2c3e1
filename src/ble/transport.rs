//! Transport abstractions for the peripheral link.
//!
//! [`Transport`] discovers and connects peripherals, [`Link`] talks to one
//! connected peripheral. The bridge core only ever sees these traits, so the
//! same session and supervisor code runs against real Bluetooth hardware
//! ([`BleScanner`](crate::ble::BleScanner)) and the scripted
//! [`MockTransport`](crate::ble::mock::MockTransport).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;

/// Identifier of a channel (GATT characteristic) on the peripheral.
pub type ChannelId = Uuid;

/// Callback invoked with the raw bytes of every notification on a channel.
pub type NotificationHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// A peripheral found by a scan.
///
/// Handles are only meaningful to the transport that produced them and are
/// consumed by a single [`Transport::connect`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralHandle {
    /// Transport-specific identifier.
    pub id: String,
    /// Device address (MAC address, or a UUID on macOS).
    pub address: String,
    /// Advertised local name, if any.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

impl PeripheralHandle {
    /// Check whether the advertised name starts with `prefix`.
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        self.name
            .as_deref()
            .map(|name| name.starts_with(prefix))
            .unwrap_or(false)
    }
}

/// Capabilities advertised by a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelProperties {
    /// The channel can be read.
    pub read: bool,
    /// Writes with acknowledgement are accepted.
    pub write: bool,
    /// Writes without acknowledgement are accepted.
    pub write_without_response: bool,
    /// The channel sends notifications.
    pub notify: bool,
}

impl ChannelProperties {
    /// Check if the channel accepts writes of either kind.
    pub fn is_writable(&self) -> bool {
        self.write || self.write_without_response
    }
}

/// A channel exposed by a connected peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Channel identifier.
    pub id: ChannelId,
    /// Service the channel belongs to.
    pub service: Uuid,
    /// Advertised capabilities.
    pub properties: ChannelProperties,
}

/// Discovers and connects peripherals.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Scan for peripherals for `timeout` and return everything seen.
    async fn scan(&self, timeout: Duration) -> Result<Vec<PeripheralHandle>>;

    /// Connect to a scanned peripheral.
    ///
    /// `on_disconnect` must be cancelled by the transport whenever the link
    /// drops, at any time and from any task, including after an explicit
    /// [`Link::disconnect`].
    async fn connect(
        &self,
        peripheral: &PeripheralHandle,
        on_disconnect: CancellationToken,
    ) -> Result<Arc<dyn Link>>;
}

/// Operations on one connected peripheral.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Link: Send + Sync {
    /// List every channel of every discovered service.
    async fn list_channels(&self) -> Result<Vec<ChannelInfo>>;

    /// Enable notifications on `channel` and route them to `on_notify`.
    async fn subscribe(&self, channel: ChannelId, on_notify: NotificationHandler) -> Result<()>;

    /// Disable notifications on `channel`.
    async fn unsubscribe(&self, channel: ChannelId) -> Result<()>;

    /// Write `data` to `channel`.
    async fn write(&self, channel: ChannelId, data: &[u8], require_ack: bool) -> Result<()>;

    /// Drop the connection.
    async fn disconnect(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(name: Option<&str>) -> PeripheralHandle {
        PeripheralHandle {
            id: "hci0/dev_00_11".to_string(),
            address: "00:11:22:33:44:55".to_string(),
            name: name.map(str::to_string),
            rssi: Some(-60),
        }
    }

    #[test]
    fn test_matches_prefix() {
        assert!(handle(Some("MATCHBOX-1234")).matches_prefix("MATCHBOX"));
        assert!(!handle(Some("Aranet4 1234")).matches_prefix("MATCHBOX"));
        assert!(!handle(None).matches_prefix("MATCHBOX"));
    }

    #[test]
    fn test_channel_properties_writable() {
        let props = ChannelProperties {
            write_without_response: true,
            ..Default::default()
        };
        assert!(props.is_writable());
        assert!(!ChannelProperties::default().is_writable());
    }
}
