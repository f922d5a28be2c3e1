//! Scripted in-memory transport for testing.
//!
//! [`MockTransport`] implements [`Transport`] without Bluetooth hardware.
//! Tests script what scans return, whether connects and subscriptions
//! succeed, and then drive the resulting [`MockConnection`]: inject
//! notification frames, inspect writes, and drop the link.
//!
//! # Features
//!
//! - **Failure injection**: failing connects, subscriptions and writes
//! - **Latency simulation**: write delay, to race writes against disconnects
//! - **Call log**: timestamps of every scan, connect and write

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ble::transport::{
    ChannelId, ChannelInfo, ChannelProperties, Link, NotificationHandler, PeripheralHandle,
    Transport,
};
use crate::error::{Error, Result};

/// Nordic UART service UUID, used by the default mock channel layout.
pub const UART_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e24dcca9e);
/// Write channel of the default layout (Nordic UART RX).
pub const UART_RX_UUID: Uuid = Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e24dcca9e);
/// Notify channel of the default layout (Nordic UART TX).
pub const UART_TX_UUID: Uuid = Uuid::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e24dcca9e);

/// The channel layout of a MATCHBOX roaster.
pub fn default_channels() -> Vec<ChannelInfo> {
    vec![
        ChannelInfo {
            id: UART_RX_UUID,
            service: UART_SERVICE_UUID,
            properties: ChannelProperties {
                write: true,
                write_without_response: true,
                ..Default::default()
            },
        },
        ChannelInfo {
            id: UART_TX_UUID,
            service: UART_SERVICE_UUID,
            properties: ChannelProperties {
                notify: true,
                ..Default::default()
            },
        },
    ]
}

/// A peripheral handle as a scan would report it.
pub fn peripheral(name: &str) -> PeripheralHandle {
    PeripheralHandle {
        id: format!("mock/{}", name),
        address: "00:11:22:33:44:55".to_string(),
        name: Some(name.to_string()),
        rssi: Some(-55),
    }
}

/// A write recorded by a [`MockConnection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    /// When the write completed.
    pub at: Instant,
    /// Target channel.
    pub channel: ChannelId,
    /// Bytes written.
    pub data: Vec<u8>,
    /// Whether an acknowledgement was requested.
    pub require_ack: bool,
}

/// A scripted transport.
pub struct MockTransport {
    devices: RwLock<Vec<PeripheralHandle>>,
    channels: RwLock<Vec<ChannelInfo>>,
    scans: Mutex<Vec<Instant>>,
    connects: Mutex<Vec<Instant>>,
    /// Number of upcoming connects that fail.
    connect_failures: AtomicU32,
    fail_subscribe: AtomicBool,
    write_delay: RwLock<Duration>,
    connection: RwLock<Option<Arc<MockConnection>>>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("devices", &self.devices.read().len())
            .field("scans", &self.scans.lock().len())
            .field("connects", &self.connects.lock().len())
            .finish()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create a transport whose scans find nothing.
    pub fn new() -> Self {
        Self {
            devices: RwLock::new(Vec::new()),
            channels: RwLock::new(default_channels()),
            scans: Mutex::new(Vec::new()),
            connects: Mutex::new(Vec::new()),
            connect_failures: AtomicU32::new(0),
            fail_subscribe: AtomicBool::new(false),
            write_delay: RwLock::new(Duration::ZERO),
            connection: RwLock::new(None),
        }
    }

    /// Create a transport whose scans find one peripheral called `name`.
    pub fn with_device(name: &str) -> Self {
        let transport = Self::new();
        transport.add_device(peripheral(name));
        transport
    }

    /// Make scans report `device`.
    pub fn add_device(&self, device: PeripheralHandle) {
        self.devices.write().push(device);
    }

    /// Replace the channel layout of future connections.
    pub fn set_channels(&self, channels: Vec<ChannelInfo>) {
        *self.channels.write() = channels;
    }

    /// Make the next `count` connects fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    /// Make subscriptions on future connections fail.
    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Delay every write on future connections by `delay`.
    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.write() = delay;
    }

    /// When each scan started.
    pub fn scan_times(&self) -> Vec<Instant> {
        self.scans.lock().clone()
    }

    /// When each connect was attempted.
    pub fn connect_times(&self) -> Vec<Instant> {
        self.connects.lock().clone()
    }

    /// The most recent successful connection.
    pub fn connection(&self) -> Option<Arc<MockConnection>> {
        self.connection.read().clone()
    }

}

#[async_trait]
impl Transport for MockTransport {
    async fn scan(&self, _timeout: Duration) -> Result<Vec<PeripheralHandle>> {
        self.scans.lock().push(Instant::now());
        Ok(self.devices.read().clone())
    }

    async fn connect(
        &self,
        peripheral: &PeripheralHandle,
        on_disconnect: CancellationToken,
    ) -> Result<Arc<dyn Link>> {
        self.connects.lock().push(Instant::now());

        let remaining = self.connect_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.connect_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(Error::Transport {
                reason: format!("injected connect failure for {}", peripheral.address),
            });
        }

        let connection = Arc::new(MockConnection {
            channels: self.channels.read().clone(),
            fail_subscribe: self.fail_subscribe.load(Ordering::SeqCst),
            fail_writes: AtomicBool::new(false),
            write_delay: *self.write_delay.read(),
            handlers: RwLock::new(Default::default()),
            writes: Mutex::new(Vec::new()),
            unsubscribed: AtomicBool::new(false),
            disconnected: AtomicBool::new(false),
            on_disconnect,
        });

        *self.connection.write() = Some(connection.clone());

        Ok(connection as Arc<dyn Link>)
    }
}

/// A connection handed out by [`MockTransport`].
pub struct MockConnection {
    channels: Vec<ChannelInfo>,
    fail_subscribe: bool,
    fail_writes: AtomicBool,
    write_delay: Duration,
    handlers: RwLock<std::collections::HashMap<ChannelId, NotificationHandler>>,
    writes: Mutex<Vec<RecordedWrite>>,
    unsubscribed: AtomicBool,
    disconnected: AtomicBool,
    on_disconnect: CancellationToken,
}

impl MockConnection {
    /// Deliver `frame` to every subscribed handler.
    pub fn notify(&self, frame: &[u8]) {
        let handlers: Vec<_> = self.handlers.read().values().cloned().collect();
        for handler in handlers {
            handler(frame);
        }
    }

    /// Simulate the peripheral going away.
    pub fn drop_link(&self) {
        self.on_disconnect.cancel();
    }

    /// Whether the link has dropped for any reason.
    pub fn is_dropped(&self) -> bool {
        self.on_disconnect.is_cancelled()
    }

    /// Make subsequent writes fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Every successful write so far.
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.writes.lock().clone()
    }

    /// Every successful write so far, as text.
    pub fn written_commands(&self) -> Vec<String> {
        self.writes
            .lock()
            .iter()
            .map(|w| String::from_utf8_lossy(&w.data).into_owned())
            .collect()
    }

    /// Whether a handler is registered.
    pub fn is_subscribed(&self) -> bool {
        !self.handlers.read().is_empty()
    }

    /// Whether `unsubscribe` was called.
    pub fn was_unsubscribed(&self) -> bool {
        self.unsubscribed.load(Ordering::SeqCst)
    }

    /// Whether `disconnect` was called.
    pub fn was_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Link for MockConnection {
    async fn list_channels(&self) -> Result<Vec<ChannelInfo>> {
        Ok(self.channels.clone())
    }

    async fn subscribe(&self, channel: ChannelId, on_notify: NotificationHandler) -> Result<()> {
        if self.fail_subscribe {
            return Err(Error::Transport {
                reason: "injected subscribe failure".to_string(),
            });
        }
        self.handlers.write().insert(channel, on_notify);
        Ok(())
    }

    async fn unsubscribe(&self, channel: ChannelId) -> Result<()> {
        self.handlers.write().remove(&channel);
        self.unsubscribed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn write(&self, channel: ChannelId, data: &[u8], require_ack: bool) -> Result<()> {
        if !self.write_delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.write_delay) => {}
                _ = self.on_disconnect.cancelled() => {
                    return Err(Error::Transport {
                        reason: "link dropped during write".to_string(),
                    });
                }
            }
        }

        if self.on_disconnect.is_cancelled() {
            return Err(Error::NotConnected);
        }

        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::Transport {
                reason: "injected write failure".to_string(),
            });
        }

        self.writes.lock().push(RecordedWrite {
            at: Instant::now(),
            channel,
            data: data.to_vec(),
            require_ack,
        });

        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        self.on_disconnect.cancel();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scan_reports_devices() {
        let transport = MockTransport::with_device("MATCHBOX-01");
        let found = transport.scan(Duration::from_secs(5)).await.unwrap();
        assert_eq!(found.len(), 1);
        assert!(found[0].matches_prefix("MATCHBOX"));
        assert_eq!(transport.scan_times().len(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_injection() {
        let transport = MockTransport::with_device("MATCHBOX-01");
        transport.fail_next_connects(1);

        let device = peripheral("MATCHBOX-01");
        assert!(transport
            .connect(&device, CancellationToken::new())
            .await
            .is_err());
        assert!(transport
            .connect(&device, CancellationToken::new())
            .await
            .is_ok());
        assert_eq!(transport.connect_times().len(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_token() {
        let transport = MockTransport::with_device("MATCHBOX-01");
        let token = CancellationToken::new();
        let link = transport
            .connect(&peripheral("MATCHBOX-01"), token.clone())
            .await
            .unwrap();

        link.disconnect().await.unwrap();
        assert!(token.is_cancelled());
        assert!(transport.connection().unwrap().was_disconnected());
    }
}
