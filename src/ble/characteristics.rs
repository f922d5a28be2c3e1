//! GATT characteristic handling.
//!
//! Provides [`BleLink`], the Bluetooth implementation of [`Link`]: channel
//! listing, writes, and notification routing for one connected peripheral.

use async_trait::async_trait;
use btleplug::api::{CharPropFlags, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::Peripheral;
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::ble::transport::{ChannelId, ChannelInfo, ChannelProperties, Link, NotificationHandler};
use crate::error::{Error, Result};

/// Map btleplug property flags onto channel capabilities.
fn channel_properties(flags: CharPropFlags) -> ChannelProperties {
    ChannelProperties {
        read: flags.contains(CharPropFlags::READ),
        write: flags.contains(CharPropFlags::WRITE),
        write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
        notify: flags.contains(CharPropFlags::NOTIFY) || flags.contains(CharPropFlags::INDICATE),
    }
}

/// A connected roaster peripheral.
pub struct BleLink {
    /// The peripheral to communicate with.
    peripheral: Peripheral,
    /// Cached characteristics by UUID.
    characteristics: Arc<RwLock<HashMap<Uuid, Characteristic>>>,
    /// Notification handlers by characteristic UUID.
    handlers: Arc<RwLock<HashMap<Uuid, NotificationHandler>>>,
    /// Cancelled when the link drops; stops the listener task.
    on_disconnect: CancellationToken,
    /// Handle to the notification listener task.
    listener_handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl BleLink {
    /// Wrap a connected peripheral whose services have been discovered.
    pub fn new(peripheral: Peripheral, on_disconnect: CancellationToken) -> Self {
        Self {
            peripheral,
            characteristics: Arc::new(RwLock::new(HashMap::new())),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            on_disconnect,
            listener_handle: RwLock::new(None),
        }
    }

    /// Look up a characteristic discovered by [`Link::list_channels`].
    fn characteristic(&self, uuid: &Uuid) -> Result<Characteristic> {
        self.characteristics
            .read()
            .get(uuid)
            .cloned()
            .ok_or_else(|| Error::Transport {
                reason: format!("characteristic {} not found", uuid),
            })
    }

    /// Start the task that routes notifications to handlers.
    async fn ensure_listener(&self) -> Result<()> {
        if self.listener_handle.read().is_some() {
            return Ok(());
        }

        let mut notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(Error::Bluetooth)?;

        let handlers = self.handlers.clone();
        let on_disconnect = self.on_disconnect.clone();

        let handle = tokio::spawn(async move {
            debug!("Notification listener started");

            loop {
                tokio::select! {
                    _ = on_disconnect.cancelled() => break,
                    notification = notifications.next() => {
                        let Some(notification) = notification else {
                            warn!("Notification stream ended");
                            break;
                        };

                        trace!(
                            "Notification from {}: {} bytes",
                            notification.uuid,
                            notification.value.len()
                        );

                        let handler = handlers.read().get(&notification.uuid).cloned();
                        match handler {
                            Some(handler) => handler(&notification.value),
                            None => trace!("No handler for {}", notification.uuid),
                        }
                    }
                }
            }

            debug!("Notification listener stopped");
        });

        *self.listener_handle.write() = Some(handle);

        Ok(())
    }
}

#[async_trait]
impl Link for BleLink {
    async fn list_channels(&self) -> Result<Vec<ChannelInfo>> {
        let services = self.peripheral.services();

        let mut channels = Vec::new();
        let mut chars = self.characteristics.write();
        chars.clear();

        for service in services {
            for characteristic in service.characteristics {
                debug!(
                    "Found characteristic: {} in service {} ({:?})",
                    characteristic.uuid, service.uuid, characteristic.properties
                );
                channels.push(ChannelInfo {
                    id: characteristic.uuid,
                    service: service.uuid,
                    properties: channel_properties(characteristic.properties),
                });
                chars.insert(characteristic.uuid, characteristic);
            }
        }

        debug!("Discovered {} characteristics", chars.len());

        Ok(channels)
    }

    async fn subscribe(&self, channel: ChannelId, on_notify: NotificationHandler) -> Result<()> {
        let characteristic = self.characteristic(&channel)?;

        self.handlers.write().insert(channel, on_notify);
        self.ensure_listener().await?;

        self.peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| {
                debug!("Failed to subscribe to {}: {:?}", channel, e);
                self.handlers.write().remove(&channel);
                Error::Bluetooth(e)
            })?;

        debug!("Subscribed to notifications from {}", channel);

        Ok(())
    }

    async fn unsubscribe(&self, channel: ChannelId) -> Result<()> {
        let characteristic = self.characteristic(&channel)?;
        self.handlers.write().remove(&channel);

        self.peripheral
            .unsubscribe(&characteristic)
            .await
            .map_err(Error::Bluetooth)?;

        debug!("Unsubscribed from notifications from {}", channel);

        Ok(())
    }

    async fn write(&self, channel: ChannelId, data: &[u8], require_ack: bool) -> Result<()> {
        let characteristic = self.characteristic(&channel)?;

        let write_type = if require_ack {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };

        self.peripheral
            .write(&characteristic, data, write_type)
            .await
            .map_err(|e| Error::Transport {
                reason: e.to_string(),
            })?;

        trace!("Wrote {} bytes to characteristic {}", data.len(), channel);

        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let result = self.peripheral.disconnect().await;
        self.on_disconnect.cancel();

        if let Some(handle) = self.listener_handle.write().take() {
            handle.abort();
        }

        result.map_err(|e| {
            error!("Failed to disconnect: {}", e);
            Error::Bluetooth(e)
        })
    }
}

impl Drop for BleLink {
    fn drop(&mut self) {
        if let Some(handle) = self.listener_handle.get_mut().take() {
            handle.abort();
        }
    }
}
