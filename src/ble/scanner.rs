//! BLE scanning and connection on top of btleplug.
//!
//! Provides [`BleScanner`], the Bluetooth implementation of [`Transport`].

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::ble::characteristics::BleLink;
use crate::ble::transport::{Link, PeripheralHandle, Transport};
use crate::error::{Error, Result};

/// BLE scanner and connector for the roaster.
pub struct BleScanner {
    /// The BLE adapter to use for scanning.
    adapter: Adapter,
    /// Peripherals seen by the last scans, by identifier.
    discovered: Arc<RwLock<HashMap<String, Peripheral>>>,
}

impl BleScanner {
    /// Create a new BLE scanner on the first available adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Create a new BLE scanner with a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            discovered: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Build a handle for a peripheral from its advertised properties.
    async fn describe(peripheral: &Peripheral) -> Option<PeripheralHandle> {
        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            Ok(None) => return None,
            Err(e) => {
                trace!("Failed to read peripheral properties: {}", e);
                return None;
            }
        };

        Some(PeripheralHandle {
            id: peripheral.id().to_string(),
            address: properties.address.to_string(),
            name: properties.local_name,
            rssi: properties.rssi,
        })
    }

    /// Cancel `on_disconnect` once the adapter reports the peripheral gone.
    fn watch_disconnect(
        mut events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
        peripheral_id: btleplug::platform::PeripheralId,
        on_disconnect: CancellationToken,
    ) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = on_disconnect.cancelled() => break,
                    event = events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => {
                            info!("Peripheral {} disconnected", id);
                            on_disconnect.cancel();
                            break;
                        }
                        Some(_) => {}
                        None => {
                            warn!("Adapter event stream ended, treating link as lost");
                            on_disconnect.cancel();
                            break;
                        }
                    }
                }
            }

            debug!("Disconnect watcher ended");
        });
    }
}

#[async_trait]
impl Transport for BleScanner {
    async fn scan(&self, timeout: Duration) -> Result<Vec<PeripheralHandle>> {
        debug!("Scanning for {:?}", timeout);

        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(Error::Bluetooth)?;

        tokio::time::sleep(timeout).await;

        let peripherals = self.adapter.peripherals().await;

        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        let mut handles = Vec::new();
        let mut discovered = HashMap::new();

        for peripheral in peripherals.map_err(Error::Bluetooth)? {
            if let Some(handle) = Self::describe(&peripheral).await {
                trace!("Seen {:?} ({})", handle.name, handle.address);
                discovered.insert(handle.id.clone(), peripheral);
                handles.push(handle);
            }
        }

        debug!("Scan found {} peripherals", handles.len());
        *self.discovered.write() = discovered;

        Ok(handles)
    }

    async fn connect(
        &self,
        handle: &PeripheralHandle,
        on_disconnect: CancellationToken,
    ) -> Result<Arc<dyn Link>> {
        let peripheral = self
            .discovered
            .read()
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| Error::Transport {
                reason: format!("peripheral {} is no longer known", handle.address),
            })?;

        // Listen before connecting so an immediate drop is not missed.
        let events = self.adapter.events().await.map_err(Error::Bluetooth)?;

        peripheral.connect().await.map_err(Error::Bluetooth)?;
        info!("Connected to {:?} ({})", handle.name, handle.address);

        if let Err(e) = peripheral.discover_services().await {
            let _ = peripheral.disconnect().await;
            return Err(Error::Bluetooth(e));
        }

        Self::watch_disconnect(events, peripheral.id(), on_disconnect.clone());

        let link: Arc<dyn Link> = Arc::new(BleLink::new(peripheral, on_disconnect));
        Ok(link)
    }
}
