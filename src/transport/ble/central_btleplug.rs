//! Cross-platform BLE central role (scan + GATT client) over `btleplug`.
//! Covers Linux, macOS, Windows, iOS; never built for Android, where
//! btleplug has no central-role backend (see `default_central_bridge`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::PeerId;

use super::constants::{IDENTITY_CHAR_UUID, MESSAGE_CHAR_UUID, SYNC_CHAR_UUID};
use super::scanner::ScanEventTarget;
use super::{BleCentralBridge, GattClientEvents};

const SCAN_SETTLE: Duration = Duration::from_millis(500);

struct DiscoveredPeripheral {
    peripheral: Peripheral,
    message_char: Characteristic,
    sync_char: Characteristic,
    identity_char: Characteristic,
}

pub struct BtleplugCentralBridge {
    adapter: AsyncMutex<Option<Adapter>>,
    peripherals: RwLock<HashMap<PeerId, DiscoveredPeripheral>>,
    events: RwLock<Option<Arc<dyn GattClientEvents>>>,
}

impl BtleplugCentralBridge {
    pub fn new() -> Self {
        Self {
            adapter: AsyncMutex::new(None),
            peripherals: RwLock::new(HashMap::new()),
            events: RwLock::new(None),
        }
    }

    async fn adapter(&self) -> Result<Adapter> {
        let mut guard = self.adapter.lock().await;
        if let Some(adapter) = guard.as_ref() {
            return Ok(adapter.clone());
        }
        let manager = Manager::new()
            .await
            .map_err(|e| Error::Platform(format!("failed to initialize btleplug manager: {e}")))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| Error::Platform(format!("failed to enumerate adapters: {e}")))?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Unsupported("no Bluetooth adapter available".into()))?;
        *guard = Some(adapter.clone());
        Ok(adapter)
    }

    /// Finds a previously discovered and connected peripheral by address,
    /// matching the identifier the scanner handed out in `on_advertisement`.
    fn find(&self, peripheral: &PeerId) -> Option<Peripheral> {
        self.peripherals.read().get(peripheral).map(|p| p.peripheral.clone())
    }

    fn characteristic(&self, peripheral: &PeerId, uuid: Uuid) -> Result<Characteristic> {
        let guard = self.peripherals.read();
        let entry = guard
            .get(peripheral)
            .ok_or_else(|| Error::Lifecycle(format!("{peripheral} is not connected")))?;
        let found = if uuid == MESSAGE_CHAR_UUID {
            entry.message_char.clone()
        } else if uuid == SYNC_CHAR_UUID {
            entry.sync_char.clone()
        } else {
            entry.identity_char.clone()
        };
        Ok(found)
    }
}

#[async_trait]
impl BleCentralBridge for BtleplugCentralBridge {
    fn is_available(&self) -> bool {
        true
    }

    async fn start_scan(&self, service_uuid: Uuid, target: Arc<dyn ScanEventTarget>) -> Result<()> {
        let adapter = self.adapter().await?;
        adapter
            .start_scan(ScanFilter { services: vec![service_uuid] })
            .await
            .map_err(|e| Error::TransientIo(format!("failed to start scan: {e}")))?;

        // btleplug's central role is polling-based rather than
        // callback-based on every backend; a short-lived poll loop turns
        // freshly-seen peripherals into `on_advertisement` calls, folding
        // the rediscovery of already-known peripherals into the scanner's
        // own dedup cache.
        let adapter_poll = adapter.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SCAN_SETTLE).await;
                let Ok(peripherals) = adapter_poll.peripherals().await else {
                    continue;
                };
                for peripheral in peripherals {
                    if let Ok(Some(props)) = peripheral.properties().await {
                        if props.services.contains(&service_uuid) {
                            target.on_advertisement(PeerId::from(peripheral.id().to_string()));
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        let adapter = self.adapter().await?;
        adapter
            .stop_scan()
            .await
            .map_err(|e| Error::TransientIo(format!("failed to stop scan: {e}")))
    }

    async fn connect(&self, peripheral_id: &PeerId, events: Arc<dyn GattClientEvents>) -> Result<()> {
        *self.events.write() = Some(events);

        let adapter = self.adapter().await?;
        let peripheral = adapter
            .peripherals()
            .await
            .map_err(|e| Error::TransientIo(format!("failed to list peripherals: {e}")))?
            .into_iter()
            .find(|p| p.id().to_string() == peripheral_id.as_str())
            .ok_or_else(|| Error::Protocol(format!("{peripheral_id} is no longer visible")))?;

        peripheral
            .connect()
            .await
            .map_err(|e| Error::TransientIo(format!("connect to {peripheral_id} failed: {e}")))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| Error::Protocol(format!("service discovery on {peripheral_id} failed: {e}")))?;

        let chars = peripheral.characteristics();
        let message_char = chars
            .iter()
            .find(|c| c.uuid == MESSAGE_CHAR_UUID)
            .cloned()
            .ok_or_else(|| Error::Protocol(format!("{peripheral_id} has no Message characteristic")))?;
        let sync_char = chars
            .iter()
            .find(|c| c.uuid == SYNC_CHAR_UUID)
            .cloned()
            .ok_or_else(|| Error::Protocol(format!("{peripheral_id} has no Sync characteristic")))?;
        let identity_char = chars
            .iter()
            .find(|c| c.uuid == IDENTITY_CHAR_UUID)
            .cloned()
            .ok_or_else(|| Error::Protocol(format!("{peripheral_id} has no Identity characteristic")))?;

        self.peripherals.write().insert(
            peripheral_id.clone(),
            DiscoveredPeripheral { peripheral, message_char, sync_char, identity_char },
        );
        Ok(())
    }

    async fn disconnect(&self, peripheral_id: &PeerId) -> Result<()> {
        if let Some(entry) = self.peripherals.write().remove(peripheral_id) {
            let _ = entry.peripheral.disconnect().await;
        }
        Ok(())
    }

    async fn request_mtu(&self, _peripheral: &PeerId, mtu: u16) -> Result<u16> {
        // btleplug exposes no MTU negotiation API on any backend; the OS
        // stack negotiates it transparently on connect, so the requested
        // value is reported back as granted and the fragment size is
        // clamped against `MAX_MTU` regardless.
        Ok(mtu)
    }

    async fn discover_mesh_service(&self, peripheral: &PeerId) -> Result<bool> {
        Ok(self.find(peripheral).is_some())
    }

    async fn read_identity(&self, peripheral: &PeerId) -> Result<Vec<u8>> {
        let p = self.find(peripheral).ok_or_else(|| Error::Lifecycle(format!("{peripheral} is not connected")))?;
        let characteristic = self.characteristic(peripheral, IDENTITY_CHAR_UUID)?;
        p.read(&characteristic)
            .await
            .map_err(|e| Error::TransientIo(format!("Identity read from {peripheral} failed: {e}")))
    }

    async fn subscribe_messages(&self, peripheral: &PeerId) -> Result<()> {
        let p = self.find(peripheral).ok_or_else(|| Error::Lifecycle(format!("{peripheral} is not connected")))?;
        let characteristic = self.characteristic(peripheral, MESSAGE_CHAR_UUID)?;
        p.subscribe(&characteristic)
            .await
            .map_err(|e| Error::TransientIo(format!("subscribe on {peripheral} failed: {e}")))?;

        let mut stream = p
            .notifications()
            .await
            .map_err(|e| Error::TransientIo(format!("notification stream for {peripheral} failed: {e}")))?;
        let events = self.events.read().clone();
        let peripheral_id = peripheral.clone();
        tokio::spawn(async move {
            use futures::StreamExt;
            while let Some(notification) = stream.next().await {
                if let Some(events) = events.as_ref() {
                    events.on_message_notification(peripheral_id.clone(), notification.value);
                }
            }
            if let Some(events) = events.as_ref() {
                events.on_disconnected(peripheral_id);
            }
        });
        Ok(())
    }

    async fn write_message(&self, peripheral: &PeerId, fragment: Vec<u8>, with_response: bool) -> Result<()> {
        let p = self.find(peripheral).ok_or_else(|| Error::Lifecycle(format!("{peripheral} is not connected")))?;
        let characteristic = self.characteristic(peripheral, MESSAGE_CHAR_UUID)?;
        let write_type = if with_response { WriteType::WithResponse } else { WriteType::WithoutResponse };
        p.write(&characteristic, &fragment, write_type)
            .await
            .map_err(|e| Error::TransientIo(format!("write to {peripheral} failed: {e}")))
    }
}
