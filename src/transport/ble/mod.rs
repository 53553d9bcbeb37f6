//! BLE subsystem: advertiser, scanner, GATT server/client, L2CAP, and the
//! platform bridges that back the peripheral (advertise + GATT server) and
//! central (scan + GATT client) roles on each OS.
//!
//! The peripheral role has no cross-platform crate (btleplug has no
//! peripheral mode), so it is implemented per-OS behind `BlePeripheralBridge`
//! (Android JNI, Linux BlueZ D-Bus, iOS/macOS Core Bluetooth FFI). The
//! central role is implemented once, cross-platform, over `btleplug`, behind
//! `BleCentralBridge`; Android falls back to `NullBleCentralBridge` since
//! btleplug does not support it there.

pub mod advertiser;
pub mod constants;
pub mod fragment;
pub mod gatt_client;
pub mod gatt_server;
pub mod l2cap;
pub mod transport;

#[cfg(target_os = "android")]
pub mod android;
#[cfg(any(target_os = "ios", target_os = "macos"))]
pub mod apple;
#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(not(target_os = "android"))]
pub mod central_btleplug;

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::PeerId;

use scanner::ScanEventTarget;

pub mod scanner;

/// OS bridge for the BLE peripheral role: advertising and the GATT server.
/// One implementation per OS (see module-level docs); `NullBlePeripheralBridge`
/// is the fallback on any target without a concrete bridge, reporting
/// `Unsupported` on every call per the crate's error taxonomy.
#[async_trait]
pub trait BlePeripheralBridge: Send + Sync {
    fn is_available(&self) -> bool;

    async fn start_advertising(&self, identity_payload: Vec<u8>) -> Result<()>;
    async fn stop_advertising(&self) -> Result<()>;

    /// Publishes the three mesh characteristics and begins accepting writes
    /// and subscriptions, dispatching events to `events`.
    async fn start_gatt_server(&self, events: Arc<dyn GattServerEvents>) -> Result<()>;
    async fn stop_gatt_server(&self) -> Result<()>;

    /// Routes `bytes` to a subscribed central via the Sync characteristic.
    async fn notify_sync(&self, central: &PeerId, bytes: Vec<u8>) -> Result<()>;

    /// Replaces the snapshot returned by reads of the Identity characteristic.
    async fn set_identity_snapshot(&self, bytes: Vec<u8>) -> Result<()>;
}

/// Callbacks the peripheral bridge drives into `BleGattServer`. Kept
/// separate from `BlePeripheralBridge` itself so bridge implementations
/// never need to know about fragment reassembly.
pub trait GattServerEvents: Send + Sync {
    fn on_message_write(&self, central: PeerId, fragment: Vec<u8>);
    fn on_central_subscribed(&self, central: PeerId);
    fn on_central_unsubscribed(&self, central: PeerId);
}

/// OS bridge for the BLE central role: scanning and the GATT client.
/// Implemented once over `btleplug` (see `central_btleplug`); falls back to
/// `NullBleCentralBridge` wherever btleplug is unavailable (Android).
#[async_trait]
pub trait BleCentralBridge: Send + Sync {
    fn is_available(&self) -> bool;

    async fn start_scan(&self, service_uuid: Uuid, target: Arc<dyn ScanEventTarget>) -> Result<()>;
    async fn stop_scan(&self) -> Result<()>;

    async fn connect(&self, peripheral: &PeerId, events: Arc<dyn GattClientEvents>) -> Result<()>;
    async fn disconnect(&self, peripheral: &PeerId) -> Result<()>;

    /// Requests `mtu`; returns the MTU the peripheral actually granted.
    async fn request_mtu(&self, peripheral: &PeerId, mtu: u16) -> Result<u16>;

    /// Discovers services; returns whether the mesh service UUID was found.
    async fn discover_mesh_service(&self, peripheral: &PeerId) -> Result<bool>;

    async fn read_identity(&self, peripheral: &PeerId) -> Result<Vec<u8>>;
    async fn subscribe_messages(&self, peripheral: &PeerId) -> Result<()>;
    async fn write_message(
        &self,
        peripheral: &PeerId,
        fragment: Vec<u8>,
        with_response: bool,
    ) -> Result<()>;
}

/// Callbacks the central bridge drives into `BleGattClient`: unsolicited
/// notifications and OS-initiated disconnects.
pub trait GattClientEvents: Send + Sync {
    fn on_message_notification(&self, peripheral: PeerId, fragment: Vec<u8>);
    fn on_disconnected(&self, peripheral: PeerId);
}

/// Reports every capability absent. Used wherever no concrete peripheral
/// bridge exists for the build target, and as a test fixture.
pub struct NullBlePeripheralBridge;

#[async_trait]
impl BlePeripheralBridge for NullBlePeripheralBridge {
    fn is_available(&self) -> bool {
        false
    }

    async fn start_advertising(&self, _identity_payload: Vec<u8>) -> Result<()> {
        Err(Error::Unsupported("no BLE peripheral bridge on this platform".into()))
    }

    async fn stop_advertising(&self) -> Result<()> {
        Ok(())
    }

    async fn start_gatt_server(&self, _events: Arc<dyn GattServerEvents>) -> Result<()> {
        Err(Error::Unsupported("no BLE peripheral bridge on this platform".into()))
    }

    async fn stop_gatt_server(&self) -> Result<()> {
        Ok(())
    }

    async fn notify_sync(&self, _central: &PeerId, _bytes: Vec<u8>) -> Result<()> {
        Err(Error::Unsupported("no BLE peripheral bridge on this platform".into()))
    }

    async fn set_identity_snapshot(&self, _bytes: Vec<u8>) -> Result<()> {
        Err(Error::Unsupported("no BLE peripheral bridge on this platform".into()))
    }
}

/// Reports every capability absent. Default on Android, where btleplug has
/// no central-role support, and a test fixture elsewhere.
pub struct NullBleCentralBridge;

#[async_trait]
impl BleCentralBridge for NullBleCentralBridge {
    fn is_available(&self) -> bool {
        false
    }

    async fn start_scan(&self, _service_uuid: Uuid, _target: Arc<dyn ScanEventTarget>) -> Result<()> {
        Err(Error::Unsupported("no BLE central bridge on this platform".into()))
    }

    async fn stop_scan(&self) -> Result<()> {
        Ok(())
    }

    async fn connect(&self, _peripheral: &PeerId, _events: Arc<dyn GattClientEvents>) -> Result<()> {
        Err(Error::Unsupported("no BLE central bridge on this platform".into()))
    }

    async fn disconnect(&self, _peripheral: &PeerId) -> Result<()> {
        Ok(())
    }

    async fn request_mtu(&self, _peripheral: &PeerId, _mtu: u16) -> Result<u16> {
        Err(Error::Unsupported("no BLE central bridge on this platform".into()))
    }

    async fn discover_mesh_service(&self, _peripheral: &PeerId) -> Result<bool> {
        Err(Error::Unsupported("no BLE central bridge on this platform".into()))
    }

    async fn read_identity(&self, _peripheral: &PeerId) -> Result<Vec<u8>> {
        Err(Error::Unsupported("no BLE central bridge on this platform".into()))
    }

    async fn subscribe_messages(&self, _peripheral: &PeerId) -> Result<()> {
        Err(Error::Unsupported("no BLE central bridge on this platform".into()))
    }

    async fn write_message(
        &self,
        _peripheral: &PeerId,
        _fragment: Vec<u8>,
        _with_response: bool,
    ) -> Result<()> {
        Err(Error::Unsupported("no BLE central bridge on this platform".into()))
    }
}

/// Constructs the peripheral bridge for the current build target.
pub fn default_peripheral_bridge() -> Arc<dyn BlePeripheralBridge> {
    #[cfg(target_os = "android")]
    {
        Arc::new(android::AndroidBlePeripheralBridge::new())
    }
    #[cfg(target_os = "linux")]
    {
        Arc::new(linux::LinuxBlePeripheralBridge::new())
    }
    #[cfg(any(target_os = "ios", target_os = "macos"))]
    {
        Arc::new(apple::AppleBlePeripheralBridge::new())
    }
    #[cfg(not(any(
        target_os = "android",
        target_os = "linux",
        target_os = "ios",
        target_os = "macos"
    )))]
    {
        Arc::new(NullBlePeripheralBridge)
    }
}

/// Constructs the central bridge for the current build target.
pub fn default_central_bridge() -> Arc<dyn BleCentralBridge> {
    #[cfg(not(target_os = "android"))]
    {
        Arc::new(central_btleplug::BtleplugCentralBridge::new())
    }
    #[cfg(target_os = "android")]
    {
        Arc::new(NullBleCentralBridge)
    }
}
