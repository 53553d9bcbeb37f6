//! iOS/macOS peripheral bridge: FFI declarations mirroring
//! `CBPeripheralManager`/`CBMutableService`/`CBMutableCharacteristic`.
//!
//! Interface-level only, per the component design: no linkage to a real
//! Core Bluetooth runtime is possible from this crate alone (Core Bluetooth
//! is driven from the Swift/Obj-C host app's run loop, not a Rust binary).
//! The host app owns a `CBPeripheralManager` and calls back into this
//! bridge; until that wiring exists, every operation reports `Unsupported`.

use std::os::raw::c_void;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::types::PeerId;

use super::{BlePeripheralBridge, GattServerEvents};

/// Opaque pointer to a host-owned `CBPeripheralManager`.
#[repr(C)]
pub struct CBPeripheralManager(pub *mut c_void);

/// Opaque pointer to a host-owned `CBMutableService`.
#[repr(C)]
pub struct CBMutableService(pub *mut c_void);

/// Opaque pointer to a host-owned `CBMutableCharacteristic`.
#[repr(C)]
pub struct CBMutableCharacteristic(pub *mut c_void);

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CBManagerState {
    Unknown = 0,
    Resetting = 1,
    Unsupported = 2,
    Unauthorized = 3,
    PoweredOff = 4,
    PoweredOn = 5,
}

#[repr(C)]
pub enum CBCharacteristicProperties {
    Read = 0x02,
    WriteWithoutResponse = 0x04,
    Write = 0x08,
    Notify = 0x10,
}

#[repr(C)]
pub enum CBAttributePermissions {
    Readable = 0x01,
    Writeable = 0x02,
}

/// Bridge handed a `CBPeripheralManager` pointer by the host app once its
/// delegate reports `poweredOn`. Until `attach_peripheral_manager` is
/// called, every operation is `Unsupported` — this is the expected state
/// for any build of this crate that is not embedded in the Swift host.
pub struct AppleBlePeripheralBridge {
    manager: std::sync::Mutex<Option<CBPeripheralManagerHandle>>,
    advertising: AtomicBool,
}

struct CBPeripheralManagerHandle {
    #[allow(dead_code)]
    manager: CBPeripheralManager,
    state: CBManagerState,
}

// SAFETY: the opaque pointer is only ever touched on the host app's main
// run loop via FFI calls that the host serializes; this crate treats it as
// an inert handle and never dereferences it directly.
unsafe impl Send for CBPeripheralManagerHandle {}

impl AppleBlePeripheralBridge {
    pub fn new() -> Self {
        Self { manager: std::sync::Mutex::new(None), advertising: AtomicBool::new(false) }
    }

    /// Called by the host app's Core Bluetooth delegate once its
    /// `CBPeripheralManager` reaches `poweredOn`. Not part of the
    /// `BlePeripheralBridge` trait since no other platform needs it.
    pub fn attach_peripheral_manager(&self, manager: CBPeripheralManager, state: CBManagerState) {
        *self.manager.lock().unwrap() = Some(CBPeripheralManagerHandle { manager, state });
    }
}

#[async_trait]
impl BlePeripheralBridge for AppleBlePeripheralBridge {
    fn is_available(&self) -> bool {
        matches!(
            self.manager.lock().unwrap().as_ref().map(|h| h.state),
            Some(CBManagerState::PoweredOn)
        )
    }

    async fn start_advertising(&self, _identity_payload: Vec<u8>) -> Result<()> {
        if !self.is_available() {
            return Err(Error::Unsupported(
                "no CBPeripheralManager attached by the host app (interface-level bridge)".into(),
            ));
        }
        // Would call `startAdvertising:` with `CBAdvertisementDataServiceUUIDsKey`
        // and a service-data dictionary carrying `_identity_payload`.
        self.advertising.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        self.advertising.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn start_gatt_server(&self, _events: std::sync::Arc<dyn GattServerEvents>) -> Result<()> {
        if !self.is_available() {
            return Err(Error::Unsupported(
                "no CBPeripheralManager attached by the host app (interface-level bridge)".into(),
            ));
        }
        // Would construct `CBMutableService`/`CBMutableCharacteristic`
        // objects for Message/Sync/Identity and call `add:`; delegate
        // callbacks (`didReceiveWrite:`, `didSubscribeTo:`) are expected to
        // be forwarded into `_events` by the host app's delegate shim.
        Ok(())
    }

    async fn stop_gatt_server(&self) -> Result<()> {
        Ok(())
    }

    async fn notify_sync(&self, _central: &PeerId, _bytes: Vec<u8>) -> Result<()> {
        Err(Error::Unsupported(
            "no CBPeripheralManager attached by the host app (interface-level bridge)".into(),
        ))
    }

    async fn set_identity_snapshot(&self, _bytes: Vec<u8>) -> Result<()> {
        Ok(())
    }
}
