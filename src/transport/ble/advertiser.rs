//! BLE advertiser: emits the connectable service advertisement and owns
//! privacy rotation of the identity token.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

use super::constants::{DEFAULT_PRIVACY_ROTATION_SECS, MAX_ADVERTISED_IDENTITY_BYTES};
use super::BlePeripheralBridge;

pub struct BleAdvertiser<B: BlePeripheralBridge + 'static> {
    bridge: Arc<B>,
    identity_data: RwLock<Vec<u8>>,
    rotation_interval: RwLock<Duration>,
    rotation_enabled: AtomicBool,
    advertising: AtomicBool,
    rotation_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl<B: BlePeripheralBridge + 'static> BleAdvertiser<B> {
    pub fn new(bridge: Arc<B>) -> Self {
        Self {
            bridge,
            identity_data: RwLock::new(Vec::new()),
            rotation_interval: RwLock::new(Duration::from_secs(DEFAULT_PRIVACY_ROTATION_SECS)),
            rotation_enabled: AtomicBool::new(false),
            advertising: AtomicBool::new(false),
            rotation_task: AsyncMutex::new(None),
        }
    }

    /// Sets the advertised identity token. Rejects payloads over the
    /// 24-byte advertised-identity bound.
    pub fn set_identity_data(&self, bytes: Vec<u8>) -> Result<()> {
        if bytes.len() > MAX_ADVERTISED_IDENTITY_BYTES {
            return Err(Error::Protocol(format!(
                "identity payload of {} bytes exceeds the {}-byte advertised bound",
                bytes.len(),
                MAX_ADVERTISED_IDENTITY_BYTES
            )));
        }
        *self.identity_data.write() = bytes;
        Ok(())
    }

    pub fn set_rotation_interval(&self, secs: u64) {
        *self.rotation_interval.write() = Duration::from_secs(secs.max(1));
    }

    pub fn set_rotation_enabled(&self, enabled: bool) {
        self.rotation_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_advertising(&self) -> bool {
        self.advertising.load(Ordering::SeqCst)
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if !self.bridge.is_available() {
            return Err(Error::Unsupported("no BLE peripheral bridge on this platform".into()));
        }
        let payload = self.identity_data.read().clone();
        self.bridge.start_advertising(payload).await?;
        self.advertising.store(true, Ordering::SeqCst);

        if self.rotation_enabled.load(Ordering::SeqCst) {
            self.spawn_rotation_task().await;
        }
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(handle) = self.rotation_task.lock().await.take() {
            handle.abort();
        }
        if self.advertising.swap(false, Ordering::SeqCst) {
            self.bridge.stop_advertising().await?;
        }
        Ok(())
    }

    async fn spawn_rotation_task(self: &Arc<Self>) {
        let interval = *self.rotation_interval.read();
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                if let Err(err) = this.rotate().await {
                    log::warn!("BLE advertiser rotation tick failed: {err}");
                }
            }
        });
        *self.rotation_task.lock().await = Some(handle);
    }

    /// Stops advertising, rebuilds the payload with the current identity
    /// token, and restarts. The token itself is provided by the core via
    /// `set_identity_data`; this layer only re-advertises it.
    async fn rotate(&self) -> Result<()> {
        if !self.advertising.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.bridge.stop_advertising().await?;
        let payload = self.identity_data.read().clone();
        self.bridge.start_advertising(payload).await?;
        log::debug!("BLE advertiser rotated identity token");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ble::NullBlePeripheralBridge;

    #[test]
    fn identity_payload_at_exactly_24_bytes_is_accepted() {
        let advertiser = BleAdvertiser::new(Arc::new(NullBlePeripheralBridge));
        assert!(advertiser.set_identity_data(vec![0u8; 24]).is_ok());
    }

    #[test]
    fn identity_payload_at_25_bytes_is_rejected() {
        let advertiser = BleAdvertiser::new(Arc::new(NullBlePeripheralBridge));
        assert!(advertiser.set_identity_data(vec![0u8; 25]).is_err());
    }

    #[tokio::test]
    async fn start_on_unsupported_bridge_reports_unsupported() {
        let advertiser = Arc::new(BleAdvertiser::new(Arc::new(NullBlePeripheralBridge)));
        let result = advertiser.start().await;
        assert!(matches!(result, Err(Error::Unsupported(_))));
        assert!(!advertiser.is_advertising());
    }
}
