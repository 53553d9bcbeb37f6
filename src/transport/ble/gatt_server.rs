//! BLE GATT server: hosts the Message/Sync/Identity characteristics,
//! reassembles incoming writes, and routes outbound notifications.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashSet;
use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::types::{Frame, PeerId};

use super::fragment::Reassembler;
use super::{BlePeripheralBridge, GattServerEvents};

/// Where a fully-reassembled frame written by a central is delivered.
pub trait GattServerSink: Send + Sync {
    fn on_data_received(&self, central: &PeerId, frame: Frame);
}

pub struct BleGattServer<B: BlePeripheralBridge + 'static> {
    bridge: Arc<B>,
    reassembler: Reassembler,
    identity_data: RwLock<Vec<u8>>,
    subscribed: DashSet<PeerId>,
    running: AtomicBool,
    sink: Arc<dyn GattServerSink>,
}

impl<B: BlePeripheralBridge + 'static> BleGattServer<B> {
    pub fn new(bridge: Arc<B>, sink: Arc<dyn GattServerSink>) -> Arc<Self> {
        Arc::new(Self {
            bridge,
            reassembler: Reassembler::new(),
            identity_data: RwLock::new(Vec::new()),
            subscribed: DashSet::new(),
            running: AtomicBool::new(false),
            sink,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Replaces the snapshot served by reads of the Identity characteristic.
    /// Unlike the advertised identity payload this is not bound to 24 bytes.
    pub async fn set_identity_data(&self, bytes: Vec<u8>) -> Result<()> {
        *self.identity_data.write() = bytes.clone();
        if self.running.load(Ordering::SeqCst) {
            self.bridge.set_identity_snapshot(bytes).await?;
        }
        Ok(())
    }

    pub fn identity_snapshot(&self) -> Vec<u8> {
        self.identity_data.read().clone()
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if !self.bridge.is_available() {
            return Err(Error::Unsupported("no BLE peripheral bridge on this platform".into()));
        }
        self.bridge
            .start_gatt_server(self.clone() as Arc<dyn GattServerEvents>)
            .await?;
        self.bridge.set_identity_snapshot(self.identity_data.read().clone()).await?;
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if self.running.swap(false, Ordering::SeqCst) {
            self.bridge.stop_gatt_server().await?;
        }
        self.subscribed.clear();
        self.reassembler.clear();
        Ok(())
    }

    /// Routes `bytes` to `central` via the Sync characteristic, if it is
    /// currently subscribed.
    pub async fn send_notification(&self, central: &PeerId, bytes: Vec<u8>) -> Result<()> {
        if !self.subscribed.contains(central) {
            return Err(Error::Protocol(format!("{central} is not subscribed to Sync notifications")));
        }
        self.bridge.notify_sync(central, bytes).await
    }
}

impl<B: BlePeripheralBridge + 'static> GattServerEvents for BleGattServer<B> {
    fn on_message_write(&self, central: PeerId, fragment: Vec<u8>) {
        match self.reassembler.on_fragment(&central, &fragment) {
            Ok(Some(frame)) => self.sink.on_data_received(&central, frame),
            Ok(None) => {}
            Err(err) => log::debug!("GATT server: dropping malformed fragment from {central}: {err}"),
        }
    }

    fn on_central_subscribed(&self, central: PeerId) {
        log::debug!("GATT server: {central} subscribed to Sync notifications");
        self.subscribed.insert(central);
    }

    fn on_central_unsubscribed(&self, central: PeerId) {
        log::debug!("GATT server: {central} unsubscribed from Sync notifications");
        self.subscribed.remove(&central);
        self.reassembler.evict(&central);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ble::NullBlePeripheralBridge;
    use std::sync::Mutex;

    struct RecordingSink {
        frames: Mutex<Vec<(PeerId, Frame)>>,
    }

    impl GattServerSink for RecordingSink {
        fn on_data_received(&self, central: &PeerId, frame: Frame) {
            self.frames.lock().unwrap().push((central.clone(), frame));
        }
    }

    #[tokio::test]
    async fn start_on_unsupported_bridge_reports_unsupported() {
        let sink = Arc::new(RecordingSink { frames: Mutex::new(Vec::new()) });
        let server = BleGattServer::new(Arc::new(NullBlePeripheralBridge), sink);
        assert!(matches!(server.start().await, Err(Error::Unsupported(_))));
        assert!(!server.is_running());
    }

    #[test]
    fn full_write_reassembles_and_notifies_sink() {
        let sink = Arc::new(RecordingSink { frames: Mutex::new(Vec::new()) });
        let server = BleGattServer::new(Arc::new(NullBlePeripheralBridge), sink.clone());
        let central = PeerId::from("central-a");
        let frame = vec![9u8; 400];
        for fragment in super::super::fragment::fragment(&frame, 185).unwrap() {
            server.on_message_write(central.clone(), fragment);
        }
        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].1, frame);
    }

    #[test]
    fn notification_to_unsubscribed_central_is_rejected() {
        let sink = Arc::new(RecordingSink { frames: Mutex::new(Vec::new()) });
        let server = BleGattServer::new(Arc::new(NullBlePeripheralBridge), sink);
        let central = PeerId::from("central-b");
        let result = tokio_test::block_on(server.send_notification(&central, vec![1, 2, 3]));
        assert!(result.is_err());
    }

    #[test]
    fn unsubscribe_evicts_in_progress_reassembly() {
        let sink = Arc::new(RecordingSink { frames: Mutex::new(Vec::new()) });
        let server = BleGattServer::new(Arc::new(NullBlePeripheralBridge), sink.clone());
        let central = PeerId::from("central-c");
        let fragments = super::super::fragment::fragment(&vec![1u8; 400], 185).unwrap();
        server.on_message_write(central.clone(), fragments[0].clone());
        server.on_central_unsubscribed(central.clone());
        for fragment in &fragments[1..] {
            server.on_message_write(central.clone(), fragment.clone());
        }
        assert!(sink.frames.lock().unwrap().is_empty());
    }
}
