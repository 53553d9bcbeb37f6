//! Duty-cycled BLE scanner with short-TTL advertisement dedup.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::types::PeerId;

use super::constants::SCANNER_DEDUP_TTL;
use super::BleCentralBridge;

/// Raised once per scan window per remote identifier, after dedup.
#[async_trait]
pub trait ScanSink: Send + Sync {
    fn on_peer_discovered(&self, remote_id: PeerId);
}

#[derive(Debug, Clone, Copy)]
pub struct BleScanConfig {
    pub window: Duration,
    pub interval: Duration,
}

impl BleScanConfig {
    /// Window >= interval means the scan never idles between windows,
    /// matching the "(continuous)" foreground behavior named in the
    /// component design: a 30s window inside a 10s interval overlaps
    /// fully, so scanning is effectively always on.
    pub fn is_continuous(&self) -> bool {
        self.window >= self.interval
    }

    pub fn foreground() -> Self {
        Self { window: Duration::from_secs(30), interval: Duration::from_secs(10) }
    }
}

pub struct BleScanner<B: BleCentralBridge + 'static> {
    bridge: Arc<B>,
    config: BleScanConfig,
    dedup: DashMap<PeerId, Instant>,
    scanning: AtomicBool,
    duty_cycle_task: AsyncMutex<Option<JoinHandle<()>>>,
    sink: Arc<dyn ScanSink>,
}

struct DedupSink<B: BleCentralBridge + 'static> {
    dedup: DashMap<PeerId, Instant>,
    downstream: Arc<dyn ScanSink>,
    _marker: std::marker::PhantomData<B>,
}

impl<B: BleCentralBridge + 'static> BleScanner<B> {
    pub fn new(bridge: Arc<B>, config: BleScanConfig, sink: Arc<dyn ScanSink>) -> Arc<Self> {
        Arc::new(Self {
            bridge,
            config,
            dedup: DashMap::new(),
            scanning: AtomicBool::new(false),
            duty_cycle_task: AsyncMutex::new(None),
            sink,
        })
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Feeds a raw advertisement from the bridge through the 5s dedup
    /// cache; forwards at most one `on_peer_discovered` per remote id per
    /// TTL window.
    pub fn handle_advertisement(&self, remote_id: PeerId) {
        let now = Instant::now();
        let should_emit = match self.dedup.get(&remote_id) {
            Some(last_seen) if now.duration_since(*last_seen) < SCANNER_DEDUP_TTL => false,
            _ => true,
        };
        if should_emit {
            self.dedup.insert(remote_id.clone(), now);
            self.sink.on_peer_discovered(remote_id);
        }
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if !self.bridge.is_available() {
            return Err(Error::Unsupported("no BLE central bridge on this platform".into()));
        }
        self.bridge
            .start_scan(super::constants::SERVICE_UUID, self.clone() as Arc<dyn ScanEventTarget>)
            .await?;
        self.scanning.store(true, Ordering::SeqCst);

        if !self.config.is_continuous() {
            self.spawn_duty_cycle().await;
        }
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        if let Some(handle) = self.duty_cycle_task.lock().await.take() {
            handle.abort();
        }
        if self.scanning.swap(false, Ordering::SeqCst) {
            self.bridge.stop_scan().await?;
        }
        self.dedup.clear();
        Ok(())
    }

    async fn spawn_duty_cycle(self: &Arc<Self>) {
        let BleScanConfig { window, interval } = self.config;
        let bridge = Arc::clone(&self.bridge);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(window).await;
                if let Err(err) = bridge.stop_scan().await {
                    log::warn!("duty cycle: failed to pause scan: {err}");
                }
                let idle = interval.saturating_sub(window);
                tokio::time::sleep(idle).await;
                if let Err(err) = bridge
                    .start_scan(
                        super::constants::SERVICE_UUID,
                        this.clone() as Arc<dyn ScanEventTarget>,
                    )
                    .await
                {
                    log::warn!("duty cycle: failed to resume scan: {err}");
                }
            }
        });
        *self.duty_cycle_task.lock().await = Some(handle);
    }
}

/// Bridges raw bridge-level advertisement callbacks into the scanner's
/// dedup logic. Kept distinct from `ScanSink` (the manager-facing event)
/// so that `BleCentralBridge` implementations never need to know about
/// dedup at all.
pub trait ScanEventTarget: Send + Sync {
    fn on_advertisement(&self, remote_id: PeerId);
}

impl<B: BleCentralBridge + 'static> ScanEventTarget for BleScanner<B> {
    fn on_advertisement(&self, remote_id: PeerId) {
        self.handle_advertisement(remote_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingSink {
        events: Mutex<Vec<PeerId>>,
    }

    impl ScanSink for RecordingSink {
        fn on_peer_discovered(&self, remote_id: PeerId) {
            self.events.lock().unwrap().push(remote_id);
        }
    }

    #[test]
    fn foreground_window_and_interval_are_continuous() {
        assert!(BleScanConfig::foreground().is_continuous());
    }

    #[test]
    fn background_like_config_with_short_window_is_duty_cycled() {
        let cfg = BleScanConfig { window: Duration::from_secs(2), interval: Duration::from_secs(10) };
        assert!(!cfg.is_continuous());
    }

    #[test]
    fn duplicate_advertisements_within_ttl_emit_once() {
        let sink = Arc::new(RecordingSink { events: Mutex::new(Vec::new()) });
        let scanner: BleScanner<crate::transport::ble::NullBleCentralBridge> = BleScanner {
            bridge: Arc::new(crate::transport::ble::NullBleCentralBridge),
            config: BleScanConfig::foreground(),
            dedup: DashMap::new(),
            scanning: AtomicBool::new(false),
            duty_cycle_task: AsyncMutex::new(None),
            sink: sink.clone(),
        };
        let peer = PeerId::from("AA:BB:CC:DD:EE:FF");
        scanner.handle_advertisement(peer.clone());
        scanner.handle_advertisement(peer.clone());
        scanner.handle_advertisement(peer);
        assert_eq!(sink.events.lock().unwrap().len(), 1);
    }
}
