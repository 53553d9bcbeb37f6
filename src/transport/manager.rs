//! `TransportManager`: the single entry point the core drives. Owns every
//! enabled bearer subsystem behind the shared `Transport` trait object,
//! maintains `ActiveTransports` and `PeerTransportCache`, runs the send
//! cascade, and schedules opportunistic escalation off BLE discovery.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::TransportConfig;
use crate::error::Result;
use crate::platform::{CoreSink, PlatformHost};
use crate::types::{validate_frame, Bearer, Frame, PeerId};

use super::ble::transport::BleTransport;
use super::wifi_aware::{default_aware_bridge, AwareBridge, AwareNetworkHandle, AwareRole, WifiAwareTransport};
use super::wifi_direct::{default_direct_bridge, WifiDirectBridge, WifiDirectTransport};
use super::{MeshStream, Transport};

/// Open question resolved in DESIGN.md: the source left the send-failure
/// threshold before evicting a `PeerTransportCache` entry unspecified; `3`
/// is the implementer-chosen default named in §9.
const CACHE_EVICTION_THRESHOLD: u32 = 3;

/// Delegates to a trait object so `WifiAwareTransport`, which is generic
/// over a `Sized` bridge type, can be handed the platform-selected
/// `Arc<dyn AwareBridge>` — mirroring `ble::transport`'s `DynPeripheralBridge`.
struct DynAwareBridge(Arc<dyn AwareBridge>);

#[async_trait::async_trait]
impl AwareBridge for DynAwareBridge {
    fn is_available(&self) -> bool {
        self.0.is_available()
    }
    async fn attach(&self) -> Result<()> {
        self.0.attach().await
    }
    async fn detach(&self) -> Result<()> {
        self.0.detach().await
    }
    async fn publish(&self, service_name: &str) -> Result<()> {
        self.0.publish(service_name).await
    }
    async fn subscribe(&self, service_name: &str) -> Result<()> {
        self.0.subscribe(service_name).await
    }
    async fn stop_publish(&self) -> Result<()> {
        self.0.stop_publish().await
    }
    async fn stop_subscribe(&self) -> Result<()> {
        self.0.stop_subscribe().await
    }
    async fn request_network(&self, peer: &PeerId, role: AwareRole) -> Result<AwareNetworkHandle> {
        self.0.request_network(peer, role).await
    }
    async fn release_network(&self, peer: &PeerId) -> Result<()> {
        self.0.release_network(peer).await
    }
}

/// Same delegation, for the Wi-Fi Direct bridge.
struct DynDirectBridge(Arc<dyn WifiDirectBridge>);

#[async_trait::async_trait]
impl WifiDirectBridge for DynDirectBridge {
    fn is_available(&self) -> bool {
        self.0.is_available()
    }
    async fn start_discovery(&self) -> Result<()> {
        self.0.start_discovery().await
    }
    async fn stop_discovery(&self) -> Result<()> {
        self.0.stop_discovery().await
    }
    async fn connect(&self, peer: &PeerId) -> Result<Box<dyn MeshStream>> {
        self.0.connect(peer).await
    }
    async fn disconnect(&self, peer: &PeerId) -> Result<()> {
        self.0.disconnect(peer).await
    }
}

pub struct TransportManager {
    platform: Arc<dyn PlatformHost>,
    core_sink: Arc<dyn CoreSink>,
    config: TransportConfig,

    transports: DashMap<Bearer, Arc<dyn Transport>>,
    active: DashMap<Bearer, bool>,
    peer_cache: DashMap<PeerId, Bearer>,
    consecutive_failures: DashMap<PeerId, u32>,
}

impl TransportManager {
    pub fn new(platform: Arc<dyn PlatformHost>, core_sink: Arc<dyn CoreSink>, config: TransportConfig) -> Arc<Self> {
        Arc::new(Self {
            platform,
            core_sink,
            config,
            transports: DashMap::new(),
            active: DashMap::new(),
            peer_cache: DashMap::new(),
            consecutive_failures: DashMap::new(),
        })
    }

    /// Constructs the enabled bearer subsystems. A bearer omitted here, or
    /// whose `Transport::start` later fails, is isolated: the manager stays
    /// partially functional rather than failing as a whole, per §4.1.
    pub fn initialize(self: &Arc<Self>, ble: bool, aware: bool, direct: bool) {
        if ble {
            let manager_for_peer = Arc::clone(self);
            let sink_for_peer = Arc::clone(&self.core_sink);
            let sink_for_data = Arc::clone(&self.core_sink);
            let ble_transport = BleTransport::new_default(
                Arc::clone(&self.platform),
                move |peer: PeerId| {
                    sink_for_peer.on_peer_discovered(&peer, Bearer::Ble);
                    let manager = Arc::clone(&manager_for_peer);
                    tokio::spawn(async move {
                        manager.on_bearer_live(Bearer::Ble);
                        manager.attempt_escalation(&peer).await;
                    });
                },
                move |peer: PeerId, frame: Frame| {
                    sink_for_data.on_data_received(&peer, frame, Bearer::Ble);
                },
            );
            ble_transport.configure(&self.config.ble);
            let transport: Arc<dyn Transport> = ble_transport;
            self.transports.insert(Bearer::Ble, transport);
        }

        if aware {
            let manager_for_peer = Arc::clone(self);
            let sink_for_peer = Arc::clone(&self.core_sink);
            let sink_for_data = Arc::clone(&self.core_sink);
            let transport: Arc<dyn Transport> = WifiAwareTransport::new(
                Arc::clone(&self.platform),
                Arc::new(DynAwareBridge(default_aware_bridge())),
                self.config.aware.service_name.clone(),
                self.config.aware.port,
                self.config.aware_connect_timeout(),
                move |peer: PeerId| {
                    sink_for_peer.on_peer_discovered(&peer, Bearer::WifiAware);
                    manager_for_peer.on_bearer_live(Bearer::WifiAware);
                },
                move |peer: PeerId, frame: Frame| {
                    sink_for_data.on_data_received(&peer, frame, Bearer::WifiAware);
                },
            );
            self.transports.insert(Bearer::WifiAware, transport);
        }

        if direct {
            let manager_for_peer = Arc::clone(self);
            let sink_for_peer = Arc::clone(&self.core_sink);
            let sink_for_data = Arc::clone(&self.core_sink);
            let transport: Arc<dyn Transport> = WifiDirectTransport::new(
                Arc::clone(&self.platform),
                Arc::new(DynDirectBridge(default_direct_bridge())),
                self.config.direct_connect_timeout(),
                move |peer: PeerId| {
                    sink_for_peer.on_peer_discovered(&peer, Bearer::WifiDirect);
                    manager_for_peer.on_bearer_live(Bearer::WifiDirect);
                },
                move |peer: PeerId, frame: Frame| {
                    sink_for_data.on_data_received(&peer, frame, Bearer::WifiDirect);
                },
            );
            self.transports.insert(Bearer::WifiDirect, transport);
        }
    }

    /// Seeing a peer on bearer `X` implies `X` is live, per the
    /// `ActiveTransports` invariant in §3.
    fn on_bearer_live(&self, bearer: Bearer) {
        self.active.insert(bearer, true);
    }

    /// Idempotent: starting an already-started bearer is a no-op inside
    /// `Transport::start` itself; a bearer that fails to start is logged
    /// and left out of `ActiveTransports`, not fatal to the others.
    pub async fn start_all(&self) {
        for entry in self.transports.iter() {
            let bearer = *entry.key();
            if !entry.value().is_available() {
                log::debug!("transport manager: {bearer} unavailable on this platform, not starting");
                continue;
            }
            match entry.value().start().await {
                Ok(()) => {
                    self.active.insert(bearer, true);
                    log::debug!("transport manager: {bearer} started");
                }
                Err(err) => log::warn!("transport manager: {bearer} failed to start: {err}"),
            }
        }
    }

    /// Idempotent. Clears `ActiveTransports` and `PeerTransportCache`.
    pub async fn stop_all(&self) {
        for entry in self.transports.iter() {
            if let Err(err) = entry.value().stop().await {
                log::warn!("transport manager: {} failed to stop cleanly: {err}", entry.key());
            }
        }
        self.active.clear();
        self.peer_cache.clear();
        self.consecutive_failures.clear();
    }

    /// `stop_all` plus release of every bearer's internal task scope.
    /// Crash-safe: safe to call even after a partially failed `start_all`.
    pub async fn cleanup(&self) {
        self.stop_all().await;
        for entry in self.transports.iter() {
            if let Err(err) = entry.value().cleanup().await {
                log::warn!("transport manager: {} cleanup reported {err}", entry.key());
            }
        }
    }

    fn is_active(&self, bearer: Bearer) -> bool {
        self.active.get(&bearer).map(|v| *v).unwrap_or(false)
    }

    /// §4.1 send cascade. Tries the cached bearer first; on transient
    /// failure (or no cache entry) falls through to the fixed priority
    /// order `WiFi Aware > Wi-Fi Direct > BLE`, skipping inactive bearers
    /// and the bearer already attempted. Updates the cache on first success
    /// encountered anywhere in the cascade.
    pub async fn send(&self, peer_id: &PeerId, frame: &[u8]) -> bool {
        if validate_frame(frame).is_err() {
            log::warn!("transport manager: refusing oversized frame to {peer_id}");
            return false;
        }

        let cached = self.peer_cache.get(peer_id).map(|b| *b);
        if let Some(bearer) = cached {
            if let Some(transport) = self.transports.get(&bearer).map(|t| t.clone()) {
                if transport.send(peer_id, frame).await {
                    self.consecutive_failures.remove(peer_id);
                    return true;
                }
                self.record_failure(peer_id, bearer);
            }
        }

        for bearer in Bearer::CASCADE_ORDER {
            if cached == Some(bearer) {
                continue;
            }
            if !self.is_active(bearer) {
                continue;
            }
            let Some(transport) = self.transports.get(&bearer).map(|t| t.clone()) else {
                continue;
            };
            if transport.send(peer_id, frame).await {
                self.peer_cache.insert(peer_id.clone(), bearer);
                self.consecutive_failures.remove(peer_id);
                return true;
            }
        }

        false
    }

    /// A `false` from a bearer is transient; the cache entry is evicted
    /// only after `CACHE_EVICTION_THRESHOLD` consecutive failures.
    fn record_failure(&self, peer_id: &PeerId, bearer: Bearer) {
        let count = {
            let mut entry = self.consecutive_failures.entry(peer_id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };
        if count >= CACHE_EVICTION_THRESHOLD {
            log::debug!("transport manager: evicting {bearer} cache entry for {peer_id} after {count} failures");
            self.peer_cache.remove(peer_id);
            self.consecutive_failures.remove(peer_id);
        }
    }

    /// Runtime toggle. Starting an already-active bearer, or disabling one
    /// that was never constructed, is a harmless no-op reporting `false`.
    pub async fn enable(&self, bearer: Bearer) -> bool {
        let Some(transport) = self.transports.get(&bearer).map(|t| t.clone()) else {
            return false;
        };
        match transport.start().await {
            Ok(()) => {
                self.active.insert(bearer, true);
                true
            }
            Err(err) => {
                log::warn!("transport manager: enable({bearer}) failed: {err}");
                false
            }
        }
    }

    /// Stops the bearer and evicts any cache entries pointing at it, so the
    /// `PeerTransportCache` invariant (every entry's bearer is active at the
    /// instant it was written) never silently goes stale.
    pub async fn disable(&self, bearer: Bearer) -> bool {
        let Some(transport) = self.transports.get(&bearer).map(|t| t.clone()) else {
            return false;
        };
        if let Err(err) = transport.stop().await {
            log::warn!("transport manager: disable({bearer}) reported {err}");
        }
        self.active.insert(bearer, false);
        self.peer_cache.retain(|_, b| *b != bearer);
        true
    }

    /// For the core's auto-adjust engine: bearers currently on.
    pub fn available_transports(&self) -> HashSet<Bearer> {
        self.active.iter().filter(|e| *e.value()).map(|e| *e.key()).collect()
    }

    /// Opportunistic escalation off a BLE discovery. Only flips
    /// `ActiveTransports` for Aware/Direct when the OS reports them
    /// available; the actual data-path formation for those bearers is
    /// driven entirely by their own discovery callbacks, so this routine
    /// never opens a socket itself.
    pub async fn attempt_escalation(&self, peer_id: &PeerId) {
        log::debug!("transport manager: attempting escalation for {peer_id}");
        if self.transports.contains_key(&Bearer::WifiAware) && self.platform.is_wifi_aware_available() {
            self.active.insert(Bearer::WifiAware, true);
        }
        if self.transports.contains_key(&Bearer::WifiDirect) && self.platform.is_wifi_direct_available() {
            self.active.insert(Bearer::WifiDirect, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::NullPlatformHost;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct FakeTransport {
        bearer: Bearer,
        succeed: AtomicBool,
        send_count: AtomicUsize,
    }

    impl FakeTransport {
        fn new(bearer: Bearer, succeed: bool) -> Arc<Self> {
            Arc::new(Self { bearer, succeed: AtomicBool::new(succeed), send_count: AtomicUsize::new(0) })
        }
    }

    #[async_trait::async_trait]
    impl Transport for FakeTransport {
        fn bearer(&self) -> Bearer {
            self.bearer
        }
        fn is_available(&self) -> bool {
            true
        }
        async fn start(&self) -> Result<()> {
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
        async fn send(&self, _peer: &PeerId, _frame: &[u8]) -> bool {
            self.send_count.fetch_add(1, Ordering::SeqCst);
            self.succeed.load(Ordering::SeqCst)
        }
        async fn cleanup(&self) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        peers: Mutex<Vec<(PeerId, Bearer)>>,
        frames: Mutex<Vec<(PeerId, Frame, Bearer)>>,
    }

    impl CoreSink for RecordingSink {
        fn on_peer_discovered(&self, peer_id: &PeerId, bearer: Bearer) {
            self.peers.lock().unwrap().push((peer_id.clone(), bearer));
        }
        fn on_data_received(&self, peer_id: &PeerId, bytes: Frame, bearer: Bearer) {
            self.frames.lock().unwrap().push((peer_id.clone(), bytes, bearer));
        }
    }

    fn bare_manager() -> Arc<TransportManager> {
        TransportManager::new(Arc::new(NullPlatformHost), Arc::new(RecordingSink::default()), TransportConfig::default())
    }

    fn register(manager: &Arc<TransportManager>, transport: Arc<dyn Transport>, active: bool) {
        let bearer = transport.bearer();
        manager.transports.insert(bearer, transport);
        manager.active.insert(bearer, active);
    }

    #[tokio::test]
    async fn cascade_prefers_aware_over_direct_over_ble() {
        let manager = bare_manager();
        let aware = FakeTransport::new(Bearer::WifiAware, true);
        let direct = FakeTransport::new(Bearer::WifiDirect, true);
        let ble = FakeTransport::new(Bearer::Ble, true);
        register(&manager, aware.clone(), true);
        register(&manager, direct.clone(), true);
        register(&manager, ble.clone(), true);

        let peer = PeerId::from("peer-a");
        assert!(manager.send(&peer, b"hello").await);
        assert_eq!(aware.send_count.load(Ordering::SeqCst), 1);
        assert_eq!(direct.send_count.load(Ordering::SeqCst), 0);
        assert_eq!(ble.send_count.load(Ordering::SeqCst), 0);
        assert_eq!(manager.peer_cache.get(&peer).map(|b| *b), Some(Bearer::WifiAware));
    }

    #[tokio::test]
    async fn cascade_skips_inactive_bearers() {
        let manager = bare_manager();
        let aware = FakeTransport::new(Bearer::WifiAware, true);
        let ble = FakeTransport::new(Bearer::Ble, true);
        register(&manager, aware.clone(), false); // constructed but not active
        register(&manager, ble.clone(), true);

        let peer = PeerId::from("peer-b");
        assert!(manager.send(&peer, b"hi").await);
        assert_eq!(aware.send_count.load(Ordering::SeqCst), 0);
        assert_eq!(ble.send_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disable_evicts_cache_and_falls_through_next_send() {
        let manager = bare_manager();
        let aware = FakeTransport::new(Bearer::WifiAware, true);
        let ble = FakeTransport::new(Bearer::Ble, true);
        register(&manager, aware.clone(), true);
        register(&manager, ble.clone(), true);

        let peer = PeerId::from("peer-c");
        assert!(manager.send(&peer, b"one").await);
        assert_eq!(manager.peer_cache.get(&peer).map(|b| *b), Some(Bearer::WifiAware));

        assert!(manager.disable(Bearer::WifiAware).await);
        assert!(manager.peer_cache.get(&peer).is_none());

        assert!(manager.send(&peer, b"two").await);
        assert_eq!(manager.peer_cache.get(&peer).map(|b| *b), Some(Bearer::Ble));
    }

    #[tokio::test]
    async fn cache_entry_survives_up_to_two_failures_then_evicts_on_the_third() {
        let manager = bare_manager();
        let ble = FakeTransport::new(Bearer::Ble, false);
        register(&manager, ble.clone(), true);
        let peer = PeerId::from("peer-d");
        manager.peer_cache.insert(peer.clone(), Bearer::Ble);

        assert!(!manager.send(&peer, b"x").await);
        assert!(manager.peer_cache.contains_key(&peer));
        assert!(!manager.send(&peer, b"x").await);
        assert!(manager.peer_cache.contains_key(&peer));
        assert!(!manager.send(&peer, b"x").await);
        assert!(!manager.peer_cache.contains_key(&peer));
    }

    #[tokio::test]
    async fn successful_send_resets_the_failure_counter() {
        let manager = bare_manager();
        let ble = FakeTransport::new(Bearer::Ble, false);
        register(&manager, ble.clone(), true);
        let peer = PeerId::from("peer-e");
        manager.peer_cache.insert(peer.clone(), Bearer::Ble);

        assert!(!manager.send(&peer, b"x").await);
        assert!(!manager.send(&peer, b"x").await);
        ble.succeed.store(true, Ordering::SeqCst);
        assert!(manager.send(&peer, b"x").await);
        assert_eq!(manager.consecutive_failures.get(&peer).is_none(), true);
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_without_touching_any_bearer() {
        let manager = bare_manager();
        let ble = FakeTransport::new(Bearer::Ble, true);
        register(&manager, ble.clone(), true);
        let peer = PeerId::from("peer-f");
        let huge = vec![0u8; crate::types::MAX_FRAME_SIZE + 1];
        assert!(!manager.send(&peer, &huge).await);
        assert_eq!(ble.send_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_all_is_idempotent_and_clears_cache() {
        let manager = bare_manager();
        let ble = FakeTransport::new(Bearer::Ble, true);
        register(&manager, ble.clone(), true);
        manager.peer_cache.insert(PeerId::from("peer-g"), Bearer::Ble);

        manager.stop_all().await;
        manager.stop_all().await;
        assert!(manager.peer_cache.is_empty());
        assert!(manager.available_transports().is_empty());
    }

    #[tokio::test]
    async fn escalation_marks_aware_and_direct_active_when_platform_reports_them() {
        struct AllAvailablePlatform;
        impl PlatformHost for AllAvailablePlatform {
            fn ble_adapter_state(&self) -> crate::platform::BleAdapterState {
                crate::platform::BleAdapterState::On
            }
            fn is_wifi_aware_available(&self) -> bool {
                true
            }
            fn is_wifi_direct_available(&self) -> bool {
                true
            }
            fn has_permission(&self, _capability: crate::platform::PlatformCapability) -> bool {
                true
            }
        }

        let manager = TransportManager::new(
            Arc::new(AllAvailablePlatform),
            Arc::new(RecordingSink::default()),
            TransportConfig::default(),
        );
        let aware = FakeTransport::new(Bearer::WifiAware, true);
        let direct = FakeTransport::new(Bearer::WifiDirect, true);
        register(&manager, aware, false);
        register(&manager, direct, false);

        assert!(manager.available_transports().is_empty());
        manager.attempt_escalation(&PeerId::from("peer-h")).await;
        let available = manager.available_transports();
        assert!(available.contains(&Bearer::WifiAware));
        assert!(available.contains(&Bearer::WifiDirect));
    }

    #[tokio::test]
    async fn enable_disable_round_trip_is_observationally_identity() {
        let manager = bare_manager();
        let ble = FakeTransport::new(Bearer::Ble, true);
        register(&manager, ble, true);

        assert!(manager.available_transports().contains(&Bearer::Ble));
        assert!(manager.disable(Bearer::Ble).await);
        assert!(!manager.available_transports().contains(&Bearer::Ble));
        assert!(manager.enable(Bearer::Ble).await);
        assert!(manager.available_transports().contains(&Bearer::Ble));
    }
}
