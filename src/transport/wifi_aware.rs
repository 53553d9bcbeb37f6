//! Wi-Fi Aware bearer: role-asymmetric data-path setup over the OS Aware
//! service, carrying frames as length-agnostic TCP streams.
//!
//! The publisher side of a discovered service pair is always the
//! *responder* (it accepts); the subscriber side is always the *initiator*
//! (it connects to the peer's link-local IPv6 address). Reversing this
//! deadlocks the handshake, since both sides would otherwise listen or
//! connect at once.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::platform::PlatformHost;
use crate::types::{Bearer, Frame, PeerId};

use super::Transport;

pub const AWARE_SERVICE_NAME: &str = "scmessenger";
pub const AWARE_PORT: u16 = 8765;
pub const AWARE_CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

const AWARE_READ_BUFFER: usize = 8 * 1024;

/// Which side of a discovered publish/subscribe pair this node is on.
/// Determined entirely by which session (ours or the peer's) triggered the
/// discovery, never negotiated at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwareRole {
    /// We published; we are the responder (we accept).
    Publisher,
    /// We subscribed; we are the initiator (we connect).
    Subscriber,
}

/// A data-path network granted by the OS for one peer. `peer_ipv6` is
/// populated only for the initiator role — the responder binds to the
/// network itself rather than to a known remote address.
pub struct AwareNetworkHandle {
    pub peer_ipv6: Option<IpAddr>,
}

/// OS bridge for the Aware service. No portable implementation of the real
/// Android `WifiAwareManager`/`ConnectivityManager` API exists outside the
/// Android platform itself, so `NullAwareBridge` — reporting every
/// operation `Unsupported` — is the only bridge this crate ships; a host
/// embedding this crate on Android supplies a concrete one through the
/// mobile facade.
#[async_trait]
pub trait AwareBridge: Send + Sync {
    fn is_available(&self) -> bool;

    async fn attach(&self) -> Result<()>;
    async fn detach(&self) -> Result<()>;

    async fn publish(&self, service_name: &str) -> Result<()>;
    async fn subscribe(&self, service_name: &str) -> Result<()>;
    async fn stop_publish(&self) -> Result<()>;
    async fn stop_subscribe(&self) -> Result<()>;

    /// Requests a data-path network for `peer` in the given role. Resolves
    /// once the OS's `on_available` callback fires; for the initiator role
    /// it additionally folds in the wait for `on_capabilities_changed`,
    /// since no connection is possible before the peer's IPv6 address is
    /// known. Both underlying OS callbacks are therefore hidden behind this
    /// single await point.
    async fn request_network(&self, peer: &PeerId, role: AwareRole) -> Result<AwareNetworkHandle>;

    /// Releases a previously granted network, unregistering its callback.
    async fn release_network(&self, peer: &PeerId) -> Result<()>;
}

/// Callback surface the bridge drives into `WifiAwareTransport`: a peer
/// entering range of either our publish session or our subscribe session.
/// Genuinely multi-fire — a peer may be rediscovered any number of times —
/// unlike the one-shot `request_network` call.
pub trait AwareEvents: Send + Sync {
    fn on_service_discovered(&self, peer: PeerId, role: AwareRole);
}

pub struct NullAwareBridge;

#[async_trait]
impl AwareBridge for NullAwareBridge {
    fn is_available(&self) -> bool {
        false
    }
    async fn attach(&self) -> Result<()> {
        Err(Error::Unsupported("Wi-Fi Aware not supported on this platform".into()))
    }
    async fn detach(&self) -> Result<()> {
        Ok(())
    }
    async fn publish(&self, _service_name: &str) -> Result<()> {
        Err(Error::Unsupported("Wi-Fi Aware not supported on this platform".into()))
    }
    async fn subscribe(&self, _service_name: &str) -> Result<()> {
        Err(Error::Unsupported("Wi-Fi Aware not supported on this platform".into()))
    }
    async fn stop_publish(&self) -> Result<()> {
        Ok(())
    }
    async fn stop_subscribe(&self) -> Result<()> {
        Ok(())
    }
    async fn request_network(&self, _peer: &PeerId, _role: AwareRole) -> Result<AwareNetworkHandle> {
        Err(Error::Unsupported("Wi-Fi Aware not supported on this platform".into()))
    }
    async fn release_network(&self, _peer: &PeerId) -> Result<()> {
        Ok(())
    }
}

/// Constructs the Aware bridge for the current build target. No portable
/// backend exists yet, so every target gets the null bridge; a future
/// Android JNI bridge would be gated here the same way `ble::android` is.
pub fn default_aware_bridge() -> Arc<dyn AwareBridge> {
    Arc::new(NullAwareBridge)
}

struct AwareConnection {
    stream: AsyncMutex<TcpStream>,
    reader_task: AsyncMutex<Option<JoinHandle<()>>>,
}

/// Entry in the registered-network table. Replacement of an existing entry
/// must be atomic with releasing the old one — see `register_network` —
/// hence the explicit lock alongside the concurrency-safe map, mirroring
/// the callback-table design called out for the Aware subsystem.
struct RegisteredNetworks {
    handles: HashMap<PeerId, ()>,
}

pub struct WifiAwareTransport<B: AwareBridge + 'static> {
    platform: Arc<dyn PlatformHost>,
    bridge: Arc<B>,
    service_name: String,
    port: u16,
    connect_timeout: Duration,

    attached: AtomicBool,
    publishing: AtomicBool,
    subscribing: AtomicBool,

    connections: DashMap<PeerId, Arc<AwareConnection>>,
    pending_initiators: DashSet<PeerId>,
    registered_networks: AsyncMutex<RegisteredNetworks>,

    on_peer_discovered: Box<dyn Fn(PeerId) + Send + Sync>,
    on_data_received: Box<dyn Fn(PeerId, Frame) + Send + Sync>,
}

impl<B: AwareBridge + 'static> WifiAwareTransport<B> {
    pub fn new(
        platform: Arc<dyn PlatformHost>,
        bridge: Arc<B>,
        service_name: impl Into<String>,
        port: u16,
        connect_timeout: Duration,
        on_peer_discovered: impl Fn(PeerId) + Send + Sync + 'static,
        on_data_received: impl Fn(PeerId, Frame) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            platform,
            bridge,
            service_name: service_name.into(),
            port,
            connect_timeout,
            attached: AtomicBool::new(false),
            publishing: AtomicBool::new(false),
            subscribing: AtomicBool::new(false),
            connections: DashMap::new(),
            pending_initiators: DashSet::new(),
            registered_networks: AsyncMutex::new(RegisteredNetworks { handles: HashMap::new() }),
            on_peer_discovered: Box::new(on_peer_discovered),
            on_data_received: Box::new(on_data_received),
        })
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Atomically records that `peer` now has a registered network,
    /// releasing any stale entry first so "replace" and "unregister" never
    /// interleave with a concurrent caller doing the same for the same peer.
    async fn register_network(&self, peer: &PeerId) {
        let mut guard = self.registered_networks.lock().await;
        if guard.handles.insert(peer.clone(), ()).is_some() {
            let _ = self.bridge.release_network(peer).await;
        }
    }

    async fn unregister_network(&self, peer: &PeerId) {
        let mut guard = self.registered_networks.lock().await;
        if guard.handles.remove(peer).is_some() {
            let _ = self.bridge.release_network(peer).await;
        }
    }

    /// Returns a handle a concrete platform bridge can hold and invoke from
    /// its own OS-callback thread whenever a service is (re)discovered.
    /// Kept separate from `AwareBridge` itself, which only covers one-shot
    /// request/response calls — discovery, like BLE advertisement scanning,
    /// can fire any number of times over the subsystem's lifetime.
    pub fn events_sink(self: &Arc<Self>) -> Arc<dyn AwareEvents> {
        Arc::new(AwareEventsSink(Arc::clone(self)))
    }

    /// Entry point driven by `AwareEventsSink`.
    async fn on_service_discovered(self: &Arc<Self>, peer: PeerId, role: AwareRole) {
        (self.on_peer_discovered)(peer.clone());

        if self.connections.contains_key(&peer) {
            return;
        }

        match role {
            AwareRole::Publisher => self.accept_as_responder(peer).await,
            AwareRole::Subscriber => {
                // Compare-and-set dedup: a repeat discovery/capabilities
                // signal for a peer whose initiator attempt is already in
                // flight is ignored outright.
                if !self.pending_initiators.insert(peer.clone()) {
                    return;
                }
                self.connect_as_initiator(peer).await;
                self.pending_initiators.remove_if(&peer, |_| true);
            }
        }
    }

    async fn accept_as_responder(self: &Arc<Self>, peer: PeerId) {
        let handle = match self.bridge.request_network(&peer, AwareRole::Publisher).await {
            Ok(handle) => handle,
            Err(err) => {
                log::warn!("Aware: network request for responder role to {peer} failed: {err}");
                return;
            }
        };
        self.register_network(&peer).await;

        let listener = match TcpListener::bind(("0.0.0.0", self.port)).await {
            Ok(listener) => listener,
            Err(err) => {
                log::warn!("Aware: failed to bind responder listener on port {}: {err}", self.port);
                self.unregister_network(&peer).await;
                return;
            }
        };

        let accepted = tokio::time::timeout(self.connect_timeout, listener.accept()).await;
        drop(listener);

        match accepted {
            Ok(Ok((stream, _addr))) => {
                let _ = handle;
                self.adopt(peer, stream).await;
            }
            Ok(Err(err)) => {
                log::warn!("Aware: responder accept for {peer} failed: {err}");
                self.unregister_network(&peer).await;
            }
            Err(_) => {
                log::debug!("Aware: responder accept for {peer} timed out after {:?}", self.connect_timeout);
                self.unregister_network(&peer).await;
            }
        }
    }

    async fn connect_as_initiator(self: &Arc<Self>, peer: PeerId) {
        let handle = match self.bridge.request_network(&peer, AwareRole::Subscriber).await {
            Ok(handle) => handle,
            Err(err) => {
                log::warn!("Aware: network request for initiator role to {peer} failed: {err}");
                return;
            }
        };
        let Some(peer_ipv6) = handle.peer_ipv6 else {
            log::warn!("Aware: initiator network for {peer} carried no peer IPv6 address");
            return;
        };
        self.register_network(&peer).await;

        let addr = SocketAddr::new(peer_ipv6, self.port);
        let connected = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await;
        match connected {
            Ok(Ok(stream)) => self.adopt(peer, stream).await,
            Ok(Err(err)) => {
                log::warn!("Aware: initiator connect to {peer} at {addr} failed: {err}");
                self.unregister_network(&peer).await;
            }
            Err(_) => {
                log::debug!("Aware: initiator connect to {peer} timed out after {:?}", self.connect_timeout);
                self.unregister_network(&peer).await;
            }
        }
    }

    async fn adopt(self: &Arc<Self>, peer: PeerId, stream: TcpStream) {
        let connection =
            Arc::new(AwareConnection { stream: AsyncMutex::new(stream), reader_task: AsyncMutex::new(None) });
        self.connections.insert(peer.clone(), connection.clone());

        let this = Arc::clone(self);
        let reader_peer = peer.clone();
        let reader_connection = connection.clone();
        let handle = tokio::spawn(async move {
            this.read_loop(reader_peer, reader_connection).await;
        });
        *connection.reader_task.lock().await = Some(handle);
    }

    async fn read_loop(self: Arc<Self>, peer: PeerId, connection: Arc<AwareConnection>) {
        let mut buf = vec![0u8; AWARE_READ_BUFFER];
        loop {
            let read = {
                let mut stream = connection.stream.lock().await;
                stream.read(&mut buf).await
            };
            match read {
                Ok(0) | Err(_) => {
                    log::debug!("Aware: connection with {peer} ended");
                    self.connections.remove(&peer);
                    self.unregister_network(&peer).await;
                    return;
                }
                Ok(n) => (self.on_data_received)(peer.clone(), buf[..n].to_vec()),
            }
        }
    }
}

#[async_trait]
impl<B: AwareBridge + 'static> Transport for WifiAwareTransport<B> {
    fn bearer(&self) -> Bearer {
        Bearer::WifiAware
    }

    fn is_available(&self) -> bool {
        self.platform.is_wifi_aware_available() && self.bridge.is_available()
    }

    async fn start(&self) -> Result<()> {
        if !self.bridge.is_available() {
            return Err(Error::Unsupported("Wi-Fi Aware not supported on this platform".into()));
        }
        self.bridge.attach().await?;
        self.attached.store(true, Ordering::SeqCst);

        self.bridge.publish(&self.service_name).await?;
        self.publishing.store(true, Ordering::SeqCst);
        self.bridge.subscribe(&self.service_name).await?;
        self.subscribing.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let peers: Vec<PeerId> = self.connections.iter().map(|e| e.key().clone()).collect();
        for peer in peers {
            if let Some((_, connection)) = self.connections.remove(&peer) {
                if let Some(handle) = connection.reader_task.lock().await.take() {
                    handle.abort();
                }
            }
            self.unregister_network(&peer).await;
        }
        self.pending_initiators.clear();

        if self.subscribing.swap(false, Ordering::SeqCst) {
            let _ = self.bridge.stop_subscribe().await;
        }
        if self.publishing.swap(false, Ordering::SeqCst) {
            let _ = self.bridge.stop_publish().await;
        }
        if self.attached.swap(false, Ordering::SeqCst) {
            self.bridge.detach().await?;
        }
        Ok(())
    }

    async fn send(&self, peer: &PeerId, frame: &[u8]) -> bool {
        let Some(connection) = self.connections.get(peer).map(|c| c.clone()) else {
            return false;
        };
        let mut stream = connection.stream.lock().await;
        stream.write_all(frame).await.is_ok()
    }

    async fn cleanup(&self) -> Result<()> {
        self.stop().await
    }
}

/// Bridges the bridge-facing `AwareEvents` callback (sync, invoked from
/// whatever thread the platform's Aware callback arrives on) into the
/// transport's own async discovery handling by spawning a task per event.
struct AwareEventsSink<B: AwareBridge + 'static>(Arc<WifiAwareTransport<B>>);

impl<B: AwareBridge + 'static> AwareEvents for AwareEventsSink<B> {
    fn on_service_discovered(&self, peer: PeerId, role: AwareRole) {
        let transport = Arc::clone(&self.0);
        tokio::spawn(async move {
            transport.on_service_discovered(peer, role).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_on_unsupported_bridge_reports_unsupported() {
        let transport = WifiAwareTransport::new(
            Arc::new(crate::platform::NullPlatformHost),
            Arc::new(NullAwareBridge),
            AWARE_SERVICE_NAME,
            AWARE_PORT,
            AWARE_CONNECT_TIMEOUT,
            |_| {},
            |_, _| {},
        );
        assert!(matches!(transport.start().await, Err(Error::Unsupported(_))));
    }

    #[tokio::test]
    async fn send_to_unconnected_peer_returns_false() {
        let transport = WifiAwareTransport::new(
            Arc::new(crate::platform::NullPlatformHost),
            Arc::new(NullAwareBridge),
            AWARE_SERVICE_NAME,
            AWARE_PORT,
            AWARE_CONNECT_TIMEOUT,
            |_| {},
            |_, _| {},
        );
        assert!(!transport.send(&PeerId::from("nobody"), b"hi").await);
    }

    #[tokio::test]
    async fn duplicate_initiator_dispatch_is_deduped_by_pending_set() {
        let transport = WifiAwareTransport::new(
            Arc::new(crate::platform::NullPlatformHost),
            Arc::new(NullAwareBridge),
            AWARE_SERVICE_NAME,
            AWARE_PORT,
            AWARE_CONNECT_TIMEOUT,
            |_| {},
            |_, _| {},
        );
        let peer = PeerId::from("peer-a");
        assert!(transport.pending_initiators.insert(peer.clone()));
        assert!(!transport.pending_initiators.insert(peer));
    }
}
