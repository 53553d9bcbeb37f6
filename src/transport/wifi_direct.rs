//! Wi-Fi Direct bearer: discovers peers advertising the mesh service over
//! OS Wi-Fi Direct service discovery, auto-joins or forms a group, and
//! carries frames over whatever stream the OS group provides.
//!
//! Per §4.4 this subsystem is specified at interface level only — its
//! algorithmic content is strictly weaker than Wi-Fi Aware's role-asymmetric
//! handshake, since the OS owns group formation and hands back a ready
//! stream. The `WifiDirectBridge` trait is exactly that interface; this
//! module is the plumbing that turns bridge callbacks into the shared
//! `Transport` contract.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{Error, Result};
use crate::platform::PlatformHost;
use crate::types::{Bearer, Frame, PeerId};

use super::{MeshStream, Transport};

/// Per DESIGN.md's resolution of the open question in §9: Wi-Fi Direct
/// reuses Wi-Fi Aware's data-path port and connect timeout rather than
/// inventing a second pair of magic numbers, since the cascade never runs
/// both bearers' data paths for the same peer concurrently.
pub const DIRECT_CONNECT_TIMEOUT: Duration = super::wifi_aware::AWARE_CONNECT_TIMEOUT;
pub const DIRECT_PORT: u16 = super::wifi_aware::AWARE_PORT;

const DIRECT_READ_BUFFER: usize = 8 * 1024;

/// OS bridge for Wi-Fi Direct: service discovery plus group join/formation.
/// `NullWifiDirectBridge` — reporting every operation `Unsupported` — is the
/// only bridge this crate ships, matching the "specified at interface
/// level only" scope of §4.4; a host embedding this crate supplies a
/// concrete one (Android `WifiP2pManager`, or none at all on platforms with
/// no Wi-Fi Direct stack).
#[async_trait]
pub trait WifiDirectBridge: Send + Sync {
    fn is_available(&self) -> bool;

    async fn start_discovery(&self) -> Result<()>;
    async fn stop_discovery(&self) -> Result<()>;

    /// Auto-joins or forms a group with `peer` and returns a connected
    /// stream over it. The OS decides group-owner negotiation; this layer
    /// only ever sees the resulting bidirectional stream.
    async fn connect(&self, peer: &PeerId) -> Result<Box<dyn MeshStream>>;
    async fn disconnect(&self, peer: &PeerId) -> Result<()>;
}

/// Callback surface the bridge drives into `WifiDirectTransport` whenever a
/// peer advertising the mesh service enters range. Multi-fire, like BLE
/// advertisements and Aware service discovery.
pub trait WifiDirectEvents: Send + Sync {
    fn on_peer_discovered(&self, peer: PeerId);
}

pub struct NullWifiDirectBridge;

#[async_trait]
impl WifiDirectBridge for NullWifiDirectBridge {
    fn is_available(&self) -> bool {
        false
    }
    async fn start_discovery(&self) -> Result<()> {
        Err(Error::Unsupported("Wi-Fi Direct not supported on this platform".into()))
    }
    async fn stop_discovery(&self) -> Result<()> {
        Ok(())
    }
    async fn connect(&self, _peer: &PeerId) -> Result<Box<dyn MeshStream>> {
        Err(Error::Unsupported("Wi-Fi Direct not supported on this platform".into()))
    }
    async fn disconnect(&self, _peer: &PeerId) -> Result<()> {
        Ok(())
    }
}

/// Constructs the Wi-Fi Direct bridge for the current build target. No
/// portable backend exists yet, so every target gets the null bridge.
pub fn default_direct_bridge() -> Arc<dyn WifiDirectBridge> {
    Arc::new(NullWifiDirectBridge)
}

struct DirectSession {
    stream: AsyncMutex<Box<dyn MeshStream>>,
}

pub struct WifiDirectTransport<B: WifiDirectBridge + 'static> {
    platform: Arc<dyn PlatformHost>,
    bridge: Arc<B>,
    connect_timeout: Duration,

    discovering: AtomicBool,
    sessions: DashMap<PeerId, Arc<DirectSession>>,
    /// Compare-and-set dedup, mirroring Aware's `pending_initiators`: a
    /// repeat discovery for a peer whose group-join is already in flight is
    /// ignored outright rather than racing a second `connect`.
    pending_connects: DashSet<PeerId>,

    on_peer_discovered: Box<dyn Fn(PeerId) + Send + Sync>,
    on_data_received: Box<dyn Fn(PeerId, Frame) + Send + Sync>,
}

impl<B: WifiDirectBridge + 'static> WifiDirectTransport<B> {
    pub fn new(
        platform: Arc<dyn PlatformHost>,
        bridge: Arc<B>,
        connect_timeout: Duration,
        on_peer_discovered: impl Fn(PeerId) + Send + Sync + 'static,
        on_data_received: impl Fn(PeerId, Frame) + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            platform,
            bridge,
            connect_timeout,
            discovering: AtomicBool::new(false),
            sessions: DashMap::new(),
            pending_connects: DashSet::new(),
            on_peer_discovered: Box::new(on_peer_discovered),
            on_data_received: Box::new(on_data_received),
        })
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    /// Returns a handle a concrete platform bridge can hold and invoke from
    /// its own OS-callback thread whenever a peer is (re)discovered.
    pub fn events_sink(self: &Arc<Self>) -> Arc<dyn WifiDirectEvents> {
        Arc::new(DirectEventsSink(Arc::clone(self)))
    }

    async fn on_discovered(self: &Arc<Self>, peer: PeerId) {
        (self.on_peer_discovered)(peer.clone());

        if self.sessions.contains_key(&peer) {
            return;
        }
        if !self.pending_connects.insert(peer.clone()) {
            return;
        }
        self.join_group(peer.clone()).await;
        self.pending_connects.remove_if(&peer, |_| true);
    }

    async fn join_group(self: &Arc<Self>, peer: PeerId) {
        let joined = tokio::time::timeout(self.connect_timeout, self.bridge.connect(&peer)).await;
        match joined {
            Ok(Ok(stream)) => self.adopt(peer, stream).await,
            Ok(Err(err)) => log::warn!("Wi-Fi Direct: group join with {peer} failed: {err}"),
            Err(_) => log::debug!(
                "Wi-Fi Direct: group join with {peer} timed out after {:?}",
                self.connect_timeout
            ),
        }
    }

    async fn adopt(self: &Arc<Self>, peer: PeerId, stream: Box<dyn MeshStream>) {
        let session = Arc::new(DirectSession { stream: AsyncMutex::new(stream) });
        self.sessions.insert(peer.clone(), session.clone());

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.read_loop(peer, session).await;
        });
    }

    async fn read_loop(self: Arc<Self>, peer: PeerId, session: Arc<DirectSession>) {
        let mut buf = vec![0u8; DIRECT_READ_BUFFER];
        loop {
            let read = {
                let mut stream = session.stream.lock().await;
                stream.read(&mut buf).await
            };
            match read {
                Ok(0) | Err(_) => {
                    log::debug!("Wi-Fi Direct: group session with {peer} ended");
                    self.sessions.remove(&peer);
                    return;
                }
                Ok(n) => (self.on_data_received)(peer.clone(), buf[..n].to_vec()),
            }
        }
    }
}

#[async_trait]
impl<B: WifiDirectBridge + 'static> Transport for WifiDirectTransport<B> {
    fn bearer(&self) -> Bearer {
        Bearer::WifiDirect
    }

    fn is_available(&self) -> bool {
        self.platform.is_wifi_direct_available() && self.bridge.is_available()
    }

    async fn start(&self) -> Result<()> {
        if !self.bridge.is_available() {
            return Err(Error::Unsupported("Wi-Fi Direct not supported on this platform".into()));
        }
        self.bridge.start_discovery().await?;
        self.discovering.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let peers: Vec<PeerId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for peer in peers {
            self.sessions.remove(&peer);
            let _ = self.bridge.disconnect(&peer).await;
        }
        self.pending_connects.clear();

        if self.discovering.swap(false, Ordering::SeqCst) {
            let _ = self.bridge.stop_discovery().await;
        }
        Ok(())
    }

    async fn send(&self, peer: &PeerId, frame: &[u8]) -> bool {
        let Some(session) = self.sessions.get(peer).map(|s| s.clone()) else {
            return false;
        };
        let mut stream = session.stream.lock().await;
        stream.write_all(frame).await.is_ok()
    }

    async fn cleanup(&self) -> Result<()> {
        self.stop().await
    }
}

/// Bridges the bridge-facing `WifiDirectEvents` callback (sync, invoked
/// from whatever thread the platform's discovery callback arrives on) into
/// the transport's own async handling by spawning a task per event.
struct DirectEventsSink<B: WifiDirectBridge + 'static>(Arc<WifiDirectTransport<B>>);

impl<B: WifiDirectBridge + 'static> WifiDirectEvents for DirectEventsSink<B> {
    fn on_peer_discovered(&self, peer: PeerId) {
        let transport = Arc::clone(&self.0);
        tokio::spawn(async move {
            transport.on_discovered(peer).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_on_unsupported_bridge_reports_unsupported() {
        let transport = WifiDirectTransport::new(
            Arc::new(crate::platform::NullPlatformHost),
            Arc::new(NullWifiDirectBridge),
            DIRECT_CONNECT_TIMEOUT,
            |_| {},
            |_, _| {},
        );
        assert!(matches!(transport.start().await, Err(Error::Unsupported(_))));
    }

    #[tokio::test]
    async fn send_to_unconnected_peer_returns_false() {
        let transport = WifiDirectTransport::new(
            Arc::new(crate::platform::NullPlatformHost),
            Arc::new(NullWifiDirectBridge),
            DIRECT_CONNECT_TIMEOUT,
            |_| {},
            |_, _| {},
        );
        assert!(!transport.send(&PeerId::from("nobody"), b"hi").await);
    }

    #[tokio::test]
    async fn duplicate_discovery_dispatch_is_deduped_by_pending_set() {
        let transport = WifiDirectTransport::new(
            Arc::new(crate::platform::NullPlatformHost),
            Arc::new(NullWifiDirectBridge),
            DIRECT_CONNECT_TIMEOUT,
            |_| {},
            |_, _| {},
        );
        let peer = PeerId::from("peer-a");
        assert!(transport.pending_connects.insert(peer.clone()));
        assert!(!transport.pending_connects.insert(peer));
    }

    #[tokio::test]
    async fn direct_port_and_timeout_match_aware_constants() {
        assert_eq!(DIRECT_PORT, super::super::wifi_aware::AWARE_PORT);
        assert_eq!(DIRECT_CONNECT_TIMEOUT, super::super::wifi_aware::AWARE_CONNECT_TIMEOUT);
    }
}
