//! BLE GATT client: connects to discovered peripherals, negotiates MTU,
//! drives the per-session state machine, schedules identity refresh reads,
//! and serializes writes through a single-in-flight queue.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::types::{Frame, PeerId};

use super::constants::{IDENTITY_REFRESH_DELAYS, MAX_GATT_CONNECTIONS, MAX_MTU};
use super::{BleCentralBridge, GattClientEvents};

/// Per-session connection state, per §4.2.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    DiscoveringServices,
    Connected,
    Disconnected,
}

/// Single-in-flight write queue. The completion callback (here: the await
/// on `bridge.write_message` resolving) pops the next fragment; a failed
/// write abandons the remainder of the queue with no automatic retry.
#[derive(Default)]
struct WriteQueue {
    pending: VecDeque<Vec<u8>>,
    pumping: bool,
}

pub trait IdentitySink: Send + Sync {
    fn on_identity_beacon(&self, peripheral: &PeerId, bytes: Vec<u8>);
}

struct Session {
    state: parking_lot::Mutex<ClientState>,
    write_queue: AsyncMutex<WriteQueue>,
    refresh_tasks: AsyncMutex<Vec<JoinHandle<()>>>,
    /// MTU this peripheral actually granted, per §4.2.5. Fragmenting for
    /// this peripheral must use this value, not the ceiling requested at
    /// construction: a peripheral that grants less than `MAX_MTU` would
    /// otherwise receive fragments too large for its ATT MTU.
    negotiated_mtu: AtomicU16,
}

pub struct BleGattClient<B: BleCentralBridge + 'static> {
    bridge: Arc<B>,
    max_mtu: AtomicU16,
    sessions: DashMap<PeerId, Arc<Session>>,
    sink: Arc<dyn GattServerSinkAdapter>,
    identity_sink: Arc<dyn IdentitySink>,
}

/// The GATT client reuses `GattServerSink`'s shape (peer, frame) for
/// delivering reassembled Message notifications, but over a distinct trait
/// so a `BleGattServer` and a `BleGattClient` can be given different sinks
/// without either depending on the other's module.
pub trait GattServerSinkAdapter: Send + Sync {
    fn on_data_received(&self, peripheral: &PeerId, frame: Frame);
}

impl<B: BleCentralBridge + 'static> BleGattClient<B> {
    pub fn new(
        bridge: Arc<B>,
        max_mtu: u16,
        sink: Arc<dyn GattServerSinkAdapter>,
        identity_sink: Arc<dyn IdentitySink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            bridge,
            max_mtu: AtomicU16::new(max_mtu.min(MAX_MTU)),
            sessions: DashMap::new(),
            sink,
            identity_sink,
        })
    }

    pub fn connection_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn state_of(&self, peripheral: &PeerId) -> Option<ClientState> {
        self.sessions.get(peripheral).map(|s| *s.state.lock())
    }

    /// MTU actually granted by `peripheral`'s connection, or `None` if there
    /// is no session (not yet connected, or already torn down). Callers
    /// building fragments for a GATT-client write must use this rather than
    /// the configured ceiling, per §4.2.1's `min(MTU, 512) - 4` bound.
    pub fn negotiated_mtu(&self, peripheral: &PeerId) -> Option<u16> {
        self.sessions.get(peripheral).map(|s| s.negotiated_mtu.load(Ordering::SeqCst))
    }

    /// Connects to `peripheral`, negotiates MTU, discovers services, reads
    /// Identity, schedules the two refresh reads, and subscribes to Message
    /// notifications. Rejects new connections once the pool is full.
    pub async fn connect(self: &Arc<Self>, peripheral: &PeerId) -> Result<()> {
        if self.sessions.len() >= MAX_GATT_CONNECTIONS {
            return Err(Error::Lifecycle(format!(
                "GATT connection pool full ({MAX_GATT_CONNECTIONS} connections)"
            )));
        }
        if !self.bridge.is_available() {
            return Err(Error::Unsupported("no BLE central bridge on this platform".into()));
        }

        let session = Arc::new(Session {
            state: parking_lot::Mutex::new(ClientState::Connecting),
            write_queue: AsyncMutex::new(WriteQueue::default()),
            refresh_tasks: AsyncMutex::new(Vec::new()),
            negotiated_mtu: AtomicU16::new(self.max_mtu.load(Ordering::SeqCst)),
        });
        self.sessions.insert(peripheral.clone(), session.clone());

        let result = self.connect_inner(peripheral, &session).await;
        if let Err(ref err) = result {
            log::warn!("GATT client: connect to {peripheral} failed: {err}");
            self.teardown(peripheral, &session).await;
        }
        result
    }

    async fn connect_inner(self: &Arc<Self>, peripheral: &PeerId, session: &Arc<Session>) -> Result<()> {
        self.bridge.connect(peripheral, self.clone() as Arc<dyn GattClientEvents>).await?;

        let requested = self.max_mtu.load(Ordering::SeqCst);
        let granted = self.bridge.request_mtu(peripheral, requested).await.map_err(|err| {
            Error::TransientIo(format!("MTU negotiation with {peripheral} failed: {err}"))
        })?;
        session.negotiated_mtu.store(granted.min(requested), Ordering::SeqCst);
        *session.state.lock() = ClientState::DiscoveringServices;

        let has_mesh_service = self.bridge.discover_mesh_service(peripheral).await?;
        if !has_mesh_service {
            return Err(Error::Protocol(format!("{peripheral} does not host the mesh service")));
        }
        *session.state.lock() = ClientState::Connected;

        if let Ok(identity) = self.bridge.read_identity(peripheral).await {
            self.identity_sink.on_identity_beacon(peripheral, identity);
        }
        self.schedule_identity_refresh(peripheral.clone(), session.clone());

        self.bridge.subscribe_messages(peripheral).await?;
        Ok(())
    }

    fn schedule_identity_refresh(self: &Arc<Self>, peripheral: PeerId, session: Arc<Session>) {
        let tasks: Vec<JoinHandle<()>> = IDENTITY_REFRESH_DELAYS
            .iter()
            .map(|&delay| {
                let this = Arc::clone(self);
                let peripheral = peripheral.clone();
                let session = session.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if *session.state.lock() != ClientState::Connected {
                        return;
                    }
                    match this.bridge.read_identity(&peripheral).await {
                        Ok(bytes) => this.identity_sink.on_identity_beacon(&peripheral, bytes),
                        Err(err) => log::debug!("identity refresh read for {peripheral} failed: {err}"),
                    }
                })
            })
            .collect();
        if let Ok(mut guard) = session.refresh_tasks.try_lock() {
            *guard = tasks;
        }
    }

    /// Enqueues `fragment` for `peripheral`; if no write is currently
    /// pumping, spawns the pump. Returns `false` if the peripheral has no
    /// connected session.
    pub async fn send_fragment(self: &Arc<Self>, peripheral: &PeerId, fragment: Vec<u8>) -> bool {
        let Some(session) = self.sessions.get(peripheral).map(|s| s.clone()) else {
            return false;
        };
        if *session.state.lock() != ClientState::Connected {
            return false;
        }

        let mut queue = session.write_queue.lock().await;
        queue.pending.push_back(fragment);
        if queue.pumping {
            return true;
        }
        queue.pumping = true;
        drop(queue);

        let this = Arc::clone(self);
        let peripheral = peripheral.clone();
        tokio::spawn(async move {
            this.pump_writes(peripheral, session).await;
        });
        true
    }

    async fn pump_writes(self: Arc<Self>, peripheral: PeerId, session: Arc<Session>) {
        loop {
            let next = {
                let mut queue = session.write_queue.lock().await;
                match queue.pending.pop_front() {
                    Some(fragment) => fragment,
                    None => {
                        queue.pumping = false;
                        return;
                    }
                }
            };
            if let Err(err) = self.bridge.write_message(&peripheral, next, true).await {
                log::warn!("GATT client: write to {peripheral} failed, abandoning queue: {err}");
                let mut queue = session.write_queue.lock().await;
                queue.pending.clear();
                queue.pumping = false;
                return;
            }
        }
    }

    pub async fn disconnect(&self, peripheral: &PeerId) -> Result<()> {
        if let Some((_, session)) = self.sessions.remove(peripheral) {
            self.teardown(peripheral, &session).await;
        }
        Ok(())
    }

    async fn teardown(&self, peripheral: &PeerId, session: &Arc<Session>) {
        *session.state.lock() = ClientState::Disconnected;
        for handle in session.refresh_tasks.lock().await.drain(..) {
            handle.abort();
        }
        self.sessions.remove(peripheral);
        if let Err(err) = self.bridge.disconnect(peripheral).await {
            log::debug!("GATT client: disconnect from {peripheral} reported {err}");
        }
    }

    pub async fn stop(&self) -> Result<()> {
        let peripherals: Vec<PeerId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for peripheral in peripherals {
            self.disconnect(&peripheral).await?;
        }
        Ok(())
    }
}

impl<B: BleCentralBridge + 'static> GattClientEvents for BleGattClient<B> {
    fn on_message_notification(&self, peripheral: PeerId, fragment: Vec<u8>) {
        if self.sessions.get(&peripheral).is_none() {
            return;
        }
        self.sink.on_data_received(&peripheral, fragment);
    }

    fn on_disconnected(&self, peripheral: PeerId) {
        log::debug!("GATT client: {peripheral} disconnected by the OS");
        if let Some((_, session)) = self.sessions.remove(&peripheral) {
            *session.state.lock() = ClientState::Disconnected;
            tokio::spawn(async move {
                for handle in session.refresh_tasks.lock().await.drain(..) {
                    handle.abort();
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ble::NullBleCentralBridge;
    use std::sync::Mutex;

    struct RecordingSink {
        frames: Mutex<Vec<(PeerId, Frame)>>,
    }
    impl GattServerSinkAdapter for RecordingSink {
        fn on_data_received(&self, peripheral: &PeerId, frame: Frame) {
            self.frames.lock().unwrap().push((peripheral.clone(), frame));
        }
    }

    struct NullIdentitySink;
    impl IdentitySink for NullIdentitySink {
        fn on_identity_beacon(&self, _peripheral: &PeerId, _bytes: Vec<u8>) {}
    }

    #[tokio::test]
    async fn connect_on_unsupported_bridge_reports_unsupported() {
        let sink = Arc::new(RecordingSink { frames: Mutex::new(Vec::new()) });
        let client = BleGattClient::new(Arc::new(NullBleCentralBridge), 512, sink, Arc::new(NullIdentitySink));
        let peer = PeerId::from("peer-a");
        assert!(matches!(client.connect(&peer).await, Err(Error::Unsupported(_))));
        assert_eq!(client.connection_count(), 0);
    }

    #[tokio::test]
    async fn notification_for_unknown_peripheral_is_ignored() {
        let sink = Arc::new(RecordingSink { frames: Mutex::new(Vec::new()) });
        let client = BleGattClient::new(Arc::new(NullBleCentralBridge), 512, sink.clone(), Arc::new(NullIdentitySink));
        client.on_message_notification(PeerId::from("ghost"), vec![1, 2, 3]);
        assert!(sink.frames.lock().unwrap().is_empty());
    }

    #[test]
    fn negotiated_mtu_for_a_peripheral_with_no_session_is_none() {
        let sink = Arc::new(RecordingSink { frames: Mutex::new(Vec::new()) });
        let client = BleGattClient::new(Arc::new(NullBleCentralBridge), 512, sink, Arc::new(NullIdentitySink));
        assert_eq!(client.negotiated_mtu(&PeerId::from("nobody")), None);
    }
}
