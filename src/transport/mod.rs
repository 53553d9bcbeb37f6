//! Transport abstraction and per-bearer subsystems.
//!
//! Every bearer (BLE, Wi-Fi Aware, Wi-Fi Direct) implements the same
//! capability set so `TransportManager` can drive them through one
//! trait object per §9's "dynamic dispatch / polymorphism" design note,
//! rather than a hand-rolled tagged union.

pub mod ble;
pub mod manager;
pub mod wifi_aware;
pub mod wifi_direct;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::types::{Bearer, PeerId};

/// A bidirectional byte stream standing in for an OS-provided socket
/// (Aware network socket, Wi-Fi Direct group stream, L2CAP channel).
/// Exists so the reader-loop code in `wifi_aware`, `wifi_direct`, and
/// `ble::l2cap` is written once against a trait object instead of three
/// concrete socket types.
pub trait MeshStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> MeshStream for T {}

/// Capability set shared by every bearer subsystem: start, stop, send,
/// is_available, cleanup. `TransportManager` depends only on this trait
/// plus the fixed cascade order in `Bearer::CASCADE_ORDER`.
#[async_trait]
pub trait Transport: Send + Sync {
    fn bearer(&self) -> Bearer;

    /// Whether the platform can run this bearer at all. `false` means the
    /// subsystem should not be started; it is not a runtime toggle (see
    /// `TransportManager::enable`/`disable` for that).
    fn is_available(&self) -> bool;

    async fn start(&self) -> Result<()>;

    /// Idempotent: calling `stop` on an already-stopped transport releases
    /// no further resources and returns `Ok(())`.
    async fn stop(&self) -> Result<()>;

    /// Sends one frame to `peer`. Never throws; failures are folded into
    /// `false` per the crate's propagation policy.
    async fn send(&self, peer: &PeerId, frame: &[u8]) -> bool;

    /// `stop` plus release of any scheduler/task-scope handle. Crash-safe:
    /// safe to call even if construction or `start` partially failed.
    async fn cleanup(&self) -> Result<()>;
}
