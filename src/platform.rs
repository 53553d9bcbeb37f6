//! External interfaces consumed by / exposed to the core.
//!
//! `PlatformHost` is the OS-capability facade this layer queries; it never
//! prompts the user itself. `CoreSink` is where discovered peers and
//! inbound frames are posted. Both traits are invoked from arbitrary OS
//! callback threads, so every implementation must be `Send + Sync` and use
//! only `&self` methods.

use crate::types::{Bearer, Frame, PeerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BleAdapterState {
    Unknown,
    Off,
    On,
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformCapability {
    BleScan,
    BleAdvertise,
    BleConnect,
    WifiAwarePublish,
    WifiAwareSubscribe,
    WifiDirectDiscovery,
}

/// OS capabilities queried by the bearer subsystems. This layer never asks
/// the user for permission; it only observes state already granted.
pub trait PlatformHost: Send + Sync {
    fn ble_adapter_state(&self) -> BleAdapterState;
    fn is_wifi_aware_available(&self) -> bool;
    fn is_wifi_direct_available(&self) -> bool;
    fn has_permission(&self, capability: PlatformCapability) -> bool;
}

/// Where discovered peers and inbound frames are posted. Both methods MUST
/// be safe to invoke from arbitrary threads, including OS callback threads
/// that are not part of any Tokio runtime.
pub trait CoreSink: Send + Sync {
    fn on_peer_discovered(&self, peer_id: &PeerId, bearer: Bearer);
    fn on_data_received(&self, peer_id: &PeerId, bytes: Frame, bearer: Bearer);
}

/// A `PlatformHost` reporting every capability absent. Used as the default
/// when no platform bridge is available for the current target, and as a
/// test fixture.
pub struct NullPlatformHost;

impl PlatformHost for NullPlatformHost {
    fn ble_adapter_state(&self) -> BleAdapterState {
        BleAdapterState::Unsupported
    }

    fn is_wifi_aware_available(&self) -> bool {
        false
    }

    fn is_wifi_direct_available(&self) -> bool {
        false
    }

    fn has_permission(&self, _capability: PlatformCapability) -> bool {
        false
    }
}
