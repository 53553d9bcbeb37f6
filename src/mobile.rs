//! Synchronous mobile facade, feature-gated behind `mobile-ffi`.
//!
//! `MeshTransport` wraps `Arc<TransportManager>` and exposes the same
//! imperative surface the manager offers the core, but synchronously: every
//! method either runs fast inline state or dispatches onto a
//! lazily-initialized global multi-thread Tokio runtime via
//! `runtime().block_on(...)`. A JNI or Swift callback thread calling into
//! this module is never itself inside a Tokio context, so it cannot `.await`
//! anything; this is the dedicated-runtime-behind-a-sync-facade bridge for
//! that case.
//!
//! Bearers and identifiers cross the FFI boundary as plain strings rather
//! than the `Bearer`/`PeerId` newtypes, since those aren't themselves
//! UniFFI-exported types.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use tokio::runtime::Runtime;

use crate::config::TransportConfig;
use crate::platform::{BleAdapterState, CoreSink, PlatformCapability, PlatformHost};
use crate::transport::manager::TransportManager;
use crate::types::{Bearer, Frame, PeerId};

uniffi::setup_scaffolding!();

static RUNTIME: OnceCell<Runtime> = OnceCell::new();

fn runtime() -> &'static Runtime {
    RUNTIME.get_or_init(|| Runtime::new().expect("failed to start the mobile facade's Tokio runtime"))
}

fn bearer_name(bearer: Bearer) -> String {
    bearer.to_string()
}

fn parse_bearer(name: &str) -> Option<Bearer> {
    match name {
        "BLE" => Some(Bearer::Ble),
        "WIFI_AWARE" => Some(Bearer::WifiAware),
        "WIFI_DIRECT" => Some(Bearer::WifiDirect),
        "INTERNET" => Some(Bearer::Internet),
        _ => None,
    }
}

/// Foreign-implemented callback sink: the mobile host implements this in
/// Kotlin or Swift and passes an instance in at construction time. Every
/// method may fire on whatever OS callback thread the bearer subsystem that
/// observed the event happens to be running on, same contract as `CoreSink`.
#[uniffi::export(with_foreign)]
pub trait MeshEventSink: Send + Sync {
    fn on_peer_discovered(&self, peer_id: String, bearer: String);
    fn on_data_received(&self, peer_id: String, bytes: Vec<u8>, bearer: String);
}

struct SinkAdapter(Arc<dyn MeshEventSink>);

impl CoreSink for SinkAdapter {
    fn on_peer_discovered(&self, peer_id: &PeerId, bearer: Bearer) {
        self.0.on_peer_discovered(peer_id.to_string(), bearer_name(bearer));
    }
    fn on_data_received(&self, peer_id: &PeerId, bytes: Frame, bearer: Bearer) {
        self.0.on_data_received(peer_id.to_string(), bytes, bearer_name(bearer));
    }
}

/// Reports every capability absent. A future revision can expose a foreign
/// `PlatformHost` the same way `MeshEventSink` crosses the boundary today;
/// until then, the facade is reachable and testable from mobile code but
/// every bearer reports unavailable, same as running the diagnostic binary
/// with no platform bridge wired in.
struct NullMobileHost;

impl PlatformHost for NullMobileHost {
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

/// UniFFI-exported handle a mobile host holds for the lifetime of its
/// process. Construct once; `start_all`/`stop_all` drive every enabled
/// bearer's lifecycle, `send`/`enable`/`disable`/`available_transports`
/// mirror `TransportManager`'s own surface.
#[derive(uniffi::Object)]
pub struct MeshTransport {
    manager: Arc<TransportManager>,
}

#[uniffi::export]
impl MeshTransport {
    /// `config_toml` is an optional TOML document parsed the same way the
    /// diagnostic binary's `--config` flag is; `None` or malformed input
    /// falls back to `TransportConfig::default()` rather than failing
    /// construction, since a mobile host has no good recovery path for a
    /// constructor throwing across the FFI boundary.
    #[uniffi::constructor]
    pub fn new(config_toml: Option<String>, sink: Arc<dyn MeshEventSink>) -> Arc<Self> {
        crate::logging::init();
        let config = config_toml
            .and_then(|raw| TransportConfig::from_toml_str(&raw).ok())
            .unwrap_or_default();

        let manager = TransportManager::new(Arc::new(NullMobileHost), Arc::new(SinkAdapter(sink)), config);
        manager.initialize(true, true, true);
        Arc::new(Self { manager })
    }

    pub fn start_all(&self) {
        runtime().block_on(self.manager.start_all());
    }

    pub fn stop_all(&self) {
        runtime().block_on(self.manager.stop_all());
    }

    pub fn cleanup(&self) {
        runtime().block_on(self.manager.cleanup());
    }

    pub fn send(&self, peer_id: String, frame: Vec<u8>) -> bool {
        runtime().block_on(self.manager.send(&PeerId::from(peer_id), &frame))
    }

    /// `bearer` must be one of `"BLE"`, `"WIFI_AWARE"`, `"WIFI_DIRECT"`; any
    /// other value reports `false` rather than throwing.
    pub fn enable(&self, bearer: String) -> bool {
        let Some(bearer) = parse_bearer(&bearer) else {
            return false;
        };
        runtime().block_on(self.manager.enable(bearer))
    }

    pub fn disable(&self, bearer: String) -> bool {
        let Some(bearer) = parse_bearer(&bearer) else {
            return false;
        };
        runtime().block_on(self.manager.disable(bearer))
    }

    pub fn available_transports(&self) -> Vec<String> {
        self.manager.available_transports().into_iter().map(bearer_name).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingSink;
    impl MeshEventSink for RecordingSink {
        fn on_peer_discovered(&self, _peer_id: String, _bearer: String) {}
        fn on_data_received(&self, _peer_id: String, _bytes: Vec<u8>, _bearer: String) {}
    }

    #[test]
    fn unknown_bearer_name_is_rejected_without_panicking() {
        let facade = MeshTransport::new(None, Arc::new(RecordingSink));
        assert!(!facade.enable("NOT_A_BEARER".to_string()));
        assert!(!facade.disable("NOT_A_BEARER".to_string()));
    }

    #[test]
    fn fresh_facade_reports_no_available_transports() {
        let facade = MeshTransport::new(None, Arc::new(RecordingSink));
        assert!(facade.available_transports().is_empty());
    }

    #[test]
    fn send_to_unknown_peer_on_a_fresh_facade_reports_false() {
        let facade = MeshTransport::new(None, Arc::new(RecordingSink));
        assert!(!facade.send("nobody".to_string(), vec![1, 2, 3]));
    }
}
