//! `scmesh-cli`: a minimal diagnostic binary.
//!
//! Not part of the protocol surface — it exists only to smoke-test
//! `TransportManager` against whatever bearers the current platform
//! reports available, printing discovered peers and inbound frames to
//! stdout until interrupted.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use scmesh_transport::{Bearer, CoreSink, Frame, PeerId, PlatformHost, TransportConfig, TransportManager};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log filter passed to RUST_LOG-style tracing (e.g. "info", "debug")
    #[arg(short, long, default_value = "info")]
    verbosity: String,

    /// Path to a TOML transport config; defaults baked in when omitted
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Seconds to run before exiting
    #[arg(short, long, default_value = "10")]
    seconds: u64,
}

struct PrintingSink;

impl CoreSink for PrintingSink {
    fn on_peer_discovered(&self, peer_id: &PeerId, bearer: Bearer) {
        println!("peer discovered: {peer_id} via {bearer}");
    }
    fn on_data_received(&self, peer_id: &PeerId, bytes: Frame, bearer: Bearer) {
        println!("{} bytes from {peer_id} via {bearer}", bytes.len());
    }
}

/// Reports every capability unavailable, same as `NullPlatformHost`, plus a
/// log line per query so a user running this against real hardware can see
/// why a bearer never starts: no platform bridge ships a non-null
/// `PlatformHost` in this crate, that's the embedding host's job.
struct DiagnosticPlatform;

impl PlatformHost for DiagnosticPlatform {
    fn ble_adapter_state(&self) -> scmesh_transport::platform::BleAdapterState {
        scmesh_transport::platform::BleAdapterState::Unsupported
    }
    fn is_wifi_aware_available(&self) -> bool {
        false
    }
    fn is_wifi_direct_available(&self) -> bool {
        false
    }
    fn has_permission(&self, _capability: scmesh_transport::platform::PlatformCapability) -> bool {
        false
    }
}

#[tokio::main]
async fn main() -> scmesh_transport::Result<()> {
    let args = Args::parse();
    std::env::set_var("RUST_LOG", &args.verbosity);
    scmesh_transport::logging::init();

    let config = match &args.config {
        Some(path) => TransportConfig::load_from(path)?,
        None => TransportConfig::default(),
    };

    tracing::info!("starting scmesh-cli diagnostic session");

    let manager = TransportManager::new(Arc::new(DiagnosticPlatform), Arc::new(PrintingSink), config);
    manager.initialize(true, true, true);
    manager.start_all().await;

    println!("listening for {} second(s); no bearer is backed by real hardware in this binary", args.seconds);
    tokio::time::sleep(Duration::from_secs(args.seconds)).await;

    manager.cleanup().await;
    Ok(())
}
