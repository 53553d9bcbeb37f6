//! Local transport multiplexer for the SCMesh mesh messenger.
//!
//! Unifies BLE, Wi-Fi Aware, and Wi-Fi Direct peer-to-peer bearers behind
//! one send/receive contract so the core never has to know which radio
//! carried a given frame. `transport::manager::TransportManager` is the
//! single entry point a host drives; `platform::PlatformHost` and
//! `platform::CoreSink` are the two traits a host implements to plug this
//! layer into its own runtime and permission model.

pub mod config;
pub mod error;
pub mod logging;
pub mod platform;
pub mod transport;
pub mod types;

#[cfg(feature = "mobile-ffi")]
pub mod mobile;

pub use config::TransportConfig;
pub use error::{Error, Result};
pub use platform::{CoreSink, PlatformHost};
pub use transport::manager::TransportManager;
pub use types::{Bearer, Frame, PeerId};
