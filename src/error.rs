//! Crate-wide error type.
//!
//! Mirrors the taxonomy of the transport subsystem: permission, support,
//! transient I/O, protocol and lifecycle failures. Internal subsystem code
//! returns `Result<T>` so `?` composes; the public `TransportManager` and
//! bearer surfaces downgrade every `Err` to a `bool`/logged event at the
//! boundary, per the propagation policy, so callers of this crate never see
//! this type on the hot send/receive path.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("platform bridge error: {0}")]
    Platform(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[cfg(target_os = "android")]
    #[error("JNI error: {0}")]
    Jni(#[from] jni::errors::Error),

    #[cfg(target_os = "linux")]
    #[error("D-Bus error: {0}")]
    Zbus(#[from] zbus::Error),
}

impl From<std::ffi::NulError> for Error {
    fn from(err: std::ffi::NulError) -> Self {
        Error::Platform(format!("null byte in C string: {err}"))
    }
}
