//! Core data types shared by the manager and every bearer subsystem.

use std::fmt;

/// Maximum frame size accepted from the core: 256 KiB.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// A link-layer technology carrying frames.
///
/// `Internet` is a sentinel returned for introspection only; this crate
/// never constructs or drives an `Internet` bearer internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Bearer {
    Ble,
    WifiAware,
    WifiDirect,
    Internet,
}

impl Bearer {
    /// Fixed priority order used by the send cascade, highest first.
    pub const CASCADE_ORDER: [Bearer; 3] = [Bearer::WifiAware, Bearer::WifiDirect, Bearer::Ble];
}

impl fmt::Display for Bearer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Bearer::Ble => "BLE",
            Bearer::WifiAware => "WIFI_AWARE",
            Bearer::WifiDirect => "WIFI_DIRECT",
            Bearer::Internet => "INTERNET",
        };
        f.write_str(s)
    }
}

/// Bearer-local identifier for a remote endpoint. Opaque to this layer:
/// IDs minted by different bearers are never assumed equal here, even if
/// they happen to correspond to the same human peer at the core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An opaque byte sequence produced and consumed by the core. The
/// multiplexer never inspects contents except to attach fragmentation
/// headers that it owns.
pub type Frame = Vec<u8>;

/// Returns `Ok(())` if `frame` is within the size bound the core is allowed
/// to hand to this layer.
pub fn validate_frame(frame: &[u8]) -> crate::error::Result<()> {
    if frame.len() > MAX_FRAME_SIZE {
        return Err(crate::error::Error::Protocol(format!(
            "frame of {} bytes exceeds max {}",
            frame.len(),
            MAX_FRAME_SIZE
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cascade_order_is_aware_then_direct_then_ble() {
        assert_eq!(
            Bearer::CASCADE_ORDER,
            [Bearer::WifiAware, Bearer::WifiDirect, Bearer::Ble]
        );
    }

    #[test]
    fn frame_at_exactly_max_size_is_valid() {
        let frame = vec![0u8; MAX_FRAME_SIZE];
        assert!(validate_frame(&frame).is_ok());
    }

    #[test]
    fn frame_over_max_size_is_rejected() {
        let frame = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(validate_frame(&frame).is_err());
    }

    #[test]
    fn peer_id_display_roundtrips_the_raw_string() {
        let id = PeerId::from("AA:BB:CC:DD:EE:FF");
        assert_eq!(id.to_string(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(id.as_str(), "AA:BB:CC:DD:EE:FF");
    }
}
