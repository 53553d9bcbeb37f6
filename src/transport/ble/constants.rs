//! Bit-exact BLE protocol constants.

use std::time::Duration;
use uuid::Uuid;

pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x6E400001_B5A3_F393_E0A9_E50E24DCCA9E);
pub const MESSAGE_CHAR_UUID: Uuid = Uuid::from_u128(0x6E400002_B5A3_F393_E0A9_E50E24DCCA9E);
pub const SYNC_CHAR_UUID: Uuid = Uuid::from_u128(0x6E400003_B5A3_F393_E0A9_E50E24DCCA9E);
pub const IDENTITY_CHAR_UUID: Uuid = Uuid::from_u128(0x6E400004_B5A3_F393_E0A9_E50E24DCCA9E);

/// Insecure L2CAP PSM used for the high-throughput stream path.
pub const L2CAP_PSM: u16 = 0x1001;

pub const LOCAL_NAME: &str = "SCMesh";

/// Advertised identity payload bound; the GATT Identity characteristic may
/// carry a larger token and is not subject to this limit.
pub const MAX_ADVERTISED_IDENTITY_BYTES: usize = 24;

pub const MAX_MTU: u16 = 512;

/// Header is `total_fragments` (u16 LE) followed by `fragment_index` (u16 LE).
pub const FRAGMENT_HEADER_LEN: usize = 4;

pub const DEFAULT_PRIVACY_ROTATION_SECS: u64 = 900;

/// Scheduled Identity-characteristic refresh reads, relative to the moment
/// service discovery completes on the GATT client.
pub const IDENTITY_REFRESH_DELAYS: [Duration; 2] =
    [Duration::from_millis(900), Duration::from_millis(2200)];

pub const MAX_GATT_CONNECTIONS: usize = 5;

/// Dedup TTL for repeat advertisements from the same remote identifier.
pub const SCANNER_DEDUP_TTL: Duration = Duration::from_secs(5);

/// Returns the maximum fragment payload for a negotiated MTU, per
/// `min(MTU, MAX_MTU) - FRAGMENT_HEADER_LEN`.
pub fn max_fragment_payload(negotiated_mtu: u16) -> usize {
    negotiated_mtu.min(MAX_MTU) as usize - FRAGMENT_HEADER_LEN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_uuid_is_bit_exact() {
        assert_eq!(
            SERVICE_UUID.to_string().to_uppercase(),
            "6E400001-B5A3-F393-E0A9-E50E24DCCA9E"
        );
    }

    #[test]
    fn max_fragment_payload_clamps_to_max_mtu() {
        assert_eq!(max_fragment_payload(1024), (512 - 4) as usize);
        assert_eq!(max_fragment_payload(185), (185 - 4) as usize);
    }
}
