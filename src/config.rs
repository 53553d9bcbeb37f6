//! Crate-level configuration.
//!
//! `TransportConfig` tunes already-specified knobs only; it never changes
//! protocol semantics. Defaults reproduce the bit-exact constants from the
//! BLE and Wi-Fi Aware component designs. The library never reads the
//! filesystem or environment on its own initiative — the host passes a
//! `TransportConfig` into `TransportManager::initialize`; loading one from
//! disk (for the diagnostic binary) is opt-in via `load_from`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::transport::ble::constants as ble_const;
use crate::transport::wifi_aware::{AWARE_CONNECT_TIMEOUT, AWARE_PORT};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    pub max_mtu: u16,
    pub scan_window_secs: u64,
    pub scan_interval_secs: u64,
    pub privacy_rotation_secs: u64,
    pub max_gatt_connections: usize,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            max_mtu: ble_const::MAX_MTU,
            scan_window_secs: 30,
            scan_interval_secs: 10,
            privacy_rotation_secs: ble_const::DEFAULT_PRIVACY_ROTATION_SECS,
            max_gatt_connections: ble_const::MAX_GATT_CONNECTIONS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AwareConfig {
    pub service_name: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
}

impl Default for AwareConfig {
    fn default() -> Self {
        Self {
            service_name: "scmessenger".to_string(),
            port: AWARE_PORT,
            connect_timeout_ms: AWARE_CONNECT_TIMEOUT.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectConfig {
    /// Open question resolved in DESIGN.md: Wi-Fi Direct reuses the Aware
    /// port/timeout constants rather than inventing its own.
    pub port: u16,
    pub connect_timeout_ms: u64,
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            port: AWARE_PORT,
            connect_timeout_ms: AWARE_CONNECT_TIMEOUT.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TransportConfig {
    pub ble: BleConfig,
    pub aware: AwareConfig,
    pub direct: DirectConfig,
}

impl TransportConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| Error::InvalidConfiguration(format!("malformed transport config: {e}")))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn aware_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.aware.connect_timeout_ms)
    }

    pub fn direct_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.direct.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let cfg = TransportConfig::default();
        assert_eq!(cfg.ble.max_mtu, 512);
        assert_eq!(cfg.ble.privacy_rotation_secs, 900);
        assert_eq!(cfg.aware.service_name, "scmessenger");
        assert_eq!(cfg.aware.port, 8765);
        assert_eq!(cfg.aware.connect_timeout_ms, 5000);
        assert_eq!(cfg.direct.port, 8765);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let cfg = TransportConfig::from_toml_str(
            r#"
            [ble]
            privacy_rotation_secs = 60
            "#,
        )
        .unwrap();
        assert_eq!(cfg.ble.privacy_rotation_secs, 60);
        assert_eq!(cfg.ble.max_mtu, 512);
    }

    #[test]
    fn malformed_toml_is_rejected() {
        assert!(TransportConfig::from_toml_str("not = [valid").is_err());
    }
}
