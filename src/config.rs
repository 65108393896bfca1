//! Daemon configuration
//!
//! The control loop consumes these values as plain field lookups; every
//! field has a sensible default so the daemon runs without a config file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::Result;

/// Default location of the daemon configuration file.
pub const CONFIG_PATH: &str = "/etc/power-profile-daemon/config.json";

/// Default location of persisted daemon state (governor override).
pub const STATE_DIR: &str = "/var/lib/power-profile-daemon";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Profile applied when no hold is active: power-saver, balanced, performance
    pub base_profile: String,

    /// Sensor poll interval for the monitoring loops
    pub poll_interval_ms: u64,

    /// How long a load state must be sustained before turbo is actuated
    pub turbo_debounce_secs: u64,

    /// Governor used on AC; unset picks the most performant available
    pub ac_governor: Option<String>,
    /// Governor used on battery; unset picks the least power-hungry available
    pub battery_governor: Option<String>,

    /// Frequency limits in MHz; unset falls back to the hardware bounds
    pub ac_min_freq_mhz: Option<u32>,
    pub ac_max_freq_mhz: Option<u32>,
    pub battery_min_freq_mhz: Option<u32>,
    pub battery_max_freq_mhz: Option<u32>,

    /// Energy-performance bias values; unset uses balance_performance on AC
    /// and balance_power on battery
    pub ac_energy_perf_bias: Option<String>,
    pub battery_energy_perf_bias: Option<String>,

    /// ACPI platform profile values; unset uses balance_performance on AC
    /// and balance_power on battery where supported
    pub ac_platform_profile: Option<String>,
    pub battery_platform_profile: Option<String>,

    /// Battery charge stop threshold applied once at startup, in percent
    pub battery_charge_threshold: Option<u8>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            base_profile: "balanced".to_string(),
            poll_interval_ms: 500,
            turbo_debounce_secs: 10,
            ac_governor: None,
            battery_governor: None,
            ac_min_freq_mhz: None,
            ac_max_freq_mhz: None,
            battery_min_freq_mhz: None,
            battery_max_freq_mhz: None,
            ac_energy_perf_bias: None,
            battery_energy_perf_bias: None,
            ac_platform_profile: None,
            battery_platform_profile: None,
            battery_charge_threshold: None,
        }
    }
}

impl DaemonConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let config: DaemonConfig = serde_json::from_str(&json)?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Load the configuration, falling back to defaults when the file is
    /// missing. A present-but-broken file is an error; silently ignoring it
    /// would mask typos in hand-edited configs.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn config_path() -> PathBuf {
        PathBuf::from(CONFIG_PATH)
    }
}
