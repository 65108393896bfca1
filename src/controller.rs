//! Idempotent actuation primitives
//!
//! Every operation takes validated intent, performs the hardware write
//! through the shared gateway, and reports success as a plain bool. No
//! gateway failure propagates: unsupported features and permission
//! problems are logged and swallowed so one missing knob never takes the
//! daemon down.

use log::{debug, error, info, warn};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::DaemonConfig;
use crate::monitor::PowerState;
use crate::profile::GovernorOverride;
use crate::sysfs::{HardwareError, SharedHardware};

const OVERRIDE_FILE: &str = "governor_override";

/// Governors ordered from least power-hungry, used when none is configured.
const POWERSAVE_PREFERENCE: &[&str] = &["powersave", "conservative", "ondemand", "schedutil"];
/// Governors ordered from most performant, used when none is configured.
const PERFORMANCE_PREFERENCE: &[&str] = &["performance", "schedutil", "ondemand"];

pub struct PowerController {
    hw: SharedHardware,
    config: Arc<DaemonConfig>,
    state_dir: PathBuf,
}

impl PowerController {
    pub fn new(hw: SharedHardware, config: Arc<DaemonConfig>, state_dir: PathBuf) -> Self {
        Self {
            hw,
            config,
            state_dir,
        }
    }

    fn override_path(&self) -> PathBuf {
        self.state_dir.join(OVERRIDE_FILE)
    }

    /// Read the persisted manual governor override. A missing file means
    /// no override is active.
    pub fn gov_override(&self) -> GovernorOverride {
        match fs::read_to_string(self.override_path()) {
            Ok(content) => GovernorOverride::from_persisted(&content),
            Err(_) => GovernorOverride::Default,
        }
    }

    /// Persist or clear the manual governor override.
    pub fn set_gov_override(&self, option: GovernorOverride) -> bool {
        let path = self.override_path();
        match option {
            GovernorOverride::Default => match fs::remove_file(&path) {
                Ok(()) => {
                    info!("cleared governor override");
                    true
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
                Err(e) => {
                    error!("failed to clear governor override {}: {}", path.display(), e);
                    false
                }
            },
            _ => {
                if let Err(e) = fs::create_dir_all(&self.state_dir) {
                    error!(
                        "failed to create state directory {}: {}",
                        self.state_dir.display(),
                        e
                    );
                    return false;
                }
                match fs::write(&path, option.as_str()) {
                    Ok(()) => {
                        info!("governor override set to {}", option);
                        true
                    }
                    Err(e) => {
                        error!("failed to persist governor override: {}", e);
                        false
                    }
                }
            }
        }
    }

    /// Whether turbo is currently enabled; read failures count as off.
    pub fn turbo_enabled(&self) -> bool {
        self.hw
            .lock()
            .unwrap()
            .read_turbo_state()
            .unwrap_or(false)
    }

    /// Enable or disable turbo boost. Skips the write when the hardware is
    /// already in the requested state.
    pub fn set_turbo(&self, on: bool) -> bool {
        let mut hw = self.hw.lock().unwrap();

        match hw.read_turbo_state() {
            Ok(current) if current == on => {
                debug!("turbo already {}", if on { "on" } else { "off" });
                return true;
            }
            Ok(_) => {}
            Err(e) if e.is_unsupported() => {
                info!("turbo control not available: {}", e);
                return false;
            }
            // Read failed but the knob may still be writable; try anyway.
            Err(e) => warn!("could not read turbo state: {}", e),
        }

        match hw.write_turbo_state(on) {
            Ok(()) => {
                info!("turbo {}", if on { "enabled" } else { "disabled" });
                true
            }
            Err(e) => {
                log_actuation_failure("set turbo", &e);
                false
            }
        }
    }

    /// Apply the configured (or hardware-default) frequency limits for the
    /// given power source. Out-of-range configuration is rejected, not
    /// clamped.
    pub fn set_frequencies(&self, power: PowerState) -> bool {
        let (cfg_min, cfg_max) = match power {
            PowerState::Ac => (self.config.ac_min_freq_mhz, self.config.ac_max_freq_mhz),
            PowerState::Battery => (
                self.config.battery_min_freq_mhz,
                self.config.battery_max_freq_mhz,
            ),
        };

        let mut hw = self.hw.lock().unwrap();

        let (hw_min, hw_max) = match hw.hardware_frequency_limits() {
            Ok(limits) => limits,
            Err(e) => {
                log_actuation_failure("read hardware frequency limits", &e);
                return false;
            }
        };

        let min = cfg_min.map(mhz_to_khz).unwrap_or(hw_min);
        let max = cfg_max.map(mhz_to_khz).unwrap_or(hw_max);

        if min >= max {
            error!(
                "inconsistent frequency limits: min {} kHz >= max {} kHz",
                min, max
            );
            return false;
        }
        if min < hw_min || max > hw_max {
            error!(
                "configured frequency limits {}..{} kHz outside hardware range {}..{} kHz",
                min, max, hw_min, hw_max
            );
            return false;
        }

        match hw.read_frequency_limits() {
            Ok(current) if current == (min, max) => {
                debug!("frequency limits already {}..{} kHz", min, max);
                return true;
            }
            Ok(_) => {}
            Err(e) => warn!("could not read current frequency limits: {}", e),
        }

        match hw.write_frequency_limits(min, max) {
            Ok(()) => {
                info!("frequency limits set to {}..{} kHz", min, max);
                true
            }
            Err(e) => {
                log_actuation_failure("set frequency limits", &e);
                false
            }
        }
    }

    /// Apply the ACPI platform profile for the given power source. The
    /// target must be one of the firmware's advertised choices.
    pub fn set_platform_profile(&self, power: PowerState) -> bool {
        let target = match power {
            PowerState::Ac => self
                .config
                .ac_platform_profile
                .clone()
                .unwrap_or_else(|| "balanced".to_string()),
            PowerState::Battery => self
                .config
                .battery_platform_profile
                .clone()
                .unwrap_or_else(|| "low-power".to_string()),
        };

        let mut hw = self.hw.lock().unwrap();

        match hw.platform_profile_choices() {
            Ok(choices) => {
                if !choices.iter().any(|c| c == &target) {
                    warn!(
                        "platform profile '{}' not offered by firmware ({})",
                        target,
                        choices.join(" ")
                    );
                    return false;
                }
            }
            Err(e) if e.is_unsupported() => {
                info!("platform profile not available: {}", e);
                return false;
            }
            Err(e) => warn!("could not list platform profiles: {}", e),
        }

        match hw.write_platform_profile(&target) {
            Ok(()) => {
                info!("platform profile set to {}", target);
                true
            }
            Err(e) => {
                log_actuation_failure("set platform profile", &e);
                false
            }
        }
    }

    /// Apply the energy-performance bias for the given power source.
    pub fn set_energy_perf_bias(&self, power: PowerState) -> bool {
        let target = match power {
            PowerState::Ac => self
                .config
                .ac_energy_perf_bias
                .clone()
                .unwrap_or_else(|| "balance_performance".to_string()),
            PowerState::Battery => self
                .config
                .battery_energy_perf_bias
                .clone()
                .unwrap_or_else(|| "balance_power".to_string()),
        };

        match self.hw.lock().unwrap().write_energy_perf_bias(&target) {
            Ok(()) => {
                info!("energy performance bias set to {}", target);
                true
            }
            Err(e) => {
                log_actuation_failure("set energy performance bias", &e);
                false
            }
        }
    }

    /// Switch to the power-saving governor. Skipped while a manual
    /// override is active unless `force` is set.
    pub fn set_powersave_gov(&self, force: bool) -> bool {
        self.set_governor(
            self.config.battery_governor.as_deref(),
            POWERSAVE_PREFERENCE,
            force,
        )
    }

    /// Switch to the performance governor. Skipped while a manual
    /// override is active unless `force` is set.
    pub fn set_performance_gov(&self, force: bool) -> bool {
        self.set_governor(
            self.config.ac_governor.as_deref(),
            PERFORMANCE_PREFERENCE,
            force,
        )
    }

    fn set_governor(&self, configured: Option<&str>, preference: &[&str], force: bool) -> bool {
        if !force {
            let active = self.gov_override();
            if active != GovernorOverride::Default {
                warn!(
                    "manual governor override '{}' active, skipping automatic governor change",
                    active
                );
                return false;
            }
        }

        let mut hw = self.hw.lock().unwrap();

        let available = match hw.available_governors() {
            Ok(governors) => governors,
            Err(e) => {
                log_actuation_failure("list available governors", &e);
                return false;
            }
        };

        let target = match configured {
            Some(gov) if available.iter().any(|g| g == gov) => gov.to_string(),
            Some(gov) => {
                warn!("configured governor '{}' not available", gov);
                return false;
            }
            None => match preference
                .iter()
                .find(|p| available.iter().any(|g| g == *p))
            {
                Some(gov) => gov.to_string(),
                None => {
                    warn!(
                        "no suitable governor among available ({})",
                        available.join(" ")
                    );
                    return false;
                }
            },
        };

        match hw.read_governor() {
            Ok(current) if current == target => {
                debug!("governor already {}", target);
                return true;
            }
            Ok(_) => {}
            Err(e) => warn!("could not read current governor: {}", e),
        }

        match hw.write_governor(&target) {
            Ok(()) => {
                info!("governor set to {}", target);
                true
            }
            Err(e) => {
                log_actuation_failure("set governor", &e);
                false
            }
        }
    }

    /// Apply the configured battery charge stop threshold.
    pub fn apply_battery_threshold(&self, percent: u8) -> bool {
        match self.hw.lock().unwrap().write_battery_threshold(percent) {
            Ok(()) => {
                info!("battery charge threshold set to {}%", percent);
                true
            }
            Err(e) => {
                log_actuation_failure("set battery charge threshold", &e);
                false
            }
        }
    }
}

fn mhz_to_khz(mhz: u32) -> u32 {
    mhz.saturating_mul(1000)
}

fn log_actuation_failure(what: &str, err: &HardwareError) {
    if err.is_unsupported() {
        info!("{}: {}", what, err);
    } else {
        warn!("{} failed: {}", what, err);
    }
}
