//! Sysfs hardware gateway
//!
//! Narrow, fallible access to the kernel control points the daemon reads
//! and writes. Every operation distinguishes "this machine does not have
//! the feature" (`HardwareError::Unsupported`) from an actual I/O or
//! permission failure, so callers can skip missing features quietly while
//! still logging real errors.

use log::warn;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::monitor::PowerState;

const CPU_BASE: &str = "/sys/devices/system/cpu";
const HWMON_BASE: &str = "/sys/class/hwmon";
const POWER_SUPPLY_BASE: &str = "/sys/class/power_supply";
const PLATFORM_PROFILE: &str = "/sys/firmware/acpi/platform_profile";
const PROC_STAT: &str = "/proc/stat";
const PROC_LOADAVG: &str = "/proc/loadavg";

/// Gateway-level error type.
#[derive(Error, Debug)]
pub enum HardwareError {
    #[error("unsupported on this hardware: {0}")]
    Unsupported(String),

    #[error("permission denied writing {path}")]
    PermissionDenied { path: String },

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        source: io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        source: io::Error,
    },

    #[error("failed to parse {path}: {detail}")]
    Parse { path: String, detail: String },
}

impl HardwareError {
    /// True when the failure means the feature is absent rather than broken.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, HardwareError::Unsupported(_))
    }
}

/// Synchronous read/write contract the control loop depends on.
///
/// All hardware access is routed through one `SharedHardware` mutex, so
/// concurrent actuators (power handler, debounce task, thermal handler,
/// DBus service) never interleave writes to the same sysfs node.
pub trait PowerHardware: Send {
    fn read_power_state(&mut self) -> Result<PowerState, HardwareError>;
    /// Aggregate CPU usage in percent, measured as the /proc/stat delta
    /// since the previous call. The first call returns 0.0.
    fn read_cpu_usage(&mut self) -> Result<f32, HardwareError>;
    /// 1-minute load average.
    fn read_load_average(&mut self) -> Result<f32, HardwareError>;
    /// Per-sensor core temperatures in degrees Celsius.
    fn read_core_temperatures(&mut self) -> Result<Vec<f32>, HardwareError>;

    fn read_turbo_state(&mut self) -> Result<bool, HardwareError>;
    fn write_turbo_state(&mut self, on: bool) -> Result<(), HardwareError>;

    fn read_governor(&mut self) -> Result<String, HardwareError>;
    fn write_governor(&mut self, governor: &str) -> Result<(), HardwareError>;
    fn available_governors(&mut self) -> Result<Vec<String>, HardwareError>;

    /// Current scaling limits as (min, max) in kHz.
    fn read_frequency_limits(&mut self) -> Result<(u32, u32), HardwareError>;
    fn write_frequency_limits(&mut self, min: u32, max: u32) -> Result<(), HardwareError>;
    /// Absolute hardware bounds as (min, max) in kHz.
    fn hardware_frequency_limits(&mut self) -> Result<(u32, u32), HardwareError>;

    fn read_platform_profile(&mut self) -> Result<String, HardwareError>;
    fn write_platform_profile(&mut self, profile: &str) -> Result<(), HardwareError>;
    fn platform_profile_choices(&mut self) -> Result<Vec<String>, HardwareError>;

    fn read_energy_perf_bias(&mut self) -> Result<String, HardwareError>;
    fn write_energy_perf_bias(&mut self, value: &str) -> Result<(), HardwareError>;

    fn read_battery_threshold(&mut self) -> Result<u8, HardwareError>;
    fn write_battery_threshold(&mut self, percent: u8) -> Result<(), HardwareError>;
}

/// Shared handle serializing all hardware access.
pub type SharedHardware = Arc<Mutex<dyn PowerHardware>>;

fn read_sysfs(path: &Path) -> Result<String, HardwareError> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| HardwareError::Read {
            path: path.display().to_string(),
            source: e,
        })
}

fn write_sysfs(path: &Path, value: &str) -> Result<(), HardwareError> {
    fs::write(path, value).map_err(|e| match e.kind() {
        io::ErrorKind::PermissionDenied => HardwareError::PermissionDenied {
            path: path.display().to_string(),
        },
        _ => HardwareError::Write {
            path: path.display().to_string(),
            source: e,
        },
    })
}

fn parse_u64(path: &Path, content: &str) -> Result<u64, HardwareError> {
    content.parse::<u64>().map_err(|_| HardwareError::Parse {
        path: path.display().to_string(),
        detail: format!("expected integer, got '{}'", content),
    })
}

/// Which turbo control mechanism the running kernel exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurboControl {
    /// intel_pstate exposes an inverted "no_turbo" flag
    PstateNoTurbo,
    /// acpi-cpufreq and amd-pstate expose a direct "boost" flag
    CpufreqBoost,
    /// Neither mechanism present
    None,
}

/// Aggregate CPU times parsed from the first line of /proc/stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    total: u64,
    idle: u64,
}

impl CpuTimes {
    fn parse(stat: &str) -> Option<CpuTimes> {
        let line = stat.lines().find(|l| l.starts_with("cpu "))?;
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .filter_map(|f| f.parse().ok())
            .collect();
        if fields.len() < 5 {
            return None;
        }
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        let total: u64 = fields.iter().sum();
        Some(CpuTimes { total, idle })
    }
}

/// CPU usage percentage between two /proc/stat samples.
fn usage_percent(prev: CpuTimes, cur: CpuTimes) -> f32 {
    let total = cur.total.saturating_sub(prev.total);
    let idle = cur.idle.saturating_sub(prev.idle);
    if total == 0 {
        return 0.0;
    }
    ((total - idle) as f32 / total as f32 * 100.0).clamp(0.0, 100.0)
}

/// Linux sysfs implementation of the hardware contract.
pub struct SysfsHardware {
    cpu_base: PathBuf,
    hwmon_base: PathBuf,
    power_supply_base: PathBuf,
    platform_profile_path: PathBuf,
    proc_stat_path: PathBuf,
    proc_loadavg_path: PathBuf,
    // Discovered once and cached
    turbo_control: Option<TurboControl>,
    temp_sensor_dir: Option<PathBuf>,
    battery_threshold_path: Option<Option<PathBuf>>,
    prev_cpu_times: Option<CpuTimes>,
}

impl SysfsHardware {
    pub fn new() -> Self {
        Self {
            cpu_base: PathBuf::from(CPU_BASE),
            hwmon_base: PathBuf::from(HWMON_BASE),
            power_supply_base: PathBuf::from(POWER_SUPPLY_BASE),
            platform_profile_path: PathBuf::from(PLATFORM_PROFILE),
            proc_stat_path: PathBuf::from(PROC_STAT),
            proc_loadavg_path: PathBuf::from(PROC_LOADAVG),
            turbo_control: None,
            temp_sensor_dir: None,
            battery_threshold_path: None,
            prev_cpu_times: None,
        }
    }

    /// Enumerate per-CPU cpufreq directories (cpu0, cpu1, ...).
    fn cpu_dirs(&self) -> Result<Vec<PathBuf>, HardwareError> {
        let entries = fs::read_dir(&self.cpu_base).map_err(|e| HardwareError::Read {
            path: self.cpu_base.display().to_string(),
            source: e,
        })?;

        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name();
                let name = name.to_string_lossy();
                name.starts_with("cpu") && name[3..].chars().all(|c| c.is_ascii_digit())
            })
            .map(|e| e.path())
            .collect();
        dirs.sort();

        if dirs.is_empty() {
            return Err(HardwareError::Unsupported(
                "no cpufreq CPU directories".to_string(),
            ));
        }
        Ok(dirs)
    }

    fn cpu0_cpufreq(&self, file: &str) -> PathBuf {
        self.cpu_base.join("cpu0/cpufreq").join(file)
    }

    fn resolve_turbo_control(&mut self) -> TurboControl {
        if let Some(control) = self.turbo_control {
            return control;
        }
        let control = if self.cpu_base.join("intel_pstate/no_turbo").exists() {
            TurboControl::PstateNoTurbo
        } else if self.cpu_base.join("cpufreq/boost").exists() {
            TurboControl::CpufreqBoost
        } else {
            TurboControl::None
        };
        self.turbo_control = Some(control);
        control
    }

    /// Find the hwmon directory of the CPU temperature sensor.
    fn locate_temp_sensor(&mut self) -> Result<PathBuf, HardwareError> {
        if let Some(ref dir) = self.temp_sensor_dir {
            return Ok(dir.clone());
        }

        let entries = fs::read_dir(&self.hwmon_base).map_err(|e| HardwareError::Read {
            path: self.hwmon_base.display().to_string(),
            source: e,
        })?;

        for entry in entries.filter_map(|e| e.ok()) {
            let hwmon_path = entry.path();
            let name_path = hwmon_path.join("name");
            if let Ok(name) = fs::read_to_string(&name_path) {
                let name = name.trim();
                if name == "coretemp" || name == "k10temp" || name == "zenpower" {
                    self.temp_sensor_dir = Some(hwmon_path.clone());
                    return Ok(hwmon_path);
                }
            }
        }

        Err(HardwareError::Unsupported(
            "no coretemp/k10temp hwmon sensor".to_string(),
        ))
    }

    fn locate_battery_threshold(&mut self) -> Result<PathBuf, HardwareError> {
        if let Some(ref cached) = self.battery_threshold_path {
            return cached.clone().ok_or_else(|| {
                HardwareError::Unsupported("battery charge threshold".to_string())
            });
        }

        let mut found = None;
        if let Ok(entries) = fs::read_dir(&self.power_supply_base) {
            for entry in entries.filter_map(|e| e.ok()) {
                let name = entry.file_name();
                if !name.to_string_lossy().starts_with("BAT") {
                    continue;
                }
                let path = entry.path().join("charge_control_end_threshold");
                if path.exists() {
                    found = Some(path);
                    break;
                }
            }
        }

        self.battery_threshold_path = Some(found.clone());
        found.ok_or_else(|| HardwareError::Unsupported("battery charge threshold".to_string()))
    }

    /// Path of the per-CPU bias knob: EPB when present, EPP otherwise.
    fn bias_file(&self, cpu_dir: &Path) -> Option<PathBuf> {
        let epb = cpu_dir.join("power/energy_perf_bias");
        if epb.exists() {
            return Some(epb);
        }
        let epp = cpu_dir.join("cpufreq/energy_performance_preference");
        if epp.exists() {
            return Some(epp);
        }
        None
    }
}

impl Default for SysfsHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl PowerHardware for SysfsHardware {
    fn read_power_state(&mut self) -> Result<PowerState, HardwareError> {
        let entries = fs::read_dir(&self.power_supply_base).map_err(|e| HardwareError::Read {
            path: self.power_supply_base.display().to_string(),
            source: e,
        })?;

        let mut found_mains = false;
        let mut battery_status = None;

        for entry in entries.filter_map(|e| e.ok()) {
            let supply = entry.path();
            let Ok(kind) = fs::read_to_string(supply.join("type")) else {
                continue;
            };
            match kind.trim() {
                "Mains" => {
                    found_mains = true;
                    if let Ok(online) = read_sysfs(&supply.join("online")) {
                        if online == "1" {
                            return Ok(PowerState::Ac);
                        }
                    }
                }
                "Battery" => {
                    if battery_status.is_none() {
                        battery_status = fs::read_to_string(supply.join("status"))
                            .ok()
                            .map(|s| s.trim().to_string());
                    }
                }
                _ => {}
            }
        }

        if found_mains {
            return Ok(PowerState::Battery);
        }
        // No AC adapter device; fall back to the battery's charging status.
        match battery_status.as_deref() {
            Some("Discharging") => Ok(PowerState::Battery),
            Some(_) => Ok(PowerState::Ac),
            None => Err(HardwareError::Unsupported(
                "no AC adapter or battery device".to_string(),
            )),
        }
    }

    fn read_cpu_usage(&mut self) -> Result<f32, HardwareError> {
        let content = read_sysfs(&self.proc_stat_path)?;
        let cur = CpuTimes::parse(&content).ok_or_else(|| HardwareError::Parse {
            path: self.proc_stat_path.display().to_string(),
            detail: "malformed aggregate cpu line".to_string(),
        })?;

        let usage = match self.prev_cpu_times {
            Some(prev) => usage_percent(prev, cur),
            None => 0.0,
        };
        self.prev_cpu_times = Some(cur);
        Ok(usage)
    }

    fn read_load_average(&mut self) -> Result<f32, HardwareError> {
        let content = read_sysfs(&self.proc_loadavg_path)?;
        content
            .split_whitespace()
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| HardwareError::Parse {
                path: self.proc_loadavg_path.display().to_string(),
                detail: format!("malformed loadavg line '{}'", content),
            })
    }

    fn read_core_temperatures(&mut self) -> Result<Vec<f32>, HardwareError> {
        let dir = self.locate_temp_sensor()?;
        let entries = fs::read_dir(&dir).map_err(|e| HardwareError::Read {
            path: dir.display().to_string(),
            source: e,
        })?;

        let mut temps = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !(file_name.starts_with("temp") && file_name.ends_with("_input")) {
                continue;
            }
            if let Ok(content) = fs::read_to_string(&path) {
                if let Ok(millidegrees) = content.trim().parse::<i32>() {
                    let celsius = millidegrees as f32 / 1000.0;
                    // Sensors occasionally report junk; ignore implausible values.
                    if (-50.0..=200.0).contains(&celsius) {
                        temps.push(celsius);
                    }
                }
            }
        }

        if temps.is_empty() {
            return Err(HardwareError::Unsupported(
                "no readable temperature inputs".to_string(),
            ));
        }
        Ok(temps)
    }

    fn read_turbo_state(&mut self) -> Result<bool, HardwareError> {
        match self.resolve_turbo_control() {
            TurboControl::PstateNoTurbo => {
                let path = self.cpu_base.join("intel_pstate/no_turbo");
                let content = read_sysfs(&path)?;
                Ok(parse_u64(&path, &content)? == 0)
            }
            TurboControl::CpufreqBoost => {
                let path = self.cpu_base.join("cpufreq/boost");
                let content = read_sysfs(&path)?;
                Ok(parse_u64(&path, &content)? == 1)
            }
            TurboControl::None => Err(HardwareError::Unsupported(
                "no turbo control mechanism".to_string(),
            )),
        }
    }

    fn write_turbo_state(&mut self, on: bool) -> Result<(), HardwareError> {
        match self.resolve_turbo_control() {
            TurboControl::PstateNoTurbo => {
                let path = self.cpu_base.join("intel_pstate/no_turbo");
                write_sysfs(&path, if on { "0" } else { "1" })
            }
            TurboControl::CpufreqBoost => {
                let path = self.cpu_base.join("cpufreq/boost");
                write_sysfs(&path, if on { "1" } else { "0" })
            }
            TurboControl::None => Err(HardwareError::Unsupported(
                "no turbo control mechanism".to_string(),
            )),
        }
    }

    fn read_governor(&mut self) -> Result<String, HardwareError> {
        read_sysfs(&self.cpu0_cpufreq("scaling_governor"))
    }

    fn write_governor(&mut self, governor: &str) -> Result<(), HardwareError> {
        for cpu in self.cpu_dirs()? {
            let path = cpu.join("cpufreq/scaling_governor");
            if path.exists() {
                write_sysfs(&path, governor)?;
            }
        }
        Ok(())
    }

    fn available_governors(&mut self) -> Result<Vec<String>, HardwareError> {
        let content = read_sysfs(&self.cpu0_cpufreq("scaling_available_governors"))?;
        Ok(content.split_whitespace().map(str::to_string).collect())
    }

    fn read_frequency_limits(&mut self) -> Result<(u32, u32), HardwareError> {
        let min_path = self.cpu0_cpufreq("scaling_min_freq");
        let max_path = self.cpu0_cpufreq("scaling_max_freq");
        let min = parse_u64(&min_path, &read_sysfs(&min_path)?)? as u32;
        let max = parse_u64(&max_path, &read_sysfs(&max_path)?)? as u32;
        Ok((min, max))
    }

    fn write_frequency_limits(&mut self, min: u32, max: u32) -> Result<(), HardwareError> {
        for cpu in self.cpu_dirs()? {
            let cpufreq = cpu.join("cpufreq");
            if !cpufreq.exists() {
                continue;
            }
            write_sysfs(&cpufreq.join("scaling_min_freq"), &min.to_string())?;
            write_sysfs(&cpufreq.join("scaling_max_freq"), &max.to_string())?;
        }
        Ok(())
    }

    fn hardware_frequency_limits(&mut self) -> Result<(u32, u32), HardwareError> {
        let min_path = self.cpu0_cpufreq("cpuinfo_min_freq");
        let max_path = self.cpu0_cpufreq("cpuinfo_max_freq");
        let min = parse_u64(&min_path, &read_sysfs(&min_path)?)? as u32;
        let max = parse_u64(&max_path, &read_sysfs(&max_path)?)? as u32;
        Ok((min, max))
    }

    fn read_platform_profile(&mut self) -> Result<String, HardwareError> {
        if !self.platform_profile_path.exists() {
            return Err(HardwareError::Unsupported(
                "ACPI platform profile".to_string(),
            ));
        }
        read_sysfs(&self.platform_profile_path)
    }

    fn write_platform_profile(&mut self, profile: &str) -> Result<(), HardwareError> {
        if !self.platform_profile_path.exists() {
            return Err(HardwareError::Unsupported(
                "ACPI platform profile".to_string(),
            ));
        }
        write_sysfs(&self.platform_profile_path, profile)
    }

    fn platform_profile_choices(&mut self) -> Result<Vec<String>, HardwareError> {
        let choices_path = self
            .platform_profile_path
            .with_file_name("platform_profile_choices");
        if !choices_path.exists() {
            return Err(HardwareError::Unsupported(
                "ACPI platform profile".to_string(),
            ));
        }
        let content = read_sysfs(&choices_path)?;
        Ok(content.split_whitespace().map(str::to_string).collect())
    }

    fn read_energy_perf_bias(&mut self) -> Result<String, HardwareError> {
        let cpu0 = self.cpu_base.join("cpu0");
        match self.bias_file(&cpu0) {
            Some(path) => read_sysfs(&path),
            None => Err(HardwareError::Unsupported(
                "energy performance bias".to_string(),
            )),
        }
    }

    fn write_energy_perf_bias(&mut self, value: &str) -> Result<(), HardwareError> {
        let cpus = self.cpu_dirs()?;
        let mut wrote_any = false;
        for cpu in &cpus {
            if let Some(path) = self.bias_file(cpu) {
                write_sysfs(&path, value)?;
                wrote_any = true;
            }
        }
        if !wrote_any {
            return Err(HardwareError::Unsupported(
                "energy performance bias".to_string(),
            ));
        }
        Ok(())
    }

    fn read_battery_threshold(&mut self) -> Result<u8, HardwareError> {
        let path = self.locate_battery_threshold()?;
        let content = read_sysfs(&path)?;
        parse_u64(&path, &content).map(|v| v.min(100) as u8)
    }

    fn write_battery_threshold(&mut self, percent: u8) -> Result<(), HardwareError> {
        if percent > 100 {
            warn!("battery charge threshold {}% out of range", percent);
            return Err(HardwareError::Parse {
                path: "battery charge threshold".to_string(),
                detail: format!("{} is not a percentage", percent),
            });
        }
        let path = self.locate_battery_threshold()?;
        write_sysfs(&path, &percent.to_string())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    const STAT_FIRST: &str = "cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 50 0 50 350 50 0 0 0 0 0\n";
    const STAT_SECOND: &str = "cpu  200 0 200 750 150 0 0 0 0 0\ncpu0 100 0 100 375 75 0 0 0 0 0\n";

    #[test]
    fn test_cpu_times_parse() {
        let times = CpuTimes::parse(STAT_FIRST).unwrap();
        assert_eq!(times.total, 1000);
        assert_eq!(times.idle, 800);
    }

    #[test]
    fn test_cpu_times_parse_rejects_short_line() {
        assert!(CpuTimes::parse("cpu  1 2 3\n").is_none());
        assert!(CpuTimes::parse("intr 12345\n").is_none());
    }

    #[test]
    fn test_usage_percent_between_samples() {
        let prev = CpuTimes::parse(STAT_FIRST).unwrap();
        let cur = CpuTimes::parse(STAT_SECOND).unwrap();
        // 300 ticks elapsed, 100 of them idle
        let usage = usage_percent(prev, cur);
        assert!((usage - 66.66).abs() < 0.5, "usage was {}", usage);
    }

    #[test]
    fn test_usage_percent_no_elapsed_time() {
        let times = CpuTimes::parse(STAT_FIRST).unwrap();
        assert_eq!(usage_percent(times, times), 0.0);
    }

    #[test]
    fn test_mock_turbo_write_tracking() {
        let mut hw = mock::MockHardware::new();
        assert!(!hw.read_turbo_state().unwrap());
        hw.write_turbo_state(true).unwrap();
        hw.write_turbo_state(true).unwrap();
        assert_eq!(hw.turbo_writes, 2);
        assert!(hw.read_turbo_state().unwrap());
    }

    #[test]
    fn test_mock_unsupported_turbo() {
        let mut hw = mock::MockHardware::new();
        hw.turbo_supported = false;
        assert!(hw.read_turbo_state().unwrap_err().is_unsupported());
        assert!(hw.write_turbo_state(true).unwrap_err().is_unsupported());
        assert_eq!(hw.turbo_writes, 0);
    }
}
