//! Laptop Power Management Daemon
//!
//! Watches the power source, CPU load, and thermal state of a laptop and
//! actuates the CPU governor, turbo boost, frequency limits, and platform
//! power profile accordingly. Also serves an
//! `org.freedesktop.UPower.PowerProfiles`-compatible DBus interface so
//! desktop environments and `powerprofilesctl` can hold profiles.

pub mod args;
pub mod client;
pub mod config;
pub mod controller;
pub mod daemon;
pub mod errors;
pub mod handler;
pub mod holds;
pub mod logging;
pub mod monitor;
pub mod profile;
pub mod service;
pub mod sysfs;

// DBus constants mirroring the upstream power-profiles broker
pub const DBUS_SERVICE_NAME: &str = "org.freedesktop.UPower.PowerProfiles";
pub const DBUS_OBJECT_PATH: &str = "/org/freedesktop/UPower/PowerProfiles";
pub const DBUS_INTERFACE_NAME: &str = "org.freedesktop.UPower.PowerProfiles";

// Re-export commonly used types
pub use errors::{PowerError, Result};
pub use profile::{GovernorOverride, PowerProfile};
