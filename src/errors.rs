//! Error types for the power management daemon

use thiserror::Error;

use crate::sysfs::HardwareError;

/// Result type alias for the power management daemon
pub type Result<T> = std::result::Result<T, PowerError>;

/// Main error type for the power management daemon
#[derive(Error, Debug)]
pub enum PowerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("DBus error: {0}")]
    DBus(#[from] zbus::Error),

    #[error(transparent)]
    Hardware(#[from] HardwareError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("daemon not running")]
    DaemonNotRunning,

    #[error("unknown error: {0}")]
    Unknown(String),
}

/// Helper function to convert display errors to zbus errors
pub fn zbus_error_from_display(err: impl std::fmt::Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(format!("{}", err))
}
