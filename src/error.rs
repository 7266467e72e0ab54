//! Error types for the supervisor.
//!
//! `PfcError` is the crate-level error returned by setup paths (configuration,
//! output files, transport setup). It is built with `thiserror` so lower-level
//! I/O, JSON and configuration errors convert with `?`.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: wraps `figment` extraction errors (bad TOML, bad env override).
//! - **`Configuration`**: semantic validation failures on a parsed config.
//! - **`Io`**: filesystem and socket errors.
//! - **`Transport`**: link-level failures. The link's reconnect loop recovers
//!   from these locally; they surface only in logs and the `running` flag.
//! - **`Protocol`**: an inbound message that could not be decoded. Dropped by
//!   the demultiplexer.
//! - **`Storage`**: attenuation table backend failures.
//!
//! Command rejections (disconnected device, wrong mode, out-of-range values)
//! use the separate [`CommandError`] so callers can match on them without
//! touching the setup errors.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type PfcResult<T> = std::result::Result<T, PfcError>;

/// Errors from setting up and running the supervisor.
#[derive(Error, Debug)]
pub enum PfcError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error on {link}: {message}")]
    Transport { link: String, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Failures raised by attenuation table backends.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("No output file is open")]
    NotOpen,

    #[error("Table file {path} is not a valid attenuation table")]
    BadHeader { path: PathBuf },

    #[error("Frame number {0} cannot be addressed in the attenuation table")]
    FrameOutOfRange(u64),

    #[error("Table I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage backend '{0}' is not enabled. Please build with --features {1}")]
    BackendNotEnabled(String, String),

    #[cfg(feature = "storage_hdf5")]
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),
}

/// Why a command-issuing operation did nothing.
///
/// Every variant is recoverable: the caller retries once the device is
/// connected or the value is corrected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("Not connected to device. Try again once connection resumed")]
    NotConnected,

    #[error("Invalid value for {parameter}: {reason}")]
    InvalidValue { parameter: String, reason: String },

    #[error("{0}")]
    InvalidState(String),

    #[error("{parameter} is already at value {value}")]
    Unchanged { parameter: String, value: String },

    #[error("Failed to update autosave file: {0}")]
    Autosave(String),

    #[error("Supervisor is not accepting commands")]
    Unavailable,
}

impl CommandError {
    pub(crate) fn invalid(parameter: impl Into<String>, reason: impl Into<String>) -> Self {
        CommandError::InvalidValue {
            parameter: parameter.into(),
            reason: reason.into(),
        }
    }
}
