//! Supervisor configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (default `config/pfc.toml`, missing file is fine)
//! 2. environment variables prefixed with `PFC_`, split on `__`
//!    (e.g. `PFC_DEVICE__HOST=10.0.0.5`)
//!
//! Every field has a default so an empty configuration describes a device on
//! localhost with the stock poll timings.
//!
//! # Example
//! ```no_run
//! use pfc_supervisor::config::SupervisorConfig;
//!
//! let config = SupervisorConfig::load()?;
//! println!("Device: {}", config.device.name);
//! # Ok::<(), pfc_supervisor::error::PfcError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{PfcError, PfcResult};

/// Top-level supervisor configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub application: ApplicationConfig,
    pub device: DeviceConfig,
    pub polling: PollingConfig,
    pub filters: FilterConfig,
    pub output: OutputConfig,
    pub autosave: AutosaveConfig,
    pub control: ControlConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

/// Where the filter controller lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Process-variable prefix, also used for autosave keys
    pub name: String,
    pub host: String,
    /// Request/reply command stream port
    pub command_port: u16,
    /// Frame event stream port
    pub event_port: u16,
    /// Delay between reconnect attempts on either link
    pub reconnect_delay_ms: u64,
}

/// Status poller timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub poll_period_ms: u64,
    /// Wait used while the command link is down or a reply is overdue
    pub link_down_wait_ms: u64,
    /// How often the status request is re-sent while waiting for a reply
    pub retry_period_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    pub filter_set_total: usize,
    pub filters_per_set: usize,
}

/// Attenuation table output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Parent directory for the dated default output directory
    pub directory: PathBuf,
    pub file_name: String,
    /// Table backend: "mmap" or "hdf5"
    pub backend: String,
    /// Frames numbered above this are dropped instead of growing the table
    pub max_frame_number: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutosaveConfig {
    pub path: PathBuf,
}

/// Line-oriented JSON endpoint through which the control system writes
/// parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub enabled: bool,
    /// Listen address, `host:port`
    pub address: String,
    /// Writes queued ahead of the controller before clients wait
    pub queue_depth: usize,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "PFC".to_string(),
            host: "127.0.0.1".to_string(),
            command_port: 9000,
            event_port: 10000,
            reconnect_delay_ms: 1000,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_period_ms: 100,
            link_down_wait_ms: 1000,
            retry_period_ms: 5000,
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            filter_set_total: 6,
            filters_per_set: 4,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("."),
            file_name: "tmp.h5".to_string(),
            backend: "mmap".to_string(),
            max_frame_number: 10_000_000,
        }
    }
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("filter_positions.txt"),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: "127.0.0.1:9200".to_string(),
            queue_depth: 32,
        }
    }
}

impl PollingConfig {
    pub fn poll_period(&self) -> Duration {
        Duration::from_millis(self.poll_period_ms)
    }

    pub fn link_down_wait(&self) -> Duration {
        Duration::from_millis(self.link_down_wait_ms)
    }

    pub fn retry_period(&self) -> Duration {
        Duration::from_millis(self.retry_period_ms)
    }
}

impl DeviceConfig {
    pub fn command_address(&self) -> String {
        format!("{}:{}", self.host, self.command_port)
    }

    pub fn event_address(&self) -> String {
        format!("{}:{}", self.host, self.event_port)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl SupervisorConfig {
    /// Load from `config/pfc.toml` and `PFC_` environment variables
    pub fn load() -> PfcResult<Self> {
        Self::load_from("config/pfc.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> PfcResult<Self> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(SupervisorConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("PFC_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> PfcResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(PfcError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(PfcError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.device.command_port == 0 || self.device.event_port == 0 {
            return Err(PfcError::Configuration(
                "Device ports must be non-zero".to_string(),
            ));
        }
        if self.device.command_port == self.device.event_port {
            return Err(PfcError::Configuration(format!(
                "Command and event streams cannot share port {}",
                self.device.command_port
            )));
        }

        if self.polling.poll_period_ms == 0 || self.polling.link_down_wait_ms == 0 {
            return Err(PfcError::Configuration(
                "Poll period and link-down wait must be non-zero".to_string(),
            ));
        }
        if self.polling.retry_period_ms < self.polling.poll_period_ms {
            return Err(PfcError::Configuration(format!(
                "retry_period_ms ({}) must not be shorter than poll_period_ms ({})",
                self.polling.retry_period_ms, self.polling.poll_period_ms
            )));
        }

        if self.filters.filter_set_total == 0 || self.filters.filters_per_set == 0 {
            return Err(PfcError::Configuration(
                "Filter set total and filters per set must be at least 1".to_string(),
            ));
        }

        let valid_backends = ["mmap", "hdf5"];
        if !valid_backends.contains(&self.output.backend.as_str()) {
            return Err(PfcError::Configuration(format!(
                "Invalid output backend '{}'. Must be one of: {}",
                self.output.backend,
                valid_backends.join(", ")
            )));
        }
        if self.output.file_name.is_empty() {
            return Err(PfcError::Configuration(
                "Output file name must not be empty".to_string(),
            ));
        }
        if self.output.max_frame_number == 0 {
            return Err(PfcError::Configuration(
                "max_frame_number must be at least 1".to_string(),
            ));
        }

        if self.control.enabled && self.control.address.is_empty() {
            return Err(PfcError::Configuration(
                "Control address must not be empty".to_string(),
            ));
        }
        if self.control.queue_depth == 0 {
            return Err(PfcError::Configuration(
                "Control queue depth must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
