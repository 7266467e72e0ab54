//! Device wire protocol.
//!
//! Both streams carry one JSON object per newline-terminated line.
//!
//! Command stream, supervisor → device:
//! ```text
//! {"command":"status"}
//! {"command":"configure","params":{"mode":1}}
//! {"command":"reset"}
//! ```
//! and device → supervisor replies, of which only `{"status":{...}}` is acted on.
//!
//! Event stream, device → supervisor only:
//! ```text
//! {"frame_number":12,"adjustment":-1,"attenuation":4}
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{PfcError, PfcResult};

pub const STATUS_KEY: &str = "status";
pub const FRAME_NUMBER_KEY: &str = "frame_number";
pub const ADJUSTMENT_KEY: &str = "adjustment";
pub const ATTENUATION_KEY: &str = "attenuation";

/// Commands understood by the filter controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", content = "params", rename_all = "snake_case")]
pub enum DeviceCommand {
    Status,
    Configure(ConfigureParams),
    Reset,
    ClearTimeout,
    Singleshot,
}

impl DeviceCommand {
    /// Encode as a single JSON line (without the newline).
    pub fn to_json(&self) -> String {
        // Only string-keyed maps and plain numbers, so this does not fail
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "Failed to encode device command");
            String::from("{}")
        })
    }

    pub fn configure() -> ConfigureParams {
        ConfigureParams::default()
    }
}

/// Parameters of a `configure` command. Only the set fields are sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConfigureParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attenuation: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pixel_count_thresholds: Option<PixelCountThresholds>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_positions: Option<BTreeMap<String, f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_positions: Option<BTreeMap<String, f64>>,
}

impl ConfigureParams {
    pub fn mode(mut self, mode: i64) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn attenuation(mut self, attenuation: i64) -> Self {
        self.attenuation = Some(attenuation);
        self
    }

    pub fn thresholds(mut self, thresholds: PixelCountThresholds) -> Self {
        self.pixel_count_thresholds = Some(thresholds);
        self
    }

    pub fn positions(mut self, inp: BTreeMap<String, f64>, out: BTreeMap<String, f64>) -> Self {
        self.in_positions = Some(inp);
        self.out_positions = Some(out);
        self
    }

    pub fn build(self) -> DeviceCommand {
        DeviceCommand::Configure(self)
    }
}

/// Pixel-count thresholds driving the automatic attenuation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelCountThresholds {
    pub high1: i64,
    pub high2: i64,
    pub high3: i64,
    pub low1: i64,
    pub low2: i64,
}

impl Default for PixelCountThresholds {
    fn default() -> Self {
        Self {
            high1: 2,
            high2: 2,
            high3: 100,
            low1: 2,
            low2: 2,
        }
    }
}

/// One status reply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceStatus {
    pub state: i64,
    #[serde(deserialize_with = "string_or_number")]
    pub version: String,
    /// Microseconds
    pub process_duration: f64,
    /// Microseconds
    pub process_period: f64,
    pub last_received_frame: i64,
    pub last_processed_frame: i64,
    /// Seconds
    #[serde(rename = "time_since_last_message")]
    pub time_since_last_frame: f64,
    pub current_attenuation: i64,
}

/// One per-frame event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub frame_number: u64,
    pub adjustment: i64,
    pub attenuation: i64,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

fn parse_object(line: &str) -> PfcResult<Map<String, Value>> {
    match serde_json::from_str::<Value>(line)? {
        Value::Object(map) => Ok(map),
        other => Err(PfcError::Protocol(format!(
            "expected a JSON object, got {}",
            kind_of(&other)
        ))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Decode a command-stream message.
///
/// `Ok(None)` for well-formed replies without a status field (e.g. command
/// acknowledgements).
pub fn decode_status(line: &str) -> PfcResult<Option<DeviceStatus>> {
    let mut object = parse_object(line)?;
    match object.remove(STATUS_KEY) {
        Some(status) => serde_json::from_value(status)
            .map(Some)
            .map_err(|e| PfcError::Protocol(format!("bad status payload: {e}"))),
        None => Ok(None),
    }
}

/// Decode an event-stream message.
///
/// `Ok(None)` for objects that carry no frame number.
pub fn decode_frame(line: &str) -> PfcResult<Option<FrameRecord>> {
    let object = parse_object(line)?;
    if !object.contains_key(FRAME_NUMBER_KEY) {
        return Ok(None);
    }
    serde_json::from_value(Value::Object(object))
        .map(Some)
        .map_err(|e| PfcError::Protocol(format!("bad frame payload: {e}")))
}
