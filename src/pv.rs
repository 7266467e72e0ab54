//! Process variables - the observable state sink.
//!
//! Every value the supervisor mirrors for the external control system lives
//! here as a named variable backed by a `watch` channel, so any number of
//! observers can follow a value without polling:
//!
//! ```rust,ignore
//! let pvs = ProcessVariables::new("BL99P-EA-PFC-01");
//! pvs.define("STATE", PvValue::Int(0));
//!
//! let mut rx = pvs.subscribe("STATE").unwrap();
//! tokio::spawn(async move {
//!     while rx.changed().await.is_ok() {
//!         println!("state -> {}", *rx.borrow());
//!     }
//! });
//!
//! pvs.publish("STATE", PvValue::Int(2));
//! ```
//!
//! Names are stored without the device prefix; [`ProcessVariables::full_name`]
//! adds it for display and autosave keys.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::RwLock;
use tokio::sync::watch;

/// Operating states reported by the controller, indexed by state code.
pub const STATES: [&str; 5] = ["IDLE", "WAITING", "ACTIVE", "TIMEOUT", "SINGLESHOT COMPLETE"];

/// Operating modes, indexed by mode code.
pub const MODES: [&str; 3] = ["MANUAL", "CONTINUOUS", "SINGLE-SHOT"];

/// Filter set labels, indexed by filter set number.
pub const FILTER_SETS: [&str; 6] = ["Cu", "Mo 1", "Mo 2", "Mo 3", "Ag 1", "Ag 2"];

/// Highest manual attenuation level.
pub const MAX_ATTENUATION: i64 = 15;

/// Value held by a process variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PvValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl PvValue {
    /// Integer view; floats are truncated, text is parsed.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PvValue::Int(v) => Some(*v),
            PvValue::Float(v) if v.is_finite() => Some(*v as i64),
            PvValue::Float(_) => None,
            PvValue::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PvValue::Int(v) => Some(*v as f64),
            PvValue::Float(v) => Some(*v),
            PvValue::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_text(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PvValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PvValue::Int(v) => write!(f, "{v}"),
            PvValue::Float(v) => write!(f, "{v}"),
            PvValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for PvValue {
    fn from(v: i64) -> Self {
        PvValue::Int(v)
    }
}

impl From<f64> for PvValue {
    fn from(v: f64) -> Self {
        PvValue::Float(v)
    }
}

impl From<&str> for PvValue {
    fn from(v: &str) -> Self {
        PvValue::Text(v.to_string())
    }
}

impl From<String> for PvValue {
    fn from(v: String) -> Self {
        PvValue::Text(v)
    }
}

/// Anything that accepts published device state.
///
/// The synchronizer only needs this, which keeps it testable against a
/// recording sink.
pub trait StateSink: Send + Sync {
    fn publish(&self, name: &str, value: PvValue);

    /// Current value, if the variable exists
    fn get(&self, name: &str) -> Option<PvValue>;
}

/// Unit and description shown to the control system
#[derive(Debug, Clone, Default)]
pub struct PvMetadata {
    pub unit: Option<&'static str>,
    pub choices: Option<&'static [&'static str]>,
}

struct Variable {
    tx: watch::Sender<PvValue>,
    metadata: PvMetadata,
}

/// Flat name -> value store.
pub struct ProcessVariables {
    prefix: String,
    vars: RwLock<BTreeMap<String, Variable>>,
}

impl ProcessVariables {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            vars: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `PREFIX:NAME`
    pub fn full_name(&self, name: &str) -> String {
        format!("{}:{}", self.prefix, name)
    }

    /// Create a variable, or reset an existing one to `initial`.
    pub fn define(&self, name: &str, initial: PvValue) {
        self.define_with(name, initial, PvMetadata::default());
    }

    pub fn define_with(&self, name: &str, initial: PvValue, metadata: PvMetadata) {
        let mut vars = self.vars.write().unwrap_or_else(|e| e.into_inner());
        match vars.get_mut(name) {
            Some(var) => {
                var.tx.send_replace(initial);
                var.metadata = metadata;
            }
            None => {
                let (tx, _rx) = watch::channel(initial);
                vars.insert(name.to_string(), Variable { tx, metadata });
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(name)
    }

    pub fn metadata(&self, name: &str) -> Option<PvMetadata> {
        self.vars
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|v| v.metadata.clone())
    }

    /// Follow a variable; `None` if it was never defined.
    pub fn subscribe(&self, name: &str) -> Option<watch::Receiver<PvValue>> {
        self.vars
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|v| v.tx.subscribe())
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        StateSink::get(self, name).and_then(|v| v.as_i64())
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        StateSink::get(self, name).and_then(|v| v.as_f64())
    }

    pub fn get_text(&self, name: &str) -> Option<String> {
        StateSink::get(self, name).map(|v| v.as_text())
    }

    /// Snapshot of every variable, keyed by unprefixed name
    pub fn snapshot(&self) -> BTreeMap<String, PvValue> {
        self.vars
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), v.tx.borrow().clone()))
            .collect()
    }
}

impl StateSink for ProcessVariables {
    fn publish(&self, name: &str, value: PvValue) {
        {
            let vars = self.vars.read().unwrap_or_else(|e| e.into_inner());
            if let Some(var) = vars.get(name) {
                var.tx.send_replace(value);
                return;
            }
        }
        tracing::debug!(pv = name, "Publishing to undefined variable, creating it");
        self.define(name, value);
    }

    fn get(&self, name: &str) -> Option<PvValue> {
        self.vars
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|v| v.tx.borrow().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn define_and_publish() {
        let pvs = ProcessVariables::new("PFC");
        pvs.define("STATE", PvValue::Int(0));
        assert_eq!(pvs.get_i64("STATE"), Some(0));

        pvs.publish("STATE", PvValue::Int(3));
        assert_eq!(pvs.get_i64("STATE"), Some(3));
        assert_eq!(pvs.full_name("STATE"), "PFC:STATE");
    }

    #[test]
    fn publish_creates_missing_variable() {
        let pvs = ProcessVariables::new("PFC");
        pvs.publish("VERSION", "1.2.0".into());
        assert_eq!(pvs.get_text("VERSION").as_deref(), Some("1.2.0"));
    }

    #[test]
    fn value_conversions() {
        assert_eq!(PvValue::Float(2.9).as_i64(), Some(2));
        assert_eq!(PvValue::Text(" 7 ".into()).as_i64(), Some(7));
        assert_eq!(PvValue::Int(4).as_f64(), Some(4.0));
        assert_eq!(PvValue::Float(f64::NAN).as_i64(), None);
        assert_eq!(PvValue::Text("abc".into()).as_f64(), None);
    }

    #[tokio::test]
    async fn subscribers_see_updates() {
        let pvs = ProcessVariables::new("PFC");
        pvs.define("FRAME:RECEIVED", PvValue::Int(0));
        let mut rx = pvs.subscribe("FRAME:RECEIVED").unwrap();

        pvs.publish("FRAME:RECEIVED", PvValue::Int(42));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), PvValue::Int(42));
    }

    #[test]
    fn redefine_keeps_subscribers() {
        let pvs = ProcessVariables::new("PFC");
        pvs.define("MODE", PvValue::Int(1));
        let rx = pvs.subscribe("MODE").unwrap();
        pvs.define("MODE", PvValue::Int(0));
        assert_eq!(*rx.borrow(), PvValue::Int(0));
    }

    #[test]
    fn subscribe_unknown_is_none() {
        let pvs = ProcessVariables::new("PFC");
        assert!(pvs.subscribe("NOPE").is_none());
    }
}
