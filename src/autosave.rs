//! Persisted settings.
//!
//! The in/out motor position of every filter in every filter set, the active
//! filter set and the pixel-count thresholds survive restarts in a flat text
//! file, one `key value` pair per line:
//!
//! ```text
//! PFC:FILTER_SET:1:IN:1 100
//! PFC:FILTER_SET:1:IN:2 100
//! ...
//! PFC:FILTER_SET:6:OUT:4 0
//! PFC:FILTER_SET 2
//! PFC:HIGH:THRESHOLD:EXTREME 100
//! ...
//! PFC:LOW:THRESHOLD:LOWER 2
//! ```
//!
//! The file is read once at startup and rewritten in full after every change:
//! all IN keys for every set, then all OUT keys, the filter set, then the
//! thresholds.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::FilterConfig;
use crate::controller::{names::FILTER_SET, ThresholdKind};
use crate::error::PfcResult;
use crate::protocol::PixelCountThresholds;

/// Position used for an IN key missing from the file
pub const DEFAULT_IN_POSITION: f64 = 100.0;

/// Position used for an OUT key missing from the file
pub const DEFAULT_OUT_POSITION: f64 = 0.0;

/// Which of a filter's two positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::In, Direction::Out];

    pub fn default_position(self) -> f64 {
        match self {
            Direction::In => DEFAULT_IN_POSITION,
            Direction::Out => DEFAULT_OUT_POSITION,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::In => "IN",
            Direction::Out => "OUT",
        })
    }
}

/// Variable name for one filter position; `set` and `filter` are 0-based.
pub fn position_name(set: usize, direction: Direction, filter: usize) -> String {
    format!("FILTER_SET:{}:{}:{}", set + 1, direction, filter + 1)
}

/// In and out positions for every filter of every set.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterPositions {
    inp: Vec<Vec<f64>>,
    out: Vec<Vec<f64>>,
}

impl FilterPositions {
    pub fn defaults(sets: usize, filters_per_set: usize) -> Self {
        Self {
            inp: vec![vec![DEFAULT_IN_POSITION; filters_per_set]; sets],
            out: vec![vec![DEFAULT_OUT_POSITION; filters_per_set]; sets],
        }
    }

    pub fn set_count(&self) -> usize {
        self.inp.len()
    }

    pub fn filters_per_set(&self) -> usize {
        self.inp.first().map_or(0, Vec::len)
    }

    fn grid(&self, direction: Direction) -> &Vec<Vec<f64>> {
        match direction {
            Direction::In => &self.inp,
            Direction::Out => &self.out,
        }
    }

    pub fn get(&self, set: usize, direction: Direction, filter: usize) -> Option<f64> {
        self.grid(direction).get(set)?.get(filter).copied()
    }

    /// Store a position. Returns `false` if the indices are out of range.
    pub fn set(&mut self, set: usize, direction: Direction, filter: usize, value: f64) -> bool {
        let grid = match direction {
            Direction::In => &mut self.inp,
            Direction::Out => &mut self.out,
        };
        match grid.get_mut(set).and_then(|row| row.get_mut(filter)) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// Positions of one set keyed `filter1..filterN`, as sent to the device.
    pub fn device_positions(&self, set: usize, direction: Direction) -> BTreeMap<String, f64> {
        self.grid(direction)
            .get(set)
            .map(|row| {
                row.iter()
                    .enumerate()
                    .map(|(j, v)| (format!("filter{}", j + 1), *v))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Everything the autosave file restores.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedSettings {
    pub positions: FilterPositions,
    /// 0-based index of the active filter set
    pub filter_set: usize,
    pub thresholds: PixelCountThresholds,
}

impl SavedSettings {
    pub fn defaults(sets: usize, filters_per_set: usize) -> Self {
        Self {
            positions: FilterPositions::defaults(sets, filters_per_set),
            filter_set: 0,
            thresholds: PixelCountThresholds::default(),
        }
    }
}

/// Reader and writer of the autosave file.
#[derive(Debug, Clone)]
pub struct Autosave {
    path: PathBuf,
    device: String,
    sets: usize,
    filters_per_set: usize,
}

impl Autosave {
    pub fn new(
        path: impl Into<PathBuf>,
        device: impl Into<String>,
        filters: &FilterConfig,
    ) -> Self {
        Self {
            path: path.into(),
            device: device.into(),
            sets: filters.filter_set_total,
            filters_per_set: filters.filters_per_set,
        }
    }

    /// Location of the autosave file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Key for one position: `{device}:FILTER_SET:{i}:{IN|OUT}:{j}`.
    pub fn key(&self, set: usize, direction: Direction, filter: usize) -> String {
        format!("{}:{}", self.device, position_name(set, direction, filter))
    }

    /// Key for a non-position setting, e.g. `{device}:FILTER_SET`.
    fn setting_key(&self, name: &str) -> String {
        format!("{}:{}", self.device, name)
    }

    /// Read the file. A missing file yields defaults, which are written out.
    pub fn load(&self) -> PfcResult<SavedSettings> {
        let mut settings = SavedSettings::defaults(self.sets, self.filters_per_set);
        if !self.path.exists() {
            tracing::info!(path = %self.path.display(), "No autosave file, writing defaults");
            self.save(&settings)?;
            return Ok(settings);
        }

        let text = std::fs::read_to_string(&self.path)?;
        let saved = parse(&text);
        for direction in Direction::BOTH {
            for set in 0..self.sets {
                for filter in 0..self.filters_per_set {
                    let key = self.key(set, direction, filter);
                    match saved.get(&key) {
                        Some(value) => {
                            settings.positions.set(set, direction, filter, *value);
                        }
                        None => tracing::warn!(%key, "Missing from autosave file, using default"),
                    }
                }
            }
        }

        let key = self.setting_key(FILTER_SET);
        match saved.get(&key).and_then(|v| whole(*v)) {
            Some(set) if (set as usize) < self.sets => settings.filter_set = set as usize,
            Some(set) => tracing::warn!(%key, set, "Saved filter set out of range, using 0"),
            None => tracing::debug!(%key, "No saved filter set, using 0"),
        }

        for kind in ThresholdKind::ALL {
            let key = self.setting_key(kind.pv_name());
            match saved.get(&key).map(|v| whole(*v)) {
                Some(Some(value)) => kind.set(&mut settings.thresholds, value),
                Some(None) => {
                    tracing::warn!(%key, "Saved threshold is not a whole number, using default")
                }
                None => tracing::debug!(%key, "No saved threshold, using default"),
            }
        }

        tracing::debug!(path = %self.path.display(), entries = saved.len(), "Loaded autosave file");
        Ok(settings)
    }

    /// Rewrite the file with every setting.
    pub fn save(&self, settings: &SavedSettings) -> PfcResult<()> {
        let positions = &settings.positions;
        let mut text = String::new();
        for direction in Direction::BOTH {
            for set in 0..positions.set_count() {
                for filter in 0..positions.filters_per_set() {
                    if let Some(value) = positions.get(set, direction, filter) {
                        text.push_str(&format!("{} {}\n", self.key(set, direction, filter), value));
                    }
                }
            }
        }
        text.push_str(&format!("{} {}\n", self.setting_key(FILTER_SET), settings.filter_set));
        for kind in ThresholdKind::ALL {
            let value = kind.get(&settings.thresholds);
            text.push_str(&format!("{} {}\n", self.setting_key(kind.pv_name()), value));
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.path, text)?;
        tracing::info!(path = %self.path.display(), "Updated autosave file");
        Ok(())
    }
}

/// Non-negative whole number stored as a float.
fn whole(value: f64) -> Option<i64> {
    (value.is_finite() && value.fract() == 0.0 && value >= 0.0 && value <= i64::MAX as f64)
        .then_some(value as i64)
}

fn parse(text: &str) -> BTreeMap<String, f64> {
    let mut values = BTreeMap::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next().map(str::parse::<f64>), fields.next()) {
            (Some(key), Some(Ok(value)), None) => {
                values.insert(key.to_string(), value);
            }
            _ => tracing::warn!(
                line = number + 1,
                content = %line,
                "Skipping malformed autosave line"
            ),
        }
    }
    values
}
