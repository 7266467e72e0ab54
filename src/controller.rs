//! Command-issuing operations.
//!
//! Every write the control system makes to a settable variable enters through
//! [`Controller::apply`]. The connection guard runs first: while the device is
//! disconnected nothing is sent, published or saved and the caller gets
//! [`CommandError::NotConnected`]. Past the guard each [`ParameterId`] maps to
//! one handler that validates the value, sends the device command and only
//! then commits, publishes and autosaves the new value. A failed send leaves
//! everything as it was.
//!
//! Some writes carry follow-on effects:
//!
//! - a mode change closes the open output file, and entering MANUAL drives
//!   attenuation to the maximum
//! - a filter set change returns the device to MANUAL (or, if already there,
//!   to maximum attenuation)
//! - once the device first answers, the restored filter set and thresholds
//!   are pushed to it by [`Controller::configure_when_connected`]

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use crate::autosave::{position_name, Autosave, Direction, FilterPositions, SavedSettings};
use crate::demux::names::{FILE_CLOSE, FILE_FULL_NAME, FILE_NAME, FILE_OPEN, FILE_PATH};
use crate::demux::open_output;
use crate::error::CommandError;
use crate::protocol::{DeviceCommand, PixelCountThresholds};
use crate::pv::{ProcessVariables, PvValue, StateSink, MAX_ATTENUATION, MODES};
use crate::recorder::path::full_name;
use crate::recorder::SharedRecorder;
use crate::state::LinkState;
use crate::sync::names::{STATE, TIMEOUT_RBV};
use crate::transport::CommandChannel;

/// Names of the controller's own variables.
pub mod names {
    pub const MODE: &str = "MODE";
    pub const MODE_RBV: &str = "MODE_RBV";
    pub const ATTENUATION: &str = "ATTENUATION";
    pub const RESET: &str = "RESET";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const TIMEOUT_CLEAR: &str = "TIMEOUT:CLEAR";
    pub const SINGLESHOT_START: &str = "SINGLESHOT:START";
    pub const FILTER_SET: &str = "FILTER_SET";
    pub const FILTER_SET_RBV: &str = "FILTER_SET_RBV";
}

const STATE_IDLE: i64 = 0;
const STATE_WAITING: i64 = 1;
const MODE_MANUAL: i64 = 0;
const MODE_SINGLESHOT: i64 = 2;

/// One of the five pixel-count thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThresholdKind {
    ExtremeHigh,
    UpperHigh,
    LowerHigh,
    UpperLow,
    LowerLow,
}

impl ThresholdKind {
    pub const ALL: [ThresholdKind; 5] = [
        ThresholdKind::ExtremeHigh,
        ThresholdKind::UpperHigh,
        ThresholdKind::LowerHigh,
        ThresholdKind::UpperLow,
        ThresholdKind::LowerLow,
    ];

    /// Variable holding this threshold.
    pub fn pv_name(self) -> &'static str {
        match self {
            ThresholdKind::ExtremeHigh => "HIGH:THRESHOLD:EXTREME",
            ThresholdKind::UpperHigh => "HIGH:THRESHOLD:UPPER",
            ThresholdKind::LowerHigh => "HIGH:THRESHOLD:LOWER",
            ThresholdKind::UpperLow => "LOW:THRESHOLD:UPPER",
            ThresholdKind::LowerLow => "LOW:THRESHOLD:LOWER",
        }
    }

    fn slot(self, thresholds: &mut PixelCountThresholds) -> &mut i64 {
        match self {
            ThresholdKind::ExtremeHigh => &mut thresholds.high3,
            ThresholdKind::UpperHigh => &mut thresholds.high2,
            ThresholdKind::LowerHigh => &mut thresholds.high1,
            ThresholdKind::UpperLow => &mut thresholds.low2,
            ThresholdKind::LowerLow => &mut thresholds.low1,
        }
    }

    pub fn get(self, thresholds: &PixelCountThresholds) -> i64 {
        let mut copy = *thresholds;
        *self.slot(&mut copy)
    }

    pub fn set(self, thresholds: &mut PixelCountThresholds, value: i64) {
        *self.slot(thresholds) = value;
    }
}

/// A settable parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterId {
    Mode,
    Attenuation,
    Reset,
    Timeout,
    ClearTimeout,
    SingleshotStart,
    Threshold(ThresholdKind),
    FilterSet,
    /// `set` and `filter` are 0-based
    FilterPosition {
        set: usize,
        direction: Direction,
        filter: usize,
    },
    FilePath,
    FileName,
    FileOpen,
    FileClose,
}

impl ParameterId {
    /// Variable written by the control system for this parameter.
    pub fn pv_name(&self) -> String {
        match self {
            ParameterId::Mode => names::MODE.to_string(),
            ParameterId::Attenuation => names::ATTENUATION.to_string(),
            ParameterId::Reset => names::RESET.to_string(),
            ParameterId::Timeout => names::TIMEOUT.to_string(),
            ParameterId::ClearTimeout => names::TIMEOUT_CLEAR.to_string(),
            ParameterId::SingleshotStart => names::SINGLESHOT_START.to_string(),
            ParameterId::Threshold(kind) => kind.pv_name().to_string(),
            ParameterId::FilterSet => names::FILTER_SET.to_string(),
            ParameterId::FilterPosition {
                set,
                direction,
                filter,
            } => position_name(*set, *direction, *filter),
            ParameterId::FilePath => FILE_PATH.to_string(),
            ParameterId::FileName => FILE_NAME.to_string(),
            ParameterId::FileOpen => FILE_OPEN.to_string(),
            ParameterId::FileClose => FILE_CLOSE.to_string(),
        }
    }
}

impl fmt::Display for ParameterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pv_name())
    }
}

impl FromStr for ParameterId {
    type Err = CommandError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let id = match name {
            names::MODE => ParameterId::Mode,
            names::ATTENUATION => ParameterId::Attenuation,
            names::RESET => ParameterId::Reset,
            names::TIMEOUT => ParameterId::Timeout,
            names::TIMEOUT_CLEAR => ParameterId::ClearTimeout,
            names::SINGLESHOT_START => ParameterId::SingleshotStart,
            names::FILTER_SET => ParameterId::FilterSet,
            FILE_PATH => ParameterId::FilePath,
            FILE_NAME => ParameterId::FileName,
            FILE_OPEN => ParameterId::FileOpen,
            FILE_CLOSE => ParameterId::FileClose,
            other => {
                if let Some(kind) = ThresholdKind::ALL.iter().find(|k| k.pv_name() == other) {
                    ParameterId::Threshold(*kind)
                } else {
                    parse_position(other)
                        .ok_or_else(|| CommandError::invalid(other, "not a settable parameter"))?
                }
            }
        };
        Ok(id)
    }
}

/// `FILTER_SET:{i}:{IN|OUT}:{j}` with 1-based `i` and `j`.
fn parse_position(name: &str) -> Option<ParameterId> {
    let mut parts = name.split(':');
    if parts.next()? != "FILTER_SET" {
        return None;
    }
    let set: usize = parts.next()?.parse().ok()?;
    let direction = match parts.next()? {
        "IN" => Direction::In,
        "OUT" => Direction::Out,
        _ => return None,
    };
    let filter: usize = parts.next()?.parse().ok()?;
    if parts.next().is_some() || set == 0 || filter == 0 {
        return None;
    }
    Some(ParameterId::FilterPosition {
        set: set - 1,
        direction,
        filter: filter - 1,
    })
}

/// Applies control-system writes to the device.
pub struct Controller {
    channel: Arc<dyn CommandChannel>,
    state: Arc<LinkState>,
    pvs: Arc<ProcessVariables>,
    recorder: SharedRecorder,
    autosave: Autosave,
    settings: Mutex<SavedSettings>,
}

impl Controller {
    /// `saved` is what the autosave file restored at startup.
    pub fn new(
        channel: Arc<dyn CommandChannel>,
        state: Arc<LinkState>,
        pvs: Arc<ProcessVariables>,
        recorder: SharedRecorder,
        autosave: Autosave,
        saved: SavedSettings,
    ) -> Self {
        Self {
            channel,
            state,
            pvs,
            recorder,
            autosave,
            settings: Mutex::new(saved),
        }
    }

    /// Thresholds last accepted by the device
    pub fn thresholds(&self) -> PixelCountThresholds {
        self.settings().thresholds
    }

    /// Snapshot of every filter's in/out position
    pub fn positions(&self) -> FilterPositions {
        self.settings().positions.clone()
    }

    /// Last filter set successfully sent (or restored)
    pub fn filter_set(&self) -> usize {
        self.settings().filter_set
    }

    /// Apply a write addressed by variable name.
    pub async fn apply_named(&self, name: &str, value: PvValue) -> Result<(), CommandError> {
        let id: ParameterId = name.parse()?;
        self.apply(id, value).await
    }

    /// Apply one parameter write.
    pub async fn apply(&self, id: ParameterId, value: PvValue) -> Result<(), CommandError> {
        if !self.state.is_connected() {
            tracing::warn!(
                parameter = %id,
                %value,
                "Not connected to device. Try again once connection resumed"
            );
            return Err(CommandError::NotConnected);
        }

        let result = match id {
            ParameterId::Mode => self.set_mode(&value).await,
            ParameterId::Attenuation => self.set_attenuation(&value),
            ParameterId::Reset => self.trigger(id, &value, DeviceCommand::Reset),
            ParameterId::Timeout => self.set_timeout(&value),
            ParameterId::ClearTimeout => self.trigger(id, &value, DeviceCommand::ClearTimeout),
            ParameterId::SingleshotStart => self.start_singleshot(&value),
            ParameterId::Threshold(kind) => self.set_threshold(kind, &value),
            ParameterId::FilterSet => self.set_filter_set(&value).await,
            ParameterId::FilterPosition {
                set,
                direction,
                filter,
            } => self.set_position(set, direction, filter, &value),
            ParameterId::FilePath | ParameterId::FileName => self.set_file_part(id, value),
            ParameterId::FileOpen => self.open_file(&value).await,
            ParameterId::FileClose => self.close_file(&value).await,
        };

        match &result {
            Ok(()) => tracing::debug!(parameter = %id, "Parameter applied"),
            Err(e @ CommandError::Unchanged { .. }) => tracing::info!(parameter = %id, "{e}"),
            Err(e) => tracing::warn!(parameter = %id, error = %e, "Parameter rejected"),
        }
        result
    }

    /// Wait for the device to answer for the first time, then push the
    /// restored settings to it.
    pub async fn configure_when_connected(self: Arc<Self>) {
        let mut connection = self.state.subscribe();
        if connection.wait_for(|state| state.is_connected()).await.is_err() {
            return;
        }
        match self.send_initial_config().await {
            Ok(()) => tracing::info!("Initial configuration sent"),
            Err(e) => tracing::warn!(error = %e, "Initial configuration incomplete"),
        }
    }

    /// Send the restored filter set with its positions, then the pixel-count
    /// thresholds.
    pub async fn send_initial_config(&self) -> Result<(), CommandError> {
        let (set, thresholds) = {
            let settings = self.settings();
            (settings.filter_set, settings.thresholds)
        };
        tracing::info!(filter_set = set, "Restoring filter set");
        self.apply(ParameterId::FilterSet, PvValue::Int(set as i64)).await?;
        self.send(DeviceCommand::configure().thresholds(thresholds).build())
    }

    fn settings(&self) -> std::sync::MutexGuard<'_, SavedSettings> {
        self.settings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, command: DeviceCommand) -> Result<(), CommandError> {
        if self.channel.send(command.to_json()) {
            Ok(())
        } else {
            Err(CommandError::NotConnected)
        }
    }

    fn save(&self, settings: &SavedSettings) -> Result<(), CommandError> {
        self.autosave
            .save(settings)
            .map_err(|e| CommandError::Autosave(e.to_string()))
    }

    fn current(&self, name: &str) -> Option<i64> {
        self.pvs.get_i64(name)
    }

    async fn set_mode(&self, value: &PvValue) -> Result<(), CommandError> {
        let mode = integer(ParameterId::Mode, value)?;
        if !(0..MODES.len() as i64).contains(&mode) {
            return Err(CommandError::invalid(
                names::MODE,
                format!("must be 0..={}", MODES.len() - 1),
            ));
        }
        self.send(DeviceCommand::configure().mode(mode).build())?;
        self.pvs.publish(names::MODE, PvValue::Int(mode));
        self.pvs.publish(names::MODE_RBV, PvValue::Int(mode));

        if self.recorder.lock().await.close() {
            tracing::info!(mode, "Closed output file on mode change");
        }
        if mode == MODE_MANUAL {
            self.max_attenuation();
        }
        Ok(())
    }

    fn set_attenuation(&self, value: &PvValue) -> Result<(), CommandError> {
        let attenuation = integer(ParameterId::Attenuation, value)?;
        if !(0..=MAX_ATTENUATION).contains(&attenuation) {
            return Err(CommandError::invalid(
                names::ATTENUATION,
                format!("must be 0..={MAX_ATTENUATION}"),
            ));
        }
        if self.current(STATE) != Some(STATE_IDLE)
            || self.current(names::MODE_RBV) != Some(MODE_MANUAL)
        {
            return Err(CommandError::InvalidState(
                "Must be in MANUAL mode and IDLE state".to_string(),
            ));
        }
        self.send(DeviceCommand::configure().attenuation(attenuation).build())?;
        self.pvs.publish(names::ATTENUATION, PvValue::Int(attenuation));
        Ok(())
    }

    /// Best effort: the device only accepts it in IDLE + MANUAL.
    fn max_attenuation(&self) {
        if let Err(e) = self.set_attenuation(&PvValue::Int(MAX_ATTENUATION)) {
            tracing::info!(error = %e, "Maximum attenuation not applied");
        }
    }

    /// Process-to-trigger parameters act on 1 and ignore 0.
    fn trigger(
        &self,
        id: ParameterId,
        value: &PvValue,
        command: DeviceCommand,
    ) -> Result<(), CommandError> {
        if integer(id, value)? != 1 {
            return Ok(());
        }
        self.send(command)
    }

    fn set_timeout(&self, value: &PvValue) -> Result<(), CommandError> {
        let timeout = value
            .as_f64()
            .filter(|t| t.is_finite() && *t >= 0.0)
            .ok_or_else(|| {
                CommandError::invalid(names::TIMEOUT, "must be a non-negative number of seconds")
            })?;
        self.pvs.publish(names::TIMEOUT, PvValue::Float(timeout));
        self.pvs.publish(TIMEOUT_RBV, PvValue::Float(timeout));
        Ok(())
    }

    fn start_singleshot(&self, value: &PvValue) -> Result<(), CommandError> {
        if integer(ParameterId::SingleshotStart, value)? != 1 {
            return Ok(());
        }
        if self.current(STATE) != Some(STATE_WAITING)
            || self.current(names::MODE_RBV) != Some(MODE_SINGLESHOT)
        {
            return Err(CommandError::InvalidState(
                "Must be in SINGLESHOT mode and WAITING state".to_string(),
            ));
        }
        self.send(DeviceCommand::Singleshot)
    }

    fn set_threshold(&self, kind: ThresholdKind, value: &PvValue) -> Result<(), CommandError> {
        let threshold = integer(ParameterId::Threshold(kind), value)?;
        if threshold < 0 {
            return Err(CommandError::invalid(kind.pv_name(), "must not be negative"));
        }

        let saved = {
            let mut settings = self.settings();
            if kind.get(&settings.thresholds) == threshold {
                return Err(CommandError::Unchanged {
                    parameter: kind.pv_name().to_string(),
                    value: threshold.to_string(),
                });
            }
            let mut updated = settings.thresholds;
            kind.set(&mut updated, threshold);
            self.send(DeviceCommand::configure().thresholds(updated).build())?;
            settings.thresholds = updated;
            settings.clone()
        };

        self.pvs.publish(kind.pv_name(), PvValue::Int(threshold));
        self.save(&saved)
    }

    async fn set_filter_set(&self, value: &PvValue) -> Result<(), CommandError> {
        let set = integer(ParameterId::FilterSet, value)?;
        let positions = self.positions();
        let set = usize::try_from(set)
            .ok()
            .filter(|s| *s < positions.set_count())
            .ok_or_else(|| {
                CommandError::invalid(
                    names::FILTER_SET,
                    format!("must be 0..{}", positions.set_count()),
                )
            })?;
        self.send_positions(&positions, set)?;
        self.pvs.publish(names::FILTER_SET, PvValue::Int(set as i64));
        self.pvs.publish(names::FILTER_SET_RBV, PvValue::Int(set as i64));

        // New filters: back to manual control at maximum attenuation
        if self.current(names::MODE_RBV).is_some_and(|mode| mode != MODE_MANUAL) {
            if let Err(e) = self.set_mode(&PvValue::Int(MODE_MANUAL)).await {
                tracing::warn!(error = %e, "Failed to return to MANUAL after filter set change");
            }
        } else {
            self.max_attenuation();
        }

        let saved = {
            let mut settings = self.settings();
            settings.filter_set = set;
            settings.clone()
        };
        self.save(&saved)
    }

    fn send_positions(&self, positions: &FilterPositions, set: usize) -> Result<(), CommandError> {
        let command = DeviceCommand::configure()
            .positions(
                positions.device_positions(set, Direction::In),
                positions.device_positions(set, Direction::Out),
            )
            .build();
        self.send(command)
    }

    fn set_position(
        &self,
        set: usize,
        direction: Direction,
        filter: usize,
        value: &PvValue,
    ) -> Result<(), CommandError> {
        let name = position_name(set, direction, filter);
        let position = value
            .as_f64()
            .filter(|p| p.is_finite())
            .ok_or_else(|| CommandError::invalid(&name, "must be a finite number"))?;

        let saved = {
            let mut settings = self.settings();
            let mut positions = settings.positions.clone();
            if !positions.set(set, direction, filter, position) {
                return Err(CommandError::invalid(&name, "no such filter"));
            }
            if self.current(names::FILTER_SET_RBV) == Some(set as i64) {
                self.send_positions(&positions, set)?;
            }
            settings.positions = positions;
            settings.clone()
        };

        self.pvs.publish(&name, PvValue::Float(position));
        self.save(&saved)
    }

    fn set_file_part(&self, id: ParameterId, value: PvValue) -> Result<(), CommandError> {
        let name = id.pv_name();
        self.pvs.publish(&name, PvValue::Text(value.as_text()));

        let path = self.pvs.get_text(FILE_PATH).unwrap_or_default();
        let file = self.pvs.get_text(FILE_NAME).unwrap_or_default();
        let full = full_name(&path, &file);
        tracing::info!(full_name = %full, "Output file name updated");
        self.pvs.publish(FILE_FULL_NAME, PvValue::Text(full));
        Ok(())
    }

    /// Open the output file ahead of the first frame.
    async fn open_file(&self, value: &PvValue) -> Result<(), CommandError> {
        if integer(ParameterId::FileOpen, value)? != 1 {
            return Ok(());
        }
        let mut recorder = self.recorder.lock().await;
        open_output(&self.pvs, &mut recorder)
            .map_err(|e| CommandError::InvalidState(e.to_string()))?;
        drop(recorder);
        self.pvs.publish(FILE_CLOSE, PvValue::Int(0));
        Ok(())
    }

    async fn close_file(&self, value: &PvValue) -> Result<(), CommandError> {
        if integer(ParameterId::FileClose, value)? != 1 {
            return Ok(());
        }
        if !self.recorder.lock().await.close() {
            tracing::debug!("No output file open");
        }
        self.pvs.publish(FILE_OPEN, PvValue::Int(0));
        Ok(())
    }
}

fn integer(id: ParameterId, value: &PvValue) -> Result<i64, CommandError> {
    match value {
        PvValue::Float(v) if v.fract() != 0.0 => {
            Err(CommandError::invalid(id.pv_name(), "must be an integer"))
        }
        _ => value
            .as_i64()
            .ok_or_else(|| CommandError::invalid(id.pv_name(), "must be an integer")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FilterConfig;
    use crate::poller::tests::RecordingChannel;
    use crate::protocol::FrameRecord;
    use crate::recorder::{FrameRecorder, TableBackend};
    use crate::state::{ConnectionAuthority, ConnectionState};
    use serde_json::{json, Value};
    use std::sync::atomic::Ordering;
    use tracing_test::traced_test;

    struct Fixture {
        controller: Arc<Controller>,
        channel: Arc<RecordingChannel>,
        pvs: Arc<ProcessVariables>,
        recorder: SharedRecorder,
        authority: ConnectionAuthority,
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn sent_json(&self) -> Vec<Value> {
            self.channel
                .sent()
                .iter()
                .map(|s| serde_json::from_str(s).unwrap())
                .collect()
        }

        fn autosave_text(&self) -> Option<String> {
            std::fs::read_to_string(self.controller.autosave.path()).ok()
        }
    }

    fn filters() -> FilterConfig {
        FilterConfig {
            filter_set_total: 2,
            filters_per_set: 2,
        }
    }

    fn fixture_with(saved: SavedSettings) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let autosave = Autosave::new(dir.path().join("pos.txt"), "PFC", &filters());

        let pvs = Arc::new(ProcessVariables::new("PFC"));
        pvs.define(STATE, PvValue::Int(0));
        pvs.define(names::MODE_RBV, PvValue::Int(0));
        pvs.define(names::FILTER_SET_RBV, PvValue::Int(0));
        pvs.define(FILE_PATH, PvValue::Text(dir.path().display().to_string()));
        pvs.define(FILE_NAME, PvValue::Text("tmp.bin".into()));

        let (state, authority) = LinkState::new();
        authority.set(ConnectionState::Connected);
        let channel = RecordingChannel::up();
        let recorder = FrameRecorder::shared(TableBackend::Mmap);
        let controller = Arc::new(Controller::new(
            channel.clone(),
            Arc::new(state),
            pvs.clone(),
            recorder.clone(),
            autosave,
            saved,
        ));
        Fixture {
            controller,
            channel,
            pvs,
            recorder,
            authority,
            dir,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(SavedSettings::defaults(2, 2))
    }

    const POSITION: ParameterId = ParameterId::FilterPosition {
        set: 0,
        direction: Direction::In,
        filter: 0,
    };

    #[tokio::test]
    async fn disconnected_commands_have_no_side_effects() {
        let f = fixture();
        f.authority.set(ConnectionState::Disconnected);

        for (id, value) in [
            (ParameterId::Mode, PvValue::Int(1)),
            (ParameterId::Reset, PvValue::Int(1)),
            (ParameterId::Timeout, PvValue::Float(9.0)),
            (ParameterId::FilePath, PvValue::Text("/other".into())),
            (ParameterId::FileOpen, PvValue::Int(1)),
            (POSITION, PvValue::Float(1.0)),
        ] {
            assert_eq!(f.controller.apply(id, value).await, Err(CommandError::NotConnected));
        }

        assert!(f.channel.sent().is_empty());
        assert_eq!(f.pvs.get_i64(names::MODE_RBV), Some(0));
        assert!(!f.pvs.contains(TIMEOUT_RBV));
        assert_eq!(
            f.pvs.get_text(FILE_PATH),
            Some(f.dir.path().display().to_string())
        );
        assert!(!f.recorder.lock().await.is_open());
        assert!(f.autosave_text().is_none());
    }

    #[tokio::test]
    async fn mode_is_sent_and_read_back() {
        let f = fixture();
        f.controller.apply(ParameterId::Mode, PvValue::Int(2)).await.unwrap();
        assert_eq!(
            f.sent_json(),
            vec![json!({"command": "configure", "params": {"mode": 2}})]
        );
        assert_eq!(f.pvs.get_i64(names::MODE_RBV), Some(2));

        let err = f.controller.apply(ParameterId::Mode, PvValue::Int(3)).await;
        assert!(matches!(err, Err(CommandError::InvalidValue { .. })));
    }

    #[tokio::test]
    async fn mode_change_closes_file_and_manual_maxes_attenuation() {
        let f = fixture();
        f.controller.apply(ParameterId::Mode, PvValue::Int(1)).await.unwrap();
        f.controller
            .apply(ParameterId::FileOpen, PvValue::Int(1))
            .await
            .unwrap();
        assert!(f.recorder.lock().await.is_open());

        f.controller.apply(ParameterId::Mode, PvValue::Int(0)).await.unwrap();
        assert!(!f.recorder.lock().await.is_open());
        assert_eq!(
            f.sent_json()[1..],
            [
                json!({"command": "configure", "params": {"mode": 0}}),
                json!({"command": "configure", "params": {"attenuation": 15}}),
            ]
        );
        assert_eq!(f.pvs.get_i64(names::ATTENUATION), Some(15));
    }

    #[tokio::test]
    async fn attenuation_requires_idle_manual() {
        let f = fixture();
        f.controller
            .apply(ParameterId::Attenuation, PvValue::Int(15))
            .await
            .unwrap();
        assert_eq!(
            f.sent_json(),
            vec![json!({"command": "configure", "params": {"attenuation": 15}})]
        );

        f.pvs.publish(names::MODE_RBV, PvValue::Int(1));
        assert!(matches!(
            f.controller.apply(ParameterId::Attenuation, PvValue::Int(3)).await,
            Err(CommandError::InvalidState(_))
        ));
        assert!(matches!(
            f.controller.apply(ParameterId::Attenuation, PvValue::Int(16)).await,
            Err(CommandError::InvalidValue { .. })
        ));
        assert_eq!(f.channel.sent().len(), 1);
    }

    #[tokio::test]
    async fn triggers_only_fire_on_one() {
        let f = fixture();
        f.controller.apply(ParameterId::Reset, PvValue::Int(0)).await.unwrap();
        f.controller.apply(ParameterId::Reset, PvValue::Int(1)).await.unwrap();
        f.controller
            .apply(ParameterId::ClearTimeout, PvValue::Int(1))
            .await
            .unwrap();
        assert_eq!(
            f.channel.sent(),
            vec![
                r#"{"command":"reset"}"#.to_string(),
                r#"{"command":"clear_timeout"}"#.to_string()
            ]
        );
    }

    #[tokio::test]
    async fn singleshot_requires_waiting_singleshot_mode() {
        let f = fixture();
        assert!(matches!(
            f.controller
                .apply(ParameterId::SingleshotStart, PvValue::Int(1))
                .await,
            Err(CommandError::InvalidState(_))
        ));

        f.pvs.publish(STATE, PvValue::Int(1));
        f.pvs.publish(names::MODE_RBV, PvValue::Int(2));
        f.controller
            .apply(ParameterId::SingleshotStart, PvValue::Int(1))
            .await
            .unwrap();
        assert_eq!(f.channel.sent(), vec![r#"{"command":"singleshot"}"#.to_string()]);
    }

    #[tokio::test]
    async fn timeout_is_local() {
        let f = fixture();
        f.controller
            .apply(ParameterId::Timeout, PvValue::Float(7.5))
            .await
            .unwrap();
        assert!(f.channel.sent().is_empty());
        assert_eq!(f.pvs.get_f64(TIMEOUT_RBV), Some(7.5));
        assert!(f
            .controller
            .apply(ParameterId::Timeout, PvValue::Float(-1.0))
            .await
            .is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn unchanged_threshold_sends_nothing() {
        let f = fixture();
        let upper = ParameterId::Threshold(ThresholdKind::UpperHigh);

        assert!(matches!(
            f.controller.apply(upper, PvValue::Int(2)).await,
            Err(CommandError::Unchanged { .. })
        ));
        assert!(f.channel.sent().is_empty());
        assert!(logs_contain("HIGH:THRESHOLD:UPPER is already at value 2"));

        f.controller.apply(upper, PvValue::Int(5)).await.unwrap();
        assert_eq!(
            f.sent_json(),
            vec![json!({
                "command": "configure",
                "params": {"pixel_count_thresholds": {
                    "high1": 2, "high2": 5, "high3": 100, "low1": 2, "low2": 2
                }}
            })]
        );
        assert_eq!(f.controller.thresholds().high2, 5);
        assert_eq!(f.pvs.get_i64("HIGH:THRESHOLD:UPPER"), Some(5));
        assert!(f
            .autosave_text()
            .unwrap()
            .contains("PFC:HIGH:THRESHOLD:UPPER 5\n"));
    }

    #[tokio::test]
    async fn filter_set_sends_positions_and_is_saved() {
        let f = fixture();
        f.controller
            .apply(ParameterId::FilterSet, PvValue::Int(1))
            .await
            .unwrap();
        assert_eq!(
            f.sent_json(),
            vec![
                json!({
                    "command": "configure",
                    "params": {
                        "in_positions": {"filter1": 100.0, "filter2": 100.0},
                        "out_positions": {"filter1": 0.0, "filter2": 0.0}
                    }
                }),
                json!({"command": "configure", "params": {"attenuation": 15}}),
            ]
        );
        assert_eq!(f.pvs.get_i64(names::FILTER_SET_RBV), Some(1));
        assert_eq!(f.controller.filter_set(), 1);
        assert!(f.autosave_text().unwrap().contains("PFC:FILTER_SET 1\n"));
        assert!(f
            .controller
            .apply(ParameterId::FilterSet, PvValue::Int(2))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn filter_set_returns_to_manual() {
        let f = fixture();
        f.controller.apply(ParameterId::Mode, PvValue::Int(1)).await.unwrap();
        f.controller
            .apply(ParameterId::FilterSet, PvValue::Int(0))
            .await
            .unwrap();

        let sent = f.sent_json();
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[2], json!({"command": "configure", "params": {"mode": 0}}));
        assert_eq!(
            sent[3],
            json!({"command": "configure", "params": {"attenuation": 15}})
        );
        assert_eq!(f.pvs.get_i64(names::MODE), Some(0));
    }

    #[tokio::test]
    async fn position_change_resends_active_set_and_autosaves() {
        let f = fixture();
        let active = ParameterId::FilterPosition {
            set: 0,
            direction: Direction::Out,
            filter: 1,
        };
        f.controller.apply(active, PvValue::Float(12.5)).await.unwrap();
        assert_eq!(f.channel.sent().len(), 1);

        let inactive = ParameterId::FilterPosition {
            set: 1,
            direction: Direction::In,
            filter: 0,
        };
        f.controller.apply(inactive, PvValue::Float(80.0)).await.unwrap();
        assert_eq!(f.channel.sent().len(), 1);

        let text = f.autosave_text().unwrap();
        assert!(text.contains("PFC:FILTER_SET:1:OUT:2 12.5\n"));
        assert!(text.contains("PFC:FILTER_SET:2:IN:1 80\n"));
        assert_eq!(f.pvs.get_f64("FILTER_SET:1:OUT:2"), Some(12.5));
    }

    #[tokio::test]
    async fn failed_position_send_changes_nothing() {
        let f = fixture();
        f.channel.running.store(false, Ordering::SeqCst);

        assert_eq!(
            f.controller.apply(POSITION, PvValue::Float(42.0)).await,
            Err(CommandError::NotConnected)
        );
        assert_eq!(f.controller.positions().get(0, Direction::In, 0), Some(100.0));
        assert!(!f.pvs.contains("FILTER_SET:1:IN:1"));
        assert!(f.autosave_text().is_none());

        // A later accepted write must not carry the rejected value to disk
        f.channel.running.store(true, Ordering::SeqCst);
        let other = ParameterId::FilterPosition {
            set: 1,
            direction: Direction::Out,
            filter: 1,
        };
        f.controller.apply(other, PvValue::Float(3.0)).await.unwrap();
        let text = f.autosave_text().unwrap();
        assert!(text.contains("PFC:FILTER_SET:1:IN:1 100\n"));
        assert!(text.contains("PFC:FILTER_SET:2:OUT:2 3\n"));
    }

    #[tokio::test]
    async fn failed_threshold_and_filter_set_sends_change_nothing() {
        let f = fixture();
        f.channel.running.store(false, Ordering::SeqCst);

        let extreme = ParameterId::Threshold(ThresholdKind::ExtremeHigh);
        assert_eq!(
            f.controller.apply(extreme, PvValue::Int(7)).await,
            Err(CommandError::NotConnected)
        );
        assert_eq!(
            f.controller.apply(ParameterId::FilterSet, PvValue::Int(1)).await,
            Err(CommandError::NotConnected)
        );

        assert_eq!(f.controller.thresholds(), PixelCountThresholds::default());
        assert_eq!(f.controller.filter_set(), 0);
        assert_eq!(f.pvs.get_i64(names::FILTER_SET_RBV), Some(0));
        assert!(f.autosave_text().is_none());
    }

    #[tokio::test]
    async fn file_parts_recompute_full_name() {
        let f = fixture();
        f.controller
            .apply_named("FILE:NAME", PvValue::Text("run1.h5".into()))
            .await
            .unwrap();
        assert_eq!(
            f.pvs.get_text(FILE_FULL_NAME),
            Some(format!("{}/run1.h5", f.dir.path().display()))
        );
        f.controller
            .apply_named("FILE:PATH", PvValue::Text("/scratch/".into()))
            .await
            .unwrap();
        assert_eq!(
            f.pvs.get_text(FILE_FULL_NAME).as_deref(),
            Some("/scratch/run1.h5")
        );
    }

    #[tokio::test]
    async fn file_open_and_close_triggers() {
        let f = fixture();
        f.controller
            .apply_named("FILE:OPEN", PvValue::Int(1))
            .await
            .unwrap();
        let expected = f.dir.path().join("tmp.bin");
        {
            let mut recorder = f.recorder.lock().await;
            assert_eq!(recorder.open_path(), Some(expected.as_path()));
            recorder
                .write(&FrameRecord {
                    frame_number: 0,
                    adjustment: 1,
                    attenuation: 2,
                })
                .unwrap();
        }
        assert_eq!(f.pvs.get_i64(FILE_CLOSE), Some(0));

        f.controller
            .apply_named("FILE:CLOSE", PvValue::Int(1))
            .await
            .unwrap();
        assert!(!f.recorder.lock().await.is_open());
        assert_eq!(f.pvs.get_i64(FILE_OPEN), Some(0));
        assert!(expected.is_file());
        assert!(f.channel.sent().is_empty());
    }

    #[tokio::test]
    async fn file_open_reports_bad_path() {
        let f = fixture();
        f.pvs.publish(FILE_PATH, PvValue::Text(String::new()));
        assert!(matches!(
            f.controller.apply(ParameterId::FileOpen, PvValue::Int(1)).await,
            Err(CommandError::InvalidState(_))
        ));
        assert!(!f.recorder.lock().await.is_open());
    }

    #[tokio::test]
    async fn initial_config_restores_saved_settings() {
        let mut saved = SavedSettings::defaults(2, 2);
        saved.filter_set = 1;
        saved.positions.set(1, Direction::In, 1, 55.0);
        ThresholdKind::LowerLow.set(&mut saved.thresholds, 9);
        let f = fixture_with(saved);
        f.authority.set(ConnectionState::Disconnected);

        let task = tokio::spawn(f.controller.clone().configure_when_connected());
        tokio::task::yield_now().await;
        assert!(f.channel.sent().is_empty());

        f.authority.set(ConnectionState::Connected);
        task.await.unwrap();

        assert_eq!(
            f.sent_json(),
            vec![
                json!({
                    "command": "configure",
                    "params": {
                        "in_positions": {"filter1": 100.0, "filter2": 55.0},
                        "out_positions": {"filter1": 0.0, "filter2": 0.0}
                    }
                }),
                json!({"command": "configure", "params": {"attenuation": 15}}),
                json!({
                    "command": "configure",
                    "params": {"pixel_count_thresholds": {
                        "high1": 2, "high2": 2, "high3": 100, "low1": 9, "low2": 2
                    }}
                }),
            ]
        );
        assert_eq!(f.pvs.get_i64(names::FILTER_SET_RBV), Some(1));
    }

    #[tokio::test]
    async fn send_failure_is_not_connected() {
        let f = fixture();
        f.channel.running.store(false, Ordering::SeqCst);
        assert_eq!(
            f.controller.apply(ParameterId::Mode, PvValue::Int(1)).await,
            Err(CommandError::NotConnected)
        );
        assert_eq!(f.pvs.get_i64(names::MODE_RBV), Some(0));
    }

    #[test]
    fn parameter_names_parse() {
        assert_eq!("MODE".parse::<ParameterId>().unwrap(), ParameterId::Mode);
        assert_eq!(
            "LOW:THRESHOLD:LOWER".parse::<ParameterId>().unwrap(),
            ParameterId::Threshold(ThresholdKind::LowerLow)
        );
        assert_eq!(
            "FILE:OPEN".parse::<ParameterId>().unwrap(),
            ParameterId::FileOpen
        );
        let id: ParameterId = "FILTER_SET:3:IN:4".parse().unwrap();
        assert_eq!(
            id,
            ParameterId::FilterPosition {
                set: 2,
                direction: Direction::In,
                filter: 3
            }
        );
        assert_eq!(id.pv_name(), "FILTER_SET:3:IN:4");
        assert!("FILTER_SET:0:IN:1".parse::<ParameterId>().is_err());
        assert!("STATE".parse::<ParameterId>().is_err());
    }
}
