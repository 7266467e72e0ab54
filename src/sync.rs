//! State synchronizer.
//!
//! Projects each status reply onto the process variables, in a fixed order,
//! and applies the one derived side effect: once the device reports that no
//! frame has arrived for longer than `TIMEOUT_RBV`, the recording is over and
//! the open output file is closed.

use std::sync::Arc;

use crate::protocol::DeviceStatus;
use crate::pv::{PvValue, StateSink};
use crate::recorder::SharedRecorder;

pub mod names {
    pub const STATE: &str = "STATE";
    pub const VERSION: &str = "VERSION";
    pub const PROCESS_DURATION: &str = "PROCESS:DURATION";
    pub const PROCESS_PERIOD: &str = "PROCESS:PERIOD";
    pub const FRAME_RECEIVED: &str = "FRAME:RECEIVED";
    pub const FRAME_PROCESSED: &str = "FRAME:PROCESSED";
    pub const FRAME_LAST_TIME: &str = "FRAME:LAST_TIME";
    pub const ATTENUATION_RBV: &str = "ATTENUATION_RBV";
    pub const TIMEOUT_RBV: &str = "TIMEOUT_RBV";
}

/// Seconds without a frame before the recording is closed, if `TIMEOUT_RBV`
/// has not been published yet.
pub const DEFAULT_TIMEOUT_SECS: f64 = 3.0;

/// Number of state codes; negative codes are error states folded into the
/// top of the range.
const STATE_CODES: i64 = 16;

/// Map a raw state code onto the published enumeration.
pub fn published_state(state: i64) -> i64 {
    if state < 0 {
        state + STATE_CODES
    } else {
        state
    }
}

pub struct StateSynchronizer {
    sink: Arc<dyn StateSink>,
    recorder: SharedRecorder,
}

impl StateSynchronizer {
    pub fn new(sink: Arc<dyn StateSink>, recorder: SharedRecorder) -> Self {
        Self { sink, recorder }
    }

    /// Publish one status reply.
    pub async fn apply(&self, status: &DeviceStatus) {
        use names::*;

        self.sink
            .publish(STATE, PvValue::Int(published_state(status.state)));
        self.sink
            .publish(VERSION, PvValue::Text(status.version.clone()));
        self.sink
            .publish(PROCESS_DURATION, PvValue::Float(status.process_duration));
        self.sink
            .publish(PROCESS_PERIOD, PvValue::Float(status.process_period));
        self.sink
            .publish(FRAME_RECEIVED, PvValue::Int(status.last_received_frame));
        self.sink
            .publish(FRAME_PROCESSED, PvValue::Int(status.last_processed_frame));
        self.sink
            .publish(FRAME_LAST_TIME, PvValue::Float(status.time_since_last_frame));

        if status.time_since_last_frame > self.timeout() {
            self.close_recording(status.time_since_last_frame).await;
        }

        self.sink
            .publish(ATTENUATION_RBV, PvValue::Int(status.current_attenuation));
    }

    fn timeout(&self) -> f64 {
        self.sink
            .get(names::TIMEOUT_RBV)
            .and_then(|v| v.as_f64())
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
    }

    /// Close the output file if frames were recorded into it.
    async fn close_recording(&self, idle_secs: f64) {
        let mut recorder = self.recorder.lock().await;
        if recorder.is_open() && recorder.frames_written() > 0 {
            tracing::info!(idle_secs, "Frame timeout reached, closing output file");
            recorder.close();
        }
    }
}
