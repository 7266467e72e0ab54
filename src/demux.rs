//! Event demultiplexer.
//!
//! Two independent monitors, one per link:
//!
//! - [`CommandMonitor`] routes status replies to the [`StateSynchronizer`] and
//!   clears the poller's reply-outstanding flag.
//! - [`EventMonitor`] routes frame events to the [`FrameRecorder`], opening
//!   the output file on the first frame of a recording. Frame numbers above
//!   the configured limit are dropped before they reach the table.
//!
//! Anything that does not decode is logged and dropped; neither loop ever
//! stops on bad input.
//!
//! [`FrameRecorder`]: crate::recorder::FrameRecorder

use std::sync::Arc;

use chrono::Local;
use futures::{Stream, StreamExt};

use crate::protocol::{decode_frame, decode_status, FrameRecord};
use crate::pv::{ProcessVariables, PvValue, StateSink};
use crate::recorder::path::{self, OutputPathError};
use crate::recorder::{FrameRecorder, SharedRecorder};
use crate::state::LinkState;
use crate::sync::StateSynchronizer;

pub mod names {
    pub const FILE_PATH: &str = "FILE:PATH";
    pub const FILE_NAME: &str = "FILE:NAME";
    pub const FILE_FULL_NAME: &str = "FILE:FULL_NAME";
    pub const FILE_OPEN: &str = "FILE:OPEN";
    pub const FILE_CLOSE: &str = "FILE:CLOSE";
}

/// Highest frame number recorded unless configured otherwise
pub const DEFAULT_MAX_FRAME_NUMBER: u64 = 10_000_000;

/// Open the output file named by `FILE:PATH` and `FILE:NAME` unless one is
/// already open, publishing the resolved `FILE:FULL_NAME`.
pub fn open_output(
    pvs: &ProcessVariables,
    recorder: &mut FrameRecorder,
) -> Result<(), OutputPathError> {
    if recorder.is_open() {
        return Ok(());
    }
    let path = pvs.get_text(names::FILE_PATH).unwrap_or_default();
    let name = pvs.get_text(names::FILE_NAME).unwrap_or_default();
    let target = path::prepare(&path, &name, Local::now())?;
    pvs.publish(
        names::FILE_FULL_NAME,
        PvValue::Text(target.display().to_string()),
    );
    if recorder.open(&target) {
        Ok(())
    } else {
        Err(OutputPathError::OpenFailed(target))
    }
}

/// Consumer of the command link.
pub struct CommandMonitor {
    sync: StateSynchronizer,
    state: Arc<LinkState>,
}

impl CommandMonitor {
    pub fn new(sync: StateSynchronizer, state: Arc<LinkState>) -> Self {
        Self { sync, state }
    }

    pub async fn run<S>(self, messages: S)
    where
        S: Stream<Item = String> + Send,
    {
        futures::pin_mut!(messages);
        while let Some(line) = messages.next().await {
            self.handle(&line).await;
        }
        tracing::debug!("Command stream ended");
    }

    /// Route one command-link message. Returns `true` if it carried a status.
    pub async fn handle(&self, line: &str) -> bool {
        match decode_status(line) {
            Ok(Some(status)) => {
                self.sync.apply(&status).await;
                self.state.reply_received();
                true
            }
            Ok(None) => {
                tracing::debug!(message = %line, "Command reply without status");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, message = %line, "Dropping malformed command message");
                false
            }
        }
    }
}

/// Consumer of the event link.
pub struct EventMonitor {
    pvs: Arc<ProcessVariables>,
    recorder: SharedRecorder,
    max_frame_number: u64,
}

impl EventMonitor {
    pub fn new(pvs: Arc<ProcessVariables>, recorder: SharedRecorder) -> Self {
        Self {
            pvs,
            recorder,
            max_frame_number: DEFAULT_MAX_FRAME_NUMBER,
        }
    }

    /// Drop frames numbered above `max_frame_number`.
    pub fn with_frame_limit(mut self, max_frame_number: u64) -> Self {
        self.max_frame_number = max_frame_number;
        self
    }

    pub async fn run<S>(self, messages: S)
    where
        S: Stream<Item = String> + Send,
    {
        futures::pin_mut!(messages);
        while let Some(line) = messages.next().await {
            self.handle(&line).await;
        }
        tracing::debug!("Event stream ended");
    }

    /// Route one event-link message. Returns `true` if a frame was recorded.
    pub async fn handle(&self, line: &str) -> bool {
        match decode_frame(line) {
            Ok(Some(frame)) => self.record(&frame).await,
            Ok(None) => {
                tracing::debug!(message = %line, "Event without frame number");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, message = %line, "Dropping malformed event message");
                false
            }
        }
    }

    async fn record(&self, frame: &FrameRecord) -> bool {
        if frame.frame_number > self.max_frame_number {
            tracing::warn!(
                frame = frame.frame_number,
                limit = self.max_frame_number,
                "Frame number above limit, frame dropped"
            );
            return false;
        }

        let mut recorder = self.recorder.lock().await;
        if let Err(e) = open_output(&self.pvs, &mut recorder) {
            tracing::error!(
                error = %e,
                frame = frame.frame_number,
                "Cannot open output file, frame dropped"
            );
            return false;
        }

        match recorder.write(frame) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, frame = frame.frame_number, "Failed to record frame");
                false
            }
        }
    }
}
