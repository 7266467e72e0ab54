//! # PFC Supervisor
//!
//! Supervises a networked filter-changer controller. The supervisor keeps two
//! long-lived links to the device, polls its status, mirrors that status into
//! process variables for the control system and records the per-frame
//! attenuation stream to a growing table file.
//!
//! ## Crate Structure
//!
//! - **`transport`**: reconnecting command (duplex) and event (receive-only)
//!   links.
//! - **`poller`**: periodic status requests; the only writer of the
//!   connection state.
//! - **`state`**: shared connection state and the reply-outstanding flag.
//! - **`demux`**: routes command replies to the synchronizer and frame events
//!   to the recorder.
//! - **`sync`**: projects status replies onto process variables and closes
//!   the recording after a frame timeout.
//! - **`recorder`**: the attenuation table and its file backends.
//! - **`controller`**: validated command-issuing operations.
//! - **`control`**: the queued write path and its TCP endpoint.
//! - **`autosave`**: persisted filter positions, filter set and thresholds.
//! - **`pv`**: the process-variable store.
//! - **`protocol`**: JSON wire messages.
//! - **`supervisor`**: wires the above into its background tasks.
//! - **`config`**, **`logging`**, **`error`**: the ambient stack.

pub mod autosave;
pub mod config;
pub mod control;
pub mod controller;
pub mod demux;
pub mod error;
pub mod logging;
pub mod poller;
pub mod protocol;
pub mod pv;
pub mod recorder;
pub mod state;
pub mod supervisor;
pub mod sync;
pub mod transport;

pub use error::{CommandError, PfcError, PfcResult};
pub use supervisor::{Supervisor, SupervisorHandle};
