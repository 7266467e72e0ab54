//! Wiring of the cooperating tasks.
//!
//! ```text
//!  command link ──► CommandMonitor ──► StateSynchronizer ──► process variables
//!       ▲                 │                    │                    ▲
//!       │                 └── reply received   └── close on timeout │
//!  StatusPoller ◄─────────┘                            │            │
//!       ▲                                              ▼            │
//!  event link ────► EventMonitor ─────────────► FrameRecorder       │
//!       │                                              ▲            │
//!  control endpoint ──► dispatch ──► Controller ───────┴────────────┘
//! ```
//!
//! Shared state is limited to [`LinkState`] (connection + reply flag), the
//! [`SharedRecorder`] and the process variables. The controller is reached
//! only through the control queue. Once the device first answers, the
//! restored filter set and thresholds are sent to it. Tasks run until
//! aborted; shutdown aborts all of them and closes any open output file last.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Local;
use tokio::task::JoinHandle;

use crate::autosave::{position_name, Autosave, Direction, SavedSettings};
use crate::config::{ControlConfig, SupervisorConfig};
use crate::control::{self, ControlHandle, ControlServer};
use crate::controller::{self, Controller, ThresholdKind};
use crate::demux::{self, CommandMonitor, EventMonitor};
use crate::error::{PfcError, PfcResult};
use crate::poller::{PollTiming, StatusPoller};
use crate::pv::{ProcessVariables, PvMetadata, PvValue, FILTER_SETS, MODES, STATES};
use crate::recorder::{path, FrameRecorder, SharedRecorder, TableBackend};
use crate::state::{ConnectionAuthority, ConnectionState, LinkState};
use crate::sync::{self, StateSynchronizer, DEFAULT_TIMEOUT_SECS};
use crate::transport::{CommandChannel, TransportLink};

/// Define every process variable with its initial value, restored settings
/// included.
pub fn define_variables(pvs: &ProcessVariables, config: &SupervisorConfig, saved: &SavedSettings) {
    use controller::names as ctl;
    use demux::names as file;
    use sync::names as st;

    fn choices(c: &'static [&'static str]) -> PvMetadata {
        PvMetadata {
            unit: None,
            choices: Some(c),
        }
    }
    fn unit(u: &'static str) -> PvMetadata {
        PvMetadata {
            unit: Some(u),
            choices: None,
        }
    }

    pvs.define(st::VERSION, PvValue::Text(String::new()));
    pvs.define_with(st::STATE, PvValue::Int(0), choices(&STATES));
    pvs.define_with(ctl::MODE, PvValue::Int(0), choices(&MODES));
    pvs.define_with(ctl::MODE_RBV, PvValue::Int(0), choices(&MODES));
    pvs.define(ctl::RESET, PvValue::Int(0));
    pvs.define_with(ctl::TIMEOUT, PvValue::Float(DEFAULT_TIMEOUT_SECS), unit("s"));
    pvs.define_with(st::TIMEOUT_RBV, PvValue::Float(DEFAULT_TIMEOUT_SECS), unit("s"));
    pvs.define(ctl::TIMEOUT_CLEAR, PvValue::Int(0));
    pvs.define(ctl::SINGLESHOT_START, PvValue::Int(0));

    for kind in ThresholdKind::ALL {
        pvs.define(kind.pv_name(), PvValue::Int(kind.get(&saved.thresholds)));
    }

    let set = PvValue::Int(saved.filter_set as i64);
    pvs.define_with(ctl::FILTER_SET, set.clone(), choices(&FILTER_SETS));
    pvs.define_with(ctl::FILTER_SET_RBV, set, choices(&FILTER_SETS));
    let positions = &saved.positions;
    for direction in Direction::BOTH {
        for set in 0..positions.set_count() {
            for filter in 0..positions.filters_per_set() {
                let value = positions
                    .get(set, direction, filter)
                    .unwrap_or_else(|| direction.default_position());
                pvs.define(&position_name(set, direction, filter), PvValue::Float(value));
            }
        }
    }

    let directory = path::default_directory(&config.output.directory, Local::now());
    let directory = directory.display().to_string();
    pvs.define(file::FILE_PATH, PvValue::Text(directory.clone()));
    pvs.define(file::FILE_NAME, PvValue::Text(config.output.file_name.clone()));
    pvs.define(
        file::FILE_FULL_NAME,
        PvValue::Text(path::full_name(&directory, &config.output.file_name)),
    );
    pvs.define(file::FILE_OPEN, PvValue::Int(0));
    pvs.define(file::FILE_CLOSE, PvValue::Int(0));

    pvs.define_with(st::PROCESS_DURATION, PvValue::Float(0.0), unit("us"));
    pvs.define_with(st::PROCESS_PERIOD, PvValue::Float(0.0), unit("us"));
    pvs.define(st::FRAME_RECEIVED, PvValue::Int(0));
    pvs.define(st::FRAME_PROCESSED, PvValue::Int(0));
    pvs.define_with(st::FRAME_LAST_TIME, PvValue::Float(0.0), unit("s"));
    pvs.define(st::ATTENUATION_RBV, PvValue::Int(0));
    pvs.define(ctl::ATTENUATION, PvValue::Int(0));
}

/// Fully wired supervisor, not yet running.
pub struct Supervisor {
    pvs: Arc<ProcessVariables>,
    state: Arc<LinkState>,
    authority: ConnectionAuthority,
    command_link: Arc<TransportLink>,
    event_link: Arc<TransportLink>,
    recorder: SharedRecorder,
    controller: Arc<Controller>,
    timing: PollTiming,
    max_frame_number: u64,
    control: ControlConfig,
}

impl Supervisor {
    /// Validate `config`, restore autosaved settings and wire every part.
    /// Nothing runs until [`Supervisor::spawn`].
    pub fn new(config: &SupervisorConfig) -> PfcResult<Self> {
        config.validate()?;

        let backend = TableBackend::from_name(&config.output.backend).ok_or_else(|| {
            PfcError::Configuration(format!("unknown output backend '{}'", config.output.backend))
        })?;

        let autosave = Autosave::new(&config.autosave.path, &config.device.name, &config.filters);
        let saved = autosave.load()?;

        let pvs = Arc::new(ProcessVariables::new(&config.device.name));
        define_variables(&pvs, config, &saved);

        let (state, authority) = LinkState::new();
        let state = Arc::new(state);

        let command_link = Arc::new(TransportLink::command(
            config.device.command_address(),
            config.device.reconnect_delay(),
        ));
        let event_link = Arc::new(TransportLink::event(
            config.device.event_address(),
            config.device.reconnect_delay(),
        ));

        let recorder = FrameRecorder::shared(backend);
        let controller = Arc::new(Controller::new(
            command_link.clone() as Arc<dyn CommandChannel>,
            state.clone(),
            pvs.clone(),
            recorder.clone(),
            autosave,
            saved,
        ));

        tracing::info!(
            device = %config.device.name,
            command = %config.device.command_address(),
            event = %config.device.event_address(),
            backend = ?backend,
            "Supervisor configured"
        );

        Ok(Self {
            pvs,
            state,
            authority,
            command_link,
            event_link,
            recorder,
            controller,
            timing: PollTiming::from(&config.polling),
            max_frame_number: config.output.max_frame_number,
            control: config.control.clone(),
        })
    }

    /// Spawn the link, poller, monitor and control tasks. Fails only if the
    /// control endpoint cannot bind.
    pub async fn spawn(self) -> PfcResult<SupervisorHandle> {
        let (control, requests) = control::channel(self.control.queue_depth);
        let server = if self.control.enabled {
            let server =
                ControlServer::bind(&self.control.address, control.clone(), self.pvs.clone())
                    .await?;
            Some(server)
        } else {
            None
        };
        let control_address = server.as_ref().map(ControlServer::local_addr).transpose()?;

        let mut tasks = Vec::with_capacity(9);

        let link = self.command_link.clone();
        tasks.push(tokio::spawn(async move { link.run_forever().await }));
        let link = self.event_link.clone();
        tasks.push(tokio::spawn(async move { link.run_forever().await }));

        let poller = StatusPoller::new(
            self.command_link.clone() as Arc<dyn CommandChannel>,
            self.state.clone(),
            self.authority,
            self.timing,
        );
        tasks.push(tokio::spawn(poller.run_forever()));

        let sync = StateSynchronizer::new(self.pvs.clone(), self.recorder.clone());
        let commands = CommandMonitor::new(sync, self.state.clone());
        tasks.push(tokio::spawn(commands.run(self.command_link.messages())));

        let events = EventMonitor::new(self.pvs.clone(), self.recorder.clone())
            .with_frame_limit(self.max_frame_number);
        tasks.push(tokio::spawn(events.run(self.event_link.messages())));

        tasks.push(tokio::spawn(control::dispatch(self.controller.clone(), requests)));
        tasks.push(tokio::spawn(self.controller.configure_when_connected()));
        if let Some(server) = server {
            tasks.push(tokio::spawn(server.run()));
        }
        tracing::info!(tasks = tasks.len(), "Supervisor running");

        Ok(SupervisorHandle {
            pvs: self.pvs,
            state: self.state,
            recorder: self.recorder,
            control,
            control_address,
            tasks,
        })
    }

    /// Run until Ctrl-C, then shut down.
    pub async fn run(self) -> PfcResult<()> {
        let handle = self.spawn().await?;
        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutdown signal received");
        handle.shutdown().await;
        Ok(())
    }
}

/// A running supervisor.
pub struct SupervisorHandle {
    pvs: Arc<ProcessVariables>,
    state: Arc<LinkState>,
    recorder: SharedRecorder,
    control: ControlHandle,
    control_address: Option<SocketAddr>,
    tasks: Vec<JoinHandle<()>>,
}

impl SupervisorHandle {
    pub fn pvs(&self) -> &Arc<ProcessVariables> {
        &self.pvs
    }

    /// In-process writer onto the control queue
    pub fn control(&self) -> &ControlHandle {
        &self.control
    }

    /// Bound address of the control endpoint, if enabled
    pub fn control_address(&self) -> Option<SocketAddr> {
        self.control_address
    }

    pub fn recorder(&self) -> &SharedRecorder {
        &self.recorder
    }

    pub fn connection(&self) -> ConnectionState {
        self.state.connection()
    }

    pub fn subscribe_connection(&self) -> tokio::sync::watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Abort every task, then close the output file.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
        if self.recorder.lock().await.close() {
            tracing::info!("Output file closed on shutdown");
        }
        tracing::info!("Supervisor stopped");
    }
}
