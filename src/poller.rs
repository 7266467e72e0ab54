//! Status poller.
//!
//! Sends `{"command":"status"}` on the command link once per poll period and
//! watches for the reply. It is the only component allowed to change
//! [`ConnectionState`]:
//!
//! ```text
//!                 ┌──────── reply within one period ────────┐
//!                 ▼                                          │
//! IDLE ── send request ──► AWAITING_REPLY ───────────────────┘
//!                                │
//!                      no reply after one period
//!                                ▼
//!                 DISCONNECTED: wait, re-send every retry period
//!                                │
//!                          reply arrives
//!                                ▼
//!                            CONNECTED
//! ```
//!
//! While the command link itself is down the poller does nothing but wait;
//! the link's own reconnect loop handles the socket.

use std::sync::Arc;
use std::time::Duration;

use crate::config::PollingConfig;
use crate::protocol::DeviceCommand;
use crate::state::{ConnectionAuthority, ConnectionState, LinkState};
use crate::transport::CommandChannel;

/// Poll timings.
#[derive(Debug, Clone, Copy)]
pub struct PollTiming {
    pub poll_period: Duration,
    pub link_down_wait: Duration,
    pub retry_period: Duration,
}

impl Default for PollTiming {
    fn default() -> Self {
        Self {
            poll_period: Duration::from_millis(100),
            link_down_wait: Duration::from_secs(1),
            retry_period: Duration::from_secs(5),
        }
    }
}

impl From<&PollingConfig> for PollTiming {
    fn from(config: &PollingConfig) -> Self {
        Self {
            poll_period: config.poll_period(),
            link_down_wait: config.link_down_wait(),
            retry_period: config.retry_period(),
        }
    }
}

/// Periodic status requester and sole writer of the connection state.
///
/// A request is sent every poll period. If no reply arrives within the
/// period the device is marked disconnected and the request is re-sent every
/// retry period until one is answered.
pub struct StatusPoller {
    link: Arc<dyn CommandChannel>,
    state: Arc<LinkState>,
    authority: ConnectionAuthority,
    timing: PollTiming,
    requested: bool,
}

impl StatusPoller {
    /// Takes the only [`ConnectionAuthority`].
    pub fn new(
        link: Arc<dyn CommandChannel>,
        state: Arc<LinkState>,
        authority: ConnectionAuthority,
        timing: PollTiming,
    ) -> Self {
        Self {
            link,
            state,
            authority,
            timing,
            requested: false,
        }
    }

    /// Poll until aborted.
    pub async fn run_forever(mut self) {
        loop {
            let wait = self.tick().await;
            tokio::time::sleep(wait).await;
        }
    }

    /// One poll cycle. Returns how long to sleep before the next one.
    pub async fn tick(&mut self) -> Duration {
        if !self.link.is_running() {
            tracing::debug!("Command link not running, waiting");
            return self.timing.link_down_wait;
        }

        if !self.state.is_reply_outstanding() {
            if self.requested {
                self.authority.set(ConnectionState::Connected);
            }
            self.request_status();
        } else {
            tracing::warn!("No status response. Waiting for reconnect");
            self.authority.set(ConnectionState::Disconnected);
            self.await_reply().await;
            tracing::info!("Reconnected and status received");
            self.authority.set(ConnectionState::Connected);
        }

        self.timing.poll_period
    }

    /// Block until the outstanding reply arrives, re-sending the request every
    /// retry period in case the device lost it.
    async fn await_reply(&mut self) {
        let mut since_request = Duration::ZERO;
        while !self.state.wait_for_reply(self.timing.link_down_wait).await {
            since_request += self.timing.link_down_wait;
            if since_request >= self.timing.retry_period {
                since_request = Duration::ZERO;
                if self.link.is_running() {
                    tracing::debug!("Re-sending status request");
                    self.request_status();
                }
            }
        }
    }

    fn request_status(&mut self) {
        self.state.mark_request_sent();
        self.requested = true;
        self.link.send(DeviceCommand::Status.to_json());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// In-memory command channel recording everything sent.
    #[derive(Default)]
    pub(crate) struct RecordingChannel {
        pub running: AtomicBool,
        pub sent: Mutex<Vec<String>>,
    }

    impl RecordingChannel {
        pub fn up() -> Arc<Self> {
            let channel = Self::default();
            channel.running.store(true, Ordering::SeqCst);
            Arc::new(channel)
        }

        pub fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl CommandChannel for RecordingChannel {
        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn send(&self, message: String) -> bool {
            if !self.is_running() {
                return false;
            }
            self.sent.lock().unwrap().push(message);
            true
        }
    }

    fn poller(channel: Arc<RecordingChannel>) -> (StatusPoller, Arc<LinkState>) {
        let (state, authority) = LinkState::new();
        let state = Arc::new(state);
        let poller = StatusPoller::new(channel, state.clone(), authority, PollTiming::default());
        (poller, state)
    }

    #[tokio::test(start_paused = true)]
    async fn first_reply_marks_connected() {
        let channel = RecordingChannel::up();
        let (mut poller, state) = poller(channel.clone());

        assert_eq!(poller.tick().await, Duration::from_millis(100));
        assert_eq!(channel.sent(), vec![r#"{"command":"status"}"#.to_string()]);
        assert!(state.is_reply_outstanding());
        assert_eq!(state.connection(), ConnectionState::Disconnected);

        state.reply_received();
        poller.tick().await;
        assert_eq!(state.connection(), ConnectionState::Connected);
        assert_eq!(channel.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn link_down_sends_nothing() {
        let channel = Arc::new(RecordingChannel::default());
        let (mut poller, state) = poller(channel.clone());

        assert_eq!(poller.tick().await, Duration::from_secs(1));
        assert!(channel.sent().is_empty());
        assert!(!state.is_reply_outstanding());
    }

    #[tokio::test(start_paused = true)]
    async fn missed_reply_disconnects_until_reply_arrives() {
        let channel = RecordingChannel::up();
        let (poller, state) = poller(channel.clone());
        let mut connection = state.subscribe();

        let task = tokio::spawn(poller.run_forever());

        // First request goes out, no reply within the poll period
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(state.connection(), ConnectionState::Disconnected);
        assert!(state.is_reply_outstanding());

        // Outage longer than the retry period triggers a re-send
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(channel.sent().len() >= 2);
        assert_eq!(state.connection(), ConnectionState::Disconnected);

        state.reply_received();
        connection.changed().await.unwrap();
        assert_eq!(*connection.borrow(), ConnectionState::Connected);

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn steady_replies_stay_connected() {
        let channel = RecordingChannel::up();
        let (mut poller, state) = poller(channel.clone());

        for _ in 0..5 {
            poller.tick().await;
            state.reply_received();
        }
        poller.tick().await;
        assert_eq!(state.connection(), ConnectionState::Connected);
        assert_eq!(channel.sent().len(), 6);
    }
}
