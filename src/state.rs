//! Shared supervision state.
//!
//! Two pieces of state cross task boundaries:
//!
//! - **Connection state** lives in a `watch` channel. The sending half is a
//!   [`ConnectionAuthority`] handed to the status poller alone; everyone else
//!   reads through [`LinkState::connection`] or [`LinkState::subscribe`].
//! - **Reply outstanding** is an atomic flag set by the poller when it sends a
//!   status request and cleared by the command-stream demultiplexer when a
//!   status reply arrives. A `Notify` wakes a poller that is waiting out a
//!   disconnection.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Whether the device is answering status requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }

    pub fn label(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connected => "Connected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// State shared by the poller, demultiplexers and controller.
pub struct LinkState {
    connection: watch::Receiver<ConnectionState>,
    reply_outstanding: AtomicBool,
    reply_notify: Notify,
}

/// The only handle that can change [`ConnectionState`].
pub struct ConnectionAuthority {
    tx: watch::Sender<ConnectionState>,
}

impl LinkState {
    /// Starts disconnected with no request outstanding.
    pub fn new() -> (Self, ConnectionAuthority) {
        let (tx, rx) = watch::channel(ConnectionState::Disconnected);
        (
            Self {
                connection: rx,
                reply_outstanding: AtomicBool::new(false),
                reply_notify: Notify::new(),
            },
            ConnectionAuthority { tx },
        )
    }

    pub fn connection(&self) -> ConnectionState {
        *self.connection.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.connection().is_connected()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    pub fn is_reply_outstanding(&self) -> bool {
        self.reply_outstanding.load(Ordering::Acquire)
    }

    pub fn mark_request_sent(&self) {
        self.reply_outstanding.store(true, Ordering::Release);
    }

    pub fn reply_received(&self) {
        self.reply_outstanding.store(false, Ordering::Release);
        self.reply_notify.notify_waiters();
    }

    /// Wait up to `limit` for the outstanding reply. Returns `true` once no
    /// reply is outstanding.
    pub async fn wait_for_reply(&self, limit: Duration) -> bool {
        // Register before checking so a reply landing in between still wakes us
        let notified = self.reply_notify.notified();
        if !self.is_reply_outstanding() {
            return true;
        }
        let _ = tokio::time::timeout(limit, notified).await;
        !self.is_reply_outstanding()
    }
}

impl ConnectionAuthority {
    /// Change the connection state, logging real transitions.
    pub fn set(&self, state: ConnectionState) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            match state {
                ConnectionState::Connected => tracing::info!("Device connected"),
                ConnectionState::Disconnected => tracing::warn!("Device disconnected"),
            }
        }
    }

    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn starts_disconnected_with_nothing_outstanding() {
        let (state, _authority) = LinkState::new();
        assert_eq!(state.connection(), ConnectionState::Disconnected);
        assert!(!state.is_reply_outstanding());
    }

    #[test]
    fn authority_drives_readers() {
        let (state, authority) = LinkState::new();
        let mut rx = state.subscribe();
        authority.set(ConnectionState::Connected);
        assert!(state.is_connected());
        assert!(rx.has_changed().unwrap());
        rx.mark_unchanged();

        authority.set(ConnectionState::Connected);
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_reply_times_out() {
        let (state, _authority) = LinkState::new();
        state.mark_request_sent();
        assert!(!state.wait_for_reply(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_reply_wakes_on_reply() {
        let (state, _authority) = LinkState::new();
        let state = Arc::new(state);
        state.mark_request_sent();

        let waiter = tokio::spawn({
            let state = state.clone();
            async move { state.wait_for_reply(Duration::from_secs(60)).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        state.reply_received();

        assert!(waiter.await.unwrap());
    }
}
