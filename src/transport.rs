//! Reconnecting message links to the device.
//!
//! A [`TransportLink`] wraps one logical stream (command or event) over TCP
//! with newline-delimited JSON framing. It owns the socket lifecycle:
//!
//! ```text
//!   ┌──────────── connect() ────────────┐
//!   │                                   ▼
//! not running ◄── transport fault ── running ──► inbound queue ──► receive()
//!   │  ▲                                ▲
//!   └──┘ sleep(retry_delay)             └──── outbound queue ◄── send()
//! ```
//!
//! Faults never escape the link: [`TransportLink::run_forever`] logs them,
//! clears the running flag, waits the fixed retry delay and reconnects.
//! Consumers of [`TransportLink::receive`] simply see a gap in the message
//! sequence. Messages are not guaranteed to keep their order across a
//! reconnect, and outbound messages queued before a fault are discarded.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, Stream};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use crate::error::{PfcError, PfcResult};

/// Give up on a single connect attempt after this long
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Direction of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// Request/reply: messages flow both ways
    Duplex,
    /// Subscribe-only: the supervisor never writes
    ReceiveOnly,
}

/// Outbound half of a link as seen by command issuers.
///
/// The status poller and the controller only need to know whether the link is
/// up and to enqueue a message, so they depend on this rather than on the
/// socket-owning type.
pub trait CommandChannel: Send + Sync {
    /// Whether the socket is currently connected.
    fn is_running(&self) -> bool;

    /// Enqueue one message. Returns `false` (and logs) if it was dropped.
    fn send(&self, message: String) -> bool;
}

/// A reconnecting streaming endpoint.
pub struct TransportLink {
    name: String,
    address: String,
    mode: LinkMode,
    retry_delay: Duration,
    running: AtomicBool,
    connections: AtomicU64,
    outbound_tx: mpsc::UnboundedSender<String>,
    outbound_rx: Mutex<mpsc::UnboundedReceiver<String>>,
    inbound_tx: mpsc::UnboundedSender<String>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl TransportLink {
    /// An idle link; nothing connects until [`TransportLink::run_forever`].
    ///
    /// `address` is `host:port`, retried every `retry_delay` after a fault.
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        mode: LinkMode,
        retry_delay: Duration,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            address: address.into(),
            mode,
            retry_delay,
            running: AtomicBool::new(false),
            connections: AtomicU64::new(0),
            outbound_tx,
            outbound_rx: Mutex::new(outbound_rx),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
        }
    }

    /// Full-duplex command link
    pub fn command(address: impl Into<String>, retry_delay: Duration) -> Self {
        Self::new("command", address, LinkMode::Duplex, retry_delay)
    }

    /// Receive-only event link
    pub fn event(address: impl Into<String>, retry_delay: Duration) -> Self {
        Self::new("event", address, LinkMode::ReceiveOnly, retry_delay)
    }

    /// Label used in logs and errors
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remote `host:port`
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn mode(&self) -> LinkMode {
        self.mode
    }

    /// Number of successful connects so far
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// One connection attempt to the configured address.
    pub async fn connect(&self) -> PfcResult<TcpStream> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.address))
            .await
            .map_err(|_| self.fault(format!("connect to {} timed out", self.address)))?
            .map_err(|e| self.fault(format!("connect to {} failed: {e}", self.address)))?;

        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Connect, pump messages, and reconnect on failure. Never returns.
    pub async fn run_forever(&self) {
        loop {
            match self.connect().await {
                Ok(stream) => {
                    let count = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::info!(
                        link = %self.name,
                        address = %self.address,
                        connections = count,
                        "Link connected"
                    );
                    self.running.store(true, Ordering::Release);
                    let result = self.pump(stream).await;
                    self.running.store(false, Ordering::Release);
                    if let Err(e) = result {
                        tracing::warn!(link = %self.name, error = %e, "Link dropped");
                    }
                }
                Err(e) => {
                    tracing::debug!(link = %self.name, error = %e, "Connect attempt failed");
                }
            }
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    /// Move messages between the socket and the queues until the socket fails.
    async fn pump(&self, stream: TcpStream) -> PfcResult<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        let mut outbound = self.outbound_rx.lock().await;

        let mut stale = 0usize;
        while outbound.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            tracing::debug!(link = %self.name, stale, "Discarded messages queued before reconnect");
        }

        let duplex = self.mode == LinkMode::Duplex;
        loop {
            tokio::select! {
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if !line.is_empty() {
                            // The receiver lives in `self`, so the queue is never closed here
                            let _ = self.inbound_tx.send(line.to_string());
                        }
                    }
                    Ok(None) => return Err(self.fault("connection closed by device")),
                    Err(e) => return Err(self.fault(format!("read failed: {e}"))),
                },
                Some(message) = outbound.recv(), if duplex => {
                    let mut frame = message.into_bytes();
                    frame.push(b'\n');
                    writer
                        .write_all(&frame)
                        .await
                        .map_err(|e| self.fault(format!("write failed: {e}")))?;
                    writer
                        .flush()
                        .await
                        .map_err(|e| self.fault(format!("flush failed: {e}")))?;
                }
            }
        }
    }

    /// Next inbound message, waiting until one arrives.
    ///
    /// Concurrent callers take turns; each message goes to exactly one caller.
    pub async fn receive(&self) -> Option<String> {
        self.inbound_rx.lock().await.recv().await
    }

    /// Inbound messages as a stream. Dropping the stream and calling this
    /// again resumes where the previous consumer stopped.
    pub fn messages(self: &Arc<Self>) -> impl Stream<Item = String> + Send + 'static {
        stream::unfold(Arc::clone(self), |link| async move {
            let message = link.receive().await?;
            Some((message, link))
        })
    }

    fn fault(&self, message: impl Into<String>) -> PfcError {
        PfcError::Transport {
            link: self.name.clone(),
            message: message.into(),
        }
    }
}

impl CommandChannel for TransportLink {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn send(&self, message: String) -> bool {
        if self.mode == LinkMode::ReceiveOnly {
            tracing::warn!(link = %self.name, "Cannot send on a receive-only link");
            return false;
        }
        if !self.is_running() {
            tracing::warn!(link = %self.name, %message, "Link not running, message dropped");
            return false;
        }
        if self.outbound_tx.send(message).is_err() {
            tracing::error!(link = %self.name, "Outbound queue closed");
            return false;
        }
        true
    }
}
