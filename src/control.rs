//! Control-system write path.
//!
//! Writes to settable variables are queued on an `mpsc` channel and applied
//! one at a time by [`dispatch`], so handlers never interleave. Each request
//! carries a `oneshot` for the outcome.
//!
//! [`ControlServer`] exposes the queue over TCP, one JSON object per line:
//!
//! ```text
//! -> {"put":"MODE","value":1}
//! <- {"ok":true}
//! -> {"get":"MODE_RBV"}
//! <- {"ok":true,"value":1}
//! -> {"put":"ATTENUATION","value":99}
//! <- {"ok":false,"error":"Invalid value for ATTENUATION: must be 0..=15"}
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

use crate::controller::Controller;
use crate::error::{CommandError, PfcResult};
use crate::pv::{ProcessVariables, PvValue, StateSink};

/// One queued write.
#[derive(Debug)]
pub enum ControlRequest {
    Put {
        name: String,
        value: PvValue,
        respond: oneshot::Sender<Result<(), CommandError>>,
    },
}

/// Sending side of the write queue.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlRequest>,
}

impl ControlHandle {
    /// Queue a write and wait for the controller's verdict.
    pub async fn put(&self, name: &str, value: PvValue) -> Result<(), CommandError> {
        let (respond, outcome) = oneshot::channel();
        let request = ControlRequest::Put {
            name: name.to_string(),
            value,
            respond,
        };
        self.tx
            .send(request)
            .await
            .map_err(|_| CommandError::Unavailable)?;
        outcome.await.map_err(|_| CommandError::Unavailable)?
    }
}

/// Create the write queue with room for `capacity` pending requests.
pub fn channel(capacity: usize) -> (ControlHandle, mpsc::Receiver<ControlRequest>) {
    let (tx, rx) = mpsc::channel(capacity);
    (ControlHandle { tx }, rx)
}

/// Apply queued writes in arrival order until every handle is dropped.
pub async fn dispatch(controller: Arc<Controller>, mut rx: mpsc::Receiver<ControlRequest>) {
    while let Some(request) = rx.recv().await {
        match request {
            ControlRequest::Put {
                name,
                value,
                respond,
            } => {
                let result = controller.apply_named(&name, value).await;
                if respond.send(result).is_err() {
                    tracing::debug!(parameter = %name, "Caller gone before write completed");
                }
            }
        }
    }
    tracing::debug!("Control queue closed");
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ClientRequest {
    Put { put: String, value: PvValue },
    Get { get: String },
}

#[derive(Debug, Serialize)]
struct ClientReply {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<PvValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ClientReply {
    fn done(value: Option<PvValue>) -> Self {
        Self {
            ok: true,
            value,
            error: None,
        }
    }

    fn failed(error: impl ToString) -> Self {
        Self {
            ok: false,
            value: None,
            error: Some(error.to_string()),
        }
    }
}

/// Line-oriented JSON endpoint for the control system.
pub struct ControlServer {
    listener: TcpListener,
    handle: ControlHandle,
    pvs: Arc<ProcessVariables>,
}

impl ControlServer {
    /// Listen on `address`; port 0 picks a free one.
    pub async fn bind(
        address: &str,
        handle: ControlHandle,
        pvs: Arc<ProcessVariables>,
    ) -> PfcResult<Self> {
        let listener = TcpListener::bind(address).await?;
        tracing::info!(address = %listener.local_addr()?, "Control endpoint listening");
        Ok(Self {
            listener,
            handle,
            pvs,
        })
    }

    pub fn local_addr(&self) -> PfcResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept clients until aborted. Client sessions end with the server.
    pub async fn run(self) {
        let mut clients = JoinSet::new();
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        tracing::debug!(%peer, "Control client connected");
                        let handle = self.handle.clone();
                        clients.spawn(serve_client(socket, peer, handle, self.pvs.clone()));
                    }
                    Err(e) => tracing::error!(error = %e, "Control accept error"),
                },
                Some(finished) = clients.join_next() => {
                    if let Err(e) = finished {
                        tracing::warn!(error = %e, "Control client task failed");
                    }
                }
            }
        }
    }
}

async fn serve_client(
    socket: TcpStream,
    peer: SocketAddr,
    handle: ControlHandle,
    pvs: Arc<ProcessVariables>,
) {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "Control client read error");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let reply = answer(&line, &handle, &pvs).await;
        let mut out = match serde_json::to_string(&reply) {
            Ok(out) => out,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode control reply");
                break;
            }
        };
        out.push('\n');
        if let Err(e) = writer.write_all(out.as_bytes()).await {
            tracing::warn!(%peer, error = %e, "Control client write error");
            break;
        }
    }
    tracing::debug!(%peer, "Control client disconnected");
}

async fn answer(line: &str, handle: &ControlHandle, pvs: &ProcessVariables) -> ClientReply {
    match serde_json::from_str::<ClientRequest>(line) {
        Ok(ClientRequest::Put { put, value }) => match handle.put(&put, value).await {
            Ok(()) => ClientReply::done(None),
            Err(e) => ClientReply::failed(e),
        },
        Ok(ClientRequest::Get { get }) => match pvs.get(&get) {
            Some(value) => ClientReply::done(Some(value)),
            None => ClientReply::failed(format!("No such variable {get}")),
        },
        Err(e) => {
            tracing::warn!(error = %e, message = %line, "Malformed control request");
            ClientReply::failed(format!("Malformed request: {e}"))
        }
    }
}
