//! The WebSocket endpoint itself. Bind/accept is independent of any job's
//! `CancellationToken` — cancelling a job pauses/aborts its upload, it never
//! tears down this listener (§5, §9).

use crate::command::Command;
use crate::events::OutboundFrame;
use crate::progress::JobSnapshot;
use futures_util::{SinkExt, StreamExt};
use haul_kernel::{AgentError, Config, Result};
use std::sync::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct StatusFrame {
    upload_id: Option<String>,
    status: String,
    message: String,
}

/// The shared publish/subscribe hub. Cheap to clone-by-`Arc`; every
/// connected client gets its own `broadcast::Receiver`.
pub struct ControlSurface {
    tx: broadcast::Sender<OutboundFrame>,
    config_frame: OutboundFrame,
    last_status: Mutex<Option<StatusFrame>>,
    last_snapshot: Mutex<Option<JobSnapshot>>,
    commands_tx: mpsc::UnboundedSender<Command>,
    ws_port: u16,
}

impl ControlSurface {
    /// Builds the surface and returns the receiving half of the inbound
    /// command channel for the (not-yet-connected) Job Supervisor to poll.
    pub fn new(config: &Config) -> (std::sync::Arc<Self>, mpsc::UnboundedReceiver<Command>) {
        let (tx, _rx) = broadcast::channel(256);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let config_frame = OutboundFrame::Config {
            chunk_size_mb: config.part_size_bytes as f64 / (1024.0 * 1024.0),
            max_threads: config.workers_max,
            presign_batch_size: config.presign_batch_size,
            ws_port: config.ws_port,
        };

        let surface = std::sync::Arc::new(Self {
            tx,
            config_frame,
            last_status: Mutex::new(None),
            last_snapshot: Mutex::new(None),
            commands_tx,
            ws_port: config.ws_port,
        });
        (surface, commands_rx)
    }

    /// Sends a frame to every currently connected client. No-op if nobody is
    /// listening (a `broadcast::Sender` with zero receivers just drops it).
    pub fn broadcast(&self, frame: OutboundFrame) {
        let _ = self.tx.send(frame);
    }

    /// Records the latest progress snapshot so a client that attaches
    /// mid-job gets caught up immediately instead of waiting for the next
    /// tick (§4.7 expansion).
    pub fn publish_snapshot(&self, snapshot: JobSnapshot) {
        *self.last_snapshot.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot);
    }

    /// Broadcasts a `status` frame and remembers it for late-attaching
    /// clients.
    pub fn publish_status(&self, upload_id: Option<String>, status: &str, message: &str) {
        let frame = StatusFrame {
            upload_id: upload_id.clone(),
            status: status.to_string(),
            message: message.to_string(),
        };
        *self.last_status.lock().unwrap_or_else(|e| e.into_inner()) = Some(frame);
        self.broadcast(OutboundFrame::Status {
            upload_id,
            status: status.to_string(),
            message: message.to_string(),
        });
    }

    /// Broadcasts a job-level `error` frame. The Supervisor is the sole
    /// caller of this per spec §7.
    pub fn publish_error(&self, upload_id: Option<String>, err: &AgentError) {
        self.broadcast(OutboundFrame::Error {
            upload_id,
            error: err.to_string(),
            code: err.code().as_str().to_string(),
        });
    }

    /// Clears the remembered job state once a job finishes, so a later
    /// connection doesn't replay a stale snapshot for a job that no longer
    /// exists.
    pub fn clear_job_state(&self) {
        *self.last_snapshot.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Binds the listener and serves connections until `cancel` fires.
    /// Each connection is handled on its own task; one client's disconnect
    /// never affects another's.
    pub async fn serve(self: std::sync::Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let addr = format!("127.0.0.1:{}", self.ws_port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| AgentError::Internal {
            message: format!("failed to bind control surface on {addr}: {e}"),
        })?;
        debug!(%addr, "control surface listening");

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "control surface accept failed");
                            continue;
                        }
                    };
                    let surface = self.clone();
                    let conn_cancel = cancel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = surface.handle_connection(stream, conn_cancel).await {
                            debug!(%peer, error = %e, "control connection closed");
                        }
                    });
                }
                _ = cancel.cancelled() => {
                    debug!("control surface shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_connection(
        self: std::sync::Arc<Self>,
        stream: tokio::net::TcpStream,
        cancel: CancellationToken,
    ) -> Result<()> {
        let ws = tokio_tungstenite::accept_async(stream).await.map_err(|e| AgentError::Internal {
            message: format!("websocket handshake failed: {e}"),
        })?;
        let (mut outbound, mut inbound) = ws.split();
        let mut events = self.tx.subscribe();

        send_frame(&mut outbound, &self.config_frame).await?;
        if let Some(status) = self.last_status.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            send_frame(
                &mut outbound,
                &OutboundFrame::Status {
                    upload_id: status.upload_id,
                    status: status.status,
                    message: status.message,
                },
            )
            .await?;
        }
        if let Some(snapshot) = self.last_snapshot.lock().unwrap_or_else(|e| e.into_inner()).clone() {
            send_frame(&mut outbound, &OutboundFrame::from(snapshot)).await?;
        }

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Ok(frame) => send_frame(&mut outbound, &frame).await?,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
                msg = inbound.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(command) = Command::parse(&text) {
                                let _ = self.commands_tx.send(command);
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!(error = %e, "control connection read error");
                            return Ok(());
                        }
                    }
                }
                _ = cancel.cancelled() => return Ok(()),
            }
        }
    }
}

async fn send_frame(
    sink: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    frame: &OutboundFrame,
) -> Result<()> {
    let text = serde_json::to_string(frame).map_err(|e| AgentError::Internal {
        message: format!("failed to serialize control frame: {e}"),
    })?;
    sink.send(Message::Text(text)).await.map_err(|e| AgentError::Internal {
        message: format!("failed to send control frame: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_surface_builds_config_frame_from_config() {
        let config = Config::default();
        let (surface, _rx) = ControlSurface::new(&config);
        match &surface.config_frame {
            OutboundFrame::Config { ws_port, max_threads, .. } => {
                assert_eq!(*ws_port, config.ws_port);
                assert_eq!(*max_threads, config.workers_max);
            }
            _ => panic!("expected a config frame"),
        }
    }

    #[test]
    fn publish_status_is_remembered_for_late_attach() {
        let config = Config::default();
        let (surface, _rx) = ControlSurface::new(&config);
        surface.publish_status(Some("up-1".into()), "uploading", "in progress");
        let remembered = surface.last_status.lock().unwrap();
        assert_eq!(remembered.as_ref().unwrap().status, "uploading");
    }

    #[tokio::test]
    async fn serve_stops_cleanly_on_cancellation() {
        let mut config = Config::default();
        config.ws_port = 0; // OS-assigned port avoids clashing with a real run
        let (surface, _rx) = ControlSurface::new(&config);
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();

        let result = tokio::spawn(async move { surface.serve(cancel2).await });
        cancel.cancel();
        let _ = result.await;
    }
}
