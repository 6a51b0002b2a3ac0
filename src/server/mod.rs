pub mod connection;
pub mod hub;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use crate::error::HubError;
use crate::protocol::Message;
use connection::{Connection, ConnectionId};
use hub::{HubConfig, HubHandle};

const SEND_BUF: usize = 256;
const WRITER_GRACE: Duration = Duration::from_secs(5);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: String,
    /// Outbound messages buffered per connection before sends start to wait.
    pub outbound_capacity: usize,
    /// Broadcast `join`/`leave` system messages as clients come and go.
    pub announce_presence: bool,
    pub hub: HubConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            outbound_capacity: SEND_BUF,
            announce_presence: false,
            hub: HubConfig::default(),
        }
    }
}

// ─── Server ─────────────────────────────────────────────────────────────────

pub struct Server {
    hub: HubHandle,
    hub_task: Mutex<Option<JoinHandle<()>>>,
    conns: TaskTracker,
    config: ServerConfig,
}

impl Server {
    /// Spawns the hub, so it must be called inside a tokio runtime.
    pub fn new(config: ServerConfig) -> Self {
        let (hub, task) = hub::spawn(config.hub.clone());
        Self {
            hub,
            hub_task: Mutex::new(Some(task)),
            conns: TaskTracker::new(),
            config,
        }
    }

    pub fn hub(&self) -> &HubHandle {
        &self.hub
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(self)
    }

    pub async fn listen_and_serve(
        self: Arc<Self>,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let listener = TcpListener::bind(&self.config.addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve until `shutdown` resolves, then stop the hub, which closes every
    /// live connection. Returns once the hub has stopped and every connection
    /// task has finished, or after `SHUTDOWN_GRACE`.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        tracing::info!(addr = %listener.local_addr()?, "listening");

        let hub = self.hub.clone();
        let app = self
            .clone()
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.await;
                tracing::info!("shutting down");
                if let Err(e) = hub.shutdown().await {
                    tracing::warn!(error = %e, "hub did not accept shutdown");
                }
            })
            .await?;

        // Upgraded sockets are not tracked by axum; wait for them here.
        let hub_task = self.hub_task.lock().ok().and_then(|mut task| task.take());
        self.conns.close();
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            if let Some(task) = hub_task {
                task.await.ok();
            }
            self.conns.wait().await;
        })
        .await;
        if drained.is_err() {
            tracing::warn!(open = self.conns.len(), "shutdown grace expired");
        }
        Ok(())
    }

    async fn serve_conn(self: Arc<Self>, socket: WebSocket, remote: SocketAddr) {
        let _tracked = self.conns.token();
        let id = ConnectionId::new(remote.to_string());
        let (send_tx, mut send_rx) =
            mpsc::channel::<Message>(self.config.outbound_capacity.max(1));
        let conn = Connection::new(id.clone(), send_tx);

        if let Err(e) = self.hub.register(conn.clone()).await {
            tracing::warn!(conn = %id, error = %e, "could not register connection");
            return;
        }
        if self.config.announce_presence {
            self.announce("join", &id).await;
        }

        let (mut ws_tx, mut ws_rx) = socket.split();

        // Write pump
        let writer_conn = conn.clone();
        let mut writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = send_rx.recv() => {
                        let Some(msg) = msg else { break };
                        let text = match msg.encode() {
                            Ok(text) => text,
                            Err(e) => {
                                tracing::error!(conn = %writer_conn.id(), error = %e, "encode failed");
                                continue;
                            }
                        };
                        if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    _ = writer_conn.closed() => {
                        ws_tx.send(WsMessage::Close(None)).await.ok();
                        break;
                    }
                }
            }
            tracing::debug!(conn = %writer_conn.id(), "write pump ended");
        });

        // Read pump (runs in this task)
        loop {
            let frame = tokio::select! {
                frame = ws_rx.next() => frame,
                _ = conn.closed() => break,
            };
            let decoded = match frame {
                Some(Ok(WsMessage::Text(text))) => Message::decode(text.as_str()),
                Some(Ok(WsMessage::Binary(raw))) => Message::decode_bytes(&raw),
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Err(e)) => {
                    tracing::debug!(conn = %id, error = %e, "read failed");
                    break;
                }
            };
            let msg = match decoded {
                Ok(msg) => msg.with_sender(id.as_str()),
                Err(e) => {
                    tracing::info!(conn = %id, error = %e, "malformed message, closing");
                    break;
                }
            };

            tracing::debug!(conn = %id, kind = msg.kind(), "relaying");
            match self.hub.broadcast(msg).await {
                Ok(()) => {}
                Err(HubError::Busy(waited)) => {
                    tracing::warn!(conn = %id, ?waited, "hub busy, message dropped");
                }
                Err(HubError::Closed) => break,
            }
        }

        // Cleanup
        if let Err(e) = self.hub.unregister(conn.clone()).await {
            tracing::debug!(conn = %id, error = %e, "hub gone, closing directly");
            conn.close();
        }
        if self.config.announce_presence {
            self.announce("leave", &id).await;
        }
        if tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
            writer.abort();
        }
        tracing::info!(conn = %id, "connection closed");
    }

    async fn announce(&self, kind: &str, id: &ConnectionId) {
        if let Err(e) = self.hub.broadcast(Message::system(kind, id.as_str())).await {
            tracing::warn!(conn = %id, error = %e, "presence announcement dropped");
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(srv): State<Arc<Server>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| srv.serve_conn(socket, remote))
}

async fn health_handler(State(srv): State<Arc<Server>>) -> impl IntoResponse {
    match srv.hub.members().await {
        Ok(members) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "ok", "connections": members.len()})),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"status": "unavailable", "error": e.to_string()})),
        ),
    }
}
