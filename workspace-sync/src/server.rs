//! WebSocket listener: upgrade, authenticate, then pump frames between the
//! socket and its chat route's coordinator.
//!
//! Architecture:
//! ```text
//! Client A ──┐                                 ┌── RoomCoordinator (chat 1) ─┐
//!             ├── connection task ── registry ─┤                              ├── RoomHost (room)
//! Client B ──┘    │    ▲                       └── RoomCoordinator (chat 2) ─┘
//!                 │    └── writer task ◄── Transport queue ◄── fan-out
//!                 └── "ping" → "pong" (answered here, coordinator untouched)
//! ```
//!
//! Connection states: the upgrade handshake validates the path (HTTP 400
//! otherwise), identity and chat authorization follow (close 1008 on
//! failure), and only then is the session registered.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::auth::Credentials;
use crate::coordinator::Command;
use crate::error::SyncError;
use crate::protocol::{PING_TEXT, PONG_TEXT};
use crate::registry::RoomRegistry;
use crate::room::ChatRoute;
use crate::session::{ConnectionState, Outbound, Transport};

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
}

/// The WebSocket sync server.
#[derive(Clone)]
pub struct SyncServer {
    registry: Arc<RoomRegistry>,
    /// Per-session outbound queue capacity
    outbound_buffer: usize,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(registry: Arc<RoomRegistry>, outbound_buffer: usize) -> Self {
        Self {
            registry,
            outbound_buffer,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind `addr` and serve until the listener fails.
    pub async fn run(self, addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections from an already-bound listener.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                server.handle_connection(stream, addr).await;
            });
        }
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let mut state = ConnectionState::Connecting;
        log::debug!("Connection from {addr}: {state:?}");
        let mut upgrade: Option<(ChatRoute, Credentials, String)> = None;
        let check_path = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let uri = request.uri();
            match ChatRoute::from_path(uri.path()) {
                Ok(route) => {
                    let authorization = request
                        .headers()
                        .get(AUTHORIZATION)
                        .and_then(|value| value.to_str().ok());
                    let credentials = Credentials::from_request(authorization, uri.query());
                    upgrade = Some((route, credentials, uri.to_string()));
                    Ok(response)
                }
                Err(e) => {
                    let mut rejection = ErrorResponse::new(Some(e.to_string()));
                    *rejection.status_mut() = StatusCode::BAD_REQUEST;
                    Err(rejection)
                }
            }
        };

        let ws = match tokio_tungstenite::accept_hdr_async(stream, check_path).await {
            Ok(ws) => ws,
            Err(e) => {
                log::info!("Handshake from {addr} rejected: {e}");
                self.stats.write().await.rejected_connections += 1;
                return;
            }
        };
        let Some((route, credentials, url)) = upgrade else {
            return;
        };

        let access = self.registry.context().access.clone();
        let identity = match access.resolve_identity(&credentials).await {
            Ok(identity) => identity,
            Err(e) => {
                self.refuse(ws, addr, &e).await;
                return;
            }
        };

        let (transport, mut outbound) = Transport::channel(self.outbound_buffer);
        let session_id = match self
            .registry
            .accept(&route, transport.clone(), identity, url)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                self.refuse(ws, addr, &e).await;
                return;
            }
        };
        state = ConnectionState::Open;

        {
            let mut s = self.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }
        log::info!("WebSocket session {session_id} open from {addr} on {route}");

        let (mut ws_sender, mut ws_receiver) = ws.split();

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                let message = match message {
                    Outbound::Binary(bytes) => Message::binary(bytes.to_vec()),
                    Outbound::Text(text) => Message::text(text.to_string()),
                    Outbound::Pong(data) => Message::Pong(data.into()),
                };
                if ws_sender.send(message).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        while state == ConnectionState::Open {
            let Some(message) = ws_receiver.next().await else {
                break;
            };
            let command = match message {
                Ok(Message::Text(text)) if text.as_str() == PING_TEXT => {
                    let _ = transport.try_send(Outbound::Text(PONG_TEXT.into()));
                    continue;
                }
                Ok(Message::Text(text)) => {
                    self.count_frame(text.len()).await;
                    Command::Text {
                        session_id,
                        text: text.as_str().to_string(),
                    }
                }
                Ok(Message::Binary(data)) => {
                    self.count_frame(data.len()).await;
                    Command::Binary {
                        session_id,
                        bytes: data.into(),
                    }
                }
                Ok(Message::Ping(data)) => {
                    let _ = transport.try_send(Outbound::Pong(data.into()));
                    continue;
                }
                Ok(Message::Close(_)) => {
                    log::info!("Session {session_id} closed by {addr}");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    log::warn!("WebSocket error from {addr}: {e}");
                    break;
                }
            };
            if let Err(e) = self.registry.dispatch(&route, command).await {
                log::error!("Cannot reach coordinator for {route}: {e}");
                state = ConnectionState::Closing;
            }
        }

        // Open -> Closing -> Closed
        let pool = self.registry.context().pool.clone();
        pool.mark_closing(&session_id).await;
        if let Err(e) = self
            .registry
            .dispatch(&route, Command::Close { session_id })
            .await
        {
            log::warn!("Close of session {session_id} not delivered: {e}");
            pool.remove(&session_id).await;
        }
        drop(transport);
        writer.abort();

        let mut s = self.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }

    async fn refuse(&self, mut ws: WebSocketStream<TcpStream>, addr: SocketAddr, error: &SyncError) {
        let code = match error {
            SyncError::Unauthorized(_) | SyncError::Forbidden(_) => CloseCode::Policy,
            _ => CloseCode::Error,
        };
        log::info!("Refusing connection from {addr}: {error}");
        self.stats.write().await.rejected_connections += 1;

        let frame = CloseFrame {
            code,
            reason: error.to_string().into(),
        };
        if let Err(e) = ws.close(Some(frame)).await {
            log::debug!("Close to {addr} failed: {e}");
        }
    }

    async fn count_frame(&self, len: usize) {
        let mut s = self.stats.write().await;
        s.total_frames += 1;
        s.total_bytes += len as u64;
    }
}
