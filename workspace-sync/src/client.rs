//! WebSocket sync client for one chat route.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - Room join/leave and update send/receive
//! - Chat messages and text liveness pings
//! - Offline queue for updates made while disconnected
//!
//! Reconnecting replays every joined room's `Join` before the queued
//! updates, so the server has each room loaded when the updates arrive.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{AppFrame, CrdtFrame, FrameType, ProtocolError, PING_TEXT, PONG_TEXT};
use crate::room::{ChatRoute, RoomKey};
use crate::session::ConnectionState;

/// Client-side failures.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    Connect(String),
    /// The server refused the upgrade with this HTTP status.
    #[error("upgrade rejected with HTTP {0}")]
    Rejected(u16),
    #[error("bearer token is not a valid header value")]
    InvalidToken,
    #[error("not connected")]
    NotConnected,
    #[error("offline queue is full")]
    QueueFull,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// Join accepted; `missing` is the update the client lacked
    Joined { key: RoomKey, missing: Vec<u8> },
    /// Update from another member of the room
    RemoteUpdate { key: RoomKey, update: Vec<u8> },
    /// The server asks for everything beyond `version_vector`
    SnapshotRequested { key: RoomKey, version_vector: Vec<u8> },
    /// Snapshot relayed from another member
    Snapshot { key: RoomKey, update: Vec<u8> },
    /// Error frame, with the room addressing as the server echoed it
    ServerError {
        crdt: String,
        room_id: String,
        message: String,
    },
    /// JSON application frame
    App(AppFrame),
    /// Reply to [`SyncClient::send_ping`]
    Pong,
    /// Close frame from the server
    Closed { code: Option<u16> },
}

/// Offline queue for updates made while disconnected.
///
/// Queued updates are replayed on reconnection, in order.
pub struct OfflineQueue {
    queue: VecDeque<QueuedUpdate>,
    max_size: usize,
}

#[derive(Debug, Clone)]
struct QueuedUpdate {
    key: RoomKey,
    payload: Vec<u8>,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an update for later replay. Returns false when full.
    pub fn enqueue(&mut self, key: RoomKey, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedUpdate { key, payload });
        true
    }

    pub fn drain(&mut self) -> Vec<(RoomKey, Vec<u8>)> {
        self.queue.drain(..).map(|u| (u.key, u.payload)).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop queued updates of one room (after leaving it).
    pub fn discard(&mut self, key: &RoomKey) {
        self.queue.retain(|u| &u.key != key);
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|u| u.payload.len()).sum()
    }
}

/// The sync client.
pub struct SyncClient {
    /// `ws://host:port`, without a path
    server_url: String,
    route: ChatRoute,
    token: Option<String>,

    state: Arc<RwLock<ConnectionState>>,

    offline_queue: Arc<Mutex<OfflineQueue>>,

    /// Joined rooms and the version vector each was joined with
    joined: Arc<Mutex<HashMap<RoomKey, Vec<u8>>>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,

    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(server_url: impl Into<String>, route: ChatRoute) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            route,
            token: None,
            state: Arc::new(RwLock::new(ConnectionState::Closed)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            joined: Arc::new(Mutex::new(HashMap::new())),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Authenticate with a bearer token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect, rejoin known rooms and replay queued updates.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        let url = format!("{}{}", self.server_url, self.route.path());
        let mut request = url
            .into_client_request()
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| ClientError::InvalidToken)?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        *self.state.write().await = ConnectionState::Connecting;
        let ws_stream = match tokio_tungstenite::connect_async(request).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                *self.state.write().await = ConnectionState::Closed;
                return Err(ClientError::Rejected(response.status().as_u16()));
            }
            Err(e) => {
                *self.state.write().await = ConnectionState::Closed;
                return Err(ClientError::Connect(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let closing = message.is_close();
                if ws_writer.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        {
            let joined = self.joined.lock().await;
            for (key, version_vector) in joined.iter() {
                match CrdtFrame::join(key, version_vector.clone()).encode() {
                    Ok(frame) => {
                        let _ = out_tx.send(Message::binary(frame)).await;
                    }
                    Err(e) => log::warn!("Cannot rejoin {key}: {e}"),
                }
            }
        }
        {
            let queued = self.offline_queue.lock().await.drain();
            if !queued.is_empty() {
                log::info!("Replaying {} queued updates", queued.len());
            }
            for (key, payload) in queued {
                match CrdtFrame::update(&key, payload).encode() {
                    Ok(frame) => {
                        let _ = out_tx.send(Message::binary(frame)).await;
                    }
                    Err(e) => log::warn!("Dropping queued update for {key}: {e}"),
                }
            }
        }
        self.outgoing_tx = Some(out_tx);

        *self.state.write().await = ConnectionState::Open;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(message) = ws_reader.next().await {
                let event = match message {
                    Ok(Message::Binary(data)) => match CrdtFrame::decode(&data) {
                        Ok(frame) => frame_event(frame),
                        Err(e) => {
                            log::debug!("Undecodable frame from server: {e}");
                            None
                        }
                    },
                    Ok(Message::Text(text)) if text.as_str() == PONG_TEXT => Some(SyncEvent::Pong),
                    Ok(Message::Text(text)) => match AppFrame::from_json(text.as_str()) {
                        Ok(frame) => Some(SyncEvent::App(frame)),
                        Err(e) => {
                            log::debug!("Unrecognized text frame from server: {e}");
                            None
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        let code = frame.map(|f| u16::from(f.code));
                        let _ = event_tx.send(SyncEvent::Closed { code }).await;
                        break;
                    }
                    Ok(_) => None,
                    Err(e) => {
                        log::debug!("WebSocket read failed: {e}");
                        break;
                    }
                };
                if let Some(event) = event {
                    let _ = event_tx.send(event).await;
                }
            }

            *state.write().await = ConnectionState::Closed;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Subscribe to a room with the version vector the caller holds.
    /// Offline joins are remembered and sent on connect.
    pub async fn join(&self, key: &RoomKey, version_vector: Vec<u8>) -> Result<(), ClientError> {
        self.joined
            .lock()
            .await
            .insert(key.clone(), version_vector.clone());
        if self.is_open().await {
            self.send_frame(CrdtFrame::join(key, version_vector)).await?;
        }
        Ok(())
    }

    /// Send a CRDT update, queueing it while disconnected.
    pub async fn send_update(&self, key: &RoomKey, update: Vec<u8>) -> Result<(), ClientError> {
        if !self.is_open().await {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(key.clone(), update) {
                return Err(ClientError::QueueFull);
            }
            return Ok(());
        }
        self.send_frame(CrdtFrame::update(key, update)).await
    }

    /// Answer a snapshot request.
    pub async fn send_snapshot(&self, key: &RoomKey, update: Vec<u8>) -> Result<(), ClientError> {
        self.send_frame(CrdtFrame::snapshot(key, update)).await
    }

    pub async fn leave(&self, key: &RoomKey) -> Result<(), ClientError> {
        self.joined.lock().await.remove(key);
        self.offline_queue.lock().await.discard(key);
        if self.is_open().await {
            self.send_frame(CrdtFrame::leave(key)).await?;
        }
        Ok(())
    }

    /// Post a chat message to the other members of the route.
    pub async fn send_chat(&self, message: serde_json::Value) -> Result<(), ClientError> {
        let text = AppFrame::NewMsg { message }.to_json()?;
        self.send(Message::text(text)).await
    }

    /// Text liveness ping; the reply arrives as [`SyncEvent::Pong`].
    pub async fn send_ping(&self) -> Result<(), ClientError> {
        self.send(Message::text(PING_TEXT.to_string())).await
    }

    /// Close the connection. Joined rooms and queued updates are kept for
    /// the next `connect`.
    pub async fn disconnect(&mut self) {
        *self.state.write().await = ConnectionState::Closing;
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        *self.state.write().await = ConnectionState::Closed;
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub fn route(&self) -> &ChatRoute {
        &self.route
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }

    pub async fn joined_rooms(&self) -> Vec<RoomKey> {
        self.joined.lock().await.keys().cloned().collect()
    }

    async fn is_open(&self) -> bool {
        *self.state.read().await == ConnectionState::Open
    }

    async fn send_frame(&self, frame: CrdtFrame) -> Result<(), ClientError> {
        self.send(Message::binary(frame.encode()?)).await
    }

    async fn send(&self, message: Message) -> Result<(), ClientError> {
        if !self.is_open().await {
            return Err(ClientError::NotConnected);
        }
        match &self.outgoing_tx {
            Some(tx) => tx.send(message).await.map_err(|_| ClientError::NotConnected),
            None => Err(ClientError::NotConnected),
        }
    }
}

fn frame_event(frame: CrdtFrame) -> Option<SyncEvent> {
    if frame.frame_type == FrameType::Error {
        let message = frame
            .error_message()
            .unwrap_or_else(|_| String::from_utf8_lossy(&frame.payload).into_owned());
        return Some(SyncEvent::ServerError {
            crdt: frame.crdt,
            room_id: frame.room_id,
            message,
        });
    }

    let key = match frame.room_key() {
        Ok(key) => key,
        Err(e) => {
            log::debug!("Frame for unknown room from server: {e}");
            return None;
        }
    };
    match frame.frame_type {
        FrameType::JoinOk => Some(SyncEvent::Joined {
            key,
            missing: frame.payload,
        }),
        FrameType::Update => Some(SyncEvent::RemoteUpdate {
            key,
            update: frame.payload,
        }),
        FrameType::SnapshotRequest => Some(SyncEvent::SnapshotRequested {
            key,
            version_vector: frame.payload,
        }),
        FrameType::Snapshot => Some(SyncEvent::Snapshot {
            key,
            update: frame.payload,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::{CrdtType, RoomId};

    fn route() -> ChatRoute {
        ChatRoute::new("o", "p", "c").unwrap()
    }

    fn key(project: &str) -> RoomKey {
        RoomKey::new(RoomId::project("o", project).unwrap(), CrdtType::Yrs)
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new("ws://localhost:9090", route());

        assert_eq!(client.connection_state().await, ConnectionState::Closed);
        assert_eq!(client.offline_queue_len().await, 0);
        assert_eq!(client.server_url(), "ws://localhost:9090");
        assert_eq!(client.route(), &route());
    }

    #[tokio::test]
    async fn test_send_update_offline_queues() {
        let client = SyncClient::new("ws://localhost:9090", route());

        client.send_update(&key("p"), vec![1, 2, 3]).await.unwrap();
        client.send_update(&key("p"), vec![4, 5, 6]).await.unwrap();
        assert_eq!(client.offline_queue_len().await, 2);

        client.leave(&key("p")).await.unwrap();
        assert_eq!(client.offline_queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_offline_join_is_remembered() {
        let client = SyncClient::new("ws://localhost:9090", route());
        client.join(&key("p"), Vec::new()).await.unwrap();
        assert_eq!(client.joined_rooms().await, vec![key("p")]);
    }

    #[tokio::test]
    async fn test_chat_and_ping_need_connection() {
        let client = SyncClient::new("ws://localhost:9090", route());
        let chat = client.send_chat(serde_json::json!({"text": "hi"})).await;
        assert!(matches!(chat, Err(ClientError::NotConnected)));
        assert!(matches!(client.send_ping().await, Err(ClientError::NotConnected)));
        assert!(matches!(
            client.send_snapshot(&key("p"), vec![0]).await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut client = SyncClient::new(format!("ws://{addr}"), route());
        assert!(matches!(client.connect().await, Err(ClientError::Connect(_))));
        assert_eq!(client.connection_state().await, ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new("ws://localhost:9090", route());
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(100);
        assert!(queue.is_empty());

        queue.enqueue(key("a"), vec![1, 2, 3]);
        queue.enqueue(key("b"), vec![4, 5, 6, 7]);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.total_bytes(), 7);

        let drained = queue.drain();
        assert_eq!(drained[0], (key("a"), vec![1, 2, 3]));
        assert_eq!(drained[1].0, key("b"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_capacity() {
        let mut queue = OfflineQueue::new(3);

        assert!(queue.enqueue(key("a"), vec![1]));
        assert!(queue.enqueue(key("a"), vec![2]));
        assert!(queue.enqueue(key("a"), vec![3]));
        assert!(!queue.enqueue(key("a"), vec![4]));
        assert_eq!(queue.len(), 3);

        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_error_frame_event() {
        let frame = CrdtFrame::error("yrs", "nonsense", "room not found");
        assert_eq!(
            frame_event(frame),
            Some(SyncEvent::ServerError {
                crdt: "yrs".into(),
                room_id: "nonsense".into(),
                message: "room not found".into(),
            })
        );

        let update = CrdtFrame::update(&key("p"), vec![9]);
        assert_eq!(
            frame_event(update),
            Some(SyncEvent::RemoteUpdate {
                key: key("p"),
                update: vec![9],
            })
        );
    }
}
