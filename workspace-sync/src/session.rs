//! Session identity, transports and the process-wide socket pool.
//!
//! Coordinators and room hosts may hibernate while their sockets stay
//! open. Everything they need to rebuild membership afterwards lives here:
//! the transport of each socket and the bincode-encoded
//! [`SessionAttachment`] stored next to it.
//!
//! ```text
//! connection task ──► Transport (bounded queue) ──► writer task ──► WebSocket
//!                          ▲
//!        SocketPool ───────┤ (route, attachment bytes, state)
//!        Membership ───────┘
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::auth::Identity;
use crate::protocol::ProtocolError;
use crate::room::{ChatRoute, RoomKey};

pub type SessionId = Uuid;

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Upgraded, not yet authorized
    Connecting,
    /// Authorized and registered
    Open,
    /// Close observed, membership removal pending
    Closing,
    Closed,
}

/// Identity written onto a transport when it opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAttachment {
    pub session_id: SessionId,
    pub user_id: String,
    pub organization_id: String,
    pub project_id: String,
    pub chat_id: String,
    /// Request URL the socket was opened with
    pub url: String,
    pub chat_title: Option<String>,
    /// Joined CRDT rooms in `crdt:org/project[/campaign]` form
    pub joined_rooms: Vec<String>,
}

impl SessionAttachment {
    pub fn new(
        session_id: SessionId,
        identity: &Identity,
        route: &ChatRoute,
        url: impl Into<String>,
        chat_title: Option<String>,
    ) -> Self {
        Self {
            session_id,
            user_id: identity.user_id.clone(),
            organization_id: route.organization_id.clone(),
            project_id: route.project_id.clone(),
            chat_id: route.chat_id.clone(),
            url: url.into(),
            chat_title,
            joined_rooms: Vec::new(),
        }
    }

    pub fn route(&self) -> ChatRoute {
        ChatRoute {
            organization_id: self.organization_id.clone(),
            project_id: self.project_id.clone(),
            chat_id: self.chat_id.clone(),
        }
    }

    /// Record the joined rooms, replacing the previous list.
    pub fn set_joined<'a>(&mut self, rooms: impl IntoIterator<Item = &'a RoomKey>) {
        let mut joined: Vec<String> = rooms.into_iter().map(|key| key.to_string()).collect();
        joined.sort();
        self.joined_rooms = joined;
    }

    /// Joined rooms parsed back into keys. Entries that no longer parse
    /// are skipped.
    pub fn joined_keys(&self) -> Vec<RoomKey> {
        self.joined_rooms
            .iter()
            .filter_map(|entry| {
                let (crdt, room) = entry.split_once(':')?;
                match RoomKey::parse(crdt, room) {
                    Ok(key) => Some(key),
                    Err(e) => {
                        log::warn!("Dropping stale room subscription {entry}: {e}");
                        None
                    }
                }
            })
            .collect()
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (attachment, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(attachment)
    }
}

/// Message queued for a socket's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Binary(Arc<Vec<u8>>),
    Text(Arc<str>),
    Pong(Vec<u8>),
}

/// Why an outbound message was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// Queue at capacity (slow consumer)
    Full,
    /// Writer task gone
    Closed,
}

/// Sending side of a socket's bounded outbound queue.
#[derive(Debug, Clone)]
pub struct Transport {
    tx: mpsc::Sender<Outbound>,
}

impl Transport {
    /// A transport and the receiver its writer task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue without waiting. A slow socket never blocks its caller.
    pub fn try_send(&self, message: Outbound) -> Result<(), DeliveryFailure> {
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryFailure::Full,
            TrySendError::Closed(_) => DeliveryFailure::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct PooledSocket {
    route: ChatRoute,
    transport: Transport,
    attachment: Vec<u8>,
    state: ConnectionState,
}

/// Live sockets of the whole process, independent of coordinator lifetimes.
#[derive(Default)]
pub struct SocketPool {
    sockets: RwLock<HashMap<SessionId, PooledSocket>>,
}

impl SocketPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track an opened socket with its serialized attachment.
    pub async fn register(
        &self,
        attachment: &SessionAttachment,
        transport: Transport,
    ) -> Result<(), ProtocolError> {
        let bytes = attachment.encode()?;
        self.sockets.write().await.insert(
            attachment.session_id,
            PooledSocket {
                route: attachment.route(),
                transport,
                attachment: bytes,
                state: ConnectionState::Open,
            },
        );
        Ok(())
    }

    /// Re-serialize the attachment of a tracked socket.
    pub async fn update_attachment(&self, attachment: &SessionAttachment) -> Result<(), ProtocolError> {
        let bytes = attachment.encode()?;
        if let Some(socket) = self.sockets.write().await.get_mut(&attachment.session_id) {
            socket.attachment = bytes;
        }
        Ok(())
    }

    /// Mark a socket as closing so a restoring coordinator skips it.
    pub async fn mark_closing(&self, session_id: &SessionId) {
        if let Some(socket) = self.sockets.write().await.get_mut(session_id) {
            socket.state = ConnectionState::Closing;
        }
    }

    /// Forget a socket. Returns whether it was tracked.
    pub async fn remove(&self, session_id: &SessionId) -> bool {
        self.sockets.write().await.remove(session_id).is_some()
    }

    pub async fn state(&self, session_id: &SessionId) -> ConnectionState {
        self.sockets
            .read()
            .await
            .get(session_id)
            .map_or(ConnectionState::Closed, |socket| socket.state)
    }

    /// Open sockets of a route with their decoded attachments.
    pub async fn open_sockets(&self, route: &ChatRoute) -> Vec<(SessionAttachment, Transport)> {
        self.open_matching(|socket_route, _| socket_route == route)
            .await
    }

    /// Open sockets whose attachment records `key` as joined, across every
    /// chat route.
    pub async fn open_sockets_in_room(&self, key: &RoomKey) -> Vec<(SessionAttachment, Transport)> {
        self.open_matching(|_, attachment| attachment.joined_keys().contains(key))
            .await
    }

    async fn open_matching(
        &self,
        keep: impl Fn(&ChatRoute, &SessionAttachment) -> bool,
    ) -> Vec<(SessionAttachment, Transport)> {
        let sockets = self.sockets.read().await;
        sockets
            .iter()
            .filter(|(_, socket)| socket.state == ConnectionState::Open)
            .filter_map(|(id, socket)| match SessionAttachment::decode(&socket.attachment) {
                Ok(attachment) => keep(&socket.route, &attachment)
                    .then(|| (attachment, socket.transport.clone())),
                Err(e) => {
                    log::error!("Unreadable attachment on session {id}: {e}");
                    None
                }
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.sockets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sockets.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::CrdtType;

    fn attachment(route: &ChatRoute) -> SessionAttachment {
        let identity = Identity::new("u1", ["org"]);
        SessionAttachment::new(Uuid::new_v4(), &identity, route, route.path(), Some("Plan".into()))
    }

    #[test]
    fn test_attachment_roundtrip_with_rooms() {
        let route = ChatRoute::new("org", "proj", "chat").unwrap();
        let mut attachment = attachment(&route);
        let key = RoomKey::new("org/proj/c1".parse().unwrap(), CrdtType::Yrs);
        attachment.set_joined([&key]);

        let decoded = SessionAttachment::decode(&attachment.encode().unwrap()).unwrap();
        assert_eq!(decoded, attachment);
        assert_eq!(decoded.route(), route);
        assert_eq!(decoded.joined_keys(), vec![key]);
    }

    #[test]
    fn test_stale_room_entries_are_skipped() {
        let route = ChatRoute::new("org", "proj", "chat").unwrap();
        let mut attachment = attachment(&route);
        attachment.joined_rooms = vec!["loro:org/proj".into(), "garbage".into(), "yrs:org/proj".into()];
        assert_eq!(attachment.joined_keys().len(), 1);
    }

    #[test]
    fn test_transport_reports_full_and_closed() {
        let (transport, mut rx) = Transport::channel(1);
        assert!(transport.try_send(Outbound::Text("a".into())).is_ok());
        assert_eq!(
            transport.try_send(Outbound::Text("b".into())),
            Err(DeliveryFailure::Full)
        );
        assert_eq!(rx.try_recv().unwrap(), Outbound::Text("a".into()));

        drop(rx);
        assert!(transport.is_closed());
        assert_eq!(
            transport.try_send(Outbound::Text("c".into())),
            Err(DeliveryFailure::Closed)
        );
    }

    #[tokio::test]
    async fn test_pool_lists_open_sockets_per_route() {
        let pool = SocketPool::new();
        let route = ChatRoute::new("org", "proj", "chat").unwrap();
        let other = ChatRoute::new("org", "proj", "other").unwrap();

        let a = attachment(&route);
        let b = attachment(&route);
        let c = attachment(&other);
        for att in [&a, &b, &c] {
            let (transport, _rx) = Transport::channel(4);
            pool.register(att, transport).await.unwrap();
        }

        assert_eq!(pool.open_sockets(&route).await.len(), 2);
        pool.mark_closing(&b.session_id).await;
        let open = pool.open_sockets(&route).await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].0.session_id, a.session_id);

        assert!(pool.remove(&a.session_id).await);
        assert!(!pool.remove(&a.session_id).await);
        assert_eq!(pool.state(&a.session_id).await, ConnectionState::Closed);
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test]
    async fn test_update_attachment_persists_rooms() {
        let pool = SocketPool::new();
        let route = ChatRoute::new("org", "proj", "chat").unwrap();
        let mut att = attachment(&route);
        let (transport, _rx) = Transport::channel(4);
        pool.register(&att, transport).await.unwrap();

        let key = RoomKey::new("org/proj".parse().unwrap(), CrdtType::Yrs);
        att.set_joined([&key]);
        pool.update_attachment(&att).await.unwrap();

        let open = pool.open_sockets(&route).await;
        assert_eq!(open[0].0.joined_keys(), vec![key]);
    }

    #[tokio::test]
    async fn test_room_sockets_span_chat_routes() {
        let pool = SocketPool::new();
        let key = RoomKey::new("org/proj".parse().unwrap(), CrdtType::Yrs);
        let one = ChatRoute::new("org", "proj", "one").unwrap();
        let two = ChatRoute::new("org", "proj", "two").unwrap();

        let mut a = attachment(&one);
        a.set_joined([&key]);
        let mut b = attachment(&two);
        b.set_joined([&key]);
        let c = attachment(&two);
        for att in [&a, &b, &c] {
            let (transport, _rx) = Transport::channel(4);
            pool.register(att, transport).await.unwrap();
        }

        let mut found: Vec<SessionId> = pool
            .open_sockets_in_room(&key)
            .await
            .into_iter()
            .map(|(attachment, _)| attachment.session_id)
            .collect();
        found.sort();
        let mut expected = vec![a.session_id, b.session_id];
        expected.sort();
        assert_eq!(found, expected);

        pool.mark_closing(&b.session_id).await;
        assert_eq!(pool.open_sockets_in_room(&key).await.len(), 1);
    }
}
