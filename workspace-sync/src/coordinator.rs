//! Session coordinator: one actor per chat route.
//!
//! The coordinator owns the chat's sessions: it authorizes and registers
//! sockets, relays application frames and announces arrivals and
//! departures. CRDT frames pass through it to the [`RoomHost`] of the
//! frame's room, which owns the document for every chat of the project.
//!
//! ```text
//!                    ┌──────────── RoomCoordinator ────────────┐
//! connection tasks ─►│ mailbox ─► handle(cmd)                  │
//!   Accept/Binary/   │              ├─ Membership (chat)       │   RoomHosts
//!   Text/Close       │              └─ CRDT frame ─────────────┼─► RoomHost
//!                    │ idle timer ─► hibernate: drop, exit     │
//!                    └─────────────────────────────────────────┘
//! ```
//!
//! Hibernation closes the mailbox, handles whatever was already queued and
//! exits. Sockets stay open in the [`SocketPool`]; the next coordinator for
//! the route rebuilds its membership from the attachments stored there.
//!
//! [`RoomHost`]: crate::host::RoomHost

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::auth::{AccessControl, Identity};
use crate::broadcast::{AtomicBroadcastStats, BroadcastStats, Fanout, Member, Membership};
use crate::cache::WorkspaceStore;
use crate::error::{SyncError, SyncResult};
use crate::host::{RoomCommand, RoomHosts};
use crate::protocol::{AppFrame, CrdtFrame, FrameType};
use crate::registry::Mailbox;
use crate::room::{ChatRoute, RoomKey};
use crate::session::{Outbound, SessionAttachment, SessionId, SocketPool, Transport};
use crate::storage::ChatLog;

/// Everything coordinators and room hosts share with the rest of the
/// process.
#[derive(Clone)]
pub struct CoordinatorContext {
    pub store: Arc<WorkspaceStore>,
    pub pool: Arc<SocketPool>,
    pub access: Arc<dyn AccessControl>,
    pub chat_log: Arc<dyn ChatLog>,
    pub flush_interval: Duration,
    pub hibernate_after: Duration,
    pub mailbox_capacity: usize,
}

/// Mailbox messages.
pub enum Command {
    /// Authorize and register a freshly upgraded socket.
    Accept {
        transport: Transport,
        identity: Identity,
        url: String,
        reply: oneshot::Sender<SyncResult<SessionId>>,
    },
    /// Binary frame (CRDT protocol).
    Binary { session_id: SessionId, bytes: Vec<u8> },
    /// Text frame (application protocol).
    Text { session_id: SessionId, text: String },
    Close { session_id: SessionId },
    /// Hibernate now instead of waiting for the idle timer.
    Hibernate { reply: oneshot::Sender<()> },
}

/// Cloneable address of a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    route: ChatRoute,
    tx: mpsc::Sender<Command>,
    stats: Arc<AtomicBroadcastStats>,
}

impl CoordinatorHandle {
    /// Enqueue a command. A hibernated or stopped coordinator hands the
    /// command back.
    pub async fn send(&self, command: Command) -> Result<(), Command> {
        self.tx.send(command).await.map_err(|e| e.0)
    }

    /// Whether the coordinator stopped accepting commands.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn route(&self) -> &ChatRoute {
        &self.route
    }

    pub fn stats(&self) -> BroadcastStats {
        self.stats.snapshot()
    }
}

impl Mailbox for CoordinatorHandle {
    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct RoomCoordinator {
    route: ChatRoute,
    ctx: CoordinatorContext,
    rooms: Arc<RoomHosts>,
    members: Membership,
    hibernate_waiters: Vec<oneshot::Sender<()>>,
}

impl RoomCoordinator {
    pub fn new(route: ChatRoute, ctx: CoordinatorContext, rooms: Arc<RoomHosts>) -> Self {
        Self::with_stats(route, ctx, rooms, Arc::new(AtomicBroadcastStats::default()))
    }

    fn with_stats(
        route: ChatRoute,
        ctx: CoordinatorContext,
        rooms: Arc<RoomHosts>,
        stats: Arc<AtomicBroadcastStats>,
    ) -> Self {
        Self {
            route,
            ctx,
            rooms,
            members: Membership::with_stats(stats),
            hibernate_waiters: Vec::new(),
        }
    }

    /// Start a coordinator task. It restores any sockets the pool holds for
    /// the route before reading its mailbox.
    pub fn spawn(
        route: ChatRoute,
        ctx: CoordinatorContext,
        rooms: Arc<RoomHosts>,
    ) -> (CoordinatorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(ctx.mailbox_capacity.max(1));
        let stats = Arc::new(AtomicBroadcastStats::default());
        let handle = CoordinatorHandle {
            route: route.clone(),
            tx,
            stats: stats.clone(),
        };
        let mut coordinator = Self::with_stats(route, ctx, rooms, stats);
        let task = tokio::spawn(async move {
            coordinator.restore().await;
            coordinator.run(rx).await;
        });
        (handle, task)
    }

    pub fn route(&self) -> &ChatRoute {
        &self.route
    }

    pub fn members(&self) -> &Membership {
        &self.members
    }

    /// Rebuild membership from the sockets left open by a previous
    /// coordinator. No re-authentication happens.
    pub async fn restore(&mut self) -> usize {
        let mut restored = 0;
        for (attachment, transport) in self.ctx.pool.open_sockets(&self.route).await {
            if transport.is_closed() {
                self.ctx.pool.remove(&attachment.session_id).await;
                continue;
            }
            self.members.insert(Member::new(attachment, transport));
            restored += 1;
        }
        if restored > 0 {
            log::info!("Restored {restored} sessions for {}", self.route);
        }
        restored
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        let hibernate_after = self.ctx.hibernate_after;
        let idle = tokio::time::sleep(hibernate_after);
        tokio::pin!(idle);

        log::debug!("Coordinator for {} started", self.route);
        loop {
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else { break };
                    self.handle(command).await;
                    if !self.hibernate_waiters.is_empty() {
                        self.hibernate(&mut rx).await;
                        return;
                    }
                    idle.as_mut().reset(Instant::now() + hibernate_after);
                }
                () = &mut idle => {
                    self.hibernate(&mut rx).await;
                    return;
                }
            }
        }
        log::debug!("Coordinator for {} stopped", self.route);
    }

    async fn hibernate(&mut self, rx: &mut mpsc::Receiver<Command>) {
        rx.close();
        while let Some(command) = rx.recv().await {
            self.handle(command).await;
        }
        log::info!(
            "Coordinator for {} hibernated ({} open sessions)",
            self.route,
            self.members.len()
        );
        self.members.clear();
        for waiter in self.hibernate_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Accept {
                transport,
                identity,
                url,
                reply,
            } => {
                let result = self.accept(transport, &identity, url).await;
                let _ = reply.send(result);
            }
            Command::Binary { session_id, bytes } => self.on_binary(session_id, &bytes).await,
            Command::Text { session_id, text } => self.on_text(session_id, &text).await,
            Command::Close { session_id } => {
                self.on_close(&session_id).await;
            }
            Command::Hibernate { reply } => self.hibernate_waiters.push(reply),
        }
    }

    // ─── Session lifecycle ────────────────────────────────────────────

    /// Authorize an identity for this chat and register its socket.
    /// Nothing is registered on failure.
    pub async fn accept(
        &mut self,
        transport: Transport,
        identity: &Identity,
        url: String,
    ) -> SyncResult<SessionId> {
        let grant = self.ctx.access.authorize_chat(identity, &self.route).await?;

        let session_id = Uuid::new_v4();
        let attachment = SessionAttachment::new(session_id, identity, &self.route, url, grant.chat_title);
        self.ctx
            .pool
            .register(&attachment, transport.clone())
            .await
            .map_err(|e| SyncError::Io(format!("cannot attach session: {e}")))?;
        self.members.insert(Member::new(attachment, transport));

        log::info!(
            "Session {session_id} ({}) joined {} [{} members]",
            identity.user_id,
            self.route,
            self.members.len()
        );
        self.announce(AppFrame::MemberJoined {
            session_id,
            user_id: identity.user_id.clone(),
        });
        Ok(session_id)
    }

    /// Remove a session after its socket closed. Closing an unknown or
    /// already-closed session is a no-op. Returns whether anything changed.
    pub async fn on_close(&mut self, session_id: &SessionId) -> bool {
        self.ctx.pool.remove(session_id).await;
        let Some(member) = self.members.remove(session_id) else {
            return false;
        };

        log::info!(
            "Session {session_id} ({}) left {} [{} members]",
            member.attachment.user_id,
            self.route,
            self.members.len()
        );
        self.announce(AppFrame::MemberLeft {
            session_id: *session_id,
            user_id: member.attachment.user_id.clone(),
        });

        // A hibernated host already flushed and holds nobody.
        for key in &member.joined {
            let detach = RoomCommand::Detach {
                session_id: *session_id,
            };
            self.rooms.notify(key, detach).await;
        }
        true
    }

    // ─── Fan-out ──────────────────────────────────────────────────────

    /// Best-effort fan-out to every session of the chat.
    pub fn broadcast(&self, message: Outbound, fanout: Fanout) -> usize {
        self.members.broadcast_all(message, fanout)
    }

    fn announce(&self, frame: AppFrame) {
        match frame.to_json() {
            Ok(json) => {
                self.broadcast(Outbound::Text(json.into()), Fanout::Everyone);
            }
            Err(e) => log::error!("Cannot encode announcement: {e}"),
        }
    }

    fn send_frame(&self, session_id: &SessionId, frame: CrdtFrame) {
        match frame.encode() {
            Ok(bytes) => {
                self.members
                    .send_to(session_id, Outbound::Binary(Arc::new(bytes)));
            }
            Err(e) => log::error!("Cannot encode {:?} frame: {e}", frame.frame_type),
        }
    }

    fn send_app(&self, session_id: &SessionId, frame: AppFrame) {
        match frame.to_json() {
            Ok(json) => {
                self.members.send_to(session_id, Outbound::Text(json.into()));
            }
            Err(e) => log::error!("Cannot encode application frame: {e}"),
        }
    }

    // ─── CRDT frames ──────────────────────────────────────────────────

    async fn on_binary(&mut self, session_id: SessionId, bytes: &[u8]) {
        if !self.members.contains(&session_id) {
            log::warn!("Dropping frame from unregistered session {session_id}");
            return;
        }
        let frame = match CrdtFrame::decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                self.send_frame(&session_id, CrdtFrame::error("", "", e.to_string()));
                return;
            }
        };
        log::debug!(
            "{:?} for {}:{} from {session_id} ({} bytes)",
            frame.frame_type,
            frame.crdt,
            frame.room_id,
            frame.payload.len()
        );

        let frame_type = frame.frame_type;
        let (crdt, room_id) = (frame.crdt.clone(), frame.room_id.clone());
        if let Err(e) = self.on_frame(session_id, frame).await {
            log::warn!("Rejected {frame_type:?} from {session_id}: {e}");
            self.send_frame(&session_id, CrdtFrame::error(&crdt, &room_id, e.to_string()));
        }
    }

    /// Check the frame against the session's project and hand it to the
    /// room's host. Returns once the host has applied it.
    async fn on_frame(&mut self, session_id: SessionId, frame: CrdtFrame) -> SyncResult<()> {
        let key = frame.room_key()?;
        let member = self
            .members
            .get(&session_id)
            .ok_or_else(|| SyncError::NotFound(format!("session {session_id}")))?;
        let attachment = &member.attachment;
        if !key
            .room_id
            .belongs_to(&attachment.organization_id, &attachment.project_id)
        {
            return Err(SyncError::Forbidden(format!(
                "room {} is outside {}/{}",
                key.room_id, attachment.organization_id, attachment.project_id
            )));
        }

        let frame_type = frame.frame_type;
        let (reply, rx) = oneshot::channel();
        let command = RoomCommand::Frame {
            attachment: member.attachment.clone(),
            transport: member.transport.clone(),
            joined: member.joined.contains(&key),
            frame,
            reply,
        };
        self.rooms.dispatch(&key, command).await?;
        rx.await
            .map_err(|_| SyncError::Unavailable(format!("room host for {key} dropped a frame")))??;

        match frame_type {
            FrameType::Join => self.set_joined(session_id, &key, true).await,
            FrameType::Leave => self.set_joined(session_id, &key, false).await,
            _ => {}
        }
        Ok(())
    }

    /// Update a member's subscriptions and re-serialize its attachment.
    async fn set_joined(&mut self, session_id: SessionId, key: &RoomKey, joined: bool) {
        let Some(member) = self.members.get_mut(&session_id) else {
            return;
        };
        let changed = if joined {
            member.joined.insert(key.clone())
        } else {
            member.joined.remove(key)
        };
        if !changed {
            return;
        }
        member.record_rooms();
        if let Err(e) = self.ctx.pool.update_attachment(&member.attachment).await {
            log::error!("Cannot re-attach rooms for session {session_id}: {e}");
        }
    }

    // ─── Application frames ───────────────────────────────────────────

    async fn on_text(&mut self, session_id: SessionId, text: &str) {
        if !self.members.contains(&session_id) {
            log::warn!("Dropping text from unregistered session {session_id}");
            return;
        }
        match AppFrame::from_json(text) {
            Ok(AppFrame::NewMsg { message }) => {
                if let Err(e) = self.ctx.chat_log.append_message(&self.route, &message).await {
                    log::error!("Cannot persist message on {}: {e}", self.route);
                    self.send_app(&session_id, AppFrame::error(e.to_string()));
                    return;
                }
                let relay = AppFrame::NewMsg { message };
                match relay.to_json() {
                    Ok(json) => {
                        self.members
                            .broadcast_all(Outbound::Text(json.into()), Fanout::ExceptSender(session_id));
                    }
                    Err(e) => log::error!("Cannot encode relay: {e}"),
                }
            }
            Ok(_) => self.send_app(
                &session_id,
                AppFrame::error("only new-msg frames are accepted from clients"),
            ),
            Err(e) => self.send_app(&session_id, AppFrame::error(e.to_string())),
        }
    }
}
