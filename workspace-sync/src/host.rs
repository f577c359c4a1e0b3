//! Room host: the single live owner of one workspace room.
//!
//! Sessions from any chat of a project may join that project's workspace.
//! Their chat coordinators forward every CRDT frame to the room's host. The
//! host applies updates in mailbox order and fans them out to every joined
//! session, whichever chat route the session came through.
//!
//! ```text
//! coordinator (chat 1) ──┐ RoomCommand::Frame  ┌──────── RoomHost ─────────┐
//! coordinator (chat 2) ──┼───────────────────► │ RoomDocumentCache ─► store│
//! pull-sync flush ───────┘                     │ Membership (joined only)  │
//!                                              │ flush tick, idle timer    │
//!                                              └───────────────────────────┘
//! ```
//!
//! A host exits after its last session leaves or after sitting idle, and
//! flushes on the way out. The next frame for the room spawns a new host,
//! which rebuilds its joined sessions from the attachments in the
//! [`SocketPool`](crate::session::SocketPool).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::broadcast::{AtomicBroadcastStats, BroadcastStats, Fanout, Member, Membership};
use crate::cache::RoomDocumentCache;
use crate::coordinator::CoordinatorContext;
use crate::crdt::VersionVector;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{CrdtFrame, FrameType};
use crate::registry::{Mailbox, Slots, MAX_DISPATCH_ATTEMPTS};
use crate::room::RoomKey;
use crate::session::{Outbound, SessionAttachment, SessionId, Transport};

const HIBERNATE_FLUSH_ATTEMPTS: u32 = 3;

pub enum RoomCommand {
    /// A CRDT frame from a session. `joined` is the forwarding
    /// coordinator's record of the session's subscription.
    Frame {
        attachment: SessionAttachment,
        transport: Transport,
        joined: bool,
        frame: CrdtFrame,
        reply: oneshot::Sender<SyncResult<()>>,
    },
    /// The session's socket closed.
    Detach { session_id: SessionId },
    /// Persist the document if dirty. Replies whether it wrote.
    Flush { reply: oneshot::Sender<SyncResult<bool>> },
    Hibernate { reply: oneshot::Sender<()> },
}

#[derive(Clone)]
pub struct RoomHostHandle {
    key: RoomKey,
    tx: mpsc::Sender<RoomCommand>,
    stats: Arc<AtomicBroadcastStats>,
}

impl RoomHostHandle {
    /// Enqueue a command. A hibernated host hands it back.
    pub async fn send(&self, command: RoomCommand) -> Result<(), RoomCommand> {
        self.tx.send(command).await.map_err(|e| e.0)
    }

    pub fn key(&self) -> &RoomKey {
        &self.key
    }

    pub fn stats(&self) -> BroadcastStats {
        self.stats.snapshot()
    }
}

impl Mailbox for RoomHostHandle {
    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct RoomHost {
    key: RoomKey,
    ctx: CoordinatorContext,
    cache: RoomDocumentCache,
    members: Membership,
    hibernate_waiters: Vec<oneshot::Sender<()>>,
    vacated: bool,
}

impl RoomHost {
    pub fn new(key: RoomKey, ctx: CoordinatorContext) -> Self {
        Self::with_stats(key, ctx, Arc::new(AtomicBroadcastStats::default()))
    }

    fn with_stats(key: RoomKey, ctx: CoordinatorContext, stats: Arc<AtomicBroadcastStats>) -> Self {
        let cache = RoomDocumentCache::new(ctx.store.clone());
        Self {
            key,
            ctx,
            cache,
            members: Membership::with_stats(stats),
            hibernate_waiters: Vec::new(),
            vacated: false,
        }
    }

    pub fn spawn(key: RoomKey, ctx: CoordinatorContext) -> (RoomHostHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(ctx.mailbox_capacity.max(1));
        let stats = Arc::new(AtomicBroadcastStats::default());
        let handle = RoomHostHandle {
            key: key.clone(),
            tx,
            stats: stats.clone(),
        };
        let mut host = Self::with_stats(key, ctx, stats);
        let task = tokio::spawn(async move {
            host.restore().await;
            host.run(rx).await;
        });
        (handle, task)
    }

    pub fn key(&self) -> &RoomKey {
        &self.key
    }

    pub fn members(&self) -> &Membership {
        &self.members
    }

    pub fn cache(&self) -> &RoomDocumentCache {
        &self.cache
    }

    /// Re-adopt the open sockets whose attachments list this room.
    pub async fn restore(&mut self) -> usize {
        let mut restored = 0;
        for (attachment, transport) in self.ctx.pool.open_sockets_in_room(&self.key).await {
            if transport.is_closed() {
                continue;
            }
            self.admit(attachment, transport);
            restored += 1;
        }
        if restored > 0 {
            log::info!("Restored {restored} joined sessions for {}", self.key);
        }
        restored
    }

    fn admit(&mut self, attachment: SessionAttachment, transport: Transport) {
        let mut member = Member::new(attachment, transport);
        member.joined = HashSet::from([self.key.clone()]);
        self.members.insert(member);
    }

    async fn run(mut self, mut rx: mpsc::Receiver<RoomCommand>) {
        let flush_every = self.ctx.flush_interval;
        let hibernate_after = self.ctx.hibernate_after;
        let mut flush_tick = tokio::time::interval_at(Instant::now() + flush_every, flush_every);
        flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let idle = tokio::time::sleep(hibernate_after);
        tokio::pin!(idle);

        log::debug!("Room host for {} started", self.key);
        loop {
            tokio::select! {
                command = rx.recv() => {
                    let Some(command) = command else { break };
                    self.handle(command).await;
                    if self.vacated || !self.hibernate_waiters.is_empty() {
                        self.hibernate(&mut rx).await;
                        return;
                    }
                    idle.as_mut().reset(Instant::now() + hibernate_after);
                }
                _ = flush_tick.tick() => {
                    if self.cache.dirty_count() > 0 {
                        if let Err(e) = self.cache.flush_all().await {
                            log::warn!("Periodic flush for {} failed: {e}", self.key);
                        }
                    }
                }
                () = &mut idle => {
                    // Flush while the mailbox is still open so a failure can
                    // postpone hibernation.
                    match self.cache.flush_all().await {
                        Ok(_) => {
                            self.hibernate(&mut rx).await;
                            return;
                        }
                        Err(e) => {
                            log::warn!("Postponing hibernation of {}: {e}", self.key);
                            idle.as_mut().reset(Instant::now() + hibernate_after);
                        }
                    }
                }
            }
        }

        if let Err(e) = self.cache.drain().await {
            log::error!("Final flush for {} failed: {e}", self.key);
        }
        log::debug!("Room host for {} stopped", self.key);
    }

    async fn hibernate(&mut self, rx: &mut mpsc::Receiver<RoomCommand>) {
        rx.close();
        while let Some(command) = rx.recv().await {
            self.handle(command).await;
        }

        let mut attempt = 1;
        loop {
            match self.cache.drain().await {
                Ok(()) => break,
                Err(e) if attempt < HIBERNATE_FLUSH_ATTEMPTS => {
                    log::warn!(
                        "Hibernation flush for {} failed (attempt {attempt}): {e}",
                        self.key
                    );
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
                }
                Err(e) => {
                    log::error!("Hibernating {} with unsaved changes: {e}", self.key);
                    break;
                }
            }
        }

        log::info!(
            "Room host for {} hibernated ({} joined sessions)",
            self.key,
            self.members.len()
        );
        self.members.clear();
        for waiter in self.hibernate_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    async fn handle(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Frame {
                attachment,
                transport,
                joined,
                frame,
                reply,
            } => {
                let result = self.on_frame(attachment, transport, joined, &frame).await;
                let _ = reply.send(result);
            }
            RoomCommand::Detach { session_id } => self.depart(&session_id, "disconnected from").await,
            RoomCommand::Flush { reply } => {
                let _ = reply.send(self.cache.flush(&self.key).await);
            }
            RoomCommand::Hibernate { reply } => self.hibernate_waiters.push(reply),
        }
    }

    /// Apply one CRDT frame from `attachment`'s session.
    pub async fn on_frame(
        &mut self,
        attachment: SessionAttachment,
        transport: Transport,
        joined: bool,
        frame: &CrdtFrame,
    ) -> SyncResult<()> {
        let key = frame.room_key()?;
        if key != self.key {
            return Err(SyncError::BadRequest(format!(
                "frame for {key} reached the host of {}",
                self.key
            )));
        }
        let session_id = attachment.session_id;
        if joined && !self.members.contains(&session_id) {
            log::debug!("Re-adopting session {session_id} in {}", self.key);
            self.admit(attachment.clone(), transport.clone());
        }
        let is_member = self.members.contains(&session_id);

        match frame.frame_type {
            FrameType::Join => self.join(attachment, transport, &frame.payload).await,
            FrameType::Update | FrameType::Snapshot if is_member => {
                self.apply_update(session_id, &frame.payload).await
            }
            FrameType::SnapshotRequest if is_member => {
                let since = VersionVector::decode(&frame.payload)?;
                let document = self.cache.get_or_create(&self.key).await?;
                let missing = document.missing_since(&since)?;
                self.send_frame(&session_id, CrdtFrame::snapshot(&self.key, missing));
                Ok(())
            }
            FrameType::Leave => {
                self.depart(&session_id, "left").await;
                Ok(())
            }
            FrameType::Update | FrameType::Snapshot | FrameType::SnapshotRequest => Err(
                SyncError::BadRequest(format!("join {key} before sending {:?}", frame.frame_type)),
            ),
            FrameType::JoinOk | FrameType::Error => Err(SyncError::BadRequest(format!(
                "{:?} frames are server-to-client only",
                frame.frame_type
            ))),
        }
    }

    async fn join(&mut self, attachment: SessionAttachment, transport: Transport, payload: &[u8]) -> SyncResult<()> {
        let client_vv = VersionVector::decode(payload)?;
        let session_id = attachment.session_id;
        let document = self.cache.get_or_create(&self.key).await?;
        let missing = document.missing_since(&client_vv)?;
        let server_vv = document.frontiers().encode();
        let backfill = document.descriptor.allow_backfill_when_no_other_clients
            && self.members.joined_count(&self.key, Some(&session_id)) == 0;

        self.admit(attachment, transport);
        self.send_frame(&session_id, CrdtFrame::join_ok(&self.key, missing));
        if backfill {
            self.send_frame(&session_id, CrdtFrame::snapshot_request(&self.key, server_vv));
        }
        log::debug!(
            "Session {session_id} joined room {} (backfill: {backfill}) [{} joined]",
            self.key,
            self.members.len()
        );
        Ok(())
    }

    async fn apply_update(&mut self, session_id: SessionId, update: &[u8]) -> SyncResult<()> {
        let document = self.cache.get_or_create(&self.key).await?;
        document.apply_update(update)?;

        let encoded = CrdtFrame::update(&self.key, update.to_vec())
            .encode()
            .map_err(|e| SyncError::Crdt(e.to_string()))?;
        self.broadcast(Arc::new(encoded), Fanout::ExceptSender(session_id));
        Ok(())
    }

    /// Drop a session, flush, and vacate the room once nobody is left.
    async fn depart(&mut self, session_id: &SessionId, how: &str) {
        if self.members.remove(session_id).is_none() {
            return;
        }
        log::debug!(
            "Session {session_id} {how} {} [{} joined]",
            self.key,
            self.members.len()
        );
        if let Err(e) = self.cache.flush_all().await {
            log::error!("Flush of {} after a departure failed: {e}", self.key);
        }
        if self.members.is_empty() {
            self.vacated = true;
        }
    }

    /// Best-effort fan-out of an encoded frame to the room's sessions.
    pub fn broadcast(&self, payload: Arc<Vec<u8>>, fanout: Fanout) -> usize {
        self.members
            .broadcast_room(&self.key, Outbound::Binary(payload), fanout)
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
}

/// Live room hosts of the process, at most one per room key.
pub struct RoomHosts {
    ctx: CoordinatorContext,
    hosts: Slots<RoomKey, RoomHostHandle>,
}

impl RoomHosts {
    pub fn new(ctx: CoordinatorContext) -> Self {
        Self {
            ctx,
            hosts: Slots::new(),
        }
    }

    /// Running host for `key`, spawning one if needed.
    pub async fn handle(&self, key: &RoomKey) -> RoomHostHandle {
        self.hosts
            .get_or_spawn(key, || RoomHost::spawn(key.clone(), self.ctx.clone()))
            .await
    }

    /// Deliver a command, waking the room's host if it hibernated.
    pub async fn dispatch(&self, key: &RoomKey, command: RoomCommand) -> SyncResult<()> {
        let mut command = command;
        for _ in 0..MAX_DISPATCH_ATTEMPTS {
            match self.handle(key).await.send(command).await {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    log::debug!("Room host for {key} closed its mailbox, respawning");
                    command = returned;
                }
            }
        }
        Err(SyncError::Unavailable(format!("no room host for {key}")))
    }

    /// Deliver to the room's live host only. Returns whether one took it.
    pub async fn notify(&self, key: &RoomKey, command: RoomCommand) -> bool {
        match self.hosts.live(key).await {
            Some(host) => host.send(command).await.is_ok(),
            None => false,
        }
    }

    /// Flush the room's live host. Once this returns, no earlier change to
    /// the room is waiting in memory.
    pub async fn flush(&self, key: &RoomKey) -> SyncResult<bool> {
        for _ in 0..MAX_DISPATCH_ATTEMPTS {
            let Some(host) = self.hosts.live(key).await else {
                return Ok(false);
            };
            let (reply, rx) = oneshot::channel();
            if host.send(RoomCommand::Flush { reply }).await.is_ok() {
                return rx.await.unwrap_or(Ok(false));
            }
        }
        Ok(false)
    }

    pub async fn hibernate_all(&self) {
        for slot in self.hosts.take_all().await {
            let (reply, rx) = oneshot::channel();
            if slot.handle.send(RoomCommand::Hibernate { reply }).await.is_ok() {
                let _ = rx.await;
            }
            if let Err(e) = slot.task.await {
                log::error!("Room host for {} ended abnormally: {e}", slot.handle.key());
            }
        }
    }

    pub async fn live_count(&self) -> usize {
        self.hosts.live_count().await
    }
}
