//! Actor routing: chat routes to session coordinators, room keys to room
//! hosts.
//!
//! Both kinds of actor live in a [`Slots`] table. The first command for a
//! key spawns its actor and a hibernated actor is replaced on the next
//! command. The replacement starts only after the previous task finished its
//! final flush, so two actors never serve the same key at once. Each key has
//! its own lock: waiting out a slow hibernation stalls callers of that key
//! and nobody else.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::auth::Identity;
use crate::coordinator::{Command, CoordinatorContext, CoordinatorHandle, RoomCoordinator};
use crate::error::{SyncError, SyncResult};
use crate::host::RoomHosts;
use crate::room::{ChatRoute, RoomKey};
use crate::session::{SessionId, Transport};

/// A command is retried this many times against fresh actors.
pub(crate) const MAX_DISPATCH_ATTEMPTS: usize = 3;

/// Address of an actor whose mailbox closes when it hibernates.
pub trait Mailbox: Clone {
    fn is_closed(&self) -> bool;
}

pub(crate) struct Slot<H> {
    pub handle: H,
    pub task: JoinHandle<()>,
}

type Cell<H> = Arc<Mutex<Option<Slot<H>>>>;

/// Live actors keyed by `K`, locked per key.
pub(crate) struct Slots<K, H> {
    cells: Mutex<HashMap<K, Cell<H>>>,
}

impl<K, H> Slots<K, H>
where
    K: Eq + Hash + Clone + Display,
    H: Mailbox,
{
    pub fn new() -> Self {
        Self {
            cells: Mutex::new(HashMap::new()),
        }
    }

    /// The table lock is held only long enough to find the key's cell.
    async fn cell(&self, key: &K) -> Cell<H> {
        self.cells
            .lock()
            .await
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Running actor for `key`, spawning one with `spawn` if needed.
    pub async fn get_or_spawn(&self, key: &K, spawn: impl FnOnce() -> (H, JoinHandle<()>)) -> H {
        let cell = self.cell(key).await;
        let mut slot = cell.lock().await;
        if let Some(handle) = settle(&mut slot, key).await {
            return handle;
        }
        let (handle, task) = spawn();
        *slot = Some(Slot {
            handle: handle.clone(),
            task,
        });
        handle
    }

    /// Running actor for `key`. Never spawns; waits for a hibernating
    /// actor to finish and then reports none.
    pub async fn live(&self, key: &K) -> Option<H> {
        let cell = self.cells.lock().await.get(key).cloned()?;
        let mut slot = cell.lock().await;
        settle(&mut slot, key).await
    }

    /// Empty the table, handing back every actor for shutdown.
    pub async fn take_all(&self) -> Vec<Slot<H>> {
        let cells: Vec<Cell<H>> = self.cells.lock().await.drain().map(|(_, cell)| cell).collect();
        let mut slots = Vec::with_capacity(cells.len());
        for cell in cells {
            if let Some(slot) = cell.lock().await.take() {
                slots.push(slot);
            }
        }
        slots
    }

    /// Actors currently accepting commands.
    pub async fn live_count(&self) -> usize {
        let cells: Vec<Cell<H>> = self.cells.lock().await.values().cloned().collect();
        let mut live = 0;
        for cell in cells {
            if cell
                .lock()
                .await
                .as_ref()
                .is_some_and(|slot| !slot.handle.is_closed())
            {
                live += 1;
            }
        }
        live
    }
}

/// The live handle in `slot`, or `None` after reaping a stopped actor.
async fn settle<K: Display, H: Mailbox>(slot: &mut Option<Slot<H>>, key: &K) -> Option<H> {
    if let Some(live) = slot.as_ref() {
        if !live.handle.is_closed() {
            return Some(live.handle.clone());
        }
    }
    if let Some(stale) = slot.take() {
        if let Err(e) = stale.task.await {
            log::error!("Actor for {key} ended abnormally: {e}");
        }
    }
    None
}

pub struct RoomRegistry {
    ctx: CoordinatorContext,
    coordinators: Slots<ChatRoute, CoordinatorHandle>,
    rooms: Arc<RoomHosts>,
}

impl RoomRegistry {
    pub fn new(ctx: CoordinatorContext) -> Self {
        let rooms = Arc::new(RoomHosts::new(ctx.clone()));
        Self {
            ctx,
            coordinators: Slots::new(),
            rooms,
        }
    }

    pub fn context(&self) -> &CoordinatorContext {
        &self.ctx
    }

    pub fn rooms(&self) -> &Arc<RoomHosts> {
        &self.rooms
    }

    /// Running coordinator for `route`, spawning one if needed.
    pub async fn handle(&self, route: &ChatRoute) -> CoordinatorHandle {
        self.coordinators
            .get_or_spawn(route, || {
                RoomCoordinator::spawn(route.clone(), self.ctx.clone(), self.rooms.clone())
            })
            .await
    }

    /// Deliver a command, waking the route's coordinator if it hibernated.
    pub async fn dispatch(&self, route: &ChatRoute, command: Command) -> SyncResult<()> {
        let mut command = command;
        for _ in 0..MAX_DISPATCH_ATTEMPTS {
            let handle = self.handle(route).await;
            match handle.send(command).await {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    log::debug!("Coordinator for {route} closed its mailbox, respawning");
                    command = returned;
                }
            }
        }
        Err(SyncError::Unavailable(format!("no coordinator for {route}")))
    }

    /// Authorize and register a socket on its route's coordinator.
    pub async fn accept(
        &self,
        route: &ChatRoute,
        transport: Transport,
        identity: Identity,
        url: String,
    ) -> SyncResult<SessionId> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(
            route,
            Command::Accept {
                transport,
                identity,
                url,
                reply,
            },
        )
        .await?;
        rx.await
            .map_err(|_| SyncError::Unavailable(format!("coordinator for {route} dropped accept")))?
    }

    /// Ask the room's live host to flush. A hibernated host has nothing
    /// unsaved and is not woken. Returns whether anything was written.
    pub async fn flush_room(&self, key: &RoomKey) -> SyncResult<bool> {
        self.rooms.flush(key).await
    }

    /// Hibernate every actor and wait for their final flushes. Coordinators
    /// go first so frames they still hold reach the room hosts.
    pub async fn hibernate_all(&self) {
        for slot in self.coordinators.take_all().await {
            let (reply, rx) = oneshot::channel();
            if slot.handle.send(Command::Hibernate { reply }).await.is_ok() {
                let _ = rx.await;
            }
            if let Err(e) = slot.task.await {
                log::error!("Coordinator for {} ended abnormally: {e}", slot.handle.route());
            }
        }
        self.rooms.hibernate_all().await;
    }

    /// Coordinators currently accepting commands.
    pub async fn live_count(&self) -> usize {
        self.coordinators.live_count().await
    }

    /// Room hosts currently accepting commands.
    pub async fn live_rooms(&self) -> usize {
        self.rooms.live_count().await
    }
}
