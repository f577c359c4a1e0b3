//! Room document cache and fork-on-divergence loading.
//!
//! ```text
//! get_or_create(key)
//!   ├─ hit ───────────────────────────────────────────► &mut RoomDocument
//!   └─ miss ─► WorkspaceStore::load(key)
//!               ├─ project room ─► blob(project uri) or empty doc
//!               └─ campaign room ─► campaign record
//!                   ├─ uri ≠ project uri ─► blob(campaign uri) or NotFound
//!                   └─ uri = project uri ─► [fork lock] re-read record
//!                        import parent ─► fork ─► shallow export
//!                        set_snapshot(campaign uri) ─► update_campaign
//! ```
//!
//! A cache belongs to the room host that owns its keys. The host directory
//! keeps at most one live host per room key, so no other in-process copy of
//! a live document exists and a flush can write the live state as-is.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use crate::crdt::{CrdtDocument, ExportMode, VersionVector};
use crate::error::{SyncError, SyncResult};
use crate::room::{RoomDescriptor, RoomId, RoomKey, WorkspaceBlobUri};
use crate::storage::{BlobStore, MetadataStore};

/// A loaded workspace document and its persistence bookkeeping.
pub struct RoomDocument {
    pub doc: CrdtDocument,
    pub uri: WorkspaceBlobUri,
    /// Mutated since the last successful flush.
    pub dirty: bool,
    pub last_saved: Option<Instant>,
    pub descriptor: RoomDescriptor,
}

impl RoomDocument {
    fn new(doc: CrdtDocument, uri: WorkspaceBlobUri, descriptor: RoomDescriptor) -> Self {
        Self {
            doc,
            uri,
            dirty: false,
            last_saved: None,
            descriptor,
        }
    }

    /// Current snapshot bytes.
    pub fn data(&self) -> SyncResult<Vec<u8>> {
        self.doc.export(ExportMode::Snapshot)
    }

    /// Integrate a client update. Only persistable documents become dirty.
    pub fn apply_update(&mut self, update: &[u8]) -> SyncResult<()> {
        self.doc.apply(update)?;
        if self.descriptor.should_persist {
            self.dirty = true;
        }
        Ok(())
    }

    pub fn frontiers(&self) -> VersionVector {
        self.doc.frontiers()
    }

    /// Operations the holder of `since` has not seen.
    pub fn missing_since(&self, since: &VersionVector) -> SyncResult<Vec<u8>> {
        self.doc.export(ExportMode::UpdateSince(since))
    }
}

/// Shared access to the durable collaborators.
///
/// One per process. The fork lock makes the campaign fork happen at most
/// once; the write lock serializes blob writes.
pub struct WorkspaceStore {
    blobs: Arc<dyn BlobStore>,
    metadata: Arc<dyn MetadataStore>,
    fork_lock: Mutex<()>,
    write_lock: Mutex<()>,
}

impl WorkspaceStore {
    pub fn new(blobs: Arc<dyn BlobStore>, metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            blobs,
            metadata,
            fork_lock: Mutex::new(()),
            write_lock: Mutex::new(()),
        }
    }

    /// Use one backend for both blobs and metadata.
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: BlobStore + MetadataStore + 'static,
    {
        let blobs: Arc<dyn BlobStore> = backend.clone();
        let metadata: Arc<dyn MetadataStore> = backend;
        Self::new(blobs, metadata)
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    /// Load a room's document from durable storage, forking a campaign off
    /// its project when it still shares the project's blob.
    pub async fn load(&self, key: &RoomKey) -> SyncResult<RoomDocument> {
        let descriptor = key.crdt.descriptor();
        let room = &key.room_id;

        let Some(campaign_id) = room.campaign_id.as_deref() else {
            let uri = room.project_uri();
            let doc = match self.blobs.get_snapshot(&uri).await? {
                Some(bytes) => CrdtDocument::import(&bytes)?,
                None => {
                    log::debug!("No workspace blob at {uri}, starting empty");
                    CrdtDocument::new()
                }
            };
            return Ok(RoomDocument::new(doc, uri, descriptor));
        };

        let record = self.campaign_uri(room, campaign_id).await?;
        let (doc, uri) = if record == room.project_uri() {
            self.fork_campaign(room, campaign_id).await?
        } else {
            (self.load_existing(&record).await?, record)
        };
        Ok(RoomDocument::new(doc, uri, descriptor))
    }

    async fn campaign_uri(&self, room: &RoomId, campaign_id: &str) -> SyncResult<WorkspaceBlobUri> {
        self.metadata
            .get_campaign(campaign_id, &room.project_id, &room.organization_id)
            .await?
            .map(|record| record.workspace_blob_uri)
            .ok_or_else(|| SyncError::NotFound(format!("campaign {campaign_id} in {room}")))
    }

    async fn load_existing(&self, uri: &WorkspaceBlobUri) -> SyncResult<CrdtDocument> {
        match self.blobs.get_snapshot(uri).await? {
            Some(bytes) => CrdtDocument::import(&bytes),
            None => Err(SyncError::NotFound(format!("workspace blob {uri}"))),
        }
    }

    async fn fork_campaign(
        &self,
        room: &RoomId,
        campaign_id: &str,
    ) -> SyncResult<(CrdtDocument, WorkspaceBlobUri)> {
        let _fork = self.fork_lock.lock().await;

        // Another caller may have forked while we waited.
        let current = self.campaign_uri(room, campaign_id).await?;
        let project_uri = room.project_uri();
        if current != project_uri {
            log::debug!("Campaign {campaign_id} already forked to {current}");
            return Ok((self.load_existing(&current).await?, current));
        }

        let parent_bytes = self
            .blobs
            .get_snapshot(&project_uri)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("parent workspace blob {project_uri}")))?;
        let parent = CrdtDocument::import(&parent_bytes)?;
        let parent_frontiers = parent.frontiers();

        let campaign_uri = WorkspaceBlobUri::for_campaign(
            &room.organization_id,
            &room.project_id,
            campaign_id,
        );
        let fork_failure = |reason: SyncError| SyncError::ForkFailure {
            uri: campaign_uri.to_string(),
            reason: reason.to_string(),
        };

        let fork = parent.fork().map_err(fork_failure)?;
        let snapshot = fork
            .export(ExportMode::ShallowSnapshot(&parent_frontiers))
            .map_err(fork_failure)?;

        {
            let _write = self.write_lock.lock().await;
            self.blobs
                .set_snapshot(&campaign_uri, &snapshot)
                .await
                .map_err(fork_failure)?;
        }
        self.metadata
            .update_campaign(campaign_id, &room.project_id, &room.organization_id, &campaign_uri)
            .await
            .map_err(fork_failure)?;

        log::info!(
            "Forked campaign {campaign_id}: {project_uri} → {campaign_uri} ({} bytes)",
            snapshot.len()
        );
        Ok((fork, campaign_uri))
    }

    /// Write a dirty, persistable document. Returns whether anything was
    /// written.
    pub async fn persist(&self, document: &mut RoomDocument) -> SyncResult<bool> {
        if !document.dirty || !document.descriptor.should_persist {
            return Ok(false);
        }

        let bytes = document.data()?;
        let _write = self.write_lock.lock().await;
        self.blobs.set_snapshot(&document.uri, &bytes).await?;

        document.dirty = false;
        document.last_saved = Some(Instant::now());
        log::debug!("Flushed {} ({} bytes)", document.uri, bytes.len());
        Ok(true)
    }
}

/// Live room documents of one owner.
pub struct RoomDocumentCache {
    store: Arc<WorkspaceStore>,
    documents: HashMap<RoomKey, RoomDocument>,
}

impl RoomDocumentCache {
    pub fn new(store: Arc<WorkspaceStore>) -> Self {
        Self {
            store,
            documents: HashMap::new(),
        }
    }

    /// Cached document for `key`, loading (and possibly forking) on a miss.
    /// Failed loads leave nothing behind.
    pub async fn get_or_create(&mut self, key: &RoomKey) -> SyncResult<&mut RoomDocument> {
        if !self.documents.contains_key(key) {
            let document = self.store.load(key).await?;
            log::debug!("Loaded room {key} from {}", document.uri);
            self.documents.insert(key.clone(), document);
        }
        self.documents
            .get_mut(key)
            .ok_or_else(|| SyncError::NotFound(format!("room {key}")))
    }

    pub fn get(&self, key: &RoomKey) -> Option<&RoomDocument> {
        self.documents.get(key)
    }

    pub fn contains(&self, key: &RoomKey) -> bool {
        self.documents.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn dirty_count(&self) -> usize {
        self.documents.values().filter(|d| d.dirty).count()
    }

    /// Flush one room if it is cached and dirty.
    pub async fn flush(&mut self, key: &RoomKey) -> SyncResult<bool> {
        match self.documents.get_mut(key) {
            Some(document) => self.store.persist(document).await,
            None => Ok(false),
        }
    }

    /// Flush every dirty room. Every room is attempted; the first failure
    /// is returned and failed rooms stay dirty.
    pub async fn flush_all(&mut self) -> SyncResult<usize> {
        let mut written = 0;
        let mut first_error = None;
        for (key, document) in self.documents.iter_mut() {
            match self.store.persist(document).await {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => {
                    log::error!("Flush of {key} failed: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Flush everything and empty the cache. On failure nothing is dropped.
    pub async fn drain(&mut self) -> SyncResult<()> {
        self.flush_all().await?;
        self.documents.clear();
        Ok(())
    }
}
