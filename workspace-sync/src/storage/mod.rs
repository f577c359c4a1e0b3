//! Durable collaborators of the sync engine.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐  get/set(uri)   ┌───────────────────────────────┐
//! │ WorkspaceStore   │ ──────────────► │ BlobStore                     │
//! │ (load/fork/flush)│                 │  MemoryStore | RocksStore     │
//! └────────┬─────────┘                 └───────────────────────────────┘
//!          │ campaign lookup/update    ┌───────────────────────────────┐
//!          └─────────────────────────► │ MetadataStore                 │
//!                                      └───────────────────────────────┘
//! ┌──────────────────┐  new-msg        ┌───────────────────────────────┐
//! │ RoomCoordinator  │ ──────────────► │ ChatLog                       │
//! └──────────────────┘                 └───────────────────────────────┘
//! ```
//!
//! The blob store has no versioning of its own; the engine owns versioning
//! through the CRDT state it writes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncResult;
use crate::room::{ChatRoute, WorkspaceBlobUri};

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig, StoreError};

/// Content storage keyed by an opaque URI.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get_snapshot(&self, uri: &WorkspaceBlobUri) -> SyncResult<Option<Vec<u8>>>;

    async fn set_snapshot(&self, uri: &WorkspaceBlobUri, bytes: &[u8]) -> SyncResult<()>;
}

/// A campaign row as far as the sync engine cares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignRecord {
    pub id: String,
    pub project_id: String,
    pub organization_id: String,
    /// Equal to the project URI until the campaign forks.
    pub workspace_blob_uri: WorkspaceBlobUri,
}

impl CampaignRecord {
    /// A newly created campaign that still shares its project's workspace.
    pub fn sharing_project(
        id: impl Into<String>,
        project_id: impl Into<String>,
        organization_id: impl Into<String>,
    ) -> Self {
        let project_id = project_id.into();
        let organization_id = organization_id.into();
        let workspace_blob_uri = WorkspaceBlobUri::for_project(&organization_id, &project_id);
        Self {
            id: id.into(),
            project_id,
            organization_id,
            workspace_blob_uri,
        }
    }
}

/// Campaign/project metadata lookups.
///
/// Campaign ids are only unique within their organization and project, so
/// every lookup is scoped by both.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_campaign(
        &self,
        campaign_id: &str,
        project_id: &str,
        organization_id: &str,
    ) -> SyncResult<Option<CampaignRecord>>;

    async fn update_campaign(
        &self,
        campaign_id: &str,
        project_id: &str,
        organization_id: &str,
        workspace_blob_uri: &WorkspaceBlobUri,
    ) -> SyncResult<()>;

    /// Create or replace a campaign record.
    async fn insert_campaign(&self, record: CampaignRecord) -> SyncResult<()>;
}

/// Persistence for application-level chat messages.
#[async_trait]
pub trait ChatLog: Send + Sync {
    async fn append_message(&self, route: &ChatRoute, message: &serde_json::Value) -> SyncResult<()>;

    async fn messages(&self, route: &ChatRoute) -> SyncResult<Vec<serde_json::Value>>;
}
