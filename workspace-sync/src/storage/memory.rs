//! Process-local implementation of every storage collaborator.
//!
//! Used by tests and by deployments that run without a data directory.
//! Failure injection lets tests exercise the I/O and fork-failure paths.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;

use super::{BlobStore, CampaignRecord, ChatLog, MetadataStore};
use crate::error::{SyncError, SyncResult};
use crate::room::{ChatRoute, WorkspaceBlobUri};

/// `(organization, project, campaign)`
type CampaignKey = (String, String, String);

fn campaign_key(campaign_id: &str, project_id: &str, organization_id: &str) -> CampaignKey {
    (
        organization_id.to_string(),
        project_id.to_string(),
        campaign_id.to_string(),
    )
}

/// In-memory blob, metadata and chat storage.
#[derive(Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<WorkspaceBlobUri, Vec<u8>>>,
    campaigns: RwLock<HashMap<CampaignKey, CampaignRecord>>,
    messages: RwLock<HashMap<ChatRoute, Vec<serde_json::Value>>>,
    blob_writes: AtomicU64,
    fail_blob_reads: AtomicBool,
    fail_blob_writes: AtomicBool,
    fail_metadata_updates: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `set_snapshot` calls.
    pub fn blob_writes(&self) -> u64 {
        self.blob_writes.load(Ordering::SeqCst)
    }

    pub async fn blob_count(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub fn fail_blob_reads(&self, fail: bool) {
        self.fail_blob_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_blob_writes(&self, fail: bool) {
        self.fail_blob_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_metadata_updates(&self, fail: bool) {
        self.fail_metadata_updates.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn get_snapshot(&self, uri: &WorkspaceBlobUri) -> SyncResult<Option<Vec<u8>>> {
        if self.fail_blob_reads.load(Ordering::SeqCst) {
            return Err(SyncError::Io(format!("blob store unreachable reading {uri}")));
        }
        Ok(self.blobs.read().await.get(uri).cloned())
    }

    async fn set_snapshot(&self, uri: &WorkspaceBlobUri, bytes: &[u8]) -> SyncResult<()> {
        if self.fail_blob_writes.load(Ordering::SeqCst) {
            return Err(SyncError::Io(format!("blob store unreachable writing {uri}")));
        }
        self.blobs.write().await.insert(uri.clone(), bytes.to_vec());
        self.blob_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn get_campaign(
        &self,
        campaign_id: &str,
        project_id: &str,
        organization_id: &str,
    ) -> SyncResult<Option<CampaignRecord>> {
        let key = campaign_key(campaign_id, project_id, organization_id);
        Ok(self.campaigns.read().await.get(&key).cloned())
    }

    async fn update_campaign(
        &self,
        campaign_id: &str,
        project_id: &str,
        organization_id: &str,
        workspace_blob_uri: &WorkspaceBlobUri,
    ) -> SyncResult<()> {
        if self.fail_metadata_updates.load(Ordering::SeqCst) {
            return Err(SyncError::Io(format!(
                "metadata store unreachable updating campaign {campaign_id}"
            )));
        }
        let key = campaign_key(campaign_id, project_id, organization_id);
        let mut campaigns = self.campaigns.write().await;
        match campaigns.get_mut(&key) {
            Some(record) => {
                record.workspace_blob_uri = workspace_blob_uri.clone();
                Ok(())
            }
            None => Err(SyncError::NotFound(format!(
                "campaign {campaign_id} in {organization_id}/{project_id}"
            ))),
        }
    }

    async fn insert_campaign(&self, record: CampaignRecord) -> SyncResult<()> {
        let key = campaign_key(&record.id, &record.project_id, &record.organization_id);
        self.campaigns.write().await.insert(key, record);
        Ok(())
    }
}

#[async_trait]
impl ChatLog for MemoryStore {
    async fn append_message(&self, route: &ChatRoute, message: &serde_json::Value) -> SyncResult<()> {
        self.messages
            .write()
            .await
            .entry(route.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn messages(&self, route: &ChatRoute) -> SyncResult<Vec<serde_json::Value>> {
        Ok(self
            .messages
            .read()
            .await
            .get(route)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blob_roundtrip_and_absence() {
        let store = MemoryStore::new();
        let uri = WorkspaceBlobUri::for_project("o", "p");
        assert_eq!(store.get_snapshot(&uri).await.unwrap(), None);

        store.set_snapshot(&uri, &[1, 2, 3]).await.unwrap();
        assert_eq!(store.get_snapshot(&uri).await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(store.blob_writes(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_io_errors() {
        let store = MemoryStore::new();
        let uri = WorkspaceBlobUri::for_project("o", "p");
        store.fail_blob_reads(true);
        assert!(matches!(store.get_snapshot(&uri).await, Err(SyncError::Io(_))));
        store.fail_blob_writes(true);
        assert!(matches!(store.set_snapshot(&uri, b"x").await, Err(SyncError::Io(_))));
        assert_eq!(store.blob_writes(), 0);
    }

    #[tokio::test]
    async fn test_campaign_lookup_is_scoped() {
        let store = MemoryStore::new();
        store
            .insert_campaign(CampaignRecord::sharing_project("c1", "p1", "o1"))
            .await
            .unwrap();

        assert!(store.get_campaign("c1", "p1", "o1").await.unwrap().is_some());
        assert!(store.get_campaign("c1", "p2", "o1").await.unwrap().is_none());
        assert!(store.get_campaign("c1", "p1", "o2").await.unwrap().is_none());

        let forked = WorkspaceBlobUri::for_campaign("o1", "p1", "c1");
        store.update_campaign("c1", "p1", "o1", &forked).await.unwrap();
        let record = store.get_campaign("c1", "p1", "o1").await.unwrap().unwrap();
        assert_eq!(record.workspace_blob_uri, forked);

        assert!(matches!(
            store.update_campaign("missing", "p1", "o1", &forked).await,
            Err(SyncError::NotFound(_))
        ));
        assert!(matches!(
            store.update_campaign("c1", "p1", "o2", &forked).await,
            Err(SyncError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_same_campaign_id_in_two_organizations() {
        let store = MemoryStore::new();
        store
            .insert_campaign(CampaignRecord::sharing_project("spring", "p1", "o1"))
            .await
            .unwrap();
        store
            .insert_campaign(CampaignRecord::sharing_project("spring", "p1", "o2"))
            .await
            .unwrap();

        assert!(store.get_campaign("spring", "p1", "o1").await.unwrap().is_some());
        assert!(store.get_campaign("spring", "p1", "o2").await.unwrap().is_some());

        let forked = WorkspaceBlobUri::for_campaign("o2", "p1", "spring");
        store.update_campaign("spring", "p1", "o2", &forked).await.unwrap();
        let untouched = store.get_campaign("spring", "p1", "o1").await.unwrap().unwrap();
        assert_eq!(untouched.workspace_blob_uri, WorkspaceBlobUri::for_project("o1", "p1"));
    }

    #[tokio::test]
    async fn test_chat_log_per_route() {
        let store = MemoryStore::new();
        let a = ChatRoute::new("o", "p", "a").unwrap();
        let b = ChatRoute::new("o", "p", "b").unwrap();
        store
            .append_message(&a, &serde_json::json!({"id": "m1"}))
            .await
            .unwrap();
        assert_eq!(store.messages(&a).await.unwrap().len(), 1);
        assert!(store.messages(&b).await.unwrap().is_empty());
    }
}
