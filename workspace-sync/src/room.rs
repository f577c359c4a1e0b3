//! Room addressing: workspace rooms, CRDT room keys, blob URIs and chat routes.
//!
//! ```text
//! RoomId     org/project[/campaign]          ── which workspace document
//! RoomKey    (RoomId, CrdtType)              ── cache key, one live doc per key
//! BlobUri    workspace/org/project[/campaigns/campaign]
//! ChatRoute  /ws/org/project/chat            ── one coordinator per route
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{SyncError, SyncResult};

/// Prefix of every workspace blob URI.
const URI_PREFIX: &str = "workspace";

/// Path prefix of the WebSocket upgrade route.
pub const WS_PATH_PREFIX: &str = "ws";

fn validate_segment(kind: &str, value: &str) -> SyncResult<()> {
    if value.is_empty() {
        return Err(SyncError::BadRequest(format!("{kind} must not be empty")));
    }
    if value.contains('/') || value.chars().any(char::is_whitespace) {
        return Err(SyncError::BadRequest(format!("invalid {kind}: {value:?}")));
    }
    Ok(())
}

/// Identifies one workspace document, scoped by organization and project and
/// optionally by campaign.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomId {
    pub organization_id: String,
    pub project_id: String,
    pub campaign_id: Option<String>,
}

impl RoomId {
    pub fn new(
        organization_id: impl Into<String>,
        project_id: impl Into<String>,
        campaign_id: Option<String>,
    ) -> SyncResult<Self> {
        let room = Self {
            organization_id: organization_id.into(),
            project_id: project_id.into(),
            campaign_id,
        };
        validate_segment("organization id", &room.organization_id)?;
        validate_segment("project id", &room.project_id)?;
        if let Some(campaign) = &room.campaign_id {
            validate_segment("campaign id", campaign)?;
        }
        Ok(room)
    }

    /// Project-scoped room.
    pub fn project(
        organization_id: impl Into<String>,
        project_id: impl Into<String>,
    ) -> SyncResult<Self> {
        Self::new(organization_id, project_id, None)
    }

    /// Campaign-scoped room.
    pub fn campaign(
        organization_id: impl Into<String>,
        project_id: impl Into<String>,
        campaign_id: impl Into<String>,
    ) -> SyncResult<Self> {
        Self::new(organization_id, project_id, Some(campaign_id.into()))
    }

    pub fn is_campaign(&self) -> bool {
        self.campaign_id.is_some()
    }

    /// The project workspace URI, computed with no campaign segment.
    pub fn project_uri(&self) -> WorkspaceBlobUri {
        WorkspaceBlobUri::for_project(&self.organization_id, &self.project_id)
    }

    /// Whether this room lives inside the given organization and project.
    pub fn belongs_to(&self, organization_id: &str, project_id: &str) -> bool {
        self.organization_id == organization_id && self.project_id == project_id
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.organization_id, self.project_id)?;
        if let Some(campaign) = &self.campaign_id {
            write!(f, "/{campaign}")?;
        }
        Ok(())
    }
}

impl FromStr for RoomId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [org, project] => Self::project(*org, *project),
            [org, project, campaign] => Self::campaign(*org, *project, *campaign),
            _ => Err(SyncError::BadRequest(format!("malformed room id: {s:?}"))),
        }
    }
}

/// Policy attached to every document of a CRDT type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomDescriptor {
    /// Whether mutations are durably saved.
    pub should_persist: bool,
    /// Whether a lone client may seed the document with operations the
    /// server does not have.
    pub allow_backfill_when_no_other_clients: bool,
}

/// Supported replicated document types. This is a closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CrdtType {
    Yrs,
}

impl CrdtType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            CrdtType::Yrs => "yrs",
        }
    }

    pub const fn descriptor(&self) -> RoomDescriptor {
        match self {
            CrdtType::Yrs => RoomDescriptor {
                should_persist: true,
                allow_backfill_when_no_other_clients: true,
            },
        }
    }
}

impl fmt::Display for CrdtType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CrdtType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "yrs" => Ok(CrdtType::Yrs),
            other => Err(SyncError::UnsupportedRoomKind(other.to_string())),
        }
    }
}

/// Cache key: one live document per `(room, crdt type)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoomKey {
    pub room_id: RoomId,
    pub crdt: CrdtType,
}

impl RoomKey {
    pub fn new(room_id: RoomId, crdt: CrdtType) -> Self {
        Self { room_id, crdt }
    }

    /// Parse the wire form carried by CRDT frames.
    pub fn parse(crdt: &str, room_id: &str) -> SyncResult<Self> {
        let crdt = crdt.parse()?;
        let room_id = room_id.parse()?;
        Ok(Self { room_id, crdt })
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.crdt, self.room_id)
    }
}

/// Durable location of a workspace document in the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkspaceBlobUri(String);

impl WorkspaceBlobUri {
    pub fn for_project(organization_id: &str, project_id: &str) -> Self {
        Self(format!("{URI_PREFIX}/{organization_id}/{project_id}"))
    }

    pub fn for_campaign(organization_id: &str, project_id: &str, campaign_id: &str) -> Self {
        Self(format!(
            "{URI_PREFIX}/{organization_id}/{project_id}/campaigns/{campaign_id}"
        ))
    }

    /// Wrap a URI read back from the metadata store.
    pub fn from_stored(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkspaceBlobUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The `(organization, project, chat)` triple a connection targets.
/// Each route is served by exactly one coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatRoute {
    pub organization_id: String,
    pub project_id: String,
    pub chat_id: String,
}

impl ChatRoute {
    pub fn new(
        organization_id: impl Into<String>,
        project_id: impl Into<String>,
        chat_id: impl Into<String>,
    ) -> SyncResult<Self> {
        let route = Self {
            organization_id: organization_id.into(),
            project_id: project_id.into(),
            chat_id: chat_id.into(),
        };
        validate_segment("organization id", &route.organization_id)?;
        validate_segment("project id", &route.project_id)?;
        validate_segment("chat id", &route.chat_id)?;
        Ok(route)
    }

    /// Parse an upgrade request path of the form `/ws/{org}/{project}/{chat}`.
    /// A query string, if present, is ignored.
    pub fn from_path(path: &str) -> SyncResult<Self> {
        let path = path.split('?').next().unwrap_or_default();
        let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        match parts.as_slice() {
            [prefix, org, project, chat] if *prefix == WS_PATH_PREFIX => {
                Self::new(*org, *project, *chat)
            }
            _ => Err(SyncError::BadRequest(format!("malformed connection path: {path:?}"))),
        }
    }

    pub fn path(&self) -> String {
        format!(
            "/{WS_PATH_PREFIX}/{}/{}/{}",
            self.organization_id, self.project_id, self.chat_id
        )
    }
}

impl fmt::Display for ChatRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.organization_id, self.project_id, self.chat_id)
    }
}
