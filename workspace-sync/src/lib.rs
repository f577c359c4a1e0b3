//! # workspace-sync - Collaborative workspace sync engine
//!
//! Serves CRDT workspace documents to chat sessions over WebSocket, with a
//! pull-sync HTTP endpoint for clients that fell behind.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  /ws/{org}/{project}/{chat}  ┌─────────────┐
//! │ SyncClient  │ ◄──────────────────────────► │ SyncServer  │
//! │ (per user)  │   bincode CRDT + JSON app     │ (listener)  │
//! └─────────────┘                               └──────┬──────┘
//!                                                      │ RoomRegistry
//!                                                      ▼
//!                                              ┌────────────────┐
//!                                              │RoomCoordinator │ one per chat,
//!                                              │ chat members   │ hibernates idle
//!                                              └───────┬────────┘
//!                                                      │ CRDT frames
//!                                                      ▼
//!                                              ┌────────────────┐
//!                                              │   RoomHost     │ one per room,
//!                                              │ document+joined│ hibernates idle
//!                                              └───────┬────────┘
//!                                                      │ load / fork / flush
//!                                                      ▼
//! ┌─────────────┐  POST /sync                  ┌────────────────┐
//! │ pull client │ ───────────────────────────► │ WorkspaceStore │
//! └─────────────┘                              │ blobs+metadata │
//!                                              └────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`room`]: Room ids, CRDT kinds, blob URIs and chat routes
//! - [`crdt`]: Yrs document adaptor (import, fork, export, frontiers)
//! - [`cache`]: Room document cache with fork-on-divergence
//! - [`storage`]: Blob, metadata and chat log stores (memory, RocksDB)
//! - [`protocol`]: Binary CRDT frames and JSON application frames
//! - [`session`]: Session attachments, transports and the socket pool
//! - [`broadcast`]: Membership table and best-effort fan-out
//! - [`coordinator`]: Per-chat session coordinator actor
//! - [`host`]: Per-room document owner shared by every chat of a project
//! - [`registry`]: Actor tables for chat routes and room keys
//! - [`server`]: WebSocket listener
//! - [`pull`]: Pull-sync HTTP endpoint
//! - [`client`]: WebSocket client with offline queue
//! - [`auth`]: Credentials, identities and access control
//! - [`config`]: Environment-driven server configuration

pub mod auth;
pub mod broadcast;
pub mod cache;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod crdt;
pub mod error;
pub mod host;
pub mod protocol;
pub mod pull;
pub mod registry;
pub mod room;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use auth::{AccessControl, ChatGrant, Credentials, Identity, StaticAccessControl};
pub use broadcast::{BroadcastStats, Fanout, Membership};
pub use cache::{RoomDocument, RoomDocumentCache, WorkspaceStore};
pub use client::{ClientError, OfflineQueue, SyncClient, SyncEvent};
pub use config::ServerConfig;
pub use coordinator::{Command, CoordinatorContext, CoordinatorHandle, RoomCoordinator};
pub use crdt::{CrdtDocument, ExportMode, VersionVector};
pub use error::{SyncError, SyncResult};
pub use host::{RoomCommand, RoomHost, RoomHostHandle, RoomHosts};
pub use protocol::{AppFrame, CrdtFrame, FrameType, ProtocolError};
pub use pull::{sync_document, PullRequest, PullResponse};
pub use registry::{Mailbox, RoomRegistry};
pub use room::{ChatRoute, CrdtType, RoomDescriptor, RoomId, RoomKey, WorkspaceBlobUri};
pub use server::{ServerStats, SyncServer};
pub use session::{ConnectionState, SessionAttachment, SessionId, SocketPool, Transport};
pub use storage::{
    BlobStore, CampaignRecord, ChatLog, MemoryStore, MetadataStore, RocksStore, StoreConfig,
    StoreError,
};
