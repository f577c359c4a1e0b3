//! Pull-sync: hand a client the operations it is missing for one room.
//!
//! Clients that missed broadcasts (dropped messages, reconnects, cold
//! starts) call `POST /sync` with the version vector they hold and get
//! back an update covering everything else. Live coordinators flush the
//! room first so the stored blob reflects every applied operation.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::auth::Credentials;
use crate::crdt::VersionVector;
use crate::error::{SyncError, SyncResult};
use crate::registry::RoomRegistry;
use crate::room::{CrdtType, RoomId, RoomKey};

/// Export the operations of `key` that `client_version_vector` lacks.
///
/// The version vector is decoded before anything touches storage, so a
/// malformed vector never triggers a fork.
pub async fn sync_document(
    registry: &RoomRegistry,
    key: &RoomKey,
    client_version_vector: &[u8],
) -> SyncResult<Vec<u8>> {
    let since = VersionVector::decode(client_version_vector)?;

    if registry.flush_room(key).await? {
        log::debug!("Pull-sync of {key} flushed its live room host");
    }

    let document = registry.context().store.load(key).await?;
    document.missing_since(&since)
}

/// Request body of `POST /sync`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub project_id: String,
    #[serde(default)]
    pub campaign_id: Option<String>,
    pub organization_identifier: String,
    /// Client version vector, base64.
    #[serde(default, with = "base64_bytes")]
    pub op_log_version: Vec<u8>,
}

impl PullRequest {
    pub fn room_key(&self) -> SyncResult<RoomKey> {
        let room = RoomId::new(
            self.organization_identifier.as_str(),
            self.project_id.as_str(),
            self.campaign_id.clone(),
        )?;
        Ok(RoomKey::new(room, CrdtType::Yrs))
    }
}

/// Response body of `POST /sync`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullResponse {
    #[serde(with = "base64_bytes")]
    pub blob: Vec<u8>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// A `SyncError` rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub SyncError);

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            SyncError::NotFound(_) => StatusCode::NOT_FOUND,
            SyncError::BadRequest(_) | SyncError::UnsupportedRoomKind(_) => StatusCode::BAD_REQUEST,
            SyncError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            SyncError::Forbidden(_) => StatusCode::FORBIDDEN,
            SyncError::Io(_) | SyncError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            SyncError::ForkFailure { .. } | SyncError::Crdt(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<SyncError> for ApiError {
    fn from(error: SyncError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("Pull-sync failed: {}", self.0);
        } else {
            log::info!("Pull-sync refused: {}", self.0);
        }
        let body = ErrorBody {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// HTTP routes for pull-sync.
pub fn router(registry: Arc<RoomRegistry>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/sync", post(pull_sync))
        .with_state(registry)
}

/// Serve the pull-sync routes on an already-bound listener.
pub async fn serve(listener: TcpListener, registry: Arc<RoomRegistry>) -> std::io::Result<()> {
    log::info!("Pull-sync endpoint listening on {}", listener.local_addr()?);
    axum::serve(listener, router(registry)).await
}

async fn healthz() -> &'static str {
    "ok"
}

async fn pull_sync(
    State(registry): State<Arc<RoomRegistry>>,
    headers: HeaderMap,
    payload: Result<Json<PullRequest>, JsonRejection>,
) -> Result<Json<PullResponse>, ApiError> {
    let authorization = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    let credentials = Credentials::from_request(authorization, None);
    let access = registry.context().access.clone();
    let identity = access.resolve_identity(&credentials).await?;

    let Json(request) = payload.map_err(|rejection| SyncError::BadRequest(rejection.body_text()))?;
    let key = request.room_key()?;
    access.authorize_workspace(&identity, &key.room_id).await?;

    let blob = sync_document(&registry, &key, &request.op_log_version).await?;
    log::debug!("Pull-sync of {key} for {}: {} bytes", identity.user_id, blob.len());
    Ok(Json(PullResponse { blob }))
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
