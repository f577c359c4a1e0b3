//! Access control collaborator.
//!
//! Identity resolution and authorization decisions live outside the sync
//! engine; it only consumes the [`AccessControl`] interface.
//! [`StaticAccessControl`] is a token table for single-node deployments
//! and tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

use crate::error::{SyncError, SyncResult};
use crate::room::{ChatRoute, RoomId};

/// Credentials presented with a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub bearer_token: Option<String>,
}

impl Credentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            bearer_token: Some(token.into()),
        }
    }

    /// Token from an `Authorization: Bearer …` header, falling back to a
    /// `token` query parameter (browsers cannot set headers on WebSocket
    /// upgrades).
    pub fn from_request(authorization: Option<&str>, query: Option<&str>) -> Self {
        let from_header = authorization
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty());
        let from_query = query.and_then(|q| {
            q.split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(name, _)| *name == "token")
                .map(|(_, value)| value)
                .filter(|token| !token.is_empty())
        });
        Self {
            bearer_token: from_header.or(from_query).map(str::to_string),
        }
    }
}

/// A resolved user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub organization_ids: HashSet<String>,
}

impl Identity {
    pub fn new<I, S>(user_id: impl Into<String>, organization_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            user_id: user_id.into(),
            organization_ids: organization_ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_member_of(&self, organization_id: &str) -> bool {
        self.organization_ids.contains(organization_id)
    }
}

/// Permission to view a chat.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatGrant {
    pub chat_title: Option<String>,
}

#[async_trait]
pub trait AccessControl: Send + Sync {
    /// `Unauthorized` when the credentials are missing or unknown.
    async fn resolve_identity(&self, credentials: &Credentials) -> SyncResult<Identity>;

    /// `Forbidden` when the identity may not view the chat.
    async fn authorize_chat(&self, identity: &Identity, route: &ChatRoute) -> SyncResult<ChatGrant>;

    /// `Forbidden` when the identity may not read the workspace.
    async fn authorize_workspace(&self, identity: &Identity, room: &RoomId) -> SyncResult<()>;
}

/// Token table keyed by bearer token. Organization membership grants
/// access to every project, chat and workspace of that organization.
#[derive(Debug, Clone, Default)]
pub struct StaticAccessControl {
    tokens: HashMap<String, Identity>,
    chat_titles: HashMap<ChatRoute, String>,
}

impl StaticAccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, identity: Identity) -> Self {
        self.tokens.insert(token.into(), identity);
        self
    }

    pub fn with_chat_title(mut self, route: ChatRoute, title: impl Into<String>) -> Self {
        self.chat_titles.insert(route, title.into());
        self
    }

    /// Parse `token=user@org1|org2,token2=user2@org3`.
    pub fn parse(table: &str) -> SyncResult<Self> {
        let mut access = Self::new();
        for entry in table.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (token, grant) = entry
                .split_once('=')
                .ok_or_else(|| SyncError::BadRequest(format!("token entry without '=': {entry}")))?;
            let (user, orgs) = grant
                .split_once('@')
                .ok_or_else(|| SyncError::BadRequest(format!("token entry without '@': {entry}")))?;
            if token.is_empty() || user.is_empty() {
                return Err(SyncError::BadRequest(format!("empty token or user: {entry}")));
            }
            let identity = Identity::new(user, orgs.split('|').filter(|o| !o.is_empty()));
            access = access.with_token(token, identity);
        }
        Ok(access)
    }

    /// Load the table from `WORKSPACE_SYNC_TOKENS`. Unset means no tokens,
    /// so every connection is refused.
    pub fn from_env() -> SyncResult<Self> {
        match std::env::var("WORKSPACE_SYNC_TOKENS") {
            Ok(table) => Self::parse(&table),
            Err(_) => {
                log::warn!("WORKSPACE_SYNC_TOKENS not set; all requests will be refused");
                Ok(Self::new())
            }
        }
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }
}

#[async_trait]
impl AccessControl for StaticAccessControl {
    async fn resolve_identity(&self, credentials: &Credentials) -> SyncResult<Identity> {
        let token = credentials
            .bearer_token
            .as_deref()
            .ok_or_else(|| SyncError::Unauthorized("missing bearer token".into()))?;
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| SyncError::Unauthorized("unknown token".into()))
    }

    async fn authorize_chat(&self, identity: &Identity, route: &ChatRoute) -> SyncResult<ChatGrant> {
        if !identity.is_member_of(&route.organization_id) {
            return Err(SyncError::Forbidden(format!(
                "{} may not view chat {route}",
                identity.user_id
            )));
        }
        Ok(ChatGrant {
            chat_title: self.chat_titles.get(route).cloned(),
        })
    }

    async fn authorize_workspace(&self, identity: &Identity, room: &RoomId) -> SyncResult<()> {
        if identity.is_member_of(&room.organization_id) {
            Ok(())
        } else {
            Err(SyncError::Forbidden(format!(
                "{} may not access workspace {room}",
                identity.user_id
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_from_header_and_query() {
        assert_eq!(
            Credentials::from_request(Some("Bearer abc"), None),
            Credentials::bearer("abc")
        );
        assert_eq!(
            Credentials::from_request(None, Some("x=1&token=q")),
            Credentials::bearer("q")
        );
        // Header wins over query
        assert_eq!(
            Credentials::from_request(Some("Bearer h"), Some("token=q")),
            Credentials::bearer("h")
        );
        assert_eq!(Credentials::from_request(Some("Basic zzz"), None), Credentials::default());
        assert_eq!(Credentials::from_request(None, Some("token=")), Credentials::default());
    }

    #[test]
    fn test_parse_token_table() {
        let access = StaticAccessControl::parse("t1=alice@acme|beta, t2=bob@acme").unwrap();
        assert_eq!(access.token_count(), 2);
        assert!(StaticAccessControl::parse("broken").is_err());
        assert!(StaticAccessControl::parse("t=@acme").is_err());
        assert_eq!(StaticAccessControl::parse("").unwrap().token_count(), 0);
    }

    #[tokio::test]
    async fn test_resolution_and_authorization() {
        let route = ChatRoute::new("acme", "p1", "c1").unwrap();
        let access = StaticAccessControl::new()
            .with_token("t1", Identity::new("alice", ["acme"]))
            .with_chat_title(route.clone(), "Launch plan");

        assert!(matches!(
            access.resolve_identity(&Credentials::default()).await,
            Err(SyncError::Unauthorized(_))
        ));
        assert!(matches!(
            access.resolve_identity(&Credentials::bearer("nope")).await,
            Err(SyncError::Unauthorized(_))
        ));

        let alice = access.resolve_identity(&Credentials::bearer("t1")).await.unwrap();
        let grant = access.authorize_chat(&alice, &route).await.unwrap();
        assert_eq!(grant.chat_title.as_deref(), Some("Launch plan"));

        let foreign = ChatRoute::new("other", "p1", "c1").unwrap();
        assert!(matches!(
            access.authorize_chat(&alice, &foreign).await,
            Err(SyncError::Forbidden(_))
        ));
        assert!(access
            .authorize_workspace(&alice, &RoomId::project("acme", "p1").unwrap())
            .await
            .is_ok());
        assert!(access
            .authorize_workspace(&alice, &RoomId::project("other", "p1").unwrap())
            .await
            .is_err());
    }
}
