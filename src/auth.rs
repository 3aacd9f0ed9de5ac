//! Connection authentication and authorization.
//!
//! The realtime endpoint trusts nothing from the client except a bearer
//! token, delivered one of three ways (checked in this order):
//!
//! 1. `Authorization: Bearer <token>` header
//! 2. an `auth.<token>` WebSocket subprotocol (browser clients cannot set
//!    arbitrary headers; the server echoes the protocol back in the accept)
//! 3. a `?token=<token>` query parameter (deprecated — tokens end up in
//!    access logs; accepted with a warning)
//!
//! Validation and per-record permission checks go through the
//! [`AuthService`] and [`RecordStore`] seams so the subsystem stays
//! decoupled from whatever session and storage layers host it. A missing
//! record is deliberately reported as a permission failure: probing which
//! record ids exist must look identical to lacking access.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::RealtimeError;

/// Permission actions checked against the host application.
pub const ACTION_VIEW: &str = "records:view";
pub const ACTION_EDIT: &str = "records:edit";

/// Subprotocol prefix carrying a bearer token.
pub const AUTH_PROTOCOL_PREFIX: &str = "auth.";

/// Minimum length for a subprotocol to be treated as a bare session token.
const BARE_TOKEN_MIN_LEN: usize = 32;

/// An authenticated user, as resolved by the host's session layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: String,
    pub username: String,
    pub role: String,
}

/// What an authenticated user may do inside one room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permissions {
    pub can_view: bool,
    pub can_edit: bool,
}

/// A persisted record whose content seeds a fresh room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub id: String,
    pub content: String,
}

/// Failures from the host-side auth and record backends.
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    #[error("record not found")]
    RecordNotFound,
    #[error("backend error: {0}")]
    Backend(String),
}

/// Session validation and permission checks, implemented by the host.
#[async_trait]
pub trait AuthService: Send + Sync {
    /// Resolve a bearer token to a user, or `None` if the session is
    /// invalid or expired.
    async fn validate_session(&self, token: &str) -> Option<AuthUser>;

    /// May `user` perform `action` on the record?
    async fn user_can(
        &self,
        user: &AuthUser,
        action: &str,
        record_id: &str,
    ) -> Result<bool, AccessError>;
}

/// Record lookup, implemented by the host's storage layer.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_record(&self, record_id: &str) -> Result<Option<Record>, AccessError>;
}

/// How the bearer token reached us. Query-string delivery is logged as
/// deprecated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenMethod {
    Header,
    Subprotocol,
    Query,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedToken {
    pub token: String,
    pub method: TokenMethod,
    /// The full subprotocol string to echo back, when delivered that way.
    pub subprotocol: Option<String>,
}

/// Pull the bearer token out of handshake material, honoring the
/// precedence order documented at module level.
pub fn extract_token(
    authorization: Option<&str>,
    protocols: &[String],
    query: Option<&str>,
) -> Option<ExtractedToken> {
    if let Some(value) = authorization {
        if let Some(token) = value.strip_prefix("Bearer ") {
            let token = token.trim();
            if !token.is_empty() {
                return Some(ExtractedToken {
                    token: token.to_string(),
                    method: TokenMethod::Header,
                    subprotocol: None,
                });
            }
        }
    }

    for protocol in protocols {
        if let Some(token) = protocol.strip_prefix(AUTH_PROTOCOL_PREFIX) {
            if !token.is_empty() {
                return Some(ExtractedToken {
                    token: token.to_string(),
                    method: TokenMethod::Subprotocol,
                    subprotocol: Some(protocol.clone()),
                });
            }
        }
        // Some clients offer the opaque session token as the protocol itself.
        if protocol.len() >= BARE_TOKEN_MIN_LEN && !protocol.contains('.') {
            return Some(ExtractedToken {
                token: protocol.clone(),
                method: TokenMethod::Subprotocol,
                subprotocol: Some(protocol.clone()),
            });
        }
    }

    if let Some(query) = query {
        for pair in query.split('&') {
            if let Some(token) = pair.strip_prefix("token=") {
                if !token.is_empty() {
                    log::warn!(
                        "Bearer token received via query parameter; this delivery method is deprecated"
                    );
                    return Some(ExtractedToken {
                        token: percent_decode(token),
                        method: TokenMethod::Query,
                        subprotocol: None,
                    });
                }
            }
        }
    }

    None
}

/// Extract `(room_type, record_id)` from the request path, given the
/// configured base path. `/realtime/records/doc-1` with base `/realtime`
/// yields `("records", "doc-1")`.
pub fn parse_room_id(path: &str, base_path: &str) -> Option<(String, String)> {
    let rest = path.strip_prefix(base_path)?;
    let rest = rest.strip_prefix('/')?;
    let rest = rest.split(['?', '#']).next().unwrap_or(rest);
    let mut segments = rest.splitn(2, '/');
    let room_type = segments.next().filter(|s| !s.is_empty())?;
    let record_id = segments.next().filter(|s| !s.is_empty())?;
    Some((percent_decode(room_type), percent_decode(record_id)))
}

/// Split a room id into `(room_type, record_id)` at the first colon.
pub fn split_room_id(room_id: &str) -> Option<(&str, &str)> {
    let (room_type, record_id) = room_id.split_once(':')?;
    if room_type.is_empty() || record_id.is_empty() {
        return None;
    }
    Some((room_type, record_id))
}

/// Percent-decode a path or query component, keeping the input on
/// malformed escapes.
fn percent_decode(input: &str) -> String {
    match urlencoding::decode(input) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => input.to_string(),
    }
}

/// Authenticates connections and resolves room permissions before a
/// client is allowed anywhere near a room.
pub struct ConnectionGateway {
    auth: Arc<dyn AuthService>,
    records: Arc<dyn RecordStore>,
}

impl ConnectionGateway {
    pub fn new(auth: Arc<dyn AuthService>, records: Arc<dyn RecordStore>) -> Self {
        Self { auth, records }
    }

    /// Resolve the extracted token to a user.
    pub async fn authenticate(&self, token: &ExtractedToken) -> Result<AuthUser, RealtimeError> {
        match self.auth.validate_session(&token.token).await {
            Some(user) => Ok(user),
            None => Err(RealtimeError::AuthenticationFailed(
                "invalid or expired session token".into(),
            )),
        }
    }

    /// Load the record and resolve the user's permissions on it.
    ///
    /// Returns `PermissionDenied` when the user cannot view the record —
    /// including when the record does not exist. The existence check runs
    /// here, against the record store, so it holds even when the host's
    /// permission policy is purely role-based.
    pub async fn authorize(
        &self,
        user: &AuthUser,
        record_id: &str,
    ) -> Result<Permissions, RealtimeError> {
        match self.records.get_record(record_id).await {
            Ok(Some(_)) => {}
            Ok(None) | Err(AccessError::RecordNotFound) => {
                return Err(RealtimeError::permission_denied(
                    "not permitted to view this record",
                ));
            }
            Err(AccessError::Backend(e)) => {
                log::error!("Record lookup failed for {record_id}: {e}");
                return Err(RealtimeError::permission_denied("permission check failed"));
            }
        }

        let can_view = self
            .check(user, ACTION_VIEW, record_id)
            .await?;
        if !can_view {
            return Err(RealtimeError::permission_denied(
                "not permitted to view this record",
            ));
        }
        let can_edit = self.check(user, ACTION_EDIT, record_id).await?;
        Ok(Permissions { can_view, can_edit })
    }

    async fn check(
        &self,
        user: &AuthUser,
        action: &str,
        record_id: &str,
    ) -> Result<bool, RealtimeError> {
        match self.auth.user_can(user, action, record_id).await {
            Ok(allowed) => Ok(allowed),
            Err(AccessError::RecordNotFound) => Err(RealtimeError::permission_denied(
                "not permitted to view this record",
            )),
            Err(AccessError::Backend(e)) => {
                log::error!("Permission check failed for user {}: {e}", user.id);
                Err(RealtimeError::permission_denied("permission check failed"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    pub(crate) struct StaticAuth {
        pub sessions: HashMap<String, AuthUser>,
        pub editable: bool,
        pub known_records: Vec<String>,
    }

    #[async_trait]
    impl AuthService for StaticAuth {
        async fn validate_session(&self, token: &str) -> Option<AuthUser> {
            self.sessions.get(token).cloned()
        }

        async fn user_can(
            &self,
            _user: &AuthUser,
            action: &str,
            record_id: &str,
        ) -> Result<bool, AccessError> {
            if !self.known_records.iter().any(|r| r == record_id) {
                return Err(AccessError::RecordNotFound);
            }
            Ok(action == ACTION_VIEW || self.editable)
        }
    }

    pub(crate) struct StaticRecords;

    #[async_trait]
    impl RecordStore for StaticRecords {
        async fn get_record(&self, record_id: &str) -> Result<Option<Record>, AccessError> {
            Ok(Some(Record {
                id: record_id.to_string(),
                content: "seed".into(),
            }))
        }
    }

    fn gateway(editable: bool) -> ConnectionGateway {
        let mut sessions = HashMap::new();
        sessions.insert(
            "good-token".to_string(),
            AuthUser {
                id: "u1".into(),
                username: "Alice".into(),
                role: "editor".into(),
            },
        );
        ConnectionGateway::new(
            Arc::new(StaticAuth {
                sessions,
                editable,
                known_records: vec!["doc-1".into()],
            }),
            Arc::new(StaticRecords),
        )
    }

    fn header_token(token: &str) -> ExtractedToken {
        ExtractedToken {
            token: token.to_string(),
            method: TokenMethod::Header,
            subprotocol: None,
        }
    }

    #[test]
    fn test_extract_token_precedence() {
        let protocols = vec!["auth.proto-token".to_string()];
        let extracted = extract_token(
            Some("Bearer header-token"),
            &protocols,
            Some("token=query-token"),
        )
        .unwrap();
        assert_eq!(extracted.token, "header-token");
        assert_eq!(extracted.method, TokenMethod::Header);

        let extracted = extract_token(None, &protocols, Some("token=query-token")).unwrap();
        assert_eq!(extracted.token, "proto-token");
        assert_eq!(extracted.method, TokenMethod::Subprotocol);
        assert_eq!(extracted.subprotocol.as_deref(), Some("auth.proto-token"));

        let extracted = extract_token(None, &[], Some("other=1&token=query-token")).unwrap();
        assert_eq!(extracted.token, "query-token");
        assert_eq!(extracted.method, TokenMethod::Query);

        assert!(extract_token(None, &[], None).is_none());
        assert!(extract_token(Some("Basic abc"), &[], None).is_none());
        assert!(extract_token(Some("Bearer "), &[], Some("token=")).is_none());
    }

    #[test]
    fn test_parse_room_id() {
        assert_eq!(
            parse_room_id("/realtime/records/doc-1", "/realtime"),
            Some(("records".to_string(), "doc-1".to_string()))
        );
        assert_eq!(
            parse_room_id("/realtime/records/doc%20one?token=x", "/realtime"),
            Some(("records".to_string(), "doc one".to_string()))
        );
        assert_eq!(
            parse_room_id("/realtime/records/100%25", "/realtime"),
            Some(("records".to_string(), "100%".to_string()))
        );
        assert_eq!(parse_room_id("/realtime/records", "/realtime"), None);
        assert_eq!(parse_room_id("/realtime/", "/realtime"), None);
        assert_eq!(parse_room_id("/other/records/doc-1", "/realtime"), None);
    }

    #[test]
    fn test_bare_subprotocol_token() {
        let long = "0123456789abcdef0123456789abcdef".to_string();
        let extracted = extract_token(None, std::slice::from_ref(&long), None).unwrap();
        assert_eq!(extracted.token, long);
        assert_eq!(extracted.method, TokenMethod::Subprotocol);

        // Too short, or dotted (a real protocol name), is not a token
        assert!(extract_token(None, &["short".to_string()], None).is_none());
        assert!(extract_token(None, &["graphql-ws.something-long-enough-here".to_string()], None)
            .is_none());
    }

    #[test]
    fn test_split_room_id() {
        assert_eq!(split_room_id("records:doc-1"), Some(("records", "doc-1")));
        assert_eq!(split_room_id("records:a:b"), Some(("records", "a:b")));
        assert_eq!(split_room_id("no-colon"), None);
        assert_eq!(split_room_id(":doc"), None);
        assert_eq!(split_room_id("records:"), None);
    }

    #[tokio::test]
    async fn test_authenticate_valid_token() {
        let gateway = gateway(true);
        let user = gateway.authenticate(&header_token("good-token")).await.unwrap();
        assert_eq!(user.id, "u1");
        assert_eq!(user.username, "Alice");
    }

    #[tokio::test]
    async fn test_authenticate_bad_token() {
        let gateway = gateway(true);
        let err = gateway.authenticate(&header_token("nope")).await.unwrap_err();
        assert!(matches!(err, RealtimeError::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn test_authorize_editor() {
        let gateway = gateway(true);
        let user = gateway.authenticate(&header_token("good-token")).await.unwrap();
        let perms = gateway.authorize(&user, "doc-1").await.unwrap();
        assert!(perms.can_view);
        assert!(perms.can_edit);
    }

    #[tokio::test]
    async fn test_authorize_viewer_only() {
        let gateway = gateway(false);
        let user = gateway.authenticate(&header_token("good-token")).await.unwrap();
        let perms = gateway.authorize(&user, "doc-1").await.unwrap();
        assert!(perms.can_view);
        assert!(!perms.can_edit);
    }

    #[tokio::test]
    async fn test_missing_record_masked_as_permission_denied() {
        let gateway = gateway(true);
        let user = gateway.authenticate(&header_token("good-token")).await.unwrap();
        let err = gateway.authorize(&user, "no-such-record").await.unwrap_err();
        assert!(matches!(err, RealtimeError::PermissionDenied { .. }));
    }

    /// A host policy that grants by role alone, with no record lookup.
    struct GrantAllAuth;

    #[async_trait]
    impl AuthService for GrantAllAuth {
        async fn validate_session(&self, _token: &str) -> Option<AuthUser> {
            Some(AuthUser {
                id: "u1".into(),
                username: "Alice".into(),
                role: "editor".into(),
            })
        }

        async fn user_can(
            &self,
            _user: &AuthUser,
            _action: &str,
            _record_id: &str,
        ) -> Result<bool, AccessError> {
            Ok(true)
        }
    }

    struct NoRecords;

    #[async_trait]
    impl RecordStore for NoRecords {
        async fn get_record(&self, _record_id: &str) -> Result<Option<Record>, AccessError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_record_existence_checked_even_with_role_only_policy() {
        let gateway = ConnectionGateway::new(Arc::new(GrantAllAuth), Arc::new(NoRecords));
        let user = gateway.authenticate(&header_token("any")).await.unwrap();

        // The permission policy grants everything, but the record store has
        // no such record; the gateway must still deny the join.
        let err = gateway.authorize(&user, "phantom").await.unwrap_err();
        assert!(matches!(err, RealtimeError::PermissionDenied { .. }));
    }
}
