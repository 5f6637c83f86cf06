// ============================================================================
// Request Context
// ============================================================================
//
// Per-request state threaded explicitly through the pipeline stages instead
// of being attached to a shared mutable request object. Each stage fills in
// its part: ingress sets the id and client address, the resolver sets the
// route and path parameters, the authenticator sets the user.
//
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::http::HeaderMap;

use crate::routing::Route;

/// Maximum length of a client-supplied `X-Request-ID` we will echo.
const MAX_REQUEST_ID_LEN: usize = 128;

/// Identity produced by the authenticator from a verified token.
#[derive(Debug, Clone)]
pub struct UserContext {
    pub subject: String,
    pub username: Option<String>,
    pub email: Option<String>,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub tier: Option<String>,
    pub issued_at: Option<i64>,
    pub expires_at: i64,
}

impl UserContext {
    /// Any-of role check: the user must hold at least one required role.
    pub fn has_any_role(&self, required: &[String]) -> bool {
        required.iter().any(|r| self.roles.contains(r))
    }

    /// Any-of permission check.
    pub fn has_any_permission(&self, required: &[String]) -> bool {
        required.iter().any(|p| self.permissions.contains(p))
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Unique per inbound request, echoed on every downstream and outbound
    /// header.
    pub request_id: String,
    pub started_at: Instant,
    pub client_ip: String,
    pub user: Option<UserContext>,
    pub route: Option<Arc<Route>>,
    /// Named parameters extracted by the resolver (`:id` segments).
    pub params: HashMap<String, String>,
    /// Free-form per-stage annotations, surfaced in logs.
    pub tags: HashMap<String, String>,
}

impl RequestContext {
    pub fn new(request_id: String, client_ip: String) -> Self {
        Self {
            request_id,
            started_at: Instant::now(),
            client_ip,
            user: None,
            route: None,
            params: HashMap::new(),
            tags: HashMap::new(),
        }
    }

    /// Rate-limit identity: the authenticated subject when present, the
    /// client address otherwise.
    pub fn identity(&self) -> String {
        match &self.user {
            Some(user) => format!("user:{}", user.subject),
            None => format!("ip:{}", self.client_ip),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }
}

/// Take the client-supplied `X-Request-ID` when it is well-formed (non-empty
/// printable ASCII, bounded length), otherwise generate a fresh identifier.
pub fn request_id_from_headers(headers: &HeaderMap) -> String {
    if let Some(value) = headers.get("x-request-id") {
        if let Ok(id) = value.to_str() {
            let id = id.trim();
            if !id.is_empty()
                && id.len() <= MAX_REQUEST_ID_LEN
                && id.chars().all(|c| c.is_ascii_graphic())
            {
                return id.to_string();
            }
        }
    }
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn echoes_well_formed_client_request_id() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("client-abc-123"));
        assert_eq!(request_id_from_headers(&headers), "client-abc-123");
    }

    #[test]
    fn generates_fresh_id_when_missing() {
        let headers = HeaderMap::new();
        let id = request_id_from_headers(&headers);
        assert!(uuid::Uuid::parse_str(&id).is_ok());
    }

    #[test]
    fn rejects_malformed_client_id() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", HeaderValue::from_static("has spaces in it"));
        let id = request_id_from_headers(&headers);
        assert_ne!(id, "has spaces in it");
        assert!(uuid::Uuid::parse_str(&id).is_ok());

        let mut headers = HeaderMap::new();
        let long = "x".repeat(200);
        headers.insert("x-request-id", HeaderValue::from_str(&long).unwrap());
        assert_ne!(request_id_from_headers(&headers), long);
    }

    #[test]
    fn identity_prefers_authenticated_subject() {
        let mut ctx = RequestContext::new("r1".into(), "10.0.0.9".into());
        assert_eq!(ctx.identity(), "ip:10.0.0.9");

        ctx.user = Some(UserContext {
            subject: "u-42".into(),
            username: None,
            email: None,
            roles: vec![],
            permissions: vec![],
            tier: None,
            issued_at: None,
            expires_at: 0,
        });
        assert_eq!(ctx.identity(), "user:u-42");
    }

    #[test]
    fn any_of_role_semantics() {
        let user = UserContext {
            subject: "u".into(),
            username: None,
            email: None,
            roles: vec!["viewer".into()],
            permissions: vec!["reports:read".into()],
            tier: None,
            issued_at: None,
            expires_at: 0,
        };
        assert!(user.has_any_role(&["admin".into(), "viewer".into()]));
        assert!(!user.has_any_role(&["admin".into(), "editor".into()]));
        assert!(user.has_any_permission(&["reports:read".into(), "reports:write".into()]));
    }
}
