// ============================================================================
// Authenticator
// ============================================================================
//
// Signed-token verification against a process-wide HS256 secret. Produces a
// UserContext from the claim set; the subject falls back through
// sub -> userId -> id to accommodate tokens minted by older issuers.
//
// Two modes: required (missing/invalid tokens fail the request with a
// specific 401 code) and optional (failures attach no user and the pipeline
// proceeds).
//
// ============================================================================

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::JwtConfig;
use crate::context::UserContext;
use crate::error::{GatewayError, GatewayResult};
use crate::routing::Route;

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    pub exp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
}

/// Claim overrides for the development token-minting endpoint and tests.
#[derive(Debug, Default, Deserialize)]
pub struct TokenRequest {
    pub subject: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub tier: Option<String>,
    /// Seconds until expiry; the configured default when absent. Negative
    /// values mint an already-expired token, which tests rely on.
    #[serde(default, rename = "expiresInSecs", alias = "expires_in_secs")]
    pub expires_in_secs: Option<i64>,
    /// Seconds until the token becomes active (`nbf`).
    #[serde(default, rename = "notBeforeSecs", alias = "not_before_secs")]
    pub not_before_secs: Option<i64>,
}

pub struct AuthManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    default_expiry_secs: i64,
}

impl AuthManager {
    pub fn new(config: &JwtConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
            default_expiry_secs: config.expiry_secs,
        }
    }

    /// Mint a signed token. Production deployments only reach this through
    /// tests; the admin endpoint that exposes it is development-only.
    pub fn mint_token(&self, request: &TokenRequest) -> GatewayResult<String> {
        let now = Utc::now().timestamp();
        let expiry = request.expires_in_secs.unwrap_or(self.default_expiry_secs);

        let claims = Claims {
            sub: Some(request.subject.clone()),
            user_id: None,
            id: None,
            username: request.username.clone(),
            email: request.email.clone(),
            roles: request.roles.clone(),
            permissions: request.permissions.clone(),
            tier: request.tier.clone(),
            iat: Some(now),
            nbf: request.not_before_secs.map(|secs| now + secs),
            exp: now + expiry,
            jti: Some(uuid::Uuid::new_v4().to_string()),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| GatewayError::Internal(format!("failed to sign token: {}", e)))
    }

    /// Verify signature and time claims, then build the user context.
    pub fn verify_token(&self, token: &str) -> GatewayResult<UserContext> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => GatewayError::TokenExpired,
                ErrorKind::ImmatureSignature => GatewayError::TokenNotActive,
                ErrorKind::InvalidSignature
                | ErrorKind::InvalidToken
                | ErrorKind::Base64(_)
                | ErrorKind::Json(_)
                | ErrorKind::Utf8(_) => GatewayError::InvalidToken(e.to_string()),
                _ => GatewayError::AuthFailed(e.to_string()),
            }
        })?;

        user_context_from_claims(data.claims)
    }

    /// Run the authenticator in the mode the route asks for. In optional
    /// mode a missing or bad credential attaches no user and never errors.
    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        required: bool,
    ) -> GatewayResult<Option<UserContext>> {
        let credential = match bearer_credential(headers) {
            Some(credential) => credential,
            None => {
                return if required {
                    Err(GatewayError::MissingToken)
                } else {
                    Ok(None)
                };
            }
        };

        match self.verify_token(&credential) {
            Ok(user) => Ok(Some(user)),
            Err(err) if required => Err(err),
            Err(err) => {
                tracing::debug!(error = %err, "optional auth: ignoring invalid credential");
                Ok(None)
            }
        }
    }
}

/// Role/permission gate for routes that configure required sets. Any-of
/// semantics: holding one required role (or one required permission, when
/// only permissions are configured) is enough.
pub fn authorize(route: &Route, user: Option<&UserContext>) -> GatewayResult<()> {
    if route.required_roles.is_empty() && route.required_permissions.is_empty() {
        return Ok(());
    }

    let user = user.ok_or(GatewayError::AuthenticationRequired)?;

    let role_ok = route.required_roles.is_empty() || user.has_any_role(&route.required_roles);
    let permission_ok = route.required_permissions.is_empty()
        || user.has_any_permission(&route.required_permissions);

    if role_ok && permission_ok {
        Ok(())
    } else {
        let mut required = route.required_roles.clone();
        required.extend(route.required_permissions.iter().cloned());
        Err(GatewayError::InsufficientPermissions { required })
    }
}

/// Accepts both `Bearer <token>` and a bare token value.
fn bearer_credential(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.strip_prefix("Bearer ") {
        Some(token) => Some(token.trim().to_string()),
        None => Some(raw.to_string()),
    }
}

fn user_context_from_claims(claims: Claims) -> GatewayResult<UserContext> {
    let subject = claims
        .sub
        .or(claims.user_id)
        .or(claims.id)
        .ok_or_else(|| GatewayError::AuthFailed("token carries no subject claim".into()))?;

    Ok(UserContext {
        subject,
        username: claims.username,
        email: claims.email,
        roles: claims.roles,
        permissions: claims.permissions,
        tier: claims.tier,
        issued_at: claims.iat,
        expires_at: claims.exp,
    })
}
