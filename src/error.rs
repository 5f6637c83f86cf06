// ============================================================================
// Gateway Error Taxonomy
// ============================================================================
//
// Every failure the pipeline can surface is an enum variant here. Each
// variant knows its HTTP status and its stable error code; the normalized
// envelope sent to clients is produced by a single mapper
// (`GatewayError::into_envelope`) which fills in the request id and
// timestamp. Mapping an already-mapped error returns it unchanged, so the
// mapper can sit at the very edge of the pipeline without double-wrapping.
//
// ============================================================================

use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Error, Debug)]
pub enum GatewayError {
    // ===== Routing =====
    #[error("no route matched {method} {path}")]
    RouteNotFound { method: String, path: String },

    // ===== Authentication & Authorization =====
    #[error("authorization header is missing")]
    MissingToken,

    #[error("token is invalid: {0}")]
    InvalidToken(String),

    #[error("token has expired")]
    TokenExpired,

    #[error("token is not yet active")]
    TokenNotActive,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("authentication is required for this resource")]
    AuthenticationRequired,

    #[error("caller does not hold any of the required roles or permissions")]
    InsufficientPermissions { required: Vec<String> },

    // ===== Rate Limiting =====
    #[error("rate limit exceeded for tier {tier}")]
    RateLimitExceeded {
        tier: String,
        limit: i64,
        reset_epoch_secs: i64,
    },

    // ===== Upstream Dispatch =====
    #[error("circuit breaker is open for {service}")]
    CircuitOpen { service: String },

    #[error("upstream {service} refused the connection")]
    ServiceUnavailable { service: String },

    #[error("upstream {service} timed out")]
    GatewayTimeout { service: String },

    #[error("upstream {service} returned status {status}")]
    UpstreamError { service: String, status: u16 },

    #[error("bad gateway: {message}")]
    BadGateway { service: String, message: String },

    // ===== Admission =====
    #[error("{0}")]
    Validation(String),

    #[error("request URI exceeds {0} bytes")]
    UriTooLong(usize),

    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("method {0} is not supported by this gateway")]
    MethodNotAllowed(String),

    // ===== Everything else =====
    #[error("internal server error: {0}")]
    Internal(String),

    /// An error that already went through the mapper. Carried so a second
    /// mapping pass is a no-op.
    #[error("{}", .0.message)]
    Mapped(ErrorEnvelope),
}

impl GatewayError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::MissingToken
            | GatewayError::InvalidToken(_)
            | GatewayError::TokenExpired
            | GatewayError::TokenNotActive
            | GatewayError::AuthFailed(_)
            | GatewayError::AuthenticationRequired => StatusCode::UNAUTHORIZED,
            GatewayError::InsufficientPermissions { .. } => StatusCode::FORBIDDEN,
            GatewayError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::CircuitOpen { .. } | GatewayError::ServiceUnavailable { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::GatewayTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            // 5xx from upstream collapses to 502, client errors are forwarded
            GatewayError::UpstreamError { status, .. } => {
                if *status >= 500 {
                    StatusCode::BAD_GATEWAY
                } else {
                    StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
                }
            }
            GatewayError::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::UriTooLong(_) => StatusCode::URI_TOO_LONG,
            GatewayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Mapped(env) => {
                StatusCode::from_u16(env.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// Stable error code for programmatic handling.
    pub fn error_code(&self) -> &str {
        match self {
            GatewayError::RouteNotFound { .. } => "ROUTE_NOT_FOUND",
            GatewayError::MissingToken => "MISSING_TOKEN",
            GatewayError::InvalidToken(_) => "INVALID_TOKEN",
            GatewayError::TokenExpired => "TOKEN_EXPIRED",
            GatewayError::TokenNotActive => "TOKEN_NOT_ACTIVE",
            GatewayError::AuthFailed(_) => "AUTH_FAILED",
            GatewayError::AuthenticationRequired => "AUTHENTICATION_REQUIRED",
            GatewayError::InsufficientPermissions { .. } => "INSUFFICIENT_PERMISSIONS",
            GatewayError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            GatewayError::CircuitOpen { .. } => "CIRCUIT_BREAKER_OPEN",
            GatewayError::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
            GatewayError::GatewayTimeout { .. } => "GATEWAY_TIMEOUT",
            GatewayError::UpstreamError { .. } => "UPSTREAM_ERROR",
            GatewayError::BadGateway { .. } => "BAD_GATEWAY",
            GatewayError::Validation(_) => "VALIDATION_ERROR",
            GatewayError::UriTooLong(_) => "URI_TOO_LONG",
            GatewayError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            GatewayError::MethodNotAllowed(_) => "METHOD_NOT_ALLOWED",
            GatewayError::Internal(_) => "INTERNAL_SERVER_ERROR",
            GatewayError::Mapped(env) => &env.error,
        }
    }

    /// Structured details for the envelope, when the variant carries any.
    fn details(&self) -> Option<serde_json::Value> {
        match self {
            GatewayError::RouteNotFound { method, path } => {
                Some(json!({ "method": method, "path": path }))
            }
            GatewayError::InsufficientPermissions { required } => {
                Some(json!({ "required": required }))
            }
            GatewayError::RateLimitExceeded {
                tier,
                limit,
                reset_epoch_secs,
            } => Some(json!({ "tier": tier, "limit": limit, "resetTime": reset_epoch_secs })),
            GatewayError::CircuitOpen { service }
            | GatewayError::ServiceUnavailable { service }
            | GatewayError::GatewayTimeout { service } => Some(json!({ "service": service })),
            GatewayError::UpstreamError { service, status } => {
                Some(json!({ "service": service, "upstreamStatus": status }))
            }
            GatewayError::BadGateway { service, .. } => Some(json!({ "service": service })),
            _ => None,
        }
    }

    /// Log with a level appropriate to the failure class.
    pub fn log(&self, request_id: &str) {
        let status = self.status_code();
        let code = self.error_code();

        if status.is_server_error() {
            tracing::error!(
                error = %self,
                error_code = %code,
                status = status.as_u16(),
                request_id = %request_id,
                "request failed"
            );
        } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            tracing::warn!(
                error = %self,
                error_code = %code,
                request_id = %request_id,
                "request rejected"
            );
        } else {
            tracing::debug!(
                error = %self,
                error_code = %code,
                status = status.as_u16(),
                request_id = %request_id,
                "client error"
            );
        }
    }

    /// The single error mapper. Fills in `requestId` and the UTC timestamp,
    /// elides internal detail in production, and is idempotent: an error
    /// that was already mapped passes through unchanged.
    pub fn into_envelope(self, request_id: &str, production: bool) -> ErrorEnvelope {
        if let GatewayError::Mapped(envelope) = self {
            return envelope;
        }

        self.log(request_id);

        let status = self.status_code();
        let message = if production && status.is_server_error() {
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        ErrorEnvelope {
            status: status.as_u16(),
            error: self.error_code().to_string(),
            message,
            details: self.details(),
            request_id: request_id.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        }
    }
}

impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

/// The normalized error body every failed request carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(skip)]
    pub status: u16,
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub timestamp: String,
}

impl IntoResponse for ErrorEnvelope {
    fn into_response(self) -> axum::response::Response {
        let status =
            StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, axum::Json(self)).into_response()
    }
}
