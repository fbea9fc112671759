use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use super::ratelimit::{LockScope, Lockout};

/// Challenge sent with every 401.
pub const WWW_AUTHENTICATE: &str = r#"Basic realm="webmux""#;

/// Errors returned by the HTTP layer.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message, plus whatever headers a client needs to
/// retry correctly.
#[derive(Debug)]
pub enum ApiError {
    /// 401 - Missing or malformed `Authorization` header.
    AuthRequired,
    /// 401 - Credentials did not match.
    AuthFailed,
    /// 429 - The source, or the whole service, is locked out.
    TooManyAttempts(Lockout),
    /// 403 - WebSocket upgrade from a foreign origin.
    OriginNotAllowed,
    /// 503 - `max_connections` sessions are already running.
    TooManyConnections,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::AuthRequired | ApiError::AuthFailed => StatusCode::UNAUTHORIZED,
            ApiError::TooManyAttempts(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::OriginNotAllowed => StatusCode::FORBIDDEN,
            ApiError::TooManyConnections => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::AuthRequired => "auth_required",
            ApiError::AuthFailed => "auth_failed",
            ApiError::TooManyAttempts(_) => "too_many_attempts",
            ApiError::OriginNotAllowed => "origin_not_allowed",
            ApiError::TooManyConnections => "too_many_connections",
        }
    }

    pub fn message(&self) -> String {
        match self {
            ApiError::AuthRequired => "Authentication required.".to_string(),
            ApiError::AuthFailed => "Authorization failed.".to_string(),
            ApiError::TooManyAttempts(lock) => match lock.scope {
                LockScope::Global => {
                    "Too many failed login attempts. Service temporarily locked.".to_string()
                }
                LockScope::Source => {
                    "Too many failed login attempts. Try again later.".to_string()
                }
            },
            ApiError::OriginNotAllowed => "WebSocket origin not allowed.".to_string(),
            ApiError::TooManyConnections => {
                "Too many connections. Try again shortly.".to_string()
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        let mut response = (self.status_code(), Json(body)).into_response();
        let headers = response.headers_mut();
        match &self {
            ApiError::AuthRequired | ApiError::AuthFailed => {
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static(WWW_AUTHENTICATE),
                );
            }
            ApiError::TooManyAttempts(lock) => {
                headers.insert(header::RETRY_AFTER, HeaderValue::from(lock.retry_after_secs()));
            }
            _ => {}
        }
        response
    }
}
