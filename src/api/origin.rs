use axum::{extract::Request, http::HeaderMap, middleware::Next, response::Response};

use super::error::ApiError;

/// Origins a browser on this machine uses for a server bound to `port`.
pub fn loopback_origins(port: u16) -> Vec<String> {
    vec![
        format!("http://127.0.0.1:{}", port),
        format!("http://localhost:{}", port),
        format!("http://[::1]:{}", port),
    ]
}

fn is_ws_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Cross-site WebSocket hijacking guard for servers running without a
/// credential.
///
/// - Non-WebSocket requests pass through
/// - No `Origin` header (curl, scripts) passes through
/// - An `Origin` in the allowed list passes through
/// - Anything else is rejected with 403
pub async fn check_ws_origin(
    allowed_origins: Vec<String>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !is_ws_upgrade(req.headers()) {
        return Ok(next.run(req).await);
    }

    let origin = match req.headers().get("origin").and_then(|v| v.to_str().ok()) {
        None => return Ok(next.run(req).await),
        Some(o) => o.trim_end_matches('/').to_string(),
    };

    if allowed_origins
        .iter()
        .any(|allowed| allowed.trim_end_matches('/').eq_ignore_ascii_case(&origin))
    {
        return Ok(next.run(req).await);
    }

    tracing::warn!(%origin, "rejecting websocket upgrade from foreign origin");
    Err(ApiError::OriginNotAllowed)
}
