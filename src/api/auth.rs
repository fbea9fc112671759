use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use subtle::ConstantTimeEq;

use super::error::ApiError;
use super::ratelimit::{LockScope, RateLimiter};

/// Expected `user:pass` credential plus the limiter guarding it.
#[derive(Debug, Clone)]
pub struct AuthGate {
    credential: String,
    limiter: Arc<RateLimiter>,
}

impl AuthGate {
    pub fn new(credential: impl Into<String>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            credential: credential.into(),
            limiter,
        }
    }
}

/// Constant-time credential comparison.
pub fn credential_matches(expected: &str, given: &str) -> bool {
    given.as_bytes().ct_eq(expected.as_bytes()).into()
}

/// Host part of `host:port`, `[v6]:port`, or a bare address.
fn strip_port(addr: &str) -> &str {
    let addr = addr.trim();
    if let Some(rest) = addr.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    let host = match addr.rsplit_once(':') {
        // More than one colon without brackets is a bare IPv6 address.
        Some((host, _)) if !host.contains(':') => host,
        _ => addr,
    };
    host.trim_matches(|c| c == '[' || c == ']')
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Address used to bucket failures: the first `X-Forwarded-For` entry,
/// else `X-Real-IP`, else the transport peer.
pub fn client_address(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(first) = header(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return strip_port(first).to_string();
    }
    if let Some(real_ip) = header(headers, "x-real-ip") {
        return real_ip.trim_matches(|c| c == '[' || c == ']').to_string();
    }
    peer.map(|addr| addr.ip().to_string()).unwrap_or_default()
}

fn peer_addr(req: &Request) -> Option<SocketAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0)
}

/// Decoded `user:pass` from a `Basic` Authorization header.
fn extract_basic(req: &Request) -> Option<String> {
    let value = req.headers().get("authorization")?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = BASE64.decode(token.trim()).ok()?;
    String::from_utf8(decoded).ok()
}

/// Basic-auth middleware.
///
/// 1. Reject locked-out sources (global lock first) with 429
/// 2. Missing or malformed header: 401, not counted as a failure
/// 3. Wrong credential: 401, counted
/// 4. Success clears the source's failure history
pub async fn require_basic_auth(
    gate: Arc<AuthGate>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let source = client_address(req.headers(), peer_addr(&req));

    if let Err(lock) = gate.limiter.check(&source) {
        match lock.scope {
            LockScope::Global => {
                tracing::warn!(%source, remaining = ?lock.remaining, "global lockout active, rejecting")
            }
            LockScope::Source => {
                tracing::warn!(%source, remaining = ?lock.remaining, "source locked out, rejecting")
            }
        }
        return Err(ApiError::TooManyAttempts(lock));
    }

    let Some(given) = extract_basic(&req) else {
        return Err(ApiError::AuthRequired);
    };

    if !credential_matches(&gate.credential, &given) {
        gate.limiter.record_failure(&source);
        return Err(ApiError::AuthFailed);
    }

    gate.limiter.record_success(&source);
    tracing::debug!(%source, "basic authentication succeeded");
    Ok(next.run(req).await)
}
