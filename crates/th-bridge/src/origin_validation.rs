//! WebSocket Origin header validation.
//!
//! Browsers do not apply CORS to WebSocket connections; they only send the
//! Origin header and leave the decision to the server. Upgrades are rejected
//! here, before any terminal session is created, unless the Origin is one of
//! the configured values.

use axum::http::{header, HeaderMap, StatusCode};

/// Check the Origin header of an upgrade request against `allowed_origins`.
///
/// Matching is exact and case-sensitive: scheme, host and port must all be
/// listed. A missing or non-UTF-8 Origin is rejected.
pub fn validate_websocket_origin(
    headers: &HeaderMap,
    allowed_origins: &[String],
) -> Result<(), StatusCode> {
    let origin = headers
        .get(header::ORIGIN)
        .ok_or(StatusCode::FORBIDDEN)?
        .to_str()
        .map_err(|_| StatusCode::FORBIDDEN)?;

    if allowed_origins.iter().any(|allowed| allowed == origin) {
        Ok(())
    } else {
        Err(StatusCode::FORBIDDEN)
    }
}
