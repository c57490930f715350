//! HTTP and WebSocket front end for terminal sessions.
//!
//! - [`http_api`]: the axum router, shared state and the small JSON endpoints
//! - [`terminal_ws`]: the `/ws` transport adapter, one session per connection
//! - [`origin_validation`]: the upgrade-time origin allowlist check

pub mod http_api;
pub mod origin_validation;
pub mod terminal_ws;
