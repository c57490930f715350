//! Observability for the termhost services.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`
//! - **Metrics**: counters, gauges and histograms with Prometheus export
//! - **Middleware**: axum middleware recording per-request metrics

pub mod logging;
pub mod metrics;
pub mod middleware;
