//! # Observability Module
//!
//! - **Structured Logging**: pretty or JSON logs through `tracing`
//! - **Prometheus Metrics**: HTTP, replication and search counters
//! - **Request Tracing**: request ID propagation on the HTTP API

mod logging;
mod metrics;
pub mod middleware;

pub use logging::{init_logging, LogFormat};
pub use metrics::MetricsState;
pub use middleware::{metrics_middleware, request_id_middleware, RequestId, REQUEST_ID_HEADER};
