//! Telemetry: structured logging, request spans and metrics.
//!
//! Metrics go through the `metrics` facade; without an installed recorder
//! they are no-ops.

mod logging;
mod metrics;
mod spans;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use self::metrics::{
    record_context_created, record_context_released, record_request_accepted,
    record_request_finished, record_request_rejected, set_active_contexts,
};
pub use spans::{RequestSpan, SpanExt};
