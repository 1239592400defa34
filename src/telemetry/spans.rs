//! Span utilities and extension traits for request tracing.

use tracing::{info_span, Span};

use crate::ids::{ContextId, RequestId};

/// Extension trait for adding context to spans.
pub trait SpanExt {
    /// Record the result of an operation into the span.
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display;
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>)
    where
        E: std::fmt::Display,
    {
        match result {
            Ok(_) => {
                self.record("status", "ok");
            }
            Err(e) => {
                self.record("status", "error");
                self.record("error.message", e.to_string().as_str());
            }
        }
    }
}

/// Factory for standardized request spans.
pub struct RequestSpan;

impl RequestSpan {
    /// Create a request span.
    ///
    /// `status`, `error.message` and `latency_ms` are filled in when the
    /// request finishes.
    pub fn new(context_id: ContextId, request_id: RequestId, kind: &str) -> Span {
        info_span!(
            "ctx_request",
            context_id = context_id.0,
            request_id = request_id.0,
            kind = %kind,
            status = tracing::field::Empty,
            error.message = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    }
}
