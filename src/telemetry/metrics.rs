//! Metric names and recording helpers.

use std::time::Duration;

use ::metrics::{counter, gauge, histogram};

pub const REQUESTS_ACCEPTED: &str = "gg_ctx_requests_accepted_total";
pub const REQUESTS_REJECTED: &str = "gg_ctx_requests_rejected_total";
pub const REQUESTS_FINISHED: &str = "gg_ctx_requests_finished_total";
pub const REQUEST_DURATION: &str = "gg_ctx_request_duration_seconds";
pub const CONTEXTS_CREATED: &str = "gg_ctx_contexts_created_total";
pub const CONTEXTS_RELEASED: &str = "gg_ctx_contexts_released_total";
pub const CONTEXTS_ACTIVE: &str = "gg_ctx_contexts_active";

pub fn record_request_accepted(kind: &'static str) {
    counter!(REQUESTS_ACCEPTED, "kind" => kind).increment(1);
}

/// `reason` is an error kind label.
pub fn record_request_rejected(reason: &'static str) {
    counter!(REQUESTS_REJECTED, "reason" => reason).increment(1);
}

pub fn record_request_finished(kind: &'static str, status: &'static str, elapsed: Duration) {
    counter!(REQUESTS_FINISHED, "status" => status).increment(1);
    histogram!(REQUEST_DURATION, "kind" => kind).record(elapsed.as_secs_f64());
}

pub fn record_context_created() {
    counter!(CONTEXTS_CREATED).increment(1);
}

pub fn record_context_released() {
    counter!(CONTEXTS_RELEASED).increment(1);
}

pub fn set_active_contexts(count: usize) {
    gauge!(CONTEXTS_ACTIVE).set(count as f64);
}
