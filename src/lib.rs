//! GG-CTX: orchestration of native inference contexts.
//!
//! Each context wraps one loaded model behind an [`engine::EngineHandle`].
//! The orchestrator keeps them in a bounded registry, runs every blocking
//! engine call on a worker pool, correlates streamed partials and final
//! results back to callers, and tears contexts down only after their
//! in-flight work has drained.
//!
//! # Guarantees
//!
//! - At most one non-queued request runs per context at a time.
//! - Every admitted request resolves exactly once.
//! - All partials of a request reach the event sink before its final event.
//! - Engine resources are released only after the context has drained.

pub mod cancel;
pub mod cli;
pub mod config;
pub mod context;
pub mod correlator;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod ids;
pub mod orchestrator;
pub mod registry;
pub mod request;
pub mod scheduler;
pub mod shutdown;
pub mod teardown;
pub mod telemetry;

pub use config::OrchestratorConfig;
pub use context::{ContextInfo, ContextState};
pub use dispatch::RequestHandle;
pub use error::{OrchestratorError, Result};
pub use events::{ChannelSink, Event, EventName, EventSink, EventStream, LogSink, NullSink};
pub use ids::{ContextId, RequestId, TaskId};
pub use orchestrator::{ContextStatus, Orchestrator, OrchestratorStatus};
pub use request::{RequestKind, RequestOutput, RequestPayload, RequestResponse, RequestStatus};
pub use shutdown::{ShutdownResult, ShutdownState};
