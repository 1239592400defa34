//! Event transport boundary.
//!
//! The orchestrator never implements delivery itself; it hands stamped
//! events to an [`EventSink`]. Sinks must not block: `emit` is called from
//! engine threads, sometimes while a per-request ordering lock is held.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::ids::{ContextId, RequestId};

/// Recognized event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    Token,
    LoadProgress,
    Completion,
    EmbeddingResult,
    RerankResults,
    NativeLog,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::LoadProgress => "load_progress",
            Self::Completion => "completion",
            Self::EmbeddingResult => "embedding_result",
            Self::RerankResults => "rerank_results",
            Self::NativeLog => "native_log",
        }
    }
}

/// A named event with its payload.
///
/// `payload` always carries `contextId` (and `requestId` when known) when it
/// is a JSON object; the typed fields mirror those values for filtering.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub name: EventName,
    #[serde(skip)]
    pub context_id: Option<ContextId>,
    #[serde(skip)]
    pub request_id: Option<RequestId>,
    pub payload: Value,
}

impl Event {
    /// Build an event, stamping the ids into the payload.
    pub fn new(
        name: EventName,
        context_id: Option<ContextId>,
        request_id: Option<RequestId>,
        payload: Value,
    ) -> Self {
        let mut payload = match payload {
            Value::Object(map) => Value::Object(map),
            Value::Null => Value::Object(Default::default()),
            other => serde_json::json!({ "value": other }),
        };
        if let Value::Object(map) = &mut payload {
            if let Some(id) = context_id {
                map.insert("contextId".into(), Value::from(id.0));
            }
            if let Some(id) = request_id {
                map.insert("requestId".into(), Value::from(id.0));
            }
        }
        Self {
            name,
            context_id,
            request_id,
            payload,
        }
    }
}

/// Fire-and-forget event delivery.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

impl<F> EventSink for F
where
    F: Fn(Event) + Send + Sync,
{
    fn emit(&self, event: Event) {
        self(event)
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: Event) {}
}

/// Writes every event to the tracing subscriber at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: Event) {
        tracing::debug!(event = event.name.as_str(), payload = %event.payload, "event");
    }
}

/// Forwards events into an unbounded channel, preserving emit order.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<Event>,
}

impl ChannelSink {
    /// Create a sink and the stream that receives its events.
    pub fn new() -> (Self, EventStream) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, EventStream { receiver })
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: Event) {
        // Listener gone: delivery is best effort.
        let _ = self.sender.send(event);
    }
}

/// Receiving half of a [`ChannelSink`].
pub struct EventStream {
    receiver: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
    /// Receive the next event. `None` once every sink clone is dropped.
    pub async fn next(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    /// Take every event already delivered, without waiting.
    pub fn drain(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }

    /// Wait for the next event matching `pred`, discarding the others.
    pub async fn next_matching(&mut self, pred: impl Fn(&Event) -> bool) -> Option<Event> {
        while let Some(event) = self.next().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ids_stamped_into_payload() {
        let event = Event::new(
            EventName::Token,
            Some(ContextId(4)),
            Some(RequestId(2)),
            json!({ "token": "hi" }),
        );
        assert_eq!(event.payload["contextId"], 4);
        assert_eq!(event.payload["requestId"], 2);
        assert_eq!(event.payload["token"], "hi");
    }

    #[test]
    fn test_scalar_payload_is_wrapped() {
        let event = Event::new(EventName::LoadProgress, Some(ContextId(1)), None, json!(50));
        assert_eq!(event.payload, json!({ "value": 50, "contextId": 1 }));
    }

    #[test]
    fn test_channel_sink_preserves_order() {
        let (sink, mut stream) = ChannelSink::new();
        for i in 0..3 {
            sink.emit(Event::new(EventName::Token, None, None, json!({ "i": i })));
        }
        let seen: Vec<i64> = stream
            .drain()
            .iter()
            .map(|e| e.payload["i"].as_i64().unwrap())
            .collect();
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn test_closure_is_a_sink() {
        let count = std::sync::atomic::AtomicUsize::new(0);
        let sink = |_: Event| {
            count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        };
        sink.emit(Event::new(EventName::NativeLog, None, None, json!({})));
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
