//! Unified event bus — trait for emitting engine events from any module.
//!
//! The instance manager and template manager accept an `Arc<dyn EventSink>`
//! and emit one event per observable mutation. The monitoring subsystem's
//! services share this stream and nothing else.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use uuid::Uuid;

use crate::types::{EventType, JourneyEvent};

/// Trait for consuming engine events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: JourneyEvent);
}

/// No-op sink for tests and modules that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: JourneyEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<JourneyEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<JourneyEvent> {
        self.events.lock().expect("event bus mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().expect("event bus mutex poisoned").len()
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .expect("event bus mutex poisoned")
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().expect("event bus mutex poisoned").clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: JourneyEvent) {
        self.events.lock().expect("event bus mutex poisoned").push(event);
    }
}

/// Broadcasts each event to every attached sink, in registration order.
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: JourneyEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

/// Convenience builder for creating a `JourneyEvent` with minimal boilerplate.
pub fn make_event(
    event_type: EventType,
    instance_id: Option<Uuid>,
    definition_slug: Option<String>,
    step_slug: Option<String>,
    detail: serde_json::Value,
) -> JourneyEvent {
    JourneyEvent {
        event_id: Uuid::new_v4(),
        event_type,
        instance_id,
        definition_slug,
        step_slug,
        detail,
        timestamp: Utc::now(),
    }
}

/// Convenience: create a no-op event bus for modules that don't need it.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sink() {
        let sink = capture_sink();
        assert_eq!(sink.count(), 0);

        let id = Uuid::new_v4();
        sink.emit(make_event(
            EventType::InstanceCreated,
            Some(id),
            Some("lead-gen".into()),
            None,
            serde_json::json!({}),
        ));
        sink.emit(make_event(
            EventType::StepExecuted,
            Some(id),
            Some("lead-gen".into()),
            Some("discover-companies".into()),
            serde_json::json!({"attempt": 1}),
        ));

        assert_eq!(sink.count(), 2);
        assert_eq!(sink.count_type(EventType::InstanceCreated), 1);
        assert_eq!(sink.count_type(EventType::StepExecuted), 1);
        assert_eq!(sink.events()[1].step_slug.as_deref(), Some("discover-companies"));
    }

    #[test]
    fn test_fanout_reaches_every_sink() {
        let a = capture_sink();
        let b = capture_sink();
        let fanout = FanoutSink::new(vec![a.clone(), b.clone()]);

        fanout.emit(make_event(
            EventType::InstanceCompleted,
            Some(Uuid::new_v4()),
            None,
            None,
            serde_json::json!({}),
        ));

        assert_eq!(a.count(), 1);
        assert_eq!(b.count(), 1);
    }

    #[test]
    fn test_noop_sink() {
        let sink = noop_sink();
        // Should not panic
        sink.emit(make_event(
            EventType::InstanceFailed,
            None,
            None,
            None,
            serde_json::json!({}),
        ));
    }
}
