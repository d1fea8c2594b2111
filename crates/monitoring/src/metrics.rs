//! Metrics recorder — an event sink that aggregates engine events into
//! in-process counters and forwards them to the `metrics` facade.

use std::collections::HashMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use journey_core::event_bus::EventSink;
use journey_core::types::{EventType, JourneyEvent};

/// Aggregated view of everything recorded so far.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub events_by_type: HashMap<String, u64>,
    pub events_by_definition: HashMap<String, u64>,
    pub step_failures_by_step: HashMap<String, u64>,
}

/// Consumes the engine event stream and keeps running counters.
#[derive(Default)]
pub struct MetricsRecorder {
    by_type: DashMap<String, u64>,
    by_definition: DashMap<String, u64>,
    step_failures: DashMap<String, u64>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_for(&self, event_type: EventType) -> u64 {
        self.by_type
            .get(event_type.label())
            .map(|r| *r.value())
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events_by_type: self
                .by_type
                .iter()
                .map(|r| (r.key().clone(), *r.value()))
                .collect(),
            events_by_definition: self
                .by_definition
                .iter()
                .map(|r| (r.key().clone(), *r.value()))
                .collect(),
            step_failures_by_step: self
                .step_failures
                .iter()
                .map(|r| (r.key().clone(), *r.value()))
                .collect(),
        }
    }
}

impl EventSink for MetricsRecorder {
    fn emit(&self, event: JourneyEvent) {
        let label = event.event_type.label();
        *self.by_type.entry(label.to_string()).or_insert(0) += 1;
        metrics::counter!("journey.events", "type" => label).increment(1);

        if let Some(slug) = &event.definition_slug {
            *self.by_definition.entry(slug.clone()).or_insert(0) += 1;
        }
        if event.event_type == EventType::StepFailed {
            if let Some(step) = &event.step_slug {
                *self.step_failures.entry(step.clone()).or_insert(0) += 1;
            }
        }
    }
}
