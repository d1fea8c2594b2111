//! Step-level debug tracing.
//!
//! A tracer holds at most one active session per instance. The session
//! carries breakpoints (step slugs); when the engine reaches one, the hook
//! captures the instance snapshot before the step executes. Ending a session
//! freezes its captures for later inspection.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use journey_core::error::{EngineError, EngineResult};
use journey_engine::DebugHook;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceLevel {
    /// Capture only at breakpoints.
    Breakpoints,
    /// Capture at every step.
    Full,
}

/// One state snapshot taken before a step ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedState {
    pub step_slug: String,
    pub snapshot: Value,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugLogEntry {
    pub message: String,
    pub detail: Value,
    pub logged_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugSession {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub breakpoints: Vec<String>,
    pub trace_level: TraceLevel,
    pub captured_states: Vec<CapturedState>,
    pub captured_logs: Vec<DebugLogEntry>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl DebugSession {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Debug hook implementation backed by per-instance sessions.
#[derive(Default)]
pub struct DebugTracer {
    sessions: DashMap<Uuid, DebugSession>,
}

impl DebugTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session for an instance. At most one active session per
    /// instance; a second attempt fails until the first is ended.
    pub fn start_session(
        &self,
        instance_id: Uuid,
        breakpoints: Vec<String>,
        trace_level: TraceLevel,
    ) -> EngineResult<DebugSession> {
        if let Some(existing) = self.sessions.get(&instance_id) {
            if existing.is_active() {
                return Err(EngineError::SessionActive(instance_id));
            }
        }
        let session = DebugSession {
            id: Uuid::new_v4(),
            instance_id,
            breakpoints,
            trace_level,
            captured_states: Vec::new(),
            captured_logs: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
        };
        info!(
            session_id = %session.id,
            instance_id = %instance_id,
            breakpoints = session.breakpoints.len(),
            "Started debug session"
        );
        self.sessions.insert(instance_id, session.clone());
        Ok(session)
    }

    pub fn get_session(&self, instance_id: Uuid) -> Option<DebugSession> {
        self.sessions.get(&instance_id).map(|r| r.clone())
    }

    /// Append a log line to the active session. No-op once ended.
    pub fn add_log(&self, instance_id: Uuid, message: &str, detail: Value) {
        if let Some(mut session) = self.sessions.get_mut(&instance_id) {
            if !session.is_active() {
                return;
            }
            session.captured_logs.push(DebugLogEntry {
                message: message.to_string(),
                detail,
                logged_at: Utc::now(),
            });
        }
    }

    /// Freeze the session. Further captures and logs are dropped.
    pub fn end_session(&self, instance_id: Uuid) -> EngineResult<DebugSession> {
        let mut session = self
            .sessions
            .get_mut(&instance_id)
            .ok_or_else(|| EngineError::NotFound(format!("debug session for {instance_id}")))?;
        if session.ended_at.is_none() {
            session.ended_at = Some(Utc::now());
            info!(
                session_id = %session.id,
                instance_id = %instance_id,
                captures = session.captured_states.len(),
                "Ended debug session"
            );
        }
        Ok(session.clone())
    }
}

impl DebugHook for DebugTracer {
    fn should_break(&self, instance_id: Uuid, step_slug: &str) -> bool {
        self.sessions
            .get(&instance_id)
            .map(|s| {
                s.is_active()
                    && (s.trace_level == TraceLevel::Full
                        || s.breakpoints.iter().any(|b| b == step_slug))
            })
            .unwrap_or(false)
    }

    fn capture(&self, instance_id: Uuid, step_slug: &str, snapshot: &Value) {
        if let Some(mut session) = self.sessions.get_mut(&instance_id) {
            if !session.is_active() {
                return;
            }
            session.captured_states.push(CapturedState {
                step_slug: step_slug.to_string(),
                snapshot: snapshot.clone(),
                captured_at: Utc::now(),
            });
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_one_active_session_per_instance() {
        let tracer = DebugTracer::new();
        let instance_id = Uuid::new_v4();

        tracer
            .start_session(instance_id, vec!["score".into()], TraceLevel::Breakpoints)
            .unwrap();
        let err = tracer
            .start_session(instance_id, vec![], TraceLevel::Full)
            .unwrap_err();
        assert!(matches!(err, EngineError::SessionActive(id) if id == instance_id));

        tracer.end_session(instance_id).unwrap();
        assert!(tracer
            .start_session(instance_id, vec![], TraceLevel::Full)
            .is_ok());
    }

    #[test]
    fn test_breakpoints_gate_capture() {
        let tracer = DebugTracer::new();
        let instance_id = Uuid::new_v4();
        tracer
            .start_session(instance_id, vec!["score".into()], TraceLevel::Breakpoints)
            .unwrap();

        assert!(tracer.should_break(instance_id, "score"));
        assert!(!tracer.should_break(instance_id, "enrich"));
        assert!(!tracer.should_break(Uuid::new_v4(), "score"));
    }

    #[test]
    fn test_full_trace_breaks_everywhere() {
        let tracer = DebugTracer::new();
        let instance_id = Uuid::new_v4();
        tracer
            .start_session(instance_id, vec![], TraceLevel::Full)
            .unwrap();

        assert!(tracer.should_break(instance_id, "score"));
        assert!(tracer.should_break(instance_id, "enrich"));
    }

    #[test]
    fn test_ended_session_is_frozen() {
        let tracer = DebugTracer::new();
        let instance_id = Uuid::new_v4();
        tracer
            .start_session(instance_id, vec![], TraceLevel::Full)
            .unwrap();

        tracer.capture(instance_id, "score", &json!({"state": "running"}));
        tracer.add_log(instance_id, "before end", json!({}));
        let ended = tracer.end_session(instance_id).unwrap();
        assert_eq!(ended.captured_states.len(), 1);
        assert_eq!(ended.captured_logs.len(), 1);

        // Captures after the end are dropped.
        assert!(!tracer.should_break(instance_id, "score"));
        tracer.capture(instance_id, "score", &json!({"state": "late"}));
        tracer.add_log(instance_id, "after end", json!({}));
        let session = tracer.get_session(instance_id).unwrap();
        assert_eq!(session.captured_states.len(), 1);
        assert_eq!(session.captured_logs.len(), 1);
    }
}
