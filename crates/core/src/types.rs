use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A journey definition: a named, versioned state machine with an ordered
/// step sequence. Immutable once published; updates create a new version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyDefinition {
    pub id: Uuid,
    pub slug: String,
    pub version: u32,
    pub initial_state: String,
    pub states: Vec<String>,
    pub transitions: Vec<TransitionRule>,
    pub steps: Vec<StepRef>,
    pub default_config: serde_json::Value,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
}

impl JourneyDefinition {
    /// Returns the matching transition edge, if the table permits it.
    pub fn find_transition(&self, from: &str, to: &str, trigger: &str) -> Option<&TransitionRule> {
        self.transitions
            .iter()
            .find(|t| t.from == from && t.to == to && t.trigger == trigger)
    }

    /// Returns the edge leaving `from` on `trigger`, regardless of target.
    pub fn transition_for_trigger(&self, from: &str, trigger: &str) -> Option<&TransitionRule> {
        self.transitions
            .iter()
            .find(|t| t.from == from && t.trigger == trigger)
    }

    pub fn step(&self, slug: &str) -> Option<&StepRef> {
        self.steps.iter().find(|s| s.slug == slug)
    }
}

/// A directed edge in a definition's transition table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRule {
    pub from: String,
    pub to: String,
    pub trigger: String,
}

/// One entry in a definition's ordered step sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRef {
    pub slug: String,
    pub step_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
    pub position: u32,
}

/// Runtime status of a journey instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled
        )
    }
}

/// One running execution of a journey definition. Mutated only while the
/// instance lock is held, except for the cancellation flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyInstance {
    pub id: Uuid,
    pub definition_id: Uuid,
    pub definition_slug: String,
    pub status: InstanceStatus,
    pub current_state: String,
    pub context: serde_json::Value,
    pub priority: i32,
    pub locked_until: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    pub wake_at: Option<DateTime<Utc>>,
    pub current_step: usize,
    pub state_history: Vec<StateHistoryEntry>,
    pub results: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only audit row recording one state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateHistoryEntry {
    pub from: String,
    pub to: String,
    pub trigger: String,
    pub trigger_data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Coarse classification of step types; drives the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepCategory {
    Discovery,
    Enrichment,
    Scoring,
    Outreach,
    ControlFlow,
}

impl StepCategory {
    /// Control-flow steps must not be re-run on timeout; everything else may.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, StepCategory::ControlFlow)
    }
}

/// Catalog entry describing a step type and its execution defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTypeDef {
    pub slug: String,
    pub category: StepCategory,
    pub executor_type: String,
    #[serde(default)]
    pub default_config: serde_json::Value,
    pub default_timeout_ms: u64,
    #[serde(default)]
    pub max_retries: u32,
    pub is_system: bool,
}

/// Kinds of events the engine emits while driving instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    InstanceCreated,
    InstanceStarted,
    StateTransitioned,
    StepExecuted,
    StepFailed,
    InstanceCompleted,
    InstanceFailed,
    InstanceCancelled,
    TemplateInstantiated,
    MemoryDecayed,
    DebugCaptured,
}

impl EventType {
    /// Stable label used for counter keys and log fields.
    pub fn label(&self) -> &'static str {
        match self {
            EventType::InstanceCreated => "instance_created",
            EventType::InstanceStarted => "instance_started",
            EventType::StateTransitioned => "state_transitioned",
            EventType::StepExecuted => "step_executed",
            EventType::StepFailed => "step_failed",
            EventType::InstanceCompleted => "instance_completed",
            EventType::InstanceFailed => "instance_failed",
            EventType::InstanceCancelled => "instance_cancelled",
            EventType::TemplateInstantiated => "template_instantiated",
            EventType::MemoryDecayed => "memory_decayed",
            EventType::DebugCaptured => "debug_captured",
        }
    }
}

/// One event on the stream shared by the monitoring subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JourneyEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub instance_id: Option<Uuid>,
    pub definition_slug: Option<String>,
    pub step_slug: Option<String>,
    pub detail: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate statistics for a single definition's instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionStats {
    pub definition_slug: String,
    pub total_created: u64,
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub avg_completion_time_secs: f64,
}
