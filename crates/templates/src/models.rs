use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use journey_core::types::{JourneyDefinition, JourneyInstance, StepRef, TransitionRule};

/// The journey definition embedded in a template version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionPayload {
    pub initial_state: String,
    pub states: Vec<String>,
    pub transitions: Vec<TransitionRule>,
    pub steps: Vec<StepRef>,
    #[serde(default)]
    pub default_config: serde_json::Value,
}

/// Request payload for creating a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSpec {
    pub slug: String,
    pub name: String,
    pub vertical_slug: String,
    pub definition: DefinitionPayload,
    #[serde(default)]
    pub is_system: bool,
}

/// One immutable version of a template. Exactly one version per slug is
/// flagged `is_latest` at any time.
///
/// `id` names this version row; `template_id` names the template itself and
/// is shared by every version of the slug, so lineage and bindings survive
/// version bumps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateVersion {
    pub id: Uuid,
    pub template_id: Uuid,
    pub slug: String,
    pub name: String,
    pub version: u32,
    pub is_latest: bool,
    pub vertical_slug: String,
    pub definition: DefinitionPayload,
    pub is_system: bool,
    pub authored_by: String,
    pub created_at: DateTime<Utc>,
}

/// How a template is attached to a vertical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingType {
    Default,
    Custom,
}

/// Links a template to a vertical; `priority` disambiguates when several
/// templates bind to the same vertical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerticalBinding {
    pub id: Uuid,
    pub template_id: Uuid,
    pub vertical_slug: String,
    pub binding_type: BindingType,
    pub priority: i32,
    pub auto_start: bool,
    pub created_at: DateTime<Utc>,
}

/// Lineage edge recorded when a template is cloned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloneRecord {
    pub id: Uuid,
    pub source_template_id: Uuid,
    pub new_template_id: Uuid,
    pub reason: String,
    pub cloned_by: String,
    pub cloned_at: DateTime<Utc>,
}

/// Result of instantiating a template: the instance, the materialized
/// definition it runs on, and the context enriched with provenance.
#[derive(Debug, Clone)]
pub struct Instantiation {
    pub instance: JourneyInstance,
    pub definition: JourneyDefinition,
    pub personalized_context: serde_json::Value,
}
