//! Definition registry — CRUD over versioned journey definitions.
//!
//! Definitions are immutable once published: `update` appends version N+1
//! under the same slug, it never rewrites a row. System-owned definitions
//! cannot be updated at all.

use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use journey_core::config::ConfigResolver;
use journey_core::error::{EngineError, EngineResult};
use journey_core::types::{JourneyDefinition, StepRef, TransitionRule};

/// Request payload for authoring a new definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionSpec {
    pub slug: String,
    pub initial_state: String,
    pub states: Vec<String>,
    pub transitions: Vec<TransitionRule>,
    pub steps: Vec<StepRef>,
    #[serde(default)]
    pub default_config: Value,
    #[serde(default)]
    pub is_system: bool,
}

/// Partial update applied when creating a new version.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefinitionPatch {
    pub initial_state: Option<String>,
    pub states: Option<Vec<String>>,
    pub transitions: Option<Vec<TransitionRule>>,
    pub steps: Option<Vec<StepRef>>,
    pub default_config: Option<Value>,
}

pub struct DefinitionRegistry {
    // All versions per slug, oldest first; the last element is current.
    definitions: DashMap<String, Vec<JourneyDefinition>>,
    resolver: Arc<ConfigResolver>,
}

impl DefinitionRegistry {
    pub fn new(resolver: Arc<ConfigResolver>) -> Self {
        Self {
            definitions: DashMap::new(),
            resolver,
        }
    }

    /// Validate and persist version 1 of a new definition.
    pub fn create(&self, spec: DefinitionSpec) -> EngineResult<JourneyDefinition> {
        let definition = JourneyDefinition {
            id: Uuid::new_v4(),
            slug: spec.slug,
            version: 1,
            initial_state: spec.initial_state,
            states: spec.states,
            transitions: spec.transitions,
            steps: spec.steps,
            default_config: spec.default_config,
            is_system: spec.is_system,
            created_at: Utc::now(),
        };
        validate(&definition)?;

        match self.definitions.entry(definition.slug.clone()) {
            Entry::Occupied(_) => Err(EngineError::SlugConflict(definition.slug)),
            Entry::Vacant(slot) => {
                info!(slug = %definition.slug, "Created journey definition");
                self.resolver
                    .register(definition.slug.clone(), definition.default_config.clone());
                slot.insert(vec![definition.clone()]);
                Ok(definition)
            }
        }
    }

    /// Latest version of the definition.
    pub fn get(&self, slug: &str) -> EngineResult<JourneyDefinition> {
        self.definitions
            .get(slug)
            .and_then(|versions| versions.last().cloned())
            .ok_or_else(|| EngineError::NotFound(format!("definition '{slug}'")))
    }

    pub fn get_version(&self, slug: &str, version: u32) -> EngineResult<JourneyDefinition> {
        self.definitions
            .get(slug)
            .and_then(|versions| versions.iter().find(|d| d.version == version).cloned())
            .ok_or_else(|| EngineError::NotFound(format!("definition '{slug}' v{version}")))
    }

    pub fn get_by_id(&self, id: Uuid) -> EngineResult<JourneyDefinition> {
        self.definitions
            .iter()
            .find_map(|entry| entry.value().iter().find(|d| d.id == id).cloned())
            .ok_or_else(|| EngineError::NotFound(format!("definition {id}")))
    }

    pub fn list(&self) -> Vec<JourneyDefinition> {
        let mut latest: Vec<JourneyDefinition> = self
            .definitions
            .iter()
            .filter_map(|entry| entry.value().last().cloned())
            .collect();
        latest.sort_by(|a, b| a.slug.cmp(&b.slug));
        latest
    }

    /// Append a new version with `patch` applied on top of the current one.
    /// System definitions are immutable.
    pub fn update(&self, slug: &str, patch: DefinitionPatch) -> EngineResult<JourneyDefinition> {
        let mut entry = self
            .definitions
            .get_mut(slug)
            .ok_or_else(|| EngineError::NotFound(format!("definition '{slug}'")))?;

        let current = entry.last().expect("definition slug with no versions");
        if current.is_system {
            return Err(EngineError::ImmutableDefinition(slug.to_string()));
        }

        let next = JourneyDefinition {
            id: Uuid::new_v4(),
            slug: current.slug.clone(),
            version: current.version + 1,
            initial_state: patch.initial_state.unwrap_or_else(|| current.initial_state.clone()),
            states: patch.states.unwrap_or_else(|| current.states.clone()),
            transitions: patch.transitions.unwrap_or_else(|| current.transitions.clone()),
            steps: patch.steps.unwrap_or_else(|| current.steps.clone()),
            default_config: patch
                .default_config
                .unwrap_or_else(|| current.default_config.clone()),
            is_system: false,
            created_at: Utc::now(),
        };
        validate(&next)?;

        info!(slug = %slug, version = next.version, "Created definition version");
        self.resolver.register(slug.to_string(), next.default_config.clone());
        entry.push(next.clone());
        Ok(next)
    }

    /// Latest definition plus its effective configuration for `context`.
    pub fn get_with_config(
        &self,
        slug: &str,
        context: &Value,
    ) -> EngineResult<(JourneyDefinition, Value)> {
        let definition = self.get(slug)?;
        let effective = self.resolver.resolve(slug, context)?;
        Ok((definition, effective))
    }
}

/// Structural invariants: known initial state, transition endpoints within
/// the state set, unique step slugs.
fn validate(definition: &JourneyDefinition) -> EngineResult<()> {
    let known = |state: &str| definition.states.iter().any(|s| s == state);

    if !known(&definition.initial_state) {
        return Err(EngineError::Internal(anyhow::anyhow!(
            "initial state '{}' is not in the state set",
            definition.initial_state
        )));
    }
    for rule in &definition.transitions {
        if !known(&rule.from) || !known(&rule.to) {
            return Err(EngineError::InvalidTransition {
                from: rule.from.clone(),
                to: rule.to.clone(),
                trigger: rule.trigger.clone(),
            });
        }
    }
    for (i, step) in definition.steps.iter().enumerate() {
        if definition.steps[..i].iter().any(|s| s.slug == step.slug) {
            return Err(EngineError::SlugConflict(step.slug.clone()));
        }
    }
    Ok(())
}
