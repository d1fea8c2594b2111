//! Template manager — versioning, cloning, vertical binding, and
//! instantiation of journey templates.
//!
//! Versions are immutable once written; `create_template_version` appends
//! and flips the latest flag inside one per-slug critical section, so racing
//! writers serialize and the invariant "exactly one latest per slug" holds
//! at all times.

use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use journey_core::config::{deep_merge, ConfigResolver};
use journey_core::error::{EngineError, EngineResult};
use journey_core::event_bus::{make_event, noop_sink, EventSink};
use journey_core::types::EventType;
use journey_engine::definitions::{DefinitionRegistry, DefinitionSpec};
use journey_engine::instances::{InstanceManager, InstanceOptions};

use crate::models::{
    BindingType, CloneRecord, DefinitionPayload, Instantiation, TemplateSpec, TemplateVersion,
    VerticalBinding,
};

pub struct TemplateManager {
    // All versions per slug, oldest first; the last element is latest.
    versions: DashMap<String, Vec<TemplateVersion>>,
    // Bindings keyed by vertical slug.
    bindings: DashMap<String, Vec<VerticalBinding>>,
    // Lineage edges keyed by the source's stable template id.
    clone_history: DashMap<Uuid, Vec<CloneRecord>>,
    definitions: Arc<DefinitionRegistry>,
    instances: Arc<InstanceManager>,
    resolver: Arc<ConfigResolver>,
    event_sink: Arc<dyn EventSink>,
}

impl TemplateManager {
    pub fn new(
        definitions: Arc<DefinitionRegistry>,
        instances: Arc<InstanceManager>,
        resolver: Arc<ConfigResolver>,
    ) -> Self {
        Self {
            versions: DashMap::new(),
            bindings: DashMap::new(),
            clone_history: DashMap::new(),
            definitions,
            instances,
            resolver,
            event_sink: noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    // ─── Versioning ────────────────────────────────────────────────────────

    /// Persist version 1 of a new template, flagged latest.
    pub fn create_template(&self, spec: TemplateSpec, authored_by: &str) -> EngineResult<TemplateVersion> {
        let version = TemplateVersion {
            id: Uuid::new_v4(),
            template_id: Uuid::new_v4(),
            slug: spec.slug.clone(),
            name: spec.name,
            version: 1,
            is_latest: true,
            vertical_slug: spec.vertical_slug,
            definition: spec.definition,
            is_system: spec.is_system,
            authored_by: authored_by.to_string(),
            created_at: Utc::now(),
        };

        match self.versions.entry(spec.slug.clone()) {
            Entry::Occupied(_) => Err(EngineError::SlugConflict(spec.slug)),
            Entry::Vacant(slot) => {
                info!(slug = %version.slug, "Created template");
                self.resolver
                    .register(version.slug.clone(), version.definition.default_config.clone());
                slot.insert(vec![version.clone()]);
                Ok(version)
            }
        }
    }

    /// Append version N+1 with `patch` deep-merged onto the current payload
    /// and flip the latest flag, all under the per-slug entry lock. Racing
    /// callers queue here; the loser observes N+1 and produces N+2.
    pub fn create_template_version(
        &self,
        slug: &str,
        patch: &Value,
        authored_by: &str,
    ) -> EngineResult<TemplateVersion> {
        let mut entry = self
            .versions
            .get_mut(slug)
            .ok_or_else(|| EngineError::NotFound(format!("template '{slug}'")))?;

        let current = entry.last().expect("template slug with no versions").clone();

        let mut payload = serde_json::to_value(&current.definition)?;
        deep_merge(&mut payload, patch);
        let definition: DefinitionPayload = serde_json::from_value(payload)?;

        let next = TemplateVersion {
            id: Uuid::new_v4(),
            template_id: current.template_id,
            slug: current.slug.clone(),
            name: current.name.clone(),
            version: current.version + 1,
            is_latest: true,
            vertical_slug: current.vertical_slug.clone(),
            definition,
            is_system: current.is_system,
            authored_by: authored_by.to_string(),
            created_at: Utc::now(),
        };

        for old in entry.iter_mut() {
            old.is_latest = false;
        }
        info!(slug = %slug, version = next.version, "Created template version");
        self.resolver
            .register(slug.to_string(), next.definition.default_config.clone());
        entry.push(next.clone());
        Ok(next)
    }

    /// Latest version of the template.
    pub fn get_template(&self, slug: &str) -> EngineResult<TemplateVersion> {
        self.versions
            .get(slug)
            .and_then(|versions| versions.last().cloned())
            .ok_or_else(|| EngineError::NotFound(format!("template '{slug}'")))
    }

    /// Latest version of the template with the given stable id.
    pub fn get_template_by_id(&self, template_id: Uuid) -> EngineResult<TemplateVersion> {
        self.versions
            .iter()
            .find_map(|entry| {
                entry
                    .value()
                    .iter()
                    .rev()
                    .find(|v| v.template_id == template_id)
                    .cloned()
            })
            .ok_or_else(|| EngineError::NotFound(format!("template {template_id}")))
    }

    /// All versions of a template, newest first.
    pub fn get_template_versions(&self, slug: &str) -> EngineResult<Vec<TemplateVersion>> {
        let versions = self
            .versions
            .get(slug)
            .ok_or_else(|| EngineError::NotFound(format!("template '{slug}'")))?;
        let mut all = versions.clone();
        all.reverse();
        Ok(all)
    }

    // ─── Cloning ───────────────────────────────────────────────────────────

    /// Deep-copy the source's latest payload, apply `modifications`, persist
    /// as a new non-system template, and record the lineage edge. Cloning a
    /// system template is permitted; the derivative is never system-owned.
    pub fn clone_template(
        &self,
        source_slug: &str,
        new_slug: &str,
        modifications: &Value,
        reason: &str,
        cloned_by: &str,
    ) -> EngineResult<TemplateVersion> {
        let source = self.get_template(source_slug)?;

        let mut payload = serde_json::to_value(&source.definition)?;
        deep_merge(&mut payload, modifications);
        let definition: DefinitionPayload = serde_json::from_value(payload)?;

        let cloned = self.create_template(
            TemplateSpec {
                slug: new_slug.to_string(),
                name: format!("{} (clone)", source.name),
                vertical_slug: source.vertical_slug.clone(),
                definition,
                is_system: false,
            },
            cloned_by,
        )?;

        let record = CloneRecord {
            id: Uuid::new_v4(),
            source_template_id: source.template_id,
            new_template_id: cloned.template_id,
            reason: reason.to_string(),
            cloned_by: cloned_by.to_string(),
            cloned_at: Utc::now(),
        };
        info!(source = %source_slug, clone = %new_slug, "Cloned template");
        self.clone_history
            .entry(source.template_id)
            .or_default()
            .push(record);
        Ok(cloned)
    }

    /// Lineage edges where the given template was the clone source, keyed by
    /// the stable template id so the history is visible from any version.
    pub fn get_clone_history(&self, template_id: Uuid) -> Vec<CloneRecord> {
        self.clone_history
            .get(&template_id)
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    // ─── Vertical bindings ─────────────────────────────────────────────────

    /// Create or update the binding between a template and a vertical.
    pub fn bind_template_to_vertical(
        &self,
        template_id: Uuid,
        vertical_slug: &str,
        binding_type: BindingType,
        priority: i32,
        auto_start: bool,
    ) -> EngineResult<VerticalBinding> {
        // Ensure the template exists before binding it.
        self.get_template_by_id(template_id)?;

        let mut bindings = self.bindings.entry(vertical_slug.to_string()).or_default();
        if let Some(existing) = bindings.iter_mut().find(|b| b.template_id == template_id) {
            existing.binding_type = binding_type;
            existing.priority = priority;
            existing.auto_start = auto_start;
            return Ok(existing.clone());
        }

        let binding = VerticalBinding {
            id: Uuid::new_v4(),
            template_id,
            vertical_slug: vertical_slug.to_string(),
            binding_type,
            priority,
            auto_start,
            created_at: Utc::now(),
        };
        info!(template_id = %template_id, vertical = %vertical_slug, "Bound template to vertical");
        bindings.push(binding.clone());
        Ok(binding)
    }

    pub fn get_bindings(&self, vertical_slug: &str) -> Vec<VerticalBinding> {
        self.bindings
            .get(vertical_slug)
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// The template auto-started for a vertical: the highest-priority
    /// `auto_start` binding wins.
    pub fn auto_start_template(&self, vertical_slug: &str) -> Option<TemplateVersion> {
        let bindings = self.bindings.get(vertical_slug)?;
        let chosen = bindings
            .iter()
            .filter(|b| b.auto_start)
            .max_by_key(|b| b.priority)?;
        self.get_template_by_id(chosen.template_id).ok()
    }

    // ─── Instantiation ─────────────────────────────────────────────────────

    /// Resolve the effective config, materialize (and cache) the concrete
    /// definition for the latest version, and create an instance whose
    /// context carries a `_template` provenance tag.
    pub fn instantiate_template(
        &self,
        slug: &str,
        context: Value,
        opts: InstanceOptions,
    ) -> EngineResult<Instantiation> {
        let template = self.get_template(slug)?;
        // Resolving up front both validates the slug's registration and
        // keeps instantiation reproducible for a given context.
        let effective_config = self.resolver.resolve(slug, &context)?;

        // Definitions are cached per template version; the slug pins both.
        // The cached definition carries the template's own defaults; the
        // caller-specific effective config rides on the instance context.
        let definition_slug = format!("{}-v{}", template.slug, template.version);
        let definition = match self.definitions.get(&definition_slug) {
            Ok(existing) => existing,
            Err(EngineError::NotFound(_)) => {
                let spec = DefinitionSpec {
                    slug: definition_slug.clone(),
                    initial_state: template.definition.initial_state.clone(),
                    states: template.definition.states.clone(),
                    transitions: template.definition.transitions.clone(),
                    steps: template.definition.steps.clone(),
                    default_config: template.definition.default_config.clone(),
                    is_system: false,
                };
                match self.definitions.create(spec) {
                    Ok(created) => created,
                    // A racing instantiation materialized the same version
                    // first; its definition is the one we wanted.
                    Err(EngineError::SlugConflict(_)) => self.definitions.get(&definition_slug)?,
                    Err(other) => return Err(other),
                }
            }
            Err(other) => return Err(other),
        };

        let mut personalized_context = context;
        if !personalized_context.is_object() {
            personalized_context = Value::Object(serde_json::Map::new());
        }
        deep_merge(
            &mut personalized_context,
            &json!({
                "_template": {
                    "slug": template.slug,
                    "version": template.version,
                    "vertical": template.vertical_slug,
                },
                "_config": effective_config,
            }),
        );

        let instance =
            self.instances
                .create_instance(&definition_slug, personalized_context.clone(), opts)?;

        self.event_sink.emit(make_event(
            EventType::TemplateInstantiated,
            Some(instance.id),
            Some(definition_slug),
            None,
            json!({"template": template.slug, "version": template.version}),
        ));

        Ok(Instantiation {
            instance,
            definition,
            personalized_context,
        })
    }
}
