//! Step registry — the catalog of step types plus the runtime map from
//! executor kind to executor implementation.
//!
//! Executors are an external capability interface: the engine hands one a
//! config and the instance context and gets back an output (and optionally a
//! trigger hint), or an error. What the executor computes is opaque here; the
//! engine only enforces timeouts and the per-category retry policy.
//!
//! The registry is built once at process start and passed in explicitly;
//! nothing in the engine reads registration state from globals.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::info;

use journey_core::error::{EngineError, EngineResult};
use journey_core::types::{StepCategory, StepTypeDef};

/// What an executor hands back to the engine.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Folded into `instance.context` under the step's slug.
    pub output: Value,
    /// Optional trigger to fire against the definition's transition table.
    pub next_trigger: Option<String>,
}

impl StepOutput {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            next_trigger: None,
        }
    }

    pub fn with_trigger(output: Value, trigger: impl Into<String>) -> Self {
        Self {
            output,
            next_trigger: Some(trigger.into()),
        }
    }
}

/// External step handler. Implementations must respect the timeout contract;
/// the engine cancels the future at the step type's deadline either way.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, config: &Value, context: &Value) -> Result<StepOutput>;
}

/// Adapter so plain closures can serve as executors in wiring and tests.
pub struct FnExecutor<F>(pub F);

#[async_trait]
impl<F> StepExecutor for FnExecutor<F>
where
    F: Fn(&Value, &Value) -> Result<StepOutput> + Send + Sync,
{
    async fn execute(&self, config: &Value, context: &Value) -> Result<StepOutput> {
        (self.0)(config, context)
    }
}

/// Executor types the instance manager interprets itself rather than
/// dispatching to a registered executor.
pub const EXECUTOR_CONDITIONAL_BRANCH: &str = "conditional_branch";
pub const EXECUTOR_PARALLEL_EXECUTE: &str = "parallel_execute";
pub const EXECUTOR_WAIT_DELAY: &str = "wait_delay";

/// Catalog of step types and the executor map.
pub struct StepRegistry {
    step_types: DashMap<String, StepTypeDef>,
    executors: DashMap<String, Arc<dyn StepExecutor>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        let registry = Self {
            step_types: DashMap::new(),
            executors: DashMap::new(),
        };
        registry.seed_control_flow_types();
        registry
    }

    /// Register a step type. Fails on a duplicate slug.
    pub fn register_step_type(&self, def: StepTypeDef) -> EngineResult<()> {
        if self.step_types.contains_key(&def.slug) {
            return Err(EngineError::SlugConflict(def.slug));
        }
        info!(slug = %def.slug, category = ?def.category, "Registered step type");
        self.step_types.insert(def.slug.clone(), def);
        Ok(())
    }

    pub fn get_step_type(&self, slug: &str) -> Option<StepTypeDef> {
        self.step_types.get(slug).map(|r| r.clone())
    }

    pub fn list_step_types(&self) -> Vec<StepTypeDef> {
        let mut types: Vec<StepTypeDef> = self.step_types.iter().map(|r| r.clone()).collect();
        types.sort_by(|a, b| a.slug.cmp(&b.slug));
        types
    }

    pub fn register_executor(&self, executor_type: impl Into<String>, executor: Arc<dyn StepExecutor>) {
        let executor_type = executor_type.into();
        info!(executor_type = %executor_type, "Registered executor");
        self.executors.insert(executor_type, executor);
    }

    pub fn get_executor(&self, executor_type: &str) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(executor_type).map(|r| r.clone())
    }

    /// Control-flow kinds are first-class and always present.
    fn seed_control_flow_types(&self) {
        for (slug, executor_type) in [
            ("conditional-branch", EXECUTOR_CONDITIONAL_BRANCH),
            ("parallel-execute", EXECUTOR_PARALLEL_EXECUTE),
            ("wait-delay", EXECUTOR_WAIT_DELAY),
        ] {
            self.step_types.insert(
                slug.to_string(),
                StepTypeDef {
                    slug: slug.to_string(),
                    category: StepCategory::ControlFlow,
                    executor_type: executor_type.to_string(),
                    default_config: Value::Object(serde_json::Map::new()),
                    default_timeout_ms: 10_000,
                    max_retries: 0,
                    is_system: true,
                },
            );
        }
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluates a simple predicate against a JSON context.
///
/// Supports:
/// - `"always"` -> true
/// - `"never"` -> false
/// - Any other string -> treated as a key-existence check on the context object
pub fn evaluate_condition(condition: &str, context: &Value) -> bool {
    match condition {
        "always" => true,
        "never" => false,
        key => context
            .as_object()
            .map(|obj| obj.contains_key(key))
            .unwrap_or(false),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_step_type(slug: &str) -> StepTypeDef {
        StepTypeDef {
            slug: slug.to_string(),
            category: StepCategory::Discovery,
            executor_type: "company-discovery".to_string(),
            default_config: json!({"batch_size": 50}),
            default_timeout_ms: 5_000,
            max_retries: 2,
            is_system: false,
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = StepRegistry::new();
        registry.register_step_type(sample_step_type("discover-companies")).unwrap();

        let def = registry.get_step_type("discover-companies").unwrap();
        assert_eq!(def.executor_type, "company-discovery");
        assert!(def.category.is_retryable());
    }

    #[test]
    fn test_duplicate_slug_rejected() {
        let registry = StepRegistry::new();
        registry.register_step_type(sample_step_type("discover-companies")).unwrap();
        let err = registry
            .register_step_type(sample_step_type("discover-companies"))
            .unwrap_err();
        assert!(matches!(err, EngineError::SlugConflict(_)));
    }

    #[test]
    fn test_control_flow_types_seeded() {
        let registry = StepRegistry::new();
        for slug in ["conditional-branch", "parallel-execute", "wait-delay"] {
            let def = registry.get_step_type(slug).unwrap();
            assert_eq!(def.category, StepCategory::ControlFlow);
            assert!(!def.category.is_retryable());
            assert!(def.is_system);
        }
    }

    #[tokio::test]
    async fn test_fn_executor_roundtrip() {
        let registry = StepRegistry::new();
        registry.register_executor(
            "echo",
            Arc::new(FnExecutor(|config: &Value, _ctx: &Value| {
                Ok(StepOutput::new(json!({"echo": config.clone()})))
            })),
        );

        let executor = registry.get_executor("echo").unwrap();
        let out = executor
            .execute(&json!({"k": 1}), &json!({}))
            .await
            .unwrap();
        assert_eq!(out.output["echo"]["k"], 1);
        assert!(registry.get_executor("missing").is_none());
    }

    #[test]
    fn test_evaluate_condition() {
        let ctx = json!({"email_verified": true});
        assert!(evaluate_condition("always", &ctx));
        assert!(!evaluate_condition("never", &ctx));
        assert!(evaluate_condition("email_verified", &ctx));
        assert!(!evaluate_condition("phone_verified", &ctx));
    }
}
