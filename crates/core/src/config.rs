use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{EngineError, EngineResult};

/// Root engine configuration. Loaded from environment variables with the
/// prefix `JOURNEY_EXPRESS__`.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_ttl_secs")]
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_step_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_decay_factor")]
    pub decay_factor: f64,
    #[serde(default = "default_score_floor")]
    pub score_floor: f64,
    #[serde(default = "default_memory_ttl_days")]
    pub default_ttl_days: u32,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_workers() -> usize {
    4
}
fn default_poll_interval_ms() -> u64 {
    250
}
fn default_lock_ttl_secs() -> u64 {
    30
}
fn default_step_timeout_ms() -> u64 {
    30_000
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_decay_factor() -> f64 {
    0.95
}
fn default_score_floor() -> f64 {
    0.1
}
fn default_memory_ttl_days() -> u32 {
    30
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lock_ttl_secs(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_step_timeout_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            decay_factor: default_decay_factor(),
            score_floor: default_score_floor(),
            default_ttl_days: default_memory_ttl_days(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            lock: LockConfig::default(),
            executor: ExecutorConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("JOURNEY_EXPRESS")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

// ─── Config Resolver ────────────────────────────────────────────────────────

/// Merges system defaults, per-slug registered defaults, and caller-supplied
/// context overrides into one effective configuration.
///
/// `resolve` is a pure function of `(slug, overrides)`: serde_json maps are
/// key-sorted, so identical inputs serialize byte-identically. A/B bucketing
/// and replay debugging depend on that.
pub struct ConfigResolver {
    system_defaults: Value,
    defaults: DashMap<String, Value>,
}

impl ConfigResolver {
    pub fn new(system_defaults: Value) -> Self {
        Self {
            system_defaults,
            defaults: DashMap::new(),
        }
    }

    /// Register (or replace) the default configuration for a definition or
    /// template slug.
    pub fn register(&self, slug: impl Into<String>, defaults: Value) {
        let slug = slug.into();
        tracing::debug!(%slug, "Registered config defaults");
        self.defaults.insert(slug, defaults);
    }

    pub fn is_registered(&self, slug: &str) -> bool {
        self.defaults.contains_key(slug)
    }

    /// Produce the effective configuration for `slug`. Merge order:
    /// system defaults < registered defaults < context overrides,
    /// last-write-wins per key.
    pub fn resolve(&self, slug: &str, overrides: &Value) -> EngineResult<Value> {
        let registered = self
            .defaults
            .get(slug)
            .ok_or_else(|| EngineError::ConfigNotFound(slug.to_string()))?;

        let mut effective = self.system_defaults.clone();
        deep_merge(&mut effective, registered.value());
        deep_merge(&mut effective, overrides);
        Ok(effective)
    }
}

impl Default for ConfigResolver {
    fn default() -> Self {
        Self::new(Value::Object(serde_json::Map::new()))
    }
}

/// Recursively merges `overlay` into `base`. Objects merge per key; any other
/// value type replaces the base value wholesale.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => {
            if !overlay.is_null() {
                *base = overlay.clone();
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resolve_merge_order() {
        let resolver = ConfigResolver::new(json!({
            "timeout_ms": 30000,
            "retries": 2,
            "scoring": {"model": "baseline", "threshold": 0.5},
        }));
        resolver.register(
            "lead-gen",
            json!({"retries": 3, "scoring": {"threshold": 0.7}}),
        );

        let effective = resolver
            .resolve("lead-gen", &json!({"scoring": {"model": "tuned"}}))
            .unwrap();

        assert_eq!(effective["timeout_ms"], 30000);
        assert_eq!(effective["retries"], 3);
        assert_eq!(effective["scoring"]["model"], "tuned");
        assert_eq!(effective["scoring"]["threshold"], 0.7);
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let resolver = ConfigResolver::new(json!({"a": 1, "nested": {"x": true}}));
        resolver.register("t", json!({"b": [1, 2, 3]}));

        let ctx = json!({"nested": {"y": "z"}});
        let first = resolver.resolve("t", &ctx).unwrap();
        let second = resolver.resolve("t", &ctx).unwrap();

        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
    }

    #[test]
    fn test_unknown_slug_fails() {
        let resolver = ConfigResolver::default();
        let err = resolver.resolve("ghost", &json!({})).unwrap_err();
        assert!(matches!(err, EngineError::ConfigNotFound(_)));
    }

    #[test]
    fn test_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.lock.ttl_secs, 30);
        assert!(config.memory.decay_factor < 1.0);
    }
}
