//! Deterministic A/B testing over journey instances.
//!
//! Variant assignment is a pure function of `(test_id, instance_id)`: a
//! SHA-256 of the pair is mapped onto the cumulative traffic allocation.
//! There is no random sampling at call time, so an instance resolves to the
//! same variant for the lifetime of the test, on every node.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use journey_core::error::{EngineError, EngineResult};

/// Lifecycle of an A/B test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbTestStatus {
    Draft,
    Running,
    Paused,
    Completed,
}

/// Request payload for creating a test. `traffic_allocation` keys name the
/// variants (including `"control"`); weights need not sum to 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbTestSpec {
    pub name: String,
    pub control_config: Value,
    pub variant_configs: HashMap<String, Value>,
    pub traffic_allocation: HashMap<String, f64>,
    pub primary_metric: String,
    pub min_sample_size: u64,
    pub confidence_level: f64,
}

/// Accumulated observations for one variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VariantResults {
    pub sample_size: u64,
    pub conversions: u64,
    pub metric_total: f64,
    pub conversion_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbTest {
    pub id: Uuid,
    pub name: String,
    pub control_config: Value,
    pub variant_configs: HashMap<String, Value>,
    pub traffic_allocation: HashMap<String, f64>,
    pub primary_metric: String,
    pub min_sample_size: u64,
    pub confidence_level: f64,
    pub status: AbTestStatus,
    pub results: HashMap<String, VariantResults>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
}

/// Summary of where a test stands against its sample-size requirement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbTestSummary {
    pub test_id: Uuid,
    pub reached_min_sample: bool,
    pub total_samples: u64,
    pub required_samples: u64,
    pub best_variant: Option<String>,
    pub best_lift: f64,
}

#[derive(Default)]
pub struct AbTestEngine {
    tests: DashMap<Uuid, AbTest>,
}

impl AbTestEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_test(&self, spec: AbTestSpec) -> AbTest {
        let test = AbTest {
            id: Uuid::new_v4(),
            name: spec.name,
            control_config: spec.control_config,
            variant_configs: spec.variant_configs,
            traffic_allocation: spec.traffic_allocation,
            primary_metric: spec.primary_metric,
            min_sample_size: spec.min_sample_size,
            confidence_level: spec.confidence_level,
            status: AbTestStatus::Draft,
            results: HashMap::new(),
            created_at: Utc::now(),
            started_at: None,
        };
        info!(test_id = %test.id, name = %test.name, "Created A/B test");
        self.tests.insert(test.id, test.clone());
        test
    }

    pub fn get_test(&self, id: Uuid) -> EngineResult<AbTest> {
        self.tests
            .get(&id)
            .map(|r| r.clone())
            .ok_or_else(|| EngineError::NotFound(format!("A/B test {id}")))
    }

    pub fn start_test(&self, id: Uuid) -> EngineResult<AbTest> {
        self.move_status(id, AbTestStatus::Draft, AbTestStatus::Running, "start")
    }

    pub fn stop_test(&self, id: Uuid) -> EngineResult<AbTest> {
        self.move_status(id, AbTestStatus::Running, AbTestStatus::Paused, "stop")
    }

    pub fn complete_test(&self, id: Uuid) -> EngineResult<AbTest> {
        let mut test = self
            .tests
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("A/B test {id}")))?;
        if !matches!(test.status, AbTestStatus::Running | AbTestStatus::Paused) {
            return Err(EngineError::InvalidTransition {
                from: format!("{:?}", test.status),
                to: "Completed".into(),
                trigger: "complete".into(),
            });
        }
        test.status = AbTestStatus::Completed;
        info!(test_id = %id, "A/B test completed");
        Ok(test.clone())
    }

    /// Resolve the variant for an instance. Pure and stable: the same
    /// `(test_id, instance_id)` pair always lands in the same bucket.
    /// Returns `None` unless the test is running.
    pub fn variant_for_instance(&self, test_id: Uuid, instance_id: Uuid) -> Option<String> {
        let test = self.tests.get(&test_id)?;
        if test.status != AbTestStatus::Running {
            return None;
        }

        let total: f64 = test.traffic_allocation.values().sum();
        if total <= 0.0 {
            return None;
        }

        let digest = Sha256::digest(format!("{test_id}:{instance_id}").as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let normalized = (u64::from_be_bytes(prefix) % 10_000) as f64 / 10_000.0;

        // Sorted variant order keeps the cumulative walk stable across
        // HashMap iteration orders.
        let mut variants: Vec<(&String, &f64)> = test.traffic_allocation.iter().collect();
        variants.sort_by(|a, b| a.0.cmp(b.0));

        let mut cumulative = 0.0;
        for (name, weight) in &variants {
            cumulative += *weight / total;
            if normalized < cumulative {
                return Some((*name).clone());
            }
        }
        variants.last().map(|(name, _)| (*name).clone())
    }

    /// Record one observation for a variant.
    pub fn record_result(
        &self,
        test_id: Uuid,
        variant: &str,
        converted: bool,
        metric_value: f64,
    ) -> EngineResult<()> {
        let mut test = self
            .tests
            .get_mut(&test_id)
            .ok_or_else(|| EngineError::NotFound(format!("A/B test {test_id}")))?;
        let results = test.results.entry(variant.to_string()).or_default();
        results.sample_size += 1;
        if converted {
            results.conversions += 1;
        }
        results.metric_total += metric_value;
        results.conversion_rate = results.conversions as f64 / results.sample_size as f64;
        Ok(())
    }

    /// Compare variants against control and check the sample-size gate.
    pub fn summary(&self, test_id: Uuid) -> EngineResult<AbTestSummary> {
        let test = self.get_test(test_id)?;
        let control_rate = test
            .results
            .get("control")
            .map(|r| r.conversion_rate)
            .unwrap_or(0.0);

        let mut best_variant = None;
        let mut best_lift = 0.0f64;
        for (name, results) in &test.results {
            if name == "control" || control_rate <= 0.0 {
                continue;
            }
            let lift = (results.conversion_rate - control_rate) / control_rate;
            if lift > best_lift {
                best_lift = lift;
                best_variant = Some(name.clone());
            }
        }

        let total_samples: u64 = test.results.values().map(|r| r.sample_size).sum();
        Ok(AbTestSummary {
            test_id,
            reached_min_sample: total_samples >= test.min_sample_size,
            total_samples,
            required_samples: test.min_sample_size,
            best_variant,
            best_lift,
        })
    }

    fn move_status(
        &self,
        id: Uuid,
        expect: AbTestStatus,
        to: AbTestStatus,
        trigger: &str,
    ) -> EngineResult<AbTest> {
        let mut test = self
            .tests
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("A/B test {id}")))?;
        if test.status != expect {
            return Err(EngineError::InvalidTransition {
                from: format!("{:?}", test.status),
                to: format!("{to:?}"),
                trigger: trigger.to_string(),
            });
        }
        test.status = to;
        if to == AbTestStatus::Running && test.started_at.is_none() {
            test.started_at = Some(Utc::now());
        }
        info!(test_id = %id, status = ?to, "A/B test status changed");
        Ok(test.clone())
    }
}
