//! Shared memory store with relevance decay.
//!
//! Records are addressed by a composite key of memory type, scope, and key,
//! so distinct journeys can read what earlier journeys learned about the
//! same entity. Scores decay over time; stale records fall below the floor
//! and expired ones are purged.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use journey_core::clock::{system_clock, Clock};

/// One remembered fact, scoped to an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub memory_type: String,
    pub scope_type: String,
    pub scope_id: String,
    pub memory_key: String,
    pub value: Value,
    pub relevance_score: f64,
    pub source_instance_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMemoryRequest {
    pub memory_type: String,
    pub scope_type: String,
    pub scope_id: String,
    pub memory_key: String,
    pub value: Value,
    pub relevance_score: f64,
    pub source_instance_id: Option<Uuid>,
    pub ttl_days: Option<i64>,
}

type CompositeKey = (String, String, String, String);

/// In-memory store keyed by `(memory_type, scope_type, scope_id, memory_key)`.
/// Production: replace with PostgreSQL.
pub struct MemoryStore {
    records: DashMap<CompositeKey, MemoryRecord>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(system_clock())
    }
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
        }
    }

    /// Upsert a record. Writing to an existing key replaces the value and
    /// score but keeps the original id and creation time.
    pub fn store_memory(&self, req: StoreMemoryRequest) -> MemoryRecord {
        let now = self.clock.now();
        let expires_at = req.ttl_days.map(|days| now + Duration::days(days));
        let key = (
            req.memory_type.clone(),
            req.scope_type.clone(),
            req.scope_id.clone(),
            req.memory_key.clone(),
        );

        let mut entry = self.records.entry(key).or_insert_with(|| MemoryRecord {
            id: Uuid::new_v4(),
            memory_type: req.memory_type,
            scope_type: req.scope_type,
            scope_id: req.scope_id,
            memory_key: req.memory_key,
            value: Value::Null,
            relevance_score: 0.0,
            source_instance_id: None,
            created_at: now,
            updated_at: now,
            expires_at: None,
        });
        entry.value = req.value;
        entry.relevance_score = req.relevance_score;
        entry.source_instance_id = req.source_instance_id;
        entry.updated_at = now;
        entry.expires_at = expires_at;
        entry.clone()
    }

    /// Exact lookup. Expired records read as absent.
    pub fn get_memory(
        &self,
        memory_type: &str,
        scope_type: &str,
        scope_id: &str,
        memory_key: &str,
    ) -> Option<MemoryRecord> {
        let key = (
            memory_type.to_string(),
            scope_type.to_string(),
            scope_id.to_string(),
            memory_key.to_string(),
        );
        let record = self.records.get(&key)?.clone();
        if self.is_expired(&record) {
            return None;
        }
        Some(record)
    }

    /// Everything remembered about one entity, strongest memories first.
    pub fn get_entity_memory(&self, scope_type: &str, scope_id: &str) -> Vec<MemoryRecord> {
        let mut records: Vec<MemoryRecord> = self
            .records
            .iter()
            .filter(|r| r.scope_type == scope_type && r.scope_id == scope_id)
            .filter(|r| !self.is_expired(r.value()))
            .map(|r| r.clone())
            .collect();
        records.sort_by(|a, b| {
            b.relevance_score
                .partial_cmp(&a.relevance_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        records
    }

    /// Multiply every score by `factor`, clamped at `floor`. A record whose
    /// raw decayed score falls below the floor pins there and is stamped
    /// expiry-eligible, so the next purge drops it even without a TTL.
    /// Returns how many records were touched.
    pub fn decay_scores(&self, factor: f64, floor: f64) -> usize {
        let now = self.clock.now();
        let mut changed = 0;
        for mut record in self.records.iter_mut() {
            let raw = record.relevance_score * factor;
            if raw >= floor {
                record.relevance_score = raw;
                changed += 1;
            } else if record.expires_at.map_or(true, |at| at > now) {
                record.relevance_score = floor;
                record.expires_at = Some(now);
                changed += 1;
            }
        }
        debug!(changed, factor, floor, "Decayed memory scores");
        changed
    }

    /// Drop records past their expiry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.records.len();
        self.records
            .retain(|_, record| record.expires_at.map(|at| at > now).unwrap_or(true));
        let purged = before - self.records.len();
        if purged > 0 {
            info!(purged, "Purged expired memory records");
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn is_expired(&self, record: &MemoryRecord) -> bool {
        record
            .expires_at
            .map(|at| at <= self.clock.now())
            .unwrap_or(false)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use journey_core::clock::ManualClock;
    use serde_json::json;

    fn request(key: &str, score: f64) -> StoreMemoryRequest {
        StoreMemoryRequest {
            memory_type: "insight".into(),
            scope_type: "contact".into(),
            scope_id: "acct-42".into(),
            memory_key: key.into(),
            value: json!({"note": "responded to outreach"}),
            relevance_score: score,
            source_instance_id: None,
            ttl_days: None,
        }
    }

    #[test]
    fn test_store_and_lookup() {
        let store = MemoryStore::default();
        store.store_memory(request("last-reply", 0.9));

        let found = store
            .get_memory("insight", "contact", "acct-42", "last-reply")
            .unwrap();
        assert_eq!(found.relevance_score, 0.9);
        assert!(store
            .get_memory("insight", "contact", "acct-42", "missing")
            .is_none());
    }

    #[test]
    fn test_upsert_keeps_identity() {
        let store = MemoryStore::default();
        let first = store.store_memory(request("last-reply", 0.5));
        let second = store.store_memory(request("last-reply", 0.8));

        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.relevance_score, 0.8);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_entity_memory_sorted_by_score() {
        let store = MemoryStore::default();
        store.store_memory(request("weak", 0.2));
        store.store_memory(request("strong", 0.9));
        store.store_memory(request("medium", 0.5));

        let records = store.get_entity_memory("contact", "acct-42");
        let keys: Vec<&str> = records.iter().map(|r| r.memory_key.as_str()).collect();
        assert_eq!(keys, vec!["strong", "medium", "weak"]);
    }

    #[test]
    fn test_decay_respects_floor_and_monotonicity() {
        let store = MemoryStore::default();
        store.store_memory(request("fading", 0.12));

        // While above the floor the score only shrinks and stays readable.
        let mut previous = 0.12;
        for _ in 0..3 {
            store.decay_scores(0.95, 0.1);
            let score = store
                .get_memory("insight", "contact", "acct-42", "fading")
                .unwrap()
                .relevance_score;
            assert!(score < previous);
            assert!(score >= 0.1);
            previous = score;
        }
    }

    #[test]
    fn test_floor_pinned_record_becomes_purgeable() {
        let store = MemoryStore::default();
        store.store_memory(request("fading", 0.12));
        store.store_memory(request("strong", 0.9));

        // Four rounds take 0.12 through the floor; 0.9 stays well above it.
        for _ in 0..4 {
            store.decay_scores(0.95, 0.1);
        }

        // The floor-pinned record is expiry-eligible even with no TTL.
        assert!(store
            .get_memory("insight", "contact", "acct-42", "fading")
            .is_none());
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert!(store
            .get_memory("insight", "contact", "acct-42", "strong")
            .is_some());
    }

    #[test]
    fn test_expiry_hides_then_purges() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = MemoryStore::new(clock.clone());
        let mut req = request("short-lived", 0.7);
        req.ttl_days = Some(7);
        store.store_memory(req);
        store.store_memory(request("durable", 0.7));

        clock.advance(Duration::days(8));
        assert!(store
            .get_memory("insight", "contact", "acct-42", "short-lived")
            .is_none());
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
        assert!(store
            .get_memory("insight", "contact", "acct-42", "durable")
            .is_some());
    }
}
