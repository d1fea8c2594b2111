//! Time-bounded exclusive instance locks.
//!
//! Workers race `acquire` before mutating an instance; the compare-and-set
//! happens under the DashMap shard entry lock, so two concurrent calls for
//! the same unlocked instance can never both win. A production deployment
//! backs this with a conditional UPDATE on the instance row.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use journey_core::clock::Clock;

#[derive(Debug, Clone, Copy)]
struct Claim {
    holder: Uuid,
    until: DateTime<Utc>,
}

pub struct LockManager {
    locks: DashMap<Uuid, Claim>,
    clock: Arc<dyn Clock>,
}

impl LockManager {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            locks: DashMap::new(),
            clock,
        }
    }

    /// Claim the instance for `ttl_secs`. Returns a holder token on success,
    /// `None` if another holder's claim has not yet expired.
    pub fn acquire(&self, id: Uuid, ttl_secs: u64) -> Option<Uuid> {
        let now = self.clock.now();
        let claim = Claim {
            holder: Uuid::new_v4(),
            until: now + Duration::seconds(ttl_secs as i64),
        };

        match self.locks.entry(id) {
            Entry::Vacant(slot) => {
                slot.insert(claim);
                Some(claim.holder)
            }
            Entry::Occupied(mut slot) => {
                if slot.get().until <= now {
                    // Expired claim: the previous holder lost its TTL.
                    slot.insert(claim);
                    Some(claim.holder)
                } else {
                    debug!(instance_id = %id, "Lock contention");
                    None
                }
            }
        }
    }

    /// Release the current claim unconditionally. Callers that may have
    /// already lost the lock must use `release_if_held` instead.
    pub fn release(&self, id: Uuid) {
        self.locks.remove(&id);
    }

    /// Release only if `holder` still owns the claim. A stale token is a
    /// no-op, so a late release can never clear another holder's claim.
    /// Returns whether the claim was removed.
    pub fn release_if_held(&self, id: Uuid, holder: Uuid) -> bool {
        self.locks
            .remove_if(&id, |_, claim| claim.holder == holder)
            .is_some()
    }

    /// Whether an unexpired claim exists for the instance.
    pub fn is_locked(&self, id: Uuid) -> bool {
        match self.locks.get(&id) {
            Some(claim) => claim.until > self.clock.now(),
            None => false,
        }
    }

    /// The current claim deadline, if any (expired claims included).
    pub fn locked_until(&self, id: Uuid) -> Option<DateTime<Utc>> {
        self.locks.get(&id).map(|r| r.until)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use journey_core::clock::{system_clock, ManualClock};

    #[test]
    fn test_acquire_then_contend() {
        let locks = LockManager::new(system_clock());
        let id = Uuid::new_v4();

        assert!(locks.acquire(id, 30).is_some());
        assert!(locks.acquire(id, 30).is_none());
        assert!(locks.is_locked(id));

        locks.release(id);
        assert!(!locks.is_locked(id));
        assert!(locks.acquire(id, 30).is_some());
    }

    #[test]
    fn test_expired_lock_is_reclaimable() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let locks = LockManager::new(clock.clone());
        let id = Uuid::new_v4();

        assert!(locks.acquire(id, 10).is_some());
        clock.advance(Duration::seconds(11));
        assert!(!locks.is_locked(id));
        assert!(locks.acquire(id, 10).is_some());
    }

    #[test]
    fn test_stale_holder_cannot_release_new_claim() {
        let locks = LockManager::new(system_clock());
        let id = Uuid::new_v4();

        let first = locks.acquire(id, 30).unwrap();
        locks.release(id);
        let second = locks.acquire(id, 30).unwrap();

        // The first holder's token went stale when it released; replaying
        // it must not clear the second holder's claim.
        assert!(!locks.release_if_held(id, first));
        assert!(locks.is_locked(id));
        assert!(locks.release_if_held(id, second));
        assert!(!locks.is_locked(id));
    }

    #[test]
    fn test_concurrent_acquire_single_winner() {
        let locks = Arc::new(LockManager::new(system_clock()));
        let id = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let locks = locks.clone();
            handles.push(std::thread::spawn(move || locks.acquire(id, 30)));
        }

        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(Option::is_some)
            .count();
        assert_eq!(wins, 1);
    }
}
