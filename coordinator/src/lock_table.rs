//! Granted resource locks.
//!
//! Single source of truth for who holds which resource key and until when.
//! A multi-resource grant is stored once and referenced from every key it
//! covers.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use banklock_common::{Priority, RequestId, ResourceKey, StdDurationExt, WorkerId};
use banklock_protocol::LockSnapshot;

use crate::config::LockConfig;
use crate::wait_queue::LockRequest;

/// An exclusive hold on one or more resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantedLock {
    /// Request that was granted.
    pub request_id: RequestId,
    /// Worker holding the grant.
    pub worker_id: WorkerId,
    /// Keys covered at grant time.
    pub resources: BTreeSet<ResourceKey>,
    /// Priority of the original request.
    pub priority: Priority,
    /// Operation label of the original request.
    pub operation: String,
    /// When the grant was made.
    pub granted_at: DateTime<Utc>,
    /// When the grant lapses if not released.
    pub expires_at: DateTime<Utc>,
}

impl GrantedLock {
    /// Whether the grant has lapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// Result of releasing a set of keys.
#[derive(Debug, Default)]
pub struct Release {
    /// Keys that were actually held and are now free.
    pub keys: Vec<ResourceKey>,
    /// Grants that no longer cover any key.
    pub completed: Vec<Arc<GrantedLock>>,
}

/// A grant removed by the expiry sweep.
#[derive(Debug)]
pub struct ExpiredGrant {
    pub grant: Arc<GrantedLock>,
    /// Keys it still held when it expired.
    pub keys: Vec<ResourceKey>,
}

/// Table of granted locks.
#[derive(Debug, Default)]
pub struct LockTable {
    /// Holder of each locked key.
    locks: HashMap<ResourceKey, Arc<GrantedLock>>,
    /// Keys still held by each grant.
    held_keys: HashMap<RequestId, BTreeSet<ResourceKey>>,
}

impl LockTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// First grant conflicting with `resources`, if any.
    pub fn check_conflict<'a, I>(&self, resources: I) -> Option<&Arc<GrantedLock>>
    where
        I: IntoIterator<Item = &'a ResourceKey>,
    {
        resources.into_iter().find_map(|key| self.locks.get(key))
    }

    /// Every conflicting key with its holder.
    pub fn conflicts<'a, I>(&self, resources: I) -> Vec<(&'a ResourceKey, &Arc<GrantedLock>)>
    where
        I: IntoIterator<Item = &'a ResourceKey>,
    {
        resources
            .into_iter()
            .filter_map(|key| self.locks.get(key).map(|holder| (key, holder)))
            .collect()
    }

    /// Grant `request`, which the caller has checked for conflicts.
    ///
    /// The hold time is the requested timeout (or the configured default)
    /// clamped to the configured maximum.
    pub fn grant(&mut self, request: &LockRequest, config: &LockConfig, now: DateTime<Utc>) -> Arc<GrantedLock> {
        let requested = request
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(config.default_duration);
        let hold = requested.min(config.max_duration);

        let grant = Arc::new(GrantedLock {
            request_id: request.request_id.clone(),
            worker_id: request.worker_id.clone(),
            resources: request.resources.clone(),
            priority: request.priority,
            operation: request.operation.clone(),
            granted_at: now,
            expires_at: now + hold.to_chrono(),
        });

        for key in &grant.resources {
            debug_assert!(!self.locks.contains_key(key), "granting a held key");
            self.locks.insert(key.clone(), Arc::clone(&grant));
        }
        self.held_keys
            .insert(grant.request_id.clone(), grant.resources.clone());

        debug!(
            request_id = %grant.request_id,
            worker_id = %grant.worker_id,
            keys = grant.resources.len(),
            expires_at = %grant.expires_at,
            "Lock granted"
        );

        grant
    }

    /// Release exactly the given keys. Keys not currently held are ignored;
    /// other keys of a partially released grant stay held.
    pub fn release<'a, I>(&mut self, resources: I) -> Release
    where
        I: IntoIterator<Item = &'a ResourceKey>,
    {
        let mut release = Release::default();

        for key in resources {
            let Some(grant) = self.locks.remove(key) else {
                continue;
            };
            release.keys.push(key.clone());

            let now_empty = match self.held_keys.get_mut(&grant.request_id) {
                Some(keys) => {
                    keys.remove(key);
                    keys.is_empty()
                }
                None => true,
            };
            if now_empty {
                self.held_keys.remove(&grant.request_id);
                release.completed.push(grant);
            }
        }

        release
    }

    /// Remove every grant whose expiry is before `now`.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> Vec<ExpiredGrant> {
        let expired: Vec<Arc<GrantedLock>> = self
            .held_keys
            .keys()
            .filter_map(|id| self.grant_for(id))
            .filter(|grant| grant.is_expired(now))
            .collect();

        expired
            .into_iter()
            .map(|grant| {
                let keys = self.remove_grant(&grant.request_id);
                ExpiredGrant { grant, keys }
            })
            .collect()
    }

    /// Keys held by `worker_id`, with their grants.
    pub fn locks_held_by(&self, worker_id: &WorkerId) -> Vec<(ResourceKey, Arc<GrantedLock>)> {
        self.locks
            .iter()
            .filter(|(_, grant)| &grant.worker_id == worker_id)
            .map(|(key, grant)| (key.clone(), Arc::clone(grant)))
            .collect()
    }

    /// Drop every grant of `worker_id`, returning the grants removed.
    pub fn release_worker(&mut self, worker_id: &WorkerId) -> Vec<Arc<GrantedLock>> {
        let grants: Vec<Arc<GrantedLock>> = self
            .held_keys
            .keys()
            .filter_map(|id| self.grant_for(id))
            .filter(|grant| &grant.worker_id == worker_id)
            .collect();

        for grant in &grants {
            self.remove_grant(&grant.request_id);
        }
        grants
    }

    /// Live grant for a request, if any of its keys are still held.
    pub fn get_by_request(&self, request_id: &RequestId) -> Option<Arc<GrantedLock>> {
        self.grant_for(request_id)
    }

    /// Current holder of `key`.
    pub fn holder_of(&self, key: &ResourceKey) -> Option<&Arc<GrantedLock>> {
        self.locks.get(key)
    }

    /// Number of live grants attributable to `worker_id`.
    pub fn count_for_worker(&self, worker_id: &WorkerId) -> usize {
        self.held_keys
            .keys()
            .filter_map(|id| self.grant_for(id))
            .filter(|grant| &grant.worker_id == worker_id)
            .count()
    }

    /// Number of locked keys.
    pub fn key_count(&self) -> usize {
        self.locks.len()
    }

    /// Number of live grants.
    pub fn grant_count(&self) -> usize {
        self.held_keys.len()
    }

    /// One entry per locked key, ordered by key.
    pub fn snapshot(&self) -> Vec<LockSnapshot> {
        let mut keys: Vec<&ResourceKey> = self.locks.keys().collect();
        keys.sort();
        keys.into_iter()
            .map(|key| {
                let grant = &self.locks[key];
                LockSnapshot {
                    resource: key.canonical(),
                    worker_id: grant.worker_id.clone(),
                    request_id: grant.request_id.clone(),
                    operation: grant.operation.clone(),
                    priority: grant.priority,
                    granted_at: grant.granted_at.timestamp_millis(),
                    expires_at: grant.expires_at.timestamp_millis(),
                }
            })
            .collect()
    }

    fn grant_for(&self, request_id: &RequestId) -> Option<Arc<GrantedLock>> {
        let key = self.held_keys.get(request_id)?.iter().next()?;
        self.locks.get(key).cloned()
    }

    fn remove_grant(&mut self, request_id: &RequestId) -> Vec<ResourceKey> {
        let keys = self.held_keys.remove(request_id).unwrap_or_default();
        for key in &keys {
            self.locks.remove(key);
        }
        keys.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use proptest::prelude::*;

    fn request(id: &str, worker: &str, keys: &[&str], timeout_ms: Option<u64>) -> LockRequest {
        LockRequest {
            request_id: RequestId::new(id),
            worker_id: WorkerId::new(worker),
            resources: keys.iter().map(|k| ResourceKey::account(*k)).collect(),
            priority: Priority::Normal,
            timeout_ms,
            operation: "transfer".to_string(),
            enqueued_at: Utc::now(),
        }
    }

    #[test]
    fn test_grant_and_conflict() {
        let mut table = LockTable::new();
        let now = Utc::now();
        let config = LockConfig::default();

        let req = request("r-1", "A", &["acc-1", "acc-2"], Some(10_000));
        assert!(table.check_conflict(&req.resources).is_none());
        let grant = table.grant(&req, &config, now);
        assert_eq!(grant.expires_at, now + ChronoDuration::milliseconds(10_000));

        let other = request("r-2", "B", &["acc-2"], None);
        let holder = table.check_conflict(&other.resources).unwrap();
        assert_eq!(holder.worker_id, WorkerId::new("A"));
        assert_eq!(table.key_count(), 2);
        assert_eq!(table.grant_count(), 1);
    }

    #[test]
    fn test_timeout_is_clamped() {
        let mut table = LockTable::new();
        let now = Utc::now();
        let config = LockConfig::default();

        let grant = table.grant(&request("r-1", "A", &["acc-1"], Some(600_000)), &config, now);
        assert_eq!(grant.expires_at, now + ChronoDuration::seconds(60));

        let grant = table.grant(&request("r-2", "A", &["acc-2"], None), &config, now);
        assert_eq!(grant.expires_at, now + ChronoDuration::seconds(30));
    }

    #[test]
    fn test_partial_release_keeps_grant() {
        let mut table = LockTable::new();
        let req = request("r-1", "A", &["acc-1", "acc-2"], None);
        table.grant(&req, &LockConfig::default(), Utc::now());

        let first = table.release(&[ResourceKey::account("acc-1")]);
        assert_eq!(first.keys.len(), 1);
        assert!(first.completed.is_empty());
        assert_eq!(table.count_for_worker(&WorkerId::new("A")), 1);

        let second = table.release(&[ResourceKey::account("acc-2")]);
        assert_eq!(second.completed.len(), 1);
        assert_eq!(table.count_for_worker(&WorkerId::new("A")), 0);
        assert!(table.get_by_request(&RequestId::new("r-1")).is_none());
    }

    #[test]
    fn test_release_of_free_key_is_noop() {
        let mut table = LockTable::new();
        table.grant(&request("r-1", "A", &["acc-1"], None), &LockConfig::default(), Utc::now());

        let release = table.release(&[ResourceKey::account("acc-9")]);
        assert!(release.keys.is_empty());
        assert_eq!(table.key_count(), 1);
    }

    #[test]
    fn test_sweep_expired() {
        let mut table = LockTable::new();
        let now = Utc::now();
        let config = LockConfig::default();
        table.grant(&request("r-1", "A", &["acc-1", "acc-2"], Some(1_000)), &config, now);
        table.grant(&request("r-2", "B", &["acc-3"], Some(20_000)), &config, now);

        let later = now + ChronoDuration::seconds(5);
        let expired = table.sweep_expired(later);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].keys.len(), 2);
        assert_eq!(table.key_count(), 1);
        assert!(table.sweep_expired(later).is_empty());
    }

    #[test]
    fn test_release_worker() {
        let mut table = LockTable::new();
        let config = LockConfig::default();
        let now = Utc::now();
        table.grant(&request("r-1", "A", &["acc-1"], None), &config, now);
        table.grant(&request("r-2", "A", &["acc-2"], None), &config, now);
        table.grant(&request("r-3", "B", &["acc-3"], None), &config, now);

        assert_eq!(table.locks_held_by(&WorkerId::new("A")).len(), 2);
        assert_eq!(table.release_worker(&WorkerId::new("A")).len(), 2);
        assert_eq!(table.key_count(), 1);
        assert_eq!(table.snapshot()[0].resource, "CUENTA:acc-3");
    }

    #[derive(Debug, Clone)]
    enum Op {
        Grant { worker: u8, keys: Vec<u8> },
        Release { keys: Vec<u8> },
        ReleaseWorker { worker: u8 },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..4, prop::collection::vec(0u8..8, 1..4))
                .prop_map(|(worker, keys)| Op::Grant { worker, keys }),
            prop::collection::vec(0u8..8, 1..4).prop_map(|keys| Op::Release { keys }),
            (0u8..4).prop_map(|worker| Op::ReleaseWorker { worker }),
        ]
    }

    proptest! {
        #[test]
        fn prop_keys_never_double_granted(ops in prop::collection::vec(op(), 1..60)) {
            let mut table = LockTable::new();
            let config = LockConfig::default();
            let now = Utc::now();
            let mut counts: HashMap<WorkerId, usize> = HashMap::new();

            for (i, op) in ops.into_iter().enumerate() {
                match op {
                    Op::Grant { worker, keys } => {
                        let keys: Vec<String> = keys.iter().map(|k| format!("acc-{}", k)).collect();
                        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
                        let req = request(&format!("r-{}", i), &format!("w-{}", worker), &refs, None);
                        if table.check_conflict(&req.resources).is_none() {
                            table.grant(&req, &config, now);
                            *counts.entry(req.worker_id).or_default() += 1;
                        }
                    }
                    Op::Release { keys } => {
                        let keys: Vec<ResourceKey> =
                            keys.iter().map(|k| ResourceKey::account(format!("acc-{}", k))).collect();
                        for grant in table.release(&keys).completed {
                            *counts.entry(grant.worker_id.clone()).or_default() -= 1;
                        }
                    }
                    Op::ReleaseWorker { worker } => {
                        let worker = WorkerId::new(format!("w-{}", worker));
                        let removed = table.release_worker(&worker).len();
                        *counts.entry(worker).or_default() -= removed;
                    }
                }

                let mut owners: HashMap<&ResourceKey, &RequestId> = HashMap::new();
                for (key, grant) in &table.locks {
                    prop_assert!(owners.insert(key, &grant.request_id).is_none());
                    prop_assert!(table.held_keys[&grant.request_id].contains(key));
                }
                for (worker, count) in &counts {
                    prop_assert_eq!(table.count_for_worker(worker), *count);
                }
            }
        }

        #[test]
        fn prop_sweep_is_idempotent(timeouts in prop::collection::vec(1u64..5_000, 1..20), offset in 0i64..6_000) {
            let mut table = LockTable::new();
            let config = LockConfig::default();
            let now = Utc::now();
            for (i, timeout) in timeouts.iter().enumerate() {
                let key = format!("acc-{}", i);
                table.grant(&request(&format!("r-{}", i), "w", &[key.as_str()], Some(*timeout)), &config, now);
            }

            let at = now + ChronoDuration::milliseconds(offset);
            table.sweep_expired(at);
            prop_assert!(table.sweep_expired(at).is_empty());
        }
    }
}
