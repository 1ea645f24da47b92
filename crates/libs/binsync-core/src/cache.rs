//! In-memory caching of derived, expensive-to-recompute views.
//!
//! Two independent sub-caches, matching §4.1: a state cache keyed by
//! `(user, version)` and invalidated when that user's branch head moves,
//! and a single-value users cache invalidated when the set of user
//! branches changes. Both may be read from any caller thread without
//! going through the [`crate::scheduler::Scheduler`] — entries are
//! immutable once inserted, and are only ever written by the scheduler
//! worker or by the caller thread immediately after a scheduler-produced
//! result, so no additional lock discipline is required beyond the
//! internal `Mutex`es here.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use git2::Oid;

use crate::state::{SharedState, User};

/// Key for a cached state read: the owning user, and an optional
/// historical version identifier (opaque to the engine; forwarded
/// verbatim to the host's `State::parse`).
pub type StateCacheKey = (String, Option<String>);

struct CachedState<S> {
    head: Oid,
    value: SharedState<S>,
}

/// Caches parsed `State` values keyed by `(user, version)`, invalidated
/// when the recorded head of that user's branch no longer matches the
/// branch's actual current head.
pub struct StateCache<S> {
    entries: Mutex<HashMap<StateCacheKey, CachedState<S>>>,
    branch_heads: Mutex<HashMap<String, Oid>>,
}

impl<S> StateCache<S> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            branch_heads: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a cached value for `(user, version)` if present and its
    /// recorded head still matches the branch's current head.
    pub fn get(&self, user: &str, version: Option<&str>) -> Option<SharedState<S>> {
        let key = (user.to_string(), version.map(str::to_string));
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let entry = entries.get(&key)?;
        let heads = self.branch_heads.lock().unwrap_or_else(|p| p.into_inner());
        if heads.get(user) == Some(&entry.head) {
            Some(Arc::clone(&entry.value))
        } else {
            None
        }
    }

    /// Installs a freshly computed value for `(user, version)`, recording
    /// the branch head it was computed against. Also registers that head
    /// as the current one for `user`, so a `get` immediately afterwards
    /// hits even before the next bulk [`Self::update_state_commits`] sweep.
    pub fn set(&self, user: &str, version: Option<&str>, head: Oid, value: SharedState<S>) {
        let key = (user.to_string(), version.map(str::to_string));
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.insert(key, CachedState { head, value });
        let mut heads = self.branch_heads.lock().unwrap_or_else(|p| p.into_inner());
        heads.insert(user.to_string(), head);
    }

    /// Bulk update of `(branch -> head)`. Evicts every cached entry whose
    /// branch head changed or whose branch disappeared entirely.
    pub fn update_state_commits(&self, new_heads: HashMap<String, Oid>) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.retain(|(user, _), cached| new_heads.get(user) == Some(&cached.head));
        let mut heads = self.branch_heads.lock().unwrap_or_else(|p| p.into_inner());
        *heads = new_heads;
    }
}

impl<S> Default for StateCache<S> {
    fn default() -> Self {
        Self::new()
    }
}

struct CachedUsers {
    branch_names: HashSet<String>,
    value: Arc<Vec<User>>,
}

/// Caches the single `users()` result, invalidated in bulk whenever the
/// set of user-branch names it was computed from changes.
pub struct UsersCache {
    inner: Mutex<Option<CachedUsers>>,
}

impl UsersCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    pub fn get(&self) -> Option<Arc<Vec<User>>> {
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.as_ref().map(|c| Arc::clone(&c.value))
    }

    pub fn set(&self, branch_names: HashSet<String>, value: Arc<Vec<User>>) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        *inner = Some(CachedUsers {
            branch_names,
            value,
        });
    }

    /// Evicts the cached list if `branch_names` differs from the set it
    /// was last computed from.
    pub fn update_user_branches(&self, branch_names: HashSet<String>) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let stale = match inner.as_ref() {
            Some(cached) => cached.branch_names != branch_names,
            None => false,
        };
        if stale {
            *inner = None;
        }
    }
}

impl Default for UsersCache {
    fn default() -> Self {
        Self::new()
    }
}

/// The two sub-caches a `Client` consults, bundled for convenience.
pub struct Cache<S> {
    pub states: StateCache<S>,
    pub users: UsersCache,
}

impl<S> Cache<S> {
    pub fn new() -> Self {
        Self {
            states: StateCache::new(),
            users: UsersCache::new(),
        }
    }
}

impl<S> Default for Cache<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    fn oid(byte: u8) -> Oid {
        let mut bytes = [0u8; 20];
        bytes[0] = byte;
        Oid::from_bytes(&bytes).unwrap()
    }

    #[test]
    fn state_cache_hits_while_head_unchanged() {
        let cache: StateCache<String> = StateCache::new();
        let head = oid(1);
        cache.update_state_commits(HashMap::from([("alice".to_string(), head)]));
        cache.set("alice", None, head, Arc::new("state-v1".to_string()));

        assert_eq!(cache.get("alice", None).as_deref(), Some(&"state-v1".to_string()));
    }

    #[test]
    fn state_cache_evicts_on_head_movement() {
        let cache: StateCache<String> = StateCache::new();
        let old_head = oid(1);
        let new_head = oid(2);
        cache.update_state_commits(HashMap::from([("alice".to_string(), old_head)]));
        cache.set("alice", None, old_head, Arc::new("state-v1".to_string()));
        assert!(cache.get("alice", None).is_some());

        cache.update_state_commits(HashMap::from([("alice".to_string(), new_head)]));
        assert!(cache.get("alice", None).is_none());
    }

    #[test]
    fn state_cache_evicts_when_branch_disappears() {
        let cache: StateCache<String> = StateCache::new();
        let head = oid(1);
        cache.update_state_commits(HashMap::from([("alice".to_string(), head)]));
        cache.set("alice", None, head, Arc::new("state-v1".to_string()));

        cache.update_state_commits(HashMap::new());
        assert!(cache.get("alice", None).is_none());
    }

    #[test]
    fn users_cache_evicts_on_branch_set_change() {
        let cache = UsersCache::new();
        let branches: HashSet<String> = ["binsync/alice".to_string()].into_iter().collect();
        cache.set(branches.clone(), Arc::new(vec![]));
        assert!(cache.get().is_some());

        let new_branches: HashSet<String> = ["binsync/alice".to_string(), "binsync/bob".to_string()]
            .into_iter()
            .collect();
        cache.update_user_branches(new_branches);
        assert!(cache.get().is_none());
    }

    #[test]
    fn users_cache_survives_identical_branch_set() {
        let cache = UsersCache::new();
        let branches: HashSet<String> = ["binsync/alice".to_string()].into_iter().collect();
        cache.set(branches.clone(), Arc::new(vec![]));

        cache.update_user_branches(branches);
        assert!(cache.get().is_some());
    }
}
