use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;

use crate::error::ScriptError;
use crate::factory::InstanceFactory;
use crate::instance::ScriptInstance;

/// Identity-keyed store of live script instances.
///
/// The map lock is only held to look up, insert or remove entries. Building
/// and compiling a new instance, and every guest call, happen outside it, so
/// different identities never wait on each other.
pub struct ScriptCache {
    factory: InstanceFactory,
    entries: RwLock<HashMap<String, Arc<ScriptInstance>>>,
}

impl ScriptCache {
    pub fn new(factory: InstanceFactory) -> Self {
        Self {
            factory,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn into_factory(self) -> InstanceFactory {
        self.factory
    }

    /// Return the instance for `identity` with `script` loaded, creating or
    /// reloading it as needed.
    ///
    /// A failed first load stores nothing. A failed reload leaves the entry
    /// serving its previous script.
    pub fn acquire(&self, identity: &str, script: &str) -> Result<Arc<ScriptInstance>, ScriptError> {
        let instance = self.get_or_create(identity, script)?;
        instance.ensure_script(script)?;
        Ok(instance)
    }

    /// Existing instance for `identity`, marked as used. Never creates one.
    pub fn lookup(&self, identity: &str) -> Result<Arc<ScriptInstance>, ScriptError> {
        self.get(identity)
            .ok_or_else(|| ScriptError::NotFound(identity.to_string()))
    }

    /// Existing instance for `identity`, or a new one with `script` already
    /// loaded. An existing instance may still hold different text.
    ///
    /// The returned instance has been marked as used while the map lock was
    /// held, so a concurrent sweep cannot expire it before the caller runs.
    pub(crate) fn get_or_create(
        &self,
        identity: &str,
        script: &str,
    ) -> Result<Arc<ScriptInstance>, ScriptError> {
        if let Some(instance) = self.get(identity) {
            tracing::debug!(identity, "Cache hit");
            return Ok(instance);
        }

        let fresh = Arc::new(self.factory.new_instance(identity)?);
        fresh.ensure_script(script)?;

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let stored = entries
            .entry(identity.to_string())
            .or_insert_with(|| Arc::clone(&fresh));
        stored.touch();
        if Arc::ptr_eq(stored, &fresh) {
            tracing::info!(identity, "Script instance created");
        } else {
            tracing::debug!(identity, "Lost creation race, using the stored instance");
        }
        Ok(Arc::clone(stored))
    }

    pub fn evict(&self, identity: &str) -> bool {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(identity)
            .is_some();
        if removed {
            tracing::info!(identity, "Script instance evicted");
        }
        removed
    }

    /// Drop every entry idle for at least `ttl`.
    ///
    /// Entries whose lock is held by an in-flight call are kept until a later
    /// sweep. Returns the number of entries removed.
    pub fn sweep_expired(&self, ttl: Duration) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|identity, instance| {
            let expired = instance.idle_for(now) >= ttl;
            if expired && instance.is_busy() {
                tracing::debug!(identity, "Skipping eviction of busy instance");
                return true;
            }
            if expired {
                tracing::info!(identity, "Script instance expired");
            }
            !expired
        });
        let removed = before - entries.len();
        tracing::debug!(removed, remaining = entries.len(), "Cache sweep finished");
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // Touching under the read lock orders it before any sweep, which needs
    // the write lock.
    fn get(&self, identity: &str) -> Option<Arc<ScriptInstance>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let instance = entries.get(identity)?;
        instance.touch();
        Some(Arc::clone(instance))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;

    use super::*;
    use crate::config::RuntimeConfig;
    use crate::library::LibrarySet;

    const COUNTER: &str = r#"
        state.set("loads", state.get_or("loads", 0) + 1);
        fn handler() { state.get("loads") }
    "#;

    fn cache() -> ScriptCache {
        let libraries = Arc::new(LibrarySet::load_bundled().unwrap());
        ScriptCache::new(InstanceFactory::new(libraries, &RuntimeConfig::default()))
    }

    #[test]
    fn acquire_reuses_the_instance() {
        let cache = cache();
        let first = cache.acquire("meter", COUNTER).unwrap();
        let second = cache.acquire("meter", COUNTER).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.invoke(Vec::new()).unwrap().as_int().unwrap(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failed_first_load_stores_nothing() {
        let cache = cache();
        assert!(cache.acquire("broken", "fn handler( {").is_err());
        assert!(cache.is_empty());
        assert!(matches!(cache.lookup("broken"), Err(ScriptError::NotFound(_))));
    }

    #[test]
    fn evict_removes_entry() {
        let cache = cache();
        cache.acquire("gone", COUNTER).unwrap();
        assert!(cache.evict("gone"));
        assert!(!cache.evict("gone"));
        assert!(cache.is_empty());
    }

    #[test]
    fn sweep_keeps_fresh_entries() {
        let cache = cache();
        cache.acquire("fresh", COUNTER).unwrap();
        assert_eq!(cache.sweep_expired(Duration::from_secs(60)), 0);
        assert_eq!(cache.sweep_expired(Duration::ZERO), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn lookups_refresh_idle_time_before_a_sweep() {
        let cache = cache();
        cache.acquire("polled", COUNTER).unwrap();
        std::thread::sleep(Duration::from_millis(60));

        let instance = cache.lookup("polled").unwrap();
        assert_eq!(cache.sweep_expired(Duration::from_millis(40)), 0);
        assert!(Arc::ptr_eq(&instance, &cache.lookup("polled").unwrap()));

        std::thread::sleep(Duration::from_millis(60));
        cache.get_or_create("polled", COUNTER).unwrap();
        assert_eq!(cache.sweep_expired(Duration::from_millis(40)), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn sweep_skips_instances_mid_call() {
        let cache = Arc::new(cache());
        let instance = cache
            .acquire("busy", "fn handler(ms) { apilib::sleep(ms); 1 }")
            .unwrap();

        let started = Arc::new(Barrier::new(2));
        let call = {
            let started = Arc::clone(&started);
            std::thread::spawn(move || {
                started.wait();
                instance.invoke(vec![crate::value::Arg::host(300)])
            })
        };
        started.wait();
        // Give the call time to take the instance lock.
        std::thread::sleep(Duration::from_millis(100));

        assert_eq!(cache.sweep_expired(Duration::ZERO), 0);
        assert_eq!(cache.len(), 1);

        call.join().unwrap().unwrap();
        assert_eq!(cache.sweep_expired(Duration::ZERO), 1);
    }

    #[test]
    fn racing_creators_share_one_instance() {
        let cache = cache();
        let instances: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| cache.acquire("race", COUNTER).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(cache.len(), 1);
        let stored = cache.lookup("race").unwrap();
        assert!(instances.iter().all(|i| Arc::ptr_eq(i, &stored)));
    }
}
