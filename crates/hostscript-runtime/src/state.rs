use std::sync::{Arc, PoisonError, RwLock};

use rhai::{Array, Dynamic, Engine, INT, Map};

/// Per-instance mutable state container, bound as the `state` global.
///
/// Guests see it read-only by name and mutate it through its methods, so
/// every method takes the handle by value; clones share one map.
#[derive(Debug, Clone, Default)]
pub struct StateHandle {
    inner: Arc<RwLock<Map>>,
}

impl StateHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Dynamic> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.get(key).cloned()
    }

    pub fn set(&self, key: &str, value: Dynamic) {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(key.into(), value.flatten());
    }

    pub fn remove(&self, key: &str) -> Option<Dynamic> {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.remove(key)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn keys(&self) -> Array {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.keys().map(|k| Dynamic::from(k.to_string())).collect()
    }

    pub(crate) fn register(engine: &mut Engine) {
        engine.register_type_with_name::<StateHandle>("State");
        engine.register_fn("get", |state: StateHandle, key: &str| {
            state.get(key).unwrap_or(Dynamic::UNIT)
        });
        engine.register_fn("get_or", |state: StateHandle, key: &str, fallback: Dynamic| {
            state.get(key).unwrap_or(fallback)
        });
        engine.register_fn("set", |state: StateHandle, key: &str, value: Dynamic| {
            state.set(key, value);
        });
        engine.register_fn("has", |state: StateHandle, key: &str| state.get(key).is_some());
        engine.register_fn("remove", |state: StateHandle, key: &str| {
            state.remove(key).unwrap_or(Dynamic::UNIT)
        });
        engine.register_fn("len", |state: StateHandle| state.len() as INT);
        engine.register_fn("keys", |state: StateHandle| state.keys());
    }
}
