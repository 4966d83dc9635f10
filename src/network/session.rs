//! Per-connection session blob
//!
//! Handlers stash whatever they need across packets here (account id, world
//! session, character selection...). The connection carries it for its
//! whole lifetime and drops it on teardown without ever looking inside.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

/// Opaque key-value store owned by handler code
#[derive(Default)]
pub struct Session {
    values: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, returning the previous one if it had the same type
    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) -> Option<T> {
        self.values
            .insert(key.into(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    /// Typed lookup. `None` if the key is absent or holds another type.
    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.values.get(key).and_then(|value| value.downcast_ref::<T>())
    }

    pub fn get_mut<T: Any + Send + Sync>(&mut self, key: &str) -> Option<&mut T> {
        self.values
            .get_mut(key)
            .and_then(|value| value.downcast_mut::<T>())
    }

    pub fn remove<T: Any + Send + Sync>(&mut self, key: &str) -> Option<T> {
        self.values
            .remove(key)
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Values are opaque; only the keys are printable
        f.debug_set().entries(self.values.keys()).finish()
    }
}
