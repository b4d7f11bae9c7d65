//! Concurrent, sorted correlation cache keyed by managed-object key.
//!
//! Each key owns a slot with its own mutex. The outer map lock is held only
//! long enough to find or create a slot, so callers working on different
//! keys never wait on each other, while callers racing on the same key are
//! serialized on that key's slot and the value factory runs at most once.
//!
//! A slot whose factory failed stays empty: entries are either complete or
//! absent.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use crate::object::ObjectKey;

type Slot<V> = Arc<Mutex<Option<Arc<V>>>>;

pub struct CorrelationCache<V> {
    slots: RwLock<BTreeMap<ObjectKey, Slot<V>>>,
}

impl<V> Default for CorrelationCache<V> {
    fn default() -> Self {
        Self {
            slots: RwLock::new(BTreeMap::new()),
        }
    }
}

impl<V> CorrelationCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the slot for `key`, creating an empty one if needed.
    fn slot(&self, key: &ObjectKey) -> Slot<V> {
        if let Some(slot) = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return slot.clone();
        }
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default()
            .clone()
    }

    /// Returns the entry for `key`, if one has been stored.
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<V>> {
        let slot = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()?;
        let guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        guard.clone()
    }

    /// Stores `value` for `key`, replacing any previous entry.
    pub fn put(&self, key: &ObjectKey, value: V) -> Arc<V> {
        let value = Arc::new(value);
        let slot = self.slot(key);
        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(value.clone());
        value
    }

    /// Returns the entry for `key`, computing it with `factory` if absent.
    ///
    /// Concurrent callers for the same key block until the first one
    /// finishes and then observe its entry. If the factory fails, the error
    /// is returned to that caller and the key stays absent, so the next
    /// caller runs the factory again.
    pub fn get_or_try_insert_with<E, F>(&self, key: &ObjectKey, factory: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        let slot = self.slot(key);
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(value) = guard.as_ref() {
            return Ok(value.clone());
        }
        let value = Arc::new(factory()?);
        *guard = Some(value.clone());
        Ok(value)
    }

    /// Number of populated entries.
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Populated entries in ascending key order (id, then type).
    ///
    /// Slots are copied out before any of them is locked, so a factory in
    /// progress never holds up the map.
    pub fn snapshot(&self) -> Vec<(ObjectKey, Arc<V>)> {
        let slots: Vec<(ObjectKey, Slot<V>)> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();
        slots
            .into_iter()
            .filter_map(|(key, slot)| {
                let value = slot.lock().unwrap_or_else(PoisonError::into_inner).clone()?;
                Some((key, value))
            })
            .collect()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
