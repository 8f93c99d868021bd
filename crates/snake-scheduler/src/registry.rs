//! Pipeline-id keyed maps safe for concurrent mutation.
//!
//! The scheduler keeps two of these: the running set presented to the
//! service on every poll, and the cancel-handle map. Both are touched
//! from the poll loop and from pipeline tasks.

use std::collections::HashMap;
use std::sync::Mutex;

pub struct PipelineRegistry<V> {
    inner: Mutex<HashMap<i64, V>>,
}

impl<V: Clone> PipelineRegistry<V> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self, id: i64, value: V) {
        self.lock().insert(id, value);
    }

    pub fn load(&self, id: i64) -> Option<V> {
        self.lock().get(&id).cloned()
    }

    pub fn remove(&self, id: i64) -> Option<V> {
        self.lock().remove(&id)
    }

    /// Visit a snapshot of the entries. The visitor may delete entries
    /// through `remove` while iterating; such deletions are not observed
    /// by the ongoing walk. Returning `false` stops the walk.
    pub fn range(&self, mut visit: impl FnMut(i64, &V) -> bool) {
        let snapshot: Vec<(i64, V)> = self
            .lock()
            .iter()
            .map(|(id, value)| (*id, value.clone()))
            .collect();

        for (id, value) in &snapshot {
            if !visit(*id, value) {
                break;
            }
        }
    }

    pub fn keys(&self) -> Vec<i64> {
        self.lock().keys().copied().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, V>> {
        self.inner.lock().expect("pipeline registry mutex poisoned")
    }
}

impl<V: Clone> Default for PipelineRegistry<V> {
    fn default() -> Self {
        Self::new()
    }
}
