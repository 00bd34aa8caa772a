//! Per-key pending save timers.
//!
//! At most one timer exists per key. Scheduling a new one aborts the old
//! timer outright, so only the last value inside the window is ever saved.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde_json::Value;
use tokio::task::JoinHandle;

struct PendingSave {
    id: u64,
    value: Value,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub(crate) struct Debouncer {
    pending: Mutex<HashMap<String, PendingSave>>,
    next_id: AtomicU64,
}

impl Debouncer {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingSave>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Register a timer for `key`, replacing any earlier one.
    ///
    /// `spawn` receives the timer id and runs under the registry lock, so the
    /// timer cannot observe the registry before its own entry exists.
    pub(crate) fn schedule<F>(&self, key: &str, value: Value, spawn: F)
    where
        F: FnOnce(u64) -> JoinHandle<()>,
    {
        let mut pending = self.lock();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let handle = spawn(id);
        if let Some(previous) = pending.insert(key.to_string(), PendingSave { id, value, handle }) {
            previous.handle.abort();
        }
    }

    /// Called by a timer when it fires. Returns the value to save if the
    /// timer is still the current one for `key`.
    pub(crate) fn take_if_current(&self, key: &str, id: u64) -> Option<Value> {
        let mut pending = self.lock();
        match pending.get(key) {
            Some(entry) if entry.id == id => pending.remove(key).map(|entry| entry.value),
            _ => None,
        }
    }

    pub(crate) fn cancel(&self, key: &str) -> bool {
        match self.lock().remove(key) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Abort every timer and hand back the values they would have saved.
    pub(crate) fn drain(&self) -> Vec<(String, Value)> {
        let mut pending = self.lock();
        let mut drained: Vec<(String, Value)> = pending
            .drain()
            .map(|(key, entry)| {
                entry.handle.abort();
                (key, entry.value)
            })
            .collect();
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        drained
    }

    pub(crate) fn pending_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}
