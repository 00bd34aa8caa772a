//! In-process text medium.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::LocalMedium;
use crate::error::{Result, SyncError};

/// Map-backed medium. Clones share the same underlying map.
///
/// An optional byte quota (keys plus values) mimics a browser-style storage
/// limit, and the medium can be switched off to mimic disabled storage.
#[derive(Clone, Default)]
pub struct MemoryMedium {
    items: Arc<Mutex<HashMap<String, String>>>,
    quota_bytes: Option<usize>,
    disabled: Arc<AtomicBool>,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            quota_bytes: Some(quota_bytes),
            ..Self::default()
        }
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::SeqCst);
    }

    /// Stored text for `key`, bypassing the disabled switch.
    pub fn raw(&self, key: &str) -> Option<String> {
        self.items
            .lock()
            .ok()
            .and_then(|items| items.get(key).cloned())
    }

    /// Write text directly, bypassing encoding and quota.
    pub fn insert_raw(&self, key: &str, value: &str) {
        if let Ok(mut items) = self.items.lock() {
            items.insert(key.to_string(), value.to_string());
        }
    }

    fn lock_items(&self) -> Result<MutexGuard<'_, HashMap<String, String>>> {
        if self.disabled.load(Ordering::SeqCst) {
            return Err(SyncError::Storage("Local storage is disabled".to_string()));
        }
        self.items
            .lock()
            .map_err(|_| SyncError::Storage("Memory medium poisoned".to_string()))
    }
}

impl LocalMedium for MemoryMedium {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock_items()?.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let mut items = self.lock_items()?;
        if let Some(quota) = self.quota_bytes {
            let used: usize = items
                .iter()
                .filter(|(existing, _)| existing.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            if used + key.len() + value.len() > quota {
                return Err(SyncError::Storage(format!(
                    "Quota exceeded ({} bytes)",
                    quota
                )));
            }
        }
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        self.lock_items()?.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self.lock_items()?.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let medium = MemoryMedium::new();
        let other = medium.clone();
        medium.set_item("a", "1").unwrap();
        assert_eq!(other.get_item("a").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn test_quota_counts_replaced_value_once() {
        let medium = MemoryMedium::with_quota(8);
        medium.set_item("k", "1234567").unwrap();
        medium.set_item("k", "7654321").unwrap();
        assert!(medium.set_item("j", "1").is_err());
    }

    #[test]
    fn test_disabled_medium_errors() {
        let medium = MemoryMedium::new();
        medium.set_disabled(true);
        assert!(medium.get_item("a").is_err());
        assert!(medium.set_item("a", "1").is_err());
        medium.set_disabled(false);
        assert!(medium.set_item("a", "1").is_ok());
    }
}
