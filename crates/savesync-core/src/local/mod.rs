//! Local store: synchronous, always-available key/value persistence.
//!
//! The store is the contract of last resort. Every operation returns a plain
//! `bool` / `Option` and logs medium failures instead of propagating them,
//! so gameplay persistence is never blocked by a broken medium.
//!
//! ## Media
//!
//! - [`SqliteMedium`]: a single `kv` table in a SQLite file (or in memory)
//! - [`MemoryMedium`]: a process-local map with an optional byte quota
//!
//! Any other text store can be plugged in through [`LocalMedium`].

mod memory;
mod sqlite;

use std::sync::Arc;

use serde_json::Value;

use crate::error::Result;
use crate::schema::KeySchema;

pub use memory::MemoryMedium;
pub use sqlite::SqliteMedium;

/// Text-only key/value medium underneath a [`LocalStore`].
///
/// Implementations report failures as errors; the store decides how to
/// surface them.
pub trait LocalMedium: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>>;

    fn set_item(&self, key: &str, value: &str) -> Result<()>;

    /// Removing an absent key is not an error.
    fn remove_item(&self, key: &str) -> Result<()>;

    fn keys(&self) -> Result<Vec<String>>;
}

/// Typed adapter over a [`LocalMedium`] driven by a [`KeySchema`].
pub struct LocalStore {
    medium: Box<dyn LocalMedium>,
    schema: Arc<KeySchema>,
}

impl LocalStore {
    pub fn new(medium: impl LocalMedium + 'static, schema: Arc<KeySchema>) -> Self {
        Self {
            medium: Box::new(medium),
            schema,
        }
    }

    pub fn schema(&self) -> &KeySchema {
        &self.schema
    }

    pub fn save(&self, key: &str, value: &Value) -> bool {
        let text = match self.schema.encode(key, value) {
            Ok(text) => text,
            Err(err) => {
                tracing::error!(key = %key, error = %err, "local save rejected");
                return false;
            }
        };
        match self.medium.set_item(key, &text) {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(key = %key, error = %err, "local save failed");
                false
            }
        }
    }

    pub fn load(&self, key: &str) -> Option<Value> {
        match self.medium.get_item(key) {
            Ok(raw) => raw.map(|raw| self.schema.decode(key, &raw)),
            Err(err) => {
                tracing::error!(key = %key, error = %err, "local load failed");
                None
            }
        }
    }

    /// Idempotent: deleting an absent key succeeds.
    pub fn delete(&self, key: &str) -> bool {
        match self.medium.remove_item(key) {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(key = %key, error = %err, "local delete failed");
                false
            }
        }
    }

    pub fn has(&self, key: &str) -> bool {
        match self.medium.get_item(key) {
            Ok(raw) => raw.is_some(),
            Err(err) => {
                tracing::error!(key = %key, error = %err, "local lookup failed");
                false
            }
        }
    }

    pub fn keys(&self) -> Vec<String> {
        self.medium.keys().unwrap_or_else(|err| {
            tracing::error!(error = %err, "local key listing failed");
            Vec::new()
        })
    }

    /// Rewrite every declared literal-kind record into its canonical form.
    ///
    /// Older builds stored literals as JSON text (`"\"true\""`); boolean and
    /// number records in that shape are decoded leniently and re-encoded.
    /// String records are stored verbatim and never rewritten. Returns the number of
    /// records rewritten.
    pub fn fix_existing_data(&self) -> usize {
        let mut fixed = 0;
        for (key, _kind) in self.schema.literal_keys() {
            let raw = match self.medium.get_item(key) {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "skipping repair");
                    continue;
                }
            };
            let value = self.schema.decode(key, &raw);
            let canonical = match self.schema.encode(key, &value) {
                Ok(text) => text,
                Err(err) => {
                    tracing::warn!(key = %key, error = %err, "record cannot be repaired");
                    continue;
                }
            };
            if canonical == raw {
                continue;
            }
            match self.medium.set_item(key, &canonical) {
                Ok(()) => {
                    tracing::debug!(key = %key, from = %raw, to = %canonical, "repaired record");
                    fixed += 1;
                }
                Err(err) => tracing::warn!(key = %key, error = %err, "repair write failed"),
            }
        }
        fixed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ValueKind;
    use serde_json::json;

    fn store() -> (LocalStore, MemoryMedium) {
        let medium = MemoryMedium::new();
        let schema = KeySchema::new("game_")
            .with_key("game_sound", ValueKind::Boolean)
            .with_key("game_volume", ValueKind::Number)
            .with_key("game_name", ValueKind::String)
            .with_save_game_key("game_save");
        (LocalStore::new(medium.clone(), Arc::new(schema)), medium)
    }

    #[test]
    fn test_round_trip_all_kinds() {
        let (store, _) = store();
        let cases = [
            ("game_sound", json!(false)),
            ("game_volume", json!(0.75)),
            ("game_name", json!("Ayla")),
            ("game_save", json!({"level": 3, "inventory": ["sword", "key"]})),
            ("game_undeclared", json!([1, 2, 3])),
        ];
        for (key, value) in cases {
            assert!(store.save(key, &value), "save {}", key);
            assert_eq!(store.load(key), Some(value), "load {}", key);
        }
    }

    #[test]
    fn test_string_with_embedded_quotes_round_trips() {
        let (store, medium) = store();
        let name = json!("\"Ayla\" the brave");
        let quoted = json!("\"Ayla\"");

        assert!(store.save("game_name", &name));
        assert_eq!(store.load("game_name"), Some(name));
        assert!(store.save("game_name", &quoted));
        assert_eq!(store.load("game_name"), Some(quoted.clone()));

        // Repair leaves string records alone.
        assert_eq!(store.fix_existing_data(), 0);
        assert_eq!(medium.raw("game_name").as_deref(), Some("\"Ayla\""));
        assert_eq!(store.load("game_name"), Some(quoted));
    }

    #[test]
    fn test_literals_are_human_readable() {
        let (store, medium) = store();
        store.save("game_sound", &json!(true));
        store.save("game_name", &json!("Ayla"));
        assert_eq!(medium.raw("game_sound").as_deref(), Some("true"));
        assert_eq!(medium.raw("game_name").as_deref(), Some("Ayla"));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (store, _) = store();
        assert!(store.delete("game_sound"));
        assert!(!store.has("game_sound"));
        store.save("game_sound", &json!(true));
        assert!(store.delete("game_sound"));
        assert!(!store.has("game_sound"));
        assert_eq!(store.load("game_sound"), None);
    }

    #[test]
    fn test_medium_failure_reports_false() {
        let (store, medium) = store();
        store.save("game_volume", &json!(1));
        medium.set_disabled(true);
        assert!(!store.save("game_volume", &json!(2)));
        assert_eq!(store.load("game_volume"), None);
        assert!(!store.has("game_volume"));
        assert!(!store.delete("game_volume"));
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_quota_exceeded_reports_false() {
        let medium = MemoryMedium::with_quota(16);
        let store = LocalStore::new(medium, Arc::new(KeySchema::new("game_")));
        assert!(!store.save("game_blob", &json!("x".repeat(64))));
        assert!(!store.has("game_blob"));
    }

    #[test]
    fn test_malformed_legacy_blob_returns_raw_text() {
        let (store, medium) = store();
        medium.insert_raw("game_legacy", "{broken");
        assert_eq!(store.load("game_legacy"), Some(json!("{broken")));
    }

    #[test]
    fn test_fix_existing_data_canonicalizes_quoted_literals() {
        let (store, medium) = store();
        medium.insert_raw("game_sound", "\"true\"");
        medium.insert_raw("game_volume", "\"\\\"42\\\"\"");
        medium.insert_raw("game_name", "Ayla");
        medium.insert_raw("game_save", "{\"level\":1}");

        assert_eq!(store.fix_existing_data(), 2);
        assert_eq!(medium.raw("game_sound").as_deref(), Some("true"));
        assert_eq!(medium.raw("game_volume").as_deref(), Some("42"));
        assert_eq!(medium.raw("game_name").as_deref(), Some("Ayla"));
        assert_eq!(medium.raw("game_save").as_deref(), Some("{\"level\":1}"));

        assert_eq!(store.fix_existing_data(), 0);
    }

    #[test]
    fn test_fix_existing_data_leaves_unrepairable_records() {
        let (store, medium) = store();
        medium.insert_raw("game_volume", "loud");
        assert_eq!(store.fix_existing_data(), 0);
        assert_eq!(medium.raw("game_volume").as_deref(), Some("loud"));
    }
}
