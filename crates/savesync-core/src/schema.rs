//! Declarative key schema and canonical value encoding.
//!
//! Every persisted value is a `serde_json::Value`. The local medium only
//! stores text, so each declared key carries a [`ValueKind`] that decides
//! how the value is written: booleans, numbers and strings are stored as
//! bare literals (`true`, `42`, `hello`), structured values and undeclared
//! keys as JSON text. The same table drives coercion on the remote path, so
//! both stores agree on the canonical text of a value.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::error::{Result, SyncError};

/// Declared type of a storage key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Boolean,
    String,
    Number,
    Structured,
}

impl ValueKind {
    /// Kinds stored as an unquoted literal rather than JSON text.
    pub fn is_literal(self) -> bool {
        !matches!(self, ValueKind::Structured)
    }
}

/// Static `key → kind` table supplied by the embedding application.
///
/// Two session bookkeeping keys are always registered as local-only:
/// `<prefix>auto_login` and `<prefix>last_login`. Local-only keys are never
/// mirrored to the remote store and never overwritten by it.
#[derive(Debug, Clone)]
pub struct KeySchema {
    prefix: String,
    kinds: BTreeMap<String, ValueKind>,
    local_only: HashSet<String>,
    save_game_key: Option<String>,
}

impl KeySchema {
    const AUTO_LOGIN_SUFFIX: &'static str = "auto_login";
    const LAST_LOGIN_SUFFIX: &'static str = "last_login";

    /// Create a schema whose managed keys all start with `prefix`.
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let mut schema = Self {
            prefix,
            kinds: BTreeMap::new(),
            local_only: HashSet::new(),
            save_game_key: None,
        };
        let auto_login = schema.auto_login_key();
        let last_login = schema.last_login_key();
        schema = schema
            .with_local_only(auto_login, ValueKind::Boolean)
            .with_local_only(last_login, ValueKind::Number);
        schema
    }

    pub fn with_key(mut self, key: impl Into<String>, kind: ValueKind) -> Self {
        self.kinds.insert(key.into(), kind);
        self
    }

    pub fn with_local_only(mut self, key: impl Into<String>, kind: ValueKind) -> Self {
        let key = key.into();
        self.local_only.insert(key.clone());
        self.kinds.insert(key, kind);
        self
    }

    /// Mark the single high-stakes key whose conflicts are escalated to the user.
    pub fn with_save_game_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.kinds.insert(key.clone(), ValueKind::Structured);
        self.save_game_key = Some(key);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn kind_of(&self, key: &str) -> Option<ValueKind> {
        self.kinds.get(key).copied()
    }

    pub fn is_local_only(&self, key: &str) -> bool {
        self.local_only.contains(key)
    }

    pub fn is_save_game(&self, key: &str) -> bool {
        self.save_game_key.as_deref() == Some(key)
    }

    pub fn save_game_key(&self) -> Option<&str> {
        self.save_game_key.as_deref()
    }

    pub fn auto_login_key(&self) -> String {
        format!("{}{}", self.prefix, Self::AUTO_LOGIN_SUFFIX)
    }

    pub fn last_login_key(&self) -> String {
        format!("{}{}", self.prefix, Self::LAST_LOGIN_SUFFIX)
    }

    /// True if `key` belongs to this application's namespace.
    pub fn is_managed(&self, key: &str) -> bool {
        key.starts_with(&self.prefix) || self.kinds.contains_key(key)
    }

    /// Declared keys with a literal kind, in a stable order.
    pub fn literal_keys(&self) -> impl Iterator<Item = (&str, ValueKind)> {
        self.kinds
            .iter()
            .filter(|(_, kind)| kind.is_literal())
            .map(|(key, kind)| (key.as_str(), *kind))
    }

    /// Keys eligible for reconciliation: every declared key plus every managed
    /// key found locally, minus local-only bookkeeping. Sorted and de-duplicated.
    pub fn syncable_keys<'a>(&self, local_keys: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let mut keys: Vec<String> = self
            .kinds
            .keys()
            .cloned()
            .chain(
                local_keys
                    .into_iter()
                    .filter(|key| self.is_managed(key))
                    .map(str::to_string),
            )
            .filter(|key| !self.is_local_only(key))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    /// Encode a value into the canonical text stored for `key`.
    ///
    /// Literal kinds are coerced first; a value that cannot be coerced to the
    /// declared kind is rejected.
    pub fn encode(&self, key: &str, value: &Value) -> Result<String> {
        match self.kind_of(key) {
            Some(kind) if kind.is_literal() => {
                let coerced = coerce_value(kind, value).ok_or_else(|| {
                    SyncError::InvalidInput(format!(
                        "Value for '{}' is not a valid {:?}: {}",
                        key, kind, value
                    ))
                })?;
                Ok(literal_text(&coerced))
            }
            _ => Ok(serde_json::to_string(value)?),
        }
    }

    /// Decode stored text for `key`. Never fails: text that does not parse
    /// is returned verbatim as a string value.
    pub fn decode(&self, key: &str, raw: &str) -> Value {
        match self.kind_of(key) {
            Some(kind) if kind.is_literal() => parse_literal(kind, raw)
                .unwrap_or_else(|| {
                    tracing::warn!(key = %key, kind = ?kind, "stored value does not match declared kind");
                    Value::String(raw.to_string())
                }),
            _ => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
        }
    }

    /// Apply the declared kind to a value that came from an untyped source
    /// (remote content, caller input). Values that cannot be coerced are
    /// returned unchanged.
    pub fn coerce(&self, key: &str, value: Value) -> Value {
        match self.kind_of(key) {
            Some(kind) if kind.is_literal() => coerce_value(kind, &value).unwrap_or(value),
            _ => value,
        }
    }
}

/// Text form of an already-coerced literal value.
fn literal_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Remove layers of JSON string quoting left over from older encodings,
/// e.g. `"\"true\""` becomes `true`.
fn unquote_string(raw: &str) -> String {
    let mut current = raw.to_string();
    while current.len() >= 2 && current.starts_with('"') && current.ends_with('"') {
        match serde_json::from_str::<String>(&current) {
            Ok(inner) => current = inner,
            Err(_) => break,
        }
    }
    current
}

fn parse_number(text: &str) -> Option<Number> {
    if let Ok(int) = text.parse::<i64>() {
        return Some(Number::from(int));
    }
    text.parse::<f64>().ok().and_then(number_from_f64)
}

fn number_from_f64(value: f64) -> Option<Number> {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Some(Number::from(value as i64))
    } else {
        Number::from_f64(value)
    }
}

fn parse_literal(kind: ValueKind, raw: &str) -> Option<Value> {
    match kind {
        ValueKind::Boolean => match unquote_string(raw.trim()).trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(Value::Bool(true)),
            "false" | "0" => Some(Value::Bool(false)),
            _ => None,
        },
        ValueKind::Number => parse_number(unquote_string(raw.trim()).trim()).map(Value::Number),
        // Strings are stored verbatim; quotes may be part of the value.
        ValueKind::String => Some(Value::String(raw.to_string())),
        ValueKind::Structured => serde_json::from_str(raw).ok(),
    }
}

fn coerce_value(kind: ValueKind, value: &Value) -> Option<Value> {
    match (kind, value) {
        (ValueKind::Boolean, Value::Bool(_)) => Some(value.clone()),
        (ValueKind::Boolean, Value::Number(n)) => match n.as_f64() {
            Some(v) if v == 0.0 => Some(Value::Bool(false)),
            Some(v) if v == 1.0 => Some(Value::Bool(true)),
            _ => None,
        },
        (ValueKind::Number, Value::Number(n)) => {
            n.as_f64().and_then(number_from_f64).map(Value::Number)
        }
        (ValueKind::String, Value::String(_)) => Some(value.clone()),
        (ValueKind::String, Value::Bool(_) | Value::Number(_)) => {
            Some(Value::String(literal_text(value)))
        }
        (kind, Value::String(s)) => parse_literal(kind, s),
        (ValueKind::Structured, _) => Some(value.clone()),
        _ => None,
    }
}
