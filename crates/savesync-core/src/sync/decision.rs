//! User decision interface and conflict types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A key whose local and remote values differ.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub key: String,
    pub local: Value,
    pub remote: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Keep this device's value and push it to the remote store.
    UseLocal,
    /// Take the remote value and overwrite the local record.
    UseRemote,
}

/// Prompts supplied by the embedding application.
///
/// Calls may take as long as the user needs; the service bounds the ones
/// that sit on the startup path with its own timeouts.
#[async_trait]
pub trait UserDecision: Send + Sync {
    /// Offer an interactive sign-in to a player who signed in before.
    async fn confirm_login(&self) -> bool;

    /// Pick a side for a save-game conflict. `None` leaves both untouched.
    async fn resolve_conflict(&self, conflict: &Conflict) -> Option<Resolution>;
}
