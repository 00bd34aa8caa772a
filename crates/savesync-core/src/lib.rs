//! # Savesync Core
//!
//! Persistence and cross-device sync for game state.
//!
//! Values live in a fast local store and are mirrored to a per-user remote
//! object store once the player signs in. Gameplay code talks to a single
//! [`SyncService`]; it never waits on the network for saves.
//!
//! ## Architecture
//!
//! - **schema**: key registry, value kinds and the canonical text encoding
//! - **local**: synchronous key/value store over a pluggable medium
//! - **remote**: container/object storage client with id caching
//! - **auth**: sign-in state and auto-login bookkeeping
//! - **sync**: save/load routing, debouncing and reconciliation
//! - **config**: TOML-backed timeouts and endpoints

pub mod auth;
pub mod config;
pub mod error;
pub mod local;
pub mod remote;
pub mod schema;
pub mod sync;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use auth::{AccessToken, AuthSession, AuthState, IdentityProvider};
pub use config::SyncConfig;
pub use error::{Result, SyncError};
pub use local::{LocalMedium, LocalStore, MemoryMedium, SqliteMedium};
pub use remote::{DriveApi, ObjectStorageApi, RemoteObject, RemoteStore};
pub use schema::{KeySchema, ValueKind};
pub use sync::{
    Conflict, InitReport, Resolution, StorageEvent, SyncDirection, SyncOutcome, SyncReport,
    SyncService, UserDecision,
};

/// Core version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
