//! Remote store: asynchronous key/value persistence over object storage.
//!
//! All objects of one identity live inside a single container found by its
//! well-known name. Each key maps to one object named after the key. The
//! store resolves and caches:
//!
//! - the container id, once per session, through a shared in-flight
//!   resolution so concurrent first calls create at most one container
//! - `key → object id`, collapsing duplicate objects to the most recently
//!   modified one and deleting the rest in the background
//!
//! The `try_*` methods propagate errors; the plain methods swallow them into
//! `bool` / `Option` with a log line.

pub mod api;
pub mod http;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::auth::{AccessToken, AuthSession};
use crate::error::{Result, SyncError};
use crate::schema::KeySchema;

pub use api::{ObjectStorageApi, RemoteObject};
pub use http::DriveApi;

enum ContainerSlot {
    Empty,
    Resolving(watch::Receiver<Option<Option<String>>>),
    Ready(String),
}

enum Role {
    Leader(watch::Sender<Option<Option<String>>>),
    Follower(watch::Receiver<Option<Option<String>>>),
}

/// Resets the container slot if the leading resolution is dropped mid-flight.
struct ResolveGuard<'a> {
    slot: &'a Mutex<ContainerSlot>,
    done: bool,
}

impl Drop for ResolveGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
            if matches!(*slot, ContainerSlot::Resolving(_)) {
                *slot = ContainerSlot::Empty;
            }
        }
    }
}

pub struct RemoteStore {
    api: Arc<dyn ObjectStorageApi>,
    session: Arc<AuthSession>,
    schema: Arc<KeySchema>,
    container_name: String,
    container: Mutex<ContainerSlot>,
    // Bumped on sign-out so a resolution started by a previous identity
    // cannot publish its container.
    epoch: AtomicU64,
    ids: Mutex<HashMap<String, String>>,
    cleanup: Mutex<Vec<JoinHandle<()>>>,
}

impl RemoteStore {
    pub fn new(
        api: Arc<dyn ObjectStorageApi>,
        session: Arc<AuthSession>,
        schema: Arc<KeySchema>,
        container_name: impl Into<String>,
    ) -> Self {
        Self {
            api,
            session,
            schema,
            container_name: container_name.into(),
            container: Mutex::new(ContainerSlot::Empty),
            epoch: AtomicU64::new(0),
            ids: Mutex::new(HashMap::new()),
            cleanup: Mutex::new(Vec::new()),
        }
    }

    pub fn session(&self) -> &Arc<AuthSession> {
        &self.session
    }

    fn lock_slot(&self) -> MutexGuard<'_, ContainerSlot> {
        self.container.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_ids(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.ids.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn spawn_cleanup<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut cleanup = self.cleanup.lock().unwrap_or_else(|p| p.into_inner());
        cleanup.retain(|handle| !handle.is_finished());
        cleanup.push(tokio::spawn(task));
    }

    /// Wait for background duplicate cleanup started so far.
    pub async fn wait_for_cleanup(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut cleanup = self.cleanup.lock().unwrap_or_else(|p| p.into_inner());
            cleanup.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    // --- Session controls ---

    pub fn is_user_signed_in(&self) -> bool {
        self.session.is_signed_in()
    }

    pub async fn sign_in(&self, silent: bool, timeout: Duration) -> bool {
        self.session.sign_in(silent, timeout).await
    }

    pub async fn sign_out(&self) {
        self.session.sign_out().await;
        self.clear_caches();
    }

    pub fn handle_revocation(&self) {
        self.session.handle_revocation();
        self.clear_caches();
    }

    pub fn clear_caches(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        *self.lock_slot() = ContainerSlot::Empty;
        self.lock_ids().clear();
    }

    pub fn cached_object_id(&self, key: &str) -> Option<String> {
        self.lock_ids().get(key).cloned()
    }

    // --- Resolution ---

    /// Locate or create the container, sharing one in-flight resolution
    /// between concurrent callers.
    pub async fn ensure_container(&self, token: &AccessToken) -> Result<String> {
        let role = {
            let mut slot = self.lock_slot();
            match &*slot {
                ContainerSlot::Ready(id) => return Ok(id.clone()),
                ContainerSlot::Resolving(rx) => Role::Follower(rx.clone()),
                ContainerSlot::Empty => {
                    let (tx, rx) = watch::channel(None);
                    *slot = ContainerSlot::Resolving(rx);
                    Role::Leader(tx)
                }
            }
        };

        match role {
            Role::Follower(mut rx) => {
                let outcome = match rx.wait_for(Option::is_some).await {
                    Ok(outcome) => (*outcome).clone().flatten(),
                    Err(_) => None,
                };
                outcome.ok_or_else(|| {
                    SyncError::Storage("Container resolution failed".to_string())
                })
            }
            Role::Leader(tx) => {
                let epoch = self.epoch.load(Ordering::SeqCst);
                let mut guard = ResolveGuard {
                    slot: &self.container,
                    done: false,
                };
                let mut result = self.resolve_container(token).await;
                {
                    let mut slot = self.lock_slot();
                    if self.epoch.load(Ordering::SeqCst) == epoch {
                        *slot = match &result {
                            Ok(id) => ContainerSlot::Ready(id.clone()),
                            Err(_) => ContainerSlot::Empty,
                        };
                    } else {
                        // Signed out mid-resolution; the id belongs to the old identity.
                        tracing::debug!("discarding container resolved before sign-out");
                        result = Err(SyncError::NotSignedIn);
                    }
                }
                guard.done = true;
                let _ = tx.send(Some(result.as_ref().ok().cloned()));
                result
            }
        }
    }

    async fn resolve_container(&self, token: &AccessToken) -> Result<String> {
        let mut found = self
            .api
            .list_containers(token, &self.container_name)
            .await?;
        if found.is_empty() {
            let created = self
                .api
                .create_container(token, &self.container_name)
                .await?;
            tracing::info!(container = %created.id, name = %self.container_name, "created container");
            return Ok(created.id);
        }

        let canonical = found.remove(0);
        if !found.is_empty() {
            tracing::warn!(
                name = %self.container_name,
                extra = found.len(),
                "removing duplicate containers"
            );
            for extra in found {
                let api = self.api.clone();
                let token = token.clone();
                self.spawn_cleanup(async move {
                    if let Err(err) = api.delete_container(&token, &extra.id).await {
                        tracing::warn!(container = %extra.id, error = %err, "duplicate container cleanup failed");
                    }
                });
            }
        }
        Ok(canonical.id)
    }

    /// Resolve the object id for `key`, collapsing duplicates.
    pub async fn get_object_id(
        &self,
        token: &AccessToken,
        container_id: &str,
        key: &str,
    ) -> Result<Option<String>> {
        if let Some(id) = self.cached_object_id(key) {
            return Ok(Some(id));
        }

        let mut matches = self.api.list_objects(token, container_id, key).await?;
        if matches.is_empty() {
            return Ok(None);
        }

        // Newest first; objects without a timestamp sort last.
        matches.sort_by(|a, b| b.modified_time.cmp(&a.modified_time));
        let keep = matches.remove(0);
        if !matches.is_empty() {
            tracing::warn!(key = %key, duplicates = matches.len(), "collapsing duplicate objects");
            for duplicate in matches {
                let api = self.api.clone();
                let token = token.clone();
                self.spawn_cleanup(async move {
                    if let Err(err) = api.delete_object(&token, &duplicate.id).await {
                        tracing::warn!(object = %duplicate.id, error = %err, "duplicate cleanup failed");
                    }
                });
            }
        }
        self.lock_ids().insert(key.to_string(), keep.id.clone());
        Ok(Some(keep.id))
    }

    fn invalidate(&self, key: &str) {
        self.lock_ids().remove(key);
    }

    async fn context(&self, key: &str) -> Result<(AccessToken, String)> {
        if self.schema.is_local_only(key) {
            return Err(SyncError::InvalidInput(format!(
                "'{}' is local-only and never stored remotely",
                key
            )));
        }
        let token = self.session.token().ok_or(SyncError::NotSignedIn)?;
        let container = self.ensure_container(&token).await?;
        Ok((token, container))
    }

    // --- Error-propagating operations ---

    pub async fn try_save(&self, key: &str, value: &Value) -> Result<()> {
        let value = self.schema.coerce(key, value.clone());
        self.schema.encode(key, &value)?;
        let content = serde_json::to_string(&value)?;
        let (token, container) = self.context(key).await?;

        if let Some(id) = self.get_object_id(&token, &container, key).await? {
            match self.api.update_object(&token, &id, &content).await {
                Err(SyncError::Http { status: 404, .. }) => {
                    tracing::debug!(key = %key, object = %id, "cached object vanished, recreating");
                    self.invalidate(key);
                }
                other => return other,
            }
        }

        let id = self
            .api
            .create_object(&token, &container, key, &content)
            .await?;
        self.lock_ids().insert(key.to_string(), id);
        Ok(())
    }

    pub async fn try_load(&self, key: &str) -> Result<Option<Value>> {
        let (token, container) = self.context(key).await?;
        let Some(id) = self.get_object_id(&token, &container, key).await? else {
            return Ok(None);
        };
        let text = match self.api.fetch_object(&token, &id).await {
            Ok(text) => text,
            Err(SyncError::Http { status: 404, .. }) => {
                self.invalidate(key);
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        let parsed = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(Some(self.schema.coerce(key, parsed)))
    }

    pub async fn try_delete(&self, key: &str) -> Result<()> {
        let (token, container) = self.context(key).await?;
        let Some(id) = self.get_object_id(&token, &container, key).await? else {
            return Ok(());
        };
        match self.api.delete_object(&token, &id).await {
            Ok(()) | Err(SyncError::Http { status: 404, .. }) => {
                self.invalidate(key);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    pub async fn try_has(&self, key: &str) -> Result<bool> {
        let (token, container) = self.context(key).await?;
        Ok(self.get_object_id(&token, &container, key).await?.is_some())
    }

    // --- Best-effort operations ---

    pub async fn save_data(&self, key: &str, value: &Value) -> bool {
        match self.try_save(key, value).await {
            Ok(()) => true,
            Err(err) => {
                log_failure("save", key, &err);
                false
            }
        }
    }

    pub async fn load_data(&self, key: &str) -> Option<Value> {
        match self.try_load(key).await {
            Ok(value) => value,
            Err(err) => {
                log_failure("load", key, &err);
                None
            }
        }
    }

    /// Idempotent: a missing object counts as deleted.
    pub async fn delete_data(&self, key: &str) -> bool {
        match self.try_delete(key).await {
            Ok(()) => true,
            Err(err) => {
                log_failure("delete", key, &err);
                false
            }
        }
    }

    pub async fn has_data(&self, key: &str) -> bool {
        match self.try_has(key).await {
            Ok(found) => found,
            Err(err) => {
                log_failure("lookup", key, &err);
                false
            }
        }
    }
}

fn log_failure(op: &str, key: &str, err: &SyncError) {
    match err {
        SyncError::NotSignedIn => tracing::debug!(op, key = %key, "remote skipped: not signed in"),
        err if err.is_transient() => tracing::warn!(op, key = %key, error = %err, "remote operation failed"),
        err => tracing::error!(op, key = %key, error = %err, "remote operation failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::{LocalStore, MemoryMedium};
    use crate::schema::ValueKind;
    use crate::testing::{ApiCall, InMemoryObjectApi, ScriptedIdentity};
    use serde_json::json;

    async fn signed_in_store(api: &InMemoryObjectApi) -> Arc<RemoteStore> {
        let schema = Arc::new(
            KeySchema::new("game_")
                .with_key("game_sound", ValueKind::Boolean)
                .with_key("game_volume", ValueKind::Number)
                .with_save_game_key("game_save"),
        );
        let local = Arc::new(LocalStore::new(MemoryMedium::new(), schema.clone()));
        let session = Arc::new(AuthSession::new(
            Arc::new(ScriptedIdentity::granting("tok")),
            local,
        ));
        let store = Arc::new(RemoteStore::new(
            Arc::new(api.clone()),
            session,
            schema,
            "savesync",
        ));
        assert!(store.sign_in(false, Duration::from_secs(5)).await);
        store
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_then_load_creates_container_once() {
        let api = InMemoryObjectApi::new();
        let store = signed_in_store(&api).await;

        assert!(store.save_data("game_save", &json!({"level": 2})).await);
        assert!(store.save_data("game_volume", &json!(0.5)).await);
        assert_eq!(store.load_data("game_save").await, Some(json!({"level": 2})));
        assert_eq!(store.load_data("game_volume").await, Some(json!(0.5)));
        assert_eq!(api.count(|c| matches!(c, ApiCall::CreateContainer { .. })), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_save_updates_in_place() {
        let api = InMemoryObjectApi::new();
        let store = signed_in_store(&api).await;

        store.save_data("game_volume", &json!(1)).await;
        store.save_data("game_volume", &json!(2)).await;
        assert_eq!(api.objects_named("game_volume").len(), 1);
        assert_eq!(api.count(|c| matches!(c, ApiCall::UpdateObject { .. })), 1);
        assert_eq!(store.load_data("game_volume").await, Some(json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_first_calls_share_container_resolution() {
        let api = InMemoryObjectApi::new().with_latency(Duration::from_millis(50));
        let store = signed_in_store(&api).await;

        let mut tasks = Vec::new();
        for i in 0..5 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.save_data(&format!("game_slot{}", i), &json!(i)).await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap());
        }
        assert_eq!(api.count(|c| matches!(c, ApiCall::CreateContainer { .. })), 1);
        assert_eq!(api.count(|c| matches!(c, ApiCall::ListContainers { .. })), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_container_resolution_can_be_retried() {
        let api = InMemoryObjectApi::new();
        let store = signed_in_store(&api).await;

        api.set_offline(true);
        assert!(!store.save_data("game_volume", &json!(1)).await);
        api.set_offline(false);
        assert!(store.save_data("game_volume", &json!(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sign_out_during_resolution_discards_container() {
        let api = InMemoryObjectApi::new().with_latency(Duration::from_millis(50));
        api.seed_container("savesync");
        let store = signed_in_store(&api).await;
        let token = store.session().token().unwrap();

        let leader = tokio::spawn({
            let store = store.clone();
            let token = token.clone();
            async move { store.ensure_container(&token).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let follower = tokio::spawn({
            let store = store.clone();
            let token = token.clone();
            async move { store.ensure_container(&token).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.sign_out().await;

        assert!(matches!(leader.await.unwrap(), Err(SyncError::NotSignedIn)));
        assert!(follower.await.unwrap().is_err());
        assert!(matches!(*store.lock_slot(), ContainerSlot::Empty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_duplicate_containers_are_collapsed() {
        let api = InMemoryObjectApi::new();
        let first = api.seed_container("savesync");
        api.seed_container("savesync");
        let store = signed_in_store(&api).await;

        let token = store.session().token().unwrap();
        assert_eq!(store.ensure_container(&token).await.unwrap(), first);
        store.wait_for_cleanup().await;
        assert_eq!(api.containers_named("savesync").len(), 1);
        assert_eq!(api.count(|c| matches!(c, ApiCall::CreateContainer { .. })), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_objects_collapse_to_most_recent() {
        let api = InMemoryObjectApi::new();
        let container = api.seed_container("savesync");
        api.seed_object(&container, "game_save", "{\"v\":1}", 10);
        let newest = api.seed_object(&container, "game_save", "{\"v\":3}", 30);
        api.seed_object(&container, "game_save", "{\"v\":2}", 20);
        let store = signed_in_store(&api).await;

        let token = store.session().token().unwrap();
        let id = store.get_object_id(&token, &container, "game_save").await.unwrap();
        assert_eq!(id.as_deref(), Some(newest.as_str()));
        store.wait_for_cleanup().await;

        assert_eq!(api.count(|c| matches!(c, ApiCall::DeleteObject { .. })), 2);
        assert_eq!(api.objects_named("game_save").len(), 1);
        assert_eq!(store.load_data("game_save").await, Some(json!({"v": 3})));
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_coerces_legacy_text() {
        let api = InMemoryObjectApi::new();
        let container = api.seed_container("savesync");
        api.seed_object(&container, "game_sound", "\"true\"", 1);
        api.seed_object(&container, "game_volume", "0.25", 1);
        api.seed_object(&container, "game_notes", "not json at all", 1);
        let store = signed_in_store(&api).await;

        assert_eq!(store.load_data("game_sound").await, Some(json!(true)));
        assert_eq!(store.load_data("game_volume").await, Some(json!(0.25)));
        assert_eq!(store.load_data("game_notes").await, Some(json!("not json at all")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_is_idempotent_and_invalidates_cache() {
        let api = InMemoryObjectApi::new();
        let store = signed_in_store(&api).await;

        assert!(store.delete_data("game_volume").await);
        store.save_data("game_volume", &json!(4)).await;
        assert!(store.cached_object_id("game_volume").is_some());
        assert!(store.delete_data("game_volume").await);
        assert!(store.cached_object_id("game_volume").is_none());
        assert!(!store.has_data("game_volume").await);
        assert_eq!(store.load_data("game_volume").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_of_vanished_object_recreates_it() {
        let api = InMemoryObjectApi::new();
        let store = signed_in_store(&api).await;

        store.save_data("game_volume", &json!(1)).await;
        let old = store.cached_object_id("game_volume").unwrap();
        api.remove_object(&old);

        assert!(store.save_data("game_volume", &json!(2)).await);
        assert_ne!(store.cached_object_id("game_volume").unwrap(), old);
        assert_eq!(store.load_data("game_volume").await, Some(json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_only_keys_never_reach_the_api() {
        let api = InMemoryObjectApi::new();
        let store = signed_in_store(&api).await;
        let calls_before = api.calls().len();

        assert!(!store.save_data("game_auto_login", &json!(true)).await);
        assert_eq!(store.load_data("game_last_login").await, None);
        assert_eq!(api.calls().len(), calls_before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signed_out_operations_fail_quietly() {
        let api = InMemoryObjectApi::new();
        let store = signed_in_store(&api).await;
        store.save_data("game_volume", &json!(1)).await;

        store.sign_out().await;
        assert!(!store.is_user_signed_in());
        assert!(store.cached_object_id("game_volume").is_none());
        assert!(!store.save_data("game_volume", &json!(2)).await);
        assert_eq!(store.load_data("game_volume").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_reports_false() {
        let api = InMemoryObjectApi::new();
        let store = signed_in_store(&api).await;
        store.save_data("game_volume", &json!(1)).await;

        api.set_offline(true);
        assert!(!store.save_data("game_volume", &json!(2)).await);
        assert_eq!(store.load_data("game_volume").await, None);
        assert!(!store.delete_data("game_volume").await);
    }
}
