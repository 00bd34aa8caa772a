//! In-memory collaborators for tests.
//!
//! Available in unit tests and, with the `test-support` feature, to
//! integration tests and embedding applications.
//!
//! - [`InMemoryObjectApi`]: object storage with call recording, latency and
//!   an offline switch
//! - [`ScriptedIdentity`]: identity provider granting or denying tokens
//! - [`ScriptedDecision`]: user decision interface with canned answers

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use uuid::Uuid;

use crate::auth::{AccessToken, IdentityProvider};
use crate::error::{Result, SyncError};
use crate::remote::{ObjectStorageApi, RemoteObject};
use crate::sync::{Conflict, Resolution, UserDecision};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    ListContainers { name: String },
    CreateContainer { name: String },
    DeleteContainer { id: String },
    ListObjects { name: String },
    CreateObject { name: String, content: String },
    UpdateObject { id: String, content: String },
    FetchObject { id: String },
    DeleteObject { id: String },
}

impl ApiCall {
    /// Object or container name carried by the call, when it has one.
    pub fn name(&self) -> Option<&str> {
        match self {
            ApiCall::ListContainers { name }
            | ApiCall::CreateContainer { name }
            | ApiCall::ListObjects { name }
            | ApiCall::CreateObject { name, .. } => Some(name.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    name: String,
    parent: String,
    content: String,
    modified: DateTime<Utc>,
}

#[derive(Default)]
struct ApiState {
    containers: Vec<RemoteObject>,
    objects: BTreeMap<String, StoredObject>,
    calls: Vec<ApiCall>,
}

/// Object storage held in memory. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryObjectApi {
    state: Arc<Mutex<ApiState>>,
    latency: Option<Duration>,
    offline: Arc<AtomicBool>,
    clock: Arc<AtomicU64>,
}

impl InMemoryObjectApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency` (tokio time, so paused clocks apply).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// While offline every call fails with a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn timestamp(seconds: u64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds as i64, 0)
            .single()
            .unwrap_or_else(Utc::now)
    }

    fn tick(&self) -> DateTime<Utc> {
        // Seeded objects use small offsets; live writes sort after them.
        Self::timestamp(1_000_000 + self.clock.fetch_add(1, Ordering::SeqCst))
    }

    async fn enter(&self, call: ApiCall) -> Result<()> {
        lock(&self.state).calls.push(call);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("backend unreachable".to_string()));
        }
        Ok(())
    }

    fn not_found(id: &str) -> SyncError {
        SyncError::Http {
            status: 404,
            message: format!("File not found: {}", id),
        }
    }

    pub fn seed_container(&self, name: &str) -> String {
        let id = Uuid::new_v4().to_string();
        let modified = self.tick();
        lock(&self.state).containers.push(RemoteObject {
            id: id.clone(),
            name: name.to_string(),
            modified_time: Some(modified),
        });
        id
    }

    /// Insert an object directly; `modified_secs` orders seeded duplicates.
    pub fn seed_object(&self, container_id: &str, name: &str, content: &str, modified_secs: u64) -> String {
        let id = Uuid::new_v4().to_string();
        lock(&self.state).objects.insert(
            id.clone(),
            StoredObject {
                name: name.to_string(),
                parent: container_id.to_string(),
                content: content.to_string(),
                modified: Self::timestamp(modified_secs),
            },
        );
        id
    }

    pub fn remove_object(&self, id: &str) {
        lock(&self.state).objects.remove(id);
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        lock(&self.state).calls.clone()
    }

    pub fn count(&self, predicate: impl Fn(&ApiCall) -> bool) -> usize {
        lock(&self.state).calls.iter().filter(|c| predicate(c)).count()
    }

    pub fn containers_named(&self, name: &str) -> Vec<RemoteObject> {
        lock(&self.state)
            .containers
            .iter()
            .filter(|c| c.name == name)
            .cloned()
            .collect()
    }

    pub fn objects_named(&self, name: &str) -> Vec<RemoteObject> {
        lock(&self.state)
            .objects
            .iter()
            .filter(|(_, o)| o.name == name)
            .map(|(id, o)| RemoteObject {
                id: id.clone(),
                name: o.name.clone(),
                modified_time: Some(o.modified),
            })
            .collect()
    }

    /// Content of the most recently modified object named `name`.
    pub fn content_of(&self, name: &str) -> Option<String> {
        lock(&self.state)
            .objects
            .values()
            .filter(|o| o.name == name)
            .max_by_key(|o| o.modified)
            .map(|o| o.content.clone())
    }
}

#[async_trait]
impl ObjectStorageApi for InMemoryObjectApi {
    async fn list_containers(&self, _token: &AccessToken, name: &str) -> Result<Vec<RemoteObject>> {
        self.enter(ApiCall::ListContainers {
            name: name.to_string(),
        })
        .await?;
        Ok(self.containers_named(name))
    }

    async fn create_container(&self, _token: &AccessToken, name: &str) -> Result<RemoteObject> {
        self.enter(ApiCall::CreateContainer {
            name: name.to_string(),
        })
        .await?;
        let container = RemoteObject {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            modified_time: Some(self.tick()),
        };
        lock(&self.state).containers.push(container.clone());
        Ok(container)
    }

    async fn delete_container(&self, _token: &AccessToken, container_id: &str) -> Result<()> {
        self.enter(ApiCall::DeleteContainer {
            id: container_id.to_string(),
        })
        .await?;
        let mut state = lock(&self.state);
        let before = state.containers.len();
        state.containers.retain(|c| c.id != container_id);
        if state.containers.len() == before {
            return Err(Self::not_found(container_id));
        }
        Ok(())
    }

    async fn list_objects(
        &self,
        _token: &AccessToken,
        container_id: &str,
        name: &str,
    ) -> Result<Vec<RemoteObject>> {
        self.enter(ApiCall::ListObjects {
            name: name.to_string(),
        })
        .await?;
        let state = lock(&self.state);
        Ok(state
            .objects
            .iter()
            .filter(|(_, o)| o.name == name && o.parent == container_id)
            .map(|(id, o)| RemoteObject {
                id: id.clone(),
                name: o.name.clone(),
                modified_time: Some(o.modified),
            })
            .collect())
    }

    async fn create_object(
        &self,
        _token: &AccessToken,
        container_id: &str,
        name: &str,
        content: &str,
    ) -> Result<String> {
        self.enter(ApiCall::CreateObject {
            name: name.to_string(),
            content: content.to_string(),
        })
        .await?;
        let id = Uuid::new_v4().to_string();
        let modified = self.tick();
        lock(&self.state).objects.insert(
            id.clone(),
            StoredObject {
                name: name.to_string(),
                parent: container_id.to_string(),
                content: content.to_string(),
                modified,
            },
        );
        Ok(id)
    }

    async fn update_object(
        &self,
        _token: &AccessToken,
        object_id: &str,
        content: &str,
    ) -> Result<()> {
        self.enter(ApiCall::UpdateObject {
            id: object_id.to_string(),
            content: content.to_string(),
        })
        .await?;
        let modified = self.tick();
        let mut state = lock(&self.state);
        let object = state
            .objects
            .get_mut(object_id)
            .ok_or_else(|| Self::not_found(object_id))?;
        object.content = content.to_string();
        object.modified = modified;
        Ok(())
    }

    async fn fetch_object(&self, _token: &AccessToken, object_id: &str) -> Result<String> {
        self.enter(ApiCall::FetchObject {
            id: object_id.to_string(),
        })
        .await?;
        lock(&self.state)
            .objects
            .get(object_id)
            .map(|o| o.content.clone())
            .ok_or_else(|| Self::not_found(object_id))
    }

    async fn delete_object(&self, _token: &AccessToken, object_id: &str) -> Result<()> {
        self.enter(ApiCall::DeleteObject {
            id: object_id.to_string(),
        })
        .await?;
        lock(&self.state)
            .objects
            .remove(object_id)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(object_id))
    }
}

#[derive(Default)]
struct IdentityLog {
    requests: Vec<bool>,
    revoked: Vec<String>,
}

/// Identity provider with a fixed answer. Clones share the call log.
#[derive(Clone)]
pub struct ScriptedIdentity {
    grant: Arc<Mutex<Option<String>>>,
    delay: Option<Duration>,
    log: Arc<Mutex<IdentityLog>>,
}

impl ScriptedIdentity {
    pub fn granting(token: &str) -> Self {
        Self {
            grant: Arc::new(Mutex::new(Some(token.to_string()))),
            delay: None,
            log: Arc::new(Mutex::new(IdentityLog::default())),
        }
    }

    pub fn denying() -> Self {
        Self {
            grant: Arc::new(Mutex::new(None)),
            delay: None,
            log: Arc::new(Mutex::new(IdentityLog::default())),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Change the answer for later requests; `None` denies.
    pub fn set_grant(&self, token: Option<&str>) {
        *lock(&self.grant) = token.map(str::to_string);
    }

    /// The `silent` flag of every token request, in order.
    pub fn requests(&self) -> Vec<bool> {
        lock(&self.log).requests.clone()
    }

    pub fn revoked(&self) -> Vec<String> {
        lock(&self.log).revoked.clone()
    }
}

#[async_trait]
impl IdentityProvider for ScriptedIdentity {
    async fn request_token(&self, silent: bool) -> Result<AccessToken> {
        lock(&self.log).requests.push(silent);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let grant = lock(&self.grant).clone();
        grant
            .map(AccessToken::new)
            .ok_or_else(|| SyncError::AuthDenied("user declined consent".to_string()))
    }

    async fn revoke_token(&self, token: &AccessToken) -> Result<()> {
        lock(&self.log).revoked.push(token.secret().to_string());
        Ok(())
    }
}

#[derive(Default)]
struct DecisionLog {
    login_prompts: usize,
    conflicts: Vec<Conflict>,
}

/// Decision interface with canned answers. Clones share the prompt log.
#[derive(Clone)]
pub struct ScriptedDecision {
    accept_login: bool,
    login_delay: Option<Duration>,
    resolution: Option<Resolution>,
    log: Arc<Mutex<DecisionLog>>,
}

impl ScriptedDecision {
    pub fn new(accept_login: bool, resolution: Option<Resolution>) -> Self {
        Self {
            accept_login,
            login_delay: None,
            resolution,
            log: Arc::new(Mutex::new(DecisionLog::default())),
        }
    }

    /// Declines login and dismisses conflicts.
    pub fn declining() -> Self {
        Self::new(false, None)
    }

    pub fn with_login_delay(mut self, delay: Duration) -> Self {
        self.login_delay = Some(delay);
        self
    }

    pub fn login_prompts(&self) -> usize {
        lock(&self.log).login_prompts
    }

    pub fn conflicts(&self) -> Vec<Conflict> {
        lock(&self.log).conflicts.clone()
    }
}

#[async_trait]
impl UserDecision for ScriptedDecision {
    async fn confirm_login(&self) -> bool {
        lock(&self.log).login_prompts += 1;
        if let Some(delay) = self.login_delay {
            tokio::time::sleep(delay).await;
        }
        self.accept_login
    }

    async fn resolve_conflict(&self, conflict: &Conflict) -> Option<Resolution> {
        lock(&self.log).conflicts.push(conflict.clone());
        self.resolution
    }
}
