//! Backend operations the remote store consumes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::AccessToken;
use crate::error::Result;

/// Listing entry for a container or an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub modified_time: Option<DateTime<Utc>>,
}

/// Remote object storage organised as named containers holding named objects.
///
/// Implementations return `SyncError::Http` for non-success statuses and
/// `SyncError::Transport` when the backend cannot be reached.
#[async_trait]
pub trait ObjectStorageApi: Send + Sync {
    async fn list_containers(&self, token: &AccessToken, name: &str) -> Result<Vec<RemoteObject>>;

    async fn create_container(&self, token: &AccessToken, name: &str) -> Result<RemoteObject>;

    async fn delete_container(&self, token: &AccessToken, container_id: &str) -> Result<()>;

    /// Objects named `name` inside `container_id`, with modification times.
    async fn list_objects(
        &self,
        token: &AccessToken,
        container_id: &str,
        name: &str,
    ) -> Result<Vec<RemoteObject>>;

    /// Returns the new object id.
    async fn create_object(
        &self,
        token: &AccessToken,
        container_id: &str,
        name: &str,
        content: &str,
    ) -> Result<String>;

    async fn update_object(&self, token: &AccessToken, object_id: &str, content: &str)
        -> Result<()>;

    async fn fetch_object(&self, token: &AccessToken, object_id: &str) -> Result<String>;

    async fn delete_object(&self, token: &AccessToken, object_id: &str) -> Result<()>;
}
