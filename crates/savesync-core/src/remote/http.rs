//! HTTP object storage backend speaking the Drive v3 REST shape.
//!
//! Containers are folders, objects are files with a single parent. Metadata
//! calls go to `api_base_url`, content uploads to `upload_base_url`. Every
//! request carries the session's bearer token.

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::json;

use super::api::{ObjectStorageApi, RemoteObject};
use crate::auth::AccessToken;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};

const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const CONTENT_MIME_TYPE: &str = "application/json";
const LIST_FIELDS: &str = "files(id,name,modifiedTime)";
const MULTIPART_BOUNDARY: &str = "savesync-object-boundary";
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<RemoteObject>,
}

#[derive(Debug, Deserialize)]
struct CreatedFile {
    id: String,
}

pub struct DriveApi {
    client: Client,
    api_base_url: String,
    upload_base_url: String,
}

impl DriveApi {
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| SyncError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            upload_base_url: config.upload_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn files_url(&self) -> String {
        format!("{}/files", self.api_base_url)
    }

    fn file_url(&self, id: &str) -> String {
        format!("{}/files/{}", self.api_base_url, id)
    }

    async fn list(&self, token: &AccessToken, query: String) -> Result<Vec<RemoteObject>> {
        let response = self
            .client
            .get(self.files_url())
            .bearer_auth(token.secret())
            .query(&[
                ("q", query.as_str()),
                ("fields", LIST_FIELDS),
                ("orderBy", "modifiedTime desc"),
                ("spaces", "drive"),
            ])
            .send()
            .await?;
        let list: FileList = check_status(response).await?.json().await?;
        Ok(list.files)
    }

    async fn delete(&self, token: &AccessToken, id: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.file_url(id))
            .bearer_auth(token.secret())
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStorageApi for DriveApi {
    async fn list_containers(&self, token: &AccessToken, name: &str) -> Result<Vec<RemoteObject>> {
        self.list(token, container_query(name)).await
    }

    async fn create_container(&self, token: &AccessToken, name: &str) -> Result<RemoteObject> {
        let response = self
            .client
            .post(self.files_url())
            .bearer_auth(token.secret())
            .query(&[("fields", "id,name,modifiedTime")])
            .json(&json!({ "name": name, "mimeType": FOLDER_MIME_TYPE }))
            .send()
            .await?;
        Ok(check_status(response).await?.json().await?)
    }

    async fn delete_container(&self, token: &AccessToken, container_id: &str) -> Result<()> {
        self.delete(token, container_id).await
    }

    async fn list_objects(
        &self,
        token: &AccessToken,
        container_id: &str,
        name: &str,
    ) -> Result<Vec<RemoteObject>> {
        self.list(token, object_query(container_id, name)).await
    }

    async fn create_object(
        &self,
        token: &AccessToken,
        container_id: &str,
        name: &str,
        content: &str,
    ) -> Result<String> {
        let metadata = json!({
            "name": name,
            "parents": [container_id],
            "mimeType": CONTENT_MIME_TYPE,
        });
        let body = multipart_body(MULTIPART_BOUNDARY, &metadata.to_string(), content);
        let response = self
            .client
            .post(format!("{}/files", self.upload_base_url))
            .bearer_auth(token.secret())
            .query(&[("uploadType", "multipart"), ("fields", "id")])
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", MULTIPART_BOUNDARY),
            )
            .body(body)
            .send()
            .await?;
        let created: CreatedFile = check_status(response).await?.json().await?;
        Ok(created.id)
    }

    async fn update_object(
        &self,
        token: &AccessToken,
        object_id: &str,
        content: &str,
    ) -> Result<()> {
        let response = self
            .client
            .patch(format!("{}/files/{}", self.upload_base_url, object_id))
            .bearer_auth(token.secret())
            .query(&[("uploadType", "media")])
            .header(reqwest::header::CONTENT_TYPE, CONTENT_MIME_TYPE)
            .body(content.to_string())
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn fetch_object(&self, token: &AccessToken, object_id: &str) -> Result<String> {
        let response = self
            .client
            .get(self.file_url(object_id))
            .bearer_auth(token.secret())
            .query(&[("alt", "media")])
            .send()
            .await?;
        Ok(check_status(response).await?.text().await?)
    }

    async fn delete_object(&self, token: &AccessToken, object_id: &str) -> Result<()> {
        self.delete(token, object_id).await
    }
}

/// Map a non-success response to `SyncError::Http`, keeping a bounded
/// excerpt of the body for the log line.
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SyncError::Http {
        status: status.as_u16(),
        message: truncate_for_error(&body, MAX_ERROR_BODY),
    })
}

fn truncate_for_error(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// Quote a value for use inside a `q=` search expression.
fn escape_query_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn container_query(name: &str) -> String {
    format!(
        "name = '{}' and mimeType = '{}' and trashed = false",
        escape_query_value(name),
        FOLDER_MIME_TYPE
    )
}

fn object_query(container_id: &str, name: &str) -> String {
    format!(
        "name = '{}' and '{}' in parents and trashed = false",
        escape_query_value(name),
        escape_query_value(container_id)
    )
}

fn multipart_body(boundary: &str, metadata: &str, content: &str) -> String {
    format!(
        "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{m}\r\n--{b}\r\nContent-Type: {t}\r\n\r\n{c}\r\n--{b}--",
        b = boundary,
        m = metadata,
        t = CONTENT_MIME_TYPE,
        c = content
    )
}
