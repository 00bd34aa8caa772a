//! Service configuration.
//!
//! Every field has a default so an empty TOML document is a valid config.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

pub const DEFAULT_CONTAINER_NAME: &str = "savesync";
pub const DEFAULT_API_BASE_URL: &str = "https://www.googleapis.com/drive/v3";
pub const DEFAULT_UPLOAD_BASE_URL: &str = "https://www.googleapis.com/upload/drive/v3";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Well-known name of the remote container holding all objects.
    pub container_name: String,
    /// Bound on the silent sign-in attempted during `init`.
    pub auto_login_timeout_ms: u64,
    /// Bound on the enforced-login prompt plus the sign-in it triggers.
    pub enforced_login_timeout_ms: u64,
    /// Bound on an explicit interactive sign-in.
    pub sign_in_timeout_ms: u64,
    /// Delay used by `debounce_save_default`.
    pub debounce_ms: u64,
    pub api_base_url: String,
    pub upload_base_url: String,
    pub request_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            container_name: DEFAULT_CONTAINER_NAME.to_string(),
            auto_login_timeout_ms: 5_000,
            enforced_login_timeout_ms: 15_000,
            sign_in_timeout_ms: 60_000,
            debounce_ms: 500,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            upload_base_url: DEFAULT_UPLOAD_BASE_URL.to_string(),
            request_timeout_ms: 30_000,
        }
    }
}

impl SyncConfig {
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: SyncConfig =
            toml::from_str(contents).map_err(|e| SyncError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SyncError::Config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents).map_err(|e| match e {
            SyncError::Config(msg) => {
                SyncError::Config(format!("Failed to parse config {}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents =
            toml::to_string_pretty(self).map_err(|e| SyncError::Config(e.to_string()))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.container_name.trim().is_empty() {
            return Err(SyncError::Config(
                "container_name must not be empty".to_string(),
            ));
        }
        for (name, url) in [
            ("api_base_url", &self.api_base_url),
            ("upload_base_url", &self.upload_base_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(SyncError::Config(format!(
                    "{} must start with http:// or https://, got: {}",
                    name, url
                )));
            }
        }
        Ok(())
    }

    pub fn auto_login_timeout(&self) -> Duration {
        Duration::from_millis(self.auto_login_timeout_ms)
    }

    pub fn enforced_login_timeout(&self) -> Duration {
        Duration::from_millis(self.enforced_login_timeout_ms)
    }

    pub fn sign_in_timeout(&self) -> Duration {
        Duration::from_millis(self.sign_in_timeout_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = SyncConfig::from_toml_str("").unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.auto_login_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_override() {
        let config = SyncConfig::from_toml_str(
            r#"
            container_name = "my-game"
            debounce_ms = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.container_name, "my-game");
        assert_eq!(config.debounce(), Duration::from_millis(50));
        assert_eq!(config.sign_in_timeout_ms, 60_000);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(SyncConfig::from_toml_str("container_name = \"  \"").is_err());
        assert!(SyncConfig::from_toml_str("api_base_url = \"ftp://x\"").is_err());
        assert!(SyncConfig::from_toml_str("debounce_ms = \"soon\"").is_err());
    }

    #[test]
    fn test_write_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("savesync.toml");
        let config = SyncConfig {
            container_name: "slot-a".to_string(),
            ..SyncConfig::default()
        };
        config.write(&path).unwrap();
        assert_eq!(SyncConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let err = SyncConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }
}
