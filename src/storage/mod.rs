//! Storage providers and the layer that replicates across them.
//!
//! Every provider kind implements [`StorageProvider`], selected by the `type`
//! tag of its [`ProviderSettings`]. Writes use a multipart contract
//! (begin/part/complete/abort) so an in-flight upload can be abandoned when a
//! job is cancelled.

pub mod cloud_drive;
pub mod ftp;
pub mod lifecycle;
pub mod local;
pub mod memory;
pub mod object_store;
pub mod pool;
pub mod replication;

pub use lifecycle::{LifecycleAction, LifecycleCondition, LifecycleRule, LifecycleService};
pub use pool::PooledProvider;
pub use replication::{ReplicationMode, StorageManager, WriteSession};

use crate::backup::{BackupError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Local,
    ObjectStore,
    Ftp,
    CloudDrive,
    Memory,
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> usize {
    4
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_retries() -> u32 {
    2
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_ftp_port() -> u16 {
    21
}

/// A named provider binding, validated once at the configuration boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Attempts per location when reading with failover
    #[serde(default = "default_retries")]
    pub retries: u32,
    pub settings: ProviderSettings,
}

/// Closed per-kind connection settings. Secrets are referenced by
/// environment variable name and never stored inline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", deny_unknown_fields)]
pub enum ProviderSettings {
    Local {
        root: PathBuf,
    },
    ObjectStore {
        endpoint: String,
        bucket: String,
        #[serde(default = "default_region")]
        region: String,
        access_key_env: String,
        secret_key_env: String,
        #[serde(default)]
        path_style: bool,
    },
    Ftp {
        host: String,
        #[serde(default = "default_ftp_port")]
        port: u16,
        username: String,
        password_env: String,
        #[serde(default)]
        root_dir: String,
    },
    CloudDrive {
        /// WebDAV endpoint, e.g. `https://drive.example.com/remote.php/dav/files/ops`
        base_url: String,
        username: String,
        password_env: String,
        #[serde(default)]
        root_folder: String,
    },
    Memory,
}

impl ProviderSettings {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderSettings::Local { .. } => ProviderKind::Local,
            ProviderSettings::ObjectStore { .. } => ProviderKind::ObjectStore,
            ProviderSettings::Ftp { .. } => ProviderKind::Ftp,
            ProviderSettings::CloudDrive { .. } => ProviderKind::CloudDrive,
            ProviderSettings::Memory => ProviderKind::Memory,
        }
    }
}

fn require(field: &str, value: &str, provider: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(BackupError::config(format!(
            "provider {provider}: `{field}` must not be empty"
        )));
    }
    Ok(())
}

fn require_http_url(field: &str, value: &str, provider: &str) -> Result<()> {
    require(field, value, provider)?;
    if !(value.starts_with("http://") || value.starts_with("https://")) {
        return Err(BackupError::config(format!(
            "provider {provider}: `{field}` must be an http(s) URL"
        )));
    }
    Ok(())
}

impl ProviderConfig {
    pub fn kind(&self) -> ProviderKind {
        self.settings.kind()
    }

    pub fn validate(&self) -> Result<()> {
        let name = self.name.as_str();
        require("name", name, name)?;
        if self.max_connections == 0 {
            return Err(BackupError::config(format!(
                "provider {name}: max_connections must be > 0"
            )));
        }
        if self.timeout_secs == 0 {
            return Err(BackupError::config(format!(
                "provider {name}: timeout_secs must be > 0"
            )));
        }

        match &self.settings {
            ProviderSettings::Local { root } => {
                if root.as_os_str().is_empty() {
                    return Err(BackupError::config(format!(
                        "provider {name}: `root` must not be empty"
                    )));
                }
            }
            ProviderSettings::ObjectStore {
                endpoint,
                bucket,
                region,
                access_key_env,
                secret_key_env,
                ..
            } => {
                require_http_url("endpoint", endpoint, name)?;
                require("bucket", bucket, name)?;
                require("region", region, name)?;
                require("access_key_env", access_key_env, name)?;
                require("secret_key_env", secret_key_env, name)?;
            }
            ProviderSettings::Ftp {
                host,
                port,
                username,
                password_env,
                ..
            } => {
                require("host", host, name)?;
                require("username", username, name)?;
                require("password_env", password_env, name)?;
                if *port == 0 {
                    return Err(BackupError::config(format!(
                        "provider {name}: `port` must be > 0"
                    )));
                }
            }
            ProviderSettings::CloudDrive {
                base_url,
                username,
                password_env,
                ..
            } => {
                require_http_url("base_url", base_url, name)?;
                require("username", username, name)?;
                require("password_env", password_env, name)?;
            }
            ProviderSettings::Memory => {}
        }
        Ok(())
    }
}

/// Reads a secret referenced by a provider setting.
pub(crate) fn secret_from_env(provider: &str, variable: &str) -> Result<String> {
    std::env::var(variable).map_err(|_| {
        BackupError::config(format!(
            "provider {provider}: environment variable {variable} is not set"
        ))
    })
}

/// An in-flight multipart upload.
#[derive(Debug, Clone)]
pub struct UploadHandle {
    pub key: String,
    pub upload_id: String,
    /// Provider-side upload id, for providers with a native multipart API
    pub remote_id: Option<String>,
    pub part_count: u32,
    pub bytes_written: u64,
    /// Provider part receipts (ETags) in order
    pub receipts: Vec<String>,
    /// Bytes buffered until the provider's minimum part size is reached
    pub staged: BytesMut,
}

impl UploadHandle {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            upload_id: uuid::Uuid::new_v4().to_string(),
            remote_id: None,
            part_count: 0,
            bytes_written: 0,
            receipts: Vec::new(),
            staged: BytesMut::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectInfo {
    pub key: String,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Time-stamped result of probing a provider. Derived, never authoritative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionTestResult {
    pub provider: String,
    pub kind: ProviderKind,
    pub success: bool,
    pub latency_ms: u64,
    pub message: String,
    pub tested_at: DateTime<Utc>,
}

/// Uniform contract over heterogeneous storage providers
#[async_trait]
pub trait StorageProvider: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    async fn begin_upload(&self, key: &str) -> Result<UploadHandle>;

    async fn upload_part(&self, handle: &mut UploadHandle, data: Bytes) -> Result<()>;

    /// Makes the object visible under its key; returns the stored size
    async fn complete_upload(&self, handle: UploadHandle) -> Result<u64>;

    /// Discards everything written through `handle`
    async fn abort_upload(&self, handle: UploadHandle) -> Result<()>;

    async fn read(&self, key: &str) -> Result<Bytes>;

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    /// Deleting a missing key returns `NotFound`
    async fn delete(&self, key: &str) -> Result<()>;

    async fn test_connection(&self) -> Result<()>;

    /// Single-shot write through the multipart contract
    async fn write(&self, key: &str, data: Bytes) -> Result<u64> {
        let mut handle = self.begin_upload(key).await?;
        if let Err(e) = self.upload_part(&mut handle, data).await {
            if let Err(abort_err) = self.abort_upload(handle).await {
                warn!(provider = self.name(), "Failed to abort upload: {}", abort_err);
            }
            return Err(e);
        }
        self.complete_upload(handle).await
    }
}

/// Builds the adapter for one validated provider configuration.
pub fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn StorageProvider>> {
    config.validate()?;
    let provider: Arc<dyn StorageProvider> = match &config.settings {
        ProviderSettings::Local { root } => Arc::new(local::LocalProvider::new(&config.name, root)),
        ProviderSettings::ObjectStore { .. } => {
            Arc::new(object_store::ObjectStoreProvider::from_config(config)?)
        }
        ProviderSettings::Ftp { .. } => Arc::new(ftp::FtpProvider::from_config(config)?),
        ProviderSettings::CloudDrive { .. } => {
            Arc::new(cloud_drive::CloudDriveProvider::from_config(config)?)
        }
        ProviderSettings::Memory => Arc::new(memory::MemoryProvider::new(&config.name)),
    };
    Ok(provider)
}

pub(crate) fn not_found(provider: &str, key: &str) -> BackupError {
    BackupError::NotFound {
        entity: "object",
        id: format!("{provider}:{key}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_config_parses_tagged_settings() {
        let config: ProviderConfig = toml::from_str(
            r#"
            name = "offsite"
            max_connections = 2

            [settings]
            type = "object_store"
            endpoint = "https://s3.eu-central-1.amazonaws.com"
            bucket = "clinic-backups"
            region = "eu-central-1"
            access_key_env = "OFFSITE_ACCESS_KEY"
            secret_key_env = "OFFSITE_SECRET_KEY"
            "#,
        )
        .unwrap();

        assert_eq!(config.kind(), ProviderKind::ObjectStore);
        assert!(config.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let parsed: std::result::Result<ProviderConfig, _> = toml::from_str(
            r#"
            name = "nas"

            [settings]
            type = "local"
            root = "/srv/backups"
            colour = "blue"
            "#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn test_validation_rejects_non_http_endpoint() {
        let config = ProviderConfig {
            name: "drive".to_string(),
            enabled: true,
            max_connections: 1,
            timeout_secs: 10,
            retries: 1,
            settings: ProviderSettings::CloudDrive {
                base_url: "ftp://drive.example.com".to_string(),
                username: "ops".to_string(),
                password_env: "DRIVE_PASSWORD".to_string(),
                root_folder: String::new(),
            },
        };
        assert!(matches!(
            config.validate(),
            Err(BackupError::ConfigInvalid { .. })
        ));
    }
}
