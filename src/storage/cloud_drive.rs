//! Cloud drive provider over WebDAV (Nextcloud, ownCloud and similar).

use super::{
    not_found, secret_from_env, ObjectInfo, ProviderConfig, ProviderKind, ProviderSettings,
    StorageProvider, UploadHandle,
};
use crate::backup::{BackupError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest_dav::list_cmd::ListEntity;
use reqwest_dav::{Auth, ClientBuilder, Depth};
use std::fmt;
use tracing::debug;

/// HTTP status behind a WebDAV failure, when one can be recovered.
fn status_of(err: &reqwest_dav::Error) -> Option<u16> {
    if let reqwest_dav::Error::Reqwest(inner) = err {
        return inner.status().map(|s| s.as_u16());
    }
    let text = err.to_string();
    [404u16, 401, 403, 405, 409, 429, 500, 502, 503, 504]
        .into_iter()
        .find(|code| text.contains(&code.to_string()))
}

pub struct CloudDriveProvider {
    name: String,
    client: reqwest_dav::Client,
    /// Path component of the base URL, e.g. `/remote.php/dav/files/ops`
    base_path: String,
    root_folder: String,
}

impl fmt::Debug for CloudDriveProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudDriveProvider")
            .field("name", &self.name)
            .field("root_folder", &self.root_folder)
            .finish()
    }
}

impl CloudDriveProvider {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let ProviderSettings::CloudDrive {
            base_url,
            username,
            password_env,
            root_folder,
        } = &config.settings
        else {
            return Err(BackupError::config(format!(
                "provider {} is not a cloud drive",
                config.name
            )));
        };

        let base_path = reqwest::Url::parse(base_url)
            .map(|url| url.path().trim_end_matches('/').to_string())
            .map_err(|e| {
                BackupError::config(format!("provider {}: invalid base_url: {e}", config.name))
            })?;
        let password = secret_from_env(&config.name, password_env)?;
        let client = ClientBuilder::new()
            .set_host(base_url.trim_end_matches('/').to_string())
            .set_auth(Auth::Basic(username.clone(), password))
            .build()
            .map_err(|e| {
                BackupError::config(format!(
                    "provider {}: failed to create WebDAV client: {e}",
                    config.name
                ))
            })?;

        Ok(Self {
            name: config.name.clone(),
            client,
            base_path,
            root_folder: root_folder.trim_matches('/').to_string(),
        })
    }

    /// Path of `key` below the WebDAV root
    fn remote_path(&self, key: &str) -> String {
        remote_path(&self.root_folder, key)
    }

    fn map_error(&self, err: reqwest_dav::Error, key: &str) -> BackupError {
        match status_of(&err) {
            Some(404) => not_found(&self.name, key),
            Some(code @ (401 | 403)) => BackupError::config(format!(
                "provider {} rejected the credentials ({code})",
                self.name
            )),
            Some(code) if code < 500 && code != 429 => {
                BackupError::storage(format!("provider {} returned {code}: {err}", self.name))
            }
            _ => BackupError::unavailable(&self.name, err.to_string()),
        }
    }

    /// Creates each parent collection of `key`; existing ones answer 405.
    async fn ensure_collections(&self, key: &str) -> Result<()> {
        let path = self.remote_path(key);
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut current = String::new();
        for segment in segments.iter().take(segments.len().saturating_sub(1)) {
            current.push('/');
            current.push_str(segment);
            if let Err(e) = self.client.mkcol(&current).await {
                if status_of(&e) != Some(405) {
                    return Err(self.map_error(e, &current));
                }
            }
        }
        Ok(())
    }
}

fn remote_path(root_folder: &str, key: &str) -> String {
    let key = key.trim_start_matches('/');
    if root_folder.is_empty() {
        format!("/{key}")
    } else {
        format!("/{root_folder}/{key}")
    }
}

/// Key of a listed href below `prefix` (the server path of the root folder).
/// Servers answer with either absolute URLs or absolute paths.
fn key_from_href(href: &str, prefix: &str) -> Option<String> {
    let path = match reqwest::Url::parse(href) {
        Ok(url) => url.path().to_string(),
        Err(_) => href.to_string(),
    };
    let key = path.strip_prefix(prefix)?;
    (!key.is_empty()).then(|| key.to_string())
}

#[async_trait]
impl StorageProvider for CloudDriveProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::CloudDrive
    }

    async fn begin_upload(&self, key: &str) -> Result<UploadHandle> {
        Ok(UploadHandle::new(key))
    }

    async fn upload_part(&self, handle: &mut UploadHandle, data: Bytes) -> Result<()> {
        handle.staged.extend_from_slice(&data);
        handle.part_count += 1;
        handle.bytes_written += data.len() as u64;
        Ok(())
    }

    async fn complete_upload(&self, mut handle: UploadHandle) -> Result<u64> {
        self.ensure_collections(&handle.key).await?;
        let body = handle.staged.split().freeze();
        self.client
            .put(&self.remote_path(&handle.key), body.to_vec())
            .await
            .map_err(|e| self.map_error(e, &handle.key))?;
        debug!(provider = %self.name, key = %handle.key, bytes = handle.bytes_written, "Upload completed");
        Ok(handle.bytes_written)
    }

    async fn abort_upload(&self, _handle: UploadHandle) -> Result<()> {
        // nothing reaches the server before complete_upload
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Bytes> {
        let response = self
            .client
            .get(&self.remote_path(key))
            .await
            .map_err(|e| self.map_error(e, key))?;
        response
            .bytes()
            .await
            .map_err(|e| BackupError::unavailable(&self.name, format!("read failed: {e}")))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let root = format!("{}/", self.remote_path("").trim_end_matches('/'));
        let href_prefix = format!("{}{root}", self.base_path);
        let entries = match self.client.list(&root, Depth::Infinity).await {
            Ok(entries) => entries,
            Err(e) => match self.map_error(e, prefix) {
                BackupError::NotFound { .. } => return Ok(Vec::new()),
                other => return Err(other),
            },
        };

        let mut objects: Vec<ObjectInfo> = entries
            .into_iter()
            .filter_map(|entry| match entry {
                ListEntity::File(file) => Some(file),
                ListEntity::Folder(_) => None,
            })
            .filter_map(|file| {
                let key = key_from_href(&file.href, &href_prefix)?;
                key.starts_with(prefix).then(|| ObjectInfo {
                    key,
                    size_bytes: u64::try_from(file.content_length).unwrap_or(0),
                    modified_at: Some(file.last_modified),
                })
            })
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete(&self.remote_path(key))
            .await
            .map_err(|e| self.map_error(e, key))
    }

    async fn test_connection(&self) -> Result<()> {
        let root = self.remote_path("");
        self.client
            .list(&root, Depth::Number(0))
            .await
            .map_err(|e| self.map_error(e, &root))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_paths_sit_below_root_folder() {
        assert_eq!(remote_path("", "nightly/a.bkc"), "/nightly/a.bkc");
        assert_eq!(remote_path("backups", "/nightly/a.bkc"), "/backups/nightly/a.bkc");
    }

    #[test]
    fn test_keys_are_recovered_from_server_hrefs() {
        let prefix = "/remote.php/dav/files/ops/backups/";
        assert_eq!(
            key_from_href("/remote.php/dav/files/ops/backups/nightly/a.bkc", prefix).as_deref(),
            Some("nightly/a.bkc")
        );
        assert_eq!(
            key_from_href(
                "https://drive.example.com/remote.php/dav/files/ops/backups/nightly/b.bkc",
                prefix
            )
            .as_deref(),
            Some("nightly/b.bkc")
        );
        assert_eq!(key_from_href("/remote.php/dav/files/ops/backups/", prefix), None);
        assert_eq!(key_from_href("/elsewhere/a.bkc", prefix), None);
    }

    #[test]
    fn test_missing_password_is_a_config_error() {
        let config = ProviderConfig {
            name: "drive".to_string(),
            enabled: true,
            max_connections: 1,
            timeout_secs: 10,
            retries: 1,
            settings: ProviderSettings::CloudDrive {
                base_url: "https://drive.example.com/remote.php/dav/files/ops".to_string(),
                username: "ops".to_string(),
                password_env: "CLOUD_DRIVE_TEST_UNSET_PASSWORD".to_string(),
                root_folder: "backups".to_string(),
            },
        };
        assert!(matches!(
            CloudDriveProvider::from_config(&config),
            Err(BackupError::ConfigInvalid { .. })
        ));
    }
}
