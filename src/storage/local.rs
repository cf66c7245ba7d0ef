use super::{not_found, ObjectInfo, ProviderKind, StorageProvider, UploadHandle};
use crate::backup::{BackupError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

const STAGING_DIR: &str = ".uploads";

/// Filesystem provider. Parts are appended to a staging file that is renamed
/// into place on completion.
#[derive(Debug)]
pub struct LocalProvider {
    name: String,
    root: PathBuf,
}

impl LocalProvider {
    pub fn new(name: &str, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            root: root.into(),
        }
    }

    fn key_to_path(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let safe = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !safe {
            return Err(BackupError::storage(format!("invalid object key '{key}'")));
        }
        Ok(self.root.join(relative))
    }

    fn staging_path(&self, handle: &UploadHandle) -> PathBuf {
        self.root.join(STAGING_DIR).join(&handle.upload_id)
    }

    fn io_error(&self, action: &str, key: &str, e: std::io::Error) -> BackupError {
        if e.kind() == std::io::ErrorKind::NotFound {
            not_found(&self.name, key)
        } else {
            BackupError::unavailable(&self.name, format!("failed to {action} {key}: {e}"))
        }
    }
}

#[async_trait]
impl StorageProvider for LocalProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    async fn begin_upload(&self, key: &str) -> Result<UploadHandle> {
        self.key_to_path(key)?;
        let handle = UploadHandle::new(key);
        let staging = self.staging_path(&handle);
        if let Some(parent) = staging.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error("prepare staging for", key, e))?;
        }
        fs::File::create(&staging)
            .await
            .map_err(|e| self.io_error("stage", key, e))?;
        Ok(handle)
    }

    async fn upload_part(&self, handle: &mut UploadHandle, data: Bytes) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(self.staging_path(handle))
            .await
            .map_err(|e| self.io_error("append to", &handle.key, e))?;
        file.write_all(&data)
            .await
            .map_err(|e| self.io_error("append to", &handle.key, e))?;
        handle.part_count += 1;
        handle.bytes_written += data.len() as u64;
        Ok(())
    }

    async fn complete_upload(&self, handle: UploadHandle) -> Result<u64> {
        let staging = self.staging_path(&handle);
        let target = self.key_to_path(&handle.key)?;

        let file = fs::OpenOptions::new()
            .write(true)
            .open(&staging)
            .await
            .map_err(|e| self.io_error("finalize", &handle.key, e))?;
        file.sync_all()
            .await
            .map_err(|e| self.io_error("finalize", &handle.key, e))?;

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error("create directory for", &handle.key, e))?;
        }
        fs::rename(&staging, &target)
            .await
            .map_err(|e| self.io_error("publish", &handle.key, e))?;

        debug!(provider = %self.name, key = %handle.key, bytes = handle.bytes_written, "Upload completed");
        Ok(handle.bytes_written)
    }

    async fn abort_upload(&self, handle: UploadHandle) -> Result<()> {
        match fs::remove_file(self.staging_path(&handle)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_error("abort", &handle.key, e)),
        }
    }

    async fn read(&self, key: &str) -> Result<Bytes> {
        let path = self.key_to_path(key)?;
        let content = fs::read(&path)
            .await
            .map_err(|e| self.io_error("read", key, e))?;
        Ok(Bytes::from(content))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(self.io_error("list", prefix, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| self.io_error("list", prefix, e))?
            {
                let path = entry.path();
                let metadata = entry
                    .metadata()
                    .await
                    .map_err(|e| self.io_error("list", prefix, e))?;
                if metadata.is_dir() {
                    if entry.file_name() != STAGING_DIR {
                        pending.push(path);
                    }
                    continue;
                }
                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative.to_string_lossy().replace('\\', "/");
                if key.starts_with(prefix) {
                    objects.push(ObjectInfo {
                        key,
                        size_bytes: metadata.len(),
                        modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
                    });
                }
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_to_path(key)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| self.io_error("delete", key, e))
    }

    async fn test_connection(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| self.io_error("create", &self.root.display().to_string(), e))?;
        let marker = self.root.join(format!(".write-check-{}", uuid::Uuid::new_v4()));
        fs::write(&marker, b"ok")
            .await
            .map_err(|e| self.io_error("write check", "marker", e))?;
        fs::remove_file(&marker)
            .await
            .map_err(|e| self.io_error("remove check", "marker", e))?;
        Ok(())
    }
}
