//! S3-compatible object store provider on `rust-s3`.
//!
//! Uploads start as a plain buffer and switch to the S3 multipart API once a
//! part reaches the 5 MiB minimum, so small backups cost a single `PUT`.

use super::{
    not_found, secret_from_env, ObjectInfo, ProviderConfig, ProviderKind, ProviderSettings,
    StorageProvider, UploadHandle,
};
use crate::backup::{BackupError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use s3::bucket::Bucket;
use s3::creds::Credentials;
use s3::error::S3Error;
use s3::region::Region;
use s3::serde_types::Part;
use std::fmt;
use tracing::debug;

pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;
const CONTENT_TYPE: &str = "application/octet-stream";

pub struct ObjectStoreProvider {
    name: String,
    bucket: Box<Bucket>,
}

impl fmt::Debug for ObjectStoreProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStoreProvider")
            .field("name", &self.name)
            .field("bucket", &self.bucket.name())
            .finish()
    }
}

impl ObjectStoreProvider {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let ProviderSettings::ObjectStore {
            endpoint,
            bucket,
            region,
            access_key_env,
            secret_key_env,
            path_style,
        } = &config.settings
        else {
            return Err(BackupError::config(format!(
                "provider {} is not an object store",
                config.name
            )));
        };

        let access_key = secret_from_env(&config.name, access_key_env)?;
        let secret_key = secret_from_env(&config.name, secret_key_env)?;
        let credentials = Credentials::new(Some(&access_key), Some(&secret_key), None, None, None)
            .map_err(|e| {
                BackupError::config(format!("provider {}: invalid credentials: {e}", config.name))
            })?;

        let region = Region::Custom {
            region: region.clone(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
        };
        let handle = Bucket::new(bucket, region, credentials).map_err(|e| {
            BackupError::config(format!("provider {}: failed to open bucket: {e}", config.name))
        })?;
        let handle = if *path_style {
            handle.with_path_style()
        } else {
            handle
        };

        Ok(Self {
            name: config.name.clone(),
            bucket: handle,
        })
    }

    fn map_error(&self, e: S3Error, key: &str) -> BackupError {
        classify(&self.name, e, key)
    }

    async fn flush_part(&self, handle: &mut UploadHandle) -> Result<()> {
        let upload_id = match &handle.remote_id {
            Some(id) => id.clone(),
            None => {
                let started = self
                    .bucket
                    .initiate_multipart_upload(&handle.key, CONTENT_TYPE)
                    .await
                    .map_err(|e| self.map_error(e, &handle.key))?;
                handle.remote_id = Some(started.upload_id.clone());
                started.upload_id
            }
        };

        let part_number = handle.receipts.len() as u32 + 1;
        let chunk = handle.staged.split().freeze();
        let part = self
            .bucket
            .put_multipart_chunk(chunk.to_vec(), &handle.key, part_number, &upload_id, CONTENT_TYPE)
            .await
            .map_err(|e| self.map_error(e, &handle.key))?;
        handle.receipts.push(part.etag);
        Ok(())
    }
}

/// Maps an S3 failure onto the error taxonomy.
fn classify(provider: &str, e: S3Error, key: &str) -> BackupError {
    match e {
        S3Error::HttpFailWithBody(404, _) => not_found(provider, key),
        S3Error::HttpFailWithBody(code @ (401 | 403), _) => BackupError::config(format!(
            "provider {provider} rejected credentials ({code})"
        )),
        S3Error::HttpFailWithBody(code, body) if code >= 500 || code == 429 => {
            BackupError::unavailable(provider, format!("{code}: {body}"))
        }
        S3Error::HttpFailWithBody(code, body) => {
            BackupError::storage(format!("provider {provider} returned {code}: {body}"))
        }
        other => BackupError::unavailable(provider, format!("request failed: {other}")),
    }
}

#[async_trait]
impl StorageProvider for ObjectStoreProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::ObjectStore
    }

    async fn begin_upload(&self, key: &str) -> Result<UploadHandle> {
        Ok(UploadHandle::new(key))
    }

    async fn upload_part(&self, handle: &mut UploadHandle, data: Bytes) -> Result<()> {
        handle.staged.extend_from_slice(&data);
        handle.part_count += 1;
        handle.bytes_written += data.len() as u64;
        if handle.staged.len() >= MIN_PART_SIZE {
            self.flush_part(handle).await?;
        }
        Ok(())
    }

    async fn complete_upload(&self, mut handle: UploadHandle) -> Result<u64> {
        let Some(upload_id) = handle.remote_id.clone() else {
            let body = handle.staged.split().freeze();
            self.bucket
                .put_object(&handle.key, &body)
                .await
                .map_err(|e| self.map_error(e, &handle.key))?;
            return Ok(handle.bytes_written);
        };

        if !handle.staged.is_empty() {
            self.flush_part(&mut handle).await?;
        }

        let parts: Vec<Part> = handle
            .receipts
            .iter()
            .enumerate()
            .map(|(i, etag)| Part {
                part_number: i as u32 + 1,
                etag: etag.clone(),
            })
            .collect();
        let part_count = parts.len();
        self.bucket
            .complete_multipart_upload(&handle.key, &upload_id, parts)
            .await
            .map_err(|e| self.map_error(e, &handle.key))?;

        debug!(provider = %self.name, key = %handle.key, parts = part_count, "Multipart upload completed");
        Ok(handle.bytes_written)
    }

    async fn abort_upload(&self, handle: UploadHandle) -> Result<()> {
        let Some(upload_id) = handle.remote_id else {
            return Ok(());
        };
        match self.bucket.abort_upload(&handle.key, &upload_id).await {
            Ok(()) => Ok(()),
            Err(e) => match self.map_error(e, &handle.key) {
                BackupError::NotFound { .. } => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn read(&self, key: &str) -> Result<Bytes> {
        let response = self
            .bucket
            .get_object(key)
            .await
            .map_err(|e| self.map_error(e, key))?;
        Ok(Bytes::from(response.to_vec()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let pages = self
            .bucket
            .list(prefix.to_string(), None)
            .await
            .map_err(|e| self.map_error(e, prefix))?;

        Ok(pages
            .into_iter()
            .flat_map(|page| page.contents)
            .map(|object| ObjectInfo {
                modified_at: DateTime::parse_from_rfc3339(&object.last_modified)
                    .ok()
                    .map(|d| d.with_timezone(&Utc)),
                size_bytes: object.size,
                key: object.key,
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.bucket
            .delete_object(key)
            .await
            .map_err(|e| self.map_error(e, key))?;
        Ok(())
    }

    async fn test_connection(&self) -> Result<()> {
        self.bucket
            .list_page(String::new(), None, None, None, Some(1))
            .await
            .map_err(|e| self.map_error(e, ""))?;
        Ok(())
    }
}
