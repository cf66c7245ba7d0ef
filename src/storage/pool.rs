use super::{ObjectInfo, ProviderConfig, ProviderKind, StorageProvider, UploadHandle};
use crate::backup::{BackupError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Bounds concurrent operations against one provider and applies its
/// per-operation timeout. An elapsed timeout is reported as
/// `PROVIDER_UNAVAILABLE` so callers retry or fail over.
#[derive(Debug)]
pub struct PooledProvider {
    inner: Arc<dyn StorageProvider>,
    permits: Semaphore,
    max_connections: usize,
    timeout: Duration,
}

impl PooledProvider {
    pub fn new(inner: Arc<dyn StorageProvider>, max_connections: usize, timeout: Duration) -> Self {
        let max_connections = max_connections.max(1);
        Self {
            inner,
            permits: Semaphore::new(max_connections),
            max_connections,
            timeout,
        }
    }

    pub fn from_config(inner: Arc<dyn StorageProvider>, config: &ProviderConfig) -> Self {
        Self::new(
            inner,
            config.max_connections,
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn inner(&self) -> &Arc<dyn StorageProvider> {
        &self.inner
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    async fn run<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| BackupError::unavailable(self.inner.name(), "connection pool closed"))?;
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(BackupError::unavailable(
                self.inner.name(),
                format!("{operation} timed out after {}s", self.timeout.as_secs()),
            )),
        }
    }
}

#[async_trait]
impl StorageProvider for PooledProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn kind(&self) -> ProviderKind {
        self.inner.kind()
    }

    async fn begin_upload(&self, key: &str) -> Result<UploadHandle> {
        self.run("begin_upload", self.inner.begin_upload(key)).await
    }

    async fn upload_part(&self, handle: &mut UploadHandle, data: Bytes) -> Result<()> {
        self.run("upload_part", self.inner.upload_part(handle, data))
            .await
    }

    async fn complete_upload(&self, handle: UploadHandle) -> Result<u64> {
        self.run("complete_upload", self.inner.complete_upload(handle))
            .await
    }

    async fn abort_upload(&self, handle: UploadHandle) -> Result<()> {
        self.run("abort_upload", self.inner.abort_upload(handle))
            .await
    }

    async fn read(&self, key: &str) -> Result<Bytes> {
        self.run("read", self.inner.read(key)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        self.run("list", self.inner.list(prefix)).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.run("delete", self.inner.delete(key)).await
    }

    async fn test_connection(&self) -> Result<()> {
        self.run("test_connection", self.inner.test_connection())
            .await
    }
}
