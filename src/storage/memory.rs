use super::{not_found, ObjectInfo, ProviderKind, StorageProvider, UploadHandle};
use crate::backup::{BackupError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    modified_at: DateTime<Utc>,
}

/// In-process provider with scriptable faults.
///
/// `fail_next_writes(n)` makes the next `n` part uploads fail with a
/// retryable `PROVIDER_UNAVAILABLE`, `set_unavailable(true)` fails every
/// operation, and `set_write_delay` slows each part upload down so a test can
/// cancel or time out a job mid-transfer.
#[derive(Debug)]
pub struct MemoryProvider {
    name: String,
    objects: Mutex<BTreeMap<String, StoredObject>>,
    uploads: Mutex<HashMap<String, BytesMut>>,
    failing_writes: AtomicU32,
    unavailable: AtomicBool,
    write_delay_ms: AtomicU64,
    aborted: AtomicU32,
    completed: AtomicU32,
}

impl MemoryProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            objects: Mutex::new(BTreeMap::new()),
            uploads: Mutex::new(HashMap::new()),
            failing_writes: AtomicU32::new(0),
            unavailable: AtomicBool::new(false),
            write_delay_ms: AtomicU64::new(0),
            aborted: AtomicU32::new(0),
            completed: AtomicU32::new(0),
        }
    }

    pub fn fail_next_writes(&self, count: u32) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        self.write_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn aborted_uploads(&self) -> u32 {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn completed_uploads(&self) -> u32 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn in_flight_uploads(&self) -> usize {
        self.uploads.lock().map(|u| u.len()).unwrap_or(0)
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects
            .lock()
            .map(|o| o.contains_key(key))
            .unwrap_or(false)
    }

    /// Overwrites a stored object in place, bypassing the upload contract
    pub fn corrupt(&self, key: &str, data: Bytes) {
        if let Ok(mut objects) = self.objects.lock() {
            if let Some(object) = objects.get_mut(key) {
                object.data = data;
            }
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackupError::unavailable(&self.name, "provider is offline"));
        }
        Ok(())
    }

    fn poisoned(&self) -> BackupError {
        BackupError::storage(format!("provider {} state lock poisoned", self.name))
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Memory
    }

    async fn begin_upload(&self, key: &str) -> Result<UploadHandle> {
        self.check_available()?;
        let handle = UploadHandle::new(key);
        self.uploads
            .lock()
            .map_err(|_| self.poisoned())?
            .insert(handle.upload_id.clone(), BytesMut::new());
        Ok(handle)
    }

    async fn upload_part(&self, handle: &mut UploadHandle, data: Bytes) -> Result<()> {
        let delay = self.write_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check_available()?;

        let should_fail = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(BackupError::unavailable(&self.name, "injected write failure"));
        }

        let mut uploads = self.uploads.lock().map_err(|_| self.poisoned())?;
        let buffer = uploads
            .get_mut(&handle.upload_id)
            .ok_or_else(|| BackupError::storage(format!("unknown upload {}", handle.upload_id)))?;
        buffer.extend_from_slice(&data);
        handle.part_count += 1;
        handle.bytes_written += data.len() as u64;
        Ok(())
    }

    async fn complete_upload(&self, handle: UploadHandle) -> Result<u64> {
        self.check_available()?;
        let data = self
            .uploads
            .lock()
            .map_err(|_| self.poisoned())?
            .remove(&handle.upload_id)
            .ok_or_else(|| BackupError::storage(format!("unknown upload {}", handle.upload_id)))?
            .freeze();
        let size = data.len() as u64;
        self.objects.lock().map_err(|_| self.poisoned())?.insert(
            handle.key,
            StoredObject {
                data,
                modified_at: Utc::now(),
            },
        );
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(size)
    }

    async fn abort_upload(&self, handle: UploadHandle) -> Result<()> {
        self.uploads
            .lock()
            .map_err(|_| self.poisoned())?
            .remove(&handle.upload_id);
        self.aborted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Bytes> {
        self.check_available()?;
        self.objects
            .lock()
            .map_err(|_| self.poisoned())?
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| not_found(&self.name, key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        self.check_available()?;
        Ok(self
            .objects
            .lock()
            .map_err(|_| self.poisoned())?
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectInfo {
                key: key.clone(),
                size_bytes: object.data.len() as u64,
                modified_at: Some(object.modified_at),
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.objects
            .lock()
            .map_err(|_| self.poisoned())?
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| not_found(&self.name, key))
    }

    async fn test_connection(&self) -> Result<()> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let provider = MemoryProvider::new("primary");
        provider.fail_next_writes(2);

        assert!(provider.write("a", Bytes::from_static(b"1")).await.is_err());
        assert!(provider.write("a", Bytes::from_static(b"1")).await.is_err());
        assert!(provider.write("a", Bytes::from_static(b"1")).await.is_ok());
        assert_eq!(provider.aborted_uploads(), 2);
        assert!(provider.contains("a"));
    }

    #[tokio::test]
    async fn test_unavailable_provider_rejects_reads() {
        let provider = MemoryProvider::new("primary");
        provider.write("a", Bytes::from_static(b"1")).await.unwrap();
        provider.set_unavailable(true);
        assert!(matches!(
            provider.read("a").await,
            Err(BackupError::ProviderUnavailable { .. })
        ));
    }
}
