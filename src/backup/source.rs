//! Data sources a policy backs up and targets a restore writes into.

use super::{BackupError, BackupType, EntityRef, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// One entity as read from a source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceEntry {
    pub entity: EntityRef,
    pub modified_at: DateTime<Utc>,
    pub depends_on: Vec<String>,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct SnapshotRequest {
    pub policy_id: String,
    pub backup_type: BackupType,
    /// Only entities modified after this instant; `None` for full backups
    pub since: Option<DateTime<Utc>>,
}

pub struct SourceSnapshot {
    pub total_bytes: u64,
    pub total_entries: u64,
    pub entries: BoxStream<'static, Result<SourceEntry>>,
}

#[async_trait]
pub trait BackupSource: Send + Sync + Debug {
    fn name(&self) -> &str;
    async fn snapshot(&self, request: &SnapshotRequest) -> Result<SourceSnapshot>;
}

/// An entity currently present in a restore target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveEntity {
    pub entity: EntityRef,
    pub modified_at: DateTime<Utc>,
}

#[async_trait]
pub trait RestoreTarget: Send + Sync + Debug {
    fn name(&self) -> &str;
    async fn live_entities(&self) -> Result<Vec<LiveEntity>>;
    async fn write_entity(
        &self,
        entity: &EntityRef,
        modified_at: DateTime<Utc>,
        data: Bytes,
    ) -> Result<()>;
}

#[derive(Debug, Clone)]
struct StoredEntity {
    modified_at: DateTime<Utc>,
    depends_on: Vec<String>,
    data: Bytes,
}

/// In-process data store usable as both source and restore target.
#[derive(Debug)]
pub struct InMemoryDataStore {
    name: String,
    entities: RwLock<BTreeMap<EntityRef, StoredEntity>>,
}

impl InMemoryDataStore {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entities: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn insert(
        &self,
        entity: EntityRef,
        modified_at: DateTime<Utc>,
        data: impl Into<Bytes>,
        depends_on: Vec<String>,
    ) {
        self.entities.write().await.insert(
            entity,
            StoredEntity {
                modified_at,
                depends_on,
                data: data.into(),
            },
        );
    }

    pub async fn get(&self, entity: &EntityRef) -> Option<Bytes> {
        self.entities.read().await.get(entity).map(|e| e.data.clone())
    }

    pub async fn remove(&self, entity: &EntityRef) -> bool {
        self.entities.write().await.remove(entity).is_some()
    }

    pub async fn len(&self) -> usize {
        self.entities.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entities.read().await.is_empty()
    }
}

#[async_trait]
impl BackupSource for InMemoryDataStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn snapshot(&self, request: &SnapshotRequest) -> Result<SourceSnapshot> {
        let entries: Vec<SourceEntry> = self
            .entities
            .read()
            .await
            .iter()
            .filter(|(_, e)| request.since.map_or(true, |since| e.modified_at > since))
            .map(|(entity, e)| SourceEntry {
                entity: entity.clone(),
                modified_at: e.modified_at,
                depends_on: e.depends_on.clone(),
                data: e.data.clone(),
            })
            .collect();

        let total_bytes = entries.iter().map(|e| e.data.len() as u64).sum();
        let total_entries = entries.len() as u64;
        Ok(SourceSnapshot {
            total_bytes,
            total_entries,
            entries: stream::iter(entries.into_iter().map(Ok)).boxed(),
        })
    }
}

#[async_trait]
impl RestoreTarget for InMemoryDataStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn live_entities(&self) -> Result<Vec<LiveEntity>> {
        Ok(self
            .entities
            .read()
            .await
            .iter()
            .map(|(entity, e)| LiveEntity {
                entity: entity.clone(),
                modified_at: e.modified_at,
            })
            .collect())
    }

    async fn write_entity(
        &self,
        entity: &EntityRef,
        modified_at: DateTime<Utc>,
        data: Bytes,
    ) -> Result<()> {
        let mut entities = self.entities.write().await;
        let depends_on = entities
            .get(entity)
            .map(|e| e.depends_on.clone())
            .unwrap_or_default();
        entities.insert(
            entity.clone(),
            StoredEntity {
                modified_at,
                depends_on,
                data,
            },
        );
        Ok(())
    }
}

/// Directory tree laid out as `<root>/<module>/<table>/<id>`.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    name: String,
    root: PathBuf,
}

fn checked_component(part: &str) -> Result<&str> {
    let mut components = Path::new(part).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(part),
        _ => Err(BackupError::config(format!(
            "'{part}' is not a valid entity path component"
        ))),
    }
}

async fn list_entries(path: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    let mut entries = match tokio::fs::read_dir(path).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            out.push((name.to_string(), entry.path()));
        }
    }
    out.sort();
    Ok(out)
}

impl DirectoryStore {
    pub fn new(name: &str, root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            root: root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entity_path(&self, entity: &EntityRef) -> Result<PathBuf> {
        Ok(self
            .root
            .join(checked_component(&entity.module)?)
            .join(checked_component(&entity.table)?)
            .join(checked_component(&entity.id)?))
    }

    async fn scan(&self) -> Result<Vec<(EntityRef, PathBuf, DateTime<Utc>, u64)>> {
        let mut found = Vec::new();
        for (module, module_path) in list_entries(&self.root).await? {
            if !tokio::fs::metadata(&module_path).await?.is_dir() {
                continue;
            }
            for (table, table_path) in list_entries(&module_path).await? {
                if !tokio::fs::metadata(&table_path).await?.is_dir() {
                    continue;
                }
                for (id, path) in list_entries(&table_path).await? {
                    let metadata = tokio::fs::metadata(&path).await?;
                    if !metadata.is_file() {
                        continue;
                    }
                    let modified_at: DateTime<Utc> = metadata.modified()?.into();
                    found.push((
                        EntityRef::new(module.clone(), table.clone(), id),
                        path,
                        modified_at,
                        metadata.len(),
                    ));
                }
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl BackupSource for DirectoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn snapshot(&self, request: &SnapshotRequest) -> Result<SourceSnapshot> {
        let selected: Vec<_> = self
            .scan()
            .await?
            .into_iter()
            .filter(|(_, _, modified_at, _)| request.since.map_or(true, |since| *modified_at > since))
            .collect();

        let total_bytes = selected.iter().map(|(_, _, _, len)| *len).sum();
        let total_entries = selected.len() as u64;
        debug!(
            source = %self.name,
            entries = total_entries,
            bytes = total_bytes,
            "Directory snapshot prepared"
        );

        let entries = stream::iter(selected)
            .then(|(entity, path, modified_at, _)| async move {
                let data = tokio::fs::read(&path).await?;
                Ok::<_, BackupError>(SourceEntry {
                    entity,
                    modified_at,
                    depends_on: Vec::new(),
                    data: Bytes::from(data),
                })
            })
            .boxed();

        Ok(SourceSnapshot {
            total_bytes,
            total_entries,
            entries,
        })
    }
}

#[async_trait]
impl RestoreTarget for DirectoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn live_entities(&self) -> Result<Vec<LiveEntity>> {
        Ok(self
            .scan()
            .await?
            .into_iter()
            .map(|(entity, _, modified_at, _)| LiveEntity {
                entity,
                modified_at,
            })
            .collect())
    }

    async fn write_entity(
        &self,
        entity: &EntityRef,
        _modified_at: DateTime<Utc>,
        data: Bytes,
    ) -> Result<()> {
        let path = self.entity_path(entity)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &data).await?;
        Ok(())
    }
}

/// Named sources and restore targets known to the process.
#[derive(Debug, Default, Clone)]
pub struct SourceRegistry {
    sources: HashMap<String, Arc<dyn BackupSource>>,
    targets: HashMap<String, Arc<dyn RestoreTarget>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_source(&mut self, source: Arc<dyn BackupSource>) {
        self.sources.insert(source.name().to_string(), source);
    }

    pub fn register_target(&mut self, target: Arc<dyn RestoreTarget>) {
        self.targets.insert(target.name().to_string(), target);
    }

    /// Registers a store that is both a source and a restore target
    pub fn register_store<S>(&mut self, store: Arc<S>)
    where
        S: BackupSource + RestoreTarget + 'static,
    {
        self.sources
            .insert(BackupSource::name(store.as_ref()).to_string(), store.clone());
        self.targets
            .insert(RestoreTarget::name(store.as_ref()).to_string(), store);
    }

    pub fn source(&self, name: &str) -> Result<Arc<dyn BackupSource>> {
        self.sources
            .get(name)
            .cloned()
            .ok_or_else(|| BackupError::NotFound {
                entity: "source",
                id: name.to_string(),
            })
    }

    pub fn target(&self, name: &str) -> Result<Arc<dyn RestoreTarget>> {
        self.targets
            .get(name)
            .cloned()
            .ok_or_else(|| BackupError::NotFound {
                entity: "restore target",
                id: name.to_string(),
            })
    }

    pub fn has_source(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }
}
