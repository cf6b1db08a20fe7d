//! State store.
//!
//! Durable key/value registry of engine entities grouped by [`Collection`].
//! Values are JSON documents; typed access goes through [`load`], [`save`]
//! and [`modify`].
//!
//! Index lists (`jobs-list` for training, `list` elsewhere) live next to the
//! records they index. Creating and deleting an indexed record is a single
//! store operation ([`StateStore::insert_indexed`] / [`StateStore::delete_indexed`]),
//! so a reader never observes an index entry without its record or the reverse.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

/// Namespace for store keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Models,
    Datasets,
    Training,
    Evaluations,
    Synthesis,
}

impl Collection {
    pub const ALL: [Self; 5] =
        [Self::Models, Self::Datasets, Self::Training, Self::Evaluations, Self::Synthesis];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Models => "models",
            Self::Datasets => "datasets",
            Self::Training => "training",
            Self::Evaluations => "evaluations",
            Self::Synthesis => "synthesis",
        }
    }

    /// Key of the id index kept in this collection.
    #[must_use]
    pub const fn index_key(self) -> &'static str {
        match self {
            Self::Training => keys::JOBS_LIST,
            _ => keys::LIST,
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key scheme shared by every store implementation.
pub mod keys {
    pub const LIST: &str = "list";
    pub const JOBS_LIST: &str = "jobs-list";

    #[must_use]
    pub fn job(id: &str) -> String {
        format!("job-{id}")
    }

    #[must_use]
    pub fn metrics(job_id: &str) -> String {
        format!("metrics-{job_id}")
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),

    #[error("stored value has unexpected shape: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Read-modify-write step applied atomically by [`StateStore::update`].
///
/// Receives the current value (if any); returning `None` leaves the key untouched,
/// returning `Some(Value::Null)` tombstones it.
pub type UpdateFn<'a> = Box<dyn FnOnce(Option<&Value>) -> Option<Value> + Send + 'a>;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, collection: Collection, key: &str) -> StoreResult<Option<Value>>;

    /// Writes `value`; `Value::Null` is a tombstone and removes the key.
    async fn set(&self, collection: Collection, key: &str, value: Value) -> StoreResult<()>;

    /// Atomic read-modify-write. Returns the written value, or `None` if `apply` declined.
    async fn update(
        &self,
        collection: Collection,
        key: &str,
        apply: UpdateFn<'_>,
    ) -> StoreResult<Option<Value>>;

    async fn list(&self, collection: Collection, index: &str) -> StoreResult<Vec<String>>;

    async fn list_append(&self, collection: Collection, index: &str, id: &str) -> StoreResult<()>;

    /// Writes a record and appends its id to `index` as one unit.
    async fn insert_indexed(
        &self,
        collection: Collection,
        index: &str,
        key: &str,
        id: &str,
        value: Value,
    ) -> StoreResult<()>;

    /// Tombstones a record and removes its id from `index` as one unit.
    /// Returns whether the record existed.
    async fn delete_indexed(
        &self,
        collection: Collection,
        index: &str,
        key: &str,
        id: &str,
    ) -> StoreResult<bool>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(transparent)]
struct Tables(BTreeMap<Collection, BTreeMap<String, Value>>);

impl Tables {
    fn get(&self, collection: Collection, key: &str) -> Option<&Value> {
        self.0.get(&collection).and_then(|t| t.get(key))
    }

    fn set(&mut self, collection: Collection, key: &str, value: Value) {
        let table = self.0.entry(collection).or_default();
        if value.is_null() {
            table.remove(key);
        } else {
            table.insert(key.to_string(), value);
        }
    }

    fn update(&mut self, collection: Collection, key: &str, apply: UpdateFn<'_>) -> Option<Value> {
        let next = apply(self.get(collection, key))?;
        self.set(collection, key, next.clone());
        Some(next)
    }

    fn list(&self, collection: Collection, index: &str) -> Vec<String> {
        self.get(collection, index)
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default()
    }

    fn list_append(&mut self, collection: Collection, index: &str, id: &str) {
        let mut ids = self.list(collection, index);
        if !ids.iter().any(|existing| existing == id) {
            ids.push(id.to_string());
        }
        self.set(collection, index, Value::from(ids));
    }

    fn list_remove(&mut self, collection: Collection, index: &str, id: &str) {
        let mut ids = self.list(collection, index);
        ids.retain(|existing| existing != id);
        self.set(collection, index, Value::from(ids));
    }

    fn delete_indexed(&mut self, collection: Collection, index: &str, key: &str, id: &str) -> bool {
        let existed = self.get(collection, key).is_some();
        self.set(collection, key, Value::Null);
        self.list_remove(collection, index, id);
        existed
    }
}

/// Process-local store. Contents do not survive a restart.
pub struct MemoryStore {
    tables: RwLock<Tables>,
    available: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self { tables: RwLock::new(Tables::default()), available: AtomicBool::new(true) }
    }

    /// Simulates the backing storage going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("available", &self.available.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, collection: Collection, key: &str) -> StoreResult<Option<Value>> {
        self.ensure_available()?;
        Ok(self.tables.read().await.get(collection, key).cloned())
    }

    async fn set(&self, collection: Collection, key: &str, value: Value) -> StoreResult<()> {
        self.ensure_available()?;
        self.tables.write().await.set(collection, key, value);
        Ok(())
    }

    async fn update(
        &self,
        collection: Collection,
        key: &str,
        apply: UpdateFn<'_>,
    ) -> StoreResult<Option<Value>> {
        self.ensure_available()?;
        Ok(self.tables.write().await.update(collection, key, apply))
    }

    async fn list(&self, collection: Collection, index: &str) -> StoreResult<Vec<String>> {
        self.ensure_available()?;
        Ok(self.tables.read().await.list(collection, index))
    }

    async fn list_append(&self, collection: Collection, index: &str, id: &str) -> StoreResult<()> {
        self.ensure_available()?;
        self.tables.write().await.list_append(collection, index, id);
        Ok(())
    }

    async fn insert_indexed(
        &self,
        collection: Collection,
        index: &str,
        key: &str,
        id: &str,
        value: Value,
    ) -> StoreResult<()> {
        self.ensure_available()?;
        let mut tables = self.tables.write().await;
        tables.set(collection, key, value);
        tables.list_append(collection, index, id);
        Ok(())
    }

    async fn delete_indexed(
        &self,
        collection: Collection,
        index: &str,
        key: &str,
        id: &str,
    ) -> StoreResult<bool> {
        self.ensure_available()?;
        Ok(self.tables.write().await.delete_indexed(collection, index, key, id))
    }
}

/// Store persisted to a single JSON file.
///
/// Every mutation rewrites the snapshot through a temp file and a rename while
/// the write lock is held, so the file always holds a complete state.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    tables: RwLock<Tables>,
}

impl JsonFileStore {
    /// Opens the store at `path`, loading an existing snapshot if there is one.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        let tables = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(e) => return Err(e.into()),
        };
        debug!(path = %path.display(), "Opened JSON file store");
        Ok(Self { path, tables: RwLock::new(tables) })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, tables: &Tables) -> StoreResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec_pretty(tables)?;
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, json).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    async fn mutate<R: Send>(&self, f: impl FnOnce(&mut Tables) -> R + Send) -> StoreResult<R> {
        let mut tables = self.tables.write().await;
        // Work on a copy so a failed write leaves memory and disk in agreement.
        let mut next = tables.clone();
        let out = f(&mut next);
        self.persist(&next).await?;
        *tables = next;
        Ok(out)
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn get(&self, collection: Collection, key: &str) -> StoreResult<Option<Value>> {
        Ok(self.tables.read().await.get(collection, key).cloned())
    }

    async fn set(&self, collection: Collection, key: &str, value: Value) -> StoreResult<()> {
        self.mutate(|t| t.set(collection, key, value)).await
    }

    async fn update(
        &self,
        collection: Collection,
        key: &str,
        apply: UpdateFn<'_>,
    ) -> StoreResult<Option<Value>> {
        self.mutate(|t| t.update(collection, key, apply)).await
    }

    async fn list(&self, collection: Collection, index: &str) -> StoreResult<Vec<String>> {
        Ok(self.tables.read().await.list(collection, index))
    }

    async fn list_append(&self, collection: Collection, index: &str, id: &str) -> StoreResult<()> {
        self.mutate(|t| t.list_append(collection, index, id)).await
    }

    async fn insert_indexed(
        &self,
        collection: Collection,
        index: &str,
        key: &str,
        id: &str,
        value: Value,
    ) -> StoreResult<()> {
        self.mutate(|t| {
            t.set(collection, key, value);
            t.list_append(collection, index, id);
        })
        .await
    }

    async fn delete_indexed(
        &self,
        collection: Collection,
        index: &str,
        key: &str,
        id: &str,
    ) -> StoreResult<bool> {
        self.mutate(|t| t.delete_indexed(collection, index, key, id)).await
    }
}

/// Outcome of a typed [`modify`].
#[derive(Debug, Clone, PartialEq)]
pub enum Modified<T> {
    /// No record under the key.
    Missing,
    /// The record exists but the closure declined to change it.
    Unchanged(T),
    /// The closure's changes were written.
    Written(T),
}

pub async fn load<T: DeserializeOwned>(
    store: &dyn StateStore,
    collection: Collection,
    key: &str,
) -> StoreResult<Option<T>> {
    match store.get(collection, key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

pub async fn save<T: Serialize + Sync>(
    store: &dyn StateStore,
    collection: Collection,
    key: &str,
    record: &T,
) -> StoreResult<()> {
    store.set(collection, key, serde_json::to_value(record)?).await
}

/// Typed read-check-write. `f` mutates the record in place and returns whether
/// the change should be written.
pub async fn modify<T, F>(
    store: &dyn StateStore,
    collection: Collection,
    key: &str,
    f: F,
) -> StoreResult<Modified<T>>
where
    T: Serialize + DeserializeOwned + Send,
    F: FnOnce(&mut T) -> bool + Send,
{
    let mut outcome: StoreResult<Modified<T>> = Ok(Modified::Missing);
    let slot = &mut outcome;
    store
        .update(
            collection,
            key,
            Box::new(move |current| {
                let current = current?;
                let mut record: T = match serde_json::from_value(current.clone()) {
                    Ok(record) => record,
                    Err(e) => {
                        *slot = Err(e.into());
                        return None;
                    }
                };
                if !f(&mut record) {
                    *slot = Ok(Modified::Unchanged(record));
                    return None;
                }
                match serde_json::to_value(&record) {
                    Ok(value) => {
                        *slot = Ok(Modified::Written(record));
                        Some(value)
                    }
                    Err(e) => {
                        *slot = Err(e.into());
                        None
                    }
                }
            }),
        )
        .await?;
    outcome
}

/// Loads every record referenced by `collection`'s index, in index order.
pub async fn load_indexed<T: DeserializeOwned>(
    store: &dyn StateStore,
    collection: Collection,
    key_for: impl Fn(&str) -> String + Send,
) -> StoreResult<Vec<T>> {
    let ids = store.list(collection, collection.index_key()).await?;
    let mut records = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(record) = load(store, collection, &key_for(&id)).await? {
            records.push(record);
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        value: u32,
    }

    #[tokio::test]
    async fn test_set_null_is_tombstone() {
        let store = MemoryStore::new();
        store.set(Collection::Datasets, "d1", json!({"a": 1})).await.unwrap();
        assert!(store.get(Collection::Datasets, "d1").await.unwrap().is_some());

        store.set(Collection::Datasets, "d1", Value::Null).await.unwrap();
        assert!(store.get(Collection::Datasets, "d1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_collections_are_namespaced() {
        let store = MemoryStore::new();
        store.set(Collection::Datasets, "x", json!(1)).await.unwrap();
        store.set(Collection::Synthesis, "x", json!(2)).await.unwrap();

        assert_eq!(store.get(Collection::Datasets, "x").await.unwrap(), Some(json!(1)));
        assert_eq!(store.get(Collection::Synthesis, "x").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_indexed_insert_and_delete_are_paired() {
        let store = MemoryStore::new();
        let key = keys::job("j1");
        store
            .insert_indexed(Collection::Training, keys::JOBS_LIST, &key, "j1", json!({"id": "j1"}))
            .await
            .unwrap();
        store.list_append(Collection::Training, keys::JOBS_LIST, "j1").await.unwrap();
        assert_eq!(store.list(Collection::Training, keys::JOBS_LIST).await.unwrap(), vec!["j1"]);

        assert!(store.delete_indexed(Collection::Training, keys::JOBS_LIST, &key, "j1").await.unwrap());
        assert!(store.list(Collection::Training, keys::JOBS_LIST).await.unwrap().is_empty());
        assert!(store.get(Collection::Training, &key).await.unwrap().is_none());

        // Deleting again is harmless.
        assert!(!store.delete_indexed(Collection::Training, keys::JOBS_LIST, &key, "j1").await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_operation() {
        let store = MemoryStore::new();
        store.set_available(false);

        assert!(matches!(store.get(Collection::Models, "m").await, Err(StoreError::Unavailable(_))));
        assert!(matches!(
            store.set(Collection::Models, "m", json!(1)).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(
            store.list(Collection::Models, keys::LIST).await,
            Err(StoreError::Unavailable(_))
        ));

        store.set_available(true);
        assert!(store.get(Collection::Models, "m").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_modify_reports_missing_unchanged_and_written() {
        let store = MemoryStore::new();

        let missing = modify(&store, Collection::Datasets, "c", |c: &mut Counter| {
            c.value += 1;
            true
        })
        .await
        .unwrap();
        assert_eq!(missing, Modified::Missing);
        assert!(store.get(Collection::Datasets, "c").await.unwrap().is_none());

        save(&store, Collection::Datasets, "c", &Counter { value: 1 }).await.unwrap();

        let unchanged =
            modify(&store, Collection::Datasets, "c", |_: &mut Counter| false).await.unwrap();
        assert_eq!(unchanged, Modified::Unchanged(Counter { value: 1 }));

        let written = modify(&store, Collection::Datasets, "c", |c: &mut Counter| {
            c.value += 1;
            true
        })
        .await
        .unwrap();
        assert_eq!(written, Modified::Written(Counter { value: 2 }));

        let loaded: Counter = load(&store, Collection::Datasets, "c").await.unwrap().unwrap();
        assert_eq!(loaded.value, 2);
    }

    #[tokio::test]
    async fn test_concurrent_modify_loses_no_updates() {
        let store = std::sync::Arc::new(MemoryStore::new());
        save(store.as_ref(), Collection::Training, "n", &Counter { value: 0 }).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                modify(store.as_ref(), Collection::Training, "n", |c: &mut Counter| {
                    c.value += 1;
                    true
                })
                .await
                .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let loaded: Counter = load(store.as_ref(), Collection::Training, "n").await.unwrap().unwrap();
        assert_eq!(loaded.value, 32);
    }

    #[tokio::test]
    async fn test_json_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("store.json");

        {
            let store = JsonFileStore::open(&path).await.unwrap();
            store
                .insert_indexed(Collection::Synthesis, keys::LIST, "s1", "s1", json!({"id": "s1"}))
                .await
                .unwrap();
            store.set(Collection::Models, "m1", json!({"id": "m1"})).await.unwrap();
        }

        let reopened = JsonFileStore::open(&path).await.unwrap();
        assert_eq!(reopened.list(Collection::Synthesis, keys::LIST).await.unwrap(), vec!["s1"]);
        assert_eq!(
            reopened.get(Collection::Models, "m1").await.unwrap(),
            Some(json!({"id": "m1"}))
        );

        reopened.delete_indexed(Collection::Synthesis, keys::LIST, "s1", "s1").await.unwrap();
        let again = JsonFileStore::open(&path).await.unwrap();
        assert!(again.list(Collection::Synthesis, keys::LIST).await.unwrap().is_empty());
    }
}
