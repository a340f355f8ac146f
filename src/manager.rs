//! Index managers: the collection-level registry of sort indexes, in both
//! its immediate-write form (used by ordinary mutations) and its
//! deferred-write form (the batch-index manager, for bulk mutation runs).

use crate::errors::DbError;
use crate::index::{BatchSortIndex, Direction, SortIndex, ValueType};
use crate::record::Record;
use crate::storage::StoragePort;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexKey {
    pub field: String,
    pub direction: Direction,
}

impl std::hash::Hash for Direction {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_str().hash(state);
    }
}

#[derive(Debug, Clone)]
pub struct IndexDescriptor {
    pub field: String,
    pub direction: Direction,
    pub value_type: Option<ValueType>,
}

/// Registry of a collection's sort indexes, written through immediately on
/// every mutation.
pub struct IndexManager {
    collection: String,
    config: crate::config::EngineConfig,
    indexes: HashMap<IndexKey, SortIndex>,
}

impl IndexManager {
    #[must_use]
    pub fn new(collection: &str, config: crate::config::EngineConfig) -> Self {
        Self { collection: collection.to_string(), config, indexes: HashMap::new() }
    }

    #[must_use]
    pub fn has(&self, field: &str, direction: Direction) -> bool {
        self.indexes.contains_key(&IndexKey { field: field.to_string(), direction })
    }

    /// Creates (if absent) and bulk-builds a sort index over `field`.
    ///
    /// # Errors
    /// Returns an error if the build fails, or
    /// [`DbError::IndexAlreadyExists`] if the index is already registered.
    pub async fn ensure_index(
        &mut self,
        storage: &dyn StoragePort,
        field: &str,
        direction: Direction,
        value_type: Option<ValueType>,
        shard_count: u32,
    ) -> Result<(), DbError> {
        let key = IndexKey { field: field.to_string(), direction };
        if self.indexes.contains_key(&key) {
            return Err(DbError::IndexAlreadyExists(field.to_string(), direction.as_str().to_string()));
        }
        let mut index = SortIndex::new(&self.collection, field, direction, value_type, &self.config);
        index.build(storage, shard_count, |_, _| Ok(())).await?;
        self.indexes.insert(key, index);
        Ok(())
    }

    /// Removes and deletes the on-disk directory of `(field, direction)`.
    ///
    /// # Errors
    /// Returns an error if the delete fails at the storage port.
    pub async fn drop_index(&mut self, storage: &dyn StoragePort, field: &str, direction: Direction) -> Result<(), DbError> {
        let key = IndexKey { field: field.to_string(), direction };
        if let Some(index) = self.indexes.remove(&key) {
            index.delete_index(storage).await?;
        }
        Ok(())
    }

    /// Looks up an index by `(field, direction)`.
    ///
    /// # Errors
    /// Returns [`DbError::IndexMissing`] if no such index is registered.
    pub fn get(&mut self, field: &str, direction: Direction) -> Result<&mut SortIndex, DbError> {
        let key = IndexKey { field: field.to_string(), direction };
        self.indexes.get_mut(&key).ok_or_else(|| DbError::IndexMissing { field: field.to_string(), direction: direction.as_str().to_string() })
    }

    /// Dispatches an `insert` to every registered index's `add`.
    ///
    /// # Errors
    /// Returns the first error encountered.
    pub async fn on_insert(&mut self, storage: &dyn StoragePort, record: &Record) -> Result<(), DbError> {
        for index in self.indexes.values_mut() {
            index.add(storage, record).await?;
        }
        Ok(())
    }

    /// Dispatches an `update`/`replace` to every registered index's
    /// `update`.
    ///
    /// # Errors
    /// Returns the first error encountered.
    pub async fn on_update(&mut self, storage: &dyn StoragePort, new_record: &Record, old_record: Option<&Record>) -> Result<(), DbError> {
        for index in self.indexes.values_mut() {
            index.update(storage, new_record, old_record).await?;
        }
        Ok(())
    }

    /// Dispatches a `delete` to every registered index's `delete`.
    ///
    /// # Errors
    /// Returns the first error encountered.
    pub async fn on_delete(&mut self, storage: &dyn StoragePort, id: Uuid, old_record: &Record) -> Result<(), DbError> {
        for index in self.indexes.values_mut() {
            index.delete(storage, id, old_record).await?;
        }
        Ok(())
    }
}

/// Loads every index of a collection into its deferred-write form for a
/// batch of mutations, dispatches `syncRecord`/`removeRecord` to each, then
/// commits them all in one pass.
pub struct BatchIndexManager {
    collection: String,
    config: crate::config::EngineConfig,
    indexes: HashMap<IndexKey, BatchSortIndex>,
}

impl BatchIndexManager {
    #[must_use]
    pub fn new(collection: &str, config: crate::config::EngineConfig) -> Self {
        Self { collection: collection.to_string(), config, indexes: HashMap::new() }
    }

    /// Loads every descriptor as a batch index, ready to receive mutations.
    ///
    /// # Errors
    /// Returns an error if a tree file exists but is corrupt.
    pub async fn start_batch(&mut self, storage: &dyn StoragePort, descriptors: &[IndexDescriptor]) -> Result<(), DbError> {
        self.indexes.clear();
        for d in descriptors {
            let mut index = BatchSortIndex::new(&self.collection, &d.field, d.direction, d.value_type, &self.config);
            index.ensure_initialized(storage).await?;
            self.indexes.insert(IndexKey { field: d.field.clone(), direction: d.direction }, index);
        }
        Ok(())
    }

    /// Dispatches a mutation (insert when `old` is `None`, update
    /// otherwise) to every loaded index.
    ///
    /// # Errors
    /// Returns the first error encountered.
    pub async fn sync_record(&mut self, storage: &dyn StoragePort, new_record: &Record, old_record: Option<&Record>) -> Result<(), DbError> {
        for index in self.indexes.values_mut() {
            index.update(storage, new_record, old_record).await?;
        }
        Ok(())
    }

    /// Dispatches a deletion to every loaded index.
    ///
    /// # Errors
    /// Returns the first error encountered.
    pub async fn remove_record(&mut self, storage: &dyn StoragePort, id: Uuid, old_record: &Record) -> Result<(), DbError> {
        for index in self.indexes.values_mut() {
            index.delete(storage, id, old_record).await?;
        }
        Ok(())
    }

    /// Commits every loaded index, then clears the manager.
    ///
    /// # Errors
    /// Returns the first error encountered; indexes that already committed
    /// successfully remain flushed even if a later one fails.
    pub async fn commit(&mut self, storage: &dyn StoragePort) -> Result<(), DbError> {
        for index in self.indexes.values_mut() {
            index.commit(storage).await?;
        }
        self.indexes.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::storage::FsStorage;
    use bson::{Bson, Document};

    fn rec(id: Uuid, n: i32) -> Record {
        let mut f = Document::new();
        f.insert("age", Bson::Int32(n));
        Record::new(id, f, crate::record::MetadataNode::root(0))
    }

    #[tokio::test]
    async fn ensure_index_then_insert_keeps_index_current() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        let cfg = EngineConfig::default();
        let mut mgr = IndexManager::new("people", cfg);
        mgr.ensure_index(&storage, "age", Direction::Asc, Some(ValueType::Number), 4).await.unwrap();
        let r = rec(Uuid::new_v4(), 7);
        mgr.on_insert(&storage, &r).await.unwrap();
        let idx = mgr.get("age", Direction::Asc).unwrap();
        assert_eq!(idx.total_entries(), 1);
    }

    #[tokio::test]
    async fn batch_manager_defers_then_commits_all() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        let cfg = EngineConfig::default();
        let mut mgr = BatchIndexManager::new("people", cfg);
        mgr.start_batch(&storage, &[IndexDescriptor { field: "age".into(), direction: Direction::Asc, value_type: Some(ValueType::Number) }]).await.unwrap();
        let r = rec(Uuid::new_v4(), 7);
        mgr.sync_record(&storage, &r, None).await.unwrap();
        assert!(!storage.file_exists("sort_indexes/people/age_asc/tree.dat").await.unwrap());
        mgr.commit(&storage).await.unwrap();
        assert!(storage.file_exists("sort_indexes/people/age_asc/tree.dat").await.unwrap());
    }
}
