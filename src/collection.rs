//! Shard store: durable, UUID-keyed record storage spread across a fixed
//! number of shards, with LWW-aware updates and sort-index maintenance.
//!
//! Mutating operations take `&self` behind a `tokio::sync::Mutex` so
//! concurrent callers serialize into one task at a time per collection;
//! an async-aware mutex is used instead of a plain `RwLock` because these
//! critical sections contain `.await` points.

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::errors::DbError;
use crate::ids::{normalize_id, UuidGenerator};
use crate::index::{Direction, ValueType};
use crate::manager::IndexManager;
use crate::merge::merge_records;
use crate::record::{update_fields, update_metadata, MetadataNode, Record};
use crate::shard::{shard_for_id, Shard};
use crate::storage::StoragePort;
use bson::Document;
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub struct Collection {
    name: String,
    config: EngineConfig,
    storage: Arc<dyn StoragePort>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn UuidGenerator>,
    indexes: Mutex<IndexManager>,
}

pub struct GetAllPage {
    pub records: Vec<Record>,
    pub next_shard_cursor: Option<u32>,
}

impl Collection {
    #[must_use]
    pub fn new(name: &str, config: EngineConfig, storage: Arc<dyn StoragePort>, clock: Arc<dyn Clock>, ids: Arc<dyn UuidGenerator>) -> Self {
        let indexes = IndexManager::new(name, config);
        Self { name: name.to_string(), config, storage, clock, ids, indexes: Mutex::new(indexes) }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn shard_id_for(&self, id: &Uuid) -> u32 {
        shard_for_id(id, self.config.shard_count)
    }

    async fn load_shard(&self, shard_id: u32) -> Result<Shard, DbError> {
        Shard::load(self.storage.as_ref(), &self.name, shard_id).await
    }

    async fn save_shard(&self, shard: &Shard) -> Result<(), DbError> {
        shard.save(self.storage.as_ref(), &self.name).await
    }

    /// Registers and bulk-builds a sort index on `field`.
    ///
    /// # Errors
    /// Returns an error if the build fails or the index already exists.
    pub async fn ensure_sort_index(&self, field: &str, direction: Direction, value_type: Option<ValueType>) -> Result<(), DbError> {
        let mut indexes = self.indexes.lock().await;
        indexes.ensure_index(self.storage.as_ref(), field, direction, value_type, self.config.shard_count).await
    }

    /// Drops a previously created sort index.
    ///
    /// # Errors
    /// Returns an error if the delete fails at the storage port.
    pub async fn delete_sort_index(&self, field: &str, direction: Direction) -> Result<(), DbError> {
        let mut indexes = self.indexes.lock().await;
        indexes.drop_index(self.storage.as_ref(), field, direction).await
    }

    /// Inserts `fields` as a new record, filling `_id` if absent.
    ///
    /// # Errors
    /// Returns [`DbError::DuplicateInsert`] if the id already exists in its
    /// shard.
    pub async fn insert(&self, id: Option<Uuid>, fields: Document, ts: Option<u64>) -> Result<Uuid, DbError> {
        let id = id.unwrap_or_else(|| self.ids.generate());
        let ts = ts.unwrap_or_else(|| self.clock.now_millis());
        let shard_id = self.shard_id_for(&id);
        let mut shard = self.load_shard(shard_id).await?;
        if shard.records.contains_key(&id) {
            return Err(DbError::DuplicateInsert(crate::ids::canonical(&id)));
        }
        let record = Record::new(id, fields, MetadataNode::root(ts));
        shard.records.insert(id, record.clone());
        self.save_shard(&shard).await?;
        debug!("collection={} op=insert id={} shard={shard_id}", self.name, crate::ids::canonical(&id));

        let mut indexes = self.indexes.lock().await;
        if let Err(e) = indexes.on_insert(self.storage.as_ref(), &record).await {
            warn!("collection={} id={} index maintenance failed after insert: {e}", self.name, crate::ids::canonical(&id));
        }
        Ok(id)
    }

    /// Looks up a record by canonical or unhyphenated id.
    ///
    /// # Errors
    /// Returns [`DbError::InvalidUuid`] if `id` does not normalize.
    pub async fn get(&self, id: &str) -> Result<Option<Record>, DbError> {
        let uuid = normalize_id(id)?;
        let shard = self.load_shard(self.shard_id_for(&uuid)).await?;
        Ok(shard.records.get(&uuid).cloned())
    }

    /// Deep-merges `updates` into the existing record's fields, stamping
    /// changed leaves with `ts`. Returns `false` if the record is absent
    /// and `upsert` is false; otherwise creates it.
    ///
    /// # Errors
    /// Returns [`DbError::InvalidUuid`] if `id` does not normalize.
    pub async fn update(&self, id: &str, updates: &Document, upsert: bool, ts: Option<u64>) -> Result<bool, DbError> {
        let uuid = normalize_id(id)?;
        let ts = ts.unwrap_or_else(|| self.clock.now_millis());
        let shard_id = self.shard_id_for(&uuid);
        let mut shard = self.load_shard(shard_id).await?;

        let old = shard.records.get(&uuid).cloned();
        let Some(old) = old else {
            if !upsert {
                return Ok(false);
            }
            let new_fields = update_fields(&Document::new(), updates);
            let new_meta = update_metadata(&Document::new(), updates, &MetadataNode::root(ts), ts);
            let record = Record::new(uuid, new_fields, new_meta);
            shard.records.insert(uuid, record.clone());
            self.save_shard(&shard).await?;
            let mut indexes = self.indexes.lock().await;
            if let Err(e) = indexes.on_insert(self.storage.as_ref(), &record).await {
                warn!("collection={} id={id} index maintenance failed after upsert: {e}", self.name);
            }
            return Ok(true);
        };

        let new_fields = update_fields(&old.fields, updates);
        let new_meta = update_metadata(&old.fields, updates, &old.metadata, ts);
        let new_record = Record::new(uuid, new_fields, new_meta);
        shard.records.insert(uuid, new_record.clone());
        self.save_shard(&shard).await?;
        debug!("collection={} op=update id={id} shard={shard_id}", self.name);

        let mut indexes = self.indexes.lock().await;
        if let Err(e) = indexes.on_update(self.storage.as_ref(), &new_record, Some(&old)).await {
            warn!("collection={} id={id} index maintenance failed after update: {e}", self.name);
        }
        Ok(true)
    }

    /// Replaces a record wholesale, assigning a single root timestamp.
    ///
    /// # Errors
    /// Returns [`DbError::InvalidUuid`] if `id` does not normalize.
    pub async fn replace(&self, id: &str, fields: Document, upsert: bool, ts: Option<u64>) -> Result<bool, DbError> {
        let uuid = normalize_id(id)?;
        let ts = ts.unwrap_or_else(|| self.clock.now_millis());
        let shard_id = self.shard_id_for(&uuid);
        let mut shard = self.load_shard(shard_id).await?;

        let old = shard.records.get(&uuid).cloned();
        if old.is_none() && !upsert {
            return Ok(false);
        }
        let new_record = Record::new(uuid, fields, MetadataNode::root(ts));
        shard.records.insert(uuid, new_record.clone());
        self.save_shard(&shard).await?;
        debug!("collection={} op=replace id={id} shard={shard_id}", self.name);

        let mut indexes = self.indexes.lock().await;
        let result = if old.is_some() {
            indexes.on_update(self.storage.as_ref(), &new_record, old.as_ref()).await
        } else {
            indexes.on_insert(self.storage.as_ref(), &new_record).await
        };
        if let Err(e) = result {
            warn!("collection={} id={id} index maintenance failed after replace: {e}", self.name);
        }
        Ok(true)
    }

    /// Deletes a record by id.
    ///
    /// # Errors
    /// Returns [`DbError::InvalidUuid`] if `id` does not normalize.
    pub async fn delete(&self, id: &str) -> Result<bool, DbError> {
        let uuid = normalize_id(id)?;
        let shard_id = self.shard_id_for(&uuid);
        let mut shard = self.load_shard(shard_id).await?;
        let Some(old) = shard.records.remove(&uuid) else { return Ok(false) };
        self.save_shard(&shard).await?;
        debug!("collection={} op=delete id={id} shard={shard_id}", self.name);

        let mut indexes = self.indexes.lock().await;
        if let Err(e) = indexes.on_delete(self.storage.as_ref(), uuid, &old).await {
            warn!("collection={} id={id} index maintenance failed after delete: {e}", self.name);
        }
        Ok(true)
    }

    /// Reconciles two divergent copies of the same record under LWW rules
    /// and writes the merged result back.
    ///
    /// # Errors
    /// Returns an error if the ids differ or the write fails.
    pub async fn merge_in(&self, incoming: &Record) -> Result<Record, DbError> {
        let shard_id = self.shard_id_for(&incoming.id);
        let mut shard = self.load_shard(shard_id).await?;
        let merged = match shard.records.get(&incoming.id) {
            Some(existing) => merge_records(existing, incoming)?,
            None => incoming.clone(),
        };
        shard.records.insert(incoming.id, merged.clone());
        self.save_shard(&shard).await?;
        Ok(merged)
    }

    /// Returns the next non-empty shard's records starting at `cursor`
    /// (shard index, default 0), plus the cursor to resume from.
    ///
    /// # Errors
    /// Returns an error if a shard file is corrupt.
    pub async fn get_all(&self, cursor: Option<u32>) -> Result<GetAllPage, DbError> {
        let mut shard_id = cursor.unwrap_or(0);
        while shard_id < self.config.shard_count {
            let shard = self.load_shard(shard_id).await?;
            if !shard.records.is_empty() {
                let next = shard_id + 1;
                return Ok(GetAllPage {
                    records: shard.records.into_values().collect(),
                    next_shard_cursor: if next < self.config.shard_count { Some(next) } else { None },
                });
            }
            shard_id += 1;
        }
        Ok(GetAllPage { records: Vec::new(), next_shard_cursor: None })
    }

    /// Collects every record across all shards, in shard-id order.
    ///
    /// # Errors
    /// Returns an error if any shard file is corrupt.
    pub async fn iterate_records(&self) -> Result<Vec<Record>, DbError> {
        let mut out = Vec::new();
        for shard_id in 0..self.config.shard_count {
            let shard = self.load_shard(shard_id).await?;
            out.extend(shard.records.into_values());
        }
        Ok(out)
    }

    /// Collects every shard's records, in shard-id order, grouped by shard.
    ///
    /// # Errors
    /// Returns an error if any shard file is corrupt.
    pub async fn iterate_shards(&self) -> Result<Vec<Shard>, DbError> {
        let mut out = Vec::with_capacity(self.config.shard_count as usize);
        for shard_id in 0..self.config.shard_count {
            out.push(self.load_shard(shard_id).await?);
        }
        Ok(out)
    }

    /// Deletes every sort index and the collection's storage directory.
    ///
    /// # Errors
    /// Returns an error if the storage delete fails.
    pub async fn drop(&self) -> Result<(), DbError> {
        self.storage.delete_dir(&format!("sort_indexes/{}", self.name)).await?;
        self.storage.delete_dir(&format!("collections/{}", self.name)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::ids::RandomUuidGenerator;
    use crate::storage::FsStorage;
    use bson::Bson;

    fn new_collection(root: &std::path::Path, name: &str) -> Collection {
        let storage: Arc<dyn StoragePort> = Arc::new(FsStorage::new(root));
        Collection::new(name, EngineConfig::default(), storage, Arc::new(SystemClock), Arc::new(RandomUuidGenerator))
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let col = new_collection(dir.path(), "people");
        let mut fields = Document::new();
        fields.insert("name", "Ada");
        let id = col.insert(None, fields, None).await.unwrap();
        let fetched = col.get(&crate::ids::canonical(&id)).await.unwrap().unwrap();
        assert_eq!(fetched.fields.get_str("name").unwrap(), "Ada");
    }

    #[tokio::test]
    async fn insert_duplicate_id_fails() {
        let dir = tempfile::tempdir().unwrap();
        let col = new_collection(dir.path(), "people");
        let id = Uuid::new_v4();
        col.insert(Some(id), Document::new(), None).await.unwrap();
        let err = col.insert(Some(id), Document::new(), None).await.unwrap_err();
        assert!(matches!(err, DbError::DuplicateInsert(_)));
    }

    #[tokio::test]
    async fn update_deep_merges_and_deletes_undefined_fields() {
        let dir = tempfile::tempdir().unwrap();
        let col = new_collection(dir.path(), "people");
        let mut fields = Document::new();
        fields.insert("name", "John");
        fields.insert("age", 30i32);
        let id = col.insert(None, fields, Some(1000)).await.unwrap();

        let mut updates = Document::new();
        updates.insert("name", "Jane");
        updates.insert("age", Bson::Undefined);
        let applied = col.update(&crate::ids::canonical(&id), &updates, false, Some(2000)).await.unwrap();
        assert!(applied);

        let rec = col.get(&crate::ids::canonical(&id)).await.unwrap().unwrap();
        assert_eq!(rec.fields.get_str("name").unwrap(), "Jane");
        assert!(rec.fields.get("age").is_none());
    }

    #[tokio::test]
    async fn update_missing_without_upsert_returns_false() {
        let dir = tempfile::tempdir().unwrap();
        let col = new_collection(dir.path(), "people");
        let id = Uuid::new_v4();
        let applied = col.update(&crate::ids::canonical(&id), &Document::new(), false, None).await.unwrap();
        assert!(!applied);
    }

    #[tokio::test]
    async fn update_missing_with_upsert_creates_record() {
        let dir = tempfile::tempdir().unwrap();
        let col = new_collection(dir.path(), "people");
        let id = Uuid::new_v4();
        let mut updates = Document::new();
        updates.insert("name", "New");
        let applied = col.update(&crate::ids::canonical(&id), &updates, true, None).await.unwrap();
        assert!(applied);
        assert!(col.get(&crate::ids::canonical(&id)).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_then_get_returns_none_and_shard_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let col = new_collection(dir.path(), "people");
        let id = col.insert(None, Document::new(), None).await.unwrap();
        let deleted = col.delete(&crate::ids::canonical(&id)).await.unwrap();
        assert!(deleted);
        assert!(col.get(&crate::ids::canonical(&id)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_all_skips_empty_shards_and_pages_by_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let col = new_collection(dir.path(), "people");
        for _ in 0..5 {
            col.insert(None, Document::new(), None).await.unwrap();
        }
        let page1 = col.get_all(None).await.unwrap();
        assert!(!page1.records.is_empty());
    }

    #[tokio::test]
    async fn iterate_records_covers_every_inserted_record() {
        let dir = tempfile::tempdir().unwrap();
        let col = new_collection(dir.path(), "people");
        let mut ids = Vec::new();
        for _ in 0..8 {
            ids.push(col.insert(None, Document::new(), None).await.unwrap());
        }
        let all = col.iterate_records().await.unwrap();
        assert_eq!(all.len(), 8);
        for id in ids {
            assert!(all.iter().any(|r| r.id == id));
        }
    }

    #[tokio::test]
    async fn drop_removes_collection_directory() {
        let dir = tempfile::tempdir().unwrap();
        let col = new_collection(dir.path(), "people");
        col.insert(None, Document::new(), None).await.unwrap();
        col.drop().await.unwrap();
        assert!(!dir.path().join("collections/people").exists());
    }
}
