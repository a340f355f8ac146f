//! On-disk B+ tree sort index, one per `(collection, field, direction)`.
//!
//! Internal nodes hold only separator keys; leaves hold ordered
//! `(recordId, sortValue, fields)` entries, one file per leaf, linked in a
//! bidirectional chain. [`SortIndexCore`] is generic over [`LeafBackend`] so
//! the same traversal/split/build logic backs both the immediate-write
//! index (`SortIndex`) and the deferred-write variant (`BatchSortIndex`) —
//! only how leaf bytes and the tree file reach storage differs between the
//! two.

use crate::codec::{ByteReader, ByteWriter, Framed};
use crate::errors::DbError;
use crate::record::Record;
use crate::shard::shard_for_id;
use crate::storage::StoragePort;
use async_trait::async_trait;
use bson::{Bson, Document};
use serde::Deserialize;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Asc => "asc",
            Direction::Desc => "desc",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Self {
        if s == "desc" { Direction::Desc } else { Direction::Asc }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Date,
    String,
    Number,
}

impl ValueType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::Date => "date",
            ValueType::String => "string",
            ValueType::Number => "number",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "date" => Some(ValueType::Date),
            "string" => Some(ValueType::String),
            "number" => Some(ValueType::Number),
            _ => None,
        }
    }

    #[must_use]
    fn infer(v: &Bson) -> Option<Self> {
        match v {
            Bson::DateTime(_) => Some(ValueType::Date),
            Bson::String(_) => Some(ValueType::String),
            Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => Some(ValueType::Number),
            _ => None,
        }
    }
}

fn number_of(v: &Bson) -> f64 {
    match v {
        Bson::Int32(n) => f64::from(*n),
        Bson::Int64(n) => *n as f64,
        Bson::Double(n) => *n,
        _ => f64::NAN,
    }
}

fn date_millis_of(v: &Bson) -> Option<i64> {
    match v {
        Bson::DateTime(dt) => Some(dt.timestamp_millis()),
        Bson::String(s) => chrono::DateTime::parse_from_rfc3339(s).ok().map(|d| d.timestamp_millis()),
        _ => None,
    }
}

/// Ascending comparison under `value_type`, prior to any `desc` negation.
/// `NaN` sorts strictly less than any other number; ties among `NaN` are
/// equal. Direction negation is applied by the caller, not here.
///
/// # Errors
/// Returns [`DbError::TypeMismatch`] if a value cannot be interpreted under
/// `value_type`.
pub fn compare_values(value_type: ValueType, a: &Bson, b: &Bson) -> Result<Ordering, DbError> {
    match value_type {
        ValueType::Number => {
            let (x, y) = (number_of(a), number_of(b));
            Ok(match (x.is_nan(), y.is_nan()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            })
        }
        ValueType::String => {
            let (x, y) = (a.as_str(), b.as_str());
            match (x, y) {
                (Some(x), Some(y)) => Ok(x.cmp(y)),
                _ => Err(DbError::TypeMismatch {
                    field: "sort value".into(),
                    detail: "expected string value".into(),
                }),
            }
        }
        ValueType::Date => {
            let (x, y) = (date_millis_of(a), date_millis_of(b));
            match (x, y) {
                (Some(x), Some(y)) => Ok(x.cmp(&y)),
                _ => Err(DbError::TypeMismatch {
                    field: "sort value".into(),
                    detail: "expected a parseable date value".into(),
                }),
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct LeafEntry {
    pub id: Uuid,
    pub value: Bson,
    pub fields: Document,
}

#[derive(Debug, Clone)]
struct TreeNode {
    page_id: String,
    is_leaf: bool,
    /// Separator keys for an internal node; for a leaf, the single key is
    /// that leaf's first entry's value (its contribution to the parent).
    keys: Vec<Bson>,
    children: Vec<String>,
    next_leaf: Option<String>,
    prev_leaf: Option<String>,
}

/// Predecessor tree shape, from before the count-prefixed byte encoding: the
/// whole node map serialized as one plain BSON document.
#[derive(Deserialize)]
struct LegacyTreeNode {
    page_id: String,
    is_leaf: bool,
    #[serde(default)]
    keys: Vec<Bson>,
    #[serde(default)]
    children: Vec<String>,
    #[serde(default)]
    next_leaf: Option<String>,
    #[serde(default)]
    prev_leaf: Option<String>,
}

#[derive(Deserialize)]
struct LegacyTreeDocument {
    value_type: Option<String>,
    total_entries: u64,
    root_page_id: String,
    nodes: Vec<LegacyTreeNode>,
}

pub struct Page {
    pub records: Vec<LeafEntry>,
    pub total_records: u64,
    pub current_page_id: String,
    pub total_pages: u64,
    pub next_page_id: Option<String>,
    pub previous_page_id: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Checkpoint {
    pub completed_shards: Vec<u32>,
    pub current_shard: Option<u32>,
    pub current_shard_record_index: u32,
    pub total_records_processed: u32,
    pub last_updated: u64,
}

/// Abstracts where leaf bytes and the tree file actually land: written
/// through immediately (`SortIndex`) or buffered until `commit()`
/// (`BatchSortIndex`).
#[async_trait]
pub trait LeafBackend: Send + Sync {
    async fn load_leaf(&mut self, storage: &dyn StoragePort, path: &str) -> Result<Option<Vec<u8>>, DbError>;
    async fn save_leaf(&mut self, storage: &dyn StoragePort, path: &str, bytes: Vec<u8>) -> Result<(), DbError>;
    async fn delete_leaf(&mut self, storage: &dyn StoragePort, path: &str) -> Result<(), DbError>;
    async fn save_tree(&mut self, storage: &dyn StoragePort, path: &str, bytes: Vec<u8>) -> Result<(), DbError>;
}

/// Writes through to storage immediately; used by the incrementally
/// maintained, non-batched index.
#[derive(Debug, Default)]
pub struct DirectBackend;

#[async_trait]
impl LeafBackend for DirectBackend {
    async fn load_leaf(&mut self, storage: &dyn StoragePort, path: &str) -> Result<Option<Vec<u8>>, DbError> {
        Ok(storage.read(path).await?)
    }

    async fn save_leaf(&mut self, storage: &dyn StoragePort, path: &str, bytes: Vec<u8>) -> Result<(), DbError> {
        storage.write(path, "application/octet-stream", &bytes).await?;
        Ok(())
    }

    async fn delete_leaf(&mut self, storage: &dyn StoragePort, path: &str) -> Result<(), DbError> {
        storage.delete_file(path).await?;
        Ok(())
    }

    async fn save_tree(&mut self, storage: &dyn StoragePort, path: &str, bytes: Vec<u8>) -> Result<(), DbError> {
        storage.write(path, "application/octet-stream", &bytes).await?;
        Ok(())
    }
}

/// Buffers leaf/tree writes in memory; `commit()` flushes everything in one
/// pass. Mirrors a cache plus dirty/deleted sets plus a tree-changed flag.
#[derive(Debug, Default)]
pub struct BatchBackend {
    cache: HashMap<String, Vec<u8>>,
    dirty: HashSet<String>,
    deleted: HashSet<String>,
    tree_bytes: Option<Vec<u8>>,
    tree_path: Option<String>,
}

impl BatchBackend {
    /// Flushes every dirty leaf, the tree file (if changed), then deletes
    /// every deleted leaf file, finally clearing all buffered state.
    ///
    /// # Errors
    /// Returns an error if any underlying storage write/delete fails.
    pub async fn commit(&mut self, storage: &dyn StoragePort) -> Result<(), DbError> {
        for page_id in self.dirty.drain().collect::<Vec<_>>() {
            if let Some(bytes) = self.cache.get(&page_id).cloned() {
                storage.write(&leaf_file_name(&page_id), "application/octet-stream", &bytes).await?;
            }
        }
        if let (Some(bytes), Some(path)) = (self.tree_bytes.take(), self.tree_path.take()) {
            storage.write(&path, "application/octet-stream", &bytes).await?;
        }
        for page_id in self.deleted.drain().collect::<Vec<_>>() {
            storage.delete_file(&leaf_file_name(&page_id)).await?;
            self.cache.remove(&page_id);
        }
        Ok(())
    }
}

fn leaf_file_name(page_id: &str) -> String {
    page_id.to_string()
}

#[async_trait]
impl LeafBackend for BatchBackend {
    async fn load_leaf(&mut self, storage: &dyn StoragePort, path: &str) -> Result<Option<Vec<u8>>, DbError> {
        if let Some(bytes) = self.cache.get(path) {
            return Ok(Some(bytes.clone()));
        }
        let loaded = storage.read(path).await?;
        if let Some(bytes) = &loaded {
            self.cache.insert(path.to_string(), bytes.clone());
        }
        Ok(loaded)
    }

    async fn save_leaf(&mut self, _storage: &dyn StoragePort, path: &str, bytes: Vec<u8>) -> Result<(), DbError> {
        self.cache.insert(path.to_string(), bytes);
        self.dirty.insert(path.to_string());
        self.deleted.remove(path);
        Ok(())
    }

    async fn delete_leaf(&mut self, _storage: &dyn StoragePort, path: &str) -> Result<(), DbError> {
        self.dirty.remove(path);
        self.cache.remove(path);
        self.deleted.insert(path.to_string());
        Ok(())
    }

    async fn save_tree(&mut self, _storage: &dyn StoragePort, path: &str, bytes: Vec<u8>) -> Result<(), DbError> {
        self.tree_path = Some(path.to_string());
        self.tree_bytes = Some(bytes);
        Ok(())
    }
}

/// Shared B+ tree logic, parameterized over how leaf/tree bytes reach
/// storage.
pub struct SortIndexCore<B: LeafBackend> {
    pub collection: String,
    pub field: String,
    pub direction: Direction,
    pub value_type: Option<ValueType>,
    pub page_size: usize,
    pub key_size: usize,
    build_batch_size: usize,
    checkpoint_interval: usize,
    total_entries: u64,
    root_page_id: String,
    nodes: HashMap<String, TreeNode>,
    loaded: bool,
    backend: B,
}

impl<B: LeafBackend + Default> SortIndexCore<B> {
    #[must_use]
    pub fn new(collection: &str, field: &str, direction: Direction, value_type: Option<ValueType>, config: &crate::config::EngineConfig) -> Self {
        Self {
            collection: collection.to_string(),
            field: field.to_string(),
            direction,
            value_type,
            page_size: config.page_size,
            key_size: config.key_size,
            build_batch_size: config.build_batch_size,
            checkpoint_interval: config.checkpoint_interval,
            total_entries: 0,
            root_page_id: String::new(),
            nodes: HashMap::new(),
            loaded: false,
            backend: B::default(),
        }
    }

    fn dir_path(&self) -> String {
        format!("sort_indexes/{}/{}_{}", self.collection, self.field, self.direction.as_str())
    }

    fn tree_path(&self) -> String {
        format!("{}/tree.dat", self.dir_path())
    }

    fn leaf_path(&self, page_id: &str) -> String {
        format!("{}/{page_id}", self.dir_path())
    }

    fn cmp(&self, a: &Bson, b: &Bson) -> Result<Ordering, DbError> {
        let vt = self.value_type.or_else(|| ValueType::infer(a)).ok_or_else(|| DbError::TypeMismatch {
            field: self.field.clone(),
            detail: "value type could not be inferred".into(),
        })?;
        let ord = compare_values(vt, a, b)?;
        Ok(if self.direction == Direction::Desc { ord.reverse() } else { ord })
    }

    /// Reads `tree.dat` and reconstructs the node map. Returns `false` if no
    /// tree file exists yet.
    ///
    /// # Errors
    /// Returns an error if the tree file exists but is corrupt.
    pub async fn load(&mut self, storage: &dyn StoragePort) -> Result<bool, DbError> {
        match crate::codec::load(storage, &self.tree_path()).await? {
            None => Ok(false),
            Some(Framed::Valid { body, .. }) => {
                self.decode_tree(&body)?;
                self.loaded = true;
                Ok(true)
            }
            Some(Framed::ChecksumMismatch { raw }) => {
                let legacy = crate::codec::legacy_fallback(&raw)
                    .and_then(|doc| bson::from_document::<LegacyTreeDocument>(doc).ok());
                match legacy {
                    Some(legacy) => {
                        self.adopt_legacy_tree(legacy);
                        self.loaded = true;
                        Ok(true)
                    }
                    None => Err(DbError::CorruptIndex(self.tree_path())),
                }
            }
        }
    }

    fn adopt_legacy_tree(&mut self, legacy: LegacyTreeDocument) {
        self.value_type = legacy.value_type.as_deref().and_then(ValueType::from_str);
        self.total_entries = legacy.total_entries;
        self.root_page_id = legacy.root_page_id;
        self.nodes = legacy
            .nodes
            .into_iter()
            .map(|n| {
                (
                    n.page_id.clone(),
                    TreeNode {
                        page_id: n.page_id,
                        is_leaf: n.is_leaf,
                        keys: n.keys,
                        children: n.children,
                        next_leaf: n.next_leaf,
                        prev_leaf: n.prev_leaf,
                    },
                )
            })
            .collect();
    }

    fn decode_tree(&mut self, body: &[u8]) -> Result<(), DbError> {
        let mut r = ByteReader::new(body);
        let _field_name = r.read_str()?;
        let _direction = r.read_str()?;
        let value_type = r.read_str()?;
        self.value_type = ValueType::from_str(&value_type);
        self.total_entries = r.read_u64_le()?;
        let _total_pages = r.read_u64_le()?;
        self.root_page_id = r.read_str()?;
        let _reserved_timestamp = r.read_u64_le()?;
        let node_count = r.read_u32_le()?;
        self.nodes.clear();
        for _ in 0..node_count {
            let page_id = r.read_str()?;
            let keys_doc = r.read_bson()?;
            let keys = match keys_doc.get_array("keys") {
                Ok(arr) => arr.clone(),
                Err(_) => Vec::new(),
            };
            let child_count = r.read_u32_le()?;
            let mut children = Vec::with_capacity(child_count as usize);
            for _ in 0..child_count {
                children.push(r.read_str()?);
            }
            let next = r.read_str()?;
            let prev = r.read_str()?;
            let is_leaf = r.read_u8()? != 0;
            self.nodes.insert(
                page_id.clone(),
                TreeNode {
                    page_id,
                    is_leaf,
                    keys,
                    children,
                    next_leaf: if next.is_empty() { None } else { Some(next) },
                    prev_leaf: if prev.is_empty() { None } else { Some(prev) },
                },
            );
        }
        Ok(())
    }

    fn encode_tree(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.push_str(&self.field);
        w.push_str(self.direction.as_str());
        w.push_str(self.value_type.map_or("", ValueType::as_str));
        w.push_u64_le(self.total_entries);
        w.push_u64_le(self.total_pages());
        w.push_str(&self.root_page_id);
        w.push_u64_le(0);
        let mut page_ids: Vec<&String> = self.nodes.keys().collect();
        page_ids.sort();
        w.push_u32_le(crate::num::usize_to_u32_saturating(page_ids.len()));
        for page_id in page_ids {
            let node = &self.nodes[page_id];
            w.push_str(&node.page_id);
            let mut keys_doc = Document::new();
            keys_doc.insert("keys", Bson::Array(node.keys.clone()));
            w.push_bson(&keys_doc).expect("separator keys are plain bson");
            w.push_u32_le(crate::num::usize_to_u32_saturating(node.children.len()));
            for child in &node.children {
                w.push_str(child);
            }
            w.push_str(node.next_leaf.as_deref().unwrap_or(""));
            w.push_str(node.prev_leaf.as_deref().unwrap_or(""));
            w.push_u8(u8::from(node.is_leaf));
        }
        w.into_bytes()
    }

    #[must_use]
    pub fn total_pages(&self) -> u64 {
        self.nodes.values().filter(|n| n.is_leaf).count() as u64
    }

    #[must_use]
    pub fn total_entries(&self) -> u64 {
        self.total_entries
    }

    async fn flush_tree(&mut self, storage: &dyn StoragePort) -> Result<(), DbError> {
        let bytes = self.encode_tree();
        let path = self.tree_path();
        self.backend.save_tree(storage, &path, bytes).await
    }

    fn init_fresh(&mut self) {
        let root_id = Uuid::new_v4().to_string();
        self.nodes.insert(
            root_id.clone(),
            TreeNode { page_id: root_id.clone(), is_leaf: true, keys: Vec::new(), children: Vec::new(), next_leaf: None, prev_leaf: None },
        );
        self.root_page_id = root_id;
        self.total_entries = 0;
        self.loaded = true;
    }

    /// Ensures a root node exists, creating a fresh empty leaf root if this
    /// index has never been loaded or built.
    ///
    /// # Errors
    /// Returns an error if an existing tree file is present but corrupt.
    pub async fn ensure_initialized(&mut self, storage: &dyn StoragePort) -> Result<(), DbError> {
        if self.loaded {
            return Ok(());
        }
        if !self.load(storage).await? {
            self.init_fresh();
        }
        Ok(())
    }

    async fn load_leaf_entries(&mut self, storage: &dyn StoragePort, page_id: &str) -> Result<Vec<LeafEntry>, DbError> {
        let path = self.leaf_path(page_id);
        let Some(bytes) = self.backend.load_leaf(storage, &path).await? else {
            return Ok(Vec::new());
        };
        match crate::codec::validate(&bytes)? {
            Framed::Valid { body, .. } => decode_leaf_body(&body).map_err(|_| DbError::CorruptIndex(path)),
            Framed::ChecksumMismatch { raw } => {
                match crate::codec::legacy_fallback(&raw).and_then(decode_legacy_leaf) {
                    Some(entries) => Ok(entries),
                    None => Err(DbError::CorruptIndex(path)),
                }
            }
        }
    }

    async fn save_leaf_entries(&mut self, storage: &dyn StoragePort, page_id: &str, entries: &[LeafEntry]) -> Result<(), DbError> {
        let bytes = encode_leaf(entries);
        let path = self.leaf_path(page_id);
        self.backend.save_leaf(storage, &path, bytes).await
    }

    async fn delete_leaf_file(&mut self, storage: &dyn StoragePort, page_id: &str) -> Result<(), DbError> {
        let path = self.leaf_path(page_id);
        self.backend.delete_leaf(storage, &path).await
    }

    fn leftmost_leaf(&self) -> &str {
        let mut cur = self.root_page_id.as_str();
        while let Some(node) = self.nodes.get(cur) {
            if node.is_leaf {
                return cur;
            }
            match node.children.first() {
                Some(c) => cur = c.as_str(),
                None => return cur,
            }
        }
        cur
    }

    /// Guards every read-side entry point: unlike `add`/`update`/`delete`,
    /// which lazily call `ensure_initialized`, reads must not silently
    /// conjure an empty index out of one that was never `load`ed or built.
    fn require_loaded(&self) -> Result<(), DbError> {
        if self.loaded {
            Ok(())
        } else {
            Err(DbError::IndexNotLoaded(format!("{}/{}_{}", self.collection, self.field, self.direction.as_str())))
        }
    }

    /// Descends from the root to the leaf that would contain `value`.
    fn descend_to_leaf(&self, value: &Bson) -> Result<String, DbError> {
        let mut cur = self.root_page_id.clone();
        loop {
            let node = self.nodes.get(&cur).ok_or_else(|| DbError::CorruptIndex(cur.clone()))?;
            if node.is_leaf {
                return Ok(cur);
            }
            let mut idx = node.keys.len();
            for (i, k) in node.keys.iter().enumerate() {
                if self.cmp(value, k)?.is_le() {
                    idx = i;
                    break;
                }
            }
            cur = node.children[idx].clone();
        }
    }

    /// Returns one page of entries starting at `page_id` (leftmost leaf if
    /// `None`/unknown).
    ///
    /// # Errors
    /// Returns an error if the page id is known but its leaf file is
    /// corrupt.
    pub async fn get_page(&mut self, storage: &dyn StoragePort, page_id: Option<&str>) -> Result<Page, DbError> {
        self.require_loaded()?;
        let target = match page_id {
            Some(p) if self.nodes.contains_key(p) => p.to_string(),
            _ => self.leftmost_leaf().to_string(),
        };
        let entries = self.load_leaf_entries(storage, &target).await?;
        let node = self.nodes.get(&target).cloned();
        Ok(Page {
            records: entries,
            total_records: self.total_entries,
            current_page_id: target,
            total_pages: self.total_pages(),
            next_page_id: node.as_ref().and_then(|n| n.next_leaf.clone()),
            previous_page_id: node.and_then(|n| n.prev_leaf),
        })
    }

    /// Finds every entry equal to `value`, descending to its expected leaf
    /// and then walking the leaf chain while neighboring entries are still
    /// equal. Falls back to a full chain scan if the expected leaf turns up
    /// no matches (defensive, for pathological shapes after heavy splits).
    ///
    /// # Errors
    /// Returns an error if comparison fails or a leaf file is corrupt.
    pub async fn find_by_value(&mut self, storage: &dyn StoragePort, value: &Bson) -> Result<Vec<LeafEntry>, DbError> {
        self.require_loaded()?;
        if self.root_page_id.is_empty() {
            return Ok(Vec::new());
        }
        let start = self.descend_to_leaf(value)?;
        let mut found = self.scan_leaf_for_equal(storage, &start, value).await?;
        if found.is_empty() {
            found = self.full_chain_scan_for_equal(storage, value).await?;
        }
        Ok(found)
    }

    async fn scan_leaf_for_equal(&mut self, storage: &dyn StoragePort, start: &str, value: &Bson) -> Result<Vec<LeafEntry>, DbError> {
        let mut out = Vec::new();
        let entries = self.load_leaf_entries(storage, start).await?;
        for e in &entries {
            if self.cmp(&e.value, value)?.is_eq() {
                out.push(e.clone());
            }
        }
        // Walk backward while the first observed entry is still equal.
        let mut cur = self.nodes.get(start).and_then(|n| n.prev_leaf.clone());
        while let Some(p) = cur {
            let prev_entries = self.load_leaf_entries(storage, &p).await?;
            let Some(last) = prev_entries.last() else { break };
            if self.cmp(&last.value, value)?.is_eq() {
                let mut matches: Vec<_> = prev_entries.into_iter().filter(|e| self.cmp(&e.value, value).map(|o| o.is_eq()).unwrap_or(false)).collect();
                matches.append(&mut out);
                out = matches;
                cur = self.nodes.get(&p).and_then(|n| n.prev_leaf.clone());
            } else {
                break;
            }
        }
        // Walk forward while the last observed entry is still equal.
        let mut cur = self.nodes.get(start).and_then(|n| n.next_leaf.clone());
        while let Some(nx) = cur {
            let next_entries = self.load_leaf_entries(storage, &nx).await?;
            let Some(first) = next_entries.first() else { break };
            if self.cmp(&first.value, value)?.is_eq() {
                let mut matches: Vec<_> = next_entries.into_iter().filter(|e| self.cmp(&e.value, value).map(|o| o.is_eq()).unwrap_or(false)).collect();
                out.append(&mut matches);
                cur = self.nodes.get(&nx).and_then(|n| n.next_leaf.clone());
            } else {
                break;
            }
        }
        Ok(out)
    }

    async fn full_chain_scan_for_equal(&mut self, storage: &dyn StoragePort, value: &Bson) -> Result<Vec<LeafEntry>, DbError> {
        let mut out = Vec::new();
        let mut cur = Some(self.leftmost_leaf().to_string());
        while let Some(p) = cur {
            let entries = self.load_leaf_entries(storage, &p).await?;
            for e in &entries {
                if self.cmp(&e.value, value)?.is_eq() {
                    out.push(e.clone());
                }
            }
            cur = self.nodes.get(&p).and_then(|n| n.next_leaf.clone());
        }
        Ok(out)
    }

    /// Descends to the leaf containing `min` (leftmost if `min` absent),
    /// then walks forward emitting entries satisfying both bounds, stopping
    /// once entries are provably past `max`.
    ///
    /// # Errors
    /// Returns an error if comparison fails or a leaf file is corrupt.
    pub async fn find_by_range(
        &mut self,
        storage: &dyn StoragePort,
        min: Option<&Bson>,
        max: Option<&Bson>,
        min_inclusive: bool,
        max_inclusive: bool,
    ) -> Result<Vec<LeafEntry>, DbError> {
        self.require_loaded()?;
        if self.root_page_id.is_empty() {
            return Ok(Vec::new());
        }
        let start = match min {
            Some(v) => self.descend_to_leaf(v)?,
            None => self.leftmost_leaf().to_string(),
        };
        let mut out = Vec::new();
        let mut cur = Some(start);
        'outer: while let Some(p) = cur {
            let entries = self.load_leaf_entries(storage, &p).await?;
            for e in &entries {
                if let Some(min_v) = min {
                    let ord = self.cmp(&e.value, min_v)?;
                    if ord.is_lt() || (ord.is_eq() && !min_inclusive) {
                        continue;
                    }
                }
                if let Some(max_v) = max {
                    let ord = self.cmp(&e.value, max_v)?;
                    if ord.is_gt() || (ord.is_eq() && !max_inclusive) {
                        break 'outer;
                    }
                }
                out.push(e.clone());
            }
            cur = self.nodes.get(&p).and_then(|n| n.next_leaf.clone());
        }
        Ok(out)
    }

    /// Inserts `record`'s indexed value. A record missing `field` is
    /// skipped (no-op), per the value-extraction rule.
    ///
    /// # Errors
    /// Returns an error if comparison or storage I/O fails.
    pub async fn add(&mut self, storage: &dyn StoragePort, record: &Record) -> Result<(), DbError> {
        self.ensure_initialized(storage).await?;
        let Some(value) = record.fields.get(&self.field).cloned() else {
            return Ok(());
        };
        if self.value_type.is_none() {
            self.value_type = ValueType::infer(&value);
        }
        let leaf_id = self.descend_to_leaf(&value)?;
        let mut entries = self.load_leaf_entries(storage, &leaf_id).await?;
        let pos = self.insertion_position(&entries, &value)?;
        entries.insert(pos, LeafEntry { id: record.id, value: value.clone(), fields: record.fields.clone() });
        let became_first = pos == 0;
        self.total_entries += 1;
        self.save_leaf_entries(storage, &leaf_id, &entries).await?;
        if became_first {
            self.update_separator_for_leaf(&leaf_id, &value);
        }
        if entries.len() > self.config_leaf_threshold() {
            self.split_leaf(storage, &leaf_id).await?;
        }
        self.flush_tree(storage).await?;
        Ok(())
    }

    fn insertion_position(&self, entries: &[LeafEntry], value: &Bson) -> Result<usize, DbError> {
        let mut lo = 0usize;
        let mut hi = entries.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.cmp(&entries[mid].value, value)?.is_le() {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    fn config_leaf_threshold(&self) -> usize {
        (self.page_size * 3) / 2
    }

    fn config_internal_threshold(&self) -> usize {
        (self.key_size * 6) / 5
    }

    /// Removes the old entry (by id, scanning from the value's expected
    /// leaf, with a defensive full-chain fallback), then adds the new one.
    /// If `field` is absent on the new record, only the removal happens.
    ///
    /// # Errors
    /// Returns an error if comparison or storage I/O fails.
    pub async fn update(&mut self, storage: &dyn StoragePort, new_record: &Record, old_record: Option<&Record>) -> Result<(), DbError> {
        self.ensure_initialized(storage).await?;
        if let Some(old) = old_record
            && old.fields.get(&self.field).is_some()
        {
            self.delete(storage, old.id, old).await?;
        }
        self.add(storage, new_record).await
    }

    /// Finds the leaf by the old value, removes the entry by id; rebalances
    /// the leaf chain and ancestor separators if needed.
    ///
    /// # Errors
    /// Returns an error if comparison or storage I/O fails.
    pub async fn delete(&mut self, storage: &dyn StoragePort, id: Uuid, old_record: &Record) -> Result<(), DbError> {
        self.ensure_initialized(storage).await?;
        let Some(old_value) = old_record.fields.get(&self.field).cloned() else {
            return Ok(());
        };
        let mut leaf_id = self.descend_to_leaf(&old_value)?;
        let mut entries = self.load_leaf_entries(storage, &leaf_id).await?;
        let mut pos = entries.iter().position(|e| e.id == id);
        if pos.is_none() {
            // Defensive fallback: the expected leaf didn't have it, walk
            // the whole chain.
            let mut cur = Some(self.leftmost_leaf().to_string());
            while let Some(p) = cur {
                let e = self.load_leaf_entries(storage, &p).await?;
                if let Some(found) = e.iter().position(|x| x.id == id) {
                    leaf_id = p;
                    entries = e;
                    pos = Some(found);
                    break;
                }
                cur = self.nodes.get(&p).and_then(|n| n.next_leaf.clone());
            }
        }
        let Some(pos) = pos else { return Ok(()) };
        let was_first = pos == 0;
        entries.remove(pos);
        self.total_entries = self.total_entries.saturating_sub(1);

        if entries.is_empty() && self.total_pages() > 1 {
            self.unlink_empty_leaf(storage, &leaf_id).await?;
        } else {
            self.save_leaf_entries(storage, &leaf_id, &entries).await?;
            if was_first
                && let Some(first) = entries.first()
            {
                self.update_separator_for_leaf(&leaf_id, &first.value.clone());
            }
        }
        self.flush_tree(storage).await?;
        Ok(())
    }

    async fn unlink_empty_leaf(&mut self, storage: &dyn StoragePort, leaf_id: &str) -> Result<(), DbError> {
        let (prev, next) = {
            let node = self.nodes.get(leaf_id).ok_or_else(|| DbError::CorruptIndex(leaf_id.to_string()))?;
            (node.prev_leaf.clone(), node.next_leaf.clone())
        };
        if let Some(p) = &prev
            && let Some(n) = self.nodes.get_mut(p)
        {
            n.next_leaf = next.clone();
        }
        if let Some(n) = &next
            && let Some(p) = self.nodes.get_mut(n)
        {
            p.prev_leaf = prev.clone();
        }
        self.remove_child_from_parents(leaf_id);
        self.nodes.remove(leaf_id);
        self.delete_leaf_file(storage, leaf_id).await?;
        Ok(())
    }

    fn remove_child_from_parents(&mut self, child_id: &str) {
        for node in self.nodes.values_mut() {
            if node.is_leaf {
                continue;
            }
            if let Some(idx) = node.children.iter().position(|c| c == child_id) {
                node.children.remove(idx);
                if idx < node.keys.len() {
                    node.keys.remove(idx);
                } else if !node.keys.is_empty() {
                    node.keys.pop();
                }
            }
        }
    }

    /// Updates the separator key that points at `leaf_id` wherever it
    /// appears as a parent's first child (and recursively up the chain of
    /// first-children ancestors), since those separators are derived from
    /// the leaf's first entry.
    fn update_separator_for_leaf(&mut self, leaf_id: &str, new_first_value: &Bson) {
        let mut child = leaf_id.to_string();
        loop {
            let Some(parent_id) = self.find_parent(&child) else { break };
            let Some(parent) = self.nodes.get_mut(&parent_id) else { break };
            let Some(idx) = parent.children.iter().position(|c| c == &child) else { break };
            if idx > 0 && idx - 1 < parent.keys.len() {
                parent.keys[idx - 1] = new_first_value.clone();
            }
            if idx != 0 {
                break;
            }
            child = parent_id;
        }
    }

    fn find_parent(&self, child_id: &str) -> Option<String> {
        self.nodes.values().find(|n| !n.is_leaf && n.children.iter().any(|c| c == child_id)).map(|n| n.page_id.clone())
    }

    /// Splits a leaf at `n/2`, moving the back half to a fresh leaf; wires
    /// up the forward/backward pointers and either promotes a new root (if
    /// `leaf_id` was the root) or inserts the new child into the parent,
    /// recursing into an internal split if that now overflows.
    ///
    /// # Errors
    /// Returns an error if storage I/O for the split leaves fails.
    async fn split_leaf(&mut self, storage: &dyn StoragePort, leaf_id: &str) -> Result<(), DbError> {
        let mut entries = self.load_leaf_entries(storage, leaf_id).await?;
        let mid = entries.len() / 2;
        let second_half: Vec<LeafEntry> = entries.split_off(mid);
        let Some(new_first) = second_half.first().map(|e| e.value.clone()) else {
            return Ok(());
        };

        let new_leaf_id = Uuid::new_v4().to_string();
        let old_next = self.nodes.get(leaf_id).and_then(|n| n.next_leaf.clone());
        self.nodes.insert(
            new_leaf_id.clone(),
            TreeNode { page_id: new_leaf_id.clone(), is_leaf: true, keys: vec![new_first.clone()], children: Vec::new(), next_leaf: old_next.clone(), prev_leaf: Some(leaf_id.to_string()) },
        );
        if let Some(node) = self.nodes.get_mut(leaf_id) {
            node.next_leaf = Some(new_leaf_id.clone());
        }
        if let Some(n) = old_next
            && let Some(node) = self.nodes.get_mut(&n)
        {
            node.prev_leaf = Some(new_leaf_id.clone());
        }

        self.save_leaf_entries(storage, leaf_id, &entries).await?;
        self.save_leaf_entries(storage, &new_leaf_id, &second_half).await?;

        if leaf_id == self.root_page_id {
            let new_root_id = Uuid::new_v4().to_string();
            self.nodes.insert(
                new_root_id.clone(),
                TreeNode { page_id: new_root_id.clone(), is_leaf: false, keys: vec![new_first], children: vec![leaf_id.to_string(), new_leaf_id], next_leaf: None, prev_leaf: None },
            );
            self.root_page_id = new_root_id;
        } else if let Some(parent_id) = self.find_parent(leaf_id) {
            self.insert_into_parent(&parent_id, leaf_id, &new_leaf_id, new_first);
            if self.nodes[&parent_id].keys.len() > self.config_internal_threshold() {
                self.split_internal(&parent_id);
            }
        }
        Ok(())
    }

    fn insert_into_parent(&mut self, parent_id: &str, after_child: &str, new_child: &str, separator: Bson) {
        let Some(parent) = self.nodes.get_mut(parent_id) else { return };
        let Some(idx) = parent.children.iter().position(|c| c == after_child) else { return };
        parent.children.insert(idx + 1, new_child.to_string());
        parent.keys.insert(idx, separator);
    }

    /// Splits at the middle separator key, promoting it to the parent (or
    /// materializing a new root if `node_id` was the root).
    fn split_internal(&mut self, node_id: &str) {
        let Some(node) = self.nodes.get(node_id).cloned() else { return };
        let mid = node.keys.len() / 2;
        let promoted = node.keys[mid].clone();
        let left_keys = node.keys[..mid].to_vec();
        let right_keys = node.keys[mid + 1..].to_vec();
        let left_children = node.children[..=mid].to_vec();
        let right_children = node.children[mid + 1..].to_vec();

        let new_id = Uuid::new_v4().to_string();
        self.nodes.insert(new_id.clone(), TreeNode { page_id: new_id.clone(), is_leaf: false, keys: right_keys, children: right_children, next_leaf: None, prev_leaf: None });
        if let Some(left) = self.nodes.get_mut(node_id) {
            left.keys = left_keys;
            left.children = left_children;
        }

        if node_id == self.root_page_id {
            let new_root_id = Uuid::new_v4().to_string();
            self.nodes.insert(
                new_root_id.clone(),
                TreeNode { page_id: new_root_id.clone(), is_leaf: false, keys: vec![promoted], children: vec![node_id.to_string(), new_id], next_leaf: None, prev_leaf: None },
            );
            self.root_page_id = new_root_id;
        } else if let Some(parent_id) = self.find_parent(node_id) {
            self.insert_into_parent(&parent_id, node_id, &new_id, promoted);
            if self.nodes[&parent_id].keys.len() > self.config_internal_threshold() {
                self.split_internal(&parent_id);
            }
        }
    }

    fn checkpoint_path(&self) -> String {
        format!("{}/build.checkpoint", self.dir_path())
    }

    async fn load_checkpoint(&self, storage: &dyn StoragePort) -> Result<Option<Checkpoint>, DbError> {
        let Some(bytes) = storage.read(&self.checkpoint_path()).await? else { return Ok(None) };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn save_checkpoint(&self, storage: &dyn StoragePort, cp: &Checkpoint) -> Result<(), DbError> {
        let bytes = serde_json::to_vec(cp)?;
        storage.write(&self.checkpoint_path(), "application/json", &bytes).await?;
        Ok(())
    }

    async fn delete_checkpoint(&self, storage: &dyn StoragePort) -> Result<(), DbError> {
        storage.delete_file(&self.checkpoint_path()).await?;
        Ok(())
    }

    /// Bulk-builds the index from every shard of `collection`, resuming
    /// from any valid checkpoint. `progress`, if it returns `Err`, aborts
    /// the build after the current batch; the last-persisted checkpoint
    /// remains valid for a future resumed call.
    ///
    /// # Errors
    /// Returns an error if storage I/O fails or `progress` aborts the
    /// build.
    pub async fn build<F>(&mut self, storage: &dyn StoragePort, shard_count: u32, mut progress: F) -> Result<(), DbError>
    where
        F: FnMut(u32, u32) -> Result<(), DbError> + Send,
    {
        let tree_exists = self.load(storage).await?;
        let mut checkpoint = self.load_checkpoint(storage).await?;
        if checkpoint.is_some() && !tree_exists {
            self.delete_checkpoint(storage).await?;
            checkpoint = None;
        }
        if !tree_exists {
            self.init_fresh();
        }
        let mut cp = checkpoint.unwrap_or_default();
        let batch_size = self.build_batch_size.max(1);
        let checkpoint_interval = crate::num::usize_to_u32_saturating(self.checkpoint_interval.max(1));
        let mut since_flush = 0usize;
        let mut since_checkpoint = 0u32;

        for shard_id in 0..shard_count {
            if cp.completed_shards.contains(&shard_id) {
                continue;
            }
            let shard = crate::shard::Shard::load(storage, &self.collection, shard_id).await?;
            let records: Vec<&Record> = shard.records.values().collect();
            let start_index = if cp.current_shard == Some(shard_id) { cp.current_shard_record_index as usize } else { 0 };
            for (idx, record) in records.iter().enumerate().skip(start_index) {
                self.add(storage, record).await?;
                since_flush += 1;
                cp.total_records_processed += 1;
                cp.current_shard = Some(shard_id);
                cp.current_shard_record_index = crate::num::usize_to_u32_saturating(idx + 1);
                since_checkpoint += 1;

                if since_flush >= batch_size {
                    self.flush_tree(storage).await?;
                    since_flush = 0;
                }
                if since_checkpoint >= checkpoint_interval {
                    self.save_checkpoint(storage, &cp).await?;
                    since_checkpoint = 0;
                }
                progress(shard_id, crate::num::usize_to_u32_saturating(idx + 1))?;
            }
            cp.completed_shards.push(shard_id);
            cp.current_shard = None;
            cp.current_shard_record_index = 0;
            self.save_checkpoint(storage, &cp).await?;
        }

        self.flush_tree(storage).await?;
        self.delete_checkpoint(storage).await?;
        Ok(())
    }

    /// Deletes the whole index directory.
    ///
    /// # Errors
    /// Returns an error if the storage delete fails.
    pub async fn delete_index(&self, storage: &dyn StoragePort) -> Result<(), DbError> {
        storage.delete_dir(&self.dir_path()).await?;
        Ok(())
    }
}

impl SortIndexCore<BatchBackend> {
    /// Flushes buffered leaf/tree writes and deletions for this index.
    ///
    /// # Errors
    /// Returns an error if the underlying storage writes/deletes fail.
    pub async fn commit(&mut self, storage: &dyn StoragePort) -> Result<(), DbError> {
        self.backend.commit(storage).await
    }
}

pub type SortIndex = SortIndexCore<DirectBackend>;
pub type BatchSortIndex = SortIndexCore<BatchBackend>;

fn encode_leaf(entries: &[LeafEntry]) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.push_u32_le(crate::num::usize_to_u32_saturating(entries.len()));
    for e in entries {
        w.push_str(&crate::ids::canonical(&e.id));
        let mut value_doc = Document::new();
        value_doc.insert("value", e.value.clone());
        w.push_bson(&value_doc).expect("sort value already bson");
        w.push_bson(&e.fields).expect("fields already bson");
    }
    crate::codec::frame(1, &w.into_bytes())
}

fn decode_leaf_body(body: &[u8]) -> Result<Vec<LeafEntry>, DbError> {
    let mut r = ByteReader::new(body);
    let count = r.read_u32_le()?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let id_str = r.read_str()?;
        let id = crate::ids::normalize_id(&id_str)?;
        let value_doc = r.read_bson()?;
        let value = value_doc.get("value").cloned().unwrap_or(Bson::Null);
        let fields = r.read_bson()?;
        out.push(LeafEntry { id, value, fields });
    }
    Ok(out)
}

/// Predecessor leaf shape: one plain BSON document holding the page's
/// entries as an array, rather than the count-prefixed byte encoding.
#[derive(Deserialize)]
struct LegacyLeafEntry {
    id: String,
    value: Bson,
    fields: Document,
}

#[derive(Deserialize)]
struct LegacyLeafDocument {
    entries: Vec<LegacyLeafEntry>,
}

fn decode_legacy_leaf(doc: Document) -> Option<Vec<LeafEntry>> {
    let legacy: LegacyLeafDocument = bson::from_document(doc).ok()?;
    let mut out = Vec::with_capacity(legacy.entries.len());
    for e in legacy.entries {
        let id = crate::ids::normalize_id(&e.id).ok()?;
        out.push(LeafEntry { id, value: e.value, fields: e.fields });
    }
    Some(out)
}
