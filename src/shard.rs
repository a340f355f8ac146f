//! Shard: the on-disk unit of record storage, one file per
//! `(collection, shardId)`. Records within a shard are kept ordered by id
//! (a `BTreeMap<Uuid, _>` orders by the same byte sequence the canonical
//! hex form encodes, so iteration order matches the on-disk sort) and the
//! whole shard is rewritten atomically on every mutation.

use crate::codec::{ByteReader, ByteWriter, Framed};
use crate::errors::DbError;
use crate::record::{MetadataNode, Record};
use crate::storage::StoragePort;
use bson::Document;
use md5::{Digest, Md5};
use serde::Deserialize;
use std::collections::BTreeMap;
use uuid::Uuid;

pub const SHARD_VERSION_V1: u32 = 1;
pub const SHARD_VERSION_V2: u32 = 2;

/// Computes `be_u32(MD5(raw16(id))[0..4]) mod shard_count`.
#[must_use]
pub fn shard_for_id(id: &Uuid, shard_count: u32) -> u32 {
    let digest = Md5::digest(id.as_bytes());
    let head = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    head % shard_count
}

fn shard_path(collection: &str, shard_id: u32) -> String {
    format!("collections/{collection}/shards/{shard_id:05}.shard")
}

#[derive(Debug, Clone, Default)]
pub struct Shard {
    pub id: u32,
    pub records: BTreeMap<Uuid, Record>,
}

impl Shard {
    #[must_use]
    pub fn new(id: u32) -> Self {
        Self { id, records: BTreeMap::new() }
    }

    /// Loads a shard, or an empty one if its file does not exist.
    ///
    /// # Errors
    /// Returns an error if the file is corrupt or the storage read fails.
    pub async fn load(
        storage: &dyn StoragePort,
        collection: &str,
        shard_id: u32,
    ) -> Result<Self, DbError> {
        let path = shard_path(collection, shard_id);
        match crate::codec::load(storage, &path).await? {
            None => Ok(Self::new(shard_id)),
            Some(Framed::Valid { version, body }) => {
                let records = decode_body(version, &body)?;
                Ok(Self { id: shard_id, records })
            }
            Some(Framed::ChecksumMismatch { raw }) => {
                match crate::codec::legacy_fallback(&raw).and_then(|doc| decode_legacy(&doc)) {
                    Some(records) => Ok(Self { id: shard_id, records }),
                    None => Err(DbError::CorruptShard(path)),
                }
            }
        }
    }

    /// Rewrites the shard file, sorted by id for deterministic output. If
    /// the shard is now empty, deletes the file instead.
    ///
    /// # Errors
    /// Returns an error if the storage write/delete fails.
    pub async fn save(&self, storage: &dyn StoragePort, collection: &str) -> Result<(), DbError> {
        let path = shard_path(collection, self.id);
        if self.records.is_empty() {
            storage.delete_file(&path).await?;
            return Ok(());
        }
        let body = encode_body(&self.records);
        crate::codec::save(storage, &path, "application/octet-stream", SHARD_VERSION_V2, &body)
            .await
    }
}

fn encode_body(records: &BTreeMap<Uuid, Record>) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.push_u32_le(crate::num::usize_to_u32_saturating(records.len()));
    for record in records.values() {
        w.push_raw(record.id.as_bytes());
        // push_bson can only fail on encode errors from malformed documents,
        // which cannot occur for values already held as bson::Document.
        w.push_bson(&record.fields).expect("fields already validated bson");
        w.push_bson(&document_from_metadata(&record.metadata)).expect("metadata is plain bson");
    }
    w.into_bytes()
}

fn decode_body(version: u32, body: &[u8]) -> Result<BTreeMap<Uuid, Record>, DbError> {
    let mut r = ByteReader::new(body);
    let count = r.read_u32_le()?;
    let mut out = BTreeMap::new();
    for _ in 0..count {
        let raw = r.read_raw(16)?;
        let mut arr = [0u8; 16];
        arr.copy_from_slice(&raw);
        let id = Uuid::from_bytes(arr);
        let fields = r.read_bson()?;
        let metadata = if version >= SHARD_VERSION_V2 {
            metadata_from_document(&r.read_bson()?)
        } else {
            MetadataNode::default()
        };
        out.insert(id, Record::new(id, fields, metadata));
    }
    Ok(out)
}

/// Predecessor shard shape, from before the count-prefixed raw-id byte
/// encoding: a single BSON document holding the whole shard as a plain
/// array, one entry per record, with no per-record metadata.
#[derive(Deserialize)]
struct LegacyShardRecord {
    id: String,
    fields: Document,
    #[serde(default)]
    metadata: Document,
}

#[derive(Deserialize)]
struct LegacyShardDocument {
    records: Vec<LegacyShardRecord>,
}

fn decode_legacy(doc: &Document) -> Option<BTreeMap<Uuid, Record>> {
    let legacy: LegacyShardDocument = bson::from_document(doc.clone()).ok()?;
    let mut out = BTreeMap::new();
    for r in legacy.records {
        let id = crate::ids::normalize_id(&r.id).ok()?;
        out.insert(id, Record::new(id, r.fields, metadata_from_document(&r.metadata)));
    }
    Some(out)
}

/// `MetadataNode` round-trips through BSON via `serde`, reusing the same
/// document codec path as record fields rather than a bespoke format.
fn document_from_metadata(meta: &MetadataNode) -> Document {
    bson::to_document(meta).unwrap_or_default()
}

fn metadata_from_document(doc: &Document) -> MetadataNode {
    bson::from_document(doc.clone()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FsStorage;

    fn sample_record(id: Uuid) -> Record {
        let mut fields = Document::new();
        fields.insert("name", "ok");
        Record::new(id, fields, MetadataNode::root(1000))
    }

    #[test]
    fn shard_assignment_is_within_range_and_deterministic() {
        let id = Uuid::new_v4();
        let a = shard_for_id(&id, 100);
        let b = shard_for_id(&id, 100);
        assert_eq!(a, b);
        assert!(a < 100);
    }

    #[tokio::test]
    async fn empty_shard_round_trips_to_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        let shard = Shard::new(3);
        shard.save(&storage, "people").await.unwrap();
        assert!(!storage.file_exists(&shard_path("people", 3)).await.unwrap());
        let loaded = Shard::load(&storage, "people", 3).await.unwrap();
        assert!(loaded.records.is_empty());
    }

    #[tokio::test]
    async fn shard_with_records_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        let id1 = Uuid::new_v4();
        let id2 = Uuid::new_v4();
        let mut shard = Shard::new(7);
        shard.records.insert(id1, sample_record(id1));
        shard.records.insert(id2, sample_record(id2));
        shard.save(&storage, "people").await.unwrap();

        let loaded = Shard::load(&storage, "people", 7).await.unwrap();
        assert_eq!(loaded.records.len(), 2);
        assert_eq!(loaded.records.get(&id1).unwrap().fields.get_str("name").unwrap(), "ok");
        assert_eq!(loaded.records.get(&id2).unwrap().metadata.timestamp, Some(1000));
    }

    #[tokio::test]
    async fn v1_file_without_metadata_decodes_to_empty_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        let id = Uuid::new_v4();
        let mut records = BTreeMap::new();
        records.insert(id, sample_record(id));

        let mut w = ByteWriter::new();
        w.push_u32_le(1);
        w.push_raw(id.as_bytes());
        w.push_bson(&records.get(&id).unwrap().fields).unwrap();
        let body = w.into_bytes();
        crate::codec::save(&storage, &shard_path("people", 2), "application/octet-stream", SHARD_VERSION_V1, &body)
            .await
            .unwrap();

        let loaded = Shard::load(&storage, "people", 2).await.unwrap();
        let rec = loaded.records.get(&id).unwrap();
        assert!(rec.metadata.is_empty());
    }

    #[tokio::test]
    async fn checksum_mismatch_falls_back_to_legacy_document_shape() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        let id = Uuid::new_v4();

        let mut fields = Document::new();
        fields.insert("name", "legacy");
        let mut record_doc = Document::new();
        record_doc.insert("id", crate::ids::canonical(&id));
        record_doc.insert("fields", fields);

        let mut legacy_doc = Document::new();
        legacy_doc.insert("records", bson::Bson::Array(vec![bson::Bson::Document(record_doc)]));

        let mut bytes = bson::to_vec(&legacy_doc).unwrap();
        bytes.extend_from_slice(&[0u8; 32]);
        storage.write(&shard_path("people", 9), "application/octet-stream", &bytes).await.unwrap();

        let loaded = Shard::load(&storage, "people", 9).await.unwrap();
        let rec = loaded.records.get(&id).unwrap();
        assert_eq!(rec.fields.get_str("name").unwrap(), "legacy");
    }

    #[tokio::test]
    async fn checksum_mismatch_with_unparseable_body_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        let mut bytes = vec![1u8, 0, 0, 0];
        bytes.extend_from_slice(b"not bson at all, just garbage bytes padded out long enough");
        bytes.extend_from_slice(&[0u8; 32]);
        storage.write(&shard_path("people", 11), "application/octet-stream", &bytes).await.unwrap();

        let err = Shard::load(&storage, "people", 11).await.unwrap_err();
        assert!(matches!(err, DbError::CorruptShard(_)));
    }
}
