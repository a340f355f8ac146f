//! Coverage for shard assignment/framing and the B+ tree sort index,
//! driven directly against a `FsStorage` rather than through `Collection`.

use bdb_core::config::EngineConfig;
use bdb_core::index::{Direction, SortIndex, ValueType};
use bdb_core::record::{MetadataNode, Record};
use bdb_core::shard::{shard_for_id, Shard};
use bdb_core::storage::FsStorage;
use bson::{Bson, Document};
use uuid::Uuid;

#[tokio::test]
async fn shard_round_trips_through_storage_with_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FsStorage::new(dir.path());
    let id = Uuid::new_v4();
    let mut fields = Document::new();
    fields.insert("score", Bson::Int32(7));
    let mut meta = MetadataNode::root(1234);
    meta.fields.insert("score".into(), MetadataNode::leaf(1234));
    let record = Record::new(id, fields, meta);

    let shard_id = shard_for_id(&id, 16);
    let mut shard = Shard::new(shard_id);
    shard.records.insert(id, record.clone());
    shard.save(&storage, "people").await.unwrap();

    let loaded = Shard::load(&storage, "people", shard_id).await.unwrap();
    let round_tripped = loaded.records.get(&id).unwrap();
    assert_eq!(round_tripped.fields, record.fields);
    assert_eq!(round_tripped.metadata, record.metadata);
}

#[tokio::test]
async fn deleting_the_last_record_in_a_shard_removes_its_file() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FsStorage::new(dir.path());
    let id = Uuid::new_v4();
    let shard_id = shard_for_id(&id, 16);
    let mut shard = Shard::new(shard_id);
    shard.records.insert(id, Record::new(id, Document::new(), MetadataNode::root(0)));
    shard.save(&storage, "people").await.unwrap();

    shard.records.remove(&id);
    shard.save(&storage, "people").await.unwrap();

    let reloaded = Shard::load(&storage, "people", shard_id).await.unwrap();
    assert!(reloaded.records.is_empty());
}

#[tokio::test]
async fn sort_index_splits_leaves_past_the_configured_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FsStorage::new(dir.path());
    let mut config = EngineConfig::default();
    config.page_size = 4;
    let mut index = SortIndex::new("people", "age", Direction::Asc, Some(ValueType::Number), &config);

    for age in 0..20i32 {
        let id = Uuid::new_v4();
        let mut fields = Document::new();
        fields.insert("age", Bson::Int32(age));
        let record = Record::new(id, fields, MetadataNode::root(0));
        index.add(&storage, &record).await.unwrap();
    }

    assert_eq!(index.total_entries(), 20);
    assert!(index.total_pages() > 1, "expected more than one leaf page after exceeding the split threshold");

    let matches = index.find_by_value(&storage, &Bson::Int32(5)).await.unwrap();
    assert_eq!(matches.len(), 1);
}

#[tokio::test]
async fn reads_against_a_never_loaded_index_return_index_not_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FsStorage::new(dir.path());
    let config = EngineConfig::default();
    let mut index = SortIndex::new("people", "age", Direction::Asc, Some(ValueType::Number), &config);

    let page_err = index.get_page(&storage, None).await.unwrap_err();
    assert!(matches!(page_err, bdb_core::DbError::IndexNotLoaded(_)));

    let value_err = index.find_by_value(&storage, &Bson::Int32(5)).await.unwrap_err();
    assert!(matches!(value_err, bdb_core::DbError::IndexNotLoaded(_)));

    let range_err = index.find_by_range(&storage, None, None, true, true).await.unwrap_err();
    assert!(matches!(range_err, bdb_core::DbError::IndexNotLoaded(_)));
}

#[tokio::test]
async fn batch_index_build_is_resumable_after_simulated_interruption() {
    let dir = tempfile::tempdir().unwrap();
    let storage = FsStorage::new(dir.path());
    let config = EngineConfig::default();

    for shard_id in 0..4u32 {
        let mut shard = Shard::new(shard_id);
        for _ in 0..3 {
            let id = Uuid::new_v4();
            if shard_for_id(&id, 4) != shard_id {
                continue;
            }
            let mut fields = Document::new();
            fields.insert("age", Bson::Int32(1));
            shard.records.insert(id, Record::new(id, fields, MetadataNode::root(0)));
        }
        shard.save(&storage, "people").await.unwrap();
    }

    let mut first_pass = SortIndex::new("people", "age", Direction::Asc, Some(ValueType::Number), &config);
    let mut seen = 0u32;
    let result = first_pass
        .build(&storage, 4, |_, count| {
            seen = count;
            if seen >= 1 {
                Err(bdb_core::DbError::IoError("simulated interruption".into()))
            } else {
                Ok(())
            }
        })
        .await;
    assert!(result.is_err());

    let mut resumed = SortIndex::new("people", "age", Direction::Asc, Some(ValueType::Number), &config);
    resumed.build(&storage, 4, |_, _| Ok(())).await.unwrap();
    assert!(resumed.total_entries() > 0);
}
