//! Error kinds surfaced by the core.
//!
//! Nothing is swallowed silently: every fallible core operation returns a
//! `DbError` (or a `Result<_, DbError>`) and propagates it to the caller.
//! Two internal recovery paths exist, both documented at their call sites
//! rather than hidden behind a generic error kind: resuming an interrupted
//! index build from its on-disk checkpoint (`index.rs`), and the
//! legacy-format fallback decode attempted on a checksum mismatch before a
//! file is declared corrupt (`codec::legacy_fallback`, used from
//! `shard.rs` and `index.rs`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    /// Record id is not 16 raw bytes once normalized (hyphens stripped).
    #[error("invalid uuid: {0}")]
    InvalidUuid(String),

    /// `insert` with an `_id` that already exists in its target shard.
    #[error("duplicate insert: record {0} already exists")]
    DuplicateInsert(String),

    /// A sort-index operation ran before `load`/`build` completed.
    #[error("index not loaded: {0}")]
    IndexNotLoaded(String),

    /// `findByIndex`-style lookup named a `(field, direction)` with no
    /// matching index.
    #[error("no index on field {field:?} direction {direction:?}")]
    IndexMissing { field: String, direction: String },

    /// The comparator encountered incompatible value types and the index's
    /// `type` was not pinned explicitly.
    #[error("type mismatch in comparator for field {field}: {detail}")]
    TypeMismatch { field: String, detail: String },

    /// `mergeRecords` was called with two records of different `_id`.
    #[error("cannot merge records with different ids: {0} != {1}")]
    MergeIdMismatch(String, String),

    /// Propagated unchanged from the storage port.
    #[error("io error: {0}")]
    IoError(String),

    /// Shard-file checksum mismatch not salvageable by the legacy decoder.
    #[error("corrupt shard file at {0}")]
    CorruptShard(String),

    /// Index tree/leaf-file checksum mismatch not salvageable by the legacy
    /// decoder.
    #[error("corrupt index file at {0}")]
    CorruptIndex(String),

    #[error("collection not found: {0}")]
    NoSuchCollection(String),

    #[error("sort index already exists on field {0} direction {1}")]
    IndexAlreadyExists(String, String),

    #[error("bson error: {0}")]
    Bson(#[from] bson::ser::Error),

    #[error("bson de error: {0}")]
    BsonDe(#[from] bson::de::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<std::io::Error> for DbError {
    fn from(e: std::io::Error) -> Self {
        Self::IoError(e.to_string())
    }
}

pub type DbResult<T> = Result<T, DbError>;
