//! Internal record form and the field/metadata updater: pure functions that
//! deep-merge an `updates` tree into an existing `fields` tree, and that
//! derive a parallel per-field timestamp tree.
//!
//! Fields are represented as `bson::Document` / `bson::Bson` rather than a
//! hand-rolled JSON-like tree — arrays are `Bson::Array`, and the merge
//! logic never descends into them; arrays are opaque leaves.
//!
//! Deletion in an `updates` document is spelled with `Bson::Undefined`
//! (BSON's own deprecated-but-still-representable "undefined" type) rather
//! than a bespoke sentinel, using a vocabulary BSON already has.

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// A tree shadowing `fields`, carrying per-leaf-field last-modified
/// timestamps. `timestamp` is the node's own default (used by descendants
/// lacking an explicit stamp); `fields` holds nested metadata nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataNode {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    #[serde(skip_serializing_if = "HashMap::is_empty", default)]
    pub fields: HashMap<String, MetadataNode>,
}

impl MetadataNode {
    #[must_use]
    pub fn leaf(ts: u64) -> Self {
        Self { timestamp: Some(ts), fields: HashMap::new() }
    }

    #[must_use]
    pub fn root(ts: u64) -> Self {
        Self::leaf(ts)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timestamp.is_none() && self.fields.is_empty()
    }
}

/// A record as stored internally: canonical id, freeform BSON fields, and
/// the shadow metadata tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: Uuid,
    pub fields: Document,
    pub metadata: MetadataNode,
}

impl Record {
    #[must_use]
    pub fn new(id: Uuid, fields: Document, metadata: MetadataNode) -> Self {
        Self { id, fields, metadata }
    }
}

/// Deep-merges `updates` into `old`, returning a new document. `old` is
/// never mutated. `Bson::Undefined` in `updates` deletes the corresponding
/// key; both sides being (non-array) documents recurses; anything else
/// replaces wholesale. Arrays are leaves — never descended into.
///
/// `updateFields(x, {})` returns a document equal to `x`. Rust's value
/// semantics mean we cannot preserve *reference* equality the way an
/// object-identity check would, but an empty `updates` document always
/// yields a structurally identical clone.
#[must_use]
pub fn update_fields(old: &Document, updates: &Document) -> Document {
    let mut out = old.clone();
    for (k, v) in updates {
        match v {
            Bson::Undefined => {
                out.remove(k);
            }
            Bson::Document(new_sub) => match out.get(k) {
                Some(Bson::Document(old_sub)) => {
                    out.insert(k.clone(), Bson::Document(update_fields(old_sub, new_sub)));
                }
                _ => {
                    out.insert(k.clone(), v.clone());
                }
            },
            other => {
                out.insert(k.clone(), other.clone());
            }
        }
    }
    out
}

/// Derives a new metadata tree from `updates` judged against `old_fields`
/// and `old_metadata`, stamping changed/deleted leaves with `ts`.
///
/// Monotonic guard: if `old_metadata.timestamp >= ts`, `old_metadata` is
/// returned unchanged — an update carrying an older or equal default
/// timestamp can never regress metadata that is already at least as
/// fresh.
#[must_use]
pub fn update_metadata(
    old_fields: &Document,
    updates: &Document,
    old_metadata: &MetadataNode,
    ts: u64,
) -> MetadataNode {
    if let Some(existing) = old_metadata.timestamp
        && existing >= ts
    {
        return old_metadata.clone();
    }

    let mut out = old_metadata.clone();
    for (k, v) in updates {
        let old_val = old_fields.get(k);
        match v {
            Bson::Undefined => {
                out.fields.insert(k.clone(), MetadataNode::leaf(ts));
            }
            Bson::Document(new_sub) => {
                let empty = Document::new();
                let old_sub = match old_val {
                    Some(Bson::Document(d)) => d,
                    _ => &empty,
                };
                let child_old_meta = out.fields.get(k).cloned().unwrap_or_default();
                let child = update_metadata(old_sub, new_sub, &child_old_meta, ts);
                if child.is_empty() {
                    out.fields.remove(k);
                } else {
                    out.fields.insert(k.clone(), child);
                }
            }
            other => {
                if old_val == Some(other) {
                    // Unchanged leaf: no metadata entry emitted, existing
                    // one (if any) is preserved untouched.
                } else {
                    out.fields.insert(k.clone(), MetadataNode::leaf(ts));
                }
            }
        }
    }
    out
}
