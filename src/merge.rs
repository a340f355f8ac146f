//! Per-field last-write-wins merge engine: reconciles two internal records
//! that have diverged, using the metadata timestamp trees produced by
//! [`crate::record`] to decide a winner field by field.

use crate::errors::DbError;
use crate::ids::canonical;
use crate::record::{MetadataNode, Record};
use bson::{Bson, Document};
use std::collections::HashSet;

fn child_meta(parent: &MetadataNode, key: &str) -> MetadataNode {
    parent.fields.get(key).cloned().unwrap_or_else(|| MetadataNode::leaf(parent.timestamp.unwrap_or(0)))
}

/// Merges two candidate values for the same field, each carrying its own
/// (already timestamp-defaulted) metadata node.
///
/// If both sides are non-array documents, delegates to [`merge_fields`]
/// unconditionally (object merges always recurse, irrespective of which
/// side's timestamp is newer). Otherwise this is a leaf decision: a missing
/// side loses outright; between two present values, the strictly greater
/// timestamp wins, with ties broken toward `v2`.
#[must_use]
pub fn merge_values(
    v1: Option<&Bson>,
    m1: &MetadataNode,
    v2: Option<&Bson>,
    m2: &MetadataNode,
) -> (Option<Bson>, MetadataNode) {
    if let (Some(Bson::Document(d1)), Some(Bson::Document(d2))) = (v1, v2) {
        let (doc, meta) = merge_fields(d1, m1, d2, m2);
        return (Some(Bson::Document(doc)), meta);
    }

    match (v1, v2) {
        (None, None) => (None, m2.clone()),
        (Some(_), None) => (v1.cloned(), m1.clone()),
        (None, Some(_)) => (v2.cloned(), m2.clone()),
        (Some(_), Some(_)) => {
            let t1 = m1.timestamp.unwrap_or(0);
            let t2 = m2.timestamp.unwrap_or(0);
            if t1 > t2 {
                (v1.cloned(), m1.clone())
            } else {
                (v2.cloned(), m2.clone())
            }
        }
    }
}

/// Merges two field documents plus their metadata trees into one. The union
/// of keys is taken across both field documents AND both metadata trees, so
/// a deletion tombstone (a metadata entry with no matching field) on either
/// side survives the merge. The resulting root timestamp is the
/// conservative `min(t1, t2)`; per-field timestamps remain exact.
#[must_use]
pub fn merge_fields(
    doc1: &Document,
    meta1: &MetadataNode,
    doc2: &Document,
    meta2: &MetadataNode,
) -> (Document, MetadataNode) {
    let mut keys: HashSet<&str> = HashSet::new();
    keys.extend(doc1.keys().map(String::as_str));
    keys.extend(doc2.keys().map(String::as_str));
    keys.extend(meta1.fields.keys().map(String::as_str));
    keys.extend(meta2.fields.keys().map(String::as_str));

    let mut out_doc = Document::new();
    let mut out_meta = MetadataNode {
        timestamp: Some(meta1.timestamp.unwrap_or(0).min(meta2.timestamp.unwrap_or(0))),
        fields: std::collections::HashMap::new(),
    };

    for key in keys {
        let v1 = doc1.get(key);
        let v2 = doc2.get(key);
        let sub_m1 = child_meta(meta1, key);
        let sub_m2 = child_meta(meta2, key);
        let (value, meta) = merge_values(v1, &sub_m1, v2, &sub_m2);
        if let Some(v) = value {
            out_doc.insert(key, v);
        }
        out_meta.fields.insert(key.to_string(), meta);
    }

    (out_doc, out_meta)
}

/// Merges two records sharing the same `_id`, then prunes metadata older
/// than cutoff `0` so the result does not accumulate tombstones forever.
///
/// # Errors
/// Returns [`DbError::MergeIdMismatch`] if `r1.id != r2.id`.
pub fn merge_records(r1: &Record, r2: &Record) -> Result<Record, DbError> {
    if r1.id != r2.id {
        return Err(DbError::MergeIdMismatch(canonical(&r1.id), canonical(&r2.id)));
    }
    let (fields, metadata) = merge_fields(&r1.fields, &r1.metadata, &r2.fields, &r2.metadata);
    let metadata = cleanup_metadata(&metadata, 0).unwrap_or_default();
    Ok(Record::new(r1.id, fields, metadata))
}

/// Recursively prunes metadata sub-trees whose own timestamp is `<= cutoff`
/// and whose nested fields all pruned away too. Returns `None` if the whole
/// node becomes empty, so a caller can drop it from its parent.
#[must_use]
pub fn cleanup_metadata(meta: &MetadataNode, cutoff: u64) -> Option<MetadataNode> {
    let mut pruned_fields = std::collections::HashMap::new();
    for (k, v) in &meta.fields {
        if let Some(kept) = cleanup_metadata(v, cutoff) {
            pruned_fields.insert(k.clone(), kept);
        }
    }

    let own_stale = meta.timestamp.unwrap_or(0) <= cutoff;
    if own_stale && pruned_fields.is_empty() {
        None
    } else {
        Some(MetadataNode { timestamp: meta.timestamp, fields: pruned_fields })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::update_fields;
    use uuid::Uuid;

    fn doc(pairs: &[(&str, Bson)]) -> Document {
        let mut d = Document::new();
        for (k, v) in pairs {
            d.insert(*k, v.clone());
        }
        d
    }

    #[test]
    fn merge_records_rejects_mismatched_ids() {
        let r1 = Record::new(Uuid::nil(), Document::new(), MetadataNode::root(0));
        let r2 = Record::new(Uuid::new_v4(), Document::new(), MetadataNode::root(0));
        assert!(matches!(merge_records(&r1, &r2), Err(DbError::MergeIdMismatch(_, _))));
    }

    #[test]
    fn merge_records_prefers_newer_timestamp_per_field() {
        // name wins from whichever side is newer.
        let id = Uuid::new_v4();
        let mut m1 = MetadataNode::root(1000);
        m1.fields.insert("name".into(), MetadataNode::leaf(1000));
        let r1 = Record::new(id, doc(&[("name", Bson::String("John".into()))]), m1);

        let mut m2 = MetadataNode::root(1000);
        m2.fields.insert("name".into(), MetadataNode::leaf(2000));
        let r2 = Record::new(id, doc(&[("name", Bson::String("Jane".into()))]), m2);

        let merged = merge_records(&r1, &r2).unwrap();
        assert_eq!(merged.fields.get_str("name").unwrap(), "Jane");
    }

    #[test]
    fn merge_records_is_commutative() {
        let id = Uuid::new_v4();
        let mut m1 = MetadataNode::root(1000);
        m1.fields.insert("a".into(), MetadataNode::leaf(500));
        m1.fields.insert("b".into(), MetadataNode::leaf(1500));
        let r1 = Record::new(id, doc(&[("a", Bson::Int32(1)), ("b", Bson::Int32(2))]), m1);

        let mut m2 = MetadataNode::root(1000);
        m2.fields.insert("a".into(), MetadataNode::leaf(1200));
        m2.fields.insert("b".into(), MetadataNode::leaf(900));
        let r2 = Record::new(id, doc(&[("a", Bson::Int32(10)), ("b", Bson::Int32(20))]), m2);

        let merged_12 = merge_records(&r1, &r2).unwrap();
        let merged_21 = merge_records(&r2, &r1).unwrap();
        assert_eq!(merged_12.fields, merged_21.fields);
    }

    #[test]
    fn merge_records_is_idempotent_on_self_merge() {
        let id = Uuid::new_v4();
        let mut m = MetadataNode::root(1000);
        m.fields.insert("x".into(), MetadataNode::leaf(1000));
        let r = Record::new(id, doc(&[("x", Bson::Int32(42))]), m);
        let merged = merge_records(&r, &r).unwrap();
        assert_eq!(merged.fields, r.fields);
    }

    #[test]
    fn merge_records_preserves_deletion_tombstone() {
        let id = Uuid::new_v4();
        // r1 still has "age"; r2 deleted it more recently via update_fields.
        let mut m1 = MetadataNode::root(1000);
        m1.fields.insert("age".into(), MetadataNode::leaf(1000));
        let r1 = Record::new(id, doc(&[("age", Bson::Int32(30))]), m1);

        let updates = doc(&[("age", Bson::Undefined)]);
        let new_fields = update_fields(&r1.fields, &updates);
        let mut m2 = MetadataNode::root(1000);
        m2.fields.insert("age".into(), MetadataNode::leaf(2000));
        let r2 = Record::new(id, new_fields, m2);

        let merged = merge_records(&r1, &r2).unwrap();
        assert!(merged.fields.get("age").is_none());
    }

    #[test]
    fn cleanup_metadata_drops_stale_leaf_with_no_children() {
        let meta = MetadataNode::leaf(0);
        assert!(cleanup_metadata(&meta, 0).is_none());
    }

    #[test]
    fn cleanup_metadata_keeps_node_with_live_child() {
        let mut meta = MetadataNode::leaf(0);
        meta.fields.insert("x".into(), MetadataNode::leaf(100));
        let kept = cleanup_metadata(&meta, 0).unwrap();
        assert!(kept.fields.contains_key("x"));
    }
}
