//! Property tests for the LWW merge machinery: commutativity, idempotence,
//! and monotonic timestamp behavior hold for arbitrary scalar field sets.

use bdb_core::merge::merge_records;
use bdb_core::record::{MetadataNode, Record};
use bson::{Bson, Document};
use proptest::prelude::*;
use uuid::Uuid;

prop_compose! {
    fn arb_record(id: Uuid)(
        ts in 0u64..10_000,
        pairs in prop::collection::vec(("[a-e]", any::<i32>()), 0..5),
    ) -> Record {
        let mut fields = Document::new();
        let mut meta = MetadataNode::root(ts);
        for (k, v) in pairs {
            fields.insert(k.clone(), Bson::Int32(v));
            meta.fields.insert(k, MetadataNode::leaf(ts));
        }
        Record::new(id, fields, meta)
    }
}

proptest! {
    #[test]
    fn merge_records_is_commutative(a in arb_record(Uuid::nil()), b in arb_record(Uuid::nil())) {
        let forward = merge_records(&a, &b).unwrap();
        let backward = merge_records(&b, &a).unwrap();
        prop_assert_eq!(forward.fields, backward.fields);
    }

    #[test]
    fn self_merge_is_idempotent(r in arb_record(Uuid::nil())) {
        let merged = merge_records(&r, &r).unwrap();
        prop_assert_eq!(merged.fields, r.fields);
    }

    #[test]
    fn merging_with_mismatched_ids_always_errors(ts in 0u64..10_000) {
        let a = Record::new(Uuid::nil(), Document::new(), MetadataNode::root(ts));
        let b = Record::new(Uuid::new_v4(), Document::new(), MetadataNode::root(ts));
        prop_assert!(merge_records(&a, &b).is_err());
    }
}

#[test]
fn merge_prefers_the_field_with_the_later_timestamp_even_when_record_is_older() {
    let id = Uuid::new_v4();
    let mut f1 = Document::new();
    f1.insert("name", "Alice");
    let mut m1 = MetadataNode::root(100);
    m1.fields.insert("name".into(), MetadataNode::leaf(500));
    let r1 = Record::new(id, f1, m1);

    let mut f2 = Document::new();
    f2.insert("name", "Bob");
    let mut m2 = MetadataNode::root(200);
    m2.fields.insert("name".into(), MetadataNode::leaf(300));
    let r2 = Record::new(id, f2, m2);

    let merged = merge_records(&r1, &r2).unwrap();
    assert_eq!(merged.fields.get_str("name").unwrap(), "Alice");
}
