//! Property-based checks: the store agrees with an in-memory ordered map
//! under arbitrary operation sequences, the structural audit holds after
//! every mutation batch, and range scans match their model.

use std::collections::BTreeMap;

use birchdb::codec::{I32Codec, StringCodec};
use birchdb::{RangeQuery, Store, StoreConfig};
use proptest::prelude::*;
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum Op {
    Insert(i32, String),
    Delete(i32),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..60i32, "[a-z]{0,12}").prop_map(|(k, v)| Op::Insert(k, v)),
        (0..60i32).prop_map(Op::Delete),
    ]
}

fn small_store(dir: &TempDir) -> Store<i32, String> {
    let config = StoreConfig::new(Box::new(I32Codec), Box::new(StringCodec))
        .with_order(4)
        .with_cache_capacity(16)
        .with_page_size(512);
    Store::create(&dir.path().join("prop.bt").display().to_string(), config).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn store_agrees_with_ordered_map(ops in prop::collection::vec(op_strategy(), 1..80)) {
        let dir = TempDir::new().unwrap();
        let mut store = small_store(&dir);
        let mut model: BTreeMap<i32, String> = BTreeMap::new();

        for op in &ops {
            match op {
                Op::Insert(k, v) => {
                    store.insert(*k, v.clone()).unwrap();
                    model.insert(*k, v.clone());
                }
                Op::Delete(k) => {
                    let removed = store.delete(k).unwrap();
                    prop_assert_eq!(removed, model.remove(k).is_some());
                }
            }
        }

        // Lookups agree for present and absent keys.
        for k in 0..60 {
            prop_assert_eq!(store.search(&k).unwrap(), model.get(&k).cloned());
        }

        // Enumeration equals the model in strictly increasing key order.
        let entries = store.entries().unwrap();
        let expected: Vec<(i32, String)> =
            model.iter().map(|(k, v)| (*k, v.clone())).collect();
        prop_assert_eq!(&entries, &expected);

        // The structural audit holds after any sequence.
        prop_assert!(store.verify().unwrap());

        // Counters agree.
        prop_assert_eq!(store.stats().unwrap().key_count, model.len() as u64);
    }

    #[test]
    fn range_matches_model_slices(
        ops in prop::collection::vec(op_strategy(), 1..60),
        mut a in 0..60i32,
        mut b in 0..60i32,
        include_start in any::<bool>(),
        include_end in any::<bool>(),
        reverse in any::<bool>(),
    ) {
        if a > b {
            std::mem::swap(&mut a, &mut b);
        }

        let dir = TempDir::new().unwrap();
        let mut store = small_store(&dir);
        let mut model: BTreeMap<i32, String> = BTreeMap::new();
        for op in &ops {
            match op {
                Op::Insert(k, v) => {
                    store.insert(*k, v.clone()).unwrap();
                    model.insert(*k, v.clone());
                }
                Op::Delete(k) => {
                    store.delete(k).unwrap();
                    model.remove(k);
                }
            }
        }

        let got = store.range(RangeQuery {
            start: Some(a),
            end: Some(b),
            include_start,
            include_end,
            limit: None,
            reverse,
        }).unwrap();

        let mut expected: Vec<(i32, String)> = model
            .iter()
            .filter(|(k, _)| {
                let after_start = if include_start { **k >= a } else { **k > a };
                let before_end = if include_end { **k <= b } else { **k < b };
                after_start && before_end
            })
            .map(|(k, v)| (*k, v.clone()))
            .collect();
        if reverse {
            expected.reverse();
        }

        prop_assert_eq!(got, expected);
    }

    #[test]
    fn upsert_replaces_without_growing(keys in prop::collection::vec(0..40i32, 1..40)) {
        let dir = TempDir::new().unwrap();
        let mut store = small_store(&dir);

        for (i, k) in keys.iter().enumerate() {
            store.insert(*k, format!("first{}", i)).unwrap();
        }
        let count_before = store.stats().unwrap().key_count;

        // Re-inserting every key changes values, never the count.
        for (i, k) in keys.iter().enumerate() {
            store.insert(*k, format!("second{}", i)).unwrap();
        }
        prop_assert_eq!(store.stats().unwrap().key_count, count_before);

        for (i, k) in keys.iter().enumerate().rev() {
            // The last write for each key wins.
            if keys[i + 1..].contains(k) {
                continue;
            }
            prop_assert_eq!(store.search(k).unwrap(), Some(format!("second{}", i)));
        }
    }

    #[test]
    fn bulk_load_equals_incremental_build(
        mut entries in prop::collection::vec((0..200i32, "[a-z]{0,8}"), 0..120)
    ) {
        let dir = TempDir::new().unwrap();

        let mk_config = || {
            StoreConfig::new(Box::new(I32Codec), Box::new(StringCodec))
                .with_order(8)
                .with_page_size(1024)
                .with_cache_capacity(32)
        };

        let mut bulk = Store::create(
            &dir.path().join("bulk.bt").display().to_string(),
            mk_config(),
        ).unwrap();
        bulk.bulk_load(entries.clone(), Default::default(), None).unwrap();

        let mut incremental = Store::create(
            &dir.path().join("incr.bt").display().to_string(),
            mk_config(),
        ).unwrap();
        for (k, v) in entries.drain(..) {
            incremental.insert(k, v).unwrap();
        }

        prop_assert_eq!(bulk.entries().unwrap(), incremental.entries().unwrap());
        prop_assert!(bulk.verify().unwrap());
        prop_assert!(incremental.verify().unwrap());
    }
}
