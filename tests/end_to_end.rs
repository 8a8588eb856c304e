//! End-to-end scenarios over the public surface: a small store with order 4,
//! a bulk-loaded store, reopening, and on-disk corruption.

use birchdb::codec::{I32Codec, StringCodec};
use birchdb::{
    BulkLoadOptions, RangeQuery, Store, StoreConfig, StoreError, StoreHandle,
};
use tempfile::TempDir;

fn small_config() -> StoreConfig<i32, String> {
    StoreConfig::new(Box::new(I32Codec), Box::new(StringCodec))
        .with_order(4)
        .with_cache_capacity(100)
        .with_page_size(512)
}

fn demo_config() -> StoreConfig<i32, String> {
    StoreConfig::new(Box::new(I32Codec), Box::new(StringCodec))
        .with_order(32)
        .with_cache_capacity(100)
}

fn store_path(dir: &TempDir, name: &str) -> String {
    dir.path().join(name).display().to_string()
}

fn seeded_small_store(dir: &TempDir) -> Store<i32, String> {
    let mut store = Store::create(&store_path(dir, "t1.bt"), small_config()).unwrap();
    for (k, v) in [(1, "a"), (2, "b"), (3, "c"), (4, "d"), (5, "e")] {
        store.insert(k, v.to_string()).unwrap();
    }
    store
}

#[test]
fn five_inserts_with_order_four_build_a_two_level_tree() {
    let dir = TempDir::new().unwrap();
    let mut store = seeded_small_store(&dir);

    assert_eq!(store.stats().unwrap().height, 2);
    let entries = store.entries().unwrap();
    assert_eq!(
        entries,
        vec![
            (1, "a".to_string()),
            (2, "b".to_string()),
            (3, "c".to_string()),
            (4, "d".to_string()),
            (5, "e".to_string()),
        ]
    );
}

#[test]
fn point_lookups_and_inclusive_range() {
    let dir = TempDir::new().unwrap();
    let mut store = seeded_small_store(&dir);

    assert_eq!(store.search(&3).unwrap(), Some("c".to_string()));
    assert_eq!(store.search(&6).unwrap(), None);

    let slice = store
        .range(RangeQuery {
            start: Some(2),
            end: Some(4),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(
        slice,
        vec![
            (2, "b".to_string()),
            (3, "c".to_string()),
            (4, "d".to_string()),
        ]
    );
}

#[test]
fn delete_is_idempotent_and_keeps_the_tree_valid() {
    let dir = TempDir::new().unwrap();
    let mut store = seeded_small_store(&dir);

    assert!(store.delete(&3).unwrap());
    assert!(!store.delete(&3).unwrap());

    let keys: Vec<i32> = store.entries().unwrap().into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![1, 2, 4, 5]);
    assert!(store.verify().unwrap());
}

#[test]
fn bulk_load_then_range_over_the_demo_config() {
    let dir = TempDir::new().unwrap();
    let mut store = Store::create(&store_path(&dir, "bulk.bt"), demo_config()).unwrap();

    let entries: Vec<(i32, String)> = (0..100).map(|i| (i * 10, format!("v{}", i))).collect();
    store
        .bulk_load(
            entries,
            BulkLoadOptions {
                sorted: true,
                batch_size: 25,
            },
            None,
        )
        .unwrap();

    assert_eq!(store.stats().unwrap().key_count, 100);

    let slice = store
        .range(RangeQuery {
            start: Some(50),
            end: Some(150),
            include_end: false,
            ..Default::default()
        })
        .unwrap();
    let keys: Vec<i32> = slice.into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![50, 60, 70, 80, 90, 100, 110, 120, 130, 140]);
}

#[test]
fn close_and_reopen_preserves_everything() {
    let dir = TempDir::new().unwrap();
    let path = store_path(&dir, "bulk.bt");

    let before = {
        let mut store = Store::create(&path, demo_config()).unwrap();
        let entries: Vec<(i32, String)> = (0..100).map(|i| (i * 10, format!("v{}", i))).collect();
        store
            .bulk_load(entries, BulkLoadOptions { sorted: true, batch_size: 1000 }, None)
            .unwrap();
        let before = store.entries().unwrap();
        store.close().unwrap();
        before
    };

    let mut store = Store::open(&path, demo_config()).unwrap();
    assert_eq!(store.entries().unwrap(), before);
    assert_eq!(store.search(&950).unwrap(), Some("v95".to_string()));
    assert_eq!(store.stats().unwrap().key_count, 100);
}

#[test]
fn corrupting_a_node_payload_is_detected() {
    let dir = TempDir::new().unwrap();
    let path = store_path(&dir, "corrupt.bt");

    {
        let mut store = Store::create(&path, small_config()).unwrap();
        for i in 0..40 {
            store.insert(i, format!("v{}", i)).unwrap();
        }
        store.close().unwrap();
    }

    // Flip one payload byte in the second node page (64-byte node header
    // skipped), then reopen.
    {
        use std::fs::OpenOptions;
        use std::io::{Read, Seek, SeekFrom, Write};

        let mut file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let offset = 512 + 512 + 64;
        let mut byte = [0u8; 1];
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.read_exact(&mut byte).unwrap();
        byte[0] ^= 0x40;
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.write_all(&byte).unwrap();
    }

    let mut store = Store::open(&path, small_config()).unwrap();
    assert!(!store.verify().unwrap());

    // Some lookup must eventually visit the damaged page.
    let mut saw_corruption = false;
    for i in 0..40 {
        match store.search(&i) {
            Err(StoreError::Corruption(_)) => {
                saw_corruption = true;
                break;
            }
            Err(StoreError::Closed) => break,
            _ => {}
        }
    }
    assert!(saw_corruption);
}

#[test]
fn the_same_scenarios_run_through_the_gateway() {
    let dir = TempDir::new().unwrap();
    let path = store_path(&dir, "gw.bt");

    let handle = StoreHandle::spawn(&path, small_config(), false).unwrap();
    for (k, v) in [(1, "a"), (2, "b"), (3, "c"), (4, "d"), (5, "e")] {
        handle.insert(k, v.to_string()).unwrap();
    }

    assert_eq!(handle.stats().unwrap().height, 2);
    assert_eq!(handle.search(3).unwrap(), Some("c".to_string()));
    assert!(handle.delete(3).unwrap());
    assert!(!handle.delete(3).unwrap());
    assert!(handle.verify().unwrap());
    handle.close().unwrap();
}
