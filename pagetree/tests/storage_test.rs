use std::sync::Arc;

use pagetree::buffer::Buffer;
use pagetree::config::TreeBuilder;
use pagetree::container::{BlockFileContainer, Container};
use pagetree::converter::{BincodeConverter, Converter};
use pagetree::errors::ErrorKind;
use pagetree::region::{KeyRange, Lifespan, Rectangle, Version};
use tempfile::tempdir;

mod common;

fn u32_conv() -> Arc<dyn Converter<u32>> {
    Arc::new(BincodeConverter::<u32>::fixed())
}

fn u64_conv() -> Arc<dyn Converter<u64>> {
    Arc::new(BincodeConverter::<u64>::fixed())
}

#[test]
fn test_lru_scenario_over_block_file() {
    common::init_logger();
    let dir = tempdir().unwrap();
    let container: Arc<dyn Container> =
        Arc::new(BlockFileContainer::create(dir.path().join("pages.db"), 512).unwrap());
    let converter = Arc::new(BincodeConverter::<u64>::fixed());
    let a = container.insert(&converter.to_bytes(&1).unwrap()).unwrap();
    let b = container.insert(&converter.to_bytes(&2).unwrap()).unwrap();
    let c = container.insert(&converter.to_bytes(&3).unwrap()).unwrap();

    let mut buffer: Buffer<u64> = Buffer::new(container.clone(), converter.clone(), 2);
    buffer.fix(a).unwrap();
    buffer.unfix(a).unwrap();
    buffer.fix(b).unwrap();
    buffer.unfix(b).unwrap();
    buffer.fix(c).unwrap();

    assert!(!buffer.contains(a));
    assert!(buffer.contains(b));
    assert!(buffer.contains(c));

    // a dirty page reaches the file once it is evicted
    buffer.update(b, 20).unwrap();
    buffer.fix(a).unwrap();
    assert!(!buffer.contains(b));
    assert_eq!(converter.from_bytes(&container.get(b).unwrap()).unwrap(), 20);
}

#[test]
fn test_btree_reopens_from_file() {
    common::init_logger();
    let dir = tempdir().unwrap();
    let path = dir.path().join("btree.db");
    {
        let mut tree = TreeBuilder::new()
            .file_path(&path)
            .block_size(512)
            .buffer_size(4)
            .build_btree(u32_conv(), u64_conv())
            .unwrap();
        for key in 0..1000u32 {
            tree.insert(key, key as u64 * 3).unwrap();
        }
        for key in (0..1000u32).step_by(4) {
            tree.remove(&key).unwrap();
        }
        assert!(tree.stats().buffer.evictions > 0);
        tree.close().unwrap();
        assert_eq!(tree.lookup(&1).unwrap_err().kind(), ErrorKind::InvalidState);
    }

    let tree = TreeBuilder::new()
        .file_path(&path)
        .block_size(512)
        .build_btree(u32_conv(), u64_conv())
        .unwrap();
    assert_eq!(tree.len(), 750);
    assert_eq!(tree.lookup(&1).unwrap(), Some(3));
    assert_eq!(tree.lookup(&4).unwrap(), None);
    let keys: Vec<u32> = tree
        .range(KeyRange::between(100, 110))
        .unwrap()
        .map(|e| e.unwrap().key)
        .collect();
    assert_eq!(keys, vec![101, 102, 103, 105, 106, 107, 109]);
    assert!(tree.check_integrity().unwrap().is_valid);
}

#[test]
fn test_drop_persists_without_close() {
    common::init_logger();
    let dir = tempdir().unwrap();
    let path = dir.path().join("dropped.db");
    {
        let mut tree = TreeBuilder::new()
            .file_path(&path)
            .build_btree(u32_conv(), u64_conv())
            .unwrap();
        for key in 0..100u32 {
            tree.insert(key, 1).unwrap();
        }
    }
    let tree = TreeBuilder::new()
        .file_path(&path)
        .build_btree(u32_conv(), u64_conv())
        .unwrap();
    assert_eq!(tree.len(), 100);
    assert_eq!(tree.iter().unwrap().count(), 100);
}

#[test]
fn test_reopen_with_other_fanout_fails() {
    common::init_logger();
    let dir = tempdir().unwrap();
    let path = dir.path().join("fanout.db");
    {
        let mut tree = TreeBuilder::new()
            .file_path(&path)
            .max_fanout(8)
            .build_btree(u32_conv(), u64_conv())
            .unwrap();
        tree.insert(1, 1).unwrap();
        tree.close().unwrap();
    }
    let err = TreeBuilder::new()
        .file_path(&path)
        .max_fanout(16)
        .build_btree(u32_conv(), u64_conv())
        .err();
    assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::Configuration));
}

#[test]
fn test_rtree_reopens_from_file() {
    common::init_logger();
    let dir = tempdir().unwrap();
    let path = dir.path().join("rtree.db");
    {
        let mut tree = TreeBuilder::new()
            .file_path(&path)
            .block_size(1024)
            .build_rtree(2, u32_conv())
            .unwrap();
        for i in 0..400u32 {
            let (x, y) = ((i % 20) as f64, (i / 20) as f64);
            tree.insert(Rectangle::new_2d(x, y, x + 0.5, y + 0.5), i).unwrap();
        }
        tree.close().unwrap();
    }

    let tree = TreeBuilder::new()
        .file_path(&path)
        .block_size(1024)
        .build_rtree(2, u32_conv())
        .unwrap();
    assert_eq!(tree.len(), 400);
    assert_eq!(
        tree.root_descriptor().unwrap(),
        Some(Rectangle::new_2d(0.0, 0.0, 19.5, 19.5))
    );
    let mut hits: Vec<u32> = tree
        .query(Rectangle::new_2d(2.0, 3.0, 3.0, 3.0))
        .unwrap()
        .map(|e| e.unwrap().value)
        .collect();
    hits.sort_unstable();
    assert_eq!(hits, vec![62, 63]);
}

#[test]
fn test_mvbt_history_survives_reopen() {
    common::init_logger();
    let dir = tempdir().unwrap();
    let path = dir.path().join("mvbt.db");
    let builder = || {
        TreeBuilder::new()
            .file_path(&path)
            .max_fanout(8)
            .build_mvbt(u32_conv(), u64_conv())
    };
    {
        let mut tree = builder().unwrap();
        for key in 0..200u32 {
            tree.insert(key, 1, Version(key as u64 + 1)).unwrap();
        }
        for key in 0..150u32 {
            tree.delete(&key, Version(300 + key as u64)).unwrap();
        }
        tree.update(199, 2, Version(500)).unwrap();
        assert!(tree.root_history().len() > 1);
        tree.close().unwrap();
    }

    let tree = builder().unwrap();
    assert_eq!(tree.len(), 50);
    assert_eq!(tree.current_version(), Version(500));
    assert!(tree.root_history().len() > 1);
    assert_eq!(tree.query(KeyRange::all(), Version(200)).unwrap().count(), 200);
    assert_eq!(tree.query(KeyRange::all(), Version(500)).unwrap().count(), 50);
    assert_eq!(tree.lookup(&10, Version(311)).unwrap(), None);
    assert_eq!(tree.lookup(&10, Version(309)).unwrap(), Some(1));
    assert_eq!(
        tree.history(&199).unwrap(),
        vec![
            (Lifespan::new(Version(200), Some(Version(500))), 1),
            (Lifespan::starting_at(Version(500)), 2),
        ]
    );
    assert!(tree.check_integrity().unwrap().is_valid);
}
