//! Tree benchmarks

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use pagetree::config::TreeBuilder;
use pagetree::converter::BincodeConverter;
use pagetree::region::{KeyRange, Rectangle, Version};
use pagetree::{BPlusTree, Mvbt, RTree};
use std::hint::black_box;
use std::sync::Arc;
use tempfile::tempdir;

fn btree() -> BPlusTree<u64, u64> {
    TreeBuilder::new()
        .build_btree(
            Arc::new(BincodeConverter::<u64>::fixed()),
            Arc::new(BincodeConverter::<u64>::fixed()),
        )
        .unwrap()
}

fn rtree() -> RTree<u64> {
    TreeBuilder::new()
        .build_rtree(2, Arc::new(BincodeConverter::<u64>::fixed()))
        .unwrap()
}

/// Spreads sequential ids over the key space
fn scramble(i: u64) -> u64 {
    i.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

fn bench_btree_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("BPlusTree Insert");

    for size in [100u64, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter_with_setup(btree, |mut tree| {
                for i in 0..size {
                    tree.insert(scramble(i), i).unwrap();
                }
                black_box(tree.len())
            });
        });
    }

    group.finish();
}

fn bench_btree_file_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("BPlusTree File Insert");

    group.bench_function("insert_10k", |b| {
        b.iter_with_setup(
            || {
                let dir = tempdir().unwrap();
                let tree = TreeBuilder::new()
                    .file_path(dir.path().join("bench.db"))
                    .build_btree::<u64, u64>(
                        Arc::new(BincodeConverter::<u64>::fixed()),
                        Arc::new(BincodeConverter::<u64>::fixed()),
                    )
                    .unwrap();
                (tree, dir)
            },
            |(mut tree, _dir)| {
                for i in 0..10_000 {
                    tree.insert(scramble(i), i).unwrap();
                }
                tree.flush().unwrap();
                black_box(tree.len())
            },
        );
    });

    group.finish();
}

fn bench_btree_range(c: &mut Criterion) {
    let mut group = c.benchmark_group("BPlusTree Range");

    let mut tree = btree();
    for i in 0..10_000u64 {
        tree.insert(i, i).unwrap();
    }

    group.bench_function("range_1k_of_10k", |b| {
        b.iter(|| black_box(tree.range(KeyRange::between(4000, 5000)).unwrap().count()));
    });

    group.finish();
}

fn bench_rtree_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("RTree Search");

    let mut tree = rtree();
    tree.bulk_load((0..10_000u64).map(|i| {
        let x = (i % 100) as f64;
        let y = (i / 100) as f64;
        (Rectangle::new_2d(x, y, x + 1.0, y + 1.0), i)
    }))
    .unwrap();

    group.bench_function("window_10k", |b| {
        b.iter(|| {
            let window = Rectangle::new_2d(25.0, 25.0, 75.0, 75.0);
            black_box(tree.query(window).unwrap().count())
        });
    });

    group.bench_function("nearest_10_of_10k", |b| {
        b.iter(|| black_box(tree.nearest(&[50.5, 50.5], 10, None).unwrap()));
    });

    group.finish();
}

fn bench_rtree_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("RTree Join");

    let mut left = rtree();
    let mut right = rtree();
    for i in 0..2_000u64 {
        let x = (i % 50) as f64;
        let y = (i / 50) as f64;
        left.insert(Rectangle::new_2d(x, y, x + 0.8, y + 0.8), i).unwrap();
        right.insert(Rectangle::new_2d(x + 0.5, y + 0.5, x + 1.2, y + 1.2), i).unwrap();
    }

    group.bench_function("join_2k_x_2k", |b| {
        b.iter(|| black_box(left.join(&right).unwrap().count()));
    });

    group.finish();
}

fn bench_mvbt_versions(c: &mut Criterion) {
    let mut group = c.benchmark_group("MVBT");

    group.bench_function("insert_delete_5k_versions", |b| {
        b.iter_with_setup(
            || {
                TreeBuilder::new()
                    .build_mvbt::<u64, u64>(
                        Arc::new(BincodeConverter::<u64>::fixed()),
                        Arc::new(BincodeConverter::<u64>::fixed()),
                    )
                    .unwrap()
            },
            |mut tree: Mvbt<u64, u64>| {
                for i in 0..5_000u64 {
                    tree.insert(i, i, Version(i + 1)).unwrap();
                    if i >= 100 {
                        tree.delete(&(i - 100), Version(i + 1)).unwrap();
                    }
                }
                black_box(tree.len())
            },
        );
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_btree_insert,
    bench_btree_file_insert,
    bench_btree_range,
    bench_rtree_search,
    bench_rtree_join,
    bench_mvbt_versions
);
criterion_main!(benches);
