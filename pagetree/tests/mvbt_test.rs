use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use pagetree::config::TreeBuilder;
use pagetree::converter::BincodeConverter;
use pagetree::region::{KeyRange, Lifespan, Version};
use pagetree::Mvbt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

mod common;

fn build(fanout: usize) -> Mvbt<u32, u64> {
    common::init_logger();
    TreeBuilder::new()
        .max_fanout(fanout)
        .build_mvbt(
            Arc::new(BincodeConverter::<u32>::fixed()),
            Arc::new(BincodeConverter::<u64>::fixed()),
        )
        .unwrap()
}

fn build_with(fanout: usize, min_ratio: f64) -> Mvbt<u32, u64> {
    common::init_logger();
    TreeBuilder::new()
        .max_fanout(fanout)
        .min_ratio(min_ratio)
        .build_mvbt(
            Arc::new(BincodeConverter::<u32>::fixed()),
            Arc::new(BincodeConverter::<u64>::fixed()),
        )
        .unwrap()
}

fn snapshot(tree: &Mvbt<u32, u64>, range: KeyRange<u32>, at: Version) -> Vec<(u32, u64)> {
    tree.query(range, at)
        .unwrap()
        .map(|e| e.map(|e| (e.key, e.value)).unwrap())
        .collect()
}

fn assert_valid(tree: &Mvbt<u32, u64>, context: &str) {
    let report = tree.check_integrity().unwrap();
    assert!(report.is_valid, "{}: {:?}", context, report.errors);
}

#[test]
fn test_snapshots_survive_later_changes() {
    let mut rng = StdRng::seed_from_u64(99);
    let mut tree = build(8);
    let mut model: BTreeMap<u32, u64> = BTreeMap::new();
    let mut log: HashMap<u32, Vec<(Lifespan, u64)>> = HashMap::new();
    let mut snapshots = Vec::new();

    for step in 1..=1500u64 {
        let v = Version(step);
        let key = rng.gen_range(0..120u32);
        let value = rng.gen_range(0..1_000_000u64);
        match (model.contains_key(&key), rng.gen_range(0..3)) {
            (false, _) => {
                tree.insert(key, value, v).unwrap();
                model.insert(key, value);
                log.entry(key).or_default().push((Lifespan::starting_at(v), value));
            }
            (true, 0) => {
                let previous = tree.update(key, value, v).unwrap();
                assert_eq!(previous, model.insert(key, value));
                let spans = log.entry(key).or_default();
                if let Some((span, _)) = spans.last_mut() {
                    span.close(v);
                }
                spans.push((Lifespan::starting_at(v), value));
            }
            (true, _) => {
                assert_eq!(tree.delete(&key, v).unwrap(), model.remove(&key));
                if let Some((span, _)) = log.entry(key).or_default().last_mut() {
                    span.close(v);
                }
            }
        }

        if step % 50 == 0 {
            snapshots.push((v, model.clone()));
        }
        if step % 300 == 0 {
            assert_valid(&tree, &format!("step {}", step));
        }
    }
    assert_eq!(tree.len(), model.len() as u64);
    assert_eq!(tree.current_version(), Version(1500));

    for (v, expected) in &snapshots {
        let expected: Vec<(u32, u64)> = expected.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(snapshot(&tree, KeyRange::all(), *v), expected, "at {}", v);
        for (key, value) in expected.iter().take(10) {
            assert_eq!(tree.lookup(key, *v).unwrap(), Some(*value));
        }
    }

    for key in 0..120u32 {
        let expected = log.remove(&key).unwrap_or_default();
        assert_eq!(tree.history(&key).unwrap(), expected, "history of {}", key);
    }
}

#[test]
fn test_several_operations_per_version() {
    let mut tree = build(6);
    let mut model: BTreeMap<u32, u64> = BTreeMap::new();
    let mut snapshots = Vec::new();

    for key in 0..60u32 {
        tree.insert(key, key as u64, Version(1)).unwrap();
        model.insert(key, key as u64);
    }
    assert_valid(&tree, "bulk version");
    snapshots.push((Version(1), model.clone()));

    for round in 2..30u64 {
        let v = Version(round);
        let base = (round as u32 * 7) % 60;
        for offset in 0..5u32 {
            let key = (base + offset * 11) % 60;
            if model.remove(&key).is_some() {
                tree.delete(&key, v).unwrap();
            } else {
                tree.insert(key, round, v).unwrap();
                model.insert(key, round);
            }
        }
        // inserted and removed within the same version
        tree.insert(1000 + round as u32, 0, v).unwrap();
        assert_eq!(tree.delete(&(1000 + round as u32), v).unwrap(), Some(0));

        assert_valid(&tree, &format!("version {}", round));
        snapshots.push((v, model.clone()));
    }

    for (v, expected) in &snapshots {
        let expected: Vec<(u32, u64)> = expected.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(snapshot(&tree, KeyRange::all(), *v), expected, "at {}", v);
    }
    for round in 2..30u32 {
        assert!(tree.history(&(1000 + round)).unwrap().is_empty());
    }
}

#[test]
fn test_range_query_at_version() {
    let mut tree = build(8);
    for key in 0..50u32 {
        tree.insert(key, 1, Version(key as u64 + 1)).unwrap();
    }
    for key in (0..50u32).step_by(2) {
        tree.update(key, 2, Version(100)).unwrap();
    }
    for key in 10..15u32 {
        tree.delete(&key, Version(101)).unwrap();
    }

    let keys = |at: u64| -> Vec<u32> {
        snapshot(&tree, KeyRange::between(10, 20), Version(at))
            .into_iter()
            .map(|(k, _)| k)
            .collect()
    };
    assert!(keys(5).is_empty());
    assert_eq!(keys(15), vec![10, 11, 12, 13, 14]);
    assert_eq!(keys(100), (10..20).collect::<Vec<_>>());
    assert_eq!(keys(101), (15..20).collect::<Vec<_>>());

    let values: Vec<u64> = snapshot(&tree, KeyRange::between(16, 19), Version(100))
        .into_iter()
        .map(|(_, v)| v)
        .collect();
    assert_eq!(values, vec![2, 1, 2]);
    assert_eq!(tree.lookup(&16, Version(99)).unwrap(), Some(1));
    assert_eq!(tree.get(&16).unwrap(), Some(2));
    assert_valid(&tree, "after updates");
}

#[test]
fn test_delete_everything_then_reuse_keys() {
    let mut tree = build(6);
    for key in 0..40u32 {
        tree.insert(key, 1, Version(1)).unwrap();
    }
    for key in 0..40u32 {
        tree.delete(&key, Version(2)).unwrap();
    }
    assert!(tree.is_empty());
    assert_valid(&tree, "emptied");

    for key in 0..40u32 {
        tree.insert(key, 3, Version(3)).unwrap();
    }
    assert_eq!(snapshot(&tree, KeyRange::all(), Version(1)).len(), 40);
    assert!(snapshot(&tree, KeyRange::all(), Version(2)).is_empty());
    assert_eq!(
        snapshot(&tree, KeyRange::all(), Version(3)),
        (0..40u32).map(|k| (k, 3)).collect::<Vec<_>>()
    );
    assert_eq!(
        tree.history(&7).unwrap(),
        vec![
            (Lifespan::new(Version(1), Some(Version(2))), 1),
            (Lifespan::starting_at(Version(3)), 3),
        ]
    );
}

#[test]
fn test_small_fanouts_match_model() {
    let configs = [(4, 0.2), (5, 0.2), (6, 0.2), (4, 0.5), (5, 0.4), (8, 0.25)];
    for (i, (fanout, min_ratio)) in configs.into_iter().enumerate() {
        let mut rng = StdRng::seed_from_u64(192 + i as u64);
        let mut tree = build_with(fanout, min_ratio);
        let mut model: BTreeMap<u32, u64> = BTreeMap::new();
        let mut snapshots = Vec::new();
        let mut v = 1u64;

        for step in 0..1200u64 {
            if rng.gen_bool(0.3) {
                snapshots.push((Version(v), model.clone()));
                v += 1;
            }
            if step == 600 {
                // empty a whole block of neighbouring subtrees
                for key in 50..150u32 {
                    assert_eq!(tree.delete(&key, Version(v)).unwrap(), model.remove(&key));
                    assert_valid(&tree, &format!("fanout {} wiping {} at v{}", fanout, key, v));
                }
            }

            let key = rng.gen_range(0..200u32);
            if model.contains_key(&key) {
                assert_eq!(tree.delete(&key, Version(v)).unwrap(), model.remove(&key));
            } else if rng.gen_bool(0.5) {
                tree.insert(key, step, Version(v)).unwrap();
                model.insert(key, step);
            } else {
                assert_eq!(tree.delete(&key, Version(v)).unwrap(), None);
            }
            assert_valid(
                &tree,
                &format!("fanout {} ratio {} step {} key {} at v{}", fanout, min_ratio, step, key, v),
            );
        }

        let expected: Vec<(u32, u64)> = model.iter().map(|(k, v)| (*k, *v)).collect();
        assert_eq!(snapshot(&tree, KeyRange::all(), Version(v)), expected);
        assert_eq!(tree.len(), model.len() as u64);
        for (at, expected) in &snapshots {
            let expected: Vec<(u32, u64)> = expected.iter().map(|(k, v)| (*k, *v)).collect();
            assert_eq!(
                snapshot(&tree, KeyRange::all(), *at),
                expected,
                "fanout {} at {}",
                fanout,
                at
            );
        }
    }
}
