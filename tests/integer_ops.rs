//! Seeded single-threaded scenarios over integer keys.

use blinktree::BlinkTree;

#[test]
fn sequential_ascending_insert_lookup_scan() {
    let tree: BlinkTree<u64, u64> = BlinkTree::new();
    let guard = tree.guard();

    for k in 1..=10_000u64 {
        assert!(tree.insert(k, k, &guard).is_none(), "key {k} inserted twice");
    }
    for k in 1..=10_000u64 {
        let kv = tree.lookup(&k, &guard).unwrap_or_else(|| panic!("key {k} missing"));
        assert_eq!(kv.value, k);
    }

    let keys: Vec<u64> = tree.lower_bound(&0, &guard).map(|kv| kv.key).collect();
    assert_eq!(keys.len(), 10_000);
    assert!(keys.iter().copied().eq(1..=10_000));

    tree.validate();
    let stats = tree.stats();
    assert_eq!(stats.pairs, 10_000);
    assert!(stats.depth >= 2);
    assert!(stats.load_factor > 0.0);
}

#[test]
fn sequential_descending_insert_lookup_scan() {
    let tree: BlinkTree<u64, u64> = BlinkTree::new();
    let guard = tree.guard();

    for k in (1..=10_000u64).rev() {
        assert!(tree.insert(k, k, &guard).is_none());
    }
    for k in 1..=10_000u64 {
        let kv = tree.lookup(&k, &guard).unwrap_or_else(|| panic!("key {k} missing"));
        assert_eq!(kv.value, k);
    }

    let keys: Vec<u64> = tree.begin(&guard).map(|kv| kv.key).collect();
    assert!(keys.iter().copied().eq(1..=10_000));
    tree.validate();
}

#[test]
fn insert_returns_displaced_record() {
    let tree: BlinkTree<u64, u64> = BlinkTree::new();
    let guard = tree.guard();

    assert!(tree.insert(42, 1, &guard).is_none());
    let old = tree.insert(42, 2, &guard).expect("second insert displaces");
    assert_eq!(old.value, 1);
    assert_eq!(tree.lookup(&42, &guard).unwrap().value, 2);
    assert_eq!(tree.stats().pairs, 1);
}

#[test]
fn update_only_touches_present_keys() {
    let tree: BlinkTree<u64, u64> = BlinkTree::new();
    let guard = tree.guard();

    assert!(tree.update(5, 50, &guard).is_none(), "update must not insert");
    assert!(tree.lookup(&5, &guard).is_none());

    tree.insert(5, 50, &guard);
    let old = tree.update(5, 55, &guard).expect("key is present");
    assert_eq!(old.value, 50);
    assert_eq!(tree.lookup(&5, &guard).unwrap().value, 55);

    // Updating to the current value is idempotent.
    let old = tree.update(5, 55, &guard).expect("key is present");
    assert_eq!(old.value, 55);
    assert_eq!(tree.lookup(&5, &guard).unwrap().value, 55);
}

#[test]
fn remove_everything_shrinks_back_to_a_leaf() {
    let tree: BlinkTree<u64, u64> = BlinkTree::new();
    let guard = tree.guard();

    for k in 1..=10_000u64 {
        tree.insert(k, k, &guard);
    }
    assert!(tree.depth() >= 2);

    for k in 1..=10_000u64 {
        let old = tree.remove(&k, &guard).unwrap_or_else(|| panic!("key {k} missing"));
        assert_eq!(old.value, k);
        assert!(tree.remove(&k, &guard).is_none(), "key {k} removed twice");
    }
    assert_eq!(tree.stats().pairs, 0);
    assert!(tree.begin(&guard).next().is_none());
    tree.validate();
}

#[test]
fn interleaved_insert_remove_keeps_structure() {
    let tree: BlinkTree<u64, u64> = BlinkTree::new();
    let guard = tree.guard();

    for k in 1..=4_096u64 {
        tree.insert(k, k, &guard);
    }
    // Drop the middle band, then refill part of it.
    for k in 1_000..3_000u64 {
        assert!(tree.remove(&k, &guard).is_some());
    }
    for k in 1_500..2_500u64 {
        assert!(tree.insert(k, k + 1, &guard).is_none());
    }
    tree.validate();

    for k in 1..=4_096u64 {
        let found = tree.lookup(&k, &guard);
        let expected_present = !(1_000..3_000).contains(&k) || (1_500..2_500).contains(&k);
        assert_eq!(found.is_some(), expected_present, "key {k}");
        if let Some(kv) = found {
            let expected = if (1_500..2_500).contains(&k) { k + 1 } else { k };
            assert_eq!(kv.value, expected, "key {k}");
        }
    }
}

#[test]
fn signed_keys_scan_in_numeric_order() {
    let tree: BlinkTree<i64, i64> = BlinkTree::new();
    let guard = tree.guard();

    let keys = [-5_000i64, -1, 0, 1, 5_000, i64::MIN, i64::MAX, -333, 333];
    for &k in &keys {
        tree.insert(k, k, &guard);
    }
    let mut sorted = keys.to_vec();
    sorted.sort_unstable();

    let scanned: Vec<i64> = tree.begin(&guard).map(|kv| kv.key).collect();
    assert_eq!(scanned, sorted);
    tree.validate();
}

#[test]
fn u32_keys_work_end_to_end() {
    let tree: BlinkTree<u32, u32> = BlinkTree::new();
    let guard = tree.guard();

    for k in (0..2_000u32).rev() {
        tree.insert(k, !k, &guard);
    }
    for k in 0..2_000u32 {
        assert_eq!(tree.lookup(&k, &guard).unwrap().value, !k);
    }
    let keys: Vec<u32> = tree.begin(&guard).map(|kv| kv.key).collect();
    assert!(keys.iter().copied().eq(0..2_000));
    tree.validate();
}

#[test]
fn lower_and_upper_bound_positioning() {
    let tree: BlinkTree<u64, u64> = BlinkTree::new();
    let guard = tree.guard();
    for k in (10..=1_000u64).step_by(10) {
        tree.insert(k, k, &guard);
    }

    assert_eq!(tree.lower_bound(&500, &guard).pair().unwrap().key, 500);
    assert_eq!(tree.upper_bound(&500, &guard).pair().unwrap().key, 510);
    assert_eq!(tree.lower_bound(&501, &guard).pair().unwrap().key, 510);
    assert_eq!(tree.lower_bound(&0, &guard).pair().unwrap().key, 10);
    assert!(tree.lower_bound(&1_001, &guard).is_end());
    assert!(tree.upper_bound(&1_000, &guard).is_end());
}
