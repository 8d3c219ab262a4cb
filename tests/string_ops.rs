//! Seeded scenarios over byte-string keys (anchored inner nodes).

use blinktree::BlinkTree;

fn key(s: &str) -> Box<[u8]> {
    s.as_bytes().into()
}

#[test]
fn upsert_lookup_and_bounded_scan() {
    let tree: BlinkTree<Box<[u8]>, u64> = BlinkTree::new();
    let guard = tree.guard();

    for i in 0..10_000u64 {
        assert!(tree.insert(key(&format!("key{i}")), i, &guard).is_none());
    }
    for i in 0..10_000u64 {
        let k = key(&format!("key{i}"));
        let kv = tree
            .lookup(&k, &guard)
            .unwrap_or_else(|| panic!("key{i} missing"));
        assert_eq!(kv.value, i);
    }

    // Ten distinct keys, each lexicographically at or above "key50".
    let probe = key("key50");
    let mut range = tree.lower_bound(&probe, &guard);
    let mut seen = Vec::new();
    for _ in 0..10 {
        let kv = range.pair().expect("scan ended early");
        assert!(kv.key >= probe, "{:?} below the bound", kv.key);
        seen.push(kv.key.clone());
        range.advance();
    }
    seen.dedup();
    assert_eq!(seen.len(), 10, "scan repeated a key");

    tree.validate();
    assert_eq!(tree.stats().pairs, 10_000);
}

#[test]
fn replacement_and_removal() {
    let tree: BlinkTree<Box<[u8]>, String> = BlinkTree::new();
    let guard = tree.guard();

    tree.insert(key("alpha"), "a".into(), &guard);
    tree.insert(key("beta"), "b".into(), &guard);
    let old = tree
        .insert(key("alpha"), "A".into(), &guard)
        .expect("alpha was present");
    assert_eq!(old.value, "a");

    let removed = tree.remove(&key("beta"), &guard).expect("beta was present");
    assert_eq!(removed.value, "b");
    assert!(tree.lookup(&key("beta"), &guard).is_none());
    assert_eq!(tree.lookup(&key("alpha"), &guard).unwrap().value, "A");
}

#[test]
fn lexicographic_scan_order_with_shared_prefixes() {
    let tree: BlinkTree<Box<[u8]>, u64> = BlinkTree::new();
    let guard = tree.guard();

    // Heavy shared prefixes force anchor-based tie-breaks in the inner
    // nodes, and mixed lengths exercise the length tiebreak.
    let mut expected = Vec::new();
    for a in ["app", "apple", "applet", "apply", "apt", "b", "ba", "bat"] {
        for i in 0..400u64 {
            expected.push(format!("{a}/{i:05}"));
        }
    }
    for (i, s) in expected.iter().enumerate() {
        tree.insert(key(s), i as u64, &guard);
    }
    expected.sort();

    let scanned: Vec<Box<[u8]>> = tree.begin(&guard).map(|kv| kv.key.clone()).collect();
    let expected_bytes: Vec<Box<[u8]>> = expected.iter().map(|s| key(s)).collect();
    assert_eq!(scanned, expected_bytes);
    tree.validate();
}

#[test]
fn empty_key_is_a_valid_key() {
    let tree: BlinkTree<Box<[u8]>, u64> = BlinkTree::new();
    let guard = tree.guard();

    tree.insert(key(""), 0, &guard);
    tree.insert(key("a"), 1, &guard);
    assert_eq!(tree.lookup(&key(""), &guard).unwrap().value, 0);

    let first = tree.begin(&guard).pair().unwrap();
    assert_eq!(&*first.key, b"");
}

#[test]
fn removal_shrinks_anchored_levels() {
    let tree: BlinkTree<Box<[u8]>, u64> = BlinkTree::new();
    let guard = tree.guard();

    for i in 0..5_000u64 {
        tree.insert(key(&format!("doc/{i:06}")), i, &guard);
    }
    assert!(tree.depth() >= 2);
    for i in 0..5_000u64 {
        assert!(tree.remove(&key(&format!("doc/{i:06}")), &guard).is_some());
    }
    assert_eq!(tree.stats().pairs, 0);
    assert!(tree.begin(&guard).is_end());
    tree.validate();
}
