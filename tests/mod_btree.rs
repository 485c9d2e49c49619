use lodestore::index::btree::BTreeIndex;
use lodestore::index::{Index, IndexKey, IndexKind, StoreIndex};

fn key(i: i64) -> IndexKey {
    IndexKey::I64(i)
}

/// Deterministic pseudo-random permutation of 1..=n (multiplicative group
/// modulo the prime 10007).
fn permutation(n: i64) -> Vec<i64> {
    let prime = 10_007i64;
    assert!(n < prime);
    let mut out = Vec::with_capacity(usize::try_from(n).unwrap());
    let mut x = 1i64;
    while out.len() < usize::try_from(n).unwrap() {
        x = (x * 5) % prime;
        if x <= n {
            out.push(x);
        }
    }
    out
}

#[test]
fn ten_thousand_keys_in_a_degree_five_tree() {
    let index: BTreeIndex<i64> = BTreeIndex::with_degree(5);
    let n = 10_000i64;
    for i in permutation(n) {
        index.put(key(i), i).unwrap();
    }
    assert_eq!(index.len(), usize::try_from(n).unwrap());

    let all = index.get_all();
    assert!(all.windows(2).all(|w| w[0].0 < w[1].0), "in-order traversal must be sorted");
    assert_eq!(all.first().unwrap().0, key(1));
    assert_eq!(all.last().unwrap().0, key(n));

    // Delete the odd keys.
    for i in (1..=n).step_by(2) {
        assert_eq!(index.remove(&key(i)).unwrap(), Some(i));
    }
    assert_eq!(index.len(), 5_000);
    for i in 1..=n {
        let found = index.get(&key(i)).unwrap();
        if i % 2 == 0 {
            assert_eq!(found, Some(i), "even key {i} must survive");
        } else {
            assert_eq!(found, None, "odd key {i} must be gone");
        }
    }
    assert_eq!(index.min_key(), Some(key(2)));
    assert_eq!(index.max_key(), Some(key(n)));
}

#[test]
fn every_variant_honors_the_capability_set() {
    for kind in [IndexKind::BTree, IndexKind::Hash, IndexKind::SkipList] {
        let index: StoreIndex<String> = StoreIndex::new(kind);
        assert_eq!(index.kind(), kind);
        for i in [4i64, 2, 8, 6] {
            index.put(key(i), format!("v{i}")).unwrap();
        }
        assert_eq!(index.len(), 4);
        assert!(index.contains_key(&key(4)).unwrap());
        assert_eq!(index.get(&key(6)).unwrap(), Some("v6".to_string()));
        assert_eq!(index.min_key(), Some(key(2)), "{kind:?}");
        assert_eq!(index.max_key(), Some(key(8)), "{kind:?}");

        let ranged = index.range(&key(3), &key(7)).unwrap();
        assert_eq!(
            ranged.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
            vec![key(4), key(6)],
            "{kind:?}"
        );
        assert!(index.range(&key(7), &key(3)).is_err(), "{kind:?} must reject start > end");

        assert_eq!(index.keys_greater_than(&key(4), 10), vec![key(6), key(8)], "{kind:?}");
        assert_eq!(index.keys_less_than(&key(6), 1), vec![key(4)], "{kind:?}");

        assert_eq!(index.remove(&key(2)).unwrap(), Some("v2".to_string()));
        assert_eq!(index.len(), 3);

        index.insert_batch(vec![(key(10), "v10".into()), (key(12), "v12".into())]).unwrap();
        assert_eq!(index.len(), 5);
        index.remove_batch(&[key(10), key(12)]).unwrap();
        assert_eq!(index.len(), 3);

        index.flush().unwrap();
        let stats = index.stats();
        assert!(stats.puts >= 6);

        index.clear();
        assert!(index.is_empty());
    }
}

#[test]
fn mixed_key_types_order_consistently() {
    let index: BTreeIndex<i64> = BTreeIndex::with_degree(5);
    index.put(IndexKey::from("zeta"), 1).unwrap();
    index.put(IndexKey::from(42i64), 2).unwrap();
    index.put(IndexKey::from(2.5f64), 3).unwrap();
    index.put(IndexKey::from(true), 4).unwrap();
    let all = index.get_all();
    assert!(all.windows(2).all(|w| w[0].0 < w[1].0));
    assert_eq!(index.len(), 4);
}
