//! Integration tests covering rank/select queries, range iteration and
//! deletion, ordered-insert rejection, the keyed variant, stride-write
//! rollback, split/merge thresholds, load independence, cloning, and a
//! seeded randomized model test cross-checked against a `Vec` oracle
//! (parallel reference model, assertions after every mutation).

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use sorted_chunk_list::{Error, SortedList, SortedListByKey};

#[test]
fn rank_select_scenario() {
    let mut list: SortedList<i32> = SortedList::with_load(4).unwrap();
    list.update([5, 1, 3, 1, 4, 1, 5, 9, 2, 6]);

    assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![1, 1, 1, 2, 3, 4, 5, 5, 6, 9]);
    assert_eq!(list.bisect_left(&5), 6);
    assert_eq!(list.bisect_right(&5), 8);
    assert_eq!(list.count(&1), 3);
    assert_eq!(list.index_of(&1, None, None).unwrap(), 0);
    assert_eq!(*list.get(3).unwrap(), 2);
    assert_eq!(*list.get(-1).unwrap(), 9);
    list.check().unwrap();
}

#[test]
fn range_iteration_scenario() {
    let mut list: SortedList<i32> = SortedList::with_load(4).unwrap();
    list.update([5, 1, 3, 1, 4, 1, 5, 9, 2, 6]);

    let got: Vec<i32> = list.irange(Some(&2), Some(&6), (true, true), false).copied().collect();
    assert_eq!(got, vec![2, 3, 4, 5, 5, 6]);

    let got: Vec<i32> = list.irange(Some(&2), Some(&6), (false, false), false).copied().collect();
    assert_eq!(got, vec![3, 4, 5, 5]);

    let got: Vec<i32> = list.irange(Some(&2), Some(&6), (true, true), true).copied().collect();
    assert_eq!(got, vec![6, 5, 5, 4, 3, 2]);
}

#[test]
fn range_deletion_scenario() {
    let mut list: SortedList<i32> = SortedList::with_load(4).unwrap();
    list.update(0..100);

    list.delete_range(20..80).unwrap();

    let got: Vec<i32> = list.iter().copied().collect();
    let expected: Vec<i32> = (0..20).chain(80..100).collect();
    assert_eq!(got, expected);
    assert_eq!(list.len(), 40);
    list.check().unwrap();
}

#[test]
fn ordered_insert_rejection_scenario() {
    let mut list: SortedList<i32> = SortedList::with_load(4).unwrap();
    list.update([1, 3, 5]);

    let err = list.insert(1, 4);
    assert!(matches!(err, Err(Error::OrderViolation { .. })));
    assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![1, 3, 5]);

    list.insert(1, 2).unwrap();
    assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![1, 2, 3, 5]);
}

#[test]
fn keyed_variant_scenario() {
    let mut list: SortedListByKey<&str, usize, fn(&&str) -> usize> =
        SortedListByKey::with_load((|s: &&str| s.len()) as fn(&&str) -> usize, 4).unwrap();
    list.update(["bb", "aaa", "c"]);

    assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec!["c", "bb", "aaa"]);
    assert_eq!(list.bisect_key_left(&2), 1);

    let got: Vec<&str> = list.irange_key(Some(&2), Some(&3), (true, true), false).copied().collect();
    assert_eq!(got, vec!["bb", "aaa"]);
    list.check().unwrap();
}

#[test]
fn extended_stride_rollback_scenario() {
    let mut list: SortedList<i32> = SortedList::with_load(4).unwrap();
    list.update([1, 3, 5, 7, 9]);

    let err = list.replace_stride(&[0, 2, 4], vec![2, 10, 8]);
    assert!(err.is_err());
    assert_eq!(list.iter().copied().collect::<Vec<_>>(), vec![1, 3, 5, 7, 9]);
}

#[test]
fn split_threshold_produces_balanced_halves() {
    let mut list: SortedList<i32> = SortedList::with_load(4).unwrap();
    for _ in 0..9 {
        list.add(1);
    }
    list.check().unwrap();
    assert_eq!(list.len(), 9);
}

#[test]
fn merge_threshold_triggers_on_shrink() {
    let mut list: SortedList<i32> = SortedList::with_load(4).unwrap();
    list.update(0..40);
    for v in 0..30 {
        list.remove(&v).unwrap();
        list.check().unwrap();
    }
    assert_eq!(list.iter().copied().collect::<Vec<_>>(), (30..40).collect::<Vec<_>>());
}

#[test]
fn load_independence_of_results() {
    let values = [5, 1, 3, 1, 4, 1, 5, 9, 2, 6];
    let mut reference: SortedList<i32> = SortedList::new();
    reference.update(values);
    let reference: Vec<i32> = reference.iter().copied().collect();

    for load in [4usize, 8, 100, 1000, 10000] {
        let mut list: SortedList<i32> = SortedList::with_load(load).unwrap();
        list.update(values);
        assert_eq!(list.iter().copied().collect::<Vec<_>>(), reference);
        list.check().unwrap();
    }
}

#[test]
fn clone_is_independent_of_original() {
    let mut a: SortedList<i32> = SortedList::with_load(4).unwrap();
    a.update(0..20);
    let b = a.clone();
    assert_eq!(a, b);
    a.add(1000);
    assert_ne!(a, b);
    assert_eq!(b.iter().copied().collect::<Vec<_>>(), (0..20).collect::<Vec<_>>());
}

/// Drive a sequence of random operations against both a `SortedList<i32>`
/// and a plain sorted `Vec<i32>` oracle, asserting agreement and full
/// structural invariants after every mutation. Prints the seed on panic so
/// a failure can be reproduced directly.
#[test]
fn randomized_model_against_vec_oracle() {
    for seed in 0..8u64 {
        run_model_trial(seed);
    }
}

fn run_model_trial(seed: u64) {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut list: SortedList<i32> = SortedList::with_load(4).unwrap();
    let mut oracle: Vec<i32> = Vec::new();

    for step in 0..500 {
        let op = rng.gen_range(0..7);
        match op {
            0 => {
                let v = rng.gen_range(-20..20);
                list.add(v);
                let idx = oracle.partition_point(|x| *x < v);
                oracle.insert(idx, v);
            }
            1 => {
                if !oracle.is_empty() {
                    let idx = rng.gen_range(0..oracle.len());
                    let v = oracle[idx];
                    let removed = list.discard(&v);
                    assert!(removed, "seed {} step {}: discard({}) should have found it", seed, step, v);
                    let pos = oracle.iter().position(|x| *x == v).unwrap();
                    oracle.remove(pos);
                }
            }
            2 => {
                if !oracle.is_empty() {
                    let idx = rng.gen_range(0..oracle.len()) as isize;
                    let popped = list.pop(idx).unwrap();
                    let expected = oracle.remove(idx as usize);
                    assert_eq!(popped, expected, "seed {} step {}: pop mismatch", seed, step);
                }
            }
            3 => {
                let mut batch: Vec<i32> = (0..rng.gen_range(0..10)).map(|_| rng.gen_range(-20..20)).collect();
                list.update(batch.clone());
                oracle.append(&mut batch);
                oracle.sort();
            }
            4 => {
                if oracle.len() > 4 {
                    let start = rng.gen_range(0..oracle.len());
                    let stop = rng.gen_range(start..oracle.len());
                    list.delete_range(start..stop).unwrap();
                    oracle.drain(start..stop);
                }
            }
            5 => {
                if rng.gen_range(0..20) == 0 {
                    list.clear();
                    oracle.clear();
                }
            }
            _ => {
                let v = rng.gen_range(-20..20);
                assert_eq!(list.contains(&v), oracle.contains(&v), "seed {} step {}: contains({})", seed, step, v);
                assert_eq!(list.count(&v), oracle.iter().filter(|&&x| x == v).count(), "seed {} step {}: count({})", seed, step, v);
            }
        }

        assert_eq!(list.len(), oracle.len(), "seed {} step {}: length mismatch", seed, step);
        assert_eq!(
            list.iter().copied().collect::<Vec<_>>(),
            oracle,
            "seed {} step {}: sequence mismatch",
            seed,
            step
        );
        list.check().unwrap_or_else(|e| panic!("seed {} step {}: invariant violated: {}", seed, step, e));
    }
}
