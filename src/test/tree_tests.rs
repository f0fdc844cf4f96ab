use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use test_log::test;

use super::helpers::{keys_of, live_tree, val};

#[test]
fn random_inserts_match_a_sorted_map() {
	let mut rng = StdRng::seed_from_u64(0x5eed);
	let tree = live_tree(4);
	let mut model: BTreeMap<u64, Vec<u64>> = BTreeMap::new();

	for _ in 0..2_000 {
		let key = rng.gen_range(0..500u64);
		let tagged = key * 10_000 + rng.gen_range(0..10_000u64);
		tree.insert(key, val(tagged)).unwrap();
		model.entry(key).or_default().push(tagged);
	}

	for (key, values) in &model {
		assert_eq!(keys_of(&tree.search(key)), *values, "key {key}");
	}
	for absent in [500u64, 777, u64::MAX] {
		assert!(tree.search(&absent).is_empty());
	}
	tree.validate().unwrap();
}

#[test]
fn range_queries_match_a_linear_scan() {
	let mut rng = StdRng::seed_from_u64(7);
	let tree = live_tree(5);
	let mut model: BTreeMap<u64, Vec<u64>> = BTreeMap::new();

	for _ in 0..1_000 {
		let key = rng.gen_range(0..300u64);
		tree.insert(key, val(key)).unwrap();
		model.entry(key).or_default().push(key);
	}

	for _ in 0..100 {
		let a = rng.gen_range(0..300u64);
		let b = rng.gen_range(0..300u64);
		let (left, right) = if a <= b { (a, b) } else { (b, a) };
		let expected: Vec<u64> = model.range(left..=right).flat_map(|(_, vs)| vs.clone()).collect();
		assert_eq!(
			keys_of(&tree.search_range(&left, &right).unwrap()),
			expected,
			"range [{left}, {right}]"
		);
	}
}

#[test]
fn structural_invariants_hold_across_orders() {
	for order in [3u16, 4, 5, 7, 8] {
		let tree = live_tree(order);
		let mut last_height = tree.height();
		for k in 0..300u64 {
			let key = (k * 17) % 301;
			tree.insert(key, val(key)).unwrap();
			tree.validate().unwrap_or_else(|e| panic!("order {order} after insert {k}: {e}"));
			assert!(tree.height() >= last_height, "height regressed at order {order}");
			last_height = tree.height();
		}
		let all = keys_of(&tree.search_range(&0, &301).unwrap());
		let mut sorted = all.clone();
		sorted.sort_unstable();
		assert_eq!(all, sorted);
		assert_eq!(all.len(), 300);
	}
}

#[test]
fn deletes_shrink_back_to_a_single_leaf() {
	let tree = live_tree(4);
	let mut keys: Vec<u64> = (0..150).collect();
	for &k in &keys {
		tree.insert(k, val(k)).unwrap();
	}

	let mut rng = StdRng::seed_from_u64(42);
	keys.shuffle(&mut rng);
	let mut last_height = tree.height();
	for &k in &keys {
		assert!(tree.delete(&k).unwrap(), "key {k}");
		assert!(tree.search(&k).is_empty());
		assert!(tree.height() <= last_height, "height grew across a delete");
		last_height = tree.height();
		tree.validate().unwrap_or_else(|e| panic!("after deleting {k}: {e}"));
	}

	assert_eq!(tree.height(), 1);
	assert!(tree.search_range(&0, &150).unwrap().is_empty());
	assert_eq!(tree.serialize().len(), tree.total_bytes());
}

#[test]
fn interleaved_inserts_and_deletes_track_the_model() {
	let mut rng = StdRng::seed_from_u64(99);
	let tree = live_tree(4);
	let mut model: BTreeMap<u64, Vec<u64>> = BTreeMap::new();

	for step in 0..3_000 {
		let key = rng.gen_range(0..200u64);
		if rng.gen_bool(0.6) {
			tree.insert(key, val(key)).unwrap();
			model.entry(key).or_default().push(key);
		} else {
			let existed = tree.delete(&key).unwrap();
			assert_eq!(existed, model.remove(&key).is_some(), "step {step}");
		}
	}

	tree.validate().unwrap();
	let expected: Vec<u64> = model.values().flatten().copied().collect();
	assert_eq!(keys_of(&tree.search_range(&0, &200).unwrap()), expected);
}

#[test]
fn duplicate_values_survive_splits() {
	let tree = live_tree(4);
	for k in 0..40u64 {
		tree.insert(k, val(k)).unwrap();
		tree.insert(k, val(k + 1_000)).unwrap();
		tree.insert(k, val(k + 2_000)).unwrap();
	}

	for k in 0..40u64 {
		assert_eq!(keys_of(&tree.search(&k)), vec![k, k + 1_000, k + 2_000]);
	}
	tree.validate().unwrap();
}
