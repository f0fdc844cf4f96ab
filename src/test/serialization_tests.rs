use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use test_log::test;

use super::helpers::{keys_of, live_tree, opts, val};
use crate::{BPlusTree, Error};

#[test]
fn round_trip_preserves_content_and_height() {
	let mut rng = StdRng::seed_from_u64(0xbead);
	let tree = live_tree(4);
	for _ in 0..500 {
		let key = rng.gen_range(0..200u64);
		tree.insert(key, val(key)).unwrap();
	}

	let buf = tree.serialize();
	assert_eq!(buf.len(), tree.total_bytes());

	let copy: BPlusTree<u64> = BPlusTree::deserialize(&buf, opts(4)).unwrap();
	assert_eq!(copy.height(), tree.height());
	assert_eq!(copy.total_bytes(), tree.total_bytes());
	assert!(!copy.is_template_mode());
	assert_eq!(
		keys_of(&copy.search_range(&0, &200).unwrap()),
		keys_of(&tree.search_range(&0, &200).unwrap())
	);
	copy.validate().unwrap();
}

#[test]
fn reconstructed_trees_keep_working() {
	let tree = live_tree(4);
	for k in 0..80u64 {
		tree.insert(k, val(k)).unwrap();
	}

	let copy: BPlusTree<u64> = BPlusTree::deserialize(&tree.serialize(), opts(4)).unwrap();
	copy.insert(200, val(200)).unwrap();
	assert!(copy.delete(&40).unwrap());
	assert_eq!(keys_of(&copy.search(&200)), vec![200]);
	assert!(copy.search(&40).is_empty());
	copy.validate().unwrap();
}

#[test]
fn serialized_length_tracks_the_byte_counter() {
	let mut rng = StdRng::seed_from_u64(3);
	let tree = live_tree(4);
	for round in 0..20 {
		for _ in 0..50 {
			let key = rng.gen_range(0..400u64);
			tree.insert(key, val(key)).unwrap();
		}
		for _ in 0..10 {
			let key = rng.gen_range(0..400u64);
			tree.delete(&key).unwrap();
		}
		assert_eq!(tree.serialize().len(), tree.total_bytes(), "round {round}");
	}
}

#[test]
fn single_leaf_round_trips() {
	let tree = live_tree(4);
	tree.insert(1, val(1)).unwrap();
	tree.insert(1, val(100)).unwrap();

	let copy: BPlusTree<u64> = BPlusTree::deserialize(&tree.serialize(), opts(4)).unwrap();
	assert_eq!(copy.height(), 1);
	assert_eq!(keys_of(&copy.search(&1)), vec![1, 100]);
}

#[test]
fn cleared_skeleton_round_trips_its_shape() {
	let tree = live_tree(4);
	for k in 0..100u64 {
		tree.insert(k, val(k)).unwrap();
	}
	tree.clear_payload();

	let buf = tree.serialize();
	assert_eq!(buf.len(), tree.total_bytes());
	let copy: BPlusTree<u64> = BPlusTree::deserialize(&buf, opts(4)).unwrap();
	assert_eq!(copy.height(), tree.height());
	assert!(copy.search(&50).is_empty());
}

#[test]
fn bad_magic_is_rejected() {
	let tree = live_tree(4);
	tree.insert(1, val(1)).unwrap();
	let mut buf = tree.serialize().to_vec();
	buf[..8].copy_from_slice(b"BADMAGIC");
	assert!(matches!(
		BPlusTree::<u64>::deserialize(&buf, opts(4)),
		Err(Error::Deserialization(_))
	));
}

#[test]
fn unknown_version_is_rejected() {
	let tree = live_tree(4);
	tree.insert(1, val(1)).unwrap();
	let mut buf = tree.serialize().to_vec();
	buf[8..12].copy_from_slice(&99u32.to_le_bytes());
	assert!(matches!(
		BPlusTree::<u64>::deserialize(&buf, opts(4)),
		Err(Error::Deserialization(_))
	));
}

#[test]
fn order_mismatch_is_rejected() {
	let tree = live_tree(4);
	tree.insert(1, val(1)).unwrap();
	let buf = tree.serialize();
	assert!(matches!(
		BPlusTree::<u64>::deserialize(&buf, opts(5)),
		Err(Error::Deserialization(_))
	));
}

#[test]
fn corrupted_payload_fails_the_checksum() {
	let tree = live_tree(4);
	for k in 0..20u64 {
		tree.insert(k, val(k)).unwrap();
	}
	let mut buf = tree.serialize().to_vec();
	let last = buf.len() - 1;
	buf[last] ^= 0xff;
	assert!(matches!(
		BPlusTree::<u64>::deserialize(&buf, opts(4)),
		Err(Error::Deserialization(_))
	));
}

#[test]
fn truncated_buffers_are_rejected() {
	let tree = live_tree(4);
	for k in 0..20u64 {
		tree.insert(k, val(k)).unwrap();
	}
	let buf = tree.serialize();

	assert!(matches!(
		BPlusTree::<u64>::deserialize(&buf[..10], opts(4)),
		Err(Error::Deserialization(_))
	));
	assert!(matches!(
		BPlusTree::<u64>::deserialize(&buf[..buf.len() - 5], opts(4)),
		Err(Error::Deserialization(_))
	));
}
