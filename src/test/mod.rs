//! Integration tests for the index core.
//!
//! These suites drive the tree through its public surface: model checks
//! against a sorted map, structural invariants across orders, concurrent
//! stress, serialization round trips and the chunk indexer lifecycle.

#[cfg(test)]
pub mod serialization_tests;
#[cfg(test)]
pub mod tree_tests;

#[cfg(test)]
pub mod helpers {
	use crate::{BPlusTree, Options, Value};

	pub fn opts(order: u16) -> Options {
		Options {
			order,
			..Options::default()
		}
	}

	pub fn live_tree(order: u16) -> BPlusTree<u64> {
		let tree = BPlusTree::new(opts(order));
		tree.set_template_mode(false);
		tree
	}

	pub fn val(k: u64) -> Value {
		Value::copy_from_slice(&k.to_le_bytes())
	}

	pub fn keys_of(values: &[Value]) -> Vec<u64> {
		values
			.iter()
			.map(|v| u64::from_le_bytes(v.as_ref().try_into().unwrap()))
			.collect()
	}
}
