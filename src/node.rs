//! Physical tree nodes.
//!
//! An inner node owns ordered separator keys and child references; a leaf
//! owns ordered keys with one value list per key (multimap) plus a link to
//! the next leaf in key order. Node ids are stable and used only for
//! diagnostics, as is the non-owning parent id.

use bytes::{Buf, BufMut, BytesMut};

use crate::counter::{NODE_HEADER_SIZE, VALUE_COUNT_SIZE, VALUE_LEN_SIZE};
use crate::error::{Error, Result};
use crate::key::IndexKey;
use crate::latch::NodeRef;
use crate::Value;

pub(crate) const NODE_TAG_INNER: u8 = 0;
pub(crate) const NODE_TAG_LEAF: u8 = 1;

pub(crate) fn max_leaf_keys(order: usize) -> usize {
	order - 1
}

pub(crate) fn max_inner_keys(order: usize) -> usize {
	order - 1
}

pub(crate) fn min_leaf_keys(order: usize) -> usize {
	order / 2
}

pub(crate) fn min_inner_children(order: usize) -> usize {
	(order + 1) / 2
}

pub(crate) enum Node<K: IndexKey> {
	Inner(InnerNode<K>),
	Leaf(LeafNode<K>),
}

pub(crate) struct InnerNode<K: IndexKey> {
	pub(crate) id: u64,
	/// Diagnostics only, never consulted during traversal.
	pub(crate) parent_id: u64,
	/// Distance to the leaf level; children are leaves iff `level == 1`.
	/// Fixed at creation, which lets a descent pick the latch mode for a
	/// child without peeking through the child's own latch.
	pub(crate) level: u16,
	pub(crate) keys: Vec<K>,
	pub(crate) children: Vec<NodeRef<K>>,
}

pub(crate) struct LeafNode<K: IndexKey> {
	pub(crate) id: u64,
	pub(crate) parent_id: u64,
	pub(crate) keys: Vec<K>,
	pub(crate) values: Vec<Vec<Value>>,
	pub(crate) next: Option<NodeRef<K>>,
}

impl<K: IndexKey> Node<K> {
	pub(crate) fn id(&self) -> u64 {
		match self {
			Node::Inner(inner) => inner.id,
			Node::Leaf(leaf) => leaf.id,
		}
	}

	pub(crate) fn parent_id(&self) -> u64 {
		match self {
			Node::Inner(inner) => inner.parent_id,
			Node::Leaf(leaf) => leaf.parent_id,
		}
	}

	pub(crate) fn set_parent_id(&mut self, parent_id: u64) {
		match self {
			Node::Inner(inner) => inner.parent_id = parent_id,
			Node::Leaf(leaf) => leaf.parent_id = parent_id,
		}
	}

	/// Distance to the leaf level, leaves being level 0.
	pub(crate) fn level(&self) -> u16 {
		match self {
			Node::Inner(inner) => inner.level,
			Node::Leaf(_) => 0,
		}
	}

	/// Whether one more insert of `key` is guaranteed not to split this
	/// node. A leaf that already holds the key is safe regardless of its
	/// occupancy: the value list grows, the key count does not.
	pub(crate) fn is_insert_safe(&self, key: &K, order: usize) -> bool {
		match self {
			Node::Inner(inner) => inner.keys.len() < max_inner_keys(order),
			Node::Leaf(leaf) => {
				leaf.keys.len() < max_leaf_keys(order) || leaf.position_of(key).is_ok()
			}
		}
	}

	pub(crate) fn is_overflow(&self, order: usize) -> bool {
		match self {
			Node::Inner(inner) => inner.children.len() > order,
			Node::Leaf(leaf) => leaf.keys.len() > max_leaf_keys(order),
		}
	}

	pub(crate) fn is_underflow(&self, order: usize) -> bool {
		match self {
			Node::Inner(inner) => inner.children.len() < min_inner_children(order),
			Node::Leaf(leaf) => leaf.keys.len() < min_leaf_keys(order),
		}
	}

	/// Whether this node can give up one entry to a sibling and stay at or
	/// above its minimum occupancy.
	pub(crate) fn can_lend(&self, order: usize) -> bool {
		match self {
			Node::Inner(inner) => inner.children.len() > min_inner_children(order),
			Node::Leaf(leaf) => leaf.keys.len() > min_leaf_keys(order),
		}
	}

	/// Exact serialized size of this node, header included.
	pub(crate) fn encoded_len(&self) -> usize {
		match self {
			Node::Inner(inner) => NODE_HEADER_SIZE + inner.keys.len() * K::ENCODED_LEN,
			Node::Leaf(leaf) => {
				let mut total = NODE_HEADER_SIZE;
				for values in &leaf.values {
					total += K::ENCODED_LEN + VALUE_COUNT_SIZE;
					for value in values {
						total += VALUE_LEN_SIZE + value.len();
					}
				}
				total
			}
		}
	}

	pub(crate) fn encode_into(&self, buf: &mut BytesMut) {
		match self {
			Node::Inner(inner) => {
				buf.put_u8(NODE_TAG_INNER);
				buf.put_u32_le(inner.keys.len() as u32);
				for key in &inner.keys {
					key.encode_into(buf);
				}
			}
			Node::Leaf(leaf) => {
				buf.put_u8(NODE_TAG_LEAF);
				buf.put_u32_le(leaf.keys.len() as u32);
				for (key, values) in leaf.keys.iter().zip(&leaf.values) {
					key.encode_into(buf);
					buf.put_u32_le(values.len() as u32);
					for value in values {
						buf.put_u32_le(value.len() as u32);
						buf.put_slice(value);
					}
				}
			}
		}
	}
}

impl<K: IndexKey> InnerNode<K> {
	/// Index of the child whose subtree should contain `key`. A separator
	/// equal to the search key routes right, matching the leaf split rule
	/// that keeps the separator in the right sibling.
	pub(crate) fn route(&self, key: &K) -> usize {
		self.keys.partition_point(|k| k <= key)
	}

	pub(crate) fn child(&self, idx: usize) -> NodeRef<K> {
		NodeRef::clone(&self.children[idx])
	}

	pub(crate) fn position_of_child(&self, target: &NodeRef<K>) -> Option<usize> {
		self.children.iter().position(|c| NodeRef::ptr_eq(c, target))
	}

	/// Splices a freshly split-off right sibling in after child `idx`.
	pub(crate) fn insert_child(&mut self, idx: usize, separator: K, child: NodeRef<K>) {
		self.keys.insert(idx, separator);
		self.children.insert(idx + 1, child);
	}

	/// Splits off the upper half into a new right sibling, promoting the
	/// median key. The median ends up in neither half.
	pub(crate) fn split(&mut self, right_id: u64) -> (K, InnerNode<K>) {
		let mid = self.keys.len() / 2;
		let right_keys = self.keys.split_off(mid + 1);
		let median = self.keys.remove(mid);
		let right_children = self.children.split_off(mid + 1);
		let right = InnerNode {
			id: right_id,
			parent_id: self.parent_id,
			level: self.level,
			keys: right_keys,
			children: right_children,
		};
		(median, right)
	}

	/// Rotates the left sibling's last child into this node through the
	/// separator slot in the parent. Returns the moved child so the caller
	/// can repoint its parent back-reference.
	pub(crate) fn rotate_from_left(
		&mut self,
		left: &mut InnerNode<K>,
		separator: &mut K,
	) -> Option<NodeRef<K>> {
		let key = left.keys.pop()?;
		let child = left.children.pop()?;
		self.keys.insert(0, std::mem::replace(separator, key));
		self.children.insert(0, NodeRef::clone(&child));
		Some(child)
	}

	/// Rotates the right sibling's first child into this node through the
	/// separator slot in the parent.
	pub(crate) fn rotate_from_right(
		&mut self,
		right: &mut InnerNode<K>,
		separator: &mut K,
	) -> Option<NodeRef<K>> {
		if right.keys.is_empty() || right.children.is_empty() {
			return None;
		}
		let key = right.keys.remove(0);
		let child = right.children.remove(0);
		self.keys.push(std::mem::replace(separator, key));
		self.children.push(NodeRef::clone(&child));
		Some(child)
	}

	/// Pulls the separator down and absorbs the right sibling's keys and
	/// children. The caller removes the separator and the right child from
	/// the parent and repoints the moved children.
	pub(crate) fn absorb_right(&mut self, separator: K, right: &mut InnerNode<K>) {
		self.keys.push(separator);
		self.keys.append(&mut right.keys);
		self.children.append(&mut right.children);
	}
}

impl<K: IndexKey> LeafNode<K> {
	pub(crate) fn new(id: u64, parent_id: u64) -> Self {
		LeafNode {
			id,
			parent_id,
			keys: Vec::new(),
			values: Vec::new(),
			next: None,
		}
	}

	pub(crate) fn position_of(&self, key: &K) -> std::result::Result<usize, usize> {
		self.keys.binary_search(key)
	}

	/// Inserts a value under `key`, keeping keys sorted. Returns whether a
	/// new key slot was created (as opposed to appending to an existing
	/// value list).
	pub(crate) fn insert(&mut self, key: K, value: Value) -> bool {
		match self.keys.binary_search(&key) {
			Ok(idx) => {
				self.values[idx].push(value);
				false
			}
			Err(idx) => {
				self.keys.insert(idx, key);
				self.values.insert(idx, vec![value]);
				true
			}
		}
	}

	/// Removes `key` and every value under it.
	pub(crate) fn remove(&mut self, key: &K) -> Option<Vec<Value>> {
		match self.keys.binary_search(key) {
			Ok(idx) => {
				self.keys.remove(idx);
				Some(self.values.remove(idx))
			}
			Err(_) => None,
		}
	}

	pub(crate) fn values_of(&self, key: &K) -> Vec<Value> {
		match self.keys.binary_search(key) {
			Ok(idx) => self.values[idx].clone(),
			Err(_) => Vec::new(),
		}
	}

	/// Splits off the upper half into a new right sibling. The right
	/// sibling's smallest key becomes the separator and stays present in
	/// the sibling. The sibling inherits this leaf's chain link; the caller
	/// points this leaf at the sibling once it is wrapped in a ref.
	pub(crate) fn split(&mut self, right_id: u64) -> (K, LeafNode<K>) {
		let mid = self.keys.len() / 2;
		let right_keys = self.keys.split_off(mid);
		let right_values = self.values.split_off(mid);
		let separator = right_keys[0].clone();
		let right = LeafNode {
			id: right_id,
			parent_id: self.parent_id,
			keys: right_keys,
			values: right_values,
			next: self.next.take(),
		};
		(separator, right)
	}

	/// Moves the left sibling's last entry to the front of this leaf.
	/// Returns the moved key, which becomes the new separator in the parent.
	pub(crate) fn rotate_from_left(&mut self, left: &mut LeafNode<K>) -> Option<K> {
		let key = left.keys.pop()?;
		let values = left.values.pop()?;
		self.keys.insert(0, key.clone());
		self.values.insert(0, values);
		Some(key)
	}

	/// Moves the right sibling's first entry to the back of this leaf.
	/// Returns the right sibling's new first key, the new separator.
	pub(crate) fn rotate_from_right(&mut self, right: &mut LeafNode<K>) -> Option<K> {
		if right.keys.is_empty() {
			return None;
		}
		let key = right.keys.remove(0);
		let values = right.values.remove(0);
		self.keys.push(key);
		self.values.push(values);
		right.keys.first().cloned()
	}

	/// Absorbs the right sibling's entries and takes over its chain link.
	/// The caller removes the separator and the right child from the parent.
	pub(crate) fn absorb_right(&mut self, right: &mut LeafNode<K>) {
		self.keys.append(&mut right.keys);
		self.values.append(&mut right.values);
		self.next = right.next.take();
	}
}

/// A node decoded from a serialized tree, before children are wired up.
pub(crate) enum RawNode<K: IndexKey> {
	Inner { keys: Vec<K> },
	Leaf { keys: Vec<K>, values: Vec<Vec<Value>> },
}

pub(crate) fn decode_raw_node<K: IndexKey>(buf: &mut &[u8]) -> Result<RawNode<K>> {
	if buf.remaining() < NODE_HEADER_SIZE {
		return Err(Error::Deserialization("truncated node header".into()));
	}
	let tag = buf.get_u8();
	let key_count = buf.get_u32_le() as usize;

	match tag {
		NODE_TAG_INNER => {
			let mut keys = Vec::with_capacity(key_count);
			for _ in 0..key_count {
				keys.push(K::decode_from(buf)?);
			}
			Ok(RawNode::Inner { keys })
		}
		NODE_TAG_LEAF => {
			let mut keys = Vec::with_capacity(key_count);
			let mut values = Vec::with_capacity(key_count);
			for _ in 0..key_count {
				keys.push(K::decode_from(buf)?);
				if buf.remaining() < VALUE_COUNT_SIZE {
					return Err(Error::Deserialization("truncated value count".into()));
				}
				let value_count = buf.get_u32_le() as usize;
				let mut list = Vec::with_capacity(value_count);
				for _ in 0..value_count {
					if buf.remaining() < VALUE_LEN_SIZE {
						return Err(Error::Deserialization("truncated value length".into()));
					}
					let len = buf.get_u32_le() as usize;
					if buf.remaining() < len {
						return Err(Error::Deserialization("truncated value payload".into()));
					}
					list.push(Value::copy_from_slice(&buf[..len]));
					buf.advance(len);
				}
				values.push(list);
			}
			Ok(RawNode::Leaf { keys, values })
		}
		other => Err(Error::Deserialization(format!("unknown node tag {other}"))),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn leaf_with(keys: &[u64]) -> LeafNode<u64> {
		let mut leaf = LeafNode::new(1, 0);
		for &k in keys {
			leaf.insert(k, Value::copy_from_slice(&k.to_le_bytes()));
		}
		leaf
	}

	#[test]
	fn routing_ties_go_right() {
		let inner: InnerNode<u64> = InnerNode {
			id: 1,
			parent_id: 0,
			level: 1,
			keys: vec![10, 20],
			children: Vec::new(),
		};
		assert_eq!(inner.route(&5), 0);
		assert_eq!(inner.route(&10), 1);
		assert_eq!(inner.route(&15), 1);
		assert_eq!(inner.route(&20), 2);
		assert_eq!(inner.route(&25), 2);
	}

	#[test]
	fn leaf_insert_is_multimap() {
		let mut leaf = leaf_with(&[5, 10]);
		assert!(!leaf.insert(5, Value::from_static(b"again")));
		assert_eq!(leaf.keys, vec![5, 10]);
		assert_eq!(leaf.values_of(&5).len(), 2);
		assert!(leaf.values_of(&7).is_empty());
	}

	#[test]
	fn leaf_split_keeps_separator_in_right_half() {
		let mut leaf = leaf_with(&[5, 6, 10, 20]);
		let (separator, right) = leaf.split(2);
		assert_eq!(separator, 10);
		assert_eq!(leaf.keys, vec![5, 6]);
		assert_eq!(right.keys, vec![10, 20]);
	}

	#[test]
	fn inner_split_promotes_median_out_of_both_halves() {
		let children: Vec<NodeRef<u64>> = (0..5)
			.map(|i| crate::latch::new_node_ref(Node::Leaf(LeafNode::new(10 + i, 1))))
			.collect();
		let mut inner = InnerNode {
			id: 1,
			parent_id: 0,
			level: 1,
			keys: vec![10, 20, 30, 40],
			children,
		};
		let (median, right) = inner.split(2);
		assert_eq!(median, 30);
		assert_eq!(inner.keys, vec![10, 20]);
		assert_eq!(right.keys, vec![40]);
		assert_eq!(inner.children.len(), 3);
		assert_eq!(right.children.len(), 2);
		assert_eq!(right.level, 1);
	}

	#[test]
	fn encoded_len_matches_encoding() {
		let mut leaf = leaf_with(&[1, 2, 3]);
		leaf.insert(2, Value::from_static(b"extra"));
		let node = Node::Leaf(leaf);
		let mut buf = BytesMut::new();
		node.encode_into(&mut buf);
		assert_eq!(buf.len(), node.encoded_len());

		let mut slice = &buf[..];
		match decode_raw_node::<u64>(&mut slice).unwrap() {
			RawNode::Leaf { keys, values } => {
				assert_eq!(keys, vec![1, 2, 3]);
				assert_eq!(values[1].len(), 2);
			}
			RawNode::Inner { .. } => panic!("expected a leaf"),
		}
		assert!(slice.is_empty());
	}

	#[test]
	fn safety_accounts_for_existing_keys() {
		let leaf = leaf_with(&[1, 2, 3]);
		let node = Node::Leaf(leaf);
		// Full for order 4, but a duplicate key cannot overflow it.
		assert!(!node.is_insert_safe(&9, 4));
		assert!(node.is_insert_safe(&2, 4));
	}

	#[test]
	fn leaf_rotation_moves_one_entry_and_reports_separator() {
		let mut left = leaf_with(&[1, 2, 3]);
		let mut right = leaf_with(&[10]);

		let separator = right.rotate_from_left(&mut left).unwrap();
		assert_eq!(separator, 3);
		assert_eq!(left.keys, vec![1, 2]);
		assert_eq!(right.keys, vec![3, 10]);

		let separator = left.rotate_from_right(&mut right).unwrap();
		assert_eq!(separator, 10);
		assert_eq!(left.keys, vec![1, 2, 3]);
		assert_eq!(right.keys, vec![10]);
	}

	#[test]
	fn leaf_absorb_splices_the_chain() {
		let tail = crate::latch::new_node_ref(Node::Leaf(leaf_with(&[30])));
		let mut left = leaf_with(&[1, 2]);
		let mut right = leaf_with(&[10, 20]);
		right.next = Some(NodeRef::clone(&tail));

		left.absorb_right(&mut right);
		assert_eq!(left.keys, vec![1, 2, 10, 20]);
		assert!(right.keys.is_empty());
		assert!(left.next.as_ref().is_some_and(|n| NodeRef::ptr_eq(n, &tail)));
	}

	#[test]
	fn inner_rotation_routes_through_the_separator() {
		let children: Vec<NodeRef<u64>> = (0..5)
			.map(|i| crate::latch::new_node_ref(Node::Leaf(LeafNode::new(10 + i, 1))))
			.collect();
		let mut left = InnerNode {
			id: 1,
			parent_id: 0,
			level: 1,
			keys: vec![10, 20],
			children: children[..3].to_vec(),
		};
		let mut right = InnerNode {
			id: 2,
			parent_id: 0,
			level: 1,
			keys: vec![40],
			children: children[3..].to_vec(),
		};
		let mut separator = 30u64;

		let moved = right.rotate_from_left(&mut left, &mut separator).unwrap();
		assert_eq!(separator, 20);
		assert_eq!(left.keys, vec![10]);
		assert_eq!(right.keys, vec![30, 40]);
		assert_eq!(left.children.len(), 2);
		assert_eq!(right.children.len(), 3);
		assert!(NodeRef::ptr_eq(&moved, &right.children[0]));
	}

	#[test]
	fn inner_absorb_pulls_the_separator_down() {
		let children: Vec<NodeRef<u64>> = (0..4)
			.map(|i| crate::latch::new_node_ref(Node::Leaf(LeafNode::new(10 + i, 1))))
			.collect();
		let mut left = InnerNode {
			id: 1,
			parent_id: 0,
			level: 1,
			keys: vec![10],
			children: children[..2].to_vec(),
		};
		let mut right = InnerNode {
			id: 2,
			parent_id: 0,
			level: 1,
			keys: vec![30],
			children: children[2..].to_vec(),
		};

		left.absorb_right(20, &mut right);
		assert_eq!(left.keys, vec![10, 20, 30]);
		assert_eq!(left.children.len(), 4);
		assert!(right.children.is_empty());
	}
}
