//! Concurrent B+ tree over a single index field.
//!
//! Many threads insert and query a live tree at once; correctness rests
//! entirely on per-node latch discipline. Readers couple read latches down
//! the tree. Writers first try an optimistic descent that write-latches
//! only the target leaf and fall back to a pessimistic descent that keeps
//! write latches on the ancestors a split may still reach. The root is an
//! atomically swapped reference, so every descent starts by latching a
//! root candidate and re-checking that it still is the root.
//!
//! A tree in template mode is structurally frozen: inserts land in the
//! leaf the existing shape routes them to, and an insert that would have
//! split a leaf bumps a counter instead. The chunk indexer uses this to
//! pour a batch into a pre-sized shape and to learn when that shape has
//! stopped fitting the data.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::{Buf, BufMut, BytesMut};

use crate::counter::{
	live_insert_estimate, template_insert_estimate, BytesCounter, SplitCounter, NODE_HEADER_SIZE,
	TREE_HEADER_SIZE, VALUE_COUNT_SIZE, VALUE_LEN_SIZE,
};
use crate::error::{Error, Result};
use crate::key::IndexKey;
use crate::latch::{
	holds, latched_ref, new_node_ref, AncestorLatches, NodeRef, ReadLatch, WriteLatch,
};
use crate::node::{
	decode_raw_node, max_leaf_keys, min_inner_children, min_leaf_keys, InnerNode, LeafNode, Node,
	RawNode,
};
use crate::option::Options;
use crate::Value;

const MAGIC: [u8; 8] = *b"SDXBPT01";
const VERSION: u32 = 1;

/// In-memory concurrent B+ tree index.
///
/// Keys are multimap entries: one key may hold any number of values.
/// `insert`, `search` and `search_range` are safe to call from many
/// threads at once. `delete` must be serialized by the caller; it still
/// latches correctly against concurrent readers and inserters. Mode
/// switches (`set_template_mode`, `clear_payload`) belong to the chunk
/// lifecycle and are only called at quiescent points.
pub struct BPlusTree<K: IndexKey> {
	/// Replaced only by the writer whose split or collapse reaches the
	/// top, while that writer holds the old root's write latch.
	root: ArcSwap<parking_lot::RwLock<Node<K>>>,
	opts: Options,
	counter: BytesCounter,
	splits: SplitCounter,
	template_mode: AtomicBool,
	next_node_id: AtomicU64,
}

impl<K: IndexKey> BPlusTree<K> {
	/// Creates a tree holding a single empty leaf, in template mode.
	///
	/// A fresh tree sizes its first batch before anything else happens to
	/// it; call [`set_template_mode`](Self::set_template_mode) with
	/// `false` to go live.
	pub fn new(opts: Options) -> Self {
		assert!(opts.order >= 3, "tree order must be at least 3");
		let root = new_node_ref(Node::Leaf(LeafNode::new(1, 0)));
		BPlusTree {
			root: ArcSwap::new(root),
			opts,
			counter: BytesCounter::new(TREE_HEADER_SIZE + NODE_HEADER_SIZE),
			splits: SplitCounter::new(),
			template_mode: AtomicBool::new(true),
			next_node_id: AtomicU64::new(2),
		}
	}

	/// Tree height in levels; a single-leaf tree has height 1.
	pub fn height(&self) -> u32 {
		self.counter.height()
	}

	/// Exact serialized footprint of the tree at the last quiescent point.
	pub fn total_bytes(&self) -> usize {
		self.counter.bytes()
	}

	pub fn is_template_mode(&self) -> bool {
		self.template_mode.load(Ordering::SeqCst)
	}

	pub fn set_template_mode(&self, enabled: bool) {
		self.template_mode.store(enabled, Ordering::SeqCst);
	}

	/// Number of inserts that would have split a leaf while the tree was
	/// in template mode.
	pub fn split_count(&self) -> u64 {
		self.splits.get()
	}

	pub fn reset_split_count(&self) {
		self.splits.reset()
	}

	/// Marginal serialized cost of inserting one value of `value_len`
	/// bytes. Pure; branches on the tree's mode.
	pub fn bytes_estimate_for_insert(&self, value_len: usize) -> usize {
		if self.is_template_mode() {
			template_insert_estimate::<K>(self.opts.order, value_len)
		} else {
			live_insert_estimate::<K>(value_len)
		}
	}

	/// Inserts `value` under `key`.
	///
	/// In template mode the structure never changes; a would-be split is
	/// recorded in the split counter. In live mode the optimistic
	/// protocol runs first and the pessimistic protocol picks up every
	/// insert the optimistic one declines.
	pub fn insert(&self, key: K, value: Value) -> Result<()> {
		if self.is_template_mode() {
			return self.insert_template(key, value);
		}
		if self.insert_optimistic(&key, &value) {
			return Ok(());
		}
		self.insert_pessimistic(key, value)
	}

	/// Returns every value stored under `key`, possibly none.
	pub fn search(&self, key: &K) -> Vec<Value> {
		let guard = if self.is_template_mode() {
			self.find_leaf_template(key).read_arc()
		} else {
			self.latch_leaf_read(key)
		};
		let Node::Leaf(leaf) = &*guard else {
			return Vec::new();
		};
		leaf.values_of(key)
	}

	/// Returns every value whose key lies in `[left, right]`, in
	/// ascending key order.
	///
	/// Walks the leaf chain from the leaf owning `left`, coupling read
	/// latches, and stops at the first key past `right`. Concurrent
	/// inserts behind the scan's position are not re-observed.
	pub fn search_range(&self, left: &K, right: &K) -> Result<Vec<Value>> {
		if left > right {
			return Err(Error::InvalidRange(format!(
				"left key {left:?} exceeds right key {right:?}"
			)));
		}
		let mut out = Vec::new();
		let mut guard = if self.is_template_mode() {
			self.find_leaf_template(left).read_arc()
		} else {
			self.latch_leaf_read(left)
		};
		loop {
			let next = {
				let Node::Leaf(leaf) = &*guard else {
					return Err(Error::Corruption("range scan reached an inner node".into()));
				};
				let mut past_right = false;
				for (key, values) in leaf.keys.iter().zip(&leaf.values) {
					if key < left {
						continue;
					}
					if key > right {
						past_right = true;
						break;
					}
					out.extend(values.iter().cloned());
				}
				if past_right {
					None
				} else {
					leaf.next.clone()
				}
			};
			match next {
				// The next leaf is latched before the current one is let go.
				Some(next_ref) => guard = next_ref.read_arc(),
				None => return Ok(out),
			}
		}
	}

	/// Removes `key` and every value under it, returning whether the key
	/// was present.
	///
	/// Callers serialize deletes externally. The descent still write
	/// latches the whole path, so deletes interleave correctly with
	/// concurrent searches and inserts.
	pub fn delete(&self, key: &K) -> Result<bool> {
		let mut path: Vec<WriteLatch<K>> = Vec::new();
		let mut current = self.latch_root_write();
		loop {
			let next = match &*current {
				Node::Inner(inner) => Some(inner.child(inner.route(key))),
				Node::Leaf(_) => None,
			};
			let Some(child_ref) = next else { break };
			let child_guard = child_ref.write_arc();
			path.push(current);
			current = child_guard;
		}

		let removed = {
			let Node::Leaf(leaf) = &mut *current else {
				return Err(Error::Corruption("descent ended on an inner node".into()));
			};
			leaf.remove(key)
		};
		let Some(values) = removed else {
			return Ok(false);
		};
		let mut freed = K::ENCODED_LEN + VALUE_COUNT_SIZE;
		for value in &values {
			freed += VALUE_LEN_SIZE + value.len();
		}
		self.counter.sub(freed);

		// A templated tree keeps its shape; only the payload shrinks.
		if self.is_template_mode() {
			return Ok(true);
		}

		self.rebalance_upward(current, path)?;
		Ok(true)
	}

	/// Re-enters template mode, emptying every leaf while keeping the
	/// inner skeleton, and rebases the byte counter on the structural
	/// footprint. Quiescent operation, owned by the chunk lifecycle.
	pub fn clear_payload(&self) {
		self.set_template_mode(true);
		let mut bytes = TREE_HEADER_SIZE;
		let mut queue = VecDeque::new();
		queue.push_back(self.root.load_full());
		while let Some(node_ref) = queue.pop_front() {
			let mut guard = node_ref.write_arc();
			match &mut *guard {
				Node::Inner(inner) => {
					bytes += NODE_HEADER_SIZE + inner.keys.len() * K::ENCODED_LEN;
					for child in &inner.children {
						queue.push_back(NodeRef::clone(child));
					}
				}
				Node::Leaf(leaf) => {
					bytes += NODE_HEADER_SIZE;
					leaf.keys.clear();
					leaf.values.clear();
				}
			}
		}
		self.counter.set_bytes(bytes);
	}

	/// Breadth-first flat encoding of the whole tree.
	///
	/// The returned buffer's length equals [`total_bytes`](Self::total_bytes)
	/// when no insert or delete is in flight.
	pub fn serialize(&self) -> Value {
		let mut payload = BytesMut::with_capacity(self.total_bytes().saturating_sub(TREE_HEADER_SIZE));
		let mut node_count: u32 = 0;
		let mut queue = VecDeque::new();
		queue.push_back(self.root.load_full());
		while let Some(node_ref) = queue.pop_front() {
			let guard = node_ref.read_arc();
			node_count += 1;
			guard.encode_into(&mut payload);
			if let Node::Inner(inner) = &*guard {
				for child in &inner.children {
					queue.push_back(NodeRef::clone(child));
				}
			}
		}

		let crc = crc32fast::hash(&payload);
		let mut buf = BytesMut::with_capacity(TREE_HEADER_SIZE + payload.len());
		buf.put_slice(&MAGIC);
		buf.put_u32_le(VERSION);
		buf.put_u16_le(self.opts.order);
		buf.put_u16_le(self.height() as u16);
		buf.put_u32_le(node_count);
		buf.put_u32_le(crc);
		buf.unsplit(payload);
		buf.freeze()
	}

	/// Reconstructs a live tree from a [`serialize`](Self::serialize)d
	/// buffer, validating magic, version and checksum. The encoded order
	/// must match `opts.order`.
	pub fn deserialize(buf: &[u8], opts: Options) -> Result<BPlusTree<K>> {
		assert!(opts.order >= 3, "tree order must be at least 3");
		if buf.len() < TREE_HEADER_SIZE {
			return Err(Error::Deserialization("truncated tree header".into()));
		}
		let mut slice = buf;
		let mut magic = [0u8; 8];
		slice.copy_to_slice(&mut magic);
		if magic != MAGIC {
			return Err(Error::Deserialization("bad magic".into()));
		}
		let version = slice.get_u32_le();
		if version != VERSION {
			return Err(Error::Deserialization(format!("unsupported version {version}")));
		}
		let order = slice.get_u16_le();
		if order != opts.order {
			return Err(Error::Deserialization(format!(
				"tree was encoded with order {order}, options say {}",
				opts.order
			)));
		}
		let height = slice.get_u16_le() as u32;
		let node_count = slice.get_u32_le() as usize;
		let crc = slice.get_u32_le();
		if crc32fast::hash(slice) != crc {
			return Err(Error::Deserialization("checksum mismatch".into()));
		}
		if height == 0 || node_count == 0 {
			return Err(Error::Deserialization("empty tree frame".into()));
		}

		let mut raw = Vec::with_capacity(node_count);
		for _ in 0..node_count {
			raw.push(decode_raw_node::<K>(&mut slice)?);
		}
		if !slice.is_empty() {
			return Err(Error::Deserialization("trailing bytes after last node".into()));
		}

		// Nodes first, children wired afterwards: a breadth-first encoding
		// lists every inner node before any of its children, and an inner
		// node with k keys owns exactly k + 1 of the nodes that follow.
		let mut nodes: Vec<NodeRef<K>> = Vec::with_capacity(node_count);
		for (i, node) in raw.into_iter().enumerate() {
			let id = (i + 1) as u64;
			let node = match node {
				RawNode::Inner {
					keys,
				} => Node::Inner(InnerNode {
					id,
					parent_id: 0,
					level: 0,
					keys,
					children: Vec::new(),
				}),
				RawNode::Leaf {
					keys,
					values,
				} => Node::Leaf(LeafNode {
					id,
					parent_id: 0,
					keys,
					values,
					next: None,
				}),
			};
			nodes.push(new_node_ref(node));
		}

		let mut depth = vec![0u32; node_count];
		let mut leaves: Vec<NodeRef<K>> = Vec::new();
		let mut next_child = 1usize;
		for i in 0..node_count {
			if i > 0 && i >= next_child {
				return Err(Error::Deserialization("node not referenced by any parent".into()));
			}
			let mut guard = nodes[i].write();
			match &mut *guard {
				Node::Inner(inner) => {
					let level = height - 1 - depth[i];
					if level == 0 {
						return Err(Error::Deserialization("inner node at leaf depth".into()));
					}
					inner.level = level as u16;
					let child_count = inner.keys.len() + 1;
					if next_child + child_count > node_count {
						return Err(Error::Deserialization("node count falls short".into()));
					}
					for j in next_child..next_child + child_count {
						depth[j] = depth[i] + 1;
						nodes[j].write().set_parent_id(inner.id);
						inner.children.push(NodeRef::clone(&nodes[j]));
					}
					next_child += child_count;
				}
				Node::Leaf(_) => {
					if depth[i] + 1 != height {
						return Err(Error::Deserialization("leaf at the wrong depth".into()));
					}
					leaves.push(NodeRef::clone(&nodes[i]));
				}
			}
		}
		if next_child != node_count {
			return Err(Error::Deserialization("unreferenced trailing nodes".into()));
		}

		// Breadth-first order lists the leaf level left to right, which is
		// exactly the sibling chain.
		for pair in leaves.windows(2) {
			if let Node::Leaf(leaf) = &mut *pair[0].write() {
				leaf.next = Some(NodeRef::clone(&pair[1]));
			}
		}

		let tree = BPlusTree {
			root: ArcSwap::new(NodeRef::clone(&nodes[0])),
			opts,
			counter: BytesCounter::new(buf.len()),
			splits: SplitCounter::new(),
			template_mode: AtomicBool::new(false),
			next_node_id: AtomicU64::new(node_count as u64 + 1),
		};
		tree.counter.set_height(height);
		Ok(tree)
	}

	/// Full structural diagnostic: sortedness, fanout bounds, levels,
	/// parent back-references, the leaf chain and both counters. Meant
	/// for quiescent points; latches nodes one at a time.
	pub fn validate(&self) -> Result<()> {
		let root_ref = self.root.load_full();
		let height = self.height();
		let mut leaves: Vec<NodeRef<K>> = Vec::new();
		let mut bytes = TREE_HEADER_SIZE;
		self.validate_node(&root_ref, 0, None, None, 0, height, &mut leaves, &mut bytes)?;

		for pair in leaves.windows(2) {
			let guard = pair[0].read();
			let Node::Leaf(leaf) = &*guard else { continue };
			let chained = leaf.next.as_ref().is_some_and(|n| NodeRef::ptr_eq(n, &pair[1]));
			if !chained {
				return Err(Error::Corruption("leaf chain diverges from key order".into()));
			}
		}
		if let Some(last) = leaves.last() {
			if let Node::Leaf(leaf) = &*last.read() {
				if leaf.next.is_some() {
					return Err(Error::Corruption("leaf chain extends past the last leaf".into()));
				}
			}
		}

		if bytes != self.total_bytes() {
			return Err(Error::Corruption(format!(
				"byte counter reads {} but the tree serializes to {bytes}",
				self.total_bytes()
			)));
		}
		Ok(())
	}

	#[allow(clippy::too_many_arguments)]
	fn validate_node(
		&self,
		node_ref: &NodeRef<K>,
		expected_parent: u64,
		lower: Option<&K>,
		upper: Option<&K>,
		depth: u32,
		height: u32,
		leaves: &mut Vec<NodeRef<K>>,
		bytes: &mut usize,
	) -> Result<()> {
		let order = self.opts.order as usize;
		let is_root = depth == 0;
		let guard = node_ref.read();

		if guard.parent_id() != expected_parent {
			return Err(Error::Corruption(format!(
				"node {} points at parent {} instead of {}",
				guard.id(),
				guard.parent_id(),
				expected_parent
			)));
		}
		let keys = match &*guard {
			Node::Inner(inner) => &inner.keys,
			Node::Leaf(leaf) => &leaf.keys,
		};
		for pair in keys.windows(2) {
			if pair[0] >= pair[1] {
				return Err(Error::Corruption(format!("node {} keys out of order", guard.id())));
			}
		}
		// Subtree bounds: lower inclusive, upper exclusive, because a key
		// equal to a separator routes right of it.
		if let (Some(low), Some(first)) = (lower, keys.first()) {
			if first < low {
				return Err(Error::Corruption(format!("node {} underruns its subtree", guard.id())));
			}
		}
		if let (Some(high), Some(last)) = (upper, keys.last()) {
			if last >= high {
				return Err(Error::Corruption(format!("node {} overruns its subtree", guard.id())));
			}
		}

		match &*guard {
			Node::Inner(inner) => {
				if depth + 1 >= height {
					return Err(Error::Corruption(format!("inner node {} at leaf depth", inner.id)));
				}
				if inner.level as u32 != height - 1 - depth {
					return Err(Error::Corruption(format!("node {} level mismatch", inner.id)));
				}
				if inner.children.len() != inner.keys.len() + 1 {
					return Err(Error::Corruption(format!(
						"node {} holds {} keys but {} children",
						inner.id,
						inner.keys.len(),
						inner.children.len()
					)));
				}
				let min = if is_root { 2 } else { min_inner_children(order) };
				if inner.children.len() > order || inner.children.len() < min {
					return Err(Error::Corruption(format!(
						"node {} fanout {} outside [{min}, {order}]",
						inner.id,
						inner.children.len()
					)));
				}
				*bytes += guard.encoded_len();
				for (i, child) in inner.children.iter().enumerate() {
					let low = if i == 0 { lower } else { Some(&inner.keys[i - 1]) };
					let high = if i == inner.keys.len() { upper } else { Some(&inner.keys[i]) };
					self.validate_node(child, inner.id, low, high, depth + 1, height, leaves, bytes)?;
				}
			}
			Node::Leaf(leaf) => {
				if depth + 1 != height {
					return Err(Error::Corruption(format!("leaf {} at the wrong depth", leaf.id)));
				}
				if leaf.values.len() != leaf.keys.len() {
					return Err(Error::Corruption(format!(
						"leaf {} holds {} keys but {} value lists",
						leaf.id,
						leaf.keys.len(),
						leaf.values.len()
					)));
				}
				if leaf.values.iter().any(|values| values.is_empty()) {
					return Err(Error::Corruption(format!("leaf {} holds an empty value list", leaf.id)));
				}
				// Template shapes hold cleared or overfull leaves on purpose.
				if !self.is_template_mode() {
					let too_full = leaf.keys.len() > max_leaf_keys(order);
					let too_empty = !is_root && leaf.keys.len() < min_leaf_keys(order);
					if too_full || too_empty {
						return Err(Error::Corruption(format!(
							"leaf {} occupancy {} outside its bounds",
							leaf.id,
							leaf.keys.len()
						)));
					}
				}
				*bytes += guard.encoded_len();
				leaves.push(NodeRef::clone(node_ref));
			}
		}
		Ok(())
	}

	// ---- traversal protocols ----

	/// Latches the current root for reading, retrying until the latched
	/// node still is the root. Root replacement is a plain pointer swap,
	/// not protected by the old root's latch.
	fn latch_root_read(&self) -> ReadLatch<K> {
		loop {
			let candidate = self.root.load_full();
			let guard = candidate.read_arc();
			if Arc::ptr_eq(&candidate, &*self.root.load()) {
				return guard;
			}
			drop(guard);
		}
	}

	fn latch_root_write(&self) -> WriteLatch<K> {
		loop {
			let candidate = self.root.load_full();
			let guard = candidate.write_arc();
			if Arc::ptr_eq(&candidate, &*self.root.load()) {
				return guard;
			}
			drop(guard);
		}
	}

	/// Read-side crabbing descent to the leaf owning `key`.
	fn latch_leaf_read(&self, key: &K) -> ReadLatch<K> {
		let mut guard = self.latch_root_read();
		loop {
			let next = match &*guard {
				Node::Inner(inner) => Some(inner.child(inner.route(key))),
				Node::Leaf(_) => None,
			};
			let Some(child_ref) = next else {
				return guard;
			};
			// Child first, then the parent latch goes with the old guard.
			let child_guard = child_ref.read_arc();
			guard = child_guard;
		}
	}

	/// Latch-free descent through a frozen template shape.
	fn find_leaf_template(&self, key: &K) -> NodeRef<K> {
		let mut current = self.root.load_full();
		loop {
			let next = {
				let guard = current.read();
				match &*guard {
					Node::Inner(inner) => Some(inner.child(inner.route(key))),
					Node::Leaf(_) => None,
				}
			};
			match next {
				Some(child) => current = child,
				None => return current,
			}
		}
	}

	fn insert_template(&self, key: K, value: Value) -> Result<()> {
		let order = self.opts.order as usize;
		let leaf_ref = self.find_leaf_template(&key);
		let mut guard = leaf_ref.write_arc();
		let Node::Leaf(leaf) = &mut *guard else {
			return Err(Error::Corruption("template descent ended on an inner node".into()));
		};
		let value_len = value.len();
		let created = leaf.insert(key, value);
		self.counter.add(Self::insert_delta(created, value_len));
		if leaf.keys.len() > max_leaf_keys(order) {
			self.splits.record();
		}
		Ok(())
	}

	/// Optimistic insert: read latches down, a write latch only on the
	/// leaf. Returns `false` to signal fallback; that is an expected
	/// outcome, not a failure.
	fn insert_optimistic(&self, key: &K, value: &Value) -> bool {
		let order = self.opts.order as usize;
		let mut guard = self.latch_root_read();
		loop {
			let step = match &*guard {
				// A lone leaf root can push a split into a root swap, which
				// only the pessimistic protocol may perform.
				Node::Leaf(_) => return false,
				Node::Inner(inner) => (inner.child(inner.route(key)), inner.level == 1),
			};
			let (child_ref, child_is_leaf) = step;
			if child_is_leaf {
				let mut leaf_guard = child_ref.write_arc();
				drop(guard);
				// Safety is judged only now, under the leaf's write latch; a
				// verdict formed before the latch was held can be stale by
				// the time it is granted.
				if !leaf_guard.is_insert_safe(key, order) {
					return false;
				}
				if let Node::Leaf(leaf) = &mut *leaf_guard {
					let created = leaf.insert(key.clone(), value.clone());
					self.counter.add(Self::insert_delta(created, value.len()));
					return true;
				}
				return false;
			}
			let child_guard = child_ref.read_arc();
			guard = child_guard;
		}
	}

	/// Pessimistic insert: write latches down, early-releasing everything
	/// above the lowest safe node, then a split cascade that may end in a
	/// root swap.
	fn insert_pessimistic(&self, key: K, value: Value) -> Result<()> {
		let order = self.opts.order as usize;
		let mut ancestors = AncestorLatches::new();
		let mut current = self.latch_root_write();
		loop {
			let next = match &*current {
				Node::Inner(inner) => Some(inner.child(inner.route(&key))),
				Node::Leaf(_) => None,
			};
			let Some(child_ref) = next else { break };
			let child_guard = child_ref.write_arc();
			if child_guard.is_insert_safe(&key, order) {
				// A split cannot reach past a safe child.
				ancestors.release_all();
			} else {
				ancestors.push(current);
			}
			current = child_guard;
		}

		let value_len = value.len();
		let created = {
			let Node::Leaf(leaf) = &mut *current else {
				return Err(Error::Corruption("descent ended on an inner node".into()));
			};
			leaf.insert(key, value)
		};
		self.counter.add(Self::insert_delta(created, value_len));
		if !current.is_overflow(order) {
			return Ok(());
		}
		self.split_upward(current, &mut ancestors)
	}

	/// Splits the overflowing leaf and walks the new separators up the
	/// retained ancestor latches, swapping in a new root if the cascade
	/// reaches the top.
	fn split_upward(&self, leaf: WriteLatch<K>, ancestors: &mut AncestorLatches<K>) -> Result<()> {
		let order = self.opts.order as usize;
		let mut held: Vec<WriteLatch<K>> = Vec::new();
		let mut lower = leaf;
		loop {
			let (separator, right_ref) = self.split_node(&mut lower, &mut held);
			match ancestors.pop() {
				Some(mut parent) => {
					let lower_ref = latched_ref(&lower);
					{
						let Node::Inner(inner) = &mut *parent else {
							return Err(Error::Corruption("leaf on the ancestor path".into()));
						};
						let Some(idx) = inner.position_of_child(&lower_ref) else {
							return Err(Error::Corruption(
								"split child missing from its parent".into(),
							));
						};
						inner.insert_child(idx, separator, right_ref);
					}
					self.counter.add(K::ENCODED_LEN);
					held.push(lower);
					if !parent.is_overflow(order) {
						break;
					}
					lower = parent;
				}
				None => {
					// The node that split was the root itself.
					let root_id = self.next_id();
					let left_ref = latched_ref(&lower);
					let level = lower.level() + 1;
					lower.set_parent_id(root_id);
					right_ref.write_arc().set_parent_id(root_id);
					let new_root = new_node_ref(Node::Inner(InnerNode {
						id: root_id,
						parent_id: 0,
						level,
						keys: vec![separator],
						children: vec![left_ref, right_ref],
					}));
					self.root.store(new_root);
					self.counter.add(NODE_HEADER_SIZE + K::ENCODED_LEN);
					self.counter.increase_height();
					held.push(lower);
					break;
				}
			}
		}
		ancestors.release_all();
		// Intermediates go first; the leaf's latch is released last.
		while let Some(guard) = held.pop() {
			drop(guard);
		}
		Ok(())
	}

	/// Splits the latched node in half, returning the separator and the
	/// new right sibling. The sibling is unreachable to other threads
	/// until it is spliced into a latched parent.
	fn split_node(&self, guard: &mut WriteLatch<K>, held: &mut [WriteLatch<K>]) -> (K, NodeRef<K>) {
		let right_id = self.next_id();
		match &mut **guard {
			Node::Leaf(leaf) => {
				let (separator, right) = leaf.split(right_id);
				let right_ref = new_node_ref(Node::Leaf(right));
				leaf.next = Some(NodeRef::clone(&right_ref));
				self.counter.add(NODE_HEADER_SIZE);
				(separator, right_ref)
			}
			Node::Inner(inner) => {
				let (median, right) = inner.split(right_id);
				for child in &right.children {
					Self::rehome(child, right_id, held);
				}
				let right_ref = new_node_ref(Node::Inner(right));
				// The median moved out of this node; it is re-counted when
				// it lands in the parent.
				self.counter.add(NODE_HEADER_SIZE);
				self.counter.sub(K::ENCODED_LEN);
				(median, right_ref)
			}
		}
	}

	/// Walks underflow repair up the held path after a delete: borrow
	/// from a sibling when one can lend, merge otherwise, and collapse
	/// the root when an inner root is left with a single child.
	fn rebalance_upward(&self, current: WriteLatch<K>, mut path: Vec<WriteLatch<K>>) -> Result<()> {
		let order = self.opts.order as usize;
		let mut held: Vec<WriteLatch<K>> = Vec::new();
		let mut current = current;
		loop {
			let Some(mut parent) = path.pop() else {
				let collapse = match &*current {
					Node::Inner(inner) if inner.children.len() == 1 => Some(inner.child(0)),
					_ => None,
				};
				if let Some(child_ref) = collapse {
					Self::rehome(&child_ref, 0, &mut held);
					self.root.store(NodeRef::clone(&child_ref));
					self.counter.sub(NODE_HEADER_SIZE);
					self.counter.decrease_height();
				}
				break;
			};

			if !current.is_underflow(order) {
				break;
			}

			let current_ref = latched_ref(&current);
			let (idx, sibling_ref, from_left) = {
				let Node::Inner(inner) = &*parent else {
					return Err(Error::Corruption("leaf on the rebalancing path".into()));
				};
				let Some(idx) = inner.position_of_child(&current_ref) else {
					return Err(Error::Corruption(
						"underflowing child missing from its parent".into(),
					));
				};
				if inner.children.len() < 2 {
					return Err(Error::Corruption("non-root inner node with a single child".into()));
				}
				if idx > 0 {
					(idx, inner.child(idx - 1), true)
				} else {
					(idx, inner.child(idx + 1), false)
				}
			};
			let mut sibling = sibling_ref.write_arc();

			if sibling.can_lend(order) {
				self.redistribute(&mut parent, &mut current, &mut sibling, idx, from_left, &mut held)?;
				break;
			}

			self.merge(&mut parent, &mut current, &mut sibling, idx, from_left, &mut held)?;
			held.push(current);
			held.push(sibling);
			current = parent;
		}
		Ok(())
	}

	/// Moves one entry from a sibling that can spare it, rotating the
	/// separator in the parent. Nothing above the parent changes.
	fn redistribute(
		&self,
		parent: &mut WriteLatch<K>,
		current: &mut WriteLatch<K>,
		sibling: &mut WriteLatch<K>,
		idx: usize,
		from_left: bool,
		held: &mut [WriteLatch<K>],
	) -> Result<()> {
		let slot = if from_left { idx - 1 } else { idx };
		match (&mut **parent, &mut **current, &mut **sibling) {
			(Node::Inner(parent), Node::Leaf(current), Node::Leaf(sibling)) => {
				let separator = if from_left {
					current.rotate_from_left(sibling)
				} else {
					current.rotate_from_right(sibling)
				};
				let Some(separator) = separator else {
					return Err(Error::Corruption("lending sibling had nothing to lend".into()));
				};
				parent.keys[slot] = separator;
			}
			(Node::Inner(parent), Node::Inner(current), Node::Inner(sibling)) => {
				let current_id = current.id;
				let moved = if from_left {
					current.rotate_from_left(sibling, &mut parent.keys[slot])
				} else {
					current.rotate_from_right(sibling, &mut parent.keys[slot])
				};
				let Some(moved) = moved else {
					return Err(Error::Corruption("lending sibling had nothing to lend".into()));
				};
				Self::rehome(&moved, current_id, held);
			}
			_ => return Err(Error::Corruption("sibling variants diverge".into())),
		}
		Ok(())
	}

	/// Merges the underflowing node with its sibling, pulling the
	/// separator out of (leaves) or down from (inner nodes) the parent.
	fn merge(
		&self,
		parent: &mut WriteLatch<K>,
		current: &mut WriteLatch<K>,
		sibling: &mut WriteLatch<K>,
		idx: usize,
		from_left: bool,
		held: &mut [WriteLatch<K>],
	) -> Result<()> {
		match (&mut **parent, &mut **current, &mut **sibling) {
			(Node::Inner(parent), Node::Leaf(current), Node::Leaf(sibling)) => {
				if from_left {
					sibling.absorb_right(current);
					parent.keys.remove(idx - 1);
					parent.children.remove(idx);
				} else {
					current.absorb_right(sibling);
					parent.keys.remove(idx);
					parent.children.remove(idx + 1);
				}
				self.counter.sub(NODE_HEADER_SIZE + K::ENCODED_LEN);
			}
			(Node::Inner(parent), Node::Inner(current), Node::Inner(sibling)) => {
				if from_left {
					let separator = parent.keys.remove(idx - 1);
					let moved: Vec<NodeRef<K>> = current.children.clone();
					let sibling_id = sibling.id;
					sibling.absorb_right(separator, current);
					parent.children.remove(idx);
					for child in &moved {
						Self::rehome(child, sibling_id, held);
					}
				} else {
					let separator = parent.keys.remove(idx);
					let moved: Vec<NodeRef<K>> = sibling.children.clone();
					let current_id = current.id;
					current.absorb_right(separator, sibling);
					parent.children.remove(idx + 1);
					for child in &moved {
						Self::rehome(child, current_id, held);
					}
				}
				// The separator moved down with the merge; only the dead
				// node's header leaves the footprint.
				self.counter.sub(NODE_HEADER_SIZE);
			}
			_ => return Err(Error::Corruption("sibling variants diverge".into())),
		}
		Ok(())
	}

	/// Repoints a child's diagnostic parent back-reference, going through
	/// an already-held latch when the caller owns one on that child.
	fn rehome(child: &NodeRef<K>, parent_id: u64, held: &mut [WriteLatch<K>]) {
		if let Some(guard) = held.iter_mut().find(|guard| holds(guard, child)) {
			guard.set_parent_id(parent_id);
		} else {
			child.write_arc().set_parent_id(parent_id);
		}
	}

	fn next_id(&self) -> u64 {
		self.next_node_id.fetch_add(1, Ordering::Relaxed)
	}

	fn insert_delta(created_key: bool, value_len: usize) -> usize {
		if created_key {
			live_insert_estimate::<K>(value_len)
		} else {
			VALUE_LEN_SIZE + value_len
		}
	}
}
