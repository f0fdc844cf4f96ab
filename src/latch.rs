//! Per-node latches and the guard shapes used by the traversal protocols.
//!
//! Every node sits behind its own reader/writer latch. Guards own the node
//! reference (`arc_lock`), so they can cross call frames and be stored in
//! the pessimistic protocol's ancestor stack as plain data; releasing a
//! latch that is not held is unrepresentable.

use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

use crate::key::IndexKey;
use crate::node::Node;

/// Shared handle to a latched node.
pub(crate) type NodeRef<K> = Arc<RwLock<Node<K>>>;

pub(crate) type ReadLatch<K> = ArcRwLockReadGuard<RawRwLock, Node<K>>;
pub(crate) type WriteLatch<K> = ArcRwLockWriteGuard<RawRwLock, Node<K>>;

pub(crate) fn new_node_ref<K: IndexKey>(node: Node<K>) -> NodeRef<K> {
	Arc::new(RwLock::new(node))
}

/// The node reference a write latch is held on.
pub(crate) fn latched_ref<K: IndexKey>(guard: &WriteLatch<K>) -> NodeRef<K> {
	Arc::clone(ArcRwLockWriteGuard::rwlock(guard))
}

/// Whether `guard` is the latch held on `target`.
pub(crate) fn holds<K: IndexKey>(guard: &WriteLatch<K>, target: &NodeRef<K>) -> bool {
	Arc::ptr_eq(ArcRwLockWriteGuard::rwlock(guard), target)
}

/// Write latches accumulated on the path from the lowest unsafe ancestor
/// down to the current node during the pessimistic descent.
///
/// Latches of nodes above the lowest safe ancestor are released the moment
/// a safe child is latched; whatever remains at the leaf is exactly the set
/// a split cascade may need to touch.
pub(crate) struct AncestorLatches<K: IndexKey> {
	stack: Vec<WriteLatch<K>>,
}

impl<K: IndexKey> AncestorLatches<K> {
	pub(crate) fn new() -> Self {
		AncestorLatches { stack: Vec::new() }
	}

	pub(crate) fn push(&mut self, guard: WriteLatch<K>) {
		self.stack.push(guard);
	}

	/// Pops the nearest retained ancestor, deepest first.
	pub(crate) fn pop(&mut self) -> Option<WriteLatch<K>> {
		self.stack.pop()
	}

	pub(crate) fn release_all(&mut self) {
		self.stack.clear();
	}
}
