use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::key::IndexKey;

/// Fixed frame at the start of a serialized tree:
/// magic(8) + version(4) + order(2) + height(2) + node_count(4) + crc32(4).
pub(crate) const TREE_HEADER_SIZE: usize = 24;

/// Per-node header: tag(1) + key_count(4).
pub(crate) const NODE_HEADER_SIZE: usize = 5;

/// Per-leaf-entry count of values under one key.
pub(crate) const VALUE_COUNT_SIZE: usize = 4;

/// Length prefix of a single value payload.
pub(crate) const VALUE_LEN_SIZE: usize = 4;

/// Marginal serialized cost of inserting a fresh key with one value into a
/// live tree. Appending a value to an existing key costs less; the estimate
/// stays on the safe side for flush scheduling.
pub(crate) fn live_insert_estimate<K: IndexKey>(value_len: usize) -> usize {
	K::ENCODED_LEN + VALUE_COUNT_SIZE + VALUE_LEN_SIZE + value_len
}

/// Template-mode estimate: the live entry cost plus an amortized share of
/// the structural overhead (node header and separator) each half-full leaf
/// will carry once the batch is poured into a real tree.
pub(crate) fn template_insert_estimate<K: IndexKey>(order: u16, value_len: usize) -> usize {
	let min_fill = (order as usize / 2).max(1);
	live_insert_estimate::<K>(value_len) + (NODE_HEADER_SIZE + K::ENCODED_LEN).div_ceil(min_fill)
}

/// Tracks the exact serialized footprint of a tree and its height in levels.
///
/// Both counters are written under whichever latch covers the mutation that
/// changes them and read without latching; readers get a value that was
/// exact at some recent quiescent point, which is all flush scheduling
/// needs.
pub(crate) struct BytesCounter {
	bytes: AtomicU64,
	height: AtomicU32,
}

impl BytesCounter {
	pub(crate) fn new(initial_bytes: usize) -> Self {
		BytesCounter {
			bytes: AtomicU64::new(initial_bytes as u64),
			height: AtomicU32::new(1),
		}
	}

	pub(crate) fn add(&self, n: usize) {
		self.bytes.fetch_add(n as u64, Ordering::AcqRel);
	}

	pub(crate) fn sub(&self, n: usize) {
		self.bytes.fetch_sub(n as u64, Ordering::AcqRel);
	}

	pub(crate) fn bytes(&self) -> usize {
		self.bytes.load(Ordering::Acquire) as usize
	}

	pub(crate) fn set_bytes(&self, n: usize) {
		self.bytes.store(n as u64, Ordering::Release);
	}

	pub(crate) fn height(&self) -> u32 {
		self.height.load(Ordering::Acquire)
	}

	pub(crate) fn set_height(&self, h: u32) {
		self.height.store(h, Ordering::Release);
	}

	pub(crate) fn increase_height(&self) {
		self.height.fetch_add(1, Ordering::AcqRel);
	}

	pub(crate) fn decrease_height(&self) {
		self.height.fetch_sub(1, Ordering::AcqRel);
	}
}

/// Counts inserts that would have split a leaf while the tree is in
/// template mode. The ratio of this counter to the tuple count tells the
/// indexer when the template stopped fitting the data distribution.
pub(crate) struct SplitCounter {
	splits: AtomicU64,
}

impl SplitCounter {
	pub(crate) fn new() -> Self {
		SplitCounter {
			splits: AtomicU64::new(0),
		}
	}

	pub(crate) fn record(&self) {
		self.splits.fetch_add(1, Ordering::SeqCst);
	}

	pub(crate) fn get(&self) -> u64 {
		self.splits.load(Ordering::SeqCst)
	}

	pub(crate) fn reset(&self) {
		self.splits.store(0, Ordering::SeqCst);
	}
}
