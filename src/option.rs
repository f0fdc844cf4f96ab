/// Configuration for a tree and the chunk indexer driving it.
///
/// Passed by value at construction so that two workers in the same process
/// can run with different settings.
#[derive(Clone, Debug, PartialEq)]
pub struct Options {
	/// Maximum number of children an inner node may hold. Leaves hold at
	/// most `order - 1` keys. Must be at least 3.
	pub order: u16,

	/// Serialized byte budget of one chunk; the indexer flushes before an
	/// insert would push the tree past it.
	pub chunk_bytes: usize,

	/// Upper bound on tuples per chunk, whichever limit hits first.
	pub max_chunk_tuples: u64,

	/// When the ratio of would-be splits to tuples in a templated chunk
	/// reaches this threshold, the template no longer fits the data
	/// distribution and is rebuilt from the next chunk.
	pub template_rebuild_threshold: f64,
}

impl Default for Options {
	fn default() -> Self {
		Self {
			order: 4,
			chunk_bytes: 256_000,
			max_chunk_tuples: 200_000,
			template_rebuild_threshold: 0.5,
		}
	}
}

impl Options {
	/// Creates a new set of options with default values.
	pub fn new() -> Self {
		Self::default()
	}
}
