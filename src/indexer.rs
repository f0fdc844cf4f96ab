//! Chunk indexer: the worker-side glue between tuple ingestion and the
//! tree.
//!
//! Ingested tuples accumulate in one tree per chunk. Before each insert
//! the indexer asks the tree what the entry will cost and flushes the
//! chunk once the next insert would push it past the byte budget (or the
//! tuple cap). A flushed chunk is the tree's serialized form, handed to a
//! [`FlushSink`] together with its key range; what the sink does with it
//! is not this crate's concern.
//!
//! The first chunk is built live, splitting as it grows. Its final shape
//! is then frozen as the template: every following chunk is poured into
//! the same skeleton without any restructuring, and the tree counts the
//! splits that would have happened. When that count grows past the
//! configured share of the chunk's tuples, the template has stopped
//! fitting the data distribution and the next chunk is built live again.

use crate::error::{Error, Result};
use crate::key::IndexKey;
use crate::option::Options;
use crate::tree::BPlusTree;
use crate::Value;

/// Descriptor of one flushed chunk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkMeta<K> {
	/// Indexing task that produced the chunk.
	pub task_id: u32,
	/// Position of the chunk in the task's flush order, starting at 0.
	pub sequence: u64,
	/// Number of tuples indexed into the chunk.
	pub tuples: u64,
	/// Smallest key present in the chunk.
	pub min_key: K,
	/// Largest key present in the chunk.
	pub max_key: K,
}

/// Receives serialized chunks. Implemented by the persistence
/// collaborator; the chunk bytes round-trip through
/// [`BPlusTree::deserialize`].
pub trait FlushSink<K: IndexKey> {
	fn flush_chunk(&mut self, meta: ChunkMeta<K>, chunk: Value) -> Result<()>;
}

/// Builder for a [`ChunkIndexer`].
pub struct ChunkIndexerBuilder<K: IndexKey, S: FlushSink<K>> {
	task_id: u32,
	opts: Options,
	sink: S,
	_marker: std::marker::PhantomData<K>,
}

impl<K: IndexKey, S: FlushSink<K>> ChunkIndexerBuilder<K, S> {
	pub fn new(sink: S) -> Self {
		ChunkIndexerBuilder {
			task_id: 0,
			opts: Options::default(),
			sink,
			_marker: std::marker::PhantomData,
		}
	}

	pub fn with_task_id(mut self, task_id: u32) -> Self {
		self.task_id = task_id;
		self
	}

	pub fn with_options(mut self, opts: Options) -> Self {
		self.opts = opts;
		self
	}

	pub fn build(self) -> ChunkIndexer<K, S> {
		let tree = BPlusTree::new(self.opts.clone());
		tree.set_template_mode(false);
		ChunkIndexer {
			task_id: self.task_id,
			opts: self.opts,
			sink: self.sink,
			tree,
			sequence: 0,
			tuples: 0,
			range: None,
			templated: false,
		}
	}
}

/// Indexes one stream partition's tuples into budget-sized chunks.
pub struct ChunkIndexer<K: IndexKey, S: FlushSink<K>> {
	task_id: u32,
	opts: Options,
	sink: S,
	tree: BPlusTree<K>,
	sequence: u64,
	tuples: u64,
	range: Option<(K, K)>,
	/// Whether the current tree shape is a frozen template.
	templated: bool,
}

impl<K: IndexKey, S: FlushSink<K>> ChunkIndexer<K, S> {
	/// Indexes one tuple's key and payload, flushing the running chunk
	/// first when this insert would no longer fit its budget.
	pub fn index(&mut self, key: K, value: Value) -> Result<()> {
		let estimate = self.tree.bytes_estimate_for_insert(value.len());
		if self.tree.total_bytes() + estimate > self.opts.chunk_bytes
			|| self.tuples >= self.opts.max_chunk_tuples
		{
			self.flush()?;
			let estimate = self.tree.bytes_estimate_for_insert(value.len());
			if self.tree.total_bytes() + estimate > self.opts.chunk_bytes {
				return Err(Error::ChunkOverflow {
					entry: estimate,
					budget: self.opts.chunk_bytes,
				});
			}
		}

		self.tree.insert(key.clone(), value)?;
		self.tuples += 1;
		self.range = Some(match self.range.take() {
			None => (key.clone(), key),
			Some((min, max)) => {
				let min = if key < min { key.clone() } else { min };
				let max = if key > max { key } else { max };
				(min, max)
			}
		});
		Ok(())
	}

	/// Serializes the running chunk into the sink and readies the tree
	/// for the next one. A chunk with no tuples is not flushed.
	pub fn flush(&mut self) -> Result<()> {
		let Some((min_key, max_key)) = self.range.take() else {
			return Ok(());
		};
		let chunk = self.tree.serialize();
		let tuples = std::mem::take(&mut self.tuples);
		log::debug!(
			"task {} flushing chunk {} ({} tuples, {} bytes)",
			self.task_id,
			self.sequence,
			tuples,
			chunk.len()
		);
		self.sink.flush_chunk(
			ChunkMeta {
				task_id: self.task_id,
				sequence: self.sequence,
				tuples,
				min_key,
				max_key,
			},
			chunk,
		)?;
		self.sequence += 1;

		if !self.templated {
			// The first live chunk's shape becomes the template.
			self.tree.clear_payload();
			self.templated = true;
		} else {
			let ratio = self.tree.split_count() as f64 / tuples as f64;
			if ratio >= self.opts.template_rebuild_threshold {
				log::info!(
					"task {} rebuilding template, split ratio {ratio:.2} over {tuples} tuples",
					self.task_id
				);
				let tree = BPlusTree::new(self.opts.clone());
				tree.set_template_mode(false);
				self.tree = tree;
				self.templated = false;
			} else {
				self.tree.clear_payload();
			}
		}
		self.tree.reset_split_count();
		Ok(())
	}

	/// The tree holding the chunk currently being built. Point and range
	/// queries over in-flight data go through here, concurrently with
	/// `index` calls only if the caller arranges shared access.
	pub fn tree(&self) -> &BPlusTree<K> {
		&self.tree
	}

	pub fn task_id(&self) -> u32 {
		self.task_id
	}

	/// Number of chunks flushed so far.
	pub fn flushed_chunks(&self) -> u64 {
		self.sequence
	}

	/// Tuples indexed into the chunk currently being built.
	pub fn pending_tuples(&self) -> u64 {
		self.tuples
	}
}
