//! In-memory concurrent B+ tree index core for a stream-indexing pipeline.
//!
//! Each indexing worker owns a [`BPlusTree`] over the index field of freshly
//! ingested tuples and answers point and range queries on it while inserts
//! are still arriving. The [`ChunkIndexer`] drives the tree through its
//! chunk lifecycle: batch inserts against a byte budget, serialize and hand
//! the chunk to a flush sink, and reuse the tree's shape as a template for
//! the next chunk.

mod counter;
mod latch;
mod node;

pub mod error;
pub mod indexer;
pub mod key;
pub mod option;
pub mod tree;

#[cfg(test)]
mod test;

pub use error::{Error, Result};
pub use indexer::{ChunkIndexer, ChunkIndexerBuilder, ChunkMeta, FlushSink};
pub use key::{F64Key, IndexKey};
pub use option::Options;
pub use tree::BPlusTree;

/// Value payload stored under an index key.
pub type Value = bytes::Bytes;
