use std::fmt;

/// Result returning Error
pub type Result<T> = std::result::Result<T, Error>;

/// `Error` is the error type for the index core.
///
/// Precondition violations and structural corruption are kept apart on
/// purpose: the former are caller bugs reported back to the caller, the
/// latter indicate a latch-protocol bug and must never be swallowed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
	/// A range query was issued with `left > right`.
	InvalidRange(String),
	/// The tree was observed in a state its invariants forbid while the
	/// relevant latches were held.
	Corruption(String),
	Serialization(String),
	Deserialization(String),
	/// A single entry is larger than the whole chunk byte budget.
	ChunkOverflow { entry: usize, budget: usize },
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::InvalidRange(msg) => write!(f, "Invalid range: {msg}"),
			Error::Corruption(msg) => write!(f, "Tree corruption detected: {msg}"),
			Error::Serialization(msg) => write!(f, "Serialization error: {msg}"),
			Error::Deserialization(msg) => write!(f, "Deserialization error: {msg}"),
			Error::ChunkOverflow { entry, budget } => {
				write!(f, "Entry of {entry} bytes exceeds the chunk budget of {budget} bytes")
			}
		}
	}
}

impl std::error::Error for Error {}
