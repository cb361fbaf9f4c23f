//! Merge client errors.

use thiserror::Error;

/// Failures of local edits and of applying sequenced messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MergeError {
	/// An insert position lies past the end of the local text.
	#[error("position {pos} out of bounds for length {len}")]
	PositionOutOfBounds {
		/// Requested position.
		pos: usize,
		/// Local text length.
		len: usize,
	},
	/// A range is empty, reversed or past the end of the local text.
	#[error("invalid range {start}..{end} for length {len}")]
	InvalidRange {
		/// Range start.
		start: usize,
		/// Range end (exclusive).
		end: usize,
		/// Local text length.
		len: usize,
	},
	/// Inserting empty text has no effect and is refused.
	#[error("cannot insert empty text")]
	EmptyText,
	/// A sequenced operation carried contents that are not a merge op.
	#[error("undecodable merge op: {0}")]
	Decode(String),
	/// A merge op could not be serialized.
	#[error("unencodable merge op: {0}")]
	Encode(String),
}
