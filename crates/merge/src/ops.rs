//! Merge operations as carried in document messages.

use std::collections::BTreeMap;

use quire_proto::{DocumentMessage, MessageContents, SequenceNumber};
use serde::{Deserialize, Serialize};

use crate::error::MergeError;

/// Properties attached to a run of text. A `null` value in an annotation
/// removes the key.
pub type PropertySet = BTreeMap<String, serde_json::Value>;

/// Applies `changes` onto `target`, deleting keys whose new value is `null`.
pub fn apply_properties(target: &mut PropertySet, changes: &PropertySet) {
	for (key, value) in changes {
		if value.is_null() {
			target.remove(key);
		} else {
			target.insert(key.clone(), value.clone());
		}
	}
}

/// An edit to the shared text. Positions count characters in the submitter's
/// view at its reference sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MergeOp {
	/// Insert `text` before position `pos`.
	Insert {
		/// Insertion point.
		pos: usize,
		/// Inserted text.
		text: String,
		/// Properties of the inserted text.
		#[serde(default, skip_serializing_if = "PropertySet::is_empty")]
		props: PropertySet,
	},
	/// Remove `start..end`.
	Remove {
		/// First removed position.
		start: usize,
		/// One past the last removed position.
		end: usize,
	},
	/// Merge `props` into every character of `start..end`.
	Annotate {
		/// First annotated position.
		start: usize,
		/// One past the last annotated position.
		end: usize,
		/// Property changes.
		props: PropertySet,
	},
}

impl MergeOp {
	/// Decodes the op carried by a message, if it carries one.
	///
	/// # Errors
	///
	/// [`MergeError::Decode`] when the payload is not a merge op.
	pub fn from_contents(contents: &MessageContents) -> Result<Option<Self>, MergeError> {
		match contents {
			MessageContents::Op(value) => serde_json::from_value(value.clone())
				.map(Some)
				.map_err(|err| MergeError::Decode(err.to_string())),
			_ => Ok(None),
		}
	}
}

/// A locally applied op awaiting submission, stamped with the counters the
/// orderer validates.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalOp {
	/// Client sequence number; acknowledgements are matched on it.
	pub client_sequence_number: i64,
	/// Last sequence number applied locally when the op was made.
	pub reference_sequence_number: SequenceNumber,
	/// The edit.
	pub op: MergeOp,
}

impl LocalOp {
	/// Wraps the op in a document message ready to submit for ordering.
	///
	/// # Errors
	///
	/// [`MergeError::Encode`] if the op cannot be serialized.
	pub fn to_document_message(&self) -> Result<DocumentMessage, MergeError> {
		let value = serde_json::to_value(&self.op).map_err(|err| MergeError::Encode(err.to_string()))?;
		Ok(DocumentMessage::new(
			self.client_sequence_number,
			self.reference_sequence_number,
			MessageContents::Op(value),
		))
	}
}
