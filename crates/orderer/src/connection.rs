//! The connection contract shared by local and remote orderers.

use quire_proto::{ClientId, DocumentKey, DocumentMessage};

use crate::error::OrdererError;

/// A client's live connection to a document orderer.
///
/// Neither `order` nor `disconnect` suspends: both enqueue and return.
pub trait OrdererConnection: Send + Sync {
	/// Client id assigned by the orderer.
	fn client_id(&self) -> &ClientId;

	/// Whether the document existed before this connection was made.
	fn existing(&self) -> bool;

	/// Parent document when the document is a branch.
	fn parent_branch(&self) -> Option<&DocumentKey>;

	/// Largest accepted serialized message contents, in bytes.
	fn max_message_size(&self) -> usize;

	/// Submits a message for ordering.
	///
	/// # Errors
	///
	/// Fails when the message is too large, the ingress is full or closed, or
	/// the connection was already disconnected.
	fn order(&self, message: DocumentMessage) -> Result<(), OrdererError>;

	/// Leaves the document. May be called once.
	///
	/// # Errors
	///
	/// [`OrdererError::AlreadyDisconnected`] on a second call.
	fn disconnect(&self) -> Result<(), OrdererError>;
}
