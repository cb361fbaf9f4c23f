//! Wire types for document ordering and node-to-node proxying.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Client sequence number carried by system-generated messages.
pub const SYSTEM_CLIENT_SEQUENCE_NUMBER: i64 = -1;

/// Identity of a document within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
	/// Owning tenant.
	pub tenant_id: String,
	/// Document within the tenant.
	pub document_id: String,
}

impl DocumentKey {
	/// Builds a key from tenant and document ids.
	pub fn new(tenant_id: impl Into<String>, document_id: impl Into<String>) -> Self {
		Self {
			tenant_id: tenant_id.into(),
			document_id: document_id.into(),
		}
	}
}

impl fmt::Display for DocumentKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.tenant_id, self.document_id)
	}
}

/// Identity assigned to a client connection by the orderer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub String);

impl ClientId {
	/// Generates a fresh, globally unique client id.
	#[must_use]
	pub fn generate() -> Self {
		Self(uuid::Uuid::new_v4().to_string())
	}

	/// Returns the id as a string slice.
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl From<&str> for ClientId {
	fn from(value: &str) -> Self {
		Self(value.to_string())
	}
}

impl fmt::Display for ClientId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Identity of a subscriber registered with a topic router.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriberId(pub String);

impl From<&str> for SubscriberId {
	fn from(value: &str) -> Self {
		Self(value.to_string())
	}
}

impl fmt::Display for SubscriberId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Identifier of a logical connection multiplexed over a node transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

/// Position of an operation in a document's total order.
///
/// Strictly increases by one per sequenced operation.
#[derive(
	Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
	/// Returns the following sequence number.
	#[must_use]
	pub const fn next(self) -> Self {
		Self(self.0 + 1)
	}
}

impl fmt::Display for SequenceNumber {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// A named fan-out channel.
///
/// Topics are either `tenant/document` (every participant of a document) or
/// `client#id` (a single connection).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Topic(pub String);

impl Topic {
	/// Topic shared by every participant of a document.
	pub fn document(key: &DocumentKey) -> Self {
		Self(key.to_string())
	}

	/// Topic private to a single client connection.
	pub fn client(client_id: &ClientId) -> Self {
		Self(format!("client#{client_id}"))
	}

	/// Returns the topic name.
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for Topic {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// The authenticated user behind a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
	/// Stable user id.
	pub id: String,
	/// Optional display name.
	pub name: Option<String>,
}

impl User {
	/// Builds a user with the given id and no display name.
	pub fn new(id: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			name: None,
		}
	}
}

/// Details a client reports about itself when joining.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDetail {
	/// Client flavour (e.g. `browser`, `agent`).
	pub kind: String,
	/// Capabilities requested by the client.
	pub permission: Vec<String>,
}

/// Payload of a client join announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientJoin {
	/// The joining client.
	pub client_id: ClientId,
	/// Details reported by the client.
	pub detail: ClientDetail,
}

/// Timing annotation appended as a message moves through services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
	/// Service that recorded the trace.
	pub service: String,
	/// What the service did (e.g. `start`).
	pub action: String,
	/// Milliseconds since the Unix epoch, with sub-millisecond precision.
	pub timestamp: f64,
}

/// Discriminant of [`MessageContents`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
	/// Document edit.
	Operation,
	/// A client joined the document.
	ClientJoin,
	/// A client left the document.
	ClientLeave,
	/// Request for background agents to run tasks.
	RemoteHelp,
	/// Keep-alive with no document effect.
	NoOp,
}

/// Typed payload of a document message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "contents", rename_all = "snake_case")]
pub enum MessageContents {
	/// Document edit; the schema belongs to the edited data structure.
	Op(serde_json::Value),
	/// A client joined.
	ClientJoin(ClientJoin),
	/// A client left.
	ClientLeave(ClientId),
	/// Tasks that background agents should pick up for this document.
	RemoteHelp(Vec<String>),
	/// Keep-alive.
	NoOp,
}

impl MessageContents {
	/// Returns the message type of this payload.
	pub const fn kind(&self) -> MessageType {
		match self {
			Self::Op(_) => MessageType::Operation,
			Self::ClientJoin(_) => MessageType::ClientJoin,
			Self::ClientLeave(_) => MessageType::ClientLeave,
			Self::RemoteHelp(_) => MessageType::RemoteHelp,
			Self::NoOp => MessageType::NoOp,
		}
	}
}

/// A message submitted for ordering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMessage {
	/// Per-client submission counter; [`SYSTEM_CLIENT_SEQUENCE_NUMBER`] for system messages.
	pub client_sequence_number: i64,
	/// Last sequence number the client had observed; absent for system messages.
	pub reference_sequence_number: Option<SequenceNumber>,
	/// Typed payload.
	pub contents: MessageContents,
	/// Service timing annotations.
	pub traces: Vec<Trace>,
}

impl DocumentMessage {
	/// Builds a client-submitted message.
	pub fn new(
		client_sequence_number: i64,
		reference_sequence_number: SequenceNumber,
		contents: MessageContents,
	) -> Self {
		Self {
			client_sequence_number,
			reference_sequence_number: Some(reference_sequence_number),
			contents,
			traces: Vec::new(),
		}
	}

	/// Builds a system message (join, leave).
	pub fn system(contents: MessageContents) -> Self {
		Self {
			client_sequence_number: SYSTEM_CLIENT_SEQUENCE_NUMBER,
			reference_sequence_number: None,
			contents,
			traces: Vec::new(),
		}
	}
}

/// A message stamped with routing metadata, awaiting a sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawOperation {
	/// Target document.
	pub key: DocumentKey,
	/// Submitting client; `None` for system events.
	pub client_id: Option<ClientId>,
	/// User behind the submitting connection.
	pub user: User,
	/// Submission time in milliseconds since the Unix epoch.
	pub timestamp: i64,
	/// The submitted message.
	pub operation: DocumentMessage,
}

/// A raw operation after the sequencer assigned its total-order position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequencedOperation {
	/// Target document.
	pub key: DocumentKey,
	/// Submitting client; `None` for system events.
	pub client_id: Option<ClientId>,
	/// User behind the submitting connection.
	pub user: User,
	/// Submission time in milliseconds since the Unix epoch.
	pub timestamp: i64,
	/// The submitted message.
	pub operation: DocumentMessage,
	/// Assigned position in the document's total order.
	pub sequence_number: SequenceNumber,
	/// Lowest reference sequence number among connected clients.
	pub minimum_sequence_number: SequenceNumber,
}

impl SequencedOperation {
	/// Stamps a raw operation with its sequence bookkeeping.
	pub fn from_raw(
		raw: RawOperation,
		sequence_number: SequenceNumber,
		minimum_sequence_number: SequenceNumber,
	) -> Self {
		Self {
			key: raw.key,
			client_id: raw.client_id,
			user: raw.user,
			timestamp: raw.timestamp,
			operation: raw.operation,
			sequence_number,
			minimum_sequence_number,
		}
	}
}

/// Why the sequencer refused an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NackReason {
	/// The client never joined, already left, or timed out.
	UnknownClient,
	/// The reference sequence number is outside `[minimum, current]`.
	InvalidReferenceSequenceNumber {
		/// Reference sequence number carried by the operation.
		reference: Option<SequenceNumber>,
		/// Document minimum sequence number at rejection time.
		minimum: SequenceNumber,
		/// Document sequence number at rejection time.
		current: SequenceNumber,
	},
}

/// Rejection of a submitted operation, routed back to its client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NackMessage {
	/// Target document.
	pub key: DocumentKey,
	/// Rejected client.
	pub client_id: ClientId,
	/// The rejected message.
	pub operation: DocumentMessage,
	/// Rejection cause.
	pub reason: NackReason,
}

/// Event delivered to topic subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum Event {
	/// A sequenced operation for a document.
	Op(SequencedOperation),
	/// A rejection for one client.
	Nack(NackMessage),
}

/// Request to open a connection on a peer node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectMessage {
	/// Owning tenant.
	pub tenant_id: String,
	/// Document within the tenant.
	pub document_id: String,
	/// User behind the connection.
	pub user: User,
	/// Client details.
	pub client: ClientDetail,
}

/// Successful connection details reported by a peer node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedMessage {
	/// Client id assigned by the hosting orderer.
	pub client_id: ClientId,
	/// Whether the document existed before this connection.
	pub existing: bool,
	/// Parent document when the document is a branch.
	pub parent_branch: Option<DocumentKey>,
	/// Largest accepted serialized message contents, in bytes.
	pub max_message_size: usize,
}

/// A topic publish forwarded from a peer node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpMessage {
	/// Topic the event was published on.
	pub topic: Topic,
	/// The published event.
	pub event: Event,
}

/// Message kinds exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum NodeMessage {
	/// Open a connection to a document orderer.
	Connect(ConnectMessage),
	/// The connection is open.
	Connected(ConnectedMessage),
	/// The connection could not be opened.
	ConnectFailed {
		/// Human-readable cause.
		reason: String,
	},
	/// Submit a message for ordering.
	Order(DocumentMessage),
	/// Close the connection.
	Disconnect,
	/// Forwarded topic publish.
	Op(OpMessage),
}

/// Transport envelope: a message tagged with its logical connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFrame {
	/// Logical connection; absent for topic publishes.
	pub cid: Option<ConnectionId>,
	/// The message.
	pub message: NodeMessage,
}

/// Directory entry describing a node that hosts orderers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
	/// Node id.
	pub id: String,
	/// Address the node listens on.
	pub address: String,
	/// Lease deadline; the record is stale afterwards.
	pub expiration: DateTime<Utc>,
}

impl NodeRecord {
	/// Returns true once the lease deadline has passed.
	pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
		self.expiration < now
	}
}
