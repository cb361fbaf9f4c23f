//! Error types for the ordering pipeline.

use quire_proto::{ConnectionId, DocumentKey, SubscriberId, Topic};
use thiserror::Error;

/// Contract violations reported by the [`TopicRouter`](crate::pubsub::TopicRouter).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouterError {
	/// Unsubscribe named a topic with no subscribers.
	#[error("unsubscribe from unknown topic {0}")]
	UnknownTopic(Topic),
	/// Unsubscribe named a subscriber not registered on the topic.
	#[error("subscriber {subscriber} is not subscribed to {topic}")]
	UnknownSubscriber {
		/// The topic.
		topic: Topic,
		/// The missing subscriber.
		subscriber: SubscriberId,
	},
}

/// Failures pushing into an in-memory log queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
	/// The queue was closed.
	#[error("queue closed")]
	Closed,
	/// The queue is at capacity.
	#[error("queue full")]
	Full,
}

/// Failures reported by storage collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
	/// The backing store rejected or could not serve the request.
	#[error("storage unavailable: {0}")]
	Unavailable(String),
}

/// Failures reported by a fan-out sink.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
	/// The durable store refused a write.
	#[error(transparent)]
	Storage(#[from] StorageError),
	/// The task dispatcher refused a task.
	#[error("task dispatch failed: {0}")]
	Dispatch(String),
}

/// Failures of the sequencer state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SequencerError {
	/// Input arrived after the document was closed.
	#[error("sequencer is closed")]
	Closed,
}

/// Failures surfaced by orderers, orderer connections and nodes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrdererError {
	/// The orderer was closed.
	#[error("orderer is closed")]
	Closed,
	/// The ingress queue is at capacity; retry later.
	#[error("ingress queue full")]
	QueueFull,
	/// The message contents exceed the configured limit.
	#[error("message of {size} bytes exceeds limit of {max} bytes")]
	MessageTooLarge {
		/// Serialized size of the contents.
		size: usize,
		/// Configured limit.
		max: usize,
	},
	/// The message contents could not be serialized.
	#[error("message encoding failed: {0}")]
	Encoding(String),
	/// `disconnect` was already called on this connection.
	#[error("connection already disconnected")]
	AlreadyDisconnected,
	/// A router contract violation.
	#[error(transparent)]
	Router(#[from] RouterError),
	/// A storage collaborator failed.
	#[error(transparent)]
	Storage(#[from] StorageError),
	/// An orderer for this document is already tracked on the node.
	#[error("orderer for {0} already tracked")]
	OrdererExists(DocumentKey),
	/// The node's directory record expired or its transport is gone.
	#[error("node {0} is not valid")]
	NodeInvalid(String),
	/// The node transport closed before the request completed.
	#[error("node transport closed")]
	TransportClosed,
	/// A `connected` message named a connection id that was never requested.
	#[error("no pending connection {0:?}")]
	UnknownConnection(ConnectionId),
	/// The peer sent a frame that breaks the node protocol.
	#[error("protocol violation: {0}")]
	Protocol(String),
	/// The peer node refused the connection.
	#[error("connect failed: {0}")]
	ConnectFailed(String),
}

impl From<QueueError> for OrdererError {
	fn from(err: QueueError) -> Self {
		match err {
			QueueError::Closed => Self::Closed,
			QueueError::Full => Self::QueueFull,
		}
	}
}

/// Failures loading an [`OrdererConfig`](crate::config::OrdererConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
	/// The TOML document is malformed or has wrongly typed fields.
	#[error("invalid orderer config: {0}")]
	Parse(#[from] toml::de::Error),
	/// A field holds a value the pipeline cannot run with.
	#[error("invalid value for {field}: {reason}")]
	Invalid {
		/// Offending field.
		field: &'static str,
		/// Why it was rejected.
		reason: &'static str,
	},
}
