//! Proxy for orderers hosted on a peer node.
//!
//! Many logical connections share one [`NodeTransport`]; each gets a
//! connection id, allocated in increasing order for the lifetime of the
//! transport. A connect request parks a oneshot slot under its id until the
//! peer answers, and inbound `op` frames are fanned out through a local topic
//! table.
//!
//! # Invariants
//!
//! - A pending connect is resolved exactly once: by `connected`,
//!   `connect_failed`, or transport teardown.
//! - Route entries are registered before the connecting caller is resumed, so
//!   no op addressed to the new client can be missed once `connect` returns.
//! - Once invalid, a node never becomes valid again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use quire_proto::{
	ClientDetail, ClientId, ConnectMessage, ConnectedMessage, ConnectionId, DocumentKey,
	DocumentMessage, NodeFrame, NodeMessage, NodeRecord, OpMessage, Topic, User,
};
use tokio::sync::{mpsc, oneshot};

use crate::codec::NodeTransport;
use crate::config::OrdererConfig;
use crate::connection::OrdererConnection;
use crate::error::OrdererError;
use crate::pubsub::Subscriber;

type ConnectReply = oneshot::Sender<Result<ConnectedMessage, OrdererError>>;

struct PendingConnection {
	key: DocumentKey,
	subscriber: Arc<dyn Subscriber>,
	reply: ConnectReply,
}

struct RouteEntry {
	cid: ConnectionId,
	subscriber: Arc<dyn Subscriber>,
}

struct NodeState {
	valid: bool,
	next_cid: u64,
	pending: HashMap<ConnectionId, PendingConnection>,
	topics: HashMap<Topic, Vec<RouteEntry>>,
	orderers: HashSet<DocumentKey>,
	route_misses: HashMap<Topic, u32>,
}

impl NodeState {
	fn remove_routes(&mut self, cid: ConnectionId) {
		self.topics.retain(|_, entries| {
			entries.retain(|entry| entry.cid != cid);
			!entries.is_empty()
		});
	}
}

struct Inner {
	id: String,
	outbound: mpsc::UnboundedSender<NodeFrame>,
	state: Mutex<NodeState>,
	route_miss_warn_threshold: u32,
}

/// Handle to a peer node; cheap to clone.
#[derive(Clone)]
pub struct RemoteNode {
	inner: Arc<Inner>,
}

impl RemoteNode {
	/// Binds a node directory record to an open transport.
	///
	/// A record already expired at `now` yields a permanently invalid node and
	/// the transport is dropped. Otherwise a task pumps inbound frames until the
	/// transport closes, then fails every outstanding connect.
	pub fn from_record(
		record: &NodeRecord,
		transport: NodeTransport,
		now: DateTime<Utc>,
		config: &OrdererConfig,
	) -> Self {
		let valid = !record.is_expired(now);
		let NodeTransport {
			outbound,
			mut inbound,
		} = transport;

		let node = Self {
			inner: Arc::new(Inner {
				id: record.id.clone(),
				outbound,
				state: Mutex::new(NodeState {
					valid,
					next_cid: 0,
					pending: HashMap::new(),
					topics: HashMap::new(),
					orderers: HashSet::new(),
					route_misses: HashMap::new(),
				}),
				route_miss_warn_threshold: config.route_miss_warn_threshold,
			}),
		};

		if !valid {
			tracing::warn!(node = %record.id, expiration = %record.expiration, "node record expired");
			return node;
		}

		// Held weakly so dropping the last handle closes the outbound side.
		let weak = Arc::downgrade(&node.inner);
		tokio::spawn(async move {
			while let Some(frame) = inbound.recv().await {
				let Some(inner) = weak.upgrade() else {
					return;
				};
				if let Err(err) = inner.handle_frame(frame) {
					tracing::error!(node = %inner.id, error = %err, "protocol violation from peer");
				}
			}
			if let Some(inner) = weak.upgrade() {
				inner.teardown();
			}
		});
		node
	}

	/// Node id from the directory record.
	pub fn id(&self) -> &str {
		&self.inner.id
	}

	/// Returns true while the transport is live.
	pub fn is_valid(&self) -> bool {
		self.inner.state.lock().valid
	}

	/// Number of connects awaiting the peer's answer.
	pub fn pending_connects(&self) -> usize {
		self.inner.state.lock().pending.len()
	}

	/// Starts tracking the orderer for a document hosted on this node.
	///
	/// # Errors
	///
	/// [`OrdererError::OrdererExists`] when the document is already tracked.
	pub fn connect_orderer(
		&self,
		tenant_id: &str,
		document_id: &str,
	) -> Result<ProxyOrderer, OrdererError> {
		let key = DocumentKey::new(tenant_id, document_id);
		let mut state = self.inner.state.lock();
		if !state.orderers.insert(key.clone()) {
			tracing::error!(node = %self.inner.id, doc = %key, "orderer already tracked");
			return Err(OrdererError::OrdererExists(key));
		}
		Ok(ProxyOrderer {
			node: self.clone(),
			key,
		})
	}

	/// Opens a connection on the peer and waits for its answer.
	///
	/// # Errors
	///
	/// [`OrdererError::NodeInvalid`] for an invalid node,
	/// [`OrdererError::ConnectFailed`] when the peer refuses, and
	/// [`OrdererError::TransportClosed`] when the transport ends first.
	pub async fn connect(
		&self,
		key: DocumentKey,
		subscriber: Arc<dyn Subscriber>,
		user: User,
		client: ClientDetail,
	) -> Result<ProxyConnection, OrdererError> {
		let (reply, slot) = oneshot::channel();
		let cid = {
			let mut state = self.inner.state.lock();
			if !state.valid {
				return Err(OrdererError::NodeInvalid(self.inner.id.clone()));
			}
			state.next_cid += 1;
			let cid = ConnectionId(state.next_cid);
			state.pending.insert(
				cid,
				PendingConnection {
					key: key.clone(),
					subscriber,
					reply,
				},
			);
			cid
		};

		let request = NodeMessage::Connect(ConnectMessage {
			tenant_id: key.tenant_id.clone(),
			document_id: key.document_id.clone(),
			user,
			client,
		});
		if !self.inner.send(cid, request) {
			self.inner.state.lock().pending.remove(&cid);
			return Err(OrdererError::TransportClosed);
		}
		tracing::debug!(node = %self.inner.id, doc = %key, cid = cid.0, "connect requested");

		let connected = slot.await.map_err(|_| OrdererError::TransportClosed)??;
		Ok(ProxyConnection {
			node: Arc::clone(&self.inner),
			cid,
			key,
			connected,
			disconnected: AtomicBool::new(false),
		})
	}
}

impl Inner {
	fn send(&self, cid: ConnectionId, message: NodeMessage) -> bool {
		self.outbound
			.send(NodeFrame {
				cid: Some(cid),
				message,
			})
			.is_ok()
	}

	fn handle_frame(&self, frame: NodeFrame) -> Result<(), OrdererError> {
		match frame.message {
			NodeMessage::Connected(connected) => {
				let cid = frame
					.cid
					.ok_or_else(|| OrdererError::Protocol("connection reply without id".into()))?;
				self.resolve_connected(cid, connected)
			}
			NodeMessage::ConnectFailed { reason } => {
				let cid = frame
					.cid
					.ok_or_else(|| OrdererError::Protocol("connection reply without id".into()))?;
				let pending = self
					.state
					.lock()
					.pending
					.remove(&cid)
					.ok_or(OrdererError::UnknownConnection(cid))?;
				tracing::debug!(node = %self.id, doc = %pending.key, cid = cid.0, %reason, "connect refused");
				let _ = pending.reply.send(Err(OrdererError::ConnectFailed(reason)));
				Ok(())
			}
			NodeMessage::Op(OpMessage { topic, event }) => {
				self.route(&topic, &event);
				Ok(())
			}
			other => {
				tracing::warn!(node = %self.id, cid = ?frame.cid, frame = ?other, "unexpected frame from peer");
				Ok(())
			}
		}
	}

	fn resolve_connected(&self, cid: ConnectionId, connected: ConnectedMessage) -> Result<(), OrdererError> {
		let mut state = self.state.lock();
		let pending = state
			.pending
			.remove(&cid)
			.ok_or(OrdererError::UnknownConnection(cid))?;

		for topic in [Topic::client(&connected.client_id), Topic::document(&pending.key)] {
			state.topics.entry(topic).or_default().push(RouteEntry {
				cid,
				subscriber: Arc::clone(&pending.subscriber),
			});
		}
		tracing::debug!(
			node = %self.id,
			doc = %pending.key,
			cid = cid.0,
			client = %connected.client_id,
			"connected"
		);

		if pending.reply.send(Ok(connected)).is_err() {
			// The caller gave up; release the peer-side connection.
			state.remove_routes(cid);
			drop(state);
			self.send(cid, NodeMessage::Disconnect);
		}
		Ok(())
	}

	fn route(&self, topic: &Topic, event: &quire_proto::Event) {
		let targets: Vec<Arc<dyn Subscriber>> = {
			let mut state = self.state.lock();
			let routed: Option<Vec<Arc<dyn Subscriber>>> = state
				.topics
				.get(topic)
				.map(|entries| entries.iter().map(|entry| Arc::clone(&entry.subscriber)).collect());
			let Some(targets) = routed else {
				let misses = state.route_misses.entry(topic.clone()).or_insert(0);
				*misses += 1;
				if *misses >= self.route_miss_warn_threshold {
					tracing::warn!(
						node = %self.id,
						%topic,
						misses = *misses,
						"ops for unrouted topic; possible leaked subscription"
					);
					state.route_misses.remove(topic);
				} else {
					tracing::trace!(node = %self.id, %topic, "no route for op");
				}
				return;
			};
			state.route_misses.remove(topic);
			targets
		};

		for subscriber in targets {
			subscriber.send(topic, event);
		}
	}

	fn teardown(&self) {
		let pending: Vec<PendingConnection> = {
			let mut state = self.state.lock();
			state.valid = false;
			state.topics.clear();
			state.pending.drain().map(|(_, pending)| pending).collect()
		};
		tracing::debug!(node = %self.id, failed = pending.len(), "node transport closed");
		for pending in pending {
			let _ = pending.reply.send(Err(OrdererError::TransportClosed));
		}
	}
}

/// An orderer tracked on a [`RemoteNode`].
pub struct ProxyOrderer {
	node: RemoteNode,
	key: DocumentKey,
}

impl ProxyOrderer {
	/// Document served by the orderer.
	pub fn key(&self) -> &DocumentKey {
		&self.key
	}

	/// Opens a connection through the owning node.
	///
	/// # Errors
	///
	/// See [`RemoteNode::connect`].
	pub async fn connect(
		&self,
		subscriber: Arc<dyn Subscriber>,
		user: User,
		client: ClientDetail,
	) -> Result<ProxyConnection, OrdererError> {
		self.node.connect(self.key.clone(), subscriber, user, client).await
	}

	/// Stops tracking the orderer so it may be connected again.
	pub fn close(self) {
		self.node.inner.state.lock().orderers.remove(&self.key);
	}
}

/// A client connection multiplexed over a node transport.
pub struct ProxyConnection {
	node: Arc<Inner>,
	cid: ConnectionId,
	key: DocumentKey,
	connected: ConnectedMessage,
	disconnected: AtomicBool,
}

impl ProxyConnection {
	/// Connection id on the transport.
	pub fn connection_id(&self) -> ConnectionId {
		self.cid
	}
}

impl OrdererConnection for ProxyConnection {
	fn client_id(&self) -> &ClientId {
		&self.connected.client_id
	}

	fn existing(&self) -> bool {
		self.connected.existing
	}

	fn parent_branch(&self) -> Option<&DocumentKey> {
		self.connected.parent_branch.as_ref()
	}

	fn max_message_size(&self) -> usize {
		self.connected.max_message_size
	}

	fn order(&self, message: DocumentMessage) -> Result<(), OrdererError> {
		if self.disconnected.load(Ordering::Acquire) {
			return Err(OrdererError::AlreadyDisconnected);
		}
		if !self.node.send(self.cid, NodeMessage::Order(message)) {
			return Err(OrdererError::TransportClosed);
		}
		Ok(())
	}

	fn disconnect(&self) -> Result<(), OrdererError> {
		if self.disconnected.swap(true, Ordering::AcqRel) {
			return Err(OrdererError::AlreadyDisconnected);
		}
		self.node.state.lock().remove_routes(self.cid);
		tracing::debug!(node = %self.node.id, doc = %self.key, cid = self.cid.0, "disconnect");
		if !self.node.send(self.cid, NodeMessage::Disconnect) {
			return Err(OrdererError::TransportClosed);
		}
		Ok(())
	}
}
