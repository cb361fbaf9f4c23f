//! Nodes hosting orderers, and the handle that hides where an orderer runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use quire_proto::{
	ClientDetail, ConnectedMessage, ConnectionId, DocumentKey, Event, NodeFrame, NodeMessage,
	OpMessage, SubscriberId, Topic, User,
};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec::NodeTransport;
use crate::config::OrdererConfig;
use crate::connection::OrdererConnection;
use crate::error::OrdererError;
use crate::local::{LocalOrderer, LocalOrdererConnection, OrdererServices};
use crate::pubsub::Subscriber;
use crate::remote::RemoteNode;

/// A node hosting local orderers, loaded on first use per document.
pub struct LocalNode {
	id: String,
	services: OrdererServices,
	config: OrdererConfig,
	orderers: Mutex<HashMap<DocumentKey, Arc<LocalOrderer>>>,
	next_socket: AtomicU64,
}

impl LocalNode {
	/// Creates a node with no loaded orderers.
	pub fn new(id: impl Into<String>, services: OrdererServices, config: OrdererConfig) -> Self {
		Self {
			id: id.into(),
			services,
			config,
			orderers: Mutex::new(HashMap::new()),
			next_socket: AtomicU64::new(0),
		}
	}

	/// Node id.
	pub fn id(&self) -> &str {
		&self.id
	}

	/// Returns the orderer for `key`, loading it (again, if it was closed).
	///
	/// # Errors
	///
	/// Propagates document storage failures.
	pub async fn orderer(&self, key: &DocumentKey) -> Result<Arc<LocalOrderer>, OrdererError> {
		let mut orderers = self.orderers.lock().await;
		if let Some(orderer) = orderers.get(key).filter(|orderer| !orderer.is_closed()) {
			return Ok(Arc::clone(orderer));
		}
		let orderer = Arc::new(LocalOrderer::load(key.clone(), &self.services, &self.config).await?);
		orderers.insert(key.clone(), Arc::clone(&orderer));
		Ok(orderer)
	}

	/// Connects a client to the document's orderer.
	///
	/// # Errors
	///
	/// See [`LocalOrderer::load`] and [`LocalOrderer::connect`].
	pub async fn connect(
		&self,
		key: &DocumentKey,
		subscriber: Arc<dyn Subscriber>,
		user: User,
		client: ClientDetail,
	) -> Result<LocalOrdererConnection, OrdererError> {
		self.orderer(key).await?.connect(subscriber, user, client)
	}

	/// Closes every loaded orderer.
	pub async fn close(&self) {
		let orderers: Vec<Arc<LocalOrderer>> = self.orderers.lock().await.drain().map(|(_, o)| o).collect();
		for orderer in orderers {
			orderer.close().await;
		}
	}

	/// Serves the node protocol for one peer over `transport`.
	///
	/// Every connection opened by the peer shares one subscriber, so an event
	/// on a topic is shipped once per socket however many of its connections
	/// listen. Connections still open when the transport closes (or `shutdown`
	/// fires) are disconnected.
	pub fn serve(self: &Arc<Self>, transport: NodeTransport, shutdown: CancellationToken) -> JoinHandle<()> {
		let node = Arc::clone(self);
		let socket = self.next_socket.fetch_add(1, Ordering::Relaxed);
		tokio::spawn(async move {
			let NodeTransport {
				outbound,
				mut inbound,
			} = transport;
			let subscriber: Arc<dyn Subscriber> = Arc::new(SocketSubscriber {
				id: SubscriberId(format!("{}-socket-{socket}", node.id)),
				outbound: outbound.clone(),
			});
			let mut connections: HashMap<ConnectionId, LocalOrdererConnection> = HashMap::new();
			tracing::debug!(node = %node.id, socket, "peer attached");

			loop {
				let frame = tokio::select! {
					_ = shutdown.cancelled() => break,
					frame = inbound.recv() => match frame {
						Some(frame) => frame,
						None => break,
					},
				};
				node.handle_peer_frame(frame, &subscriber, &outbound, &mut connections).await;
			}

			for (cid, connection) in connections.drain() {
				if let Err(err) = connection.disconnect() {
					tracing::debug!(node = %node.id, cid = cid.0, error = %err, "disconnect on detach failed");
				}
			}
			tracing::debug!(node = %node.id, socket, "peer detached");
		})
	}

	async fn handle_peer_frame(
		&self,
		frame: NodeFrame,
		subscriber: &Arc<dyn Subscriber>,
		outbound: &mpsc::UnboundedSender<NodeFrame>,
		connections: &mut HashMap<ConnectionId, LocalOrdererConnection>,
	) {
		let Some(cid) = frame.cid else {
			tracing::warn!(node = %self.id, frame = ?frame.message, "peer frame without connection id");
			return;
		};

		match frame.message {
			NodeMessage::Connect(request) => {
				let key = DocumentKey::new(request.tenant_id, request.document_id);
				let reply = match self.connect(&key, Arc::clone(subscriber), request.user, request.client).await {
					Ok(connection) => {
						let reply = NodeMessage::Connected(ConnectedMessage {
							client_id: connection.client_id().clone(),
							existing: connection.existing(),
							parent_branch: connection.parent_branch().cloned(),
							max_message_size: connection.max_message_size(),
						});
						connections.insert(cid, connection);
						reply
					}
					Err(err) => {
						tracing::warn!(node = %self.id, doc = %key, cid = cid.0, error = %err, "peer connect failed");
						NodeMessage::ConnectFailed { reason: err.to_string() }
					}
				};
				if outbound.send(NodeFrame { cid: Some(cid), message: reply }).is_err() {
					tracing::debug!(node = %self.id, cid = cid.0, "peer gone before connect reply");
				}
			}
			NodeMessage::Order(message) => match connections.get(&cid) {
				Some(connection) => {
					if let Err(err) = connection.order(message) {
						tracing::warn!(node = %self.id, cid = cid.0, error = %err, "order from peer refused");
					}
				}
				None => tracing::warn!(node = %self.id, cid = cid.0, "order for unknown connection"),
			},
			NodeMessage::Disconnect => match connections.remove(&cid) {
				Some(connection) => {
					if let Err(err) = connection.disconnect() {
						tracing::warn!(node = %self.id, cid = cid.0, error = %err, "peer disconnect failed");
					}
				}
				None => tracing::warn!(node = %self.id, cid = cid.0, "disconnect for unknown connection"),
			},
			other => {
				tracing::warn!(node = %self.id, cid = cid.0, frame = ?other, "unexpected frame from peer");
			}
		}
	}
}

/// Ships router publishes to a peer as `op` frames.
struct SocketSubscriber {
	id: SubscriberId,
	outbound: mpsc::UnboundedSender<NodeFrame>,
}

impl Subscriber for SocketSubscriber {
	fn id(&self) -> &SubscriberId {
		&self.id
	}

	fn send(&self, topic: &Topic, event: &Event) {
		let frame = NodeFrame {
			cid: None,
			message: NodeMessage::Op(OpMessage {
				topic: topic.clone(),
				event: event.clone(),
			}),
		};
		if self.outbound.send(frame).is_err() {
			tracing::trace!(subscriber = %self.id, %topic, "peer gone; dropping op");
		}
	}
}

/// Where a document's orderer runs.
#[derive(Clone)]
pub enum ConcreteNode {
	/// In this process.
	Local(Arc<LocalNode>),
	/// On a peer, reached through a node transport.
	Remote(RemoteNode),
}

impl ConcreteNode {
	/// Connects a client to the document's orderer wherever it runs.
	///
	/// # Errors
	///
	/// See [`LocalNode::connect`] and [`RemoteNode::connect`].
	pub async fn connect(
		&self,
		key: &DocumentKey,
		subscriber: Arc<dyn Subscriber>,
		user: User,
		client: ClientDetail,
	) -> Result<Box<dyn OrdererConnection>, OrdererError> {
		match self {
			Self::Local(node) => Ok(Box::new(node.connect(key, subscriber, user, client).await?)),
			Self::Remote(node) => Ok(Box::new(node.connect(key.clone(), subscriber, user, client).await?)),
		}
	}

	/// Returns false once a remote node's transport has closed.
	pub fn is_valid(&self) -> bool {
		match self {
			Self::Local(_) => true,
			Self::Remote(node) => node.is_valid(),
		}
	}
}
