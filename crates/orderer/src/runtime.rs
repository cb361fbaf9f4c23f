//! Orderer runtime wiring.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::OrdererConfig;
use crate::local::OrdererServices;
use crate::node::{ConcreteNode, LocalNode};
use crate::pubsub::TopicRouter;
use crate::storage::{MemoryStorage, MemoryTaskQueue};

/// Owns the process-wide router, collaborators and local node.
///
/// Everything an orderer needs is built here and passed down explicitly.
pub struct OrdererRuntime {
	/// Effective configuration.
	pub config: OrdererConfig,
	/// The process-wide topic router.
	pub router: Arc<TopicRouter>,
	/// Collaborators injected into every orderer.
	pub services: OrdererServices,
	/// Node hosting this process's orderers.
	pub node: Arc<LocalNode>,
	/// Cancelled by [`shutdown`](Self::shutdown); parent of every serve loop.
	pub shutdown: CancellationToken,
}

impl OrdererRuntime {
	/// Wires a runtime around the given collaborators.
	///
	/// The router inside `services` becomes the runtime's router.
	#[must_use]
	pub fn new(node_id: impl Into<String>, services: OrdererServices, config: OrdererConfig) -> Arc<Self> {
		let node = Arc::new(LocalNode::new(node_id, services.clone(), config.clone()));
		Arc::new(Self {
			router: Arc::clone(&services.router),
			config,
			services,
			node,
			shutdown: CancellationToken::new(),
		})
	}

	/// Wires a runtime backed by in-memory storage and task queue, returning
	/// them for inspection.
	#[must_use]
	pub fn in_memory(
		node_id: impl Into<String>,
		config: OrdererConfig,
	) -> (Arc<Self>, Arc<MemoryStorage>, Arc<MemoryTaskQueue>) {
		let storage = Arc::new(MemoryStorage::new());
		let tasks = Arc::new(MemoryTaskQueue::new());
		let services = OrdererServices {
			router: Arc::new(TopicRouter::new()),
			documents: storage.clone(),
			deltas: storage.clone(),
			tasks: tasks.clone(),
		};
		(Self::new(node_id, services, config), storage, tasks)
	}

	/// Handle for connecting to orderers hosted in this process.
	pub fn local_handle(&self) -> ConcreteNode {
		ConcreteNode::Local(Arc::clone(&self.node))
	}

	/// Stops every serve loop and closes every hosted orderer.
	pub async fn shutdown(&self) {
		self.shutdown.cancel();
		self.node.close().await;
	}
}
