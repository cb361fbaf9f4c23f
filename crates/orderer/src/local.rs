//! In-process orderer: ingress queue, sequencer, egress queue, fan-out.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use quire_proto::{
	ClientDetail, ClientId, ClientJoin, DocumentKey, DocumentMessage, MessageContents, RawOperation,
	SubscriberId, Topic, Trace, User,
};
use tokio::task::JoinHandle;

use crate::config::OrdererConfig;
use crate::connection::OrdererConnection;
use crate::error::OrdererError;
use crate::fanout::{self, BroadcastSink, DeltaLogSink, FanOut, Sink, TaskSink};
use crate::pubsub::{Subscriber, TopicRouter};
use crate::queue::{self, LogProducer};
use crate::sequencer::{self, Sequencer};
use crate::storage::{DeltaStore, DocumentStorage, TaskSender};

/// Collaborators injected into every orderer by the composition root.
#[derive(Clone)]
pub struct OrdererServices {
	/// Shared topic router.
	pub router: Arc<TopicRouter>,
	/// Document metadata store.
	pub documents: Arc<dyn DocumentStorage>,
	/// Durable delta log.
	pub deltas: Arc<dyn DeltaStore>,
	/// Agent task dispatcher.
	pub tasks: Arc<dyn TaskSender>,
}

/// Orderer for one document running entirely in this process.
///
/// One task sequences the ingress queue; a second drains the egress queue
/// through the sinks. Both stop once [`close`](Self::close) is called.
pub struct LocalOrderer {
	key: DocumentKey,
	parent: Option<DocumentKey>,
	existing: AtomicBool,
	ingress: LogProducer<RawOperation>,
	router: Arc<TopicRouter>,
	max_message_size: usize,
	stages: Mutex<Option<[JoinHandle<()>; 2]>>,
}

impl LocalOrderer {
	/// Loads (or creates) the document and starts its pipeline.
	///
	/// Numbering resumes after the last durable sequence number.
	///
	/// # Errors
	///
	/// Propagates document storage failures.
	pub async fn load(
		key: DocumentKey,
		services: &OrdererServices,
		config: &OrdererConfig,
	) -> Result<Self, OrdererError> {
		let details = services.documents.get_or_create_document(&key).await?;
		let start = details.value.sequence_number;

		let (ingress, ingress_rx) = queue::log(config.queue_capacity, start.0);
		let (egress, egress_rx) = queue::log(config.queue_capacity, start.0);

		let sinks: Vec<Arc<dyn Sink>> = vec![
			Arc::new(DeltaLogSink::new(Arc::clone(&services.deltas))),
			Arc::new(BroadcastSink::new(Arc::clone(&services.router))),
			Arc::new(TaskSink::new(Arc::clone(&services.tasks))),
		];
		let sequencer = Sequencer::new(key.clone(), start, config.client_timeout);
		let sequencer_task =
			sequencer::spawn_stage(sequencer, ingress_rx, egress, config.activity_check_interval);
		let fanout_task = fanout::spawn_stage(FanOut::new(sinks), egress_rx);

		tracing::debug!(doc = %key, existing = details.existing, seq = start.0, "orderer loaded");

		Ok(Self {
			key,
			parent: details.value.parent,
			existing: AtomicBool::new(details.existing),
			ingress,
			router: Arc::clone(&services.router),
			max_message_size: config.max_message_size,
			stages: Mutex::new(Some([sequencer_task, fanout_task])),
		})
	}

	/// Document served by this orderer.
	pub fn key(&self) -> &DocumentKey {
		&self.key
	}

	/// Whether the document has been connected to (or existed in storage).
	pub fn existing(&self) -> bool {
		self.existing.load(Ordering::Acquire)
	}

	/// Returns true once [`close`](Self::close) has been called.
	pub fn is_closed(&self) -> bool {
		self.ingress.is_closed()
	}

	/// Opens a connection for a new client.
	///
	/// The subscriber is registered on the document topic and on the new
	/// client's private topic, and the join is queued before this returns so
	/// it precedes every operation the client submits.
	///
	/// # Errors
	///
	/// [`OrdererError::Closed`] or [`OrdererError::QueueFull`] when the join
	/// cannot be queued; the subscriptions are rolled back.
	pub fn connect(
		&self,
		subscriber: Arc<dyn Subscriber>,
		user: User,
		client: ClientDetail,
	) -> Result<LocalOrdererConnection, OrdererError> {
		let client_id = ClientId::generate();
		let subscriber_id = subscriber.id().clone();
		let document_topic = Topic::document(&self.key);
		let client_topic = Topic::client(&client_id);

		self.router.subscribe(&document_topic, Arc::clone(&subscriber));
		self.router.subscribe(&client_topic, subscriber);

		let join = RawOperation {
			key: self.key.clone(),
			client_id: None,
			user: user.clone(),
			timestamp: quire_proto::now_millis(),
			operation: DocumentMessage::system(MessageContents::ClientJoin(ClientJoin {
				client_id: client_id.clone(),
				detail: client,
			})),
		};
		if let Err(err) = self.ingress.try_send(join) {
			self.router.unsubscribe(&document_topic, &subscriber_id)?;
			self.router.unsubscribe(&client_topic, &subscriber_id)?;
			return Err(err.into());
		}

		let existing = self.existing.swap(true, Ordering::AcqRel);
		tracing::debug!(doc = %self.key, client = %client_id, existing, "client connected");

		Ok(LocalOrdererConnection {
			key: self.key.clone(),
			client_id,
			user,
			existing,
			parent_branch: self.parent.clone(),
			max_message_size: self.max_message_size,
			subscriber: subscriber_id,
			ingress: self.ingress.clone(),
			router: Arc::clone(&self.router),
			disconnected: AtomicBool::new(false),
		})
	}

	/// Stops accepting input, drains both stages and closes the sinks.
	///
	/// Calling it again is a no-op.
	pub async fn close(&self) {
		self.ingress.close();
		let stages = self.stages.lock().take();
		let Some(stages) = stages else {
			return;
		};
		for stage in stages {
			if let Err(err) = stage.await {
				tracing::warn!(doc = %self.key, error = %err, "orderer stage panicked");
			}
		}
		tracing::debug!(doc = %self.key, "orderer closed");
	}
}

/// A client connection to a [`LocalOrderer`].
pub struct LocalOrdererConnection {
	key: DocumentKey,
	client_id: ClientId,
	user: User,
	existing: bool,
	parent_branch: Option<DocumentKey>,
	max_message_size: usize,
	subscriber: SubscriberId,
	ingress: LogProducer<RawOperation>,
	router: Arc<TopicRouter>,
	disconnected: AtomicBool,
}

impl OrdererConnection for LocalOrdererConnection {
	fn client_id(&self) -> &ClientId {
		&self.client_id
	}

	fn existing(&self) -> bool {
		self.existing
	}

	fn parent_branch(&self) -> Option<&DocumentKey> {
		self.parent_branch.as_ref()
	}

	fn max_message_size(&self) -> usize {
		self.max_message_size
	}

	fn order(&self, mut message: DocumentMessage) -> Result<(), OrdererError> {
		if self.disconnected.load(Ordering::Acquire) {
			return Err(OrdererError::AlreadyDisconnected);
		}

		let size = serde_json::to_vec(&message.contents)
			.map_err(|err| OrdererError::Encoding(err.to_string()))?
			.len();
		if size > self.max_message_size {
			return Err(OrdererError::MessageTooLarge {
				size,
				max: self.max_message_size,
			});
		}

		message.traces.push(Trace {
			service: "orderer".into(),
			action: "start".into(),
			timestamp: quire_proto::now_trace_millis(),
		});
		let raw = RawOperation {
			key: self.key.clone(),
			client_id: Some(self.client_id.clone()),
			user: self.user.clone(),
			timestamp: quire_proto::now_millis(),
			operation: message,
		};
		let offset = self.ingress.try_send(raw)?;
		tracing::trace!(doc = %self.key, client = %self.client_id, offset, "ordered");
		Ok(())
	}

	fn disconnect(&self) -> Result<(), OrdererError> {
		if self.disconnected.swap(true, Ordering::AcqRel) {
			return Err(OrdererError::AlreadyDisconnected);
		}

		let leave = RawOperation {
			key: self.key.clone(),
			client_id: None,
			user: self.user.clone(),
			timestamp: quire_proto::now_millis(),
			operation: DocumentMessage::system(MessageContents::ClientLeave(self.client_id.clone())),
		};
		let submitted = self.ingress.try_send(leave);

		self.router.unsubscribe(&Topic::document(&self.key), &self.subscriber)?;
		self.router.unsubscribe(&Topic::client(&self.client_id), &self.subscriber)?;
		tracing::debug!(doc = %self.key, client = %self.client_id, "client disconnected");

		submitted.map(|_| ()).map_err(OrdererError::from)
	}
}

#[cfg(test)]
mod tests;
