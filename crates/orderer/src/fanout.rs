//! Fan-out of sequenced deltas to independent sinks.
//!
//! Each delta is offered to every sink in registration order. A failing sink
//! is logged and reported but never stops the others or the next delta.

use std::sync::Arc;

use async_trait::async_trait;
use quire_proto::{Event, MessageContents, Topic};
use tokio::task::JoinHandle;

use crate::error::SinkError;
use crate::pubsub::TopicRouter;
use crate::queue::LogConsumer;
use crate::sequencer::Delta;
use crate::storage::{DeltaStore, TaskMessage, TaskSender};

/// Downstream consumer of the sequenced stream.
#[async_trait]
pub trait Sink: Send + Sync {
	/// Short name used in logs and reports.
	fn name(&self) -> &'static str;

	/// Handles one delta.
	async fn handle(&self, delta: &Delta) -> Result<(), SinkError>;

	/// Called once when the stage drains.
	async fn close(&self) {}
}

/// A sink failure observed while handling one delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkFailure {
	/// Name of the failing sink.
	pub sink: &'static str,
	/// What went wrong.
	pub error: SinkError,
}

/// Ordered set of sinks.
#[derive(Clone, Default)]
pub struct FanOut {
	sinks: Vec<Arc<dyn Sink>>,
}

impl FanOut {
	/// Creates a fan-out over `sinks`, invoked in the given order.
	pub fn new(sinks: Vec<Arc<dyn Sink>>) -> Self {
		Self { sinks }
	}

	/// Offers `delta` to every sink, returning the failures.
	pub async fn handle(&self, delta: &Delta) -> Vec<SinkFailure> {
		let mut failures = Vec::new();
		for sink in &self.sinks {
			if let Err(error) = sink.handle(delta).await {
				tracing::warn!(sink = sink.name(), error = %error, "sink failed");
				failures.push(SinkFailure {
					sink: sink.name(),
					error,
				});
			}
		}
		failures
	}

	/// Runs every sink's close hook.
	pub async fn close(&self) {
		for sink in &self.sinks {
			sink.close().await;
		}
	}
}

/// Spawns the task draining `egress` into `fanout`; sinks are closed once the
/// egress log ends.
pub(crate) fn spawn_stage(fanout: FanOut, mut egress: LogConsumer<Delta>) -> JoinHandle<()> {
	tokio::spawn(async move {
		while let Some(record) = egress.recv().await {
			let failures = fanout.handle(&record.value).await;
			if !failures.is_empty() {
				tracing::debug!(offset = record.offset, failed = failures.len(), "delta partially delivered");
			}
		}
		fanout.close().await;
		tracing::debug!("fan-out stopped");
	})
}

/// Persists sequenced operations; nacks are not persisted.
pub struct DeltaLogSink {
	store: Arc<dyn DeltaStore>,
}

impl DeltaLogSink {
	/// Wraps a delta store.
	pub fn new(store: Arc<dyn DeltaStore>) -> Self {
		Self { store }
	}
}

#[async_trait]
impl Sink for DeltaLogSink {
	fn name(&self) -> &'static str {
		"delta-log"
	}

	async fn handle(&self, delta: &Delta) -> Result<(), SinkError> {
		match delta {
			Delta::Sequenced(op) => Ok(self.store.append(op).await?),
			Delta::Nack(_) => Ok(()),
		}
	}
}

/// Publishes operations on the document topic and nacks on the rejected
/// client's topic.
pub struct BroadcastSink {
	router: Arc<TopicRouter>,
}

impl BroadcastSink {
	/// Publishes through `router`.
	pub fn new(router: Arc<TopicRouter>) -> Self {
		Self { router }
	}
}

#[async_trait]
impl Sink for BroadcastSink {
	fn name(&self) -> &'static str {
		"broadcast"
	}

	async fn handle(&self, delta: &Delta) -> Result<(), SinkError> {
		match delta {
			Delta::Sequenced(op) => {
				self.router.publish(&Topic::document(&op.key), &Event::Op(op.clone()));
			}
			Delta::Nack(nack) => {
				self.router.publish(&Topic::client(&nack.client_id), &Event::Nack(nack.clone()));
			}
		}
		Ok(())
	}
}

/// Forwards help requests to the agent task dispatcher.
pub struct TaskSink {
	sender: Arc<dyn TaskSender>,
}

impl TaskSink {
	/// Dispatches through `sender`.
	pub fn new(sender: Arc<dyn TaskSender>) -> Self {
		Self { sender }
	}
}

#[async_trait]
impl Sink for TaskSink {
	fn name(&self) -> &'static str {
		"tasks"
	}

	async fn handle(&self, delta: &Delta) -> Result<(), SinkError> {
		let Delta::Sequenced(op) = delta else {
			return Ok(());
		};
		let MessageContents::RemoteHelp(tasks) = &op.operation.contents else {
			return Ok(());
		};
		self.sender
			.send(TaskMessage {
				key: op.key.clone(),
				tasks: tasks.clone(),
				sequence_number: op.sequence_number,
			})
			.await
			.map_err(|err| SinkError::Dispatch(err.to_string()))
	}
}

#[cfg(test)]
mod tests;
