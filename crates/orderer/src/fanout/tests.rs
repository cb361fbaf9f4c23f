use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use quire_proto::{
	ClientId, DocumentKey, DocumentMessage, Event, MessageContents, NackMessage, NackReason,
	RawOperation, SequenceNumber, SequencedOperation, Topic, User,
};

use super::*;
use crate::error::StorageError;
use crate::pubsub::ChannelSubscriber;
use crate::storage::{MemoryStorage, MemoryTaskQueue};

fn key() -> DocumentKey {
	DocumentKey::new("acme", "notes")
}

fn sequenced(seq: u64, contents: MessageContents) -> Delta {
	let raw = RawOperation {
		key: key(),
		client_id: Some(ClientId::from("a")),
		user: User::new("a"),
		timestamp: 0,
		operation: DocumentMessage::new(seq as i64, SequenceNumber(seq - 1), contents),
	};
	Delta::Sequenced(SequencedOperation::from_raw(raw, SequenceNumber(seq), SequenceNumber(0)))
}

fn nack(client: &str) -> Delta {
	Delta::Nack(NackMessage {
		key: key(),
		client_id: ClientId::from(client),
		operation: DocumentMessage::new(1, SequenceNumber(0), MessageContents::NoOp),
		reason: NackReason::UnknownClient,
	})
}

/// Records every delta it sees, optionally failing each one.
struct Probe {
	name: &'static str,
	fail: bool,
	log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Sink for Probe {
	fn name(&self) -> &'static str {
		self.name
	}

	async fn handle(&self, delta: &Delta) -> Result<(), SinkError> {
		let seq = match delta {
			Delta::Sequenced(op) => op.sequence_number.0,
			Delta::Nack(_) => 0,
		};
		self.log.lock().push(format!("{}:{seq}", self.name));
		if self.fail {
			return Err(SinkError::Storage(StorageError::Unavailable("down".into())));
		}
		Ok(())
	}

	async fn close(&self) {
		self.log.lock().push(format!("{}:closed", self.name));
	}
}

#[tokio::test]
async fn failing_sink_does_not_stop_the_others() {
	let log = Arc::new(Mutex::new(Vec::new()));
	let fanout = FanOut::new(vec![
		Arc::new(Probe {
			name: "first",
			fail: true,
			log: log.clone(),
		}),
		Arc::new(Probe {
			name: "second",
			fail: false,
			log: log.clone(),
		}),
	]);

	let failures = fanout.handle(&sequenced(1, MessageContents::NoOp)).await;
	assert_eq!(failures.len(), 1);
	assert_eq!(failures[0].sink, "first");

	fanout.handle(&sequenced(2, MessageContents::NoOp)).await;
	assert_eq!(*log.lock(), ["first:1", "second:1", "first:2", "second:2"]);
}

#[tokio::test]
async fn stage_preserves_order_and_closes_sinks() {
	let log = Arc::new(Mutex::new(Vec::new()));
	let fanout = FanOut::new(vec![Arc::new(Probe {
		name: "p",
		fail: false,
		log: log.clone(),
	})]);
	let (producer, consumer) = crate::queue::log(4, 0);
	let handle = spawn_stage(fanout, consumer);

	for seq in 1..=3 {
		producer.send(sequenced(seq, MessageContents::NoOp)).await.unwrap();
	}
	producer.close();
	handle.await.unwrap();

	assert_eq!(*log.lock(), ["p:1", "p:2", "p:3", "p:closed"]);
}

#[tokio::test]
async fn delta_log_persists_only_sequenced_operations() {
	let storage = Arc::new(MemoryStorage::new());
	let sink = DeltaLogSink::new(storage.clone());

	sink.handle(&sequenced(1, MessageContents::NoOp)).await.unwrap();
	sink.handle(&nack("a")).await.unwrap();

	assert_eq!(storage.deltas(&key()).len(), 1);
}

#[tokio::test]
async fn broadcast_routes_ops_to_document_and_nacks_to_client() {
	let router = Arc::new(TopicRouter::new());
	let (doc_sub, mut doc_rx) = ChannelSubscriber::new("doc");
	let (client_sub, mut client_rx) = ChannelSubscriber::new("client");
	router.subscribe(&Topic::document(&key()), doc_sub);
	router.subscribe(&Topic::client(&ClientId::from("b")), client_sub);

	let sink = BroadcastSink::new(router);
	sink.handle(&sequenced(1, MessageContents::NoOp)).await.unwrap();
	sink.handle(&nack("b")).await.unwrap();

	let (topic, event) = doc_rx.try_recv().unwrap();
	assert_eq!(topic, Topic::document(&key()));
	assert!(matches!(event, Event::Op(_)));
	assert!(doc_rx.try_recv().is_err());

	let (topic, event) = client_rx.try_recv().unwrap();
	assert_eq!(topic.as_str(), "client#b");
	assert!(matches!(event, Event::Nack(_)));
}

#[tokio::test]
async fn task_sink_dispatches_help_requests() {
	let queue = Arc::new(MemoryTaskQueue::new());
	let sink = TaskSink::new(queue.clone());

	sink.handle(&sequenced(1, MessageContents::NoOp)).await.unwrap();
	sink.handle(&sequenced(2, MessageContents::RemoteHelp(vec!["spell".into(), "intel".into()])))
		.await
		.unwrap();

	let tasks = queue.drain();
	assert_eq!(tasks.len(), 1);
	assert_eq!(tasks[0].tasks, ["spell", "intel"]);
	assert_eq!(tasks[0].sequence_number, SequenceNumber(2));
}
