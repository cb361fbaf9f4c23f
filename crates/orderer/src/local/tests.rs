use std::sync::Arc;

use quire_proto::{
	ClientDetail, DocumentKey, DocumentMessage, Event, MessageContents, SequenceNumber, Topic, User,
};

use super::*;
use crate::pubsub::ChannelSubscriber;
use crate::storage::{MemoryStorage, MemoryTaskQueue};

fn services() -> (OrdererServices, Arc<MemoryStorage>) {
	let storage = Arc::new(MemoryStorage::new());
	let services = OrdererServices {
		router: Arc::new(TopicRouter::new()),
		documents: storage.clone(),
		deltas: storage.clone(),
		tasks: Arc::new(MemoryTaskQueue::new()),
	};
	(services, storage)
}

fn key() -> DocumentKey {
	DocumentKey::new("acme", "notes")
}

fn edit(csn: i64, rsn: u64) -> DocumentMessage {
	DocumentMessage::new(csn, SequenceNumber(rsn), MessageContents::Op(serde_json::json!({ "n": csn })))
}

async fn next_op(rx: &mut tokio::sync::mpsc::UnboundedReceiver<(Topic, Event)>) -> quire_proto::SequencedOperation {
	match rx.recv().await {
		Some((_, Event::Op(op))) => op,
		other => panic!("expected op event, got {other:?}"),
	}
}

#[tokio::test]
async fn existence_flag_flips_after_first_connection() {
	let (services, _) = services();
	let orderer = LocalOrderer::load(key(), &services, &OrdererConfig::default()).await.unwrap();
	assert!(!orderer.existing());

	let (sub, _rx) = ChannelSubscriber::new("s");
	let first = orderer.connect(sub.clone(), User::new("u"), ClientDetail::default()).unwrap();
	let second = orderer.connect(sub, User::new("u"), ClientDetail::default()).unwrap();

	assert!(!first.existing());
	assert!(second.existing());
	assert_ne!(first.client_id(), second.client_id());
	orderer.close().await;
}

#[tokio::test]
async fn join_precedes_client_operations() {
	let (services, _) = services();
	let orderer = LocalOrderer::load(key(), &services, &OrdererConfig::default()).await.unwrap();
	let (sub, mut rx) = ChannelSubscriber::new("s");
	let conn = orderer.connect(sub, User::new("u"), ClientDetail::default()).unwrap();

	conn.order(edit(1, 1)).unwrap();
	conn.order(edit(2, 1)).unwrap();

	let join = next_op(&mut rx).await;
	assert_eq!(join.sequence_number, SequenceNumber(1));
	assert!(matches!(join.operation.contents, MessageContents::ClientJoin(_)));

	let first = next_op(&mut rx).await;
	let second = next_op(&mut rx).await;
	assert_eq!(first.client_id.as_ref(), Some(conn.client_id()));
	assert_eq!((first.sequence_number.0, second.sequence_number.0), (2, 3));
	assert_eq!(first.operation.traces[0].service, "orderer");
	orderer.close().await;
}

#[tokio::test]
async fn oversized_messages_are_rejected() {
	let (services, _) = services();
	let config = OrdererConfig {
		max_message_size: 16,
		..OrdererConfig::default()
	};
	let orderer = LocalOrderer::load(key(), &services, &config).await.unwrap();
	let (sub, _rx) = ChannelSubscriber::new("s");
	let conn = orderer.connect(sub, User::new("u"), ClientDetail::default()).unwrap();

	let big = DocumentMessage::new(
		1,
		SequenceNumber(1),
		MessageContents::Op(serde_json::json!({ "text": "x".repeat(64) })),
	);
	assert!(matches!(conn.order(big), Err(OrdererError::MessageTooLarge { max: 16, .. })));
	orderer.close().await;
}

#[tokio::test]
async fn disconnect_is_single_shot_and_drops_subscriptions() {
	let (services, _) = services();
	let router = services.router.clone();
	let orderer = LocalOrderer::load(key(), &services, &OrdererConfig::default()).await.unwrap();
	let (sub, mut rx) = ChannelSubscriber::new("s");
	let conn = orderer.connect(sub, User::new("u"), ClientDetail::default()).unwrap();
	next_op(&mut rx).await;

	conn.disconnect().unwrap();
	assert_eq!(conn.disconnect(), Err(OrdererError::AlreadyDisconnected));
	assert_eq!(conn.order(edit(1, 1)), Err(OrdererError::AlreadyDisconnected));
	assert!(!router.has_topic(&Topic::document(&key())));
	assert!(!router.has_topic(&Topic::client(conn.client_id())));
	orderer.close().await;
}

#[tokio::test]
async fn close_is_idempotent_and_refuses_new_work() {
	let (services, _) = services();
	let router = services.router.clone();
	let orderer = LocalOrderer::load(key(), &services, &OrdererConfig::default()).await.unwrap();
	let (sub, _rx) = ChannelSubscriber::new("s");
	let conn = orderer.connect(sub.clone(), User::new("u"), ClientDetail::default()).unwrap();

	orderer.close().await;
	orderer.close().await;
	assert!(orderer.is_closed());

	assert_eq!(conn.order(edit(1, 1)), Err(OrdererError::Closed));
	assert!(matches!(
		orderer.connect(sub, User::new("u"), ClientDetail::default()),
		Err(OrdererError::Closed)
	));
	// The failed connect rolled back its subscriptions; only `conn` remains.
	assert_eq!(router.refcount(&Topic::document(&key()), &"s".into()), 1);
}

#[tokio::test]
async fn reload_resumes_numbering_from_storage() {
	let (services, storage) = services();
	let config = OrdererConfig::default();

	let orderer = LocalOrderer::load(key(), &services, &config).await.unwrap();
	let (sub, _rx) = ChannelSubscriber::new("s");
	let conn = orderer.connect(sub, User::new("u"), ClientDetail::default()).unwrap();
	conn.order(edit(1, 1)).unwrap();
	conn.disconnect().unwrap();
	orderer.close().await;
	assert_eq!(storage.deltas(&key()).len(), 3);

	let reloaded = LocalOrderer::load(key(), &services, &config).await.unwrap();
	assert!(reloaded.existing());
	let (sub, mut rx) = ChannelSubscriber::new("s2");
	let conn = reloaded.connect(sub, User::new("u"), ClientDetail::default()).unwrap();
	assert!(conn.existing());
	assert_eq!(next_op(&mut rx).await.sequence_number, SequenceNumber(4));
	reloaded.close().await;
}

#[tokio::test]
async fn branch_documents_expose_their_parent() {
	let (services, storage) = services();
	let parent = DocumentKey::new("acme", "main");
	storage.create_branch(key(), parent.clone());

	let orderer = LocalOrderer::load(key(), &services, &OrdererConfig::default()).await.unwrap();
	let (sub, _rx) = ChannelSubscriber::new("s");
	let conn = orderer.connect(sub, User::new("u"), ClientDetail::default()).unwrap();
	assert_eq!(conn.parent_branch(), Some(&parent));
	orderer.close().await;
}
