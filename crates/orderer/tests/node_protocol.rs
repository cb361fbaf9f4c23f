//! Clients on a peer node edit alongside clients of the hosting node.

mod common;

use std::time::Duration;

use chrono::Utc;
use common::{Participant, key};
use quire_orderer::proto::{ClientDetail, MessageContents, NodeRecord, User};
use quire_orderer::{
	ChannelSubscriber, ConcreteNode, NodeTransport, OrdererConfig, OrdererError, OrdererRuntime, RemoteNode,
};

fn record(ttl: chrono::Duration) -> NodeRecord {
	NodeRecord {
		id: "host".into(),
		address: "in-memory".into(),
		expiration: Utc::now() + ttl,
	}
}

fn linked(runtime: &OrdererRuntime) -> RemoteNode {
	let (near, far) = NodeTransport::pair();
	runtime.node.serve(far, runtime.shutdown.child_token());
	RemoteNode::from_record(&record(chrono::Duration::minutes(5)), near, Utc::now(), &runtime.config)
}

#[tokio::test]
async fn remote_and_local_clients_share_one_sequence() {
	let (runtime, storage, _) = OrdererRuntime::in_memory("host", OrdererConfig::default());
	let remote = ConcreteNode::Remote(linked(&runtime));
	let local = runtime.local_handle();

	let mut far = Participant::connect(&remote, "far").await;
	let mut near = Participant::connect(&local, "near").await;
	assert!(!far.conn.existing());
	assert!(near.conn.existing());
	assert_eq!(far.conn.max_message_size(), OrdererConfig::default().max_message_size);

	let hi = far.client.insert_text_local(0, "hi").unwrap();
	far.submit(&hi);
	far.pump_through(3).await;
	near.pump_through(3).await;

	let bang = near.client.insert_text_local(2, "!").unwrap();
	near.submit(&bang);
	far.pump_through(4).await;
	near.pump_through(4).await;
	assert_eq!(far.client.text(), "hi!");
	assert_eq!(near.client.text(), "hi!");

	far.conn.disconnect().unwrap();
	assert!(matches!(far.conn.disconnect(), Err(OrdererError::AlreadyDisconnected)));
	near.pump_through(5).await;
	let leave = storage.deltas(&key()).pop().unwrap();
	assert_eq!(
		leave.operation.contents,
		MessageContents::ClientLeave(far.client.client_id().clone())
	);
	runtime.shutdown().await;
}

#[tokio::test]
async fn host_shutdown_invalidates_the_remote_node() {
	let (runtime, _, _) = OrdererRuntime::in_memory("host", OrdererConfig::default());
	let node = linked(&runtime);
	assert!(node.is_valid());

	runtime.shutdown().await;
	tokio::time::timeout(Duration::from_secs(5), async {
		while node.is_valid() {
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.expect("remote node stayed valid");

	let (subscriber, _events) = ChannelSubscriber::new("late");
	let err = node
		.connect(key(), subscriber, User::new("late"), ClientDetail::default())
		.await
		.err()
		.unwrap();
	assert!(matches!(err, OrdererError::NodeInvalid(_)));
	assert_eq!(node.pending_connects(), 0);
}

#[tokio::test]
async fn expired_record_never_connects() {
	let (near, _far) = NodeTransport::pair();
	let node = RemoteNode::from_record(
		&record(chrono::Duration::seconds(-1)),
		near,
		Utc::now(),
		&OrdererConfig::default(),
	);
	assert!(!ConcreteNode::Remote(node.clone()).is_valid());

	let (subscriber, _events) = ChannelSubscriber::new("s");
	let err = node
		.connect(key(), subscriber, User::new("u"), ClientDetail::default())
		.await
		.err()
		.unwrap();
	assert!(matches!(err, OrdererError::NodeInvalid(_)));
}

#[tokio::test]
async fn one_document_is_tracked_once_per_node() {
	let (runtime, _, _) = OrdererRuntime::in_memory("host", OrdererConfig::default());
	let node = linked(&runtime);

	let orderer = node.connect_orderer("acme", "notes").unwrap();
	assert!(matches!(
		node.connect_orderer("acme", "notes"),
		Err(OrdererError::OrdererExists(_))
	));

	let (subscriber, mut events) = ChannelSubscriber::new("s");
	let conn = orderer
		.connect(subscriber, User::new("u"), ClientDetail::default())
		.await
		.unwrap();
	assert_eq!(orderer.key(), &key());
	assert!(conn.connection_id().0 > 0);
	assert!(events.recv().await.is_some());

	orderer.close();
	assert!(node.connect_orderer("acme", "notes").is_ok());
	runtime.shutdown().await;
}
