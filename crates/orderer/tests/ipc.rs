//! Node links over Unix domain sockets.

#![cfg(unix)]

mod common;

use std::time::Duration;

use chrono::Utc;
use common::{Participant, key};
use quire_orderer::proto::NodeRecord;
use quire_orderer::{ConcreteNode, OrdererConfig, OrdererRuntime, ipc};

#[tokio::test]
async fn peer_edits_through_a_socket() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("node.sock");
	let (runtime, storage, _) = OrdererRuntime::in_memory("host", OrdererConfig::default());
	let server = tokio::spawn(ipc::serve(
		path.clone(),
		runtime.node.clone(),
		runtime.shutdown.child_token(),
	));

	tokio::time::timeout(Duration::from_secs(5), async {
		while !path.exists() {
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
	})
	.await
	.expect("socket never appeared");

	let record = NodeRecord {
		id: "host".into(),
		address: path.display().to_string(),
		expiration: Utc::now() + chrono::Duration::minutes(5),
	};
	let remote = ipc::connect(&record, &runtime.config).await.unwrap();
	let node = ConcreteNode::Remote(remote);
	assert!(node.is_valid());

	let mut peer = Participant::connect(&node, "peer").await;
	let op = peer.client.insert_text_local(0, "over the wire").unwrap();
	peer.submit(&op);
	peer.pump_through(2).await;
	assert_eq!(peer.client.text(), "over the wire");
	assert_eq!(peer.client.pending_count(), 0);
	assert_eq!(storage.deltas(&key()).len(), 2);

	runtime.shutdown().await;
	server.await.unwrap().unwrap();
}

#[tokio::test]
async fn expired_record_skips_the_socket() {
	let record = NodeRecord {
		id: "gone".into(),
		address: "/nonexistent/quire.sock".into(),
		expiration: Utc::now() - chrono::Duration::seconds(1),
	};
	let node = ipc::connect(&record, &OrdererConfig::default()).await.unwrap();
	assert!(!node.is_valid());
}

#[tokio::test]
async fn stale_socket_file_is_replaced() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("node.sock");
	std::fs::write(&path, b"left over from a crashed node").unwrap();

	let (runtime, _, _) = OrdererRuntime::in_memory("host", OrdererConfig::default());
	let server = tokio::spawn(ipc::serve(
		path.clone(),
		runtime.node.clone(),
		runtime.shutdown.child_token(),
	));

	let record = NodeRecord {
		id: "host".into(),
		address: path.display().to_string(),
		expiration: Utc::now() + chrono::Duration::minutes(5),
	};
	let remote = tokio::time::timeout(Duration::from_secs(5), async {
		loop {
			match ipc::connect(&record, &runtime.config).await {
				Ok(remote) => break remote,
				Err(_) => tokio::time::sleep(Duration::from_millis(5)).await,
			}
		}
	})
	.await
	.expect("socket never bound");
	assert!(remote.is_valid());

	let mut peer = Participant::connect(&ConcreteNode::Remote(remote), "peer").await;
	peer.pump_through(1).await;

	runtime.shutdown().await;
	server.await.unwrap().unwrap();
}
