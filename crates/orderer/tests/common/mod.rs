//! A merge client wired to an orderer connection.

#![allow(dead_code)]

use quire_merge::{LocalOp, MergeClient};
use quire_orderer::proto::{ClientDetail, DocumentKey, Event, NackMessage, SequenceNumber, Topic, User};
use quire_orderer::{ChannelSubscriber, ConcreteNode, OrdererConnection};
use tokio::sync::mpsc::UnboundedReceiver;

pub fn key() -> DocumentKey {
	DocumentKey::new("acme", "notes")
}

/// One editing session: its connection, its replica and its event stream.
pub struct Participant {
	pub name: String,
	pub conn: Box<dyn OrdererConnection>,
	pub client: MergeClient,
	pub events: UnboundedReceiver<(Topic, Event)>,
}

impl Participant {
	pub async fn connect(node: &ConcreteNode, name: &str) -> Self {
		let (subscriber, events) = ChannelSubscriber::new(name);
		let conn = node
			.connect(&key(), subscriber, User::new(name), ClientDetail::default())
			.await
			.unwrap();
		let client = MergeClient::new(conn.client_id().clone());
		Self {
			name: name.to_owned(),
			conn,
			client,
			events,
		}
	}

	/// Drops the current connection and opens a new one under a fresh id.
	pub async fn reconnect(&mut self, node: &ConcreteNode) {
		self.conn.disconnect().unwrap();
		let name = format!("{}-again", self.name);
		let (subscriber, events) = ChannelSubscriber::new(name.as_str());
		self.conn = node
			.connect(&key(), subscriber, User::new(self.name.as_str()), ClientDetail::default())
			.await
			.unwrap();
		self.events = events;
		self.client.update_client_id(self.conn.client_id().clone());
	}

	pub fn submit(&self, op: &LocalOp) {
		self.conn.order(op.to_document_message().unwrap()).unwrap();
	}

	async fn next_event(&mut self) -> Event {
		let (_, event) = self.events.recv().await.expect("event stream closed");
		event
	}

	/// Applies sequenced ops until `seq` has been applied.
	pub async fn pump_through(&mut self, seq: u64) {
		while self.client.reference_sequence_number() < SequenceNumber(seq) {
			match self.next_event().await {
				Event::Op(op) => self.client.apply_msg(&op).unwrap(),
				Event::Nack(nack) => panic!("{} nacked: {:?}", self.name, nack.reason),
			}
		}
	}

	/// Applies sequenced ops until a nack arrives.
	pub async fn pump_until_nack(&mut self) -> NackMessage {
		loop {
			match self.next_event().await {
				Event::Op(op) => self.client.apply_msg(&op).unwrap(),
				Event::Nack(nack) => return nack,
			}
		}
	}
}
