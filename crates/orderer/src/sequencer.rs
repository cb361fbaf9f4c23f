//! Per-document sequencer assigning the total order.
//!
//! The [`Sequencer`] is a synchronous state machine so its ordering rules can
//! be tested without a runtime; [`spawn_stage`] drives it from an ingress log
//! and forwards results to an egress log.
//!
//! # Invariants
//!
//! - Sequence numbers increase by exactly one per sequenced operation.
//! - Only joined clients may submit; everything else is nacked, never sequenced.
//! - The minimum sequence number is the lowest reference sequence number among
//!   connected clients and never decreases.

use std::collections::BTreeMap;
use std::time::Duration;

use quire_proto::{
	ClientId, DocumentKey, DocumentMessage, MessageContents, NackMessage, NackReason, RawOperation,
	SequenceNumber, SequencedOperation, User,
};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use crate::error::SequencerError;
use crate::queue::{LogConsumer, LogProducer};

/// Item carried on the egress log.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
	/// An operation with its assigned position.
	Sequenced(SequencedOperation),
	/// A refused operation, to be routed back to its client.
	Nack(NackMessage),
}

/// Lifecycle of a document's sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
	/// Nothing processed yet.
	Created,
	/// At least one input processed.
	Active,
	/// Closed; further input is refused.
	Closed,
}

#[derive(Debug)]
struct ClientRecord {
	/// High-water mark of the client's reference sequence number.
	reference_sequence_number: SequenceNumber,
	/// Last accepted client sequence number.
	client_sequence_number: i64,
	/// Watchdog; reset on every accepted operation.
	last_update: Instant,
}

/// Ordering state for one document.
#[derive(Debug)]
pub struct Sequencer {
	key: DocumentKey,
	state: SequencerState,
	sequence_number: SequenceNumber,
	minimum_sequence_number: SequenceNumber,
	clients: BTreeMap<ClientId, ClientRecord>,
	client_timeout: Duration,
}

impl Sequencer {
	/// Creates a sequencer resuming after `last_sequence_number` (zero for new documents).
	pub fn new(key: DocumentKey, last_sequence_number: SequenceNumber, client_timeout: Duration) -> Self {
		Self {
			key,
			state: SequencerState::Created,
			sequence_number: last_sequence_number,
			minimum_sequence_number: last_sequence_number,
			clients: BTreeMap::new(),
			client_timeout,
		}
	}

	/// Current lifecycle state.
	pub fn state(&self) -> SequencerState {
		self.state
	}

	/// Last assigned sequence number.
	pub fn sequence_number(&self) -> SequenceNumber {
		self.sequence_number
	}

	/// Current minimum sequence number.
	pub fn minimum_sequence_number(&self) -> SequenceNumber {
		self.minimum_sequence_number
	}

	/// Returns true while `client_id` is joined.
	pub fn is_connected(&self, client_id: &ClientId) -> bool {
		self.clients.contains_key(client_id)
	}

	/// Number of joined clients.
	pub fn client_count(&self) -> usize {
		self.clients.len()
	}

	/// Validates and sequences one raw operation.
	///
	/// Returns `Ok(None)` for inputs that are dropped without a reply
	/// (duplicate joins, leaves of unknown clients, replayed client sequence
	/// numbers).
	///
	/// # Errors
	///
	/// [`SequencerError::Closed`] once [`close`](Self::close) has been called.
	pub fn process(&mut self, raw: RawOperation, now: Instant) -> Result<Option<Delta>, SequencerError> {
		if self.state == SequencerState::Closed {
			return Err(SequencerError::Closed);
		}
		self.state = SequencerState::Active;

		let Some(client_id) = raw.client_id.clone() else {
			return Ok(self.process_system(raw, now));
		};

		let Some(record) = self.clients.get_mut(&client_id) else {
			tracing::debug!(doc = %self.key, client = %client_id, "nack: unknown client");
			return Ok(Some(Self::nack(raw, client_id, NackReason::UnknownClient)));
		};

		let csn = raw.operation.client_sequence_number;
		if csn <= record.client_sequence_number {
			tracing::debug!(
				doc = %self.key,
				client = %client_id,
				csn,
				last = record.client_sequence_number,
				"dropping replayed client sequence number"
			);
			return Ok(None);
		}

		let reference = match raw.operation.reference_sequence_number {
			Some(rsn) if rsn >= self.minimum_sequence_number && rsn <= self.sequence_number => rsn,
			reference => {
				let reason = NackReason::InvalidReferenceSequenceNumber {
					reference,
					minimum: self.minimum_sequence_number,
					current: self.sequence_number,
				};
				tracing::debug!(doc = %self.key, client = %client_id, ?reason, "nack: bad reference");
				return Ok(Some(Self::nack(raw, client_id, reason)));
			}
		};

		record.client_sequence_number = csn;
		record.reference_sequence_number = record.reference_sequence_number.max(reference);
		record.last_update = now;

		Ok(Some(Delta::Sequenced(self.assign(raw))))
	}

	fn process_system(&mut self, raw: RawOperation, now: Instant) -> Option<Delta> {
		match &raw.operation.contents {
			MessageContents::ClientJoin(join) => {
				if self.clients.contains_key(&join.client_id) {
					tracing::debug!(doc = %self.key, client = %join.client_id, "ignoring duplicate join");
					return None;
				}
				self.clients.insert(
					join.client_id.clone(),
					ClientRecord {
						reference_sequence_number: self.minimum_sequence_number,
						client_sequence_number: 0,
						last_update: now,
					},
				);
				tracing::debug!(doc = %self.key, client = %join.client_id, "client joined");
			}
			MessageContents::ClientLeave(client_id) => {
				if self.clients.remove(client_id).is_none() {
					tracing::debug!(doc = %self.key, client = %client_id, "ignoring leave of unknown client");
					return None;
				}
				tracing::debug!(doc = %self.key, client = %client_id, "client left");
			}
			_ => {}
		}
		Some(Delta::Sequenced(self.assign(raw)))
	}

	/// Evicts every client silent for longer than the client timeout, sequencing
	/// a synthetic leave for each.
	///
	/// # Errors
	///
	/// [`SequencerError::Closed`] once [`close`](Self::close) has been called.
	pub fn expire_idle(&mut self, now: Instant) -> Result<Vec<Delta>, SequencerError> {
		if self.state == SequencerState::Closed {
			return Err(SequencerError::Closed);
		}

		let expired: Vec<ClientId> = self
			.clients
			.iter()
			.filter(|(_, record)| now.saturating_duration_since(record.last_update) >= self.client_timeout)
			.map(|(id, _)| id.clone())
			.collect();

		let mut deltas = Vec::with_capacity(expired.len());
		for client_id in expired {
			tracing::info!(doc = %self.key, client = %client_id, "evicting idle client");
			let leave = RawOperation {
				key: self.key.clone(),
				client_id: None,
				user: User::default(),
				timestamp: quire_proto::now_millis(),
				operation: DocumentMessage::system(MessageContents::ClientLeave(client_id)),
			};
			if let Some(delta) = self.process(leave, now)? {
				deltas.push(delta);
			}
		}
		Ok(deltas)
	}

	/// Transitions to [`SequencerState::Closed`].
	pub fn close(&mut self) {
		self.state = SequencerState::Closed;
	}

	fn assign(&mut self, raw: RawOperation) -> SequencedOperation {
		self.sequence_number = self.sequence_number.next();
		let lowest = self
			.clients
			.values()
			.map(|record| record.reference_sequence_number)
			.min()
			.unwrap_or(self.sequence_number);
		self.minimum_sequence_number = self.minimum_sequence_number.max(lowest);

		tracing::trace!(
			doc = %self.key,
			seq = self.sequence_number.0,
			msn = self.minimum_sequence_number.0,
			kind = ?raw.operation.contents.kind(),
			"sequenced"
		);
		SequencedOperation::from_raw(raw, self.sequence_number, self.minimum_sequence_number)
	}

	fn nack(raw: RawOperation, client_id: ClientId, reason: NackReason) -> Delta {
		Delta::Nack(NackMessage {
			key: raw.key,
			client_id,
			operation: raw.operation,
			reason,
		})
	}
}

/// Spawns the task that feeds `sequencer` from `ingress` and writes to `egress`.
///
/// The task ends when the ingress log closes or the egress consumer goes away.
pub(crate) fn spawn_stage(
	mut sequencer: Sequencer,
	mut ingress: LogConsumer<RawOperation>,
	egress: LogProducer<Delta>,
	activity_check_interval: Duration,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		let mut activity_tick = interval_at(Instant::now() + activity_check_interval, activity_check_interval);
		activity_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

		loop {
			let deltas = tokio::select! {
				record = ingress.recv() => {
					let Some(record) = record else {
						break;
					};
					tracing::trace!(doc = %sequencer.key, offset = record.offset, "ingress");
					sequencer.process(record.value, Instant::now()).map(|delta| delta.into_iter().collect())
				}
				_ = activity_tick.tick() => sequencer.expire_idle(Instant::now()),
			};

			let deltas: Vec<Delta> = match deltas {
				Ok(deltas) => deltas,
				Err(err) => {
					tracing::warn!(doc = %sequencer.key, error = %err, "sequencer refused input");
					break;
				}
			};

			for delta in deltas {
				if egress.send(delta).await.is_err() {
					tracing::warn!(doc = %sequencer.key, "egress closed; stopping sequencer");
					sequencer.close();
					return;
				}
			}
		}

		sequencer.close();
		tracing::debug!(doc = %sequencer.key, seq = sequencer.sequence_number.0, "sequencer stopped");
	})
}
