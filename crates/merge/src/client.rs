//! Client-side merge session.

use quire_proto::{ClientId, SequenceNumber, SequencedOperation};
use tracing::{debug, trace, warn};

use crate::error::MergeError;
use crate::ops::{LocalOp, MergeOp, PropertySet};
use crate::segments::{SegmentList, View};

/// One client's view of a shared text.
///
/// Local edits apply immediately and are tracked as pending until the orderer
/// echoes them back. Sequenced messages from other clients are merged as they
/// arrive. After a nack or a reconnect, [`reset_pending_segments_to_op`]
/// regenerates everything still pending as fresh submissions.
///
/// [`reset_pending_segments_to_op`]: Self::reset_pending_segments_to_op
#[derive(Debug)]
pub struct MergeClient {
	client_id: ClientId,
	segments: SegmentList,
	last_csn: i64,
	reference: SequenceNumber,
	minimum: SequenceNumber,
}

impl MergeClient {
	/// Starts an empty session for `client_id`.
	pub fn new(client_id: ClientId) -> Self {
		Self {
			client_id,
			segments: SegmentList::default(),
			last_csn: 0,
			reference: SequenceNumber::default(),
			minimum: SequenceNumber::default(),
		}
	}

	/// Identity acknowledgements are matched against.
	pub fn client_id(&self) -> &ClientId {
		&self.client_id
	}

	/// Adopts the identity assigned on reconnect. Pending edits are kept and
	/// will be acknowledged under the new identity once resubmitted.
	pub fn update_client_id(&mut self, client_id: ClientId) {
		debug!(old = %self.client_id, new = %client_id, "merge client identity changed");
		self.client_id = client_id;
	}

	/// The local text, pending edits included.
	pub fn text(&self) -> String {
		self.segments.text()
	}

	/// The text as sequenced so far, without pending local edits.
	pub fn acked_text(&self) -> String {
		self.segments.acked_text()
	}

	/// Local text length in characters.
	pub fn len(&self) -> usize {
		self.segments.len()
	}

	/// Whether the local text is empty.
	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Last sequence number applied.
	pub fn reference_sequence_number(&self) -> SequenceNumber {
		self.reference
	}

	/// Highest minimum sequence number observed.
	pub fn minimum_sequence_number(&self) -> SequenceNumber {
		self.minimum
	}

	/// Number of submissions awaiting acknowledgement.
	pub fn pending_count(&self) -> usize {
		self.segments.pending_count()
	}

	/// Properties of the character at `pos`.
	pub fn properties_at(&self, pos: usize) -> Option<&PropertySet> {
		self.segments.properties_at(pos)
	}

	fn stamp(&self, csn: i64, op: MergeOp) -> LocalOp {
		LocalOp {
			client_sequence_number: csn,
			reference_sequence_number: self.reference,
			op,
		}
	}

	/// Inserts plain text at `pos`.
	///
	/// # Errors
	///
	/// See [`insert_local`](Self::insert_local).
	pub fn insert_text_local(&mut self, pos: usize, text: &str) -> Result<LocalOp, MergeError> {
		self.insert_local(pos, text, PropertySet::new())
	}

	/// Inserts `text` carrying `props` at `pos`.
	///
	/// # Errors
	///
	/// [`MergeError::PositionOutOfBounds`] past the end of the text,
	/// [`MergeError::EmptyText`] for an empty insert.
	pub fn insert_local(&mut self, pos: usize, text: &str, props: PropertySet) -> Result<LocalOp, MergeError> {
		let csn = self.last_csn + 1;
		self.segments.insert_local(pos, text, props.clone(), csn)?;
		self.last_csn = csn;
		Ok(self.stamp(
			csn,
			MergeOp::Insert {
				pos,
				text: text.to_owned(),
				props,
			},
		))
	}

	/// Removes `start..end`.
	///
	/// # Errors
	///
	/// [`MergeError::InvalidRange`] for an empty, reversed or out-of-bounds range.
	pub fn remove_range_local(&mut self, start: usize, end: usize) -> Result<LocalOp, MergeError> {
		let csn = self.last_csn + 1;
		self.segments.remove_local(start, end, csn)?;
		self.last_csn = csn;
		Ok(self.stamp(csn, MergeOp::Remove { start, end }))
	}

	/// Merges `props` into `start..end`.
	///
	/// # Errors
	///
	/// [`MergeError::InvalidRange`] for an empty, reversed or out-of-bounds range.
	pub fn annotate_range_local(
		&mut self,
		start: usize,
		end: usize,
		props: PropertySet,
	) -> Result<LocalOp, MergeError> {
		let csn = self.last_csn + 1;
		self.segments.annotate_local(start, end, props.clone(), csn)?;
		self.last_csn = csn;
		Ok(self.stamp(csn, MergeOp::Annotate { start, end, props }))
	}

	/// Applies one message from the document's sequenced stream.
	///
	/// Messages submitted by this client acknowledge the matching pending
	/// edit; acknowledgements for submissions superseded by a reset are
	/// ignored. Messages from other clients are merged. System messages only
	/// advance the counters.
	///
	/// # Errors
	///
	/// [`MergeError::Decode`] if another client's op is not a merge op. The
	/// counters still advance so later messages apply.
	pub fn apply_msg(&mut self, msg: &SequencedOperation) -> Result<(), MergeError> {
		let seq = msg.sequence_number;
		if seq <= self.reference {
			trace!(%seq, reference = %self.reference, "skipping already applied message");
			return Ok(());
		}
		self.reference = seq;
		self.minimum = self.minimum.max(msg.minimum_sequence_number);

		let result = if msg.client_id.as_ref() == Some(&self.client_id) {
			let csn = msg.operation.client_sequence_number;
			if !self.segments.ack(csn, seq, &self.client_id) {
				trace!(csn, %seq, "acknowledgement for superseded submission");
			}
			Ok(())
		} else {
			self.apply_remote(msg, seq)
		};

		self.segments.compact(self.minimum);
		result
	}

	fn apply_remote(&mut self, msg: &SequencedOperation, seq: SequenceNumber) -> Result<(), MergeError> {
		let op = match MergeOp::from_contents(&msg.operation.contents) {
			Ok(Some(op)) => op,
			Ok(None) => return Ok(()),
			Err(err) => {
				warn!(%seq, error = %err, "dropping undecodable sequenced op");
				return Err(err);
			}
		};
		let reference = msg
			.operation
			.reference_sequence_number
			.unwrap_or(SequenceNumber(seq.0.saturating_sub(1)));
		let view = View {
			client: msg.client_id.as_ref(),
			reference,
		};
		self.segments.apply_remote(&op, seq, view);
		Ok(())
	}

	/// Regenerates every pending edit as new submissions against the current
	/// reference sequence number.
	///
	/// The previous submissions are forgotten: their acknowledgements, if they
	/// still arrive, are ignored. A pending edit split by remote inserts yields
	/// one op per piece. Text inserted and removed locally without either being
	/// sequenced yields nothing.
	pub fn reset_pending_segments_to_op(&mut self) -> Vec<LocalOp> {
		let before = self.segments.pending_count();
		let ops = self.segments.reset(self.last_csn + 1);
		if let Some((csn, _)) = ops.last() {
			self.last_csn = *csn;
		}
		debug!(
			client_id = %self.client_id,
			superseded = before,
			resubmitted = ops.len(),
			"reset pending segments"
		);
		ops.into_iter().map(|(csn, op)| self.stamp(csn, op)).collect()
	}

	#[cfg(test)]
	pub(crate) fn segments(&self) -> &SegmentList {
		&self.segments
	}
}
