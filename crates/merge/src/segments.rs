//! Linear segment list with pending-edit tracking.
//!
//! Text is held as an ordered list of segments. A segment is never edited in
//! place: edits that start or end inside one split it first. The left piece
//! keeps the segment's identity; the right piece gets a new id and joins every
//! pending group the original belonged to, right after it.
//!
//! Every local edit not yet acknowledged by the orderer is a pending group
//! keyed by its client sequence number. Groups list their segments in
//! document order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;

use quire_proto::{ClientId, SequenceNumber};

use crate::error::MergeError;
use crate::ops::{MergeOp, PropertySet, apply_properties};

/// Identity of a segment within one client's list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentId(u64);

/// Who made a change, and whether the orderer has sequenced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Stamp {
	Acked {
		seq: SequenceNumber,
		client: Option<ClientId>,
	},
	Pending {
		csn: i64,
	},
}

impl Stamp {
	fn is_acked(&self) -> bool {
		matches!(self, Self::Acked { .. })
	}

	/// Whether an op from `view.client` at `view.reference` has seen this change.
	fn seen_by(&self, view: &View<'_>) -> bool {
		match self {
			Self::Acked { seq, client } => {
				*seq <= view.reference || (view.client.is_some() && client.as_ref() == view.client)
			}
			Self::Pending { .. } => false,
		}
	}
}

/// Perspective of a sequenced op: its submitter and reference sequence number.
#[derive(Debug, Clone, Copy)]
pub(crate) struct View<'a> {
	pub client: Option<&'a ClientId>,
	pub reference: SequenceNumber,
}

#[derive(Debug, Clone)]
pub(crate) struct Segment {
	id: SegmentId,
	text: String,
	/// Length in characters.
	len: usize,
	props: PropertySet,
	inserted: Stamp,
	removed: Option<Stamp>,
}

impl Segment {
	fn locally_visible(&self) -> bool {
		self.removed.is_none()
	}

	fn visible_in(&self, view: &View<'_>) -> bool {
		self.inserted.seen_by(view) && !self.removed.as_ref().is_some_and(|removed| removed.seen_by(view))
	}

	fn removal_acked(&self) -> bool {
		self.removed.as_ref().is_some_and(Stamp::is_acked)
	}
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PendingKind {
	Insert,
	Remove,
	Annotate(PropertySet),
}

#[derive(Debug, Clone)]
pub(crate) struct PendingGroup {
	kind: PendingKind,
	segments: Vec<SegmentId>,
}

/// Ordered segments plus the pending groups that reference them.
#[derive(Debug, Default)]
pub(crate) struct SegmentList {
	segments: Vec<Segment>,
	pending: BTreeMap<i64, PendingGroup>,
	next_id: u64,
}

impl SegmentList {
	/// Local text length in characters.
	pub fn len(&self) -> usize {
		self.segments.iter().filter(|s| s.locally_visible()).map(|s| s.len).sum()
	}

	/// Text as the local user sees it.
	pub fn text(&self) -> String {
		self.segments
			.iter()
			.filter(|s| s.locally_visible())
			.map(|s| s.text.as_str())
			.collect()
	}

	/// Text made only of sequenced inserts minus sequenced removes.
	pub fn acked_text(&self) -> String {
		self.segments
			.iter()
			.filter(|s| s.inserted.is_acked() && !s.removal_acked())
			.map(|s| s.text.as_str())
			.collect()
	}

	/// Number of outstanding submissions.
	pub fn pending_count(&self) -> usize {
		self.pending.len()
	}

	/// Number of segments, including removed ones not yet compacted.
	#[cfg(test)]
	pub fn segment_count(&self) -> usize {
		self.segments.len()
	}

	/// Number of segments owned by the pending submission `csn`.
	#[cfg(test)]
	pub fn pending_segments(&self, csn: i64) -> Option<usize> {
		self.pending.get(&csn).map(|group| group.segments.len())
	}

	/// Properties of the character at local position `pos`.
	pub fn properties_at(&self, pos: usize) -> Option<&PropertySet> {
		let mut remaining = pos;
		for seg in self.segments.iter().filter(|s| s.locally_visible()) {
			if remaining < seg.len {
				return Some(&seg.props);
			}
			remaining -= seg.len;
		}
		None
	}

	fn alloc_id(&mut self) -> SegmentId {
		self.next_id += 1;
		SegmentId(self.next_id)
	}

	fn index_of(&self, id: SegmentId) -> Option<usize> {
		self.segments.iter().position(|s| s.id == id)
	}

	fn split(&mut self, index: usize, offset: usize) {
		let right_id = self.alloc_id();
		let seg = &mut self.segments[index];
		let byte = seg
			.text
			.char_indices()
			.nth(offset)
			.map_or(seg.text.len(), |(byte, _)| byte);
		let right = Segment {
			id: right_id,
			text: seg.text.split_off(byte),
			len: seg.len - offset,
			props: seg.props.clone(),
			inserted: seg.inserted.clone(),
			removed: seg.removed.clone(),
		};
		seg.len = offset;
		let left_id = seg.id;
		self.segments.insert(index + 1, right);

		for group in self.pending.values_mut() {
			if let Some(at) = group.segments.iter().position(|id| *id == left_id) {
				group.segments.insert(at + 1, right_id);
			}
		}
	}

	/// Index of the first segment starting at `pos` in the view described by
	/// `visible`, splitting the segment that straddles `pos` if any.
	fn boundary(&mut self, pos: usize, visible: impl Fn(&Segment) -> bool) -> usize {
		let mut remaining = pos;
		let mut index = 0;
		while index < self.segments.len() && remaining > 0 {
			let seg = &self.segments[index];
			let len = if visible(seg) { seg.len } else { 0 };
			if remaining < len {
				self.split(index, remaining);
				return index + 1;
			}
			remaining -= len;
			index += 1;
		}
		index
	}

	/// Splits at both ends of `start..end` and returns the index span between them.
	fn span<F>(&mut self, start: usize, end: usize, visible: F) -> Range<usize>
	where
		F: Fn(&Segment) -> bool + Copy,
	{
		let first = self.boundary(start, visible);
		let last = self.boundary(end, visible);
		first..last
	}

	fn check_range(&self, start: usize, end: usize) -> Result<(), MergeError> {
		let len = self.len();
		if start >= end || end > len {
			return Err(MergeError::InvalidRange { start, end, len });
		}
		Ok(())
	}

	pub fn insert_local(
		&mut self,
		pos: usize,
		text: &str,
		props: PropertySet,
		csn: i64,
	) -> Result<(), MergeError> {
		let len = self.len();
		if pos > len {
			return Err(MergeError::PositionOutOfBounds { pos, len });
		}
		if text.is_empty() {
			return Err(MergeError::EmptyText);
		}

		let index = self.boundary(pos, Segment::locally_visible);
		let id = self.alloc_id();
		self.segments.insert(
			index,
			Segment {
				id,
				text: text.to_owned(),
				len: text.chars().count(),
				props,
				inserted: Stamp::Pending { csn },
				removed: None,
			},
		);
		self.pending.insert(
			csn,
			PendingGroup {
				kind: PendingKind::Insert,
				segments: vec![id],
			},
		);
		Ok(())
	}

	pub fn remove_local(&mut self, start: usize, end: usize, csn: i64) -> Result<(), MergeError> {
		self.check_range(start, end)?;
		let span = self.span(start, end, Segment::locally_visible);
		let mut ids = Vec::new();
		for seg in &mut self.segments[span] {
			if seg.locally_visible() {
				seg.removed = Some(Stamp::Pending { csn });
				ids.push(seg.id);
			}
		}
		self.pending.insert(
			csn,
			PendingGroup {
				kind: PendingKind::Remove,
				segments: ids,
			},
		);
		Ok(())
	}

	pub fn annotate_local(
		&mut self,
		start: usize,
		end: usize,
		props: PropertySet,
		csn: i64,
	) -> Result<(), MergeError> {
		self.check_range(start, end)?;
		let span = self.span(start, end, Segment::locally_visible);
		let mut ids = Vec::new();
		for seg in &mut self.segments[span] {
			if seg.locally_visible() {
				apply_properties(&mut seg.props, &props);
				ids.push(seg.id);
			}
		}
		self.pending.insert(
			csn,
			PendingGroup {
				kind: PendingKind::Annotate(props),
				segments: ids,
			},
		);
		Ok(())
	}

	/// Marks the submission `csn` as sequenced at `seq`. Returns false when no
	/// such submission is pending.
	pub fn ack(&mut self, csn: i64, seq: SequenceNumber, client: &ClientId) -> bool {
		let Some(group) = self.pending.remove(&csn) else {
			return false;
		};
		let ids: HashSet<SegmentId> = group.segments.iter().copied().collect();
		let stamp = Stamp::Acked {
			seq,
			client: Some(client.clone()),
		};

		for seg in self.segments.iter_mut().filter(|s| ids.contains(&s.id)) {
			match group.kind {
				PendingKind::Insert => seg.inserted = stamp.clone(),
				PendingKind::Remove => {
					if seg.removed == Some(Stamp::Pending { csn }) {
						seg.removed = Some(stamp.clone());
					}
				}
				PendingKind::Annotate(_) => {}
			}
		}
		true
	}

	/// Applies an op sequenced for another client.
	pub fn apply_remote(&mut self, op: &MergeOp, seq: SequenceNumber, view: View<'_>) {
		let visible = |seg: &Segment| seg.visible_in(&view);
		let stamp = Stamp::Acked {
			seq,
			client: view.client.cloned(),
		};

		match op {
			MergeOp::Insert { pos, text, props } => {
				if text.is_empty() {
					return;
				}
				let mut index = self.boundary(*pos, visible);
				// Unsequenced local inserts will be ordered after this op.
				while index < self.segments.len() && !self.segments[index].inserted.is_acked() {
					index += 1;
				}
				let id = self.alloc_id();
				self.segments.insert(
					index,
					Segment {
						id,
						text: text.clone(),
						len: text.chars().count(),
						props: props.clone(),
						inserted: stamp,
						removed: None,
					},
				);
			}
			MergeOp::Remove { start, end } => {
				let span = self.span(*start, *end, visible);
				for seg in &mut self.segments[span] {
					if seg.visible_in(&view) && !seg.removal_acked() {
						seg.removed = Some(stamp.clone());
					}
				}
			}
			MergeOp::Annotate { start, end, props } => {
				let span = self.span(*start, *end, visible);
				// After splitting, so right pieces carry their group's keys.
				let shadowed = self.pending_annotation_keys();
				for seg in &mut self.segments[span] {
					if !seg.visible_in(&view) {
						continue;
					}
					// Local annotations still in flight win over earlier sequenced ones.
					let changes: PropertySet = props
						.iter()
						.filter(|(key, _)| !shadowed.get(&seg.id).is_some_and(|keys| keys.contains(*key)))
						.map(|(key, value)| (key.clone(), value.clone()))
						.collect();
					apply_properties(&mut seg.props, &changes);
				}
			}
		}
	}

	fn pending_annotation_keys(&self) -> HashMap<SegmentId, HashSet<String>> {
		let mut keys: HashMap<SegmentId, HashSet<String>> = HashMap::new();
		for group in self.pending.values() {
			if let PendingKind::Annotate(props) = &group.kind {
				for id in &group.segments {
					keys.entry(*id).or_default().extend(props.keys().cloned());
				}
			}
		}
		keys
	}

	/// Drops removed segments every client has seen removed.
	pub fn compact(&mut self, minimum: SequenceNumber) {
		let referenced: HashSet<SegmentId> = self
			.pending
			.values()
			.flat_map(|group| group.segments.iter().copied())
			.collect();
		self.segments.retain(|seg| {
			referenced.contains(&seg.id)
				|| !matches!(&seg.removed, Some(Stamp::Acked { seq, .. }) if *seq <= minimum)
		});
	}

	/// Replaces every pending group with corrective ops, one per live segment,
	/// numbered from `first_csn`.
	///
	/// Offsets are computed against what the orderer will hold once the
	/// preceding corrective ops are sequenced: acknowledged inserts and inserts
	/// already resubmitted, minus acknowledged and resubmitted removes.
	/// Segments inserted and removed locally without either being sequenced are
	/// dropped without emitting anything.
	pub fn reset(&mut self, first_csn: i64) -> Vec<(i64, MergeOp)> {
		let groups = std::mem::take(&mut self.pending);
		let mut resubmitted_inserts: HashSet<SegmentId> = HashSet::new();
		let mut resubmitted_removes: HashSet<SegmentId> = HashSet::new();
		let mut dead: HashSet<SegmentId> = HashSet::new();
		let mut ops = Vec::new();
		let mut csn = first_csn;

		for group in groups.into_values() {
			for id in group.segments {
				if dead.contains(&id) {
					continue;
				}
				let Some(index) = self.index_of(id) else {
					continue;
				};
				let seg = &self.segments[index];
				let offset = || self.peer_offset(index, &resubmitted_inserts, &resubmitted_removes);

				let op = match &group.kind {
					PendingKind::Insert => {
						if matches!(seg.removed, Some(Stamp::Pending { .. })) {
							dead.insert(id);
							continue;
						}
						MergeOp::Insert {
							pos: offset(),
							text: seg.text.clone(),
							props: seg.props.clone(),
						}
					}
					PendingKind::Remove => {
						if seg.removal_acked() {
							continue;
						}
						let start = offset();
						MergeOp::Remove {
							start,
							end: start + seg.len,
						}
					}
					PendingKind::Annotate(props) => {
						if resubmitted_inserts.contains(&id) || seg.removal_acked() {
							continue;
						}
						let start = offset();
						MergeOp::Annotate {
							start,
							end: start + seg.len,
							props: props.clone(),
						}
					}
				};

				let seg = &mut self.segments[index];
				let kind = match &op {
					MergeOp::Insert { .. } => {
						seg.inserted = Stamp::Pending { csn };
						resubmitted_inserts.insert(id);
						PendingKind::Insert
					}
					MergeOp::Remove { .. } => {
						seg.removed = Some(Stamp::Pending { csn });
						resubmitted_removes.insert(id);
						PendingKind::Remove
					}
					MergeOp::Annotate { props, .. } => PendingKind::Annotate(props.clone()),
				};
				self.pending.insert(
					csn,
					PendingGroup {
						kind,
						segments: vec![id],
					},
				);
				ops.push((csn, op));
				csn += 1;
			}
		}

		self.segments.retain(|seg| !dead.contains(&seg.id));
		ops
	}

	fn peer_offset(
		&self,
		index: usize,
		resubmitted_inserts: &HashSet<SegmentId>,
		resubmitted_removes: &HashSet<SegmentId>,
	) -> usize {
		self.segments[..index]
			.iter()
			.filter(|seg| {
				let inserted = seg.inserted.is_acked() || resubmitted_inserts.contains(&seg.id);
				let removed = seg.removal_acked() || resubmitted_removes.contains(&seg.id);
				inserted && !removed
			})
			.map(|seg| seg.len)
			.sum()
	}
}
