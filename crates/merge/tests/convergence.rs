//! Replicas fed the same sequenced stream converge.

use quire_merge::{LocalOp, MergeClient};
use quire_proto::{ClientId, DocumentKey, SequenceNumber, SequencedOperation, User};

/// Stands in for the orderer: numbers submissions in arrival order.
#[derive(Default)]
struct Log {
	ops: Vec<SequencedOperation>,
}

impl Log {
	fn sequence(&mut self, client: &MergeClient, op: &LocalOp) {
		let seq = self.ops.len() as u64 + 1;
		self.ops.push(SequencedOperation {
			key: DocumentKey::new("acme", "notes"),
			client_id: Some(client.client_id().clone()),
			user: User::new(client.client_id().as_str()),
			timestamp: 0,
			operation: op.to_document_message().unwrap(),
			sequence_number: SequenceNumber(seq),
			minimum_sequence_number: SequenceNumber(0),
		});
	}

	/// Delivers everything `replica` has not applied yet.
	fn catch_up(&self, replica: &mut MergeClient) {
		let applied = replica.reference_sequence_number().0 as usize;
		for msg in &self.ops[applied..] {
			replica.apply_msg(msg).unwrap();
		}
	}
}

fn replicas() -> (MergeClient, MergeClient, MergeClient) {
	(
		MergeClient::new(ClientId::from("a")),
		MergeClient::new(ClientId::from("b")),
		MergeClient::new(ClientId::from("observer")),
	)
}

fn seeded(text: &str) -> (Log, MergeClient, MergeClient, MergeClient) {
	let (mut a, mut b, mut observer) = replicas();
	let mut log = Log::default();
	let op = a.insert_text_local(0, text).unwrap();
	log.sequence(&a, &op);
	for replica in [&mut a, &mut b, &mut observer] {
		log.catch_up(replica);
	}
	(log, a, b, observer)
}

fn assert_converged(log: &Log, replicas: [&mut MergeClient; 3], expected: &str) {
	for replica in replicas {
		log.catch_up(replica);
		assert_eq!(replica.text(), expected, "replica {}", replica.client_id());
		assert_eq!(replica.pending_count(), 0);
	}
}

#[test]
fn concurrent_inserts_at_one_position_order_by_sequence() {
	let (mut log, mut a, mut b, mut observer) = seeded("hello");
	let x = a.insert_text_local(5, "X").unwrap();
	let y = b.insert_text_local(5, "Y").unwrap();

	log.sequence(&b, &y);
	log.sequence(&a, &x);

	assert_converged(&log, [&mut a, &mut b, &mut observer], "helloXY");
}

#[test]
fn remove_spares_text_inserted_concurrently_inside_it() {
	let (mut log, mut a, mut b, mut observer) = seeded("hello");
	let remove = a.remove_range_local(1, 4).unwrap();
	let insert = b.insert_text_local(2, "Z").unwrap();

	log.sequence(&a, &remove);
	log.sequence(&b, &insert);

	assert_converged(&log, [&mut a, &mut b, &mut observer], "hZo");
}

#[test]
fn lost_edit_is_resubmitted_against_the_current_document() {
	let (mut log, mut a, mut b, mut observer) = seeded("abc");
	// Never reaches the log.
	a.insert_text_local(1, "X").unwrap();
	let remove = b.remove_range_local(0, 2).unwrap();
	log.sequence(&b, &remove);
	log.catch_up(&mut a);
	assert_eq!(a.text(), "Xc");

	let correctives = a.reset_pending_segments_to_op();
	assert_eq!(correctives.len(), 1);
	assert_eq!(correctives[0].reference_sequence_number, SequenceNumber(2));
	for op in &correctives {
		log.sequence(&a, op);
	}

	assert_converged(&log, [&mut a, &mut b, &mut observer], "Xc");
}
