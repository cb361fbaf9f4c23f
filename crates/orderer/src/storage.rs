//! Storage collaborators consumed by the orderer.
//!
//! Production deployments back these with a document database, a durable
//! delta log and a task queue. The in-memory implementations here serve
//! single-process deployments and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use quire_proto::{DocumentKey, SequenceNumber, SequencedOperation};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Durable per-document state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
	/// Last sequence number persisted for the document.
	pub sequence_number: SequenceNumber,
	/// Minimum sequence number at the last persisted operation.
	pub minimum_sequence_number: SequenceNumber,
	/// Parent document when this document is a branch.
	pub parent: Option<DocumentKey>,
}

/// Result of [`DocumentStorage::get_or_create_document`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentDetails {
	/// True when the document existed before the call.
	pub existing: bool,
	/// Current durable state.
	pub value: DocumentRecord,
}

/// Document metadata store.
#[async_trait]
pub trait DocumentStorage: Send + Sync {
	/// Loads the document, creating an empty record if it does not exist.
	async fn get_or_create_document(&self, key: &DocumentKey) -> Result<DocumentDetails, StorageError>;
}

/// Durable append-only log of sequenced operations.
#[async_trait]
pub trait DeltaStore: Send + Sync {
	/// Persists one sequenced operation.
	async fn append(&self, op: &SequencedOperation) -> Result<(), StorageError>;
}

/// Request for background agents to work on a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
	/// Target document.
	pub key: DocumentKey,
	/// Requested task names.
	pub tasks: Vec<String>,
	/// Sequence number of the help request.
	pub sequence_number: SequenceNumber,
}

/// Dispatcher for background agent tasks.
#[async_trait]
pub trait TaskSender: Send + Sync {
	/// Queues one task request.
	async fn send(&self, task: TaskMessage) -> Result<(), StorageError>;
}

#[derive(Debug, Default)]
struct MemoryState {
	documents: HashMap<DocumentKey, DocumentRecord>,
	deltas: HashMap<DocumentKey, Vec<SequencedOperation>>,
}

/// In-memory document store and delta log.
///
/// Appending a delta also advances the document record, so an orderer
/// reloaded from the same store resumes numbering where it stopped.
#[derive(Debug, Default)]
pub struct MemoryStorage {
	state: Mutex<MemoryState>,
}

impl MemoryStorage {
	/// Creates an empty store.
	pub fn new() -> Self {
		Self::default()
	}

	/// Creates a branch record pointing at `parent`.
	pub fn create_branch(&self, key: DocumentKey, parent: DocumentKey) {
		self.state.lock().documents.insert(
			key,
			DocumentRecord {
				parent: Some(parent),
				..DocumentRecord::default()
			},
		);
	}

	/// Returns every persisted delta of `key`, in append order.
	pub fn deltas(&self, key: &DocumentKey) -> Vec<SequencedOperation> {
		self.state.lock().deltas.get(key).cloned().unwrap_or_default()
	}

	/// Returns the current record of `key`, if any.
	pub fn document(&self, key: &DocumentKey) -> Option<DocumentRecord> {
		self.state.lock().documents.get(key).cloned()
	}
}

#[async_trait]
impl DocumentStorage for MemoryStorage {
	async fn get_or_create_document(&self, key: &DocumentKey) -> Result<DocumentDetails, StorageError> {
		let mut state = self.state.lock();
		if let Some(record) = state.documents.get(key) {
			return Ok(DocumentDetails {
				existing: true,
				value: record.clone(),
			});
		}
		let record = DocumentRecord::default();
		state.documents.insert(key.clone(), record.clone());
		tracing::debug!(doc = %key, "created document");
		Ok(DocumentDetails {
			existing: false,
			value: record,
		})
	}
}

#[async_trait]
impl DeltaStore for MemoryStorage {
	async fn append(&self, op: &SequencedOperation) -> Result<(), StorageError> {
		let mut state = self.state.lock();
		let record = state.documents.entry(op.key.clone()).or_default();
		record.sequence_number = record.sequence_number.max(op.sequence_number);
		record.minimum_sequence_number = record.minimum_sequence_number.max(op.minimum_sequence_number);
		state.deltas.entry(op.key.clone()).or_default().push(op.clone());
		Ok(())
	}
}

/// Task dispatcher collecting tasks in memory.
#[derive(Debug, Default)]
pub struct MemoryTaskQueue {
	tasks: Mutex<Vec<TaskMessage>>,
}

impl MemoryTaskQueue {
	/// Creates an empty queue.
	pub fn new() -> Self {
		Self::default()
	}

	/// Removes and returns every queued task.
	pub fn drain(&self) -> Vec<TaskMessage> {
		std::mem::take(&mut *self.tasks.lock())
	}
}

#[async_trait]
impl TaskSender for MemoryTaskQueue {
	async fn send(&self, task: TaskMessage) -> Result<(), StorageError> {
		tracing::debug!(doc = %task.key, tasks = ?task.tasks, "queued agent tasks");
		self.tasks.lock().push(task);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use quire_proto::{DocumentMessage, MessageContents, User};

	use super::*;

	fn op(key: &DocumentKey, seq: u64) -> SequencedOperation {
		SequencedOperation {
			key: key.clone(),
			client_id: None,
			user: User::default(),
			timestamp: 0,
			operation: DocumentMessage::system(MessageContents::NoOp),
			sequence_number: SequenceNumber(seq),
			minimum_sequence_number: SequenceNumber(seq - 1),
		}
	}

	#[tokio::test]
	async fn second_load_reports_existing() {
		let storage = MemoryStorage::new();
		let key = DocumentKey::new("t", "d");
		assert!(!storage.get_or_create_document(&key).await.unwrap().existing);
		assert!(storage.get_or_create_document(&key).await.unwrap().existing);
	}

	#[tokio::test]
	async fn appends_advance_the_document_record() {
		let storage = MemoryStorage::new();
		let key = DocumentKey::new("t", "d");
		storage.append(&op(&key, 1)).await.unwrap();
		storage.append(&op(&key, 2)).await.unwrap();

		let details = storage.get_or_create_document(&key).await.unwrap();
		assert!(details.existing);
		assert_eq!(details.value.sequence_number, SequenceNumber(2));
		assert_eq!(details.value.minimum_sequence_number, SequenceNumber(1));
		assert_eq!(storage.deltas(&key).len(), 2);
	}

	#[tokio::test]
	async fn branches_record_their_parent() {
		let storage = MemoryStorage::new();
		let parent = DocumentKey::new("t", "main");
		let branch = DocumentKey::new("t", "feature");
		storage.create_branch(branch.clone(), parent.clone());

		let details = storage.get_or_create_document(&branch).await.unwrap();
		assert_eq!(details.value.parent, Some(parent));
	}
}
