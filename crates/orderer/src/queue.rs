//! Bounded in-memory log standing in for a partitioned message log.
//!
//! Every record is stamped with a gap-free offset at the moment it enters the
//! channel, so offsets always match consumption order. Producers are cheap to
//! clone; closing any clone closes the log for all of them.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::QueueError;

/// A value with its position in the log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord<T> {
	/// Position of the record, starting at the log's initial offset.
	pub offset: u64,
	/// The payload.
	pub value: T,
}

struct ProducerState<T> {
	next_offset: u64,
	tx: mpsc::Sender<LogRecord<T>>,
}

/// Write side of an in-memory log.
pub struct LogProducer<T> {
	inner: Arc<Mutex<Option<ProducerState<T>>>>,
}

impl<T> Clone for LogProducer<T> {
	fn clone(&self) -> Self {
		Self {
			inner: Arc::clone(&self.inner),
		}
	}
}

/// Read side of an in-memory log.
pub type LogConsumer<T> = mpsc::Receiver<LogRecord<T>>;

/// Creates a log holding at most `capacity` unconsumed records, with offsets
/// starting at `initial_offset`.
pub fn log<T>(capacity: usize, initial_offset: u64) -> (LogProducer<T>, LogConsumer<T>) {
	let (tx, rx) = mpsc::channel(capacity.max(1));
	let producer = LogProducer {
		inner: Arc::new(Mutex::new(Some(ProducerState {
			next_offset: initial_offset,
			tx,
		}))),
	};
	(producer, rx)
}

impl<T> LogProducer<T> {
	/// Appends without waiting.
	///
	/// # Errors
	///
	/// [`QueueError::Full`] when at capacity, [`QueueError::Closed`] after close.
	pub fn try_send(&self, value: T) -> Result<u64, QueueError> {
		let mut guard = self.inner.lock();
		let state = guard.as_mut().ok_or(QueueError::Closed)?;
		let offset = state.next_offset;
		match state.tx.try_send(LogRecord { offset, value }) {
			Ok(()) => {
				state.next_offset += 1;
				Ok(offset)
			}
			Err(mpsc::error::TrySendError::Full(_)) => Err(QueueError::Full),
			Err(mpsc::error::TrySendError::Closed(_)) => Err(QueueError::Closed),
		}
	}

	/// Appends, waiting for capacity.
	///
	/// # Errors
	///
	/// [`QueueError::Closed`] when the log is closed or the consumer is gone.
	pub async fn send(&self, value: T) -> Result<u64, QueueError> {
		let tx = self
			.inner
			.lock()
			.as_ref()
			.map(|state| state.tx.clone())
			.ok_or(QueueError::Closed)?;
		let permit = tx.reserve().await.map_err(|_| QueueError::Closed)?;

		let mut guard = self.inner.lock();
		let state = guard.as_mut().ok_or(QueueError::Closed)?;
		let offset = state.next_offset;
		state.next_offset += 1;
		permit.send(LogRecord { offset, value });
		Ok(offset)
	}

	/// Closes the log. Buffered records are still delivered; later appends fail.
	///
	/// Returns false when the log was already closed.
	pub fn close(&self) -> bool {
		self.inner.lock().take().is_some()
	}

	/// Returns true once [`close`](Self::close) has been called.
	pub fn is_closed(&self) -> bool {
		self.inner.lock().is_none()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn offsets_continue_from_initial_offset() {
		let (producer, mut consumer) = log::<&str>(4, 10);
		assert_eq!(producer.try_send("a"), Ok(10));
		assert_eq!(producer.send("b").await, Ok(11));

		assert_eq!(consumer.recv().await.unwrap().offset, 10);
		let second = consumer.recv().await.unwrap();
		assert_eq!((second.offset, second.value), (11, "b"));
	}

	#[tokio::test]
	async fn full_log_rejects_without_consuming_an_offset() {
		let (producer, mut consumer) = log::<u8>(1, 0);
		assert_eq!(producer.try_send(1), Ok(0));
		assert_eq!(producer.try_send(2), Err(QueueError::Full));

		assert_eq!(consumer.recv().await.unwrap().offset, 0);
		assert_eq!(producer.try_send(3), Ok(1));
	}

	#[tokio::test]
	async fn close_drains_then_ends_the_consumer() {
		let (producer, mut consumer) = log::<u8>(4, 0);
		let clone = producer.clone();
		producer.try_send(1).unwrap();

		assert!(clone.close());
		assert!(!producer.close());
		assert_eq!(producer.try_send(2), Err(QueueError::Closed));

		assert_eq!(consumer.recv().await.unwrap().value, 1);
		assert!(consumer.recv().await.is_none());
	}
}
