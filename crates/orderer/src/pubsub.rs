//! Refcounted topic router delivering fan-out events to subscribers.
//!
//! A subscriber may be added to the same topic many times (one per
//! connection that shares it); it still receives each publish exactly once.
//! The entry disappears only when every subscribe has been matched by an
//! unsubscribe.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use quire_proto::{Event, SubscriberId, Topic};
use tokio::sync::mpsc;

use crate::error::RouterError;

/// Receiver of published events.
pub trait Subscriber: Send + Sync {
	/// Stable identity used for refcounting.
	fn id(&self) -> &SubscriberId;

	/// Delivers one event published on `topic`. Must not block.
	fn send(&self, topic: &Topic, event: &Event);
}

/// Subscriber forwarding every event into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSubscriber {
	id: SubscriberId,
	tx: mpsc::UnboundedSender<(Topic, Event)>,
}

impl ChannelSubscriber {
	/// Creates a subscriber and the receiving end of its event channel.
	pub fn new(id: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<(Topic, Event)>) {
		let (tx, rx) = mpsc::unbounded_channel();
		let subscriber = Arc::new(Self {
			id: SubscriberId(id.into()),
			tx,
		});
		(subscriber, rx)
	}
}

impl Subscriber for ChannelSubscriber {
	fn id(&self) -> &SubscriberId {
		&self.id
	}

	fn send(&self, topic: &Topic, event: &Event) {
		if self.tx.send((topic.clone(), event.clone())).is_err() {
			tracing::trace!(subscriber = %self.id, topic = %topic, "subscriber channel closed");
		}
	}
}

struct Subscription {
	subscriber: Arc<dyn Subscriber>,
	count: usize,
}

/// Topic-to-subscriber registry.
///
/// One instance is built per process by the composition root and shared by
/// every orderer and node through an `Arc`.
#[derive(Default)]
pub struct TopicRouter {
	topics: Mutex<HashMap<Topic, IndexMap<SubscriberId, Subscription>>>,
}

impl TopicRouter {
	/// Creates an empty router.
	pub fn new() -> Self {
		Self::default()
	}

	/// Adds one reference from `subscriber` to `topic`, creating the topic if needed.
	pub fn subscribe(&self, topic: &Topic, subscriber: Arc<dyn Subscriber>) {
		let mut topics = self.topics.lock();
		let subscriptions = topics.entry(topic.clone()).or_default();
		let entry = subscriptions
			.entry(subscriber.id().clone())
			.or_insert_with(|| Subscription {
				subscriber,
				count: 0,
			});
		entry.count += 1;
		tracing::trace!(topic = %topic, refcount = entry.count, "subscribe");
	}

	/// Drops one reference from `subscriber` to `topic`.
	///
	/// # Errors
	///
	/// Returns a [`RouterError`] when the topic or the subscriber is unknown;
	/// callers treat this as a programming error.
	pub fn unsubscribe(&self, topic: &Topic, subscriber: &SubscriberId) -> Result<(), RouterError> {
		let mut topics = self.topics.lock();
		let Some(subscriptions) = topics.get_mut(topic) else {
			tracing::error!(topic = %topic, subscriber = %subscriber, "unsubscribe from unknown topic");
			return Err(RouterError::UnknownTopic(topic.clone()));
		};
		let Some(entry) = subscriptions.get_mut(subscriber) else {
			tracing::error!(topic = %topic, subscriber = %subscriber, "unsubscribe of unknown subscriber");
			return Err(RouterError::UnknownSubscriber {
				topic: topic.clone(),
				subscriber: subscriber.clone(),
			});
		};

		entry.count -= 1;
		if entry.count == 0 {
			subscriptions.shift_remove(subscriber);
		}
		if subscriptions.is_empty() {
			topics.remove(topic);
		}
		Ok(())
	}

	/// Delivers `event` to every current subscriber of `topic`, in subscription order.
	///
	/// Publishing to a topic nobody listens on is a no-op.
	pub fn publish(&self, topic: &Topic, event: &Event) {
		let targets: Vec<Arc<dyn Subscriber>> = {
			let topics = self.topics.lock();
			match topics.get(topic) {
				Some(subscriptions) => subscriptions
					.values()
					.map(|s| Arc::clone(&s.subscriber))
					.collect(),
				None => return,
			}
		};

		for subscriber in targets {
			subscriber.send(topic, event);
		}
	}

	/// Returns the refcount of `subscriber` on `topic` (zero when absent).
	pub fn refcount(&self, topic: &Topic, subscriber: &SubscriberId) -> usize {
		self.topics
			.lock()
			.get(topic)
			.and_then(|subscriptions| subscriptions.get(subscriber))
			.map_or(0, |s| s.count)
	}

	/// Returns true when at least one subscriber listens on `topic`.
	pub fn has_topic(&self, topic: &Topic) -> bool {
		self.topics.lock().contains_key(topic)
	}
}
