//! Per-document ordering service for collaborative editing.
//!
//! # Purpose
//!
//! - Assign every operation submitted to a document a gap-free, strictly increasing sequence number.
//! - Fan the sequenced stream out to persistence, broadcast and agent task dispatch, isolating sink failures.
//! - Offer the same `connect` / `order` / `disconnect` contract whether the document's orderer runs in this process or on a peer node.
//! - Exclude client-side reconciliation of unacknowledged edits; see the `quire-merge` crate.
//!
//! # Mental model
//!
//! - A [`LocalOrderer`] is a two-stage pipeline: ingress log → [`Sequencer`] → egress log → [`FanOut`].
//!   Each stage is one task; a single consumer per log is what makes the order total.
//! - Connecting registers the client's subscriber on the document topic and on the client's private topic,
//!   then queues a join ahead of anything the client submits.
//! - The broadcast sink publishes through the process-wide [`TopicRouter`]; the originating client sees its own
//!   operations come back and uses them as acknowledgements.
//! - Refused operations come back as nacks on the client topic; the client is expected to reset and resubmit.
//! - A [`RemoteNode`] multiplexes many connections over one [`NodeTransport`]; its peer runs [`LocalNode::serve`].
//! - [`OrdererRuntime`] is the composition root: no router or collaborator is global.
//!
//! # Key types
//!
//! | Type | Meaning | Constraints | Constructed / mutated in |
//! |---|---|---|---|
//! | [`TopicRouter`] | Refcounted topic → subscriber registry | MUST deliver once per publish regardless of refcount | `TopicRouter::subscribe`, `TopicRouter::unsubscribe` |
//! | [`Sequencer`] | Per-document ordering state machine | MUST only sequence ops from joined clients | `Sequencer::process`, `Sequencer::expire_idle` |
//! | [`FanOut`] | Ordered sink set | MUST offer every delta to every sink in registration order | `FanOut::handle` |
//! | [`LocalOrderer`] | In-process pipeline for one document | MUST queue the join before returning the connection | `LocalOrderer::load`, `LocalOrderer::connect` |
//! | [`RemoteNode`] | Proxy for a peer node | MUST resolve every pending connect exactly once | `RemoteNode::connect`, inbound pump |
//! | [`LocalNode`] | Host side of the node protocol | MUST disconnect a peer's connections when its transport closes | `LocalNode::serve` |
//! | [`ConcreteNode`] | Local or remote orderer location | None | `OrdererRuntime::local_handle`, callers |
//!
//! # Invariants
//!
//! 1. Sequence numbers MUST be strictly increasing and gap-free per document, resuming after the last durable one.
//!    - Enforced in: `Sequencer::assign`, `LocalOrderer::load`
//!    - Tested by: `sequencer::tests::sequence_numbers_are_gap_free_from_the_durable_start`, `local::tests::reload_resumes_numbering_from_storage`
//!    - Failure symptom: clients apply operations in different orders and diverge.
//!
//! 2. Operations from unknown or departed clients MUST be nacked and never sequenced.
//!    - Enforced in: `Sequencer::process`
//!    - Tested by: `sequencer::tests::operations_from_unknown_clients_are_nacked`
//!    - Failure symptom: an evicted client's stale edits land on top of state it never saw.
//!
//! 3. The minimum sequence number MUST never decrease.
//!    - Enforced in: `Sequencer::assign`
//!    - Tested by: `sequencer::tests::minimum_sequence_number_tracks_the_slowest_client`
//!    - Failure symptom: clients discard history another client still references.
//!
//! 4. A failing sink MUST NOT stop other sinks or later deltas.
//!    - Enforced in: `FanOut::handle`
//!    - Tested by: `fanout::tests::failing_sink_does_not_stop_the_others`
//!    - Failure symptom: a storage outage silences broadcast for every connected client.
//!
//! 5. Pending remote connects MUST fail when the transport closes.
//!    - Enforced in: `Inner::teardown`
//!    - Tested by: `remote::tests::transport_teardown_fails_every_pending_connect`
//!    - Failure symptom: callers hang forever waiting for a peer that is gone.

#![warn(missing_docs)]

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod fanout;
#[cfg(unix)]
pub mod ipc;
pub mod local;
pub mod node;
pub mod pubsub;
pub mod queue;
pub mod remote;
pub mod runtime;
pub mod sequencer;
pub mod storage;

pub use codec::NodeTransport;
pub use config::OrdererConfig;
pub use connection::OrdererConnection;
pub use error::{OrdererError, RouterError};
pub use fanout::{FanOut, Sink};
pub use local::{LocalOrderer, LocalOrdererConnection, OrdererServices};
pub use node::{ConcreteNode, LocalNode};
pub use pubsub::{ChannelSubscriber, Subscriber, TopicRouter};
pub use quire_proto as proto;
pub use remote::{ProxyConnection, ProxyOrderer, RemoteNode};
pub use runtime::OrdererRuntime;
pub use sequencer::{Delta, Sequencer};
