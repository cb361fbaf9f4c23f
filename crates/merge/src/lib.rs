//! Client-side reconciliation of optimistically applied edits.
//!
//! # Purpose
//!
//! - Apply local text edits immediately and track each one until the orderer sequences it.
//! - Merge other clients' sequenced edits into a local view that still contains unacknowledged edits.
//! - After a nack or reconnect, regenerate every unacknowledged edit as new submissions that reproduce the local view.
//!
//! # Mental model
//!
//! - The text is a flat list of segments. An edit that starts or ends inside a segment splits it; the pieces stay
//!   attached to every pending submission that owned the original.
//! - A pending submission is a group of segments keyed by client sequence number. The group is dropped when the
//!   orderer echoes that client sequence number back under this client's id.
//! - Reset walks the groups in submission order and emits one op per live piece, with offsets measured against what
//!   the orderer will hold once the preceding resubmissions land. The old groups are forgotten.
//!
//! # Invariants
//!
//! 1. After every submission is acknowledged, nothing is pending.
//!    - Enforced in: `SegmentList::ack`
//!    - Tested by: `client::tests::acked_inserts_leave_nothing_to_reset`
//!
//! 2. Text inserted and removed locally before either was sequenced is never resubmitted.
//!    - Enforced in: `SegmentList::reset`
//!    - Tested by: `client::tests::insert_then_remove_before_any_ack_resets_to_nothing`
//!
//! 3. Sequencing the ops produced by a reset makes every replica match the local text.
//!    - Enforced in: `SegmentList::reset`, `SegmentList::apply_remote`
//!    - Tested by: `client::tests::correctives_reproduce_local_state_on_a_peer`,
//!      `client::tests::remote_insert_inside_a_pending_remove_splits_the_corrective`

#![warn(missing_docs)]

pub mod client;
pub mod error;
pub mod ops;
mod segments;

pub use client::MergeClient;
pub use error::MergeError;
pub use ops::{LocalOp, MergeOp, PropertySet, apply_properties};
