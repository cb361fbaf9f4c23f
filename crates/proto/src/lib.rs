//! Shared wire types for quire ordering services.
//!
//! This crate defines the messages exchanged between editing clients, the
//! per-document orderer pipeline, and peer nodes hosting orderers. Payloads
//! are typed variants rather than string-tagged blobs; the only untyped value
//! is the document edit itself ([`MessageContents::Op`]), whose schema belongs
//! to the data structure being edited.

#![warn(missing_docs)]

pub mod types;

pub use types::*;

/// Current wall-clock time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
	chrono::Utc::now().timestamp_millis()
}

/// Current wall-clock time in fractional milliseconds, used for trace stamps.
#[must_use]
pub fn now_trace_millis() -> f64 {
	let now = chrono::Utc::now();
	now.timestamp_millis() as f64 + f64::from(now.timestamp_subsec_micros() % 1_000) / 1_000.0
}
