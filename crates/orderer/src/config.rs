//! Orderer configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Tunables shared by every orderer and node in a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrdererConfig {
	/// Silence after which a client is evicted with a synthetic leave.
	pub client_timeout: Duration,
	/// How often the sequencer scans for idle clients.
	pub activity_check_interval: Duration,
	/// Largest accepted serialized message contents, in bytes.
	pub max_message_size: usize,
	/// Capacity of each ingress and egress queue.
	pub queue_capacity: usize,
	/// Consecutive routing misses on one topic before a remote node warns.
	pub route_miss_warn_threshold: u32,
}

impl Default for OrdererConfig {
	fn default() -> Self {
		Self {
			client_timeout: Duration::from_secs(5 * 60),
			activity_check_interval: Duration::from_secs(30),
			max_message_size: 16 * 1024,
			queue_capacity: 1024,
			route_miss_warn_threshold: 2,
		}
	}
}

/// On-disk shape; every field is optional and falls back to the default.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawOrdererConfig {
	client_timeout_ms: Option<u64>,
	activity_check_interval_ms: Option<u64>,
	max_message_size: Option<usize>,
	queue_capacity: Option<usize>,
	route_miss_warn_threshold: Option<u32>,
}

impl OrdererConfig {
	/// Parses a TOML document, filling omitted fields from [`Default`].
	///
	/// # Errors
	///
	/// Returns [`ConfigError::Parse`] for malformed TOML or unknown fields and
	/// [`ConfigError::Invalid`] for zero intervals or capacities.
	pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
		let raw: RawOrdererConfig = toml::from_str(input)?;
		let defaults = Self::default();

		let config = Self {
			client_timeout: raw
				.client_timeout_ms
				.map_or(defaults.client_timeout, Duration::from_millis),
			activity_check_interval: raw
				.activity_check_interval_ms
				.map_or(defaults.activity_check_interval, Duration::from_millis),
			max_message_size: raw.max_message_size.unwrap_or(defaults.max_message_size),
			queue_capacity: raw.queue_capacity.unwrap_or(defaults.queue_capacity),
			route_miss_warn_threshold: raw
				.route_miss_warn_threshold
				.unwrap_or(defaults.route_miss_warn_threshold),
		};
		config.validate()?;
		Ok(config)
	}

	fn validate(&self) -> Result<(), ConfigError> {
		if self.activity_check_interval.is_zero() {
			return Err(ConfigError::Invalid {
				field: "activity_check_interval_ms",
				reason: "must be greater than zero",
			});
		}
		if self.queue_capacity == 0 {
			return Err(ConfigError::Invalid {
				field: "queue_capacity",
				reason: "must be greater than zero",
			});
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_document_yields_defaults() {
		let config = OrdererConfig::from_toml_str("").unwrap();
		assert_eq!(config, OrdererConfig::default());
	}

	#[test]
	fn millisecond_fields_override_defaults() {
		let config = OrdererConfig::from_toml_str(
			"client_timeout_ms = 1500\nactivity_check_interval_ms = 250\nqueue_capacity = 8\n",
		)
		.unwrap();
		assert_eq!(config.client_timeout, Duration::from_millis(1500));
		assert_eq!(config.activity_check_interval, Duration::from_millis(250));
		assert_eq!(config.queue_capacity, 8);
		assert_eq!(config.max_message_size, 16 * 1024);
	}

	#[test]
	fn unknown_fields_are_rejected() {
		let err = OrdererConfig::from_toml_str("client_timeout = 3\n").unwrap_err();
		assert!(matches!(err, ConfigError::Parse(_)));
	}

	#[test]
	fn zero_capacity_is_rejected() {
		let err = OrdererConfig::from_toml_str("queue_capacity = 0\n").unwrap_err();
		assert!(matches!(
			err,
			ConfigError::Invalid {
				field: "queue_capacity",
				..
			}
		));
	}
}
