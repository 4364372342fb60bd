//! Cluster configuration.

use serde::Deserialize;
use smartstring::{LazyCompact, SmartString};
use std::{collections::BTreeMap, path::Path};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClusterConfigError {
	#[error("could not read cluster config")]
	Io(#[from] std::io::Error),

	#[error("could not parse cluster config")]
	Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerAddr {
	pub host: SmartString<LazyCompact>,
	pub port: u16,
}

/// The set of worker machines this coordinator drives, keyed by name.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
	pub workers: BTreeMap<SmartString<LazyCompact>, WorkerAddr>,
}

impl ClusterConfig {
	pub fn load(path: &Path) -> Result<Self, ClusterConfigError> {
		let text = std::fs::read_to_string(path)?;
		return Ok(serde_json::from_str(&text)?);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_the_documented_shape() {
		let text = "{ \"workers\": {
			\"worker-1\": { \"host\": \"10.0.0.1\", \"port\": 65432 },
			\"worker-2\": { \"host\": \"10.0.0.2\", \"port\": 65432 }
		} }";

		let config: ClusterConfig = serde_json::from_str(text).unwrap();
		assert_eq!(config.workers.len(), 2);
		assert_eq!(config.workers["worker-1"].host, "10.0.0.1");
		assert_eq!(config.workers["worker-2"].port, 65432);
	}
}
