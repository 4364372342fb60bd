use dish_util::logging::LoggingPreset;
use serde::Deserialize;
use std::path::PathBuf;

/// How long a debug-mode subgraph may keep running after its connection
/// closes before we kill it.
pub const DEBUG_WAIT_SECS: u64 = 10;

/// Note that the fields of this struct are not capitalized.
/// Envy is case-insensitive, and expects Rust fields to be snake_case.
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerdConfig {
	/// The logging level to run with
	#[serde(default)]
	pub workerd_loglevel: LoggingPreset,

	/// Port to accept coordinator connections on. 0 picks a free port.
	#[serde(default = "WorkerdConfig::default_port")]
	pub workerd_port: u16,

	/// Root of the surrounding shell-parallelization installation,
	/// exported to every subgraph
	pub pash_top: PathBuf,

	/// Root of the distributed runtime, exported to every subgraph
	pub dish_top: PathBuf,

	/// Scratch space for scripts and FIFOs
	pub pash_tmp_prefix: PathBuf,
}

impl WorkerdConfig {
	fn default_port() -> u16 {
		65432
	}
}

#[cfg(test)]
pub fn test_config() -> WorkerdConfig {
	WorkerdConfig {
		workerd_loglevel: LoggingPreset::Default,
		workerd_port: 0,
		pash_top: "/tmp/pash".into(),
		dish_top: "/tmp/dish".into(),
		pash_tmp_prefix: "/tmp/dish_tmp".into(),
	}
}
