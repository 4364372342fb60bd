use dish_proto::FtMode;
use dish_util::logging::LoggingPreset;
use serde::Deserialize;
use std::path::PathBuf;

/// The completion listener polls its quit flag at this interval while
/// waiting for notices.
pub const ACCEPT_POLL_SECS: u64 = 1;

/// Note that the fields of this struct are not capitalized.
/// Envy is case-insensitive, and expects Rust fields to be snake_case.
#[derive(Debug, Deserialize, Clone)]
pub struct DishdConfig {
	/// The logging level to run with
	#[serde(default)]
	pub dishd_loglevel: LoggingPreset,

	/// Fault-tolerance strategy for this run
	#[serde(default)]
	pub dishd_ft: FtMode,

	/// Forward debug mode to workers (captures subgraph stderr)
	#[serde(default)]
	pub dishd_debug: bool,

	/// Worker-side process pool size, forwarded in the setup request
	#[serde(default = "DishdConfig::default_pool_size")]
	pub dishd_pool_size: usize,

	/// Name of the script being parallelized, for worker-side accounting
	#[serde(default)]
	pub dishd_script_name: String,

	/// Fault injection: kill the `merger` or a `regular` worker once per
	/// run. Empty disables injection.
	#[serde(default)]
	pub dishd_kill: String,

	/// Seconds the killed worker waits before dying
	#[serde(default = "DishdConfig::default_kill_delay")]
	pub dishd_kill_delay: u64,

	/// Where the completion listener accepts stream notices
	#[serde(default = "DishdConfig::default_port")]
	pub dishd_port: u16,

	/// Port of the workerd running next to this coordinator, which runs
	/// the main graph's writer halves
	#[serde(default = "DishdConfig::default_client_port")]
	pub dishd_client_port: u16,

	/// First port handed to remote-pipe listeners
	#[serde(default = "DishdConfig::default_base_port")]
	pub dishd_base_port: u16,

	/// This coordinator's address as workers see it
	#[serde(default = "DishdConfig::default_host")]
	pub dishd_host: String,

	/// Mock delay forwarded with every subgraph, for slow-worker tests
	#[serde(default)]
	pub dishd_worker_timeout: u64,

	/// Seconds between datanode liveness polls
	#[serde(default = "DishdConfig::default_liveness_period")]
	pub dishd_liveness_period: u64,

	/// The persistence-discovery service
	#[serde(default = "DishdConfig::default_discovery_addr")]
	pub dishd_discovery_addr: String,

	/// The HDFS namenode, polled for datanode liveness
	#[serde(default = "DishdConfig::default_namenode_addr")]
	pub dishd_namenode_addr: String,

	/// Root of the surrounding shell-parallelization installation
	pub pash_top: PathBuf,

	/// Root of the distributed runtime (helpers, witness file)
	pub dish_top: PathBuf,

	/// Scratch space for scripts and FIFOs
	pub pash_tmp_prefix: PathBuf,

	/// Unix socket the invoking shell sends commands on
	pub dspash_socket: PathBuf,
}

impl DishdConfig {
	fn default_pool_size() -> usize {
		4
	}

	fn default_kill_delay() -> u64 {
		3
	}

	fn default_port() -> u16 {
		65425
	}

	fn default_client_port() -> u16 {
		65432
	}

	fn default_base_port() -> u16 {
		58000
	}

	fn default_host() -> String {
		"localhost".into()
	}

	fn default_liveness_period() -> u64 {
		10
	}

	fn default_discovery_addr() -> String {
		"http://localhost:50052".into()
	}

	fn default_namenode_addr() -> String {
		"http://localhost:9870".into()
	}

	/// Path of the fault-injection witness file.
	pub fn witness_path(&self) -> PathBuf {
		self.dish_top.join("kill_witness.log")
	}
}

#[cfg(test)]
pub fn test_config() -> DishdConfig {
	DishdConfig {
		dishd_loglevel: LoggingPreset::Default,
		dishd_ft: FtMode::Base,
		dishd_debug: false,
		dishd_pool_size: DishdConfig::default_pool_size(),
		dishd_script_name: String::new(),
		dishd_kill: String::new(),
		dishd_kill_delay: DishdConfig::default_kill_delay(),
		dishd_port: DishdConfig::default_port(),
		dishd_client_port: DishdConfig::default_client_port(),
		dishd_base_port: DishdConfig::default_base_port(),
		dishd_host: DishdConfig::default_host(),
		dishd_worker_timeout: 0,
		dishd_liveness_period: DishdConfig::default_liveness_period(),
		dishd_discovery_addr: DishdConfig::default_discovery_addr(),
		dishd_namenode_addr: DishdConfig::default_namenode_addr(),
		pash_top: "/tmp/pash".into(),
		dish_top: "/tmp/dish".into(),
		pash_tmp_prefix: "/tmp/dish_tmp".into(),
		dspash_socket: "/tmp/dish.sock".into(),
	}
}
