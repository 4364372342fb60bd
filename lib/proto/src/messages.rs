//! Request and response records.

use serde::{Deserialize, Serialize};
use smartstring::{LazyCompact, SmartString};
use std::collections::BTreeMap;

use dish_flow::{DataflowGraph, Subgraph, SubgraphId};

/// One shell variable captured from the invoking shell, with the
/// `declare` type flags it carried (if any).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellVar {
	#[serde(default)]
	pub var_type: Option<SmartString<LazyCompact>>,

	pub value: String,
}

pub type ShellVars = BTreeMap<SmartString<LazyCompact>, ShellVar>;

/// Fault-tolerance strategy for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FtMode {
	Disabled,
	Naive,
	Base,
	Optimized,
}

impl Default for FtMode {
	fn default() -> Self {
		return Self::Disabled;
	}
}

impl FtMode {
	pub fn is_enabled(&self) -> bool {
		!matches!(self, Self::Disabled)
	}
}

/// The pipeline file the compiler hands over: the dataflow graph plus
/// the shell state it was compiled under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrFile {
	pub graph: DataflowGraph,

	#[serde(default)]
	pub shell_variables: ShellVars,
}

/// Coordinator → worker requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
	/// Sent once per connection before anything else.
	#[serde(rename = "Setup")]
	Setup {
		debug: bool,
		pool_size: usize,
		ft: FtMode,
		script_name: String,

		/// Which worker role fault injection will target, if any. Sent
		/// so workers don't account execution times for doomed runs.
		kill_target: SmartString<LazyCompact>,
	},

	/// Execute one subgraph.
	#[serde(rename = "Exec-Graph")]
	ExecGraph {
		graph: Subgraph,
		shell_variables: Option<ShellVars>,
		functions: String,
		merger_id: SubgraphId,

		/// Mock delay in seconds before the subgraph starts. Used to
		/// simulate slow workers in tests.
		#[serde(default)]
		worker_timeout: u64,
	},

	/// Bulk submit: all subgraphs this worker runs for one region.
	#[serde(rename = "Batch-Exec-Graph")]
	BatchExecGraph {
		regulars: Vec<Subgraph>,
		mergers: Vec<Subgraph>,
		shell_variables: Option<ShellVars>,
		functions: String,
		merger_id: SubgraphId,
	},

	/// Terminate the running subgraphs of one merger region, or all of
	/// them when `merger_id` is [`SubgraphId::ALL`].
	#[serde(rename = "Kill-Subgraphs")]
	KillSubgraphs { merger_id: SubgraphId },

	/// Fault injection: self-terminate after `kill_delay` seconds.
	#[serde(rename = "Kill-Node")]
	KillNode {
		kill_target: SmartString<LazyCompact>,
		kill_delay: u64,
	},

	/// Graceful shutdown.
	#[serde(rename = "Done")]
	Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
	#[serde(rename = "OK")]
	Ok,

	#[serde(rename = "Err")]
	Err,
}

/// Worker → coordinator acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
	pub status: ResponseStatus,

	#[serde(default)]
	pub body: serde_json::Value,

	#[serde(default)]
	pub msg: String,
}

impl Response {
	pub fn ok() -> Self {
		Self {
			status: ResponseStatus::Ok,
			body: serde_json::Value::Null,
			msg: String::new(),
		}
	}

	pub fn error(msg: impl Into<String>) -> Self {
		Self {
			status: ResponseStatus::Err,
			body: serde_json::Value::Null,
			msg: msg.into(),
		}
	}

	pub fn is_ok(&self) -> bool {
		self.status == ResponseStatus::Ok
	}
}
