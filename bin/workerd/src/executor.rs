//! Subgraph execution.
//!
//! A received subgraph is patched with hooks, emitted to a temp script,
//! and run by a fresh bash that first sources the declared functions of
//! the original invocation.

use smartstring::{LazyCompact, SmartString};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::{Child, Command};
use tracing::{debug, info};

use dish_flow::{
	emit::{to_shell, EmitError},
	Subgraph, SubgraphId,
};
use dish_proto::{FtMode, ShellVars};
use dish_util::tmp::write_tmp_file;

use crate::{config::WorkerdConfig, hooks};

#[derive(Debug, Error)]
pub enum ExecError {
	#[error("could not emit subgraph")]
	Emit(#[from] EmitError),

	#[error("i/o error while preparing subgraph")]
	Io(#[from] std::io::Error),
}

/// What the coordinator's setup request told us. One per connection.
#[derive(Debug, Clone)]
pub struct SetupInfo {
	pub debug: bool,
	pub pool_size: usize,
	pub ft: FtMode,
	pub script_name: String,
	pub kill_target: SmartString<LazyCompact>,
}

impl Default for SetupInfo {
	fn default() -> Self {
		Self {
			debug: false,
			pool_size: 0,
			ft: FtMode::Disabled,
			script_name: String::new(),
			kill_target: SmartString::new(),
		}
	}
}

/// A spawned subgraph and the region it belongs to.
pub struct RunningGraph {
	pub merger_id: SubgraphId,
	pub child: Child,
	pub debug: bool,
}

/// Materialize and spawn one subgraph.
pub async fn exec_graph(
	config: &WorkerdConfig,
	setup: &SetupInfo,
	mut subgraph: Subgraph,
	shell_variables: Option<ShellVars>,
	functions: &str,
	merger_id: SubgraphId,
) -> Result<RunningGraph, ExecError> {
	if setup.debug {
		debug!(message = "Debug is on");
		hooks::add_debug_flags(&mut subgraph.graph);
	}
	if !setup.kill_target.is_empty() {
		info!(message = "Arming kill hooks", target = %setup.kill_target);
		hooks::add_kill_flags(&mut subgraph.graph, &setup.kill_target);
	}

	let script = to_shell(&subgraph.graph, &config.pash_tmp_prefix)?;
	let script_path = write_tmp_file(&config.pash_tmp_prefix, "dish_script", &script)?;
	let functions_path = write_tmp_file(&config.pash_tmp_prefix, "dishFuncs", functions)?;

	let cmd = format!(
		"source {}; source {}",
		functions_path.display(),
		script_path.display()
	);
	info!(message = "Executing subgraph", subgraph = ?subgraph.id, script = ?script_path);

	let mut bash = Command::new("/bin/bash");
	bash.arg("-c").arg(&cmd);
	bash.env("PASH_TOP", &config.pash_top);
	bash.env("DISH_TOP", &config.dish_top);
	for (name, var) in shell_variables.unwrap_or_default() {
		bash.env(name.as_str(), &var.value);
	}
	if setup.debug {
		bash.stderr(Stdio::piped());
	}

	let child = bash.spawn()?;
	return Ok(RunningGraph {
		merger_id,
		child,
		debug: setup.debug,
	});
}
