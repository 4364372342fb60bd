//! Graph hooks.
//!
//! Before a subgraph is emitted, the worker may patch its remote splice
//! nodes: debug mode makes the datastream helpers verbose, and fault
//! injection arms them against a chosen worker role.

use smartstring::{LazyCompact, SmartString};

use dish_flow::{DataflowGraph, NodeKind};

/// Make every datastream helper in `graph` log what it does.
pub fn add_debug_flags(graph: &mut DataflowGraph) {
	for node in graph.iter_nodes_mut() {
		match node.kind_mut() {
			NodeKind::RemoteRead { debug, .. } | NodeKind::RemoteWrite { debug, .. } => {
				*debug = true;
			}
			_ => {}
		}
	}
}

/// Arm every remote write against `kill_target` (a worker role, not a
/// host). The datastream runtime aborts the matching transfers.
pub fn add_kill_flags(graph: &mut DataflowGraph, kill_target: &str) {
	let target: SmartString<LazyCompact> = kill_target.into();
	for node in graph.iter_nodes_mut() {
		if let NodeKind::RemoteWrite { kill, .. } = node.kind_mut() {
			*kill = Some(target.clone());
		}
	}
}
