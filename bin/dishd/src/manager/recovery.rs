//! Crash recovery.
//!
//! Losing a host invalidates every subgraph placed there that still has
//! unobserved output streams — and, because an intermediate stream
//! cannot be reproduced without its producers, the whole merger region
//! each of those subgraphs belongs to. Recovery computes that set,
//! prunes what the discovery service already persisted (optimized mode),
//! moves placements off the dead host, and re-dispatches.

use smartstring::{LazyCompact, SmartString};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use dish_flow::{FileId, Subgraph, SubgraphId};
use dish_proto::FtMode;

use crate::{
	connection::WorkerConnection,
	manager::{DispatchError, FtState, WorkersManager},
};

//
// MARK: Liveness callbacks
//

pub async fn addr_added(manager: &WorkersManager, addr: &str) {
	info!(message = "Host joined active nodes", addr);
	for worker in &manager.workers {
		if worker.host() == addr {
			worker.set_online(true);
		}
	}
}

pub async fn addr_removed(manager: &Arc<WorkersManager>, addr: &str) {
	warn!(message = "Fault detected", addr);
	for worker in &manager.workers {
		if worker.host() == addr {
			worker.set_online(false);
		}
	}

	if !manager.config.dishd_ft.is_enabled() {
		return;
	}

	info!(message = "Crash handling started", addr);
	let mut state = manager.state.lock().await;
	let result = match manager.config.dishd_ft {
		FtMode::Naive => handle_naive_crash(manager, &mut state, addr).await,
		_ => handle_crash(manager, &mut state, addr).await,
	};

	// A failed recovery must not leak the reschedule lock or take the
	// daemon down; it is logged and the next liveness event retries.
	match result {
		Ok(()) => info!(message = "Crash handling finished", addr),
		Err(error) => error!(message = "Failed to handle re-execution", addr, ?error),
	}
}

//
// MARK: Planning
//

#[derive(Debug)]
pub struct CrashPlan {
	/// Subgraphs that must run again.
	pub to_reexecute: BTreeSet<SubgraphId>,

	/// The merger regions touched by the crash.
	pub crashed_regions: BTreeSet<SubgraphId>,
}

/// What does losing `addr` invalidate?
///
/// A subgraph whose streams were all observed downstream needs nothing;
/// anything else placed on `addr` re-runs together with its whole
/// region.
pub fn plan_crash(state: &FtState, addr: &str) -> CrashPlan {
	let mut to_reexecute = BTreeSet::new();
	let mut crashed_regions = BTreeSet::new();

	for (worker, subgraph) in &state.all_worker_subgraph_pairs {
		if worker.host() != addr {
			continue;
		}

		let outstanding = state
			.all_graph_to_uuid
			.get(&subgraph.id)
			.map(|v| !v.is_empty())
			.unwrap_or(false);
		if !outstanding {
			continue;
		}

		to_reexecute.insert(subgraph.id);

		if let Some(merger_id) = state.all_subgraph_to_merger.get(&subgraph.id) {
			crashed_regions.insert(*merger_id);
			if let Some(members) = state.all_merger_to_subgraph.get(merger_id) {
				to_reexecute.extend(members.iter().copied());
			}
		}
	}

	CrashPlan {
		to_reexecute,
		crashed_regions,
	}
}

/// Forget completion state for `set` and re-register every stream those
/// subgraphs produce.
pub fn reset_stream_bookkeeping(state: &mut FtState, set: &BTreeSet<SubgraphId>) {
	for id in set {
		if let Some(outstanding) = state.all_graph_to_uuid.get_mut(id) {
			outstanding.clear();
		}
	}

	for (uuid, (from, _)) in &state.all_uuid_to_graphs {
		if set.contains(from) {
			state
				.all_graph_to_uuid
				.entry(*from)
				.or_default()
				.push(*uuid);
		}
	}
}

/// The streams the re-execution set would produce, in a stable order,
/// paired with their producers. This is what discovery is asked about.
pub fn outstanding_streams(state: &FtState, set: &BTreeSet<SubgraphId>) -> Vec<(Uuid, SubgraphId)> {
	state
		.all_uuid_to_graphs
		.iter()
		.filter(|(_, (from, _))| set.contains(from))
		.map(|(uuid, (from, _))| (*uuid, *from))
		.collect()
}

/// Regions that are completely done: the merger and every one of its
/// members have no outstanding streams. Used by naive recovery, which
/// re-runs everything else.
pub fn completely_finished_subgraphs(state: &FtState) -> BTreeSet<SubgraphId> {
	let empty = |id: &SubgraphId| {
		state
			.all_graph_to_uuid
			.get(id)
			.map(|v| v.is_empty())
			.unwrap_or(true)
	};

	let mut finished = BTreeSet::new();
	for (_, subgraph) in &state.all_worker_subgraph_pairs {
		if !subgraph.merger || !empty(&subgraph.id) {
			continue;
		}

		let members = state
			.all_merger_to_subgraph
			.get(&subgraph.id)
			.cloned()
			.unwrap_or_default();
		if members.iter().all(|m| empty(m)) {
			finished.insert(subgraph.id);
			finished.extend(members);
		}
	}

	finished
}

//
// MARK: Recovery
//

/// Move one placement off the dead host. Returns the new worker.
fn reassign(
	manager: &WorkersManager,
	state: &mut FtState,
	old_worker: &Arc<WorkerConnection>,
	subgraph: &Subgraph,
) -> Result<Arc<WorkerConnection>, DispatchError> {
	state
		.all_worker_subgraph_pairs
		.retain(|(w, s)| !(Arc::ptr_eq(w, old_worker) && s.id == subgraph.id));

	let critical_fids: Vec<FileId> = subgraph
		.graph
		.all_fids()
		.into_iter()
		.filter(|fid| fid.has_remote_file_resource())
		.collect();

	let new_worker = manager.get_worker(&critical_fids)?;
	new_worker.add_running_process();
	state
		.all_worker_subgraph_pairs
		.push((new_worker.clone(), subgraph.clone()));

	debug!(
		message = "Reassigned subgraph",
		subgraph = ?subgraph.id,
		from = %old_worker.name,
		to = %new_worker.name,
	);
	return Ok(new_worker);
}

fn region_payload(state: &FtState, merger_id: SubgraphId) -> (Option<dish_proto::ShellVars>, String) {
	let shell_vars = state
		.all_merger_to_shell_vars
		.get(&merger_id)
		.cloned()
		.flatten();
	let functions = state
		.all_merger_to_declared_functions
		.get(&merger_id)
		.cloned()
		.unwrap_or_default();
	(shell_vars, functions)
}

pub async fn handle_crash(
	manager: &WorkersManager,
	state: &mut FtState,
	addr: &str,
) -> Result<(), DispatchError> {
	let ft = manager.config.dishd_ft;
	info!(message = "Node crashed, handling it", ?ft, addr);

	let plan = plan_crash(state, addr);
	let mut to_reexecute = plan.to_reexecute;
	info!(message = "Subgraphs to re-execute", count = to_reexecute.len());

	// In base mode there is no persistence to lean on: the crashed
	// regions restart from scratch, so their live subgraphs must die
	// first or the re-execution races them.
	if ft == FtMode::Base {
		for merger_id in &plan.crashed_regions {
			for worker in manager.all_workers() {
				match worker.send_kill_subgraphs_request(*merger_id).await {
					Ok(()) => {
						debug!(message = "Sent kill subgraphs request", worker = %worker.name, merger = ?merger_id)
					}
					Err(error) => {
						warn!(message = "Could not kill subgraphs", worker = %worker.name, ?error)
					}
				}
			}
		}
	}

	reset_stream_bookkeeping(state, &to_reexecute);

	// Streams discovery already persisted somewhere that survived need
	// not be produced again.
	if ft == FtMode::Optimized {
		let streams = outstanding_streams(state, &to_reexecute);
		let uuids: Vec<Uuid> = streams.iter().map(|(u, _)| *u).collect();
		let indexes = manager
			.discovery
			.find_persisted_optimized(&uuids, addr)
			.await?;

		for index in &indexes {
			let Some((_, producer)) = streams.get(*index) else {
				warn!(message = "Discovery returned unknown index", index);
				continue;
			};
			to_reexecute.remove(producer);
		}
		info!(
			message = "Re-execution reduced by persisted streams",
			pruned = indexes.len(),
			remaining = to_reexecute.len(),
		);
	}

	// Move placements off the dead host and re-dispatch the set.
	let snapshot: Vec<(Arc<WorkerConnection>, Subgraph)> = state.all_worker_subgraph_pairs.clone();
	let mut batches: BTreeMap<
		SmartString<LazyCompact>,
		(Arc<WorkerConnection>, BTreeMap<SubgraphId, Vec<Subgraph>>),
	> = BTreeMap::new();

	for (worker, subgraph) in snapshot {
		if !to_reexecute.contains(&subgraph.id) {
			continue;
		}

		let mut current = worker.clone();
		if worker.host() == addr {
			current = reassign(manager, state, &worker, &subgraph)?;
		}

		let merger_id = *state
			.all_subgraph_to_merger
			.get(&subgraph.id)
			.ok_or(DispatchError::NoMerger)?;

		match ft {
			FtMode::Optimized => {
				batches
					.entry(current.name.clone())
					.or_insert_with(|| (current.clone(), BTreeMap::new()))
					.1
					.entry(merger_id)
					.or_default()
					.push(subgraph.clone());
			}
			_ => {
				let (shell_vars, functions) = region_payload(state, merger_id);
				current
					.send_graph_exec_request(
						subgraph.clone(),
						shell_vars,
						functions,
						merger_id,
						manager.config.dishd_worker_timeout,
					)
					.await?;
				info!(message = "Re-sent subgraph", subgraph = ?subgraph.id, worker = %current.name);
			}
		}
	}

	if ft == FtMode::Optimized {
		for (_, (worker, merger_batches)) in batches {
			for (merger_id, subgraphs) in merger_batches {
				let (mergers, regulars): (Vec<Subgraph>, Vec<Subgraph>) =
					subgraphs.into_iter().partition(|s| s.merger);
				let (shell_vars, functions) = region_payload(state, merger_id);

				info!(
					message = "Re-sending batch",
					regulars = regulars.len(),
					mergers = mergers.len(),
					worker = %worker.name,
				);
				worker
					.send_batch_graph_exec_request(
						regulars,
						mergers,
						shell_vars,
						functions,
						merger_id,
						true,
					)
					.await?;
			}
		}
	}

	return Ok(());
}

/// Naive mode: kill everything everywhere and re-run every region that
/// has not completely finished.
pub async fn handle_naive_crash(
	manager: &WorkersManager,
	state: &mut FtState,
	addr: &str,
) -> Result<(), DispatchError> {
	info!(message = "Node crashed in naive mode, killing all subgraphs", addr);
	for worker in manager.all_workers() {
		match worker.send_kill_subgraphs_request(SubgraphId::ALL).await {
			Ok(()) => debug!(message = "Sent kill all subgraphs request", worker = %worker.name),
			Err(error) => warn!(message = "Could not kill subgraphs", worker = %worker.name, ?error),
		}
	}

	let finished = completely_finished_subgraphs(state);
	info!(message = "Completely finished subgraphs", count = finished.len());

	let unfinished: BTreeSet<SubgraphId> = state
		.all_worker_subgraph_pairs
		.iter()
		.map(|(_, s)| s.id)
		.filter(|id| !finished.contains(id))
		.collect();
	reset_stream_bookkeeping(state, &unfinished);

	let snapshot: Vec<(Arc<WorkerConnection>, Subgraph)> = state.all_worker_subgraph_pairs.clone();
	for (worker, subgraph) in snapshot {
		if finished.contains(&subgraph.id) {
			continue;
		}

		let mut current = worker.clone();
		if worker.host() == addr {
			current = reassign(manager, state, &worker, &subgraph)?;
		}

		let merger_id = *state
			.all_subgraph_to_merger
			.get(&subgraph.id)
			.ok_or(DispatchError::NoMerger)?;
		let (shell_vars, functions) = region_payload(state, merger_id);

		current
			.send_graph_exec_request(
				subgraph.clone(),
				shell_vars,
				functions,
				merger_id,
				manager.config.dishd_worker_timeout,
			)
			.await?;
		info!(message = "Re-sent subgraph", subgraph = ?subgraph.id, worker = %current.name);
	}

	return Ok(());
}

//
// MARK: Tests
//
