//! Fault injection.
//!
//! With `DISHD_KILL` set, the first dispatch of a run picks a victim
//! worker, records its address in the witness file for the surrounding
//! test scaffolding, and tells it to die mid-run. Exactly once.

use std::{io::Write, sync::Arc};
use tracing::info;

use dish_flow::Subgraph;

use crate::{
	connection::WorkerConnection,
	manager::{DispatchError, WorkersManager},
};

/// The worker running the merger subgraph, and some other worker.
fn pick_merger_and_regular(
	manager: &WorkersManager,
	pairs: &[(Arc<WorkerConnection>, Subgraph)],
) -> (Option<Arc<WorkerConnection>>, Option<Arc<WorkerConnection>>) {
	let merger_worker = pairs
		.iter()
		.find(|(_, s)| s.merger)
		.map(|(w, _)| w.clone());

	let regular_worker = manager
		.workers
		.iter()
		.find(|w| match &merger_worker {
			Some(m) => !Arc::ptr_eq(w, m),
			None => true,
		})
		.cloned();

	(merger_worker, regular_worker)
}

/// Which worker does the configured kill mode target?
pub fn choose_kill_target(
	kill: &str,
	manager: &WorkersManager,
	pairs: &[(Arc<WorkerConnection>, Subgraph)],
) -> Result<Arc<WorkerConnection>, DispatchError> {
	let (merger_worker, regular_worker) = pick_merger_and_regular(manager, pairs);

	match kill {
		"merger" => merger_worker.ok_or(DispatchError::NoMerger),
		"regular" => regular_worker.ok_or(DispatchError::NoEligibleWorker),
		other => Err(DispatchError::InvalidKillTarget(other.into())),
	}
}

/// Record the merger worker's address (and a fallback regular worker)
/// so test scaffolding can resurrect the right node later.
pub fn log_node_ip(
	manager: &WorkersManager,
	pairs: &[(Arc<WorkerConnection>, Subgraph)],
) -> Result<(), DispatchError> {
	let (merger_worker, regular_worker) = pick_merger_and_regular(manager, pairs);

	let path = manager.config.witness_path();
	let mut witness = std::fs::File::create(&path)?;
	if let Some(w) = merger_worker {
		writeln!(witness, "{}", w.host())?;
	}
	if let Some(w) = regular_worker {
		writeln!(witness, "{}", w.host())?;
	}

	info!(message = "Wrote witness file", path = ?path);
	return Ok(());
}

/// Send the one kill of this run.
pub async fn handle_kill(
	manager: &WorkersManager,
	pairs: &[(Arc<WorkerConnection>, Subgraph)],
) -> Result<(), DispatchError> {
	let target = choose_kill_target(&manager.config.dishd_kill, manager, pairs)?;

	// The witness must name the actual victim.
	std::fs::write(manager.config.witness_path(), format!("{}\n", target.host()))?;

	target
		.send_kill_node_request(manager.config.dishd_kill_delay)
		.await?;
	manager.mark_kill_node_req_sent();

	info!(message = "Sent kill node request", target = %target.host());
	return Ok(());
}

//
// MARK: Tests
//

#[cfg(test)]
mod tests {
	use super::*;
	use async_trait::async_trait;
	use dish_dfs::client::{DiscoveryClient, DiscoveryRequestError};
	use uuid::Uuid;

	struct NoDiscovery;

	#[async_trait]
	impl DiscoveryClient for NoDiscovery {
		async fn find_persisted_optimized(
			&self,
			_uuids: &[Uuid],
			_addr: &str,
		) -> Result<Vec<usize>, DiscoveryRequestError> {
			Ok(vec![])
		}
	}

	fn manager() -> WorkersManager {
		let config = Arc::new(crate::config::test_config());
		let workers = vec![
			Arc::new(WorkerConnection::detached("w0", "a", 65432)),
			Arc::new(WorkerConnection::detached("w1", "b", 65432)),
		];
		let client = Arc::new(WorkerConnection::detached("client_worker", "localhost", 65432));
		WorkersManager::new(config, workers, client, Arc::new(NoDiscovery))
	}

	fn pairs_with_merger_on(
		m: &WorkersManager,
		merger_worker: usize,
	) -> Vec<(Arc<WorkerConnection>, Subgraph)> {
		let mut merger = Subgraph::empty(1.into());
		merger.merger = true;
		vec![
			(m.workers[merger_worker].clone(), merger),
			(m.workers[1 - merger_worker].clone(), Subgraph::empty(2.into())),
		]
	}

	#[test]
	fn merger_mode_targets_the_merger_worker() {
		let m = manager();
		let pairs = pairs_with_merger_on(&m, 1);

		let target = choose_kill_target("merger", &m, &pairs).unwrap();
		assert_eq!(target.host(), "b");
	}

	#[test]
	fn regular_mode_avoids_the_merger_worker() {
		let m = manager();
		let pairs = pairs_with_merger_on(&m, 0);

		let target = choose_kill_target("regular", &m, &pairs).unwrap();
		assert_eq!(target.host(), "b");
	}

	#[test]
	fn unknown_mode_is_rejected() {
		let m = manager();
		let pairs = pairs_with_merger_on(&m, 0);

		assert!(matches!(
			choose_kill_target("everyone", &m, &pairs),
			Err(DispatchError::InvalidKillTarget(_))
		));
	}
}
