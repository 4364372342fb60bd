//! The completion listener.
//!
//! The datastream helpers connect here and report, in one fixed-size
//! record, that a stream finished flowing. A read-side notice means the
//! consumer observed the whole stream, so the producing subgraph has one
//! less output the cluster could still lose.

use std::{sync::Arc, time::Duration};
use tokio::{io::AsyncReadExt, net::TcpListener};
use tracing::{debug, info, warn};

use dish_proto::{CompletionNotice, NoticeRole, NOTICE_LEN};

use crate::{
	config::ACCEPT_POLL_SECS,
	manager::{FtState, WorkersManager},
};

/// Accept notices until the manager asks us to quit.
///
/// The accept wait is bounded so the quit flag is polled about once a
/// second, matching the command loop's shutdown latency.
pub async fn run_completion_listener(manager: Arc<WorkersManager>, listener: TcpListener) {
	info!(
		message = "Completion listener running",
		port = manager.config.dishd_port,
	);

	while !manager.quit_requested() {
		let accepted = tokio::time::timeout(
			Duration::from_secs(ACCEPT_POLL_SECS),
			listener.accept(),
		)
		.await;

		match accepted {
			Err(_) => continue,
			Ok(Err(error)) => {
				warn!(message = "Completion listener accept failed", ?error);
				continue;
			}
			Ok(Ok((stream, addr))) => {
				let manager = manager.clone();
				tokio::spawn(async move {
					manage_notice_connection(manager, stream, addr).await;
				});
			}
		}
	}

	debug!(message = "Completion listener stopping");
}

async fn manage_notice_connection(
	manager: Arc<WorkersManager>,
	mut stream: tokio::net::TcpStream,
	addr: std::net::SocketAddr,
) {
	// One role byte and a 16-byte stream id. A split record is
	// extremely unlikely; if it happens we drop the notice and at worst
	// duplicate an execution after a failure.
	let mut buf = [0u8; NOTICE_LEN];
	if let Err(error) = stream.read_exact(&mut buf).await {
		warn!(
			message = "Expected a full completion notice",
			from = ?addr,
			?error
		);
		return;
	}

	let notice = match CompletionNotice::decode(&buf) {
		Ok(n) => n,
		Err(error) => {
			warn!(message = "Malformed completion notice", from = ?addr, ?error);
			return;
		}
	};

	let mut state = manager.state.lock().await;
	apply_completion_notice(&mut state, &notice);
}

/// Fold one notice into the bookkeeping. Only read-side notices change
/// anything, and removal is commutative, so notices may arrive in any
/// order.
pub fn apply_completion_notice(state: &mut FtState, notice: &CompletionNotice) {
	if notice.role != NoticeRole::Read {
		return;
	}

	let Some((producer, _)) = state.all_uuid_to_graphs.get(&notice.uuid).copied() else {
		warn!(message = "Notice for unknown stream", uuid = %notice.uuid);
		return;
	};

	let Some(outstanding) = state.all_graph_to_uuid.get_mut(&producer) else {
		warn!(
			message = "Notice for untracked producer",
			subgraph = ?producer,
			uuid = %notice.uuid,
		);
		return;
	};

	let Some(pos) = outstanding.iter().position(|u| *u == notice.uuid) else {
		debug!(
			message = "Stream already observed",
			subgraph = ?producer,
			uuid = %notice.uuid,
		);
		return;
	};
	outstanding.remove(pos);

	// Fully observed: the placement no longer counts against its
	// worker's load.
	if outstanding.is_empty() {
		for (worker, subgraph) in &state.all_worker_subgraph_pairs {
			if subgraph.id == producer {
				worker.finish_running_process();
				debug!(
					message = "Subgraph fully observed",
					subgraph = ?producer,
					worker = %worker.name,
				);
				break;
			}
		}
	}
}

//
// MARK: Tests
//

#[cfg(test)]
mod tests {
	use super::*;
	use crate::connection::WorkerConnection;
	use dish_flow::Subgraph;
	use uuid::Uuid;

	fn seeded_state() -> (FtState, Arc<WorkerConnection>, Uuid, Uuid) {
		let mut state = FtState::new();
		let worker = Arc::new(WorkerConnection::detached("w0", "a", 65432));
		worker.add_running_process();

		let producer = Subgraph::empty(1.into());
		let u1 = Uuid::new_v4();
		let u2 = Uuid::new_v4();

		state.all_uuid_to_graphs.insert(u1, (1.into(), 2.into()));
		state.all_uuid_to_graphs.insert(u2, (1.into(), 3.into()));
		state.all_graph_to_uuid.insert(1.into(), vec![u1, u2]);
		state
			.all_worker_subgraph_pairs
			.push((worker.clone(), producer));

		(state, worker, u1, u2)
	}

	#[test]
	fn read_notices_shrink_the_outstanding_list() {
		let (mut state, worker, u1, u2) = seeded_state();

		apply_completion_notice(
			&mut state,
			&CompletionNotice {
				role: NoticeRole::Read,
				uuid: u1,
			},
		);

		assert_eq!(state.all_graph_to_uuid[&1.into()], vec![u2]);
		// Still one stream outstanding, the placement stays charged.
		assert_eq!(worker.running_processes(), 1);
	}

	#[test]
	fn fully_observed_producer_releases_its_worker() {
		let (mut state, worker, u1, u2) = seeded_state();

		for u in [u1, u2] {
			apply_completion_notice(
				&mut state,
				&CompletionNotice {
					role: NoticeRole::Read,
					uuid: u,
				},
			);
		}

		assert!(state.all_graph_to_uuid[&1.into()].is_empty());
		assert_eq!(worker.running_processes(), 0);
	}

	#[test]
	fn write_notices_are_ignored() {
		let (mut state, _, u1, _) = seeded_state();

		apply_completion_notice(
			&mut state,
			&CompletionNotice {
				role: NoticeRole::Write,
				uuid: u1,
			},
		);

		assert_eq!(state.all_graph_to_uuid[&1.into()].len(), 2);
	}

	#[test]
	fn duplicate_and_unknown_notices_are_no_ops() {
		let (mut state, _, u1, _) = seeded_state();

		for _ in 0..3 {
			apply_completion_notice(
				&mut state,
				&CompletionNotice {
					role: NoticeRole::Read,
					uuid: u1,
				},
			);
		}
		apply_completion_notice(
			&mut state,
			&CompletionNotice {
				role: NoticeRole::Read,
				uuid: Uuid::new_v4(),
			},
		);

		assert_eq!(state.all_graph_to_uuid[&1.into()].len(), 1);
	}
}
