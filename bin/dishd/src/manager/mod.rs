//! The worker manager.
//!
//! Owns every placement decision and all fault-tolerance bookkeeping.
//! Dispatch and recovery are serialized by one lock around [`FtState`]:
//! a new pipeline never starts mid-recovery, and a recovery never
//! observes a half-populated dispatch.

use smartstring::{LazyCompact, SmartString};
use std::{
	collections::BTreeMap,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use dish_dfs::client::DiscoveryClient;
use dish_flow::{
	emit::EmitError,
	graph::GraphError,
	remote::{PortAllocator, RemoteTarget, RewriteError},
	split::SplitError,
	FileId, Subgraph, SubgraphId, SubgraphIdGen,
};
use dish_proto::{ProtocolError, ShellVars};

use crate::{config::DishdConfig, connection::WorkerConnection};

pub mod completion;
pub mod dispatch;
pub mod kill;
pub mod recovery;

//
// MARK: Errors
//

#[derive(Debug, Error)]
pub enum DispatchError {
	#[error("i/o error during dispatch")]
	Io(#[from] std::io::Error),

	#[error("could not decode pipeline file")]
	BadIr(#[from] serde_json::Error),

	#[error("graph error during dispatch")]
	Graph(#[from] GraphError),

	#[error("could not split pipeline")]
	Split(#[from] SplitError),

	#[error("could not insert remote pipes")]
	Rewrite(#[from] RewriteError),

	#[error("could not emit shell script")]
	Emit(#[from] EmitError),

	#[error("worker connection failed")]
	Protocol(#[from] ProtocolError),

	#[error("discovery request failed")]
	Discovery(#[from] dish_dfs::client::DiscoveryRequestError),

	#[error("no workers online where the data is stored")]
	NoEligibleWorker,

	#[error("no merger found in the subgraphs")]
	NoMerger,

	#[error("invalid kill target `{0}`, must be either `merger` or `regular`")]
	InvalidKillTarget(String),

	#[error("malformed command `{0}`")]
	BadCommand(String),
}

//
// MARK: State
//

/// Fault-tolerance bookkeeping. The mutex this lives behind doubles as
/// the reschedule lock.
pub struct FtState {
	pub subgraph_ids: SubgraphIdGen,

	/// Every placement made so far, across pipeline invocations.
	pub all_worker_subgraph_pairs: Vec<(Arc<WorkerConnection>, Subgraph)>,

	pub all_merger_to_shell_vars: BTreeMap<SubgraphId, Option<ShellVars>>,
	pub all_merger_to_declared_functions: BTreeMap<SubgraphId, String>,

	/// Stream → (producer, consumer).
	pub all_uuid_to_graphs: BTreeMap<Uuid, (SubgraphId, SubgraphId)>,

	/// Streams a producer still owes its consumers. Empty means every
	/// output of that subgraph has been observed downstream, so a crash
	/// of its host does not require re-running it.
	pub all_graph_to_uuid: BTreeMap<SubgraphId, Vec<Uuid>>,

	pub all_merger_to_subgraph: BTreeMap<SubgraphId, Vec<SubgraphId>>,
	pub all_subgraph_to_merger: BTreeMap<SubgraphId, SubgraphId>,
}

impl FtState {
	pub fn new() -> Self {
		Self {
			subgraph_ids: SubgraphIdGen::new(),
			all_worker_subgraph_pairs: Vec::new(),
			all_merger_to_shell_vars: BTreeMap::new(),
			all_merger_to_declared_functions: BTreeMap::new(),
			all_uuid_to_graphs: BTreeMap::new(),
			all_graph_to_uuid: BTreeMap::new(),
			all_merger_to_subgraph: BTreeMap::new(),
			all_subgraph_to_merger: BTreeMap::new(),
		}
	}
}

//
// MARK: Manager
//

pub struct WorkersManager {
	pub config: Arc<DishdConfig>,

	/// The configured remote workers. Placement draws from these.
	pub workers: Vec<Arc<WorkerConnection>>,

	/// The workerd next to this coordinator; runs main-side writer
	/// subgraphs. Never picked by [`WorkersManager::get_worker`].
	pub client_worker: Arc<WorkerConnection>,

	pub ports: PortAllocator,
	pub state: Mutex<FtState>,
	pub discovery: Arc<dyn DiscoveryClient>,

	/// Fault injection fires at most once per run.
	kill_node_req_sent: AtomicBool,

	/// Polled by the completion listener's accept loop.
	daemon_quit: AtomicBool,
}

/// [`RemoteTarget`] lets the rewriter place subgraphs without knowing
/// about sockets.
impl RemoteTarget for WorkerConnection {
	fn host(&self) -> &str {
		WorkerConnection::host(self)
	}
}

impl WorkersManager {
	pub fn new(
		config: Arc<DishdConfig>,
		workers: Vec<Arc<WorkerConnection>>,
		client_worker: Arc<WorkerConnection>,
		discovery: Arc<dyn DiscoveryClient>,
	) -> Self {
		let base_port = config.dishd_base_port;
		Self {
			config,
			workers,
			client_worker,
			ports: PortAllocator::new(base_port),
			state: Mutex::new(FtState::new()),
			discovery,
			kill_node_req_sent: AtomicBool::new(false),
			daemon_quit: AtomicBool::new(false),
		}
	}

	/// Remote workers plus the client pseudo-worker, for broadcasts.
	pub fn all_workers(&self) -> impl Iterator<Item = &Arc<WorkerConnection>> {
		self.workers.iter().chain(std::iter::once(&self.client_worker))
	}

	/// The least-loaded online worker that can reach every given edge.
	pub fn get_worker(&self, fids: &[FileId]) -> Result<Arc<WorkerConnection>, DispatchError> {
		let mut best: Option<&Arc<WorkerConnection>> = None;

		for worker in &self.workers {
			if !worker.is_online() {
				continue;
			}
			if fids.iter().any(|fid| !fid.is_available_on(worker.host())) {
				continue;
			}

			let better = match best {
				None => true,
				Some(b) => b.running_processes() > worker.running_processes(),
			};
			if better {
				best = Some(worker);
			}
		}

		best.cloned().ok_or(DispatchError::NoEligibleWorker)
	}

	pub fn find_worker_by_host(&self, host: &str) -> Vec<Arc<WorkerConnection>> {
		self.workers
			.iter()
			.filter(|w| w.host() == host)
			.cloned()
			.collect()
	}

	pub fn kill_node_req_sent(&self) -> bool {
		self.kill_node_req_sent.load(Ordering::Relaxed)
	}

	pub fn mark_kill_node_req_sent(&self) {
		self.kill_node_req_sent.store(true, Ordering::Relaxed);
	}

	pub fn quit_requested(&self) -> bool {
		self.daemon_quit.load(Ordering::Relaxed)
	}

	pub fn request_quit(&self) {
		self.daemon_quit.store(true, Ordering::Relaxed);
	}
}

/// Group placements by worker name for batched sends.
pub fn group_by_worker(
	pairs: &[(Arc<WorkerConnection>, Subgraph)],
) -> BTreeMap<SmartString<LazyCompact>, (Arc<WorkerConnection>, Vec<Subgraph>, Vec<Subgraph>)> {
	let mut grouped: BTreeMap<
		SmartString<LazyCompact>,
		(Arc<WorkerConnection>, Vec<Subgraph>, Vec<Subgraph>),
	> = BTreeMap::new();

	for (worker, subgraph) in pairs {
		let entry = grouped
			.entry(worker.name.clone())
			.or_insert_with(|| (worker.clone(), Vec::new(), Vec::new()));
		if subgraph.merger {
			entry.2.push(subgraph.clone());
		} else {
			entry.1.push(subgraph.clone());
		}
	}

	grouped
}

//
// MARK: Tests
//
