//! Remote-pipe insertion.
//!
//! After splitting, subgraph boundaries are dangling edges. This module
//! reconnects them over the network: every cut edge becomes a listening
//! `remote-write` on the producer side and a connecting `remote-read` on
//! the consumer side, sharing a port and a stream UUID.

use std::{
	collections::BTreeMap,
	sync::{
		atomic::{AtomicU16, Ordering},
		Arc,
	},
};
use thiserror::Error;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::{
	fileid::{FileId, FileIdGen, Resource},
	graph::{GraphError, Subgraph},
	id::{NodeId, SubgraphId, SubgraphIdGen},
	node::{Node, NodeKind},
	split::EdgeMap,
};

//
// MARK: Errors
//

#[derive(Debug, Error)]
pub enum RewriteError {
	#[error("graph error while inserting remote pipes")]
	Graph(#[from] GraphError),

	/// Splitting guarantees one sink per subgraph; anything else means
	/// the input wasn't produced by our splitter.
	#[error("subgraph {subgraph:?} has {count} sinks, expected exactly one")]
	BadSinkCount { subgraph: SubgraphId, count: usize },

	#[error("no workers online where the data is stored")]
	NoEligibleWorker,
}

//
// MARK: Ports
//

/// Process-wide monotonic port counter.
///
/// There is a window between handing out a port and the listener binding
/// it in which another process could take it; the listening side surfaces
/// that as a bind error and the run aborts.
#[derive(Debug)]
pub struct PortAllocator {
	next: AtomicU16,
}

impl PortAllocator {
	pub fn new(base: u16) -> Self {
		Self {
			next: AtomicU16::new(base),
		}
	}

	pub fn next_port(&self) -> u16 {
		self.next.fetch_add(1, Ordering::Relaxed)
	}
}

//
// MARK: Rewriter
//

/// Anything a subgraph can be placed on. The coordinator supplies its
/// live connection type; tests supply stubs.
pub trait RemoteTarget {
	fn host(&self) -> &str;
}

impl<T: RemoteTarget> RemoteTarget for Arc<T> {
	fn host(&self) -> &str {
		T::host(self)
	}
}

#[derive(Debug)]
pub struct RewriteOutput<W> {
	/// The graph the invoking shell runs locally: remote writes feeding
	/// worker inputs, remote reads draining worker outputs.
	pub main_graph: Subgraph,

	/// Placements, one per subgraph.
	pub worker_subgraphs: Vec<(W, Subgraph)>,

	/// Stream identity → (producing subgraph, consuming subgraph).
	pub uuid_to_graphs: BTreeMap<Uuid, (SubgraphId, SubgraphId)>,
}

/// Patch every cut edge of `subgraphs` with a remote-pipe pair and build
/// the main graph that anchors the pipeline on the invoking host.
///
/// `get_worker` picks the least-loaded worker that can reach the given
/// edges (and charges the placement to it); `local_host` is the address
/// remote reads on workers connect back to.
pub fn insert_remote_pipes<W: RemoteTarget>(
	mut subgraphs: Vec<Subgraph>,
	edge_map: &EdgeMap,
	gen: &mut FileIdGen,
	ports: &PortAllocator,
	local_host: &str,
	ids: &mut SubgraphIdGen,
	mut get_worker: impl FnMut(&[FileId]) -> Option<W>,
) -> Result<RewriteOutput<W>, RewriteError> {
	let mut main_graph = Subgraph::empty(ids.next_id());
	let mut uuid_to_graphs = BTreeMap::new();
	let mut workers: Vec<W> = Vec::with_capacity(subgraphs.len());

	let index_of: BTreeMap<SubgraphId, usize> = subgraphs
		.iter()
		.enumerate()
		.map(|(i, s)| (s.id, i))
		.collect();

	// Fresh node ids for the splice nodes, clear of every id the
	// compiler handed us.
	let mut next_node_id: i64 = subgraphs
		.iter()
		.flat_map(|s| s.graph.iter_nodes().map(|n| i64::from(n.id())))
		.max()
		.unwrap_or(0)
		+ 1;
	let mut fresh_node = || -> NodeId {
		let id = next_node_id;
		next_node_id += 1;
		id.into()
	};

	// Pass 1: replace every real output edge of every subgraph sink with
	// an in-graph ephemeral + remote-write, and hand the original
	// resource to the consumer behind a remote-read.
	for i in 0..subgraphs.len() {
		let worker = get_worker(&[]).ok_or(RewriteError::NoEligibleWorker)?;

		let sinks = subgraphs[i].graph.sink_nodes();
		if sinks.len() != 1 {
			return Err(RewriteError::BadSinkCount {
				subgraph: subgraphs[i].id,
				count: sinks.len(),
			});
		}
		let out_edges = subgraphs[i].graph.get_node_output_fids(sinks[0])?;

		for out_edge in out_edges {
			let write_port = ports.next_port();
			let uuid = Uuid::new_v4();
			let producer_id = subgraphs[i].id;

			// Producer side: substitute the edge so other subgraphs
			// referencing it are unaffected, then splice the writer.
			{
				let sub = &mut subgraphs[i].graph;
				let stdout = add_stdout_fid(sub, gen)?;
				let ephemeral = gen.next_ephemeral_file_id();
				sub.replace_edge(out_edge.ident(), ephemeral.clone())?;
				sub.add_node(Node::remote_write(
					fresh_node(),
					ephemeral.ident(),
					stdout.ident(),
					worker.host(),
					write_port,
					uuid,
				))?;
			}

			// Consumer side: a fresh edge carrying the original resource.
			let mut new_edge = gen.next_file_id();
			new_edge.set_resource(out_edge.resource().clone());

			let consumer_id = match edge_map.get(&out_edge.ident()) {
				Some(consumers) if out_edge.is_ephemeral() => {
					let j = index_of[&consumers[0]];
					subgraphs[j]
						.graph
						.replace_edge(out_edge.ident(), new_edge.clone())?;
					subgraphs[j].graph.add_node(Node::remote_read(
						fresh_node(),
						new_edge.ident(),
						worker.host(),
						write_port,
						uuid,
					))?;
					subgraphs[j].id
				}
				_ => {
					main_graph.graph.add_edge(new_edge.clone())?;
					main_graph.graph.add_node(Node::remote_read(
						fresh_node(),
						new_edge.ident(),
						worker.host(),
						write_port,
						uuid,
					))?;
					main_graph.id
				}
			};

			trace!(
				message = "Spliced output edge",
				producer = ?producer_id,
				consumer = ?consumer_id,
				port = write_port,
				%uuid,
			);
			uuid_to_graphs.insert(uuid, (producer_id, consumer_id));
		}

		workers.push(worker);
	}

	// Pass 2: input edges backed by caller-side files or descriptors.
	// The bytes live where the pipeline was invoked, so they are shipped
	// through the main graph.
	for sub in &mut subgraphs {
		for source in sub.graph.source_nodes() {
			for in_edge in sub.graph.get_node_input_fids(source)? {
				// A command can mix a file input with ephemeral ones
				// (think `spell`); only caller-side resources move.
				if !(in_edge.has_file_resource() || in_edge.has_fd_resource()) {
					continue;
				}

				let write_port = ports.next_port();
				let uuid = Uuid::new_v4();

				let stdout = add_stdout_fid(&mut main_graph.graph, gen)?;
				let mut new_edge = gen.next_file_id();
				new_edge.set_resource(in_edge.resource().clone());
				main_graph.graph.add_edge(new_edge.clone())?;
				main_graph.graph.add_node(Node::remote_write(
					fresh_node(),
					new_edge.ident(),
					stdout.ident(),
					local_host,
					write_port,
					uuid,
				))?;

				let ephemeral = gen.next_ephemeral_file_id();
				sub.graph.replace_edge(in_edge.ident(), ephemeral.clone())?;
				sub.graph.add_node(Node::remote_read(
					fresh_node(),
					ephemeral.ident(),
					local_host,
					write_port,
					uuid,
				))?;

				trace!(
					message = "Routed caller-side input through main",
					consumer = ?sub.id,
					port = write_port,
					%uuid,
				);
				uuid_to_graphs.insert(uuid, (main_graph.id, sub.id));
			}
		}
	}

	debug!(
		message = "Inserted remote pipes",
		subgraphs = subgraphs.len(),
		streams = uuid_to_graphs.len(),
	);

	let worker_subgraphs = workers.into_iter().zip(subgraphs).collect();
	return Ok(RewriteOutput {
		main_graph,
		worker_subgraphs,
		uuid_to_graphs,
	});
}

/// A synthetic stdout edge. Keeps emitted scripts well-formed for nodes
/// whose real output leaves the machine.
fn add_stdout_fid(
	graph: &mut crate::graph::DataflowGraph,
	gen: &mut FileIdGen,
) -> Result<FileId, GraphError> {
	let mut stdout = gen.next_file_id();
	stdout.set_resource(Resource::FileDescriptor { fd: 1 });
	graph.add_edge(stdout.clone())?;
	return Ok(stdout);
}

//
// MARK: Main-graph split
//

/// Cut the main graph into the reader half the invoking shell runs
/// inline and one writer subgraph per caller-side input, dispatched to
/// the coordinator's pseudo-worker.
///
/// Stream records whose producer was the main graph move to the writer
/// that now owns the corresponding remote-write.
pub fn split_main_graph(
	mut main: Subgraph,
	uuid_to_graphs: &mut BTreeMap<Uuid, (SubgraphId, SubgraphId)>,
	ids: &mut SubgraphIdGen,
) -> Result<(Subgraph, Vec<Subgraph>), RewriteError> {
	let write_nodes: Vec<NodeId> = main
		.graph
		.iter_nodes()
		.filter(|n| n.is_remote_write())
		.map(|n| n.id())
		.collect();

	let mut writers = Vec::new();
	for node_id in write_nodes {
		let node = match main.graph.remove_node(node_id) {
			Some(n) => n,
			None => return Err(GraphError::MissingNode(node_id).into()),
		};

		let mut writer = Subgraph::empty(ids.next_id());
		for ident in node.inputs().iter().chain(node.outputs().iter()) {
			let edge = main
				.graph
				.remove_edge(*ident)
				.ok_or(GraphError::MissingEdge(*ident))?;
			writer.graph.add_edge(edge.fid)?;
		}

		if let NodeKind::RemoteWrite { uuid, .. } = node.kind() {
			if let Some(entry) = uuid_to_graphs.get_mut(uuid) {
				if entry.0 == main.id {
					entry.0 = writer.id;
				}
			}
		}

		writer.graph.add_node(node)?;
		writers.push(writer);
	}

	return Ok((main, writers));
}

//
// MARK: Tests
//

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		graph::DataflowGraph,
		node::{Arg, NodeKind},
		split::split_graph,
	};

	#[derive(Debug, Clone)]
	struct StubWorker {
		host: &'static str,
	}

	impl RemoteTarget for StubWorker {
		fn host(&self) -> &str {
			self.host
		}
	}

	fn file_fid(gen: &mut FileIdGen, path: &str) -> FileId {
		let mut f = gen.next_file_id();
		f.set_resource(Resource::File {
			path: path.into(),
			replicas: vec![],
		});
		f
	}

	/// `tee → {A, B} → cat` with a file input and a file output.
	fn fan_out_merge() -> DataflowGraph {
		let mut gen = FileIdGen::starting_at(1);
		let mut g = DataflowGraph::new();

		let input = file_fid(&mut gen, "/tmp/in.txt");
		let to_a = gen.next_ephemeral_file_id();
		let to_b = gen.next_ephemeral_file_id();
		let from_a = gen.next_ephemeral_file_id();
		let from_b = gen.next_ephemeral_file_id();
		let output = file_fid(&mut gen, "/tmp/out.txt");

		for fid in [&input, &to_a, &to_b, &from_a, &from_b, &output] {
			g.add_edge((*fid).clone()).unwrap();
		}

		g.add_node(Node::new(
			1.into(),
			vec![input.ident()],
			vec![to_a.ident(), to_b.ident()],
			NodeKind::Split,
		))
		.unwrap();
		g.add_node(Node::command(
			2.into(),
			&["grep", "alpha"],
			vec![to_a.ident()],
			vec![from_a.ident()],
		))
		.unwrap();
		g.add_node(Node::command(
			3.into(),
			&["grep", "beta"],
			vec![to_b.ident()],
			vec![from_b.ident()],
		))
		.unwrap();
		g.add_node(Node::new(
			4.into(),
			vec![from_a.ident(), from_b.ident()],
			vec![output.ident()],
			NodeKind::Merge,
		))
		.unwrap();

		g
	}

	fn rewrite(
		g: &DataflowGraph,
	) -> (RewriteOutput<StubWorker>, SubgraphIdGen) {
		let mut ids = SubgraphIdGen::new();
		let split = split_graph(g, &mut ids).unwrap();
		let mut gen = g.file_id_gen();
		let ports = PortAllocator::new(58000);

		let hosts = ["worker-1", "worker-2"];
		let mut i = 0;
		let out = insert_remote_pipes(
			split.subgraphs,
			&split.edge_map,
			&mut gen,
			&ports,
			"coordinator",
			&mut ids,
			|_| {
				let w = StubWorker { host: hosts[i % 2] };
				i += 1;
				Some(w)
			},
		)
		.unwrap();

		(out, ids)
	}

	/// Collect every remote node across the placement and main graphs.
	fn all_remote_nodes(out: &RewriteOutput<StubWorker>) -> Vec<Node> {
		out.worker_subgraphs
			.iter()
			.map(|(_, s)| s)
			.chain(std::iter::once(&out.main_graph))
			.flat_map(|s| s.graph.iter_nodes())
			.filter(|n| n.is_remote_read() || n.is_remote_write())
			.cloned()
			.collect()
	}

	#[test]
	fn every_cut_edge_gets_a_matching_pair() {
		let g = fan_out_merge();
		let (out, _) = rewrite(&g);

		for (uuid, _) in &out.uuid_to_graphs {
			let nodes: Vec<Node> = all_remote_nodes(&out)
				.into_iter()
				.filter(|n| match n.kind() {
					NodeKind::RemoteRead { uuid: u, .. }
					| NodeKind::RemoteWrite { uuid: u, .. } => u == uuid,
					_ => false,
				})
				.collect();

			assert_eq!(nodes.len(), 2, "stream {uuid} has {} ends", nodes.len());

			let write = nodes.iter().find(|n| n.is_remote_write()).unwrap();
			let read = nodes.iter().find(|n| n.is_remote_read()).unwrap();
			let (NodeKind::RemoteWrite { host: wh, port: wp, .. }, NodeKind::RemoteRead { host: rh, port: rp, .. }) =
				(write.kind(), read.kind())
			else {
				unreachable!()
			};
			assert_eq!(wh, rh);
			assert_eq!(wp, rp);
		}
	}

	#[test]
	fn ports_are_distinct_per_pair() {
		let g = fan_out_merge();
		let (out, _) = rewrite(&g);

		let mut ports: Vec<u16> = all_remote_nodes(&out)
			.iter()
			.filter(|n| n.is_remote_write())
			.map(|n| match n.kind() {
				NodeKind::RemoteWrite { port, .. } => *port,
				_ => unreachable!(),
			})
			.collect();
		let before = ports.len();
		ports.sort_unstable();
		ports.dedup();
		assert_eq!(ports.len(), before);
	}

	#[test]
	fn caller_side_resources_route_through_main() {
		let g = fan_out_merge();
		let (out, _) = rewrite(&g);

		// The file input is shipped by a main-side writer, the file
		// output drained by a main-side reader.
		assert_eq!(
			out.main_graph
				.graph
				.iter_nodes()
				.filter(|n| n.is_remote_write())
				.count(),
			1
		);
		assert_eq!(
			out.main_graph
				.graph
				.iter_nodes()
				.filter(|n| n.is_remote_read())
				.count(),
			1
		);

		// No worker subgraph kept a file resource on its input side.
		for (_, sub) in &out.worker_subgraphs {
			for source in sub.graph.source_nodes() {
				for fid in sub.graph.get_node_input_fids(source).unwrap() {
					assert!(!fid.has_file_resource());
				}
			}
		}
	}

	#[test]
	fn command_text_survives_rewriting() {
		let g = fan_out_merge();
		let (out, _) = rewrite(&g);

		let argvs: Vec<Vec<Arg>> = out
			.worker_subgraphs
			.iter()
			.flat_map(|(_, s)| s.graph.iter_nodes())
			.filter_map(|n| match n.kind() {
				NodeKind::Command { argv, .. } => Some(argv.clone()),
				_ => None,
			})
			.collect();

		assert!(argvs.contains(&vec![Arg::lit("grep"), Arg::lit("alpha")]));
		assert!(argvs.contains(&vec![Arg::lit("grep"), Arg::lit("beta")]));
	}

	#[test]
	fn main_split_pins_writers_and_remaps_streams() {
		let g = fan_out_merge();
		let (mut out, mut ids) = rewrite(&g);

		let main_id = out.main_graph.id;
		let (reader, writers) =
			split_main_graph(out.main_graph, &mut out.uuid_to_graphs, &mut ids).unwrap();

		assert_eq!(writers.len(), 1);
		assert!(writers[0].graph.iter_nodes().all(|n| n.is_remote_write()));
		assert!(reader.graph.iter_nodes().all(|n| !n.is_remote_write()));

		// No stream is produced by "main" anymore.
		for (producer, _) in out.uuid_to_graphs.values() {
			assert_ne!(*producer, main_id);
		}
		assert!(out
			.uuid_to_graphs
			.values()
			.any(|(producer, _)| *producer == writers[0].id));
	}

	#[test]
	fn load_is_charged_once_per_subgraph() {
		let g = fan_out_merge();
		let mut ids = SubgraphIdGen::new();
		let split = split_graph(&g, &mut ids).unwrap();
		let n_subgraphs = split.subgraphs.len();
		let mut gen = g.file_id_gen();
		let ports = PortAllocator::new(58000);

		let mut picks = 0;
		insert_remote_pipes(
			split.subgraphs,
			&split.edge_map,
			&mut gen,
			&ports,
			"coordinator",
			&mut ids,
			|_| {
				picks += 1;
				Some(StubWorker { host: "worker-1" })
			},
		)
		.unwrap();

		assert_eq!(picks, n_subgraphs);
	}
}
