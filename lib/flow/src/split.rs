//! Graph partitioning.
//!
//! Cuts one dataflow graph into per-worker subgraphs, breadth-first from
//! the sources, cutting at every join and fan-out boundary.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use thiserror::Error;
use tracing::trace;

use crate::{
	graph::{DataflowGraph, GraphError, Subgraph},
	id::{FileIdent, NodeId, SubgraphId, SubgraphIdGen},
};

//
// MARK: Errors
//

#[derive(Debug, Error)]
pub enum SplitError {
	#[error("graph error while splitting")]
	Graph(#[from] GraphError),

	/// The traversal reached a node id the graph doesn't contain
	#[error("dangling node id {0:?}")]
	DanglingNode(NodeId),
}

/// Which subgraphs reference each edge on the consumer side.
///
/// An ephemeral edge may appear in two subgraphs while the remote-pipe
/// rewriter is patching a cut, hence the list.
pub type EdgeMap = BTreeMap<FileIdent, Vec<SubgraphId>>;

#[derive(Debug)]
pub struct SplitOutput {
	pub subgraphs: Vec<Subgraph>,
	pub edge_map: EdgeMap,
}

//
// MARK: Splitter
//

/// Cut `graph` into subgraphs.
///
/// Every subgraph ends in exactly one sink; the subgraph whose entry node
/// joins two or more branches is flagged as the region's merger.
pub fn split_graph(
	graph: &DataflowGraph,
	ids: &mut SubgraphIdGen,
) -> Result<SplitOutput, SplitError> {
	let mut subgraphs: Vec<Subgraph> = Vec::new();
	let mut edge_map: EdgeMap = BTreeMap::new();

	let mut queue: VecDeque<(NodeId, Subgraph)> = graph
		.source_nodes()
		.into_iter()
		.map(|src| (src, Subgraph::empty(ids.next_id())))
		.collect();

	// The graph is a DAG, so we track traversed edges to know when a
	// join has both branches ready.
	let mut visited_edges: BTreeSet<FileIdent> = graph
		.all_input_fids()
		.iter()
		.map(|f| f.ident())
		.collect();
	let mut visited_nodes: BTreeSet<NodeId> = BTreeSet::new();

	while let Some((node_id, mut sub)) = queue.pop_front() {
		let input_fids = graph.get_node_input_fids(node_id)?;
		let output_fids = graph.get_node_output_fids(node_id)?;

		// A join whose other branch hasn't been traversed yet: park what
		// we have and wait for the other branch to reach this node.
		if input_fids.iter().any(|f| !visited_edges.contains(&f.ident())) {
			if !sub.graph.is_empty() {
				subgraphs.push(sub);
			}
			continue;
		}

		// A node with multiple inputs starts a new merger region.
		if input_fids.len() > 1 && !sub.graph.is_empty() {
			subgraphs.push(sub);
			sub = Subgraph::empty(ids.next_id());
		}

		if !visited_nodes.insert(node_id) {
			continue;
		}

		let node = graph
			.get_node(node_id)
			.ok_or(SplitError::DanglingNode(node_id))?
			.clone();

		if sub.graph.is_empty() {
			sub.merger = input_fids.len() >= 2;
		}

		for input_fid in &input_fids {
			if !sub.graph.contains_edge(input_fid.ident()) {
				sub.graph.add_to_edge(input_fid.clone(), node_id)?;
			} else {
				sub.graph.set_edge_to(input_fid.ident(), node_id)?;
			}
			edge_map.entry(input_fid.ident()).or_default().push(sub.id);
		}

		for output_fid in &output_fids {
			sub.graph.add_from_edge(node_id, output_fid.clone())?;
			visited_edges.insert(output_fid.ident());
		}

		sub.graph.add_node(node)?;

		let next = graph.get_next_nodes(node_id);

		// Straight-line pipes extend the current subgraph. The edge-map
		// check keeps us from stepping into a merger by mistake.
		let single_chain = input_fids.len() == 1
			&& next.len() == 1
			&& output_fids.len() == 1
			&& !edge_map.contains_key(&output_fids[0].ident());

		if single_chain {
			queue.push_back((next[0], sub));
		} else {
			trace!(
				message = "Cutting subgraph",
				subgraph = ?sub.id,
				nodes = sub.graph.len_nodes(),
			);
			subgraphs.push(sub);
			for n in next {
				queue.push_back((n, Subgraph::empty(ids.next_id())));
			}
		}
	}

	return Ok(SplitOutput {
		subgraphs,
		edge_map,
	});
}

//
// MARK: Tests
//
