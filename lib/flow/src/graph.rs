//! The dataflow graph.
//!
//! Producer/consumer relations are kept as id lookup tables, not embedded
//! pointers: an edge knows the ids of the nodes on either end, a node
//! knows the identities of its edges.

use petgraph::{algo::toposort, graphmap::GraphMap, Directed};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::{
	fileid::{FileId, FileIdGen},
	id::{FileIdent, NodeId, SubgraphId},
	node::Node,
};

//
// MARK: Errors
//

#[derive(Debug, Error)]
pub enum GraphError {
	/// An operation referenced an edge this graph doesn't contain
	#[error("no edge with identity {0:?} in graph")]
	MissingEdge(FileIdent),

	/// An operation referenced a node this graph doesn't contain
	#[error("no node with id {0:?} in graph")]
	MissingNode(NodeId),

	/// Two edges with the same identity were added to one graph
	#[error("edge identity {0:?} added twice")]
	DuplicateEdge(FileIdent),
}

//
// MARK: Edge
//

/// One edge of the graph: the handle plus the nodes on either end.
/// `from == None` marks a graph input, `to == None` a graph output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
	pub from: Option<NodeId>,
	pub to: Option<NodeId>,
	pub fid: FileId,
}

//
// MARK: Graph
//

/// A DAG of command/control nodes connected by typed edges.
///
/// Graphs are built once by the compiler, partitioned, patched by the
/// remote-pipe rewriter, and immutable after dispatch.
///
/// On the wire a graph is a pair of entry lists; both keys are
/// recoverable from the entries, and JSON object keys would otherwise
/// have to be strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "GraphEntries", into = "GraphEntries")]
pub struct DataflowGraph {
	edges: BTreeMap<FileIdent, Edge>,
	nodes: BTreeMap<NodeId, Node>,
}

#[derive(Serialize, Deserialize)]
struct GraphEntries {
	edges: Vec<Edge>,
	nodes: Vec<Node>,
}

impl From<GraphEntries> for DataflowGraph {
	fn from(value: GraphEntries) -> Self {
		Self {
			edges: value
				.edges
				.into_iter()
				.map(|e| (e.fid.ident(), e))
				.collect(),
			nodes: value.nodes.into_iter().map(|n| (n.id(), n)).collect(),
		}
	}
}

impl From<DataflowGraph> for GraphEntries {
	fn from(value: DataflowGraph) -> Self {
		Self {
			edges: value.edges.into_values().collect(),
			nodes: value.nodes.into_values().collect(),
		}
	}
}

impl DataflowGraph {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn is_empty(&self) -> bool {
		self.nodes.is_empty()
	}

	pub fn len_nodes(&self) -> usize {
		self.nodes.len()
	}

	pub fn get_node(&self, id: NodeId) -> Option<&Node> {
		self.nodes.get(&id)
	}

	pub fn get_node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
		self.nodes.get_mut(&id)
	}

	pub fn get_edge(&self, ident: FileIdent) -> Option<&Edge> {
		self.edges.get(&ident)
	}

	pub fn contains_edge(&self, ident: FileIdent) -> bool {
		self.edges.contains_key(&ident)
	}

	pub fn iter_nodes(&self) -> impl Iterator<Item = &Node> {
		self.nodes.values()
	}

	pub fn iter_nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
		self.nodes.values_mut()
	}

	pub fn iter_edges(&self) -> impl Iterator<Item = &Edge> {
		self.edges.values()
	}

	/// Add a node and wire its listed edges to it.
	/// Every edge the node references must already be in the graph.
	pub fn add_node(&mut self, node: Node) -> Result<(), GraphError> {
		let id = node.id();

		for ident in node.inputs() {
			self.edges
				.get_mut(ident)
				.ok_or(GraphError::MissingEdge(*ident))?
				.to = Some(id);
		}
		for ident in node.outputs() {
			self.edges
				.get_mut(ident)
				.ok_or(GraphError::MissingEdge(*ident))?
				.from = Some(id);
		}

		self.nodes.insert(id, node);
		return Ok(());
	}

	/// Add an unattached edge.
	pub fn add_edge(&mut self, fid: FileId) -> Result<(), GraphError> {
		let ident = fid.ident();
		if self.edges.contains_key(&ident) {
			return Err(GraphError::DuplicateEdge(ident));
		}

		self.edges.insert(
			ident,
			Edge {
				from: None,
				to: None,
				fid,
			},
		);
		return Ok(());
	}

	/// Add an edge produced by `node`.
	pub fn add_from_edge(&mut self, node: NodeId, fid: FileId) -> Result<(), GraphError> {
		self.add_edge(fid.clone())?;
		self.edges.get_mut(&fid.ident()).unwrap().from = Some(node);
		return Ok(());
	}

	/// Add an edge consumed by `node`.
	pub fn add_to_edge(&mut self, fid: FileId, node: NodeId) -> Result<(), GraphError> {
		self.add_edge(fid.clone())?;
		self.edges.get_mut(&fid.ident()).unwrap().to = Some(node);
		return Ok(());
	}

	/// Point an existing edge's consumer at `node`.
	pub fn set_edge_to(&mut self, ident: FileIdent, node: NodeId) -> Result<(), GraphError> {
		self.edges
			.get_mut(&ident)
			.ok_or(GraphError::MissingEdge(ident))?
			.to = Some(node);
		return Ok(());
	}

	/// Substitute an edge with a fresh handle, everywhere the old identity
	/// was referenced: the edge table and both endpoint nodes.
	pub fn replace_edge(&mut self, old: FileIdent, new_fid: FileId) -> Result<(), GraphError> {
		let edge = self.edges.remove(&old).ok_or(GraphError::MissingEdge(old))?;
		let new = new_fid.ident();

		if let Some(from) = edge.from {
			if let Some(n) = self.nodes.get_mut(&from) {
				n.replace_ident(old, new);
			}
		}
		if let Some(to) = edge.to {
			if let Some(n) = self.nodes.get_mut(&to) {
				n.replace_ident(old, new);
			}
		}

		self.edges.insert(
			new,
			Edge {
				from: edge.from,
				to: edge.to,
				fid: new_fid,
			},
		);
		return Ok(());
	}

	pub fn get_node_input_fids(&self, node: NodeId) -> Result<Vec<FileId>, GraphError> {
		let n = self.nodes.get(&node).ok_or(GraphError::MissingNode(node))?;
		n.inputs()
			.iter()
			.map(|i| {
				self.edges
					.get(i)
					.map(|e| e.fid.clone())
					.ok_or(GraphError::MissingEdge(*i))
			})
			.collect()
	}

	pub fn get_node_output_fids(&self, node: NodeId) -> Result<Vec<FileId>, GraphError> {
		let n = self.nodes.get(&node).ok_or(GraphError::MissingNode(node))?;
		n.outputs()
			.iter()
			.map(|i| {
				self.edges
					.get(i)
					.map(|e| e.fid.clone())
					.ok_or(GraphError::MissingEdge(*i))
			})
			.collect()
	}

	/// Nodes with no predecessor in this graph.
	pub fn source_nodes(&self) -> Vec<NodeId> {
		self.nodes
			.values()
			.filter(|n| {
				n.inputs()
					.iter()
					.all(|i| self.edges.get(i).map(|e| e.from.is_none()).unwrap_or(true))
			})
			.map(|n| n.id())
			.collect()
	}

	/// Nodes with no successor in this graph.
	pub fn sink_nodes(&self) -> Vec<NodeId> {
		self.nodes
			.values()
			.filter(|n| {
				n.outputs()
					.iter()
					.all(|i| self.edges.get(i).map(|e| e.to.is_none()).unwrap_or(true))
			})
			.map(|n| n.id())
			.collect()
	}

	/// The nodes consuming `node`'s outputs, in output order.
	pub fn get_next_nodes(&self, node: NodeId) -> Vec<NodeId> {
		let Some(n) = self.nodes.get(&node) else {
			return Vec::new();
		};

		n.outputs()
			.iter()
			.filter_map(|i| self.edges.get(i).and_then(|e| e.to))
			.collect()
	}

	pub fn all_fids(&self) -> Vec<FileId> {
		self.edges.values().map(|e| e.fid.clone()).collect()
	}

	/// Edges with no producer in this graph.
	pub fn all_input_fids(&self) -> Vec<FileId> {
		self.edges
			.values()
			.filter(|e| e.from.is_none())
			.map(|e| e.fid.clone())
			.collect()
	}

	/// Edges with no consumer in this graph.
	pub fn all_output_fids(&self) -> Vec<FileId> {
		self.edges
			.values()
			.filter(|e| e.to.is_none())
			.map(|e| e.fid.clone())
			.collect()
	}

	/// Returns `true` if this graph has a cycle.
	pub fn has_cycle(&self) -> bool {
		let mut fake_graph = GraphMap::<i64, (), Directed>::new();
		for node in self.nodes.keys() {
			fake_graph.add_node((*node).into());
		}
		for edge in self.edges.values() {
			if let (Some(from), Some(to)) = (edge.from, edge.to) {
				fake_graph.add_edge(from.into(), to.into(), ());
			}
		}
		toposort(&fake_graph, None).is_err()
	}

	/// A generator seeded past every identity this graph uses.
	pub fn file_id_gen(&self) -> FileIdGen {
		let max = self
			.edges
			.keys()
			.map(|k| i64::from(*k))
			.max()
			.unwrap_or(0);
		FileIdGen::starting_at(max + 1)
	}

	pub(crate) fn remove_node(&mut self, id: NodeId) -> Option<Node> {
		self.nodes.remove(&id)
	}

	pub(crate) fn remove_edge(&mut self, ident: FileIdent) -> Option<Edge> {
		self.edges.remove(&ident)
	}
}

//
// MARK: Subgraph
//

/// A connected slice of the graph assigned to one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subgraph {
	pub id: SubgraphId,

	/// True for the one subgraph that joins the fan-out branches of a
	/// parallel region.
	pub merger: bool,

	pub graph: DataflowGraph,
}

impl Subgraph {
	pub fn empty(id: SubgraphId) -> Self {
		Self {
			id,
			merger: false,
			graph: DataflowGraph::new(),
		}
	}
}

//
// MARK: Tests
//

#[cfg(test)]
mod tests {
	use super::*;
	use crate::fileid::Resource;

	fn file_fid(gen: &mut FileIdGen, path: &str) -> FileId {
		let mut f = gen.next_file_id();
		f.set_resource(Resource::File {
			path: path.into(),
			replicas: vec![],
		});
		f
	}

	/// `cat in.txt | grep x > out.txt` as a two-node graph.
	fn two_stage() -> (DataflowGraph, NodeId, NodeId) {
		let mut gen = FileIdGen::starting_at(1);
		let mut g = DataflowGraph::new();

		let input = file_fid(&mut gen, "/tmp/in.txt");
		let mid = gen.next_ephemeral_file_id();
		let output = file_fid(&mut gen, "/tmp/out.txt");

		let cat = NodeId::from(1);
		let grep = NodeId::from(2);

		g.add_edge(input.clone()).unwrap();
		g.add_edge(mid.clone()).unwrap();
		g.add_edge(output.clone()).unwrap();

		g.add_node(Node::command(
			cat,
			&["cat"],
			vec![input.ident()],
			vec![mid.ident()],
		))
		.unwrap();
		g.add_node(Node::command(
			grep,
			&["grep", "x"],
			vec![mid.ident()],
			vec![output.ident()],
		))
		.unwrap();

		(g, cat, grep)
	}

	#[test]
	fn add_node_wires_edges() {
		let (g, cat, grep) = two_stage();

		assert_eq!(g.source_nodes(), vec![cat]);
		assert_eq!(g.sink_nodes(), vec![grep]);
		assert_eq!(g.get_next_nodes(cat), vec![grep]);
		assert_eq!(g.all_input_fids().len(), 1);
		assert!(!g.has_cycle());
	}

	#[test]
	fn replace_edge_substitutes_everywhere() {
		let (mut g, cat, grep) = two_stage();

		let mid_old = g.get_node(cat).unwrap().outputs()[0];
		let mut gen = g.file_id_gen();
		let fresh = gen.next_ephemeral_file_id();

		g.replace_edge(mid_old, fresh.clone()).unwrap();

		assert!(!g.contains_edge(mid_old));
		assert_eq!(g.get_node(cat).unwrap().outputs()[0], fresh.ident());
		assert_eq!(g.get_node(grep).unwrap().inputs()[0], fresh.ident());

		let edge = g.get_edge(fresh.ident()).unwrap();
		assert_eq!(edge.from, Some(cat));
		assert_eq!(edge.to, Some(grep));
	}

	#[test]
	fn file_id_gen_skips_used_identities() {
		let (g, _, _) = two_stage();
		let mut gen = g.file_id_gen();
		let fresh = gen.next_file_id();
		assert!(!g.contains_edge(fresh.ident()));
	}

	#[test]
	fn graphs_survive_serialization() {
		let (g, cat, _) = two_stage();
		let s = serde_json::to_string(&g).unwrap();
		let back: DataflowGraph = serde_json::from_str(&s).unwrap();
		assert_eq!(back.len_nodes(), 2);
		assert_eq!(back.source_nodes(), vec![cat]);
	}
}
