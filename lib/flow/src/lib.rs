//! The dataflow graph a compiled pipeline arrives as, and the
//! transformations that spread it across worker machines: partitioning
//! into per-worker subgraphs, remote-pipe splicing at the cuts, and
//! emission back to executable shell.

pub mod emit;
pub mod fileid;
pub mod graph;
pub mod id;
pub mod node;
pub mod remote;
pub mod split;

pub use fileid::{FileId, FileIdGen, Resource};
pub use graph::{DataflowGraph, Subgraph};
pub use id::{FileIdent, NodeId, SubgraphId, SubgraphIdGen};
pub use node::{Node, NodeKind};
