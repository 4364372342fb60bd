//! Command and control nodes.

use serde::{Deserialize, Serialize};
use smartstring::{LazyCompact, SmartString};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::id::{FileIdent, NodeId};

/// One element of a command's argv. Arguments may reference edges of the
/// graph, which render as the edge's materialized path (think `tee out.txt`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum Arg {
	Lit(String),
	Fid(FileIdent),
}

impl Arg {
	pub fn lit(s: &str) -> Self {
		Self::Lit(s.into())
	}
}

/// What a node does when the graph runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
	/// An ordinary shell command.
	Command {
		argv: Vec<Arg>,

		#[serde(default)]
		env: BTreeMap<SmartString<LazyCompact>, String>,
	},

	/// Connects to a listening remote writer and emits the stream on its
	/// single output edge.
	RemoteRead {
		host: SmartString<LazyCompact>,
		port: u16,
		uuid: Uuid,

		#[serde(default)]
		debug: bool,
	},

	/// Listens on `port` and ships its single input edge to whoever
	/// connects. `host` is where the listener runs.
	RemoteWrite {
		host: SmartString<LazyCompact>,
		port: u16,
		uuid: Uuid,

		#[serde(default)]
		debug: bool,

		/// Fault-injection hook: which worker role the datastream
		/// runtime should sabotage mid-transfer.
		#[serde(default)]
		kill: Option<SmartString<LazyCompact>>,
	},

	/// Decouples producer and consumer rates through a buffer.
	Eager,

	/// Fans one input out over its output edges.
	Split,

	/// Concatenates its input edges in order.
	Merge,

	/// Strips the batch framing `Split` added.
	Unwrap,
}

/// A node of the dataflow graph: a command or a synthetic control node,
/// with ordered input and output edges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
	id: NodeId,

	inputs: Vec<FileIdent>,
	outputs: Vec<FileIdent>,

	/// True if this node fans multiple sub-branches back into one.
	#[serde(default)]
	merger: bool,

	kind: NodeKind,
}

impl Node {
	pub fn new(id: NodeId, inputs: Vec<FileIdent>, outputs: Vec<FileIdent>, kind: NodeKind) -> Self {
		Self {
			id,
			inputs,
			outputs,
			merger: false,
			kind,
		}
	}

	/// A plain command node with literal arguments.
	pub fn command(id: NodeId, argv: &[&str], inputs: Vec<FileIdent>, outputs: Vec<FileIdent>) -> Self {
		Self::new(
			id,
			inputs,
			outputs,
			NodeKind::Command {
				argv: argv.iter().map(|a| Arg::lit(a)).collect(),
				env: BTreeMap::new(),
			},
		)
	}

	pub fn remote_read(
		id: NodeId,
		output: FileIdent,
		host: &str,
		port: u16,
		uuid: Uuid,
	) -> Self {
		Self::new(
			id,
			Vec::new(),
			vec![output],
			NodeKind::RemoteRead {
				host: host.into(),
				port,
				uuid,
				debug: false,
			},
		)
	}

	pub fn remote_write(
		id: NodeId,
		input: FileIdent,
		stdout: FileIdent,
		host: &str,
		port: u16,
		uuid: Uuid,
	) -> Self {
		Self::new(
			id,
			vec![input],
			vec![stdout],
			NodeKind::RemoteWrite {
				host: host.into(),
				port,
				uuid,
				debug: false,
				kill: None,
			},
		)
	}

	pub fn id(&self) -> NodeId {
		self.id
	}

	pub fn inputs(&self) -> &[FileIdent] {
		&self.inputs
	}

	pub fn outputs(&self) -> &[FileIdent] {
		&self.outputs
	}

	pub fn kind(&self) -> &NodeKind {
		&self.kind
	}

	pub fn kind_mut(&mut self) -> &mut NodeKind {
		&mut self.kind
	}

	pub fn is_merger(&self) -> bool {
		self.merger
	}

	pub fn set_merger(&mut self, merger: bool) {
		self.merger = merger;
	}

	pub fn is_remote_read(&self) -> bool {
		matches!(self.kind, NodeKind::RemoteRead { .. })
	}

	pub fn is_remote_write(&self) -> bool {
		matches!(self.kind, NodeKind::RemoteWrite { .. })
	}

	/// Substitute an edge identity everywhere this node references it.
	pub(crate) fn replace_ident(&mut self, old: FileIdent, new: FileIdent) {
		for i in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
			if *i == old {
				*i = new;
			}
		}

		if let NodeKind::Command { argv, .. } = &mut self.kind {
			for arg in argv {
				if let Arg::Fid(f) = arg {
					if *f == old {
						*f = new;
					}
				}
			}
		}
	}
}
