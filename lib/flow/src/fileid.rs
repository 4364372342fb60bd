//! Edge handles.
//!
//! A [`FileId`] names one channel of the dataflow graph. The identity is
//! what the graph keys on; the resource says how bytes actually move.

use serde::{Deserialize, Serialize};
use smartstring::{LazyCompact, SmartString};
use std::path::PathBuf;

use crate::id::FileIdent;

/// Which side of a remote pipe an edge realizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipeRole {
	Read,
	Write,
}

/// The backing resource of an edge. Exactly one variant per edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resource {
	/// A concrete path in a local or distributed filesystem.
	///
	/// `replicas` lists the hosts holding the file's blocks when the path
	/// is DFS-backed. An empty list means the file is plain local/shared.
	File {
		path: PathBuf,

		#[serde(default)]
		replicas: Vec<SmartString<LazyCompact>>,
	},

	/// An inherited file descriptor of the host shell (stdin = 0, stdout = 1).
	FileDescriptor { fd: u32 },

	/// An anonymous in-process pipe, local to one subgraph.
	Ephemeral,

	/// A synthetic edge realized by a TCP connection.
	RemotePipe {
		host: SmartString<LazyCompact>,
		port: u16,
		role: PipeRole,
	},
}

/// A handle for one edge of the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileId {
	ident: FileIdent,

	resource: Resource,

	/// Temp-dir component used when this edge is materialized as a FIFO.
	#[serde(default)]
	prefix: SmartString<LazyCompact>,
}

impl FileId {
	pub fn new(ident: FileIdent, resource: Resource) -> Self {
		Self {
			ident,
			resource,
			prefix: SmartString::new(),
		}
	}

	pub fn ident(&self) -> FileIdent {
		self.ident
	}

	pub fn resource(&self) -> &Resource {
		&self.resource
	}

	pub fn set_resource(&mut self, resource: Resource) {
		self.resource = resource;
	}

	pub fn prefix(&self) -> &str {
		&self.prefix
	}

	pub fn set_prefix(&mut self, prefix: &str) {
		self.prefix = prefix.into();
	}

	pub fn has_file_resource(&self) -> bool {
		matches!(self.resource, Resource::File { .. })
	}

	pub fn has_fd_resource(&self) -> bool {
		matches!(self.resource, Resource::FileDescriptor { .. })
	}

	pub fn is_ephemeral(&self) -> bool {
		matches!(self.resource, Resource::Ephemeral)
	}

	/// Is this edge backed by a file in the distributed filesystem?
	pub fn has_remote_file_resource(&self) -> bool {
		match &self.resource {
			Resource::File { replicas, .. } => !replicas.is_empty(),
			_ => false,
		}
	}

	/// Can a process on `host` open this edge's resource?
	///
	/// Only DFS-backed files constrain placement; everything else either
	/// travels with the subgraph or is reachable from any machine.
	pub fn is_available_on(&self, host: &str) -> bool {
		match &self.resource {
			Resource::File { replicas, .. } => {
				replicas.is_empty() || replicas.iter().any(|r| r == host)
			}
			_ => true,
		}
	}
}

/// Hands out fresh edge identities.
#[derive(Debug)]
pub struct FileIdGen {
	next: i64,
}

impl FileIdGen {
	pub fn starting_at(next: i64) -> Self {
		Self { next }
	}

	fn next_ident(&mut self) -> FileIdent {
		let id = self.next;
		self.next += 1;
		id.into()
	}

	/// A fresh identity. The resource starts ephemeral and is usually
	/// overwritten by the caller.
	pub fn next_file_id(&mut self) -> FileId {
		FileId::new(self.next_ident(), Resource::Ephemeral)
	}

	/// A fresh identity with the resource pinned to [`Resource::Ephemeral`].
	pub fn next_ephemeral_file_id(&mut self) -> FileId {
		FileId::new(self.next_ident(), Resource::Ephemeral)
	}
}
