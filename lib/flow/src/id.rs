#![allow(missing_docs)]

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileIdent {
	id: i64,
}

impl From<FileIdent> for i64 {
	fn from(value: FileIdent) -> Self {
		value.id
	}
}

impl From<i64> for FileIdent {
	fn from(value: i64) -> Self {
		Self { id: value }
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId {
	id: i64,
}

impl From<NodeId> for i64 {
	fn from(value: NodeId) -> Self {
		value.id
	}
}

impl From<i64> for NodeId {
	fn from(value: i64) -> Self {
		Self { id: value }
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubgraphId {
	id: i64,
}

impl SubgraphId {
	/// Wire sentinel meaning "every region" in kill requests.
	pub const ALL: SubgraphId = SubgraphId { id: -1 };
}

impl From<SubgraphId> for i64 {
	fn from(value: SubgraphId) -> Self {
		value.id
	}
}

impl From<i64> for SubgraphId {
	fn from(value: i64) -> Self {
		Self { id: value }
	}
}

/// Hands out fresh subgraph identities.
///
/// One generator lives for the whole coordinator process, so ids stay
/// unique across successive pipeline invocations.
#[derive(Debug)]
pub struct SubgraphIdGen {
	next: i64,
}

impl SubgraphIdGen {
	pub fn new() -> Self {
		Self { next: 0 }
	}

	pub fn next_id(&mut self) -> SubgraphId {
		let id = self.next;
		self.next += 1;
		SubgraphId { id }
	}
}
