//! Datanode liveness.
//!
//! A background task polls the namenode for the set of live datanodes
//! and reports the difference against the previous poll. A host leaving
//! the set is how the coordinator learns about a crash.

use async_trait::async_trait;
use reqwest::{Client, IntoUrl, Url};
use smartstring::{LazyCompact, SmartString};
use std::collections::{BTreeMap, BTreeSet};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub type HostSet = BTreeSet<SmartString<LazyCompact>>;

#[derive(Debug, Error)]
pub enum LivenessError {
	#[error("could not reach the namenode")]
	Request(#[from] reqwest::Error),

	#[error("unexpected namenode response: {0}")]
	BadResponse(&'static str),
}

/// Something that can report which hosts currently hold DFS data.
#[async_trait]
pub trait NodeLister: Send + Sync {
	async fn live_nodes(&self) -> Result<HostSet, LivenessError>;
}

//
// MARK: HDFS
//

/// Reads the live-datanode set from the namenode's JMX endpoint.
pub struct HdfsNodeLister {
	client: Client,
	namenode_url: Url,
}

impl HdfsNodeLister {
	pub fn new(namenode_url: impl IntoUrl) -> Result<Self, reqwest::Error> {
		Ok(Self {
			client: Client::new(),
			namenode_url: namenode_url.into_url()?,
		})
	}
}

#[async_trait]
impl NodeLister for HdfsNodeLister {
	async fn live_nodes(&self) -> Result<HostSet, LivenessError> {
		let mut url = self.namenode_url.join("/jmx").unwrap();
		url.set_query(Some("qry=Hadoop:service=NameNode,name=NameNodeInfo"));

		let body: serde_json::Value = self
			.client
			.get(url)
			.send()
			.await?
			.error_for_status()?
			.json()
			.await?;

		// `LiveNodes` is a JSON object re-encoded as a string, keyed by
		// `host:port`.
		let live = body["beans"]
			.get(0)
			.and_then(|b| b["LiveNodes"].as_str())
			.ok_or(LivenessError::BadResponse("missing LiveNodes bean"))?;

		let nodes: BTreeMap<String, serde_json::Value> = serde_json::from_str(live)
			.map_err(|_parse| LivenessError::BadResponse("LiveNodes is not a JSON object"))?;

		return Ok(nodes
			.keys()
			.map(|k| k.split(':').next().unwrap_or(k).into())
			.collect());
	}
}

//
// MARK: Watcher
//

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessEvent {
	Added(SmartString<LazyCompact>),
	Removed(SmartString<LazyCompact>),
}

/// The events that turn `prev` into `next`. Removals first: a crashed
/// host matters more than a recovered one.
pub fn diff_nodes(prev: &HostSet, next: &HostSet) -> Vec<LivenessEvent> {
	let mut events = Vec::new();
	for gone in prev.difference(next) {
		events.push(LivenessEvent::Removed(gone.clone()));
	}
	for fresh in next.difference(prev) {
		events.push(LivenessEvent::Added(fresh.clone()));
	}
	events
}

/// Poll `lister` every `period` and push the diffs into `events`.
/// Returns when the receiving side hangs up.
pub async fn watch_liveness(
	lister: Arc<dyn NodeLister>,
	initial: HostSet,
	period: Duration,
	events: mpsc::Sender<LivenessEvent>,
) {
	let mut prev = initial;

	loop {
		tokio::select! {
			_ = events.closed() => {
				debug!(message = "Liveness watcher stopping");
				return;
			}
			_ = tokio::time::sleep(period) => {}
		}

		let next = match lister.live_nodes().await {
			Ok(x) => x,
			Err(error) => {
				warn!(message = "Could not poll datanode liveness", ?error);
				continue;
			}
		};

		for event in diff_nodes(&prev, &next) {
			debug!(message = "Liveness change", event = ?event);
			if events.send(event).await.is_err() {
				return;
			}
		}
		prev = next;
	}
}

//
// MARK: Tests
//

#[cfg(test)]
mod tests {
	use super::*;

	fn hosts(names: &[&str]) -> HostSet {
		names.iter().map(|n| (*n).into()).collect()
	}

	#[test]
	fn diff_reports_removals_before_additions() {
		let prev = hosts(&["a", "b", "c"]);
		let next = hosts(&["b", "c", "d"]);

		assert_eq!(
			diff_nodes(&prev, &next),
			vec![
				LivenessEvent::Removed("a".into()),
				LivenessEvent::Added("d".into()),
			]
		);
	}

	#[test]
	fn identical_sets_are_quiet() {
		let prev = hosts(&["a"]);
		assert!(diff_nodes(&prev, &prev.clone()).is_empty());
	}

	struct ScriptedLister {
		polls: std::sync::Mutex<Vec<HostSet>>,
	}

	#[async_trait]
	impl NodeLister for ScriptedLister {
		async fn live_nodes(&self) -> Result<HostSet, LivenessError> {
			let mut polls = self.polls.lock().unwrap();
			if polls.len() > 1 {
				Ok(polls.remove(0))
			} else {
				Ok(polls[0].clone())
			}
		}
	}

	#[tokio::test]
	async fn watcher_emits_crash_events() {
		let lister = Arc::new(ScriptedLister {
			polls: std::sync::Mutex::new(vec![hosts(&["a", "b"]), hosts(&["b"])]),
		});

		let (tx, mut rx) = mpsc::channel(8);
		let handle = tokio::spawn(watch_liveness(
			lister,
			hosts(&["a", "b"]),
			Duration::from_millis(1),
			tx,
		));

		// First poll matches the initial set, second drops `a`.
		let event = rx.recv().await.unwrap();
		assert_eq!(event, LivenessEvent::Removed("a".into()));

		drop(rx);
		handle.await.unwrap();
	}
}
