//! One persistent connection to a worker.

use smartstring::{LazyCompact, SmartString};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::{net::TcpStream, sync::Mutex};
use tracing::{debug, warn};

use dish_flow::{Subgraph, SubgraphId};
use dish_proto::{recv_message, send_message, ProtocolError, Request, Response, ShellVars};

use crate::config::DishdConfig;

/// A worker as the manager sees it: an address, a framed TCP stream, an
/// online flag flipped by liveness events, and a load counter.
pub struct WorkerConnection {
	pub name: SmartString<LazyCompact>,
	host: SmartString<LazyCompact>,
	port: u16,

	online: AtomicBool,
	running_processes: AtomicUsize,

	stream: Mutex<Option<TcpStream>>,
}

impl std::fmt::Display for WorkerConnection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "Worker {}:{}", self.host, self.port)
	}
}

impl WorkerConnection {
	/// Connect to a worker. A refused connection yields an offline
	/// record instead of an error; liveness may bring it back later.
	pub async fn connect(name: &str, host: &str, port: u16) -> Self {
		let (stream, online) = match TcpStream::connect((host, port)).await {
			Ok(s) => (Some(s), true),
			Err(error) => {
				warn!(
					message = "Failed to connect to worker",
					name,
					host,
					port,
					?error
				);
				(None, false)
			}
		};

		Self {
			name: name.into(),
			host: host.into(),
			port,
			online: AtomicBool::new(online),
			running_processes: AtomicUsize::new(0),
			stream: Mutex::new(stream),
		}
	}

	/// A record with no socket. For tests that only exercise bookkeeping.
	#[cfg(test)]
	pub fn detached(name: &str, host: &str, port: u16) -> Self {
		Self {
			name: name.into(),
			host: host.into(),
			port,
			online: AtomicBool::new(true),
			running_processes: AtomicUsize::new(0),
			stream: Mutex::new(None),
		}
	}

	pub fn host(&self) -> &str {
		&self.host
	}

	pub fn is_online(&self) -> bool {
		self.online.load(Ordering::Relaxed)
	}

	pub fn set_online(&self, online: bool) {
		self.online.store(online, Ordering::Relaxed);
	}

	pub fn running_processes(&self) -> usize {
		self.running_processes.load(Ordering::Relaxed)
	}

	pub fn add_running_process(&self) {
		self.running_processes.fetch_add(1, Ordering::Relaxed);
	}

	pub fn finish_running_process(&self) {
		let _ = self
			.running_processes
			.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
	}

	//
	// MARK: Requests
	//

	fn not_connected() -> ProtocolError {
		ProtocolError::Io(std::io::Error::new(
			std::io::ErrorKind::NotConnected,
			"worker was never reachable",
		))
	}

	/// Send one request; optionally wait for the acknowledgement frame.
	/// Any failure here is fatal for the connection.
	pub async fn send_request(
		&self,
		request: &Request,
		wait_ack: bool,
	) -> Result<Option<Response>, ProtocolError> {
		let mut guard = self.stream.lock().await;
		let stream = guard.as_mut().ok_or_else(Self::not_connected)?;

		send_message(stream, request).await?;

		if !wait_ack {
			return Ok(None);
		}
		match recv_message::<Response>(stream).await? {
			Some(response) => Ok(Some(response)),
			None => Err(ProtocolError::MissingAck),
		}
	}

	/// Wait for one acknowledgement frame, for requests sent with
	/// `wait_ack = false`.
	pub async fn handle_response(&self) -> Result<Response, ProtocolError> {
		let mut guard = self.stream.lock().await;
		let stream = guard.as_mut().ok_or_else(Self::not_connected)?;

		match recv_message::<Response>(stream).await? {
			Some(response) => Ok(response),
			None => Err(ProtocolError::MissingAck),
		}
	}

	pub async fn send_setup_request(&self, config: &DishdConfig) -> Result<(), ProtocolError> {
		self.send_request(
			&Request::Setup {
				debug: config.dishd_debug,
				pool_size: config.dishd_pool_size,
				ft: config.dishd_ft,
				script_name: config.dishd_script_name.clone(),
				kill_target: config.dishd_kill.as_str().into(),
			},
			true,
		)
		.await?;
		return Ok(());
	}

	pub async fn send_graph_exec_request(
		&self,
		graph: Subgraph,
		shell_variables: Option<ShellVars>,
		functions: String,
		merger_id: SubgraphId,
		worker_timeout: u64,
	) -> Result<(), ProtocolError> {
		let subgraph_id = graph.id;
		self.send_request(
			&Request::ExecGraph {
				graph,
				shell_variables,
				functions,
				merger_id,
				worker_timeout,
			},
			true,
		)
		.await?;

		debug!(
			message = "Worker acknowledged subgraph",
			worker = %self.name,
			subgraph = ?subgraph_id,
		);
		return Ok(());
	}

	pub async fn send_batch_graph_exec_request(
		&self,
		regulars: Vec<Subgraph>,
		mergers: Vec<Subgraph>,
		shell_variables: Option<ShellVars>,
		functions: String,
		merger_id: SubgraphId,
		wait_ack: bool,
	) -> Result<(), ProtocolError> {
		self.send_request(
			&Request::BatchExecGraph {
				regulars,
				mergers,
				shell_variables,
				functions,
				merger_id,
			},
			wait_ack,
		)
		.await?;
		return Ok(());
	}

	pub async fn send_kill_subgraphs_request(
		&self,
		merger_id: SubgraphId,
	) -> Result<(), ProtocolError> {
		self.send_request(&Request::KillSubgraphs { merger_id }, true)
			.await?;
		return Ok(());
	}

	pub async fn send_kill_node_request(&self, kill_delay: u64) -> Result<(), ProtocolError> {
		self.send_request(
			&Request::KillNode {
				kill_target: self.host.clone(),
				kill_delay,
			},
			true,
		)
		.await?;
		return Ok(());
	}

	/// Graceful shutdown: tell the worker we're done and drop the stream.
	pub async fn close(&self) {
		let _ = self.send_request(&Request::Done, false).await;
		*self.stream.lock().await = None;
	}
}
