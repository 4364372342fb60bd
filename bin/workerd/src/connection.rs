//! The per-connection command loop.

use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{io::AsyncReadExt, net::TcpStream};
use tracing::{debug, error, info, warn};

use dish_flow::SubgraphId;
use dish_proto::{recv_message, send_message, Request, Response};

use crate::{
	config::{WorkerdConfig, DEBUG_WAIT_SECS},
	executor::{exec_graph, RunningGraph, SetupInfo},
};

pub async fn manage_connection(config: Arc<WorkerdConfig>, mut stream: TcpStream, addr: SocketAddr) {
	info!(message = "Connected", ?addr);

	let mut setup = SetupInfo::default();
	let mut running: Vec<RunningGraph> = Vec::new();

	loop {
		let request = match recv_message::<Request>(&mut stream).await {
			Ok(Some(r)) => r,
			Ok(None) => break,
			Err(error) => {
				// Protocol violations are fatal at connection level; the
				// coordinator sees the drop and marks us offline.
				error!(message = "Protocol violation, dropping connection", ?addr, ?error);
				break;
			}
		};

		let response = match request {
			Request::Setup {
				debug: debug_setting,
				pool_size,
				ft,
				script_name,
				kill_target,
			} => {
				debug!(message = "Setup received", debug = debug_setting, pool_size, ?ft);
				setup = SetupInfo {
					debug: debug_setting,
					pool_size,
					ft,
					script_name,
					kill_target,
				};
				Response::ok()
			}

			Request::ExecGraph {
				graph,
				shell_variables,
				functions,
				merger_id,
				worker_timeout,
			} => {
				if worker_timeout > 0 {
					tokio::time::sleep(Duration::from_secs(worker_timeout)).await;
				}

				match exec_graph(&config, &setup, graph, shell_variables, &functions, merger_id)
					.await
				{
					Ok(rg) => {
						running.push(rg);
						Response::ok()
					}
					Err(error) => {
						error!(message = "Could not execute subgraph", ?error);
						Response::error(error.to_string())
					}
				}
			}

			Request::BatchExecGraph {
				regulars,
				mergers,
				shell_variables,
				functions,
				merger_id,
			} => {
				let mut response = Response::ok();
				for graph in regulars.into_iter().chain(mergers) {
					match exec_graph(
						&config,
						&setup,
						graph,
						shell_variables.clone(),
						&functions,
						merger_id,
					)
					.await
					{
						Ok(rg) => running.push(rg),
						Err(error) => {
							error!(message = "Could not execute subgraph in batch", ?error);
							response = Response::error(error.to_string());
							break;
						}
					}
				}
				response
			}

			Request::KillSubgraphs { merger_id } => {
				// A kill may name a region this worker never received
				// any subgraph of; that is a no-op.
				let mut killed = 0;
				for rg in running.iter_mut() {
					if merger_id == SubgraphId::ALL || rg.merger_id == merger_id {
						let _ = rg.child.start_kill();
						killed += 1;
					}
				}
				info!(message = "Killed subgraphs", merger = ?merger_id, killed);
				Response::ok()
			}

			Request::KillNode {
				kill_target,
				kill_delay,
			} => {
				warn!(
					message = "Kill node requested, scheduling exit",
					target = %kill_target,
					delay = kill_delay,
				);
				tokio::spawn(async move {
					tokio::time::sleep(Duration::from_secs(kill_delay)).await;
					std::process::exit(1);
				});
				Response::ok()
			}

			Request::Done => {
				info!(message = "Received done signal, closing connection");
				break;
			}
		};

		if let Err(error) = send_message(&mut stream, &response).await {
			error!(message = "Could not send response", ?addr, ?error);
			break;
		}
	}

	// Make sure subprocesses have finished and release their resources
	// before the connection goes away.
	for rg in running {
		drain(rg).await;
	}
	info!(message = "Connection ended", ?addr);
}

/// Wait one subgraph out. Debug runs get a bounded wait and their
/// stderr logged; everything else just gets reaped.
async fn drain(mut rg: RunningGraph) {
	if !rg.debug {
		let _ = rg.child.wait().await;
		return;
	}

	let stderr = rg.child.stderr.take();
	let reader = tokio::spawn(async move {
		let mut text = String::new();
		if let Some(mut stderr) = stderr {
			let _ = stderr.read_to_string(&mut text).await;
		}
		text
	});

	let status = match tokio::time::timeout(
		Duration::from_secs(DEBUG_WAIT_SECS),
		rg.child.wait(),
	)
	.await
	{
		Ok(result) => result.ok(),
		Err(_) => {
			warn!(message = "Subgraph timed out in debug wait, killing it");
			let _ = rg.child.start_kill();
			rg.child.wait().await.ok()
		}
	};

	let stderr_text = reader.await.unwrap_or_default();
	debug!(
		message = "Subgraph finished",
		merger = ?rg.merger_id,
		returncode = ?status.and_then(|s| s.code()),
		stderr = %stderr_text,
	);
}
