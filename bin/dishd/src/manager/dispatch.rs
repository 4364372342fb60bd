//! Pipeline dispatch.
//!
//! One `Exec-Graph` command on the command socket turns into: split the
//! pipeline, splice remote pipes, split the main graph, record the FT
//! bookkeeping, hand the reader script back to the caller, and ship
//! every subgraph to its worker.

use std::sync::Arc;
use tokio::{io::AsyncWriteExt, net::UnixStream};
use tracing::{debug, info, warn};

use dish_flow::{
	emit::to_shell,
	remote::{insert_remote_pipes, split_main_graph, RewriteOutput},
	split::split_graph,
	SubgraphId,
};
use dish_proto::{FtMode, IrFile};
use dish_util::tmp::write_tmp_file;

use crate::manager::{group_by_worker, kill, DispatchError, WorkersManager};

/// Handle `Exec-Graph: <graph-file> <functions-file>`.
///
/// Holds the reschedule lock for the whole protocol so recovery never
/// observes half-recorded bookkeeping.
pub async fn handle_exec_graph(
	manager: &Arc<WorkersManager>,
	args: &str,
	conn: &mut UnixStream,
) -> Result<(), DispatchError> {
	let mut parts = args.split_whitespace();
	let (Some(graph_file), Some(functions_file)) = (parts.next(), parts.next()) else {
		return Err(DispatchError::BadCommand(args.into()));
	};

	let mut state_guard = manager.state.lock().await;
	let st = &mut *state_guard;

	let ir: IrFile = serde_json::from_str(&std::fs::read_to_string(graph_file)?)?;
	let mut gen = ir.graph.file_id_gen();

	let split = split_graph(&ir.graph, &mut st.subgraph_ids)?;
	debug!(message = "Split pipeline", subgraphs = split.subgraphs.len());

	let RewriteOutput {
		main_graph,
		worker_subgraphs,
		mut uuid_to_graphs,
	} = insert_remote_pipes(
		split.subgraphs,
		&split.edge_map,
		&mut gen,
		&manager.ports,
		&manager.config.dishd_host,
		&mut st.subgraph_ids,
		|fids| match manager.get_worker(fids) {
			Ok(worker) => {
				worker.add_running_process();
				Some(worker)
			}
			Err(_) => None,
		},
	)?;

	let (reader, writers) = split_main_graph(main_graph, &mut uuid_to_graphs, &mut st.subgraph_ids)?;
	debug!(message = "Split main graph", writers = writers.len());

	let mut pairs = worker_subgraphs;
	for writer in writers {
		manager.client_worker.add_running_process();
		pairs.push((manager.client_worker.clone(), writer));
	}

	kill::log_node_ip(manager, &pairs)?;
	if !manager.config.dishd_kill.is_empty() && !manager.kill_node_req_sent() {
		kill::handle_kill(manager, &pairs).await?;
	}

	let script = to_shell(&reader.graph, &manager.config.pash_tmp_prefix)?;
	let script_path = write_tmp_file(&manager.config.pash_tmp_prefix, "dish_main", &script)?;
	info!(message = "Master node graph stored", path = ?script_path);

	let functions = std::fs::read_to_string(functions_file)?;

	let ft = manager.config.dishd_ft;
	let mut merger_id = SubgraphId::ALL;
	if ft.is_enabled() {
		merger_id = pairs
			.iter()
			.find(|(_, s)| s.merger)
			.map(|(_, s)| s.id)
			.ok_or(DispatchError::NoMerger)?;

		st.all_worker_subgraph_pairs
			.extend(pairs.iter().map(|(w, s)| (w.clone(), s.clone())));
		st.all_merger_to_shell_vars
			.insert(merger_id, Some(ir.shell_variables.clone()));
		st.all_merger_to_declared_functions
			.insert(merger_id, functions.clone());
		for (uuid, graphs) in &uuid_to_graphs {
			st.all_uuid_to_graphs.insert(*uuid, *graphs);
			st.all_graph_to_uuid.entry(graphs.0).or_default().push(*uuid);
		}
		st.all_merger_to_subgraph
			.insert(merger_id, pairs.iter().map(|(_, s)| s.id).collect());
		for (_, s) in &pairs {
			st.all_subgraph_to_merger.insert(s.id, merger_id);
		}
		debug!(
			message = "Fault-tolerance bookkeeping recorded",
			merger = ?merger_id,
			placements = pairs.len(),
		);
	}

	// Report the reader script to the invoking shell before dispatching;
	// it starts consuming while subgraphs are still being shipped.
	conn.write_all(format!("OK {}", script_path.display()).as_bytes())
		.await?;

	let shell_vars = Some(ir.shell_variables);

	if ft == FtMode::Optimized {
		let mut pending = Vec::new();
		for (_, (worker, regulars, mergers)) in group_by_worker(&pairs) {
			if let Err(error) = worker
				.send_batch_graph_exec_request(
					regulars,
					mergers,
					shell_vars.clone(),
					functions.clone(),
					merger_id,
					false,
				)
				.await
			{
				worker.set_online(false);
				warn!(message = "Worker failed during batch dispatch", worker = %worker.name, ?error);
				return Err(error.into());
			}
			pending.push(worker);
		}

		for worker in pending {
			if let Err(error) = worker.handle_response().await {
				worker.set_online(false);
				warn!(message = "Worker did not acknowledge batch", worker = %worker.name, ?error);
				return Err(error.into());
			}
		}
	} else {
		for (worker, subgraph) in &pairs {
			if !worker.is_online() {
				continue;
			}
			if let Err(error) = worker
				.send_graph_exec_request(
					subgraph.clone(),
					shell_vars.clone(),
					functions.clone(),
					merger_id,
					manager.config.dishd_worker_timeout,
				)
				.await
			{
				worker.set_online(false);
				warn!(message = "Worker failed during dispatch", worker = %worker.name, ?error);
				return Err(error.into());
			}
			debug!(
				message = "Sent subgraph",
				subgraph = ?subgraph.id,
				worker = %worker.name,
			);
		}
	}

	info!(message = "Sent all graph exec requests");
	return Ok(());
}

//
// MARK: Tests
//

#[cfg(test)]
mod tests {
	use super::*;
	use async_trait::async_trait;
	use std::sync::Arc;
	use tokio::io::AsyncReadExt;
	use uuid::Uuid;

	use dish_dfs::client::{DiscoveryClient, DiscoveryRequestError};
	use dish_flow::{DataflowGraph, FileId, FileIdGen, Node, NodeKind, Resource};

	use crate::{config::test_config, connection::WorkerConnection};

	struct NoDiscovery;

	#[async_trait]
	impl DiscoveryClient for NoDiscovery {
		async fn find_persisted_optimized(
			&self,
			_uuids: &[Uuid],
			_addr: &str,
		) -> Result<Vec<usize>, DiscoveryRequestError> {
			Ok(vec![])
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
	fn fan_out_graph() -> DataflowGraph {
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

	#[tokio::test]
	async fn dispatch_records_bookkeeping_and_reports_the_reader_script() {
		let mut config = test_config();
		let base = std::env::temp_dir().join(format!("dishd_dispatch_{}", std::process::id()));
		config.dish_top = base.join("dish");
		config.pash_tmp_prefix = base.join("tmp");
		std::fs::create_dir_all(&config.dish_top).unwrap();
		std::fs::create_dir_all(&config.pash_tmp_prefix).unwrap();
		let config = Arc::new(config);

		let workers = vec![
			Arc::new(WorkerConnection::detached("w0", "a", 65432)),
			Arc::new(WorkerConnection::detached("w1", "b", 65432)),
		];
		let client = Arc::new(WorkerConnection::detached("client_worker", "localhost", 65432));
		let manager = Arc::new(WorkersManager::new(
			config.clone(),
			workers,
			client,
			Arc::new(NoDiscovery),
		));

		let ir = dish_proto::IrFile {
			graph: fan_out_graph(),
			shell_variables: Default::default(),
		};
		let graph_file = config.pash_tmp_prefix.join("ir.json");
		std::fs::write(&graph_file, serde_json::to_string(&ir).unwrap()).unwrap();
		let functions_file = config.pash_tmp_prefix.join("funcs.sh");
		std::fs::write(&functions_file, "f() { cat; }\n").unwrap();

		let (mut ours, mut theirs) = tokio::net::UnixStream::pair().unwrap();
		let args = format!(" {} {}", graph_file.display(), functions_file.display());

		// Detached workers have no sockets, so the send phase fails —
		// after the response and the bookkeeping are already in place.
		let result = handle_exec_graph(&manager, &args, &mut ours).await;
		assert!(result.is_err());
		drop(ours);

		let mut response = String::new();
		theirs.read_to_string(&mut response).await.unwrap();
		assert!(response.starts_with("OK "));

		// The reader script drains worker outputs into the local paths.
		let script_path = response.trim_start_matches("OK ").trim().to_owned();
		let script = std::fs::read_to_string(script_path).unwrap();
		assert!(script.contains("dish_read"));
		assert!(script.contains("/tmp/out.txt"));

		let state = manager.state.lock().await;

		// Four worker subgraphs plus the writer feeding the file input.
		assert_eq!(state.all_worker_subgraph_pairs.len(), 5);
		assert_eq!(state.all_merger_to_subgraph.len(), 1);

		let merger_id = *state.all_merger_to_subgraph.keys().next().unwrap();
		assert_eq!(state.all_merger_to_subgraph[&merger_id].len(), 5);
		assert_eq!(state.all_subgraph_to_merger.len(), 5);

		// Every placement still owes all of its streams.
		assert_eq!(state.all_graph_to_uuid.len(), 5);
		assert!(state.all_graph_to_uuid.values().all(|v| !v.is_empty()));

		// Load was charged once per placement.
		let total: usize = manager
			.all_workers()
			.map(|w| w.running_processes())
			.sum();
		assert_eq!(total, 5);

		assert!(config.witness_path().exists());
	}
}
