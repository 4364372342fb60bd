use std::{sync::Arc, time::Duration};
use tokio::{
	io::AsyncReadExt,
	net::{TcpListener, UnixListener},
	sync::mpsc,
};
use tracing::{debug, error, info, warn};

use dish_dfs::liveness::{watch_liveness, HdfsNodeLister, HostSet, LivenessEvent};
use dish_proto::ClusterConfig;
use dish_util::{load_env, LoadedEnv};

use config::DishdConfig;
use connection::WorkerConnection;
use manager::{completion, dispatch, recovery, WorkersManager};

mod config;
mod connection;
mod manager;

#[tokio::main]
async fn main() {
	let config_res = match load_env::<DishdConfig>() {
		Ok(x) => x,
		Err(err) => {
			println!("Error while loading .env: {err}");
			std::process::exit(1);
		}
	};

	let config: Arc<DishdConfig> = Arc::new(config_res.get_config().clone());

	tracing_subscriber::fmt()
		.with_env_filter(config.dishd_loglevel.get_config())
		.without_time()
		.with_ansi(true)
		.init();

	// Do this now, logging wasn't available earlier
	match config_res {
		LoadedEnv::FoundFile { config, path } => {
			debug!(message = "Loaded config from .env", ?path, ?config);
		}
		LoadedEnv::OnlyVars(config) => {
			debug!(
				message = "No `.env` found, loaded config from environment",
				?config
			);
		}
	};

	let discovery = match dish_dfs::client::ReqwestDiscoveryClient::new(&config.dishd_discovery_addr)
	{
		Ok(x) => Arc::new(x),
		Err(error) => {
			error!(message = "Could not initialize discovery client", ?error);
			std::process::exit(1);
		}
	};

	let cluster_path = config.pash_top.join("cluster.json");
	let cluster = match ClusterConfig::load(&cluster_path) {
		Ok(x) => x,
		Err(error) => {
			error!(message = "Could not load cluster config", path = ?cluster_path, ?error);
			std::process::exit(1);
		}
	};

	let mut workers = Vec::new();
	for (name, addr) in &cluster.workers {
		workers.push(Arc::new(
			WorkerConnection::connect(name, &addr.host, addr.port).await,
		));
	}
	if workers.iter().all(|w| !w.is_online()) {
		error!(message = "No configured worker is reachable");
		std::process::exit(1);
	}

	let client_worker = Arc::new(
		WorkerConnection::connect("client_worker", &config.dishd_host, config.dishd_client_port)
			.await,
	);

	let manager = Arc::new(WorkersManager::new(
		config.clone(),
		workers,
		client_worker,
		discovery,
	));

	for worker in manager.all_workers() {
		if !worker.is_online() {
			continue;
		}
		if let Err(error) = worker.send_setup_request(&config).await {
			worker.set_online(false);
			warn!(message = "Setup failed, marking worker offline", worker = %worker.name, ?error);
		}
	}
	info!(message = "All setup requests are sent");

	if config.dishd_ft.is_enabled() {
		start_ft_machinery(&manager, &config).await;
	}

	let code = run_command_loop(manager).await;
	std::process::exit(code);
}

/// The completion listener and the DFS liveness watcher only exist when
/// fault tolerance is on.
async fn start_ft_machinery(manager: &Arc<WorkersManager>, config: &DishdConfig) {
	let listener = match TcpListener::bind(("0.0.0.0", config.dishd_port)).await {
		Ok(x) => x,
		Err(e) => {
			match e.kind() {
				std::io::ErrorKind::AddrInUse => {
					error!(
						message = "Cannot bind completion listener, port already in use",
						port = config.dishd_port
					);
				}
				_ => {
					error!(message = "Could not bind completion listener", err = ?e);
				}
			}
			std::process::exit(1);
		}
	};
	tokio::spawn(completion::run_completion_listener(manager.clone(), listener));

	let lister = match HdfsNodeLister::new(&config.dishd_namenode_addr) {
		Ok(x) => Arc::new(x),
		Err(error) => {
			error!(message = "Could not initialize namenode client", ?error);
			std::process::exit(1);
		}
	};

	let initial: HostSet = manager.workers.iter().map(|w| w.host().into()).collect();
	let (tx, mut rx) = mpsc::channel(16);
	tokio::spawn(watch_liveness(
		lister,
		initial,
		Duration::from_secs(config.dishd_liveness_period),
		tx,
	));

	let m = manager.clone();
	tokio::spawn(async move {
		while let Some(event) = rx.recv().await {
			match event {
				LivenessEvent::Added(addr) => recovery::addr_added(&m, &addr).await,
				LivenessEvent::Removed(addr) => recovery::addr_removed(&m, &addr).await,
			}
		}
	});

	info!(message = "Started DFS liveness daemon");
}

/// Serve the invoking shell until it says `Done`.
///
/// Commands are plain text on a Unix socket: `Exec-Graph: <graph-file>
/// <functions-file>` answered with `OK <main-script-path>`, and `Done`.
async fn run_command_loop(manager: Arc<WorkersManager>) -> i32 {
	let socket_path = manager.config.dspash_socket.clone();
	let _ = std::fs::remove_file(&socket_path);

	let listener = match UnixListener::bind(&socket_path) {
		Ok(x) => x,
		Err(error) => {
			error!(message = "Could not bind command socket", path = ?socket_path, ?error);
			return 1;
		}
	};
	info!(message = "Command socket ready", path = ?socket_path);

	loop {
		let (mut conn, _) = match listener.accept().await {
			Ok(x) => x,
			Err(error) => {
				warn!(message = "Command socket accept failed", ?error);
				continue;
			}
		};

		let mut buf = vec![0u8; 8192];
		let n = match conn.read(&mut buf).await {
			Ok(n) => n,
			Err(error) => {
				warn!(message = "Could not read command", ?error);
				continue;
			}
		};
		let request = String::from_utf8_lossy(&buf[..n]).trim().to_owned();
		info!(message = "Received request", request = %request);

		if request.starts_with("Done") {
			manager.request_quit();
			for worker in manager.all_workers() {
				worker.close().await;
			}
			let _ = std::fs::remove_file(&socket_path);
			info!(message = "Done");
			return 0;
		} else if let Some(args) = request.strip_prefix("Exec-Graph:") {
			// On failure the connection drops without a response and the
			// invoking shell aborts the pipeline.
			if let Err(error) = dispatch::handle_exec_graph(&manager, args, &mut conn).await {
				error!(message = "Dispatch failed", ?error);
			}
		} else {
			error!(message = "Unknown request", request = %request);
			manager.request_quit();
			return 1;
		}
	}
}
