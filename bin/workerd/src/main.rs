use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use config::WorkerdConfig;
use dish_util::{load_env, LoadedEnv};

mod config;
mod connection;
mod executor;
mod hooks;

#[tokio::main]
async fn main() {
	let config_res = match load_env::<WorkerdConfig>() {
		Ok(x) => x,
		Err(err) => {
			println!("Error while loading .env: {err}");
			std::process::exit(1);
		}
	};

	let config: Arc<WorkerdConfig> = Arc::new(config_res.get_config().clone());

	tracing_subscriber::fmt()
		.with_env_filter(config.workerd_loglevel.get_config())
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

	let listener = match TcpListener::bind(("0.0.0.0", config.workerd_port)).await {
		Ok(x) => x,
		Err(e) => {
			match e.kind() {
				std::io::ErrorKind::AddrInUse => {
					error!(
						message = "Cannot bind to port, already in use",
						port = config.workerd_port
					);
				}
				_ => {
					error!(message = "Could not bind worker listener", err = ?e);
				}
			}
			std::process::exit(1);
		}
	};

	match listener.local_addr() {
		Ok(x) => info!(message = "Worker running", addr = %x),
		Err(error) => {
			error!(message = "Could not determine local address", ?error);
			std::process::exit(1);
		}
	}

	loop {
		let (stream, addr) = match listener.accept().await {
			Ok(x) => x,
			Err(error) => {
				warn!(message = "Accept failed", ?error);
				continue;
			}
		};

		debug!(message = "Got new connection", ?addr);
		tokio::spawn(connection::manage_connection(config.clone(), stream, addr));
	}
}
