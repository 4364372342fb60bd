use std::{fmt::Display, str::FromStr};

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
pub enum LogLevel {
	Trace,
	Debug,
	Info,
	Warn,
	Error,
}

impl Default for LogLevel {
	fn default() -> Self {
		Self::Info
	}
}

impl Display for LogLevel {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Trace => write!(f, "trace"),
			Self::Debug => write!(f, "debug"),
			Self::Info => write!(f, "info"),
			Self::Warn => write!(f, "warn"),
			Self::Error => write!(f, "error"),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub enum LoggingPreset {
	Default,
	Verbose,
	Develop,
	Trace,
}

impl Default for LoggingPreset {
	fn default() -> Self {
		return Self::Default;
	}
}

impl LoggingPreset {
	pub fn get_config(&self) -> LoggingConfig {
		match self {
			Self::Default => LoggingConfig {
				other: LogLevel::Warn,
				http: LogLevel::Warn,

				manager: LogLevel::Info,
				worker: LogLevel::Info,
				flow: LogLevel::Warn,
				dfs: LogLevel::Info,
			},

			Self::Verbose => LoggingConfig {
				other: LogLevel::Warn,
				http: LogLevel::Warn,

				manager: LogLevel::Debug,
				worker: LogLevel::Debug,
				flow: LogLevel::Info,
				dfs: LogLevel::Debug,
			},

			Self::Develop => LoggingConfig {
				other: LogLevel::Debug,
				http: LogLevel::Warn,

				manager: LogLevel::Trace,
				worker: LogLevel::Trace,
				flow: LogLevel::Debug,
				dfs: LogLevel::Debug,
			},

			Self::Trace => LoggingConfig {
				other: LogLevel::Trace,
				http: LogLevel::Warn,

				manager: LogLevel::Trace,
				worker: LogLevel::Trace,
				flow: LogLevel::Trace,
				dfs: LogLevel::Trace,
			},
		}
	}
}

pub struct LoggingConfig {
	other: LogLevel,
	http: LogLevel,

	manager: LogLevel,
	worker: LogLevel,
	flow: LogLevel,
	dfs: LogLevel,
}

impl Into<EnvFilter> for LoggingConfig {
	fn into(self) -> EnvFilter {
		EnvFilter::from_str(
			&[
				//
				// Non-configurable sources
				//
				format!("hyper={}", LogLevel::Warn),
				format!("rustls={}", LogLevel::Warn),
				//
				// Configurable sources
				//
				format!("reqwest={}", self.http),
				// Coordinator
				format!("dishd={}", self.manager),
				// Worker
				format!("workerd={}", self.worker),
				// Libraries
				format!("dish_flow={}", self.flow),
				format!("dish_proto={}", self.flow),
				format!("dish_dfs={}", self.dfs),
				self.other.to_string(),
			]
			.join(","),
		)
		.unwrap()
	}
}
