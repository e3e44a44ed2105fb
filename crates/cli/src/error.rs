//! Error types shared across the orchestration layer.

use std::path::PathBuf;

use relay_runtime::{AllocationError, ProcessError};
use thiserror::Error;

use crate::session::SessionState;

#[derive(Debug, Error)]
pub enum RelayError {
	#[error("Configuration error: {0}")]
	Config(String),

	#[error("Failed to read {path}: {source}")]
	ConfigRead {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error(transparent)]
	Launch(#[from] LaunchError),

	#[error("Driver error: {0}")]
	Driver(String),

	#[error("Invalid session transition {from:?} -> {to:?}")]
	InvalidTransition { from: SessionState, to: SessionState },

	#[error("Another relay instance is running (pid {pid})")]
	InstanceRunning { pid: u32 },

	#[error(transparent)]
	Process(#[from] ProcessError),

	#[error(transparent)]
	Generation(#[from] GenerationError),

	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),

	#[error(transparent)]
	Anyhow(#[from] anyhow::Error),
}

/// Reasons a browser session could not be brought to `Ready`.
#[derive(Debug, Error)]
pub enum LaunchError {
	#[error(transparent)]
	Allocation(#[from] AllocationError),

	#[error("Could not find a Chrome/Chromium executable; set browser.binary in the config")]
	BinaryMissing,

	#[error("Failed to launch browser at {binary}: {source}")]
	Spawn {
		binary: String,
		#[source]
		source: std::io::Error,
	},

	#[error("Browser exited before port {port} became reachable ({status})")]
	ExitedEarly { port: u16, status: String },

	#[error("Port {port} not reachable within {waited_ms}ms")]
	NotReachable { port: u16, waited_ms: u64 },

	#[error("Session for owner '{owner}' is already running (pid {pid:?})")]
	AlreadyRunning { owner: String, pid: Option<u32> },

	#[error("Failed to attach driver on port {port}: {message}")]
	Attach { port: u16, message: String },
}

/// Failure reported by the text-generation collaborator.
#[derive(Debug, Error)]
pub enum GenerationError {
	#[error("Generation request failed: {0}")]
	Request(#[from] reqwest::Error),

	#[error("Generation service returned status {status}: {message}")]
	Status { status: u16, message: String },

	#[error("Generation response had no content")]
	Empty,

	#[error("Missing API key (env var {0})")]
	MissingApiKey(String),

	#[error("{0}")]
	Other(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;
