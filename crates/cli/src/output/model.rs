use serde::{Deserialize, Serialize};

use crate::error::{LaunchError, RelayError};

/// Current schema version for command output.
pub const SCHEMA_VERSION: u32 = 1;

/// The result envelope returned by every command.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult<T: Serialize> {
	pub schema_version: u32,
	pub ok: bool,
	pub command: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub data: Option<T>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<CommandError>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub duration_ms: Option<u64>,
}

/// Error information for failed commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandError {
	pub code: ErrorCode,
	pub message: String,
}

impl From<&RelayError> for CommandError {
	fn from(err: &RelayError) -> Self {
		Self {
			code: ErrorCode::from(err),
			message: err.to_string(),
		}
	}
}

/// Standardized error codes for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
	BrowserLaunchFailed,
	PortUnavailable,
	AlreadyRunning,
	DriverError,
	GenerationFailed,
	ConfigError,
	IoError,
	InternalError,
}

impl From<&RelayError> for ErrorCode {
	fn from(err: &RelayError) -> Self {
		match err {
			RelayError::Launch(LaunchError::Allocation(_)) => ErrorCode::PortUnavailable,
			RelayError::Launch(LaunchError::AlreadyRunning { .. }) | RelayError::InstanceRunning { .. } => ErrorCode::AlreadyRunning,
			RelayError::Launch(_) => ErrorCode::BrowserLaunchFailed,
			RelayError::Driver(_) | RelayError::InvalidTransition { .. } => ErrorCode::DriverError,
			RelayError::Generation(_) => ErrorCode::GenerationFailed,
			RelayError::Config(_) | RelayError::ConfigRead { .. } => ErrorCode::ConfigError,
			RelayError::Io(_) | RelayError::Process(_) => ErrorCode::IoError,
			RelayError::Json(_) | RelayError::Anyhow(_) => ErrorCode::InternalError,
		}
	}
}

impl std::fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ErrorCode::BrowserLaunchFailed => write!(f, "BROWSER_LAUNCH_FAILED"),
			ErrorCode::PortUnavailable => write!(f, "PORT_UNAVAILABLE"),
			ErrorCode::AlreadyRunning => write!(f, "ALREADY_RUNNING"),
			ErrorCode::DriverError => write!(f, "DRIVER_ERROR"),
			ErrorCode::GenerationFailed => write!(f, "GENERATION_FAILED"),
			ErrorCode::ConfigError => write!(f, "CONFIG_ERROR"),
			ErrorCode::IoError => write!(f, "IO_ERROR"),
			ErrorCode::InternalError => write!(f, "INTERNAL_ERROR"),
		}
	}
}
