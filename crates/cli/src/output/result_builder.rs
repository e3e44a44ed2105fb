use std::io::{self, Write};
use std::time::Instant;

use serde::Serialize;

use crate::error::RelayError;
use crate::output::format::OutputFormat;
use crate::output::model::{CommandError, CommandResult, ErrorCode, SCHEMA_VERSION};

/// Builder for constructing command results.
pub struct ResultBuilder<T: Serialize> {
	command: String,
	data: Option<T>,
	error: Option<CommandError>,
	start_time: Instant,
}

impl<T: Serialize> ResultBuilder<T> {
	pub fn new(command: impl Into<String>) -> Self {
		Self {
			command: command.into(),
			data: None,
			error: None,
			start_time: Instant::now(),
		}
	}

	pub fn data(mut self, data: T) -> Self {
		self.data = Some(data);
		self
	}

	pub fn error(mut self, code: ErrorCode, message: impl Into<String>) -> Self {
		self.error = Some(CommandError {
			code,
			message: message.into(),
		});
		self
	}

	pub fn relay_error(mut self, err: &RelayError) -> Self {
		self.error = Some(CommandError::from(err));
		self
	}

	pub fn build(self) -> CommandResult<T> {
		CommandResult {
			schema_version: SCHEMA_VERSION,
			ok: self.error.is_none() && self.data.is_some(),
			command: self.command,
			data: self.data,
			error: self.error,
			duration_ms: Some(self.start_time.elapsed().as_millis() as u64),
		}
	}
}

/// Print a command result to stdout in the specified format.
pub fn print_result<T: Serialize>(result: &CommandResult<T>, format: OutputFormat) {
	match format {
		OutputFormat::Json => {
			if let Ok(json) = serde_json::to_string_pretty(result) {
				println!("{json}");
			}
		}
		OutputFormat::Ndjson => {
			if let Ok(json) = serde_json::to_string(result) {
				println!("{json}");
			}
		}
		OutputFormat::Text => print_result_text(result),
	}
}

fn print_result_text<T: Serialize>(result: &CommandResult<T>) {
	let mut stdout = io::stdout().lock();
	let _ = write_text(&mut stdout, result);
}

fn write_text<T: Serialize>(out: &mut impl Write, result: &CommandResult<T>) -> io::Result<()> {
	if result.ok {
		if let Some(value) = result.data.as_ref().and_then(|data| serde_json::to_value(data).ok()) {
			write_value(out, &value, 0)?;
		}
	} else if let Some(ref error) = result.error {
		writeln!(out, "Error [{}]: {}", error.code, error.message)?;
	}
	Ok(())
}

/// Renders objects as `key: value` lines and arrays as blank-line separated blocks.
fn write_value(out: &mut impl Write, value: &serde_json::Value, indent: usize) -> io::Result<()> {
	use serde_json::Value;

	let pad = "  ".repeat(indent);
	match value {
		Value::Object(map) => {
			for (key, value) in map {
				match value {
					Value::Object(_) | Value::Array(_) => {
						writeln!(out, "{pad}{key}:")?;
						write_value(out, value, indent + 1)?;
					}
					scalar => writeln!(out, "{pad}{key}: {}", scalar_text(scalar))?,
				}
			}
		}
		Value::Array(items) if items.is_empty() => writeln!(out, "{pad}(none)")?,
		Value::Array(items) => {
			for (i, item) in items.iter().enumerate() {
				if i > 0 {
					writeln!(out)?;
				}
				write_value(out, item, indent)?;
			}
		}
		scalar => writeln!(out, "{pad}{}", scalar_text(scalar))?,
	}
	Ok(())
}

fn scalar_text(value: &serde_json::Value) -> String {
	match value {
		serde_json::Value::String(s) => s.clone(),
		serde_json::Value::Null => "-".to_string(),
		other => other.to_string(),
	}
}

/// Print an error to stderr in human-readable format.
pub fn print_error_stderr(error: &CommandError) {
	eprintln!("Error [{}]: {}", error.code, error.message);
}
