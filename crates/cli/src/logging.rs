//! Tracing subscriber setup for the `relay` binary.

use tracing_subscriber::EnvFilter;

/// Installs the global fmt subscriber.
///
/// Writes to stderr; stdout is reserved for command results. `verbosity`
/// maps `0 -> warn`, `1 -> info`, `2+ -> debug` for relay targets;
/// `RUST_LOG` takes precedence when set.
pub fn init_logging(verbosity: u8) {
	let level = match verbosity {
		0 => "warn",
		1 => "info",
		_ => "debug",
	};
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

	let _ = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(true)
		.with_writer(std::io::stderr)
		.try_init();
}

fn default_directives(level: &str) -> String {
	format!("relay={level},relay_cli={level},relay_runtime={level},reqwest=warn,tungstenite=warn")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn directives_scope_level_to_relay_targets() {
		let directives = default_directives("debug");
		assert!(directives.starts_with("relay=debug"));
		assert!(directives.contains("tungstenite=warn"));
		assert!(EnvFilter::try_new(directives).is_ok());
	}
}
