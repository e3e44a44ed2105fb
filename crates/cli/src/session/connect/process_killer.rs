//! Browser process termination.

use std::time::Duration;

use relay_runtime::{Termination, TreeTermination, terminate_tree};
use tracing::{debug, info};

use crate::error::{RelayError, Result};

/// Terminates the browser rooted at `pid` and all of its helpers.
///
/// Runs the blocking signal/poll loop off the async executor.
pub async fn kill_browser_tree(pid: u32, grace: Duration) -> Result<TreeTermination> {
	let outcome = tokio::task::spawn_blocking(move || terminate_tree(pid, grace))
		.await
		.map_err(|err| RelayError::Anyhow(anyhow::anyhow!("termination task failed: {err}")))??;

	match outcome.root {
		Termination::AlreadyGone => debug!(target = "relay.process", pid, "browser already gone"),
		root => info!(target = "relay.process", pid, ?root, helpers = outcome.descendants.len(), "browser terminated"),
	}
	Ok(outcome)
}

#[cfg(all(test, unix))]
mod tests {
	use std::process::Command;

	use super::*;

	#[tokio::test]
	async fn terminates_running_process() {
		let mut child = Command::new("sleep").arg("30").spawn().unwrap();
		let outcome = kill_browser_tree(child.id(), Duration::from_secs(2)).await.unwrap();
		assert_ne!(outcome.root, Termination::AlreadyGone);
		let _ = child.wait();
	}

	#[tokio::test]
	async fn missing_process_is_already_gone() {
		let mut child = Command::new("true").spawn().unwrap();
		let pid = child.id();
		child.wait().unwrap();

		let outcome = kill_browser_tree(pid, Duration::from_millis(100)).await.unwrap();
		assert_eq!(outcome.root, Termination::AlreadyGone);
	}
}
