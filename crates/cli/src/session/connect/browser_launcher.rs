//! Browser process spawning and readiness polling.

use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use tracing::debug;

use super::browser_finder::resolve_browser_binary;
use crate::error::LaunchError;

const REACHABLE_POLL: Duration = Duration::from_millis(500);

/// Everything needed to start one remote-debugging browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
	pub port: u16,
	pub profile_dir: PathBuf,
	pub headless: bool,
	pub extra_args: Vec<String>,
}

impl LaunchCommand {
	pub fn args(&self) -> Vec<String> {
		let mut args = vec![
			format!("--remote-debugging-port={}", self.port),
			format!("--user-data-dir={}", self.profile_dir.display()),
			"--no-first-run".to_string(),
			"--no-default-browser-check".to_string(),
			"--disable-background-networking".to_string(),
		];
		if self.headless {
			args.push("--headless=new".to_string());
		}
		args.extend(self.extra_args.iter().cloned());
		args.push("about:blank".to_string());
		args
	}
}

/// Starts the OS process for a session.
pub trait ProcessSpawner: Send + Sync {
	fn spawn(&self, command: &LaunchCommand) -> Result<Child, LaunchError>;
}

/// Spawns a Chromium-family browser in its own process group.
#[derive(Debug, Clone, Default)]
pub struct BrowserSpawner {
	pub binary: Option<String>,
}

impl BrowserSpawner {
	pub fn new(binary: Option<String>) -> Self {
		Self { binary }
	}
}

impl ProcessSpawner for BrowserSpawner {
	fn spawn(&self, command: &LaunchCommand) -> Result<Child, LaunchError> {
		let binary = resolve_browser_binary(self.binary.as_deref()).ok_or(LaunchError::BinaryMissing)?;

		let mut cmd = Command::new(&binary);
		cmd.args(command.args()).stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());

		#[cfg(unix)]
		std::os::unix::process::CommandExt::process_group(&mut cmd, 0);

		debug!(target = "relay.launch", binary = %binary, port = command.port, "spawning browser");
		cmd.spawn().map_err(|source| LaunchError::Spawn { binary, source })
	}
}

/// Polls until something accepts connections on `port`.
///
/// Fails early when `child` exits first, or with `NotReachable` after `timeout`.
pub async fn wait_until_reachable(child: &mut Child, port: u16, timeout: Duration) -> Result<(), LaunchError> {
	let started = Instant::now();
	loop {
		if let Ok(Some(status)) = child.try_wait() {
			return Err(LaunchError::ExitedEarly {
				port,
				status: status.to_string(),
			});
		}

		if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
			debug!(target = "relay.launch", port, waited_ms = started.elapsed().as_millis() as u64, "port reachable");
			return Ok(());
		}

		if started.elapsed() >= timeout {
			return Err(LaunchError::NotReachable {
				port,
				waited_ms: timeout.as_millis() as u64,
			});
		}
		tokio::time::sleep(REACHABLE_POLL.min(timeout)).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn command(headless: bool) -> LaunchCommand {
		LaunchCommand {
			port: 9222,
			profile_dir: PathBuf::from("/tmp/relay/profiles/scrape"),
			headless,
			extra_args: vec!["--lang=en".into()],
		}
	}

	#[test]
	fn args_carry_port_profile_and_extras() {
		let args = command(false).args();
		assert_eq!(args[0], "--remote-debugging-port=9222");
		assert_eq!(args[1], "--user-data-dir=/tmp/relay/profiles/scrape");
		assert!(args.contains(&"--lang=en".to_string()));
		assert!(!args.iter().any(|a| a.starts_with("--headless")));
		assert!(command(true).args().contains(&"--headless=new".to_string()));
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn early_exit_is_reported() {
		let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		let port = listener.local_addr().unwrap().port();
		drop(listener);

		let mut child = Command::new("true").spawn().unwrap();
		tokio::time::sleep(Duration::from_millis(100)).await;
		let err = wait_until_reachable(&mut child, port, Duration::from_secs(5)).await.unwrap_err();
		assert!(matches!(err, LaunchError::ExitedEarly { .. }), "{err}");
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn listening_port_is_reachable() {
		let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		let port = listener.local_addr().unwrap().port();
		let mut child = Command::new("sleep").arg("5").spawn().unwrap();

		wait_until_reachable(&mut child, port, Duration::from_secs(2)).await.unwrap();
		let _ = child.kill();
		let _ = child.wait();
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn unreachable_port_times_out() {
		let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
		let port = listener.local_addr().unwrap().port();
		drop(listener);
		let mut child = Command::new("sleep").arg("5").spawn().unwrap();

		let err = wait_until_reachable(&mut child, port, Duration::from_millis(300)).await.unwrap_err();
		assert!(matches!(err, LaunchError::NotReachable { waited_ms: 300, .. }), "{err}");
		let _ = child.kill();
		let _ = child.wait();
	}
}
