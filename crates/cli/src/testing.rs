//! Test doubles shared by the session and workflow tests.

use std::collections::VecDeque;
use std::net::TcpListener;
use std::process::{Child, Command};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use relay_runtime::PortAllocator;
use serde_json::Value;
use tempfile::TempDir;

use crate::error::{LaunchError, RelayError, Result};
use crate::session::connect::{LaunchCommand, ProcessSpawner};
use crate::session::{DriverConnector, LifecycleOptions, RemoteDriver, SessionLifecycleManager, SessionRegistry};
use crate::storage::JsonStateStore;

/// Starts a stand-in browser and holds a listener on the requested port so it reads as reachable.
#[derive(Default)]
pub struct SleepSpawner {
	listeners: Mutex<Vec<TcpListener>>,
	exit_immediately: bool,
}

impl SleepSpawner {
	/// Spawns `true`, which exits before its port ever opens.
	pub fn exiting() -> Self {
		Self {
			exit_immediately: true,
			..Self::default()
		}
	}
}

impl ProcessSpawner for SleepSpawner {
	fn spawn(&self, command: &LaunchCommand) -> std::result::Result<Child, LaunchError> {
		let program = if self.exit_immediately { "true" } else { "sh" };
		let spawn_error = |source| LaunchError::Spawn {
			binary: program.into(),
			source,
		};
		if self.exit_immediately {
			return Command::new(program).spawn().map_err(spawn_error);
		}
		let listener = TcpListener::bind(("127.0.0.1", command.port)).map_err(spawn_error)?;
		self.listeners.lock().push(listener);
		browser_command(&command.args()).spawn().map_err(spawn_error)
	}
}

/// Shared knobs and counters behind every [`FakeDriver`] a connector hands out.
#[derive(Default)]
pub struct DriverProbe {
	pub closes: AtomicUsize,
	pub navigations: Mutex<Vec<String>>,
	pub stops: AtomicUsize,
	/// Number of upcoming `navigate` calls that fail.
	pub failing_navigations: AtomicUsize,
	pub evaluate_results: Mutex<VecDeque<Value>>,
}

pub struct FakeDriver {
	probe: Arc<DriverProbe>,
	url: String,
}

#[async_trait]
impl RemoteDriver for FakeDriver {
	async fn navigate(&mut self, url: &str) -> Result<()> {
		let fail = self
			.probe
			.failing_navigations
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
			.is_ok();
		if fail {
			return Err(RelayError::Driver(format!("navigation to {url} failed")));
		}
		self.probe.navigations.lock().push(url.to_string());
		self.url = url.to_string();
		Ok(())
	}

	async fn current_url(&mut self) -> Result<String> {
		Ok(self.url.clone())
	}

	async fn evaluate(&mut self, _expression: &str) -> Result<Value> {
		Ok(self.probe.evaluate_results.lock().pop_front().unwrap_or(Value::Null))
	}

	async fn stop_loading(&mut self) -> Result<()> {
		self.probe.stops.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}

	async fn close(&mut self) -> Result<()> {
		self.probe.closes.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}
}

impl FakeDriver {
	pub fn new(probe: Arc<DriverProbe>) -> Self {
		Self {
			probe,
			url: "about:blank".into(),
		}
	}
}

#[derive(Default)]
pub struct FakeConnector {
	pub probe: Arc<DriverProbe>,
	pub fail: AtomicBool,
	pub attaches: AtomicUsize,
}

#[async_trait]
impl DriverConnector for FakeConnector {
	async fn attach(&self, port: u16) -> Result<Box<dyn RemoteDriver>> {
		if self.fail.load(Ordering::SeqCst) {
			return Err(RelayError::Driver(format!("no page target on port {port}")));
		}
		self.attaches.fetch_add(1, Ordering::SeqCst);
		Ok(Box::new(FakeDriver::new(Arc::clone(&self.probe))))
	}
}

/// A lifecycle manager over fakes, rooted in a temp dir.
pub struct Harness {
	pub temp: TempDir,
	pub manager: Arc<SessionLifecycleManager>,
	pub connector: Arc<FakeConnector>,
}

pub fn harness(spawner: SleepSpawner) -> Harness {
	let temp = TempDir::new().unwrap();
	let options = LifecycleOptions {
		profiles_dir: temp.path().join("profiles"),
		headless: true,
		extra_args: Vec::new(),
		ready_timeout: Duration::from_secs(2),
		settle: Duration::ZERO,
		terminate_grace: Duration::from_secs(1),
		close_timeout: Duration::from_millis(200),
	};
	let connector = Arc::new(FakeConnector::default());
	let registry = SessionRegistry::new(Arc::new(JsonStateStore::in_memory()));
	let manager = SessionLifecycleManager::new(options, PortAllocator::new(), registry, connector.clone(), Arc::new(spawner));
	Harness {
		temp,
		manager: Arc::new(manager),
		connector,
	}
}

/// A shell that sleeps while its command line carries browser flags.
///
/// The trailing `:` keeps the shell from exec-ing into `sleep`, so the pid
/// keeps these arguments.
fn browser_command(args: &[String]) -> Command {
	let mut cmd = Command::new("sh");
	cmd.args(["-c", "sleep 30; :", "relay-browser"]).args(args);
	cmd
}

/// A stand-in browser started outside the lifecycle manager.
pub fn fake_browser(port: u16) -> Child {
	browser_command(&[format!("--remote-debugging-port={port}")]).spawn().unwrap()
}

pub fn free_port() -> u16 {
	TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

pub fn dead_pid() -> u32 {
	let mut child = Command::new("true").spawn().unwrap();
	let pid = child.id();
	child.wait().unwrap();
	pid
}
