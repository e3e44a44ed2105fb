//! Launch and teardown of browser-driven automation sessions.
//!
//! One manager serves every owner; an [`OwnerProfile`] carries what differs
//! between them. A launch is rejected while the same owner has a launch in
//! flight or a live registered session. Rows whose pid is dead are stale and
//! are cleared before launching.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Child;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use relay_runtime::{PortAllocator, Termination, pid_is_alive};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::connect::{LaunchCommand, ProcessSpawner, kill_browser_tree, resolve_profile_dir, wait_until_reachable};
use super::driver::{DriverConnector, RemoteDriver};
use super::record::SessionRecord;
use super::registry::SessionRegistry;
use super::state::SessionState;
use crate::config::{RelayConfig, WorkflowConfig};
use crate::error::{LaunchError, RelayError, Result};

/// Per-owner launch parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerProfile {
	pub owner: String,
	pub preferred_port: u16,
}

impl OwnerProfile {
	pub fn new(owner: impl Into<String>, preferred_port: u16) -> Self {
		Self {
			owner: owner.into(),
			preferred_port,
		}
	}
}

impl From<&WorkflowConfig> for OwnerProfile {
	fn from(config: &WorkflowConfig) -> Self {
		Self::new(config.owner.clone(), config.preferred_port)
	}
}

#[derive(Debug, Clone)]
pub struct LifecycleOptions {
	pub profiles_dir: PathBuf,
	pub headless: bool,
	pub extra_args: Vec<String>,
	pub ready_timeout: Duration,
	/// Pause after the port opens, before attaching.
	pub settle: Duration,
	pub terminate_grace: Duration,
	pub close_timeout: Duration,
}

impl LifecycleOptions {
	pub fn from_config(config: &RelayConfig) -> Self {
		let browser = &config.browser;
		Self {
			profiles_dir: config.profiles_dir(),
			headless: browser.headless,
			extra_args: browser.extra_args.clone(),
			ready_timeout: Duration::from_millis(browser.ready_timeout_ms),
			settle: Duration::from_millis(browser.settle_ms),
			terminate_grace: Duration::from_millis(browser.terminate_grace_ms),
			close_timeout: Duration::from_millis(browser.close_timeout_ms),
		}
	}
}

/// A launched browser plus the driver attached to it.
pub struct AutomationSession {
	record: SessionRecord,
	state: SessionState,
	driver: Option<Box<dyn RemoteDriver>>,
	child: Option<Child>,
}

impl std::fmt::Debug for AutomationSession {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AutomationSession")
			.field("record", &self.record)
			.field("state", &self.state)
			.field("attached", &self.driver.is_some())
			.finish()
	}
}

impl AutomationSession {
	pub fn record(&self) -> &SessionRecord {
		&self.record
	}

	pub fn state(&self) -> SessionState {
		self.state
	}

	pub fn transition(&mut self, next: SessionState) -> Result<()> {
		if !self.state.can_transition_to(next) {
			return Err(RelayError::InvalidTransition { from: self.state, to: next });
		}
		debug!(target = "relay.session", owner = %self.record.owner, from = ?self.state, to = ?next, "session transition");
		self.state = next;
		Ok(())
	}

	pub fn mark_busy(&mut self) -> Result<()> {
		self.transition(SessionState::Busy)
	}

	pub fn mark_ready(&mut self) -> Result<()> {
		self.transition(SessionState::Ready)
	}

	/// The attached driver; only available while the session is live.
	pub fn driver(&mut self) -> Result<&mut dyn RemoteDriver> {
		if !self.state.is_live() {
			return Err(RelayError::Driver(format!("session for '{}' is {:?}", self.record.owner, self.state)));
		}
		self.driver
			.as_deref_mut()
			.map(|driver| driver as &mut dyn RemoteDriver)
			.ok_or_else(|| RelayError::Driver(format!("no driver attached for '{}'", self.record.owner)))
	}
}

/// Counts from [`SessionLifecycleManager::shutdown_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
	pub terminated: usize,
	pub already_gone: usize,
	pub failed: usize,
}

/// Counts from [`SessionLifecycleManager::reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
	pub stale_rows: usize,
	pub orphans_terminated: usize,
}

pub struct SessionLifecycleManager {
	options: LifecycleOptions,
	allocator: PortAllocator,
	registry: SessionRegistry,
	connector: Arc<dyn DriverConnector>,
	spawner: Arc<dyn ProcessSpawner>,
	in_flight: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for SessionLifecycleManager {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SessionLifecycleManager")
			.field("options", &self.options)
			.field("in_flight", &*self.in_flight.lock())
			.finish_non_exhaustive()
	}
}

/// Marks an owner as launching until dropped.
struct LaunchSlot<'a> {
	in_flight: &'a Mutex<HashSet<String>>,
	owner: String,
}

impl Drop for LaunchSlot<'_> {
	fn drop(&mut self) {
		self.in_flight.lock().remove(&self.owner);
	}
}

impl SessionLifecycleManager {
	pub fn new(
		options: LifecycleOptions,
		allocator: PortAllocator,
		registry: SessionRegistry,
		connector: Arc<dyn DriverConnector>,
		spawner: Arc<dyn ProcessSpawner>,
	) -> Self {
		Self {
			options,
			allocator,
			registry,
			connector,
			spawner,
			in_flight: Mutex::new(HashSet::new()),
		}
	}

	pub fn registry(&self) -> &SessionRegistry {
		&self.registry
	}

	/// Spawns a browser for `profile`, waits for its port, registers it, and attaches a driver.
	pub async fn launch(&self, profile: &OwnerProfile) -> Result<AutomationSession> {
		let _slot = self.claim(&profile.owner)?;
		self.clear_stale_rows(&profile.owner)?;

		let mut state = SessionState::Unlaunched;
		state = advance(state, SessionState::Launching)?;

		let port = self.allocator.allocate(profile.preferred_port).map_err(LaunchError::from)?;
		if port != profile.preferred_port {
			info!(target = "relay.session", owner = %profile.owner, preferred = profile.preferred_port, port, "preferred port busy; using fallback");
		}
		let profile_dir = resolve_profile_dir(&self.options.profiles_dir, &profile.owner)?;

		let command = LaunchCommand {
			port,
			profile_dir: profile_dir.clone(),
			headless: self.options.headless,
			extra_args: self.options.extra_args.clone(),
		};
		let mut child = self.spawner.spawn(&command)?;
		let pid = child.id();
		info!(target = "relay.session", owner = %profile.owner, pid, port, "browser spawned");

		if let Err(err) = wait_until_reachable(&mut child, port, self.options.ready_timeout).await {
			warn!(target = "relay.session", owner = %profile.owner, pid, port, error = %err, "browser never became reachable");
			self.kill_child(&mut child).await;
			return Err(err.into());
		}
		if !self.options.settle.is_zero() {
			tokio::time::sleep(self.options.settle).await;
		}

		let record = SessionRecord::new(profile.owner.clone(), pid, port, Some(profile_dir));
		if let Err(err) = self.registry.register(&record) {
			self.kill_child(&mut child).await;
			return Err(err);
		}

		let mut session = AutomationSession {
			record,
			state,
			driver: None,
			child: Some(child),
		};

		match self.connector.attach(port).await {
			Ok(driver) => session.driver = Some(driver),
			Err(err) => {
				warn!(target = "relay.session", owner = %profile.owner, port, error = %err, "driver attach failed; tearing down");
				if let Err(teardown_err) = self.teardown(&mut session).await {
					warn!(target = "relay.session", owner = %profile.owner, error = %teardown_err, "teardown after failed attach also failed");
				}
				return Err(LaunchError::Attach {
					port,
					message: err.to_string(),
				}
				.into());
			}
		}

		session.transition(SessionState::Ready)?;
		info!(target = "relay.session", owner = %profile.owner, pid, port, "session ready");
		Ok(session)
	}

	/// Closes the driver, kills the process tree, and unregisters. Safe to repeat.
	pub async fn teardown(&self, session: &mut AutomationSession) -> Result<()> {
		match session.state {
			SessionState::Gone => return Ok(()),
			SessionState::Terminating => {}
			_ => session.transition(SessionState::Terminating)?,
		}

		if let Some(mut driver) = session.driver.take() {
			match tokio::time::timeout(self.options.close_timeout, driver.close()).await {
				Ok(Ok(())) => debug!(target = "relay.session", owner = %session.record.owner, "driver closed"),
				Ok(Err(err)) => debug!(target = "relay.session", owner = %session.record.owner, error = %err, "driver close failed"),
				Err(_) => debug!(target = "relay.session", owner = %session.record.owner, "driver close timed out"),
			}
		}

		kill_browser_tree(session.record.pid, self.options.terminate_grace).await?;
		if let Some(mut child) = session.child.take() {
			let _ = child.try_wait();
		}

		self.registry.unregister(&session.record)?;
		session.transition(SessionState::Gone)?;
		info!(target = "relay.session", owner = %session.record.owner, pid = session.record.pid, "session torn down");
		Ok(())
	}

	/// Tears down a registry row that has no driver, e.g. one left by a crashed run.
	///
	/// A pid that now runs something other than this row's browser is left alone.
	pub async fn teardown_record(&self, record: &SessionRecord) -> Result<Termination> {
		if !record.is_alive() {
			if pid_is_alive(record.pid) {
				warn!(target = "relay.session", owner = %record.owner, pid = record.pid, port = record.port, "pid reused by another process; dropping row only");
			}
			self.registry.unregister(record)?;
			return Ok(Termination::AlreadyGone);
		}
		let outcome = kill_browser_tree(record.pid, self.options.terminate_grace).await?;
		self.registry.unregister(record)?;
		Ok(outcome.root)
	}

	/// Tears down every registered session, including ones this process did not start.
	pub async fn shutdown_all(&self) -> Result<ShutdownReport> {
		let mut report = ShutdownReport::default();
		for record in self.registry.list_all()? {
			match self.teardown_record(&record).await {
				Ok(Termination::AlreadyGone) => report.already_gone += 1,
				Ok(_) => report.terminated += 1,
				Err(err) => {
					warn!(target = "relay.session", owner = %record.owner, pid = record.pid, error = %err, "failed to tear down session");
					report.failed += 1;
				}
			}
		}
		info!(
			target = "relay.session",
			terminated = report.terminated,
			already_gone = report.already_gone,
			failed = report.failed,
			"all sessions shut down"
		);
		Ok(report)
	}

	/// Startup pass: drops stale rows and kills live orphaned browsers.
	///
	/// A row is stale when its pid is dead or no longer runs its browser.
	///
	/// Only meaningful while no other relay instance owns the registry.
	pub async fn reconcile(&self) -> Result<ReconcileReport> {
		let mut report = ReconcileReport::default();
		for record in self.registry.list_all()? {
			if record.is_alive() {
				warn!(target = "relay.session", owner = %record.owner, pid = record.pid, port = record.port, "terminating orphaned browser");
				self.teardown_record(&record).await?;
				report.orphans_terminated += 1;
			} else {
				self.registry.unregister(&record)?;
				report.stale_rows += 1;
			}
		}
		if report != ReconcileReport::default() {
			info!(target = "relay.session", stale_rows = report.stale_rows, orphans = report.orphans_terminated, "registry reconciled");
		}
		Ok(report)
	}

	fn claim(&self, owner: &str) -> Result<LaunchSlot<'_>> {
		if !self.in_flight.lock().insert(owner.to_string()) {
			return Err(LaunchError::AlreadyRunning {
				owner: owner.to_string(),
				pid: None,
			}
			.into());
		}
		Ok(LaunchSlot {
			in_flight: &self.in_flight,
			owner: owner.to_string(),
		})
	}

	fn clear_stale_rows(&self, owner: &str) -> Result<()> {
		for record in self.registry.find_by_owner(owner)? {
			if record.is_alive() {
				return Err(LaunchError::AlreadyRunning {
					owner: owner.to_string(),
					pid: Some(record.pid),
				}
				.into());
			}
			warn!(target = "relay.session", owner, pid = record.pid, port = record.port, "clearing stale session row");
			self.registry.unregister(&record)?;
		}
		Ok(())
	}

	async fn kill_child(&self, child: &mut Child) {
		if let Err(err) = kill_browser_tree(child.id(), self.options.terminate_grace).await {
			warn!(target = "relay.session", pid = child.id(), error = %err, "failed to kill browser");
		}
		let _ = child.try_wait();
	}
}

fn advance(from: SessionState, to: SessionState) -> Result<SessionState> {
	if from.can_transition_to(to) { Ok(to) } else { Err(RelayError::InvalidTransition { from, to }) }
}

#[cfg(all(test, unix))]
mod tests {
	use std::process::Command;
	use std::sync::atomic::Ordering;

	use super::*;
	use crate::testing::{SleepSpawner, dead_pid, fake_browser, free_port, harness};

	#[tokio::test]
	async fn launch_then_teardown_round_trips_registry() {
		let h = harness(SleepSpawner::default());
		let profile = OwnerProfile::new("scrape", free_port());

		let mut session = h.manager.launch(&profile).await.unwrap();
		assert_eq!(session.state(), SessionState::Ready);
		let pid = session.record().pid;
		assert!(pid_is_alive(pid));
		assert_eq!(h.manager.registry().find_by_owner("scrape").unwrap().len(), 1);
		assert!(session.record().profile_dir.as_ref().is_some_and(|dir| dir.ends_with("scrape")));

		h.manager.teardown(&mut session).await.unwrap();
		assert_eq!(session.state(), SessionState::Gone);
		assert!(!pid_is_alive(pid));
		assert!(h.manager.registry().list_all().unwrap().is_empty());
		assert_eq!(h.connector.probe.closes.load(Ordering::SeqCst), 1);

		h.manager.teardown(&mut session).await.unwrap();
		assert_eq!(h.connector.probe.closes.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn concurrent_launch_for_same_owner_is_rejected() {
		let h = harness(SleepSpawner::default());
		let profile = OwnerProfile::new("post", free_port());

		let (first, second) = tokio::join!(h.manager.launch(&profile), h.manager.launch(&profile));
		let (mut winner, loser) = match (first, second) {
			(Ok(session), Err(err)) | (Err(err), Ok(session)) => (session, err),
			other => panic!("expected exactly one launch to succeed: {other:?}"),
		};
		assert!(matches!(loser, RelayError::Launch(LaunchError::AlreadyRunning { .. })), "{loser}");

		let again = h.manager.launch(&profile).await.unwrap_err();
		assert!(
			matches!(&again, RelayError::Launch(LaunchError::AlreadyRunning { pid: Some(pid), .. }) if *pid == winner.record().pid),
			"{again}"
		);
		assert_eq!(h.manager.registry().list_all().unwrap().len(), 1);

		h.manager.teardown(&mut winner).await.unwrap();
	}

	#[tokio::test]
	async fn dead_row_for_owner_does_not_block_launch() {
		let h = harness(SleepSpawner::default());
		let port = free_port();
		h.manager.registry().register(&SessionRecord::new("scrape", dead_pid(), port, None)).unwrap();

		let mut session = h.manager.launch(&OwnerProfile::new("scrape", port)).await.unwrap();
		let rows = h.manager.registry().find_by_owner("scrape").unwrap();
		assert_eq!(rows.len(), 1);
		assert_eq!(rows[0].pid, session.record().pid);

		h.manager.teardown(&mut session).await.unwrap();
	}

	#[tokio::test]
	async fn attach_failure_tears_the_browser_down() {
		let h = harness(SleepSpawner::default());
		h.connector.fail.store(true, Ordering::SeqCst);

		let err = h.manager.launch(&OwnerProfile::new("scrape", free_port())).await.unwrap_err();
		assert!(matches!(err, RelayError::Launch(LaunchError::Attach { .. })), "{err}");
		assert!(h.manager.registry().list_all().unwrap().is_empty());

		h.connector.fail.store(false, Ordering::SeqCst);
		let mut session = h.manager.launch(&OwnerProfile::new("scrape", free_port())).await.unwrap();
		h.manager.teardown(&mut session).await.unwrap();
	}

	#[tokio::test]
	async fn early_exit_is_a_launch_error_without_registration() {
		let h = harness(SleepSpawner::exiting());

		let err = h.manager.launch(&OwnerProfile::new("scrape", free_port())).await.unwrap_err();
		assert!(matches!(err, RelayError::Launch(LaunchError::ExitedEarly { .. })), "{err}");
		assert!(h.manager.registry().list_all().unwrap().is_empty());
	}

	#[tokio::test]
	async fn shutdown_all_covers_sessions_started_elsewhere() {
		let h = harness(SleepSpawner::default());
		let mut foreign = fake_browser(9333);
		h.manager.registry().register(&SessionRecord::new("post", foreign.id(), 9333, None)).unwrap();
		h.manager.registry().register(&SessionRecord::new("scrape", dead_pid(), 9222, None)).unwrap();

		let report = h.manager.shutdown_all().await.unwrap();
		let _ = foreign.wait();

		assert_eq!(report.terminated, 1);
		assert_eq!(report.already_gone, 1);
		assert!(h.manager.registry().list_all().unwrap().is_empty());
	}

	#[tokio::test]
	async fn reconcile_separates_stale_rows_from_orphans() {
		let h = harness(SleepSpawner::default());
		let mut orphan = fake_browser(9333);
		h.manager.registry().register(&SessionRecord::new("post", orphan.id(), 9333, None)).unwrap();
		h.manager.registry().register(&SessionRecord::new("scrape", dead_pid(), 9222, None)).unwrap();

		let report = h.manager.reconcile().await.unwrap();
		let _ = orphan.wait();

		assert_eq!(report, ReconcileReport { stale_rows: 1, orphans_terminated: 1 });
		assert!(h.manager.registry().list_all().unwrap().is_empty());
	}

	#[tokio::test]
	async fn reconcile_leaves_a_reused_pid_running() {
		let h = harness(SleepSpawner::default());
		let mut unrelated = Command::new("sleep").arg("30").spawn().unwrap();
		h.manager.registry().register(&SessionRecord::new("scrape", unrelated.id(), 9222, None)).unwrap();

		let report = h.manager.reconcile().await.unwrap();
		let still_running = pid_is_alive(unrelated.id());
		let _ = unrelated.kill();
		let _ = unrelated.wait();

		assert_eq!(report, ReconcileReport { stale_rows: 1, orphans_terminated: 0 });
		assert!(still_running);
		assert!(h.manager.registry().list_all().unwrap().is_empty());
	}

	#[tokio::test]
	async fn shutdown_all_drops_rows_whose_pid_was_reused() {
		let h = harness(SleepSpawner::default());
		let mut unrelated = Command::new("sleep").arg("30").spawn().unwrap();
		h.manager.registry().register(&SessionRecord::new("post", unrelated.id(), 9333, None)).unwrap();

		let report = h.manager.shutdown_all().await.unwrap();
		let still_running = pid_is_alive(unrelated.id());
		let _ = unrelated.kill();
		let _ = unrelated.wait();

		assert_eq!(report.already_gone, 1);
		assert!(still_running);
		assert!(h.manager.registry().list_all().unwrap().is_empty());
	}

	#[tokio::test]
	async fn busy_session_cannot_skip_to_gone() {
		let h = harness(SleepSpawner::default());
		let mut session = h.manager.launch(&OwnerProfile::new("scrape", free_port())).await.unwrap();

		session.mark_busy().unwrap();
		assert!(matches!(session.transition(SessionState::Gone), Err(RelayError::InvalidTransition { .. })));
		assert!(session.mark_busy().is_err());
		assert!(session.driver().is_ok());

		h.manager.teardown(&mut session).await.unwrap();
		assert!(session.driver().is_err());
	}
}
