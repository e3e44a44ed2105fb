use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::{SiteDriver, Target};
use crate::config::WorkflowConfig;
use crate::lock::{AdvisoryLock, LockGuard};
use crate::queue::{WorkItem, WorkQueue};
use crate::retry::{RetryOutcome, RetryPolicy, RetryableUnit, UnitError, run_with_retry};
use crate::scheduler::Scheduler;
use crate::session::{AutomationSession, OwnerProfile, SessionLifecycleManager, SessionState};

/// Shared collaborators every workflow runs against.
#[derive(Clone)]
pub struct WorkflowContext {
	pub lifecycle: Arc<SessionLifecycleManager>,
	pub lock: AdvisoryLock,
	pub policy: RetryPolicy,
	/// Generation queue; `None` disables forwarding.
	pub queue: Option<WorkQueue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "reason")]
pub enum RunStatus {
	Completed,
	/// Postponed because a conflicting workflow reported busy.
	Deferred(String),
	/// Nothing could be done, e.g. the session never launched.
	Failed(String),
	/// Another run for the same owner was still in progress.
	Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
	pub owner: String,
	pub status: RunStatus,
	pub completed: usize,
	pub abandoned: usize,
	/// Items forwarded to the generation queue.
	pub produced: usize,
}

impl RunReport {
	fn new(owner: &str, status: RunStatus) -> Self {
		Self {
			owner: owner.to_string(),
			status,
			completed: 0,
			abandoned: 0,
			produced: 0,
		}
	}
}

pub struct Workflow {
	config: WorkflowConfig,
	profile: OwnerProfile,
	site: Arc<dyn SiteDriver>,
	ctx: WorkflowContext,
	running: AtomicBool,
}

impl std::fmt::Debug for Workflow {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Workflow").field("owner", &self.config.owner).finish_non_exhaustive()
	}
}

/// Clears the running flag when a run ends, however it ends.
struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
	fn drop(&mut self) {
		self.0.store(false, Ordering::SeqCst);
	}
}

impl Workflow {
	pub fn new(config: WorkflowConfig, site: Arc<dyn SiteDriver>, ctx: WorkflowContext) -> Self {
		let profile = OwnerProfile::from(&config);
		Self {
			config,
			profile,
			site,
			ctx,
			running: AtomicBool::new(false),
		}
	}

	pub fn owner(&self) -> &str {
		&self.config.owner
	}

	/// Performs one full run and reports what happened. Never fails outright.
	pub async fn run_once(&self) -> RunReport {
		let owner = self.owner();
		if self.running.swap(true, Ordering::SeqCst) {
			warn!(target = "relay.workflow", owner, "previous run still in progress; skipping");
			return RunReport::new(owner, RunStatus::Skipped);
		}
		let _running = RunningFlag(&self.running);

		if let Some(tag) = self.conflicting_tag() {
			info!(target = "relay.workflow", owner, tag = %tag, "conflicting work reported busy; deferring");
			return RunReport::new(owner, RunStatus::Deferred(format!("{tag} busy")));
		}

		let _guard = self.acquire_lock();
		info!(target = "relay.workflow", owner, "run started");

		let mut slot = SessionSlot {
			lifecycle: Arc::clone(&self.ctx.lifecycle),
			profile: self.profile.clone(),
			home_url: self.site.home_url().to_string(),
			session: None,
		};
		let report = self.run_with_session(&mut slot).await;
		slot.close().await;

		info!(
			target = "relay.workflow",
			owner,
			status = ?report.status,
			completed = report.completed,
			abandoned = report.abandoned,
			produced = report.produced,
			"run finished"
		);
		report
	}

	async fn run_with_session(&self, slot: &mut SessionSlot) -> RunReport {
		let owner = self.owner();

		if let RetryOutcome::Abandoned { last_error, .. } = run_with_retry(&self.ctx.policy, &mut LaunchUnit { slot: &mut *slot }).await {
			error!(target = "relay.workflow", owner, error = %last_error, "session could not be launched");
			return RunReport::new(owner, RunStatus::Failed(format!("launch: {last_error}")));
		}

		let mut plan = PlanUnit {
			slot: &mut *slot,
			site: self.site.as_ref(),
		};
		let targets = match run_with_retry(&self.ctx.policy, &mut plan).await {
			RetryOutcome::Completed { value, .. } => value,
			RetryOutcome::Abandoned { last_error, .. } => {
				error!(target = "relay.workflow", owner, error = %last_error, "planning failed");
				return RunReport::new(owner, RunStatus::Failed(format!("plan: {last_error}")));
			}
		};

		let mut report = RunReport::new(owner, RunStatus::Completed);
		let mut produced: Vec<WorkItem> = Vec::new();
		for target in &targets {
			let mut unit = TargetUnit {
				slot: &mut *slot,
				site: self.site.as_ref(),
				target,
			};
			match run_with_retry(&self.ctx.policy, &mut unit).await {
				RetryOutcome::Completed { value, .. } => {
					report.completed += 1;
					produced.extend(value);
				}
				RetryOutcome::Abandoned { attempts, last_error } => {
					warn!(target = "relay.workflow", owner, target_id = %target.id, attempts, error = %last_error, "target abandoned");
					report.abandoned += 1;
				}
			}
		}

		report.produced = self.forward(produced);
		report
	}

	fn forward(&self, items: Vec<WorkItem>) -> usize {
		if items.is_empty() || !self.config.generate {
			return 0;
		}
		let Some(queue) = &self.ctx.queue else {
			debug!(target = "relay.workflow", owner = self.owner(), items = items.len(), "no generation queue; dropping items");
			return 0;
		};
		match queue.enqueue_bulk(items) {
			Ok(added) => added,
			Err(err) => {
				error!(target = "relay.workflow", owner = self.owner(), error = %err, "failed to enqueue items");
				0
			}
		}
	}

	fn conflicting_tag(&self) -> Option<String> {
		self.config.defer_while.iter().find_map(|tag| match self.ctx.lock.is_busy(tag) {
			Ok(true) => Some(tag.clone()),
			Ok(false) => None,
			Err(err) => {
				warn!(target = "relay.workflow", owner = self.owner(), tag = %tag, error = %err, "could not read lock");
				None
			}
		})
	}

	/// Takes this workflow's busy flag. Busy or unreadable flags are logged and the run proceeds.
	fn acquire_lock(&self) -> Option<LockGuard> {
		let tag = &self.config.lock_tag;
		if tag.is_empty() {
			return None;
		}
		match self.ctx.lock.hold(tag) {
			Ok(Some(guard)) => Some(guard),
			Ok(None) => {
				info!(target = "relay.workflow", owner = self.owner(), tag = %tag, "flag already set by another run; proceeding");
				None
			}
			Err(err) => {
				warn!(target = "relay.workflow", owner = self.owner(), tag = %tag, error = %err, "failed to set flag; proceeding");
				None
			}
		}
	}

	/// Arms the next run at `fire_at`; each run re-arms itself afterwards.
	pub fn arm_recurring(self: Arc<Self>, scheduler: &Scheduler, fire_at: SystemTime) {
		let owner = self.config.owner.clone();
		scheduler.clear(&owner);

		let next = scheduler.clone();
		scheduler.arm(owner, fire_at, move || async move {
			let report = self.run_once().await;
			let delay = match report.status {
				RunStatus::Deferred(_) => self.config.defer_delay(),
				_ => self.config.interval(),
			};
			debug!(target = "relay.workflow", owner = self.owner(), in_secs = delay.as_secs(), "re-arming");
			let workflow = Arc::clone(&self);
			workflow.arm_recurring(&next, SystemTime::now() + delay);
		});
	}
}

/// The session a run works through, relaunched on heavy recovery.
struct SessionSlot {
	lifecycle: Arc<SessionLifecycleManager>,
	profile: OwnerProfile,
	home_url: String,
	session: Option<AutomationSession>,
}

impl SessionSlot {
	/// A live session, launching one if needed and resetting one left busy.
	async fn live(&mut self) -> Result<&mut AutomationSession, UnitError> {
		let live = self.session.as_ref().is_some_and(|session| session.state().is_live());
		if !live {
			self.discard().await;
			let session = self.lifecycle.launch(&self.profile).await?;
			self.session = Some(session);
		} else if self.session.as_ref().is_some_and(|session| session.state() == SessionState::Busy) {
			self.reset_in_place().await?;
		}
		self.session.as_mut().ok_or_else(|| UnitError::transient("session unavailable"))
	}

	/// Stops loading, then navigates away and back home.
	async fn reset_in_place(&mut self) -> Result<(), UnitError> {
		let home = self.home_url.clone();
		let session = self
			.session
			.as_mut()
			.filter(|session| session.state().is_live())
			.ok_or_else(|| UnitError::transient("no live session to reset"))?;

		let driver = session.driver()?;
		if let Err(err) = driver.stop_loading().await {
			debug!(target = "relay.workflow", error = %err, "stop loading failed during reset");
		}
		driver.navigate("about:blank").await?;
		driver.navigate(&home).await?;

		if session.state() == SessionState::Busy {
			session.mark_ready()?;
		}
		Ok(())
	}

	async fn relaunch(&mut self) -> Result<(), UnitError> {
		self.discard().await;
		let session = self.lifecycle.launch(&self.profile).await?;
		self.session = Some(session);
		Ok(())
	}

	async fn discard(&mut self) {
		if let Some(mut session) = self.session.take() {
			if let Err(err) = self.lifecycle.teardown(&mut session).await {
				warn!(target = "relay.workflow", owner = %self.profile.owner, error = %err, "teardown failed");
			}
		}
	}

	async fn close(&mut self) {
		self.discard().await;
	}
}

struct LaunchUnit<'a> {
	slot: &'a mut SessionSlot,
}

#[async_trait]
impl RetryableUnit for LaunchUnit<'_> {
	type Output = ();

	fn label(&self) -> String {
		format!("{}:launch", self.slot.profile.owner)
	}

	async fn attempt(&mut self) -> Result<(), UnitError> {
		self.slot.live().await.map(|_| ())
	}

	async fn recover(&mut self) -> Result<(), UnitError> {
		self.slot.discard().await;
		Ok(())
	}
}

struct PlanUnit<'a> {
	slot: &'a mut SessionSlot,
	site: &'a dyn SiteDriver,
}

#[async_trait]
impl RetryableUnit for PlanUnit<'_> {
	type Output = Vec<Target>;

	fn label(&self) -> String {
		format!("{}:plan", self.slot.profile.owner)
	}

	async fn attempt(&mut self) -> Result<Vec<Target>, UnitError> {
		let session = self.slot.live().await?;
		session.mark_busy()?;
		let targets = self.site.plan(session.driver()?).await?;
		session.mark_ready()?;
		Ok(targets)
	}

	async fn reset(&mut self) -> Result<(), UnitError> {
		self.slot.reset_in_place().await
	}

	async fn recover(&mut self) -> Result<(), UnitError> {
		self.slot.relaunch().await
	}
}

struct TargetUnit<'a> {
	slot: &'a mut SessionSlot,
	site: &'a dyn SiteDriver,
	target: &'a Target,
}

#[async_trait]
impl RetryableUnit for TargetUnit<'_> {
	type Output = Vec<WorkItem>;

	fn label(&self) -> String {
		format!("{}:{}", self.slot.profile.owner, self.target.id)
	}

	async fn attempt(&mut self) -> Result<Vec<WorkItem>, UnitError> {
		let session = self.slot.live().await?;
		session.mark_busy()?;
		let items = self.site.process(session.driver()?, self.target).await?;
		session.mark_ready()?;
		Ok(items)
	}

	async fn reset(&mut self) -> Result<(), UnitError> {
		self.slot.reset_in_place().await
	}

	async fn recover(&mut self) -> Result<(), UnitError> {
		self.slot.relaunch().await
	}
}
