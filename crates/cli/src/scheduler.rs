//! Polling scheduler for owner-tagged one-shot jobs.
//!
//! Jobs fire once; a recurring workflow re-arms itself from inside its
//! callback. The scheduler is a cheap handle passed to every workflow.
//! Dispatched jobs are tracked so shutdown can wait for them to finish.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;

type Callback = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct ScheduledJob {
	owner: String,
	fire_at: SystemTime,
	callback: Callback,
}

struct Inner {
	jobs: Mutex<Vec<ScheduledJob>>,
	dispatched: Mutex<Vec<JoinHandle<()>>>,
	poll_interval: Duration,
	error_backoff: Duration,
	stopped: AtomicBool,
	wake: Notify,
}

#[derive(Clone)]
pub struct Scheduler {
	inner: Arc<Inner>,
}

impl std::fmt::Debug for Scheduler {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Scheduler")
			.field("pending", &self.inner.jobs.lock().len())
			.field("poll_interval", &self.inner.poll_interval)
			.finish()
	}
}

impl Scheduler {
	pub fn new(config: &SchedulerConfig) -> Self {
		Self::with_intervals(config.poll_interval(), config.error_backoff())
	}

	pub fn with_intervals(poll_interval: Duration, error_backoff: Duration) -> Self {
		Self {
			inner: Arc::new(Inner {
				jobs: Mutex::new(Vec::new()),
				dispatched: Mutex::new(Vec::new()),
				poll_interval,
				error_backoff,
				stopped: AtomicBool::new(false),
				wake: Notify::new(),
			}),
		}
	}

	/// Stores a job that runs `callback` once `fire_at` has passed.
	///
	/// Call [`Scheduler::clear`] first to keep a single pending job per owner.
	pub fn arm<F, Fut>(&self, owner: impl Into<String>, fire_at: SystemTime, callback: F)
	where
		F: FnOnce() -> Fut + Send + 'static,
		Fut: Future<Output = ()> + Send + 'static,
	{
		let owner = owner.into();
		debug!(target = "relay.scheduler", owner = %owner, in_secs = secs_until(fire_at), "job armed");
		self.inner.jobs.lock().push(ScheduledJob {
			owner,
			fire_at,
			callback: Box::new(move || Box::pin(callback())),
		});
	}

	/// Removes every pending job for `owner` and returns how many were dropped.
	pub fn clear(&self, owner: &str) -> usize {
		let mut jobs = self.inner.jobs.lock();
		let before = jobs.len();
		jobs.retain(|job| job.owner != owner);
		let removed = before - jobs.len();
		if removed > 0 {
			info!(target = "relay.scheduler", owner, removed, "pending jobs cleared");
		}
		removed
	}

	pub fn pending(&self, owner: &str) -> usize {
		self.inner.jobs.lock().iter().filter(|job| job.owner == owner).count()
	}

	/// Earliest pending fire time for `owner`.
	pub fn next_fire(&self, owner: &str) -> Option<SystemTime> {
		self.inner.jobs.lock().iter().filter(|job| job.owner == owner).map(|job| job.fire_at).min()
	}

	/// Dispatches every due job on its own task and returns how many fired.
	///
	/// Due jobs are removed under the same lock that selects them, so racing
	/// scans cannot fire a job twice. Must be called inside a Tokio runtime.
	pub fn tick(&self) -> usize {
		let now = SystemTime::now();
		let due: Vec<ScheduledJob> = {
			let mut jobs = self.inner.jobs.lock();
			let (due, pending): (Vec<_>, Vec<_>) = jobs.drain(..).partition(|job| job.fire_at <= now);
			*jobs = pending;
			due
		};

		let fired = due.len();
		let mut dispatched = self.inner.dispatched.lock();
		dispatched.retain(|handle| !handle.is_finished());
		for job in due {
			info!(target = "relay.scheduler", owner = %job.owner, "dispatching scheduled job");
			dispatched.push(tokio::spawn((job.callback)()));
		}
		fired
	}

	/// Number of dispatched jobs that have not finished yet.
	pub fn in_flight(&self) -> usize {
		self.inner.dispatched.lock().iter().filter(|handle| !handle.is_finished()).count()
	}

	/// Spawns the polling loop; it runs until [`Scheduler::shutdown`].
	pub fn spawn(&self) -> JoinHandle<()> {
		let scheduler = self.clone();
		tokio::spawn(async move { scheduler.run().await })
	}

	pub async fn run(&self) {
		info!(target = "relay.scheduler", poll_ms = self.inner.poll_interval.as_millis() as u64, "scheduler started");
		while !self.inner.stopped.load(Ordering::SeqCst) {
			let delay = match std::panic::catch_unwind(AssertUnwindSafe(|| self.tick())) {
				Ok(_) => self.inner.poll_interval,
				Err(panic) => {
					error!(
						target = "relay.scheduler",
						error = %panic_message(panic.as_ref()),
						backoff_ms = self.inner.error_backoff.as_millis() as u64,
						"scheduler scan failed; backing off"
					);
					self.inner.error_backoff
				}
			};

			tokio::select! {
				_ = tokio::time::sleep(delay) => {}
				_ = self.inner.wake.notified() => {}
			}
		}
		info!(target = "relay.scheduler", "scheduler stopped");
	}

	/// Stops the loop after its current sleep is interrupted.
	///
	/// Jobs already dispatched keep running; see [`Scheduler::drain`].
	pub fn shutdown(&self) {
		self.inner.stopped.store(true, Ordering::SeqCst);
		self.inner.wake.notify_waiters();
	}

	/// Waits up to `within` for dispatched jobs, then aborts the rest.
	///
	/// Returns how many jobs had to be aborted.
	pub async fn drain(&self, within: Duration) -> usize {
		let handles = std::mem::take(&mut *self.inner.dispatched.lock());
		let running = handles.iter().filter(|handle| !handle.is_finished()).count();
		if running > 0 {
			info!(target = "relay.scheduler", running, "waiting for dispatched jobs");
		}

		let deadline = tokio::time::Instant::now() + within;
		let mut aborted = 0;
		for mut handle in handles {
			match tokio::time::timeout_at(deadline, &mut handle).await {
				Ok(Ok(())) => {}
				Ok(Err(err)) => warn!(target = "relay.scheduler", error = %err, "dispatched job ended abnormally"),
				Err(_) => {
					handle.abort();
					aborted += 1;
				}
			}
		}
		if aborted > 0 {
			warn!(target = "relay.scheduler", aborted, "dispatched jobs aborted after drain timeout");
		}
		aborted
	}
}

fn secs_until(at: SystemTime) -> u64 {
	at.duration_since(SystemTime::now()).map(|d| d.as_secs()).unwrap_or(0)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
	panic
		.downcast_ref::<&str>()
		.map(|s| s.to_string())
		.or_else(|| panic.downcast_ref::<String>().cloned())
		.unwrap_or_else(|| "unknown panic".to_string())
}
