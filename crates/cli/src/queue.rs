//! Single-consumer background queue for content generation.
//!
//! Producers enqueue [`WorkItem`]s; one worker task calls the generation
//! collaborator for each, persists successful output, and reports progress
//! after every item. Failed items are dropped, never requeued.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::Result;
use crate::generator::Generator;
use crate::storage::ContentStore;

/// A request to derive content for one harvested item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
	pub target: String,
	pub title: String,
	#[serde(default)]
	pub category: String,
}

/// Snapshot passed to the progress callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
	pub processed: usize,
	pub total: usize,
	pub generated: usize,
	pub failed: usize,
	/// Item the worker just finished, if any.
	pub current: Option<WorkItem>,
}

type ProgressCallback = Arc<dyn Fn(&Progress) + Send + Sync>;

#[derive(Default)]
struct Counters {
	processed: usize,
	generated: usize,
	failed: usize,
	current: Option<WorkItem>,
}

struct Inner {
	items: Mutex<VecDeque<WorkItem>>,
	counters: Mutex<Counters>,
	callback: Mutex<Option<ProgressCallback>>,
	worker: Mutex<Option<JoinHandle<()>>>,
	/// Stop flag of the current worker; each worker gets a fresh one.
	stop: Mutex<Arc<AtomicBool>>,
	wake: Notify,
	generator: Arc<dyn Generator>,
	content: Arc<dyn ContentStore>,
	idle_poll: Duration,
	item_pause: Duration,
}

#[derive(Clone)]
pub struct WorkQueue {
	inner: Arc<Inner>,
}

impl std::fmt::Debug for WorkQueue {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("WorkQueue").field("queued", &self.inner.items.lock().len()).finish_non_exhaustive()
	}
}

impl WorkQueue {
	pub fn new(generator: Arc<dyn Generator>, content: Arc<dyn ContentStore>, config: &QueueConfig) -> Self {
		Self {
			inner: Arc::new(Inner {
				items: Mutex::new(VecDeque::new()),
				counters: Mutex::new(Counters::default()),
				callback: Mutex::new(None),
				worker: Mutex::new(None),
				stop: Mutex::new(Arc::new(AtomicBool::new(false))),
				wake: Notify::new(),
				generator,
				content,
				idle_poll: Duration::from_millis(config.idle_poll_ms.max(1)),
				item_pause: Duration::from_millis(config.item_pause_ms),
			}),
		}
	}

	pub fn set_progress_callback(&self, callback: impl Fn(&Progress) + Send + Sync + 'static) {
		*self.inner.callback.lock() = Some(Arc::new(callback));
	}

	/// Queues `item` unless its content already exists. Returns whether it was queued.
	pub fn enqueue(&self, item: WorkItem) -> Result<bool> {
		let queued = self.push(item)?;
		if queued {
			self.ensure_worker();
		}
		Ok(queued)
	}

	/// Queues every item lacking content and returns how many were added.
	pub fn enqueue_bulk(&self, items: impl IntoIterator<Item = WorkItem>) -> Result<usize> {
		let mut added = 0;
		for item in items {
			if self.push(item)? {
				added += 1;
			}
		}
		info!(target = "relay.queue", added, total = self.progress().total, "bulk enqueue");
		if added > 0 {
			self.ensure_worker();
		}
		Ok(added)
	}

	/// Asks the worker to exit after its current item; queued items are discarded.
	pub fn request_stop(&self) {
		self.inner.stop.lock().store(true, Ordering::SeqCst);
		let discarded = {
			let mut items = self.inner.items.lock();
			let count = items.len();
			items.clear();
			count
		};
		self.inner.wake.notify_waiters();
		info!(target = "relay.queue", discarded, "stop requested");
	}

	/// Waits for the worker task to exit, if one was started.
	pub async fn join(&self) {
		let handle = self.inner.worker.lock().take();
		if let Some(handle) = handle {
			if let Err(err) = handle.await {
				error!(target = "relay.queue", error = %err, "worker task failed");
			}
		}
	}

	/// Resolves once nothing is queued or in flight, or the worker is gone.
	pub async fn wait_idle(&self) {
		loop {
			let progress = self.progress();
			if progress.total == progress.processed || !self.is_running() {
				return;
			}
			tokio::time::sleep(self.inner.idle_poll).await;
		}
	}

	pub fn is_running(&self) -> bool {
		self.inner.worker.lock().as_ref().is_some_and(|handle| !handle.is_finished())
	}

	pub fn progress(&self) -> Progress {
		snapshot(&self.inner)
	}

	fn push(&self, item: WorkItem) -> Result<bool> {
		if self.inner.content.has_content(&item.target)? {
			debug!(target = "relay.queue", item = %item.target, "content exists; skipping");
			return Ok(false);
		}
		let in_flight = self.inner.counters.lock().current.as_ref().is_some_and(|current| current.target == item.target);
		let mut items = self.inner.items.lock();
		if in_flight || items.iter().any(|queued| queued.target == item.target) {
			debug!(target = "relay.queue", item = %item.target, "already queued; skipping");
			return Ok(false);
		}
		items.push_back(item);
		drop(items);
		self.inner.wake.notify_one();
		Ok(true)
	}

	/// Starts a worker unless one is running and has not been asked to stop.
	///
	/// A worker that is still finishing its last item after a stop is awaited
	/// by its replacement, so only one ever processes items.
	fn ensure_worker(&self) {
		let mut worker = self.inner.worker.lock();
		let mut stop = self.inner.stop.lock();
		let running = worker.as_ref().is_some_and(|handle| !handle.is_finished());
		let stopping = stop.load(Ordering::SeqCst);
		if running && !stopping {
			return;
		}

		let previous = worker.take().filter(|_| running);
		if stopping {
			debug!(target = "relay.queue", draining = previous.is_some(), "restarting worker after stop");
		}
		let token = Arc::new(AtomicBool::new(false));
		*stop = Arc::clone(&token);
		drop(stop);

		let inner = Arc::clone(&self.inner);
		*worker = Some(tokio::spawn(async move {
			if let Some(previous) = previous {
				if let Err(err) = previous.await {
					error!(target = "relay.queue", error = %err, "previous worker failed");
				}
			}
			*inner.counters.lock() = Counters::default();
			worker_loop(inner, token).await;
		}));
		info!(target = "relay.queue", "worker started");
	}
}

fn snapshot(inner: &Inner) -> Progress {
	let counters = inner.counters.lock();
	let queued = inner.items.lock().len();
	let in_flight = usize::from(counters.current.is_some());
	Progress {
		processed: counters.processed,
		total: counters.processed + in_flight + queued,
		generated: counters.generated,
		failed: counters.failed,
		current: counters.current.clone(),
	}
}

async fn worker_loop(inner: Arc<Inner>, stop: Arc<AtomicBool>) {
	loop {
		if stop.load(Ordering::SeqCst) {
			break;
		}

		// Lock order matches `snapshot`: counters, then items.
		let next = {
			let mut counters = inner.counters.lock();
			let next = inner.items.lock().pop_front();
			counters.current = next.clone();
			next
		};

		let Some(item) = next else {
			let _ = tokio::time::timeout(inner.idle_poll, inner.wake.notified()).await;
			continue;
		};

		process_item(&inner, &item).await;

		let progress = {
			let mut counters = inner.counters.lock();
			counters.processed += 1;
			counters.current = None;
			drop(counters);
			let mut progress = snapshot(&inner);
			progress.current = Some(item);
			progress
		};
		let callback = inner.callback.lock().clone();
		if let Some(callback) = callback {
			callback(&progress);
		}

		if !inner.item_pause.is_zero() && !stop.load(Ordering::SeqCst) {
			tokio::time::sleep(inner.item_pause).await;
		}
	}
	info!(target = "relay.queue", "worker exited");
}

async fn process_item(inner: &Inner, item: &WorkItem) {
	debug!(target = "relay.queue", item = %item.target, title = %item.title, "generating");
	let text = match inner.generator.generate(&item.title, &item.category).await {
		Ok(text) => text,
		Err(err) => {
			warn!(target = "relay.queue", item = %item.target, error = %err, "generation failed; dropping item");
			inner.counters.lock().failed += 1;
			return;
		}
	};

	match inner.content.save_content(&item.target, &text) {
		Ok(()) => {
			info!(target = "relay.queue", item = %item.target, chars = text.chars().count(), "content saved");
			inner.counters.lock().generated += 1;
		}
		Err(err) => {
			error!(target = "relay.queue", item = %item.target, error = %err, "failed to persist content");
			inner.counters.lock().failed += 1;
		}
	}
}

#[cfg(test)]
mod tests {
	use async_trait::async_trait;

	use super::*;
	use crate::error::GenerationError;
	use crate::storage::JsonStateStore;

	struct FailingOn {
		title: &'static str,
		delay: Duration,
	}

	#[async_trait]
	impl Generator for FailingOn {
		async fn generate(&self, title: &str, category: &str) -> std::result::Result<String, GenerationError> {
			tokio::time::sleep(self.delay).await;
			if title == self.title {
				return Err(GenerationError::Other("upstream 500".into()));
			}
			Ok(format!("[{category}] {title} summary"))
		}
	}

	fn item(n: usize) -> WorkItem {
		WorkItem {
			target: format!("item-{n}"),
			title: format!("title {n}"),
			category: "economy".into(),
		}
	}

	fn queue(fail_title: &'static str, delay: Duration) -> (WorkQueue, Arc<JsonStateStore>) {
		let store = Arc::new(JsonStateStore::in_memory());
		let config = QueueConfig {
			idle_poll_ms: 10,
			item_pause_ms: 0,
		};
		let queue = WorkQueue::new(Arc::new(FailingOn { title: fail_title, delay }), store.clone(), &config);
		(queue, store)
	}

	async fn wait_until(mut done: impl FnMut() -> bool) {
		for _ in 0..200 {
			if done() {
				return;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	}

	#[tokio::test]
	async fn bulk_batch_with_one_failure_reports_every_item() {
		let (queue, store) = queue("title 3", Duration::ZERO);
		let seen = Arc::new(Mutex::new(Vec::new()));
		let sink = Arc::clone(&seen);
		queue.set_progress_callback(move |progress| sink.lock().push(progress.processed));

		assert_eq!(queue.enqueue_bulk((1..=5).map(item)).unwrap(), 5);
		wait_until(|| queue.progress().processed == 5).await;

		let progress = queue.progress();
		assert_eq!(progress.processed, 5);
		assert_eq!(progress.generated, 4);
		assert_eq!(progress.failed, 1);
		assert_eq!(*seen.lock(), vec![1, 2, 3, 4, 5]);
		assert!(!store.has_content("item-3").unwrap());
		assert!(store.has_content("item-4").unwrap());

		queue.request_stop();
		queue.join().await;
	}

	#[tokio::test]
	async fn items_with_existing_content_are_skipped() {
		let (queue, store) = queue("never", Duration::ZERO);
		store.save_content("item-1", "already written").unwrap();

		assert!(!queue.enqueue(item(1)).unwrap());
		assert!(!queue.is_running());
		assert!(queue.enqueue(item(2)).unwrap());
		wait_until(|| queue.progress().processed == 1).await;
		assert!(!queue.enqueue(item(2)).unwrap());
		assert_eq!(queue.progress().generated, 1);

		queue.request_stop();
		queue.join().await;
	}

	#[tokio::test]
	async fn stop_discards_remaining_items_and_ends_worker() {
		let (queue, _store) = queue("never", Duration::from_millis(50));
		queue.enqueue_bulk((1..=10).map(item)).unwrap();
		wait_until(|| queue.progress().current.is_some()).await;

		queue.request_stop();
		tokio::time::timeout(Duration::from_secs(2), queue.join()).await.expect("worker should exit promptly");

		let progress = queue.progress();
		assert!(progress.processed <= 2, "processed {}", progress.processed);
		assert!(!queue.is_running());
		assert_eq!(progress.total, progress.processed);
	}

	#[tokio::test]
	async fn item_enqueued_while_stopping_is_still_processed() {
		let (queue, store) = queue("never", Duration::from_millis(150));
		assert!(queue.enqueue(item(1)).unwrap());
		wait_until(|| queue.progress().current.is_some()).await;

		queue.request_stop();
		assert!(queue.enqueue(item(2)).unwrap());
		wait_until(|| store.has_content("item-2").unwrap()).await;

		assert!(store.has_content("item-1").unwrap());
		assert!(store.has_content("item-2").unwrap());
		queue.request_stop();
		queue.join().await;
	}

	#[tokio::test]
	async fn wait_idle_returns_after_the_last_item() {
		let (queue, _store) = queue("never", Duration::from_millis(5));
		queue.enqueue_bulk((1..=3).map(item)).unwrap();

		tokio::time::timeout(Duration::from_secs(2), queue.wait_idle()).await.expect("queue should drain");
		assert_eq!(queue.progress().processed, 3);
		assert!(queue.is_running(), "worker keeps polling until stopped");

		queue.request_stop();
		queue.join().await;
	}

	#[tokio::test]
	async fn idle_worker_observes_stop() {
		let (queue, _store) = queue("never", Duration::ZERO);
		queue.enqueue(item(1)).unwrap();
		wait_until(|| queue.progress().processed == 1).await;

		queue.request_stop();
		tokio::time::timeout(Duration::from_secs(1), queue.join()).await.expect("idle worker should exit");
	}
}
