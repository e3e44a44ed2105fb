//! Wiring from [`RelayConfig`] to the live collaborators a command needs.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use relay_runtime::PortAllocator;
use tracing::{info, warn};

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::generator::ChatCompletionsGenerator;
use crate::lock::AdvisoryLock;
use crate::queue::WorkQueue;
use crate::retry::RetryPolicy;
use crate::session::connect::BrowserSpawner;
use crate::session::{CdpConnector, LifecycleOptions, SessionLifecycleManager, SessionRegistry};
use crate::storage::JsonStateStore;
use crate::workflow::{ScriptedSiteDriver, Workflow, WorkflowContext};

pub struct RelayContext {
	pub config: RelayConfig,
	pub store: Arc<JsonStateStore>,
	pub lifecycle: Arc<SessionLifecycleManager>,
	pub lock: AdvisoryLock,
}

impl RelayContext {
	pub fn new(config: RelayConfig) -> Self {
		let store = Arc::new(JsonStateStore::open(config.state_file()));
		let registry = SessionRegistry::new(store.clone());
		let lifecycle = SessionLifecycleManager::new(
			LifecycleOptions::from_config(&config),
			port_allocator(&config),
			registry,
			Arc::new(CdpConnector {
				command_timeout: Duration::from_millis(config.retry.unit_timeout_ms.max(1_000)),
			}),
			Arc::new(BrowserSpawner::new(config.browser.binary.clone())),
		);
		let lock = AdvisoryLock::new(config.locks_dir()).with_stale_after(config.lock.stale_after());

		Self {
			config,
			store,
			lifecycle: Arc::new(lifecycle),
			lock,
		}
	}

	/// Generation queue, or `None` when generation is not configured or has no key.
	pub fn queue(&self) -> Option<WorkQueue> {
		let Some(generator) = &self.config.generator else {
			info!(target = "relay", "no generator configured; harvested items will not be queued");
			return None;
		};
		match ChatCompletionsGenerator::from_config(generator) {
			Ok(generator) => {
				let queue = WorkQueue::new(Arc::new(generator), self.store.clone(), &self.config.queue);
				queue.set_progress_callback(|progress| {
					info!(
						target = "relay.queue",
						processed = progress.processed,
						total = progress.total,
						generated = progress.generated,
						failed = progress.failed,
						item = progress.current.as_ref().map(|item| item.title.as_str()).unwrap_or_default(),
						"generation progress"
					);
				});
				Some(queue)
			}
			Err(err) => {
				warn!(target = "relay", error = %err, "generator unavailable; harvested items will not be queued");
				None
			}
		}
	}

	/// Enabled workflows, narrowed to `owners` when it is non-empty.
	pub fn workflows(&self, owners: &[String], queue: Option<WorkQueue>) -> Result<Vec<Arc<Workflow>>> {
		let known: HashSet<&str> = self.config.workflows.0.iter().map(|workflow| workflow.owner.as_str()).collect();
		if let Some(unknown) = owners.iter().find(|owner| !known.contains(owner.as_str())) {
			return Err(RelayError::Config(format!("no workflow configured for owner '{unknown}'")));
		}

		let ctx = WorkflowContext {
			lifecycle: Arc::clone(&self.lifecycle),
			lock: self.lock.clone(),
			policy: RetryPolicy::from(&self.config.retry),
			queue,
		};
		Ok(self
			.config
			.workflows
			.0
			.iter()
			.filter(|workflow| if owners.is_empty() { workflow.enabled } else { owners.contains(&workflow.owner) })
			.map(|workflow| {
				let site = Arc::new(ScriptedSiteDriver::from_config(workflow));
				Arc::new(Workflow::new(workflow.clone(), site, ctx.clone()))
			})
			.collect())
	}
}

/// Allocator with the configured fallback range.
pub fn port_allocator(config: &RelayConfig) -> PortAllocator {
	PortAllocator::new().with_fallbacks(config.ports.fallback_step, config.ports.fallback_count)
}
