//! Shared registry of live automation sessions.
//!
//! The registry is the single source of truth for which browser processes
//! exist, including ones started by a previous crashed run. Mutations are
//! last-writer-wins keyed on pid/port.

use std::sync::Arc;

use tracing::{debug, info};

use super::record::SessionRecord;
use crate::error::Result;
use crate::storage::{SessionQuery, SessionStore, Upsert};

#[derive(Clone)]
pub struct SessionRegistry {
	store: Arc<dyn SessionStore>,
}

impl std::fmt::Debug for SessionRegistry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SessionRegistry").finish_non_exhaustive()
	}
}

impl SessionRegistry {
	pub fn new(store: Arc<dyn SessionStore>) -> Self {
		Self { store }
	}

	/// Records `record`, replacing any stale row with the same pid or port.
	pub fn register(&self, record: &SessionRecord) -> Result<Upsert> {
		let outcome = self.store.insert_or_update_session(record)?;
		info!(
			target = "relay.registry",
			owner = %record.owner,
			pid = record.pid,
			port = record.port,
			?outcome,
			"session registered"
		);
		Ok(outcome)
	}

	/// Removes the rows for `record` once teardown is confirmed.
	pub fn unregister(&self, record: &SessionRecord) -> Result<usize> {
		let removed = self.store.delete_sessions(&SessionQuery::PidOrPort {
			pid: record.pid,
			port: record.port,
		})?;
		debug!(target = "relay.registry", owner = %record.owner, pid = record.pid, removed, "session unregistered");
		Ok(removed)
	}

	pub fn find_by_owner(&self, owner: &str) -> Result<Vec<SessionRecord>> {
		self.store.list_sessions(&SessionQuery::Owner(owner.to_string()))
	}

	pub fn find_by_pid_or_port(&self, pid: u32, port: u16) -> Result<Vec<SessionRecord>> {
		self.store.list_sessions(&SessionQuery::PidOrPort { pid, port })
	}

	pub fn list_all(&self) -> Result<Vec<SessionRecord>> {
		self.store.list_sessions(&SessionQuery::All)
	}
}
