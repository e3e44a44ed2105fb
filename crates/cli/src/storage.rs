//! Storage collaborator: session rows and generated content.
//!
//! The orchestration layer only needs plain CRUD, expressed by
//! [`SessionStore`] and [`ContentStore`]. [`JsonStateStore`] backs both with a
//! single JSON file, or with memory alone when constructed without a path.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::session::SessionRecord;
use crate::session::record::now_ts;

const STATE_SCHEMA_VERSION: u32 = 1;

/// Row selector for session listing and deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionQuery {
	All,
	Owner(String),
	/// Rows whose pid or port matches either value.
	PidOrPort { pid: u32, port: u16 },
}

impl SessionQuery {
	pub fn matches(&self, record: &SessionRecord) -> bool {
		match self {
			SessionQuery::All => true,
			SessionQuery::Owner(owner) => record.owner == *owner,
			SessionQuery::PidOrPort { pid, port } => record.pid == *pid || record.port == *port,
		}
	}
}

/// Whether an upsert created a row or overwrote an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
	Inserted,
	Updated,
}

pub trait SessionStore: Send + Sync {
	/// Inserts `record`, or overwrites the row sharing its pid or port.
	fn insert_or_update_session(&self, record: &SessionRecord) -> Result<Upsert>;

	/// Deletes matching rows and returns how many were removed.
	fn delete_sessions(&self, query: &SessionQuery) -> Result<usize>;

	fn list_sessions(&self, query: &SessionQuery) -> Result<Vec<SessionRecord>>;
}

pub trait ContentStore: Send + Sync {
	/// Returns `true` when non-empty derived content exists for `target`.
	fn has_content(&self, target: &str) -> Result<bool>;

	fn save_content(&self, target: &str, text: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedContent {
	pub text: String,
	pub generated_at: u64,
}

/// On-disk format of the state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFile {
	pub schema: u32,
	#[serde(default)]
	pub sessions: Vec<SessionRecord>,
	#[serde(default)]
	pub content: BTreeMap<String, GeneratedContent>,
}

impl Default for StateFile {
	fn default() -> Self {
		Self {
			schema: STATE_SCHEMA_VERSION,
			sessions: Vec::new(),
			content: BTreeMap::new(),
		}
	}
}

impl StateFile {
	fn upsert_session(&mut self, record: &SessionRecord) -> Upsert {
		let query = SessionQuery::PidOrPort {
			pid: record.pid,
			port: record.port,
		};
		let matches: Vec<usize> = self
			.sessions
			.iter()
			.enumerate()
			.filter(|(_, row)| query.matches(row))
			.map(|(idx, _)| idx)
			.collect();

		let Some((&first, rest)) = matches.split_first() else {
			self.sessions.push(record.clone());
			return Upsert::Inserted;
		};

		self.sessions[first] = record.clone();
		for &idx in rest.iter().rev() {
			self.sessions.remove(idx);
		}
		Upsert::Updated
	}
}

/// JSON-file backed [`SessionStore`] and [`ContentStore`].
///
/// Every mutation rewrites the file; a missing or unreadable file starts empty.
#[derive(Debug)]
pub struct JsonStateStore {
	path: Option<PathBuf>,
	state: Mutex<StateFile>,
}

impl JsonStateStore {
	pub fn open(path: PathBuf) -> Self {
		let state = match fs::read_to_string(&path) {
			Ok(content) => serde_json::from_str(&content).unwrap_or_else(|err| {
				warn!(target = "relay.storage", path = %path.display(), error = %err, "state file unreadable; starting empty");
				StateFile::default()
			}),
			Err(_) => StateFile::default(),
		};
		Self {
			path: Some(path),
			state: Mutex::new(state),
		}
	}

	pub fn in_memory() -> Self {
		Self {
			path: None,
			state: Mutex::new(StateFile::default()),
		}
	}

	pub fn path(&self) -> Option<&Path> {
		self.path.as_deref()
	}

	fn mutate<T>(&self, apply: impl FnOnce(&mut StateFile) -> T) -> Result<T> {
		let mut state = self.state.lock();
		let out = apply(&mut state);
		if let Some(path) = &self.path {
			if let Some(parent) = path.parent() {
				fs::create_dir_all(parent)?;
			}
			fs::write(path, serde_json::to_string_pretty(&*state)?)?;
		}
		Ok(out)
	}
}

impl SessionStore for JsonStateStore {
	fn insert_or_update_session(&self, record: &SessionRecord) -> Result<Upsert> {
		self.mutate(|state| state.upsert_session(record))
	}

	fn delete_sessions(&self, query: &SessionQuery) -> Result<usize> {
		self.mutate(|state| {
			let before = state.sessions.len();
			state.sessions.retain(|row| !query.matches(row));
			before - state.sessions.len()
		})
	}

	fn list_sessions(&self, query: &SessionQuery) -> Result<Vec<SessionRecord>> {
		Ok(self.state.lock().sessions.iter().filter(|row| query.matches(row)).cloned().collect())
	}
}

impl ContentStore for JsonStateStore {
	fn has_content(&self, target: &str) -> Result<bool> {
		Ok(self
			.state
			.lock()
			.content
			.get(target)
			.is_some_and(|content| !content.text.trim().is_empty()))
	}

	fn save_content(&self, target: &str, text: &str) -> Result<()> {
		self.mutate(|state| {
			state.content.insert(
				target.to_string(),
				GeneratedContent {
					text: text.to_string(),
					generated_at: now_ts(),
				},
			);
		})
	}
}

#[cfg(test)]
mod tests {
	use std::path::PathBuf;

	use tempfile::TempDir;

	use super::*;

	fn record(owner: &str, pid: u32, port: u16) -> SessionRecord {
		SessionRecord {
			owner: owner.to_string(),
			pid,
			port,
			profile_dir: Some(PathBuf::from(format!("/profiles/{owner}"))),
			started_at: 1,
		}
	}

	#[test]
	fn same_pid_updates_instead_of_duplicating() {
		let store = JsonStateStore::in_memory();
		assert_eq!(store.insert_or_update_session(&record("scrape", 100, 9222)).unwrap(), Upsert::Inserted);
		assert_eq!(store.insert_or_update_session(&record("post", 100, 9333)).unwrap(), Upsert::Updated);

		let rows = store.list_sessions(&SessionQuery::All).unwrap();
		assert_eq!(rows.len(), 1);
		assert_eq!(rows[0].owner, "post");
		assert_eq!(rows[0].port, 9333);
	}

	#[test]
	fn upsert_collapses_rows_matching_pid_and_port_separately() {
		let store = JsonStateStore::in_memory();
		store.insert_or_update_session(&record("scrape", 100, 9222)).unwrap();
		store.insert_or_update_session(&record("post", 200, 9333)).unwrap();
		store.insert_or_update_session(&record("scrape", 200, 9222)).unwrap();

		let rows = store.list_sessions(&SessionQuery::All).unwrap();
		assert_eq!(rows.len(), 1);
		assert_eq!((rows[0].pid, rows[0].port), (200, 9222));
	}

	#[test]
	fn delete_by_pid_or_port() {
		let store = JsonStateStore::in_memory();
		store.insert_or_update_session(&record("scrape", 100, 9222)).unwrap();
		store.insert_or_update_session(&record("post", 200, 9333)).unwrap();

		let removed = store.delete_sessions(&SessionQuery::PidOrPort { pid: 999, port: 9333 }).unwrap();
		assert_eq!(removed, 1);
		assert_eq!(store.list_sessions(&SessionQuery::Owner("post".into())).unwrap().len(), 0);
		assert_eq!(store.list_sessions(&SessionQuery::Owner("scrape".into())).unwrap().len(), 1);
	}

	#[test]
	fn state_survives_reopen() {
		let temp = TempDir::new().unwrap();
		let path = temp.path().join("state.json");
		{
			let store = JsonStateStore::open(path.clone());
			store.insert_or_update_session(&record("scrape", 100, 9222)).unwrap();
			store.save_content("item-1", "summary text").unwrap();
		}

		let reopened = JsonStateStore::open(path);
		assert_eq!(reopened.list_sessions(&SessionQuery::All).unwrap().len(), 1);
		assert!(reopened.has_content("item-1").unwrap());
		assert!(!reopened.has_content("item-2").unwrap());
	}

	#[test]
	fn corrupt_state_file_starts_empty() {
		let temp = TempDir::new().unwrap();
		let path = temp.path().join("state.json");
		std::fs::write(&path, "{ not json").unwrap();
		let store = JsonStateStore::open(path);
		assert!(store.list_sessions(&SessionQuery::All).unwrap().is_empty());
	}

	#[test]
	fn blank_content_does_not_count() {
		let store = JsonStateStore::in_memory();
		store.save_content("item-1", "   ").unwrap();
		assert!(!store.has_content("item-1").unwrap());
	}
}
