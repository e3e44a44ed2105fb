//! File-based advisory "busy" flags, one per class of work.
//!
//! A flag never blocks anyone. Its presence means "reported busy", its
//! absence "not known to be running". File mtime decides staleness; content
//! is informational only.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};
use crate::session::record::now_ts;

pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct AdvisoryLock {
	dir: PathBuf,
	stale_after: Duration,
}

impl AdvisoryLock {
	pub fn new(dir: impl Into<PathBuf>) -> Self {
		Self {
			dir: dir.into(),
			stale_after: DEFAULT_STALE_AFTER,
		}
	}

	pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
		self.stale_after = stale_after;
		self
	}

	/// Flag file for `tag`; the tag is used verbatim, so it must pass [`validate_tag`].
	pub fn path(&self, tag: &str) -> Result<PathBuf> {
		validate_tag(tag)?;
		Ok(self.dir.join(format!("{tag}.lock")))
	}

	/// Writes the flag for `tag` unless a fresh one exists.
	///
	/// Returns `false` ("busy") when another holder's flag is present and not
	/// stale. A stale flag is replaced.
	pub fn acquire(&self, tag: &str) -> Result<bool> {
		let path = self.path(tag)?;
		fs::create_dir_all(&self.dir)?;

		match create_flag(&path) {
			Ok(()) => {
				debug!(target = "relay.lock", tag, "flag acquired");
				Ok(true)
			}
			Err(err) if err.kind() == ErrorKind::AlreadyExists => {
				if !self.is_stale(tag, self.stale_after)? {
					info!(target = "relay.lock", tag, "flag present; reported busy");
					return Ok(false);
				}
				warn!(target = "relay.lock", tag, "replacing stale flag");
				remove_flag(&path)?;
				match create_flag(&path) {
					Ok(()) => Ok(true),
					Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
					Err(err) => Err(err.into()),
				}
			}
			Err(err) => Err(err.into()),
		}
	}

	/// Deletes the flag; a missing flag is not an error.
	pub fn release(&self, tag: &str) -> Result<bool> {
		let removed = remove_flag(&self.path(tag)?)?;
		debug!(target = "relay.lock", tag, removed, "flag released");
		Ok(removed)
	}

	/// `true` when the flag exists and was last modified more than `threshold` ago.
	pub fn is_stale(&self, tag: &str, threshold: Duration) -> Result<bool> {
		Ok(self.age(tag)?.is_some_and(|age| age > threshold))
	}

	/// Present and not stale under the configured threshold.
	pub fn is_busy(&self, tag: &str) -> Result<bool> {
		Ok(self.age(tag)?.is_some_and(|age| age <= self.stale_after))
	}

	/// Age of the flag by mtime, or `None` when absent.
	pub fn age(&self, tag: &str) -> Result<Option<Duration>> {
		let modified = match fs::metadata(self.path(tag)?).and_then(|meta| meta.modified()) {
			Ok(modified) => modified,
			Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
			Err(err) => return Err(err.into()),
		};
		// mtime in the future (clock skew) counts as fresh.
		Ok(Some(SystemTime::now().duration_since(modified).unwrap_or_default()))
	}

	/// Acquires `tag` and returns a guard releasing it on drop, or `None` if busy.
	pub fn hold(&self, tag: &str) -> Result<Option<LockGuard>> {
		if !self.acquire(tag)? {
			return Ok(None);
		}
		Ok(Some(LockGuard {
			lock: self.clone(),
			tag: tag.to_string(),
		}))
	}
}

/// Releases its flag when dropped.
#[derive(Debug)]
pub struct LockGuard {
	lock: AdvisoryLock,
	tag: String,
}

impl LockGuard {
	pub fn tag(&self) -> &str {
		&self.tag
	}
}

impl Drop for LockGuard {
	fn drop(&mut self) {
		if let Err(err) = self.lock.release(&self.tag) {
			warn!(target = "relay.lock", tag = %self.tag, error = %err, "failed to release flag");
		}
	}
}

/// Tags name files directly: ASCII letters, digits, `-` and `_` only.
pub fn validate_tag(tag: &str) -> Result<()> {
	if tag.is_empty() || !tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
		return Err(RelayError::Config(format!("invalid lock tag '{tag}': use letters, digits, '-' or '_'")));
	}
	Ok(())
}

fn create_flag(path: &Path) -> std::io::Result<()> {
	let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
	writeln!(file, "{} pid={}", now_ts(), std::process::id())
}

fn remove_flag(path: &Path) -> std::io::Result<bool> {
	match fs::remove_file(path) {
		Ok(()) => Ok(true),
		Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
		Err(err) => Err(err),
	}
}
