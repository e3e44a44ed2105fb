//! Single-instance guard backed by a pid file.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use relay_runtime::pid_is_alive;
use tracing::{debug, warn};

use crate::error::{RelayError, Result};

/// Holds the pid file for this process; removes it on drop.
#[derive(Debug)]
pub struct InstanceGuard {
	path: PathBuf,
	pid: u32,
}

impl InstanceGuard {
	/// Claims `path` for the current process.
	///
	/// Fails with [`RelayError::InstanceRunning`] while the recorded pid is
	/// alive. A pid file left by a dead process is replaced.
	///
	/// The pid is written to a private file first and linked into place, so
	/// the pid file never exists without its content.
	pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
		let path = path.into();
		let pid = std::process::id();
		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent)?;
		}

		let staged = staging_path(&path, pid);
		fs::write(&staged, format!("{pid}\n"))?;
		let claimed = claim(&path, &staged, pid);
		remove_if_present(&staged)?;
		claimed
	}

	pub fn path(&self) -> &Path {
		&self.path
	}
}

fn claim(path: &Path, staged: &Path, pid: u32) -> Result<InstanceGuard> {
	for _ in 0..2 {
		match fs::hard_link(staged, path) {
			Ok(()) => {
				debug!(target = "relay.instance", path = %path.display(), pid, "instance guard acquired");
				return Ok(InstanceGuard {
					path: path.to_path_buf(),
					pid,
				});
			}
			Err(err) if err.kind() == ErrorKind::AlreadyExists => {
				if let Some(holder) = read_pid(path)?.filter(|holder| *holder != pid && pid_is_alive(*holder)) {
					return Err(RelayError::InstanceRunning { pid: holder });
				}
				warn!(target = "relay.instance", path = %path.display(), "replacing stale pid file");
				remove_if_present(path)?;
			}
			Err(err) => return Err(err.into()),
		}
	}
	Err(RelayError::Config(format!("could not claim pid file {}", path.display())))
}

fn staging_path(path: &Path, pid: u32) -> PathBuf {
	let name = path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default();
	path.with_file_name(format!(".{name}.{pid}.tmp"))
}

impl Drop for InstanceGuard {
	fn drop(&mut self) {
		// Only remove the file while it still names us.
		if matches!(read_pid(&self.path), Ok(Some(pid)) if pid == self.pid) {
			if let Err(err) = remove_if_present(&self.path) {
				warn!(target = "relay.instance", path = %self.path.display(), error = %err, "failed to remove pid file");
			}
		}
	}
}

/// Pid recorded in `path`, or `None` when the file is missing or unparsable.
pub fn read_pid(path: &Path) -> Result<Option<u32>> {
	match fs::read_to_string(path) {
		Ok(content) => Ok(content.trim().parse().ok()),
		Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
		Err(err) => Err(err.into()),
	}
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
	match fs::remove_file(path) {
		Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
		_ => Ok(()),
	}
}
