//! Persisted row describing one live automation session.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use relay_runtime::{pid_is_alive, process_cmdline};
use serde::{Deserialize, Serialize};

/// Registry row for a spawned browser process.
///
/// Rows can outlive their process after a crash, and the pid may since have
/// been reused; treat them as hints and confirm with
/// [`SessionRecord::is_alive`] before relying on one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
	pub owner: String,
	pub pid: u32,
	pub port: u16,
	#[serde(default)]
	pub profile_dir: Option<PathBuf>,
	/// Unix seconds.
	pub started_at: u64,
}

impl SessionRecord {
	pub fn new(owner: impl Into<String>, pid: u32, port: u16, profile_dir: Option<PathBuf>) -> Self {
		Self {
			owner: owner.into(),
			pid,
			port,
			profile_dir,
			started_at: now_ts(),
		}
	}

	/// True when the pid is alive and still runs the browser this row describes.
	///
	/// Where command lines cannot be read, pid liveness alone decides.
	pub fn is_alive(&self) -> bool {
		if !pid_is_alive(self.pid) {
			return false;
		}
		match process_cmdline(self.pid) {
			Some(cmdline) => self.matches_cmdline(&cmdline),
			None => !cfg!(unix),
		}
	}

	/// Whether `cmdline` carries this row's debugging port or profile directory.
	pub fn matches_cmdline(&self, cmdline: &str) -> bool {
		let port_flag = format!("--remote-debugging-port={}", self.port);
		if cmdline.split_whitespace().any(|arg| arg == port_flag) {
			return true;
		}
		self.profile_dir
			.as_ref()
			.is_some_and(|dir| cmdline.contains(&format!("--user-data-dir={}", dir.display())))
	}
}

pub fn now_ts() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn cmdline_match_needs_this_rows_port_or_profile() {
		let record = SessionRecord::new("scrape", 4242, 9222, Some(PathBuf::from("/tmp/relay/profiles/scrape")));

		assert!(record.matches_cmdline("/usr/bin/chromium --remote-debugging-port=9222 --no-first-run"));
		assert!(record.matches_cmdline("chrome --remote-debugging-port=9232 --user-data-dir=/tmp/relay/profiles/scrape"));
		assert!(!record.matches_cmdline("chrome --remote-debugging-port=92220"));
		assert!(!record.matches_cmdline("sleep 30"));
	}

	#[cfg(unix)]
	#[test]
	fn unrelated_process_on_recorded_pid_is_not_alive() {
		let mut other = std::process::Command::new("sleep").arg("30").spawn().unwrap();
		let record = SessionRecord::new("scrape", other.id(), 9222, None);

		let alive = record.is_alive();
		let _ = other.kill();
		let _ = other.wait();
		assert!(!alive);
	}
}
