//! Process and port lifecycle helpers used by session launch and teardown.

#[cfg(unix)]
use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

const LIVENESS_POLL: Duration = Duration::from_millis(100);

/// Failure to deliver a termination signal to a process that is still alive.
#[derive(Debug, Error)]
pub enum ProcessError {
	#[error("failed to run {tool} for pid {pid}: {source}")]
	Tool {
		tool: &'static str,
		pid: u32,
		#[source]
		source: std::io::Error,
	},

	#[error("pid {pid} survived termination")]
	Survived { pid: u32 },
}

/// How a single process ended up after [`terminate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
	/// The process was not running when termination started.
	AlreadyGone,
	/// The process exited within the grace period after a polite signal.
	Terminated,
	/// The process had to be force-killed.
	Killed,
}

/// Result of [`terminate_tree`]: the root process plus its descendants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeTermination {
	pub root: Termination,
	pub descendants: Vec<(u32, Termination)>,
}

/// Returns `true` when a process with `pid` appears alive on this platform.
///
/// Zombies (exited but not yet reaped) are reported as dead.
pub fn pid_is_alive(pid: u32) -> bool {
	#[cfg(unix)]
	{
		if pid == 0 {
			return false;
		}

		let proc_dir = PathBuf::from("/proc").join(pid.to_string());
		if proc_dir.exists() {
			return match std::fs::read_to_string(proc_dir.join("stat")) {
				Ok(stat) => stat_state(&stat).is_some_and(|state| state != 'Z' && state != 'X'),
				Err(_) => proc_dir.exists(),
			};
		}

		if PathBuf::from("/proc/self").exists() {
			return false;
		}

		Command::new("kill")
			.arg("-0")
			.arg(pid.to_string())
			.status()
			.map(|status| status.success())
			.unwrap_or(pid == std::process::id())
	}

	#[cfg(windows)]
	{
		let filter = format!("PID eq {pid}");
		if let Ok(output) = Command::new("tasklist").args(["/FI", &filter, "/FO", "CSV", "/NH"]).output() {
			if output.status.success() {
				let stdout = String::from_utf8_lossy(&output.stdout);
				return tasklist_has_pid(stdout.as_ref(), pid);
			}
		}

		pid == std::process::id()
	}

	#[cfg(not(any(unix, windows)))]
	{
		pid == std::process::id()
	}
}

/// Returns `true` when `port` can be bound on localhost.
pub fn port_available(port: u16) -> bool {
	std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Command line of a running process, arguments joined by spaces.
///
/// `None` when the process is gone or the platform offers no way to read it.
pub fn process_cmdline(pid: u32) -> Option<String> {
	#[cfg(target_os = "linux")]
	{
		let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
		let args: Vec<String> = raw
			.split(|byte| *byte == 0)
			.filter(|arg| !arg.is_empty())
			.map(|arg| String::from_utf8_lossy(arg).into_owned())
			.collect();
		if args.is_empty() { None } else { Some(args.join(" ")) }
	}

	#[cfg(all(unix, not(target_os = "linux")))]
	{
		let output = Command::new("ps").args(["-o", "args=", "-p", &pid.to_string()]).output().ok()?;
		let args = String::from_utf8_lossy(&output.stdout).trim().to_string();
		if output.status.success() && !args.is_empty() { Some(args) } else { None }
	}

	#[cfg(not(unix))]
	{
		let _ = pid;
		None
	}
}

/// Terminates `pid`, escalating to a forced kill once `grace` has elapsed.
///
/// A process that is already gone is a success, not an error.
pub fn terminate(pid: u32, grace: Duration) -> Result<Termination, ProcessError> {
	if !pid_is_alive(pid) {
		return Ok(Termination::AlreadyGone);
	}

	debug!(target = "relay.process", pid, "sending polite termination");
	signal(pid, false)?;
	if wait_for_exit(pid, grace) {
		return Ok(Termination::Terminated);
	}

	debug!(target = "relay.process", pid, grace_ms = grace.as_millis() as u64, "grace period elapsed; force killing");
	signal(pid, true)?;
	if wait_for_exit(pid, grace.max(Duration::from_millis(500))) {
		Ok(Termination::Killed)
	} else {
		Err(ProcessError::Survived { pid })
	}
}

/// Terminates `pid` and every process descended from it.
///
/// Descendants are collected before the root is signalled because they are
/// reparented once it exits.
pub fn terminate_tree(pid: u32, grace: Duration) -> Result<TreeTermination, ProcessError> {
	let descendants = descendant_pids(pid);
	let root = terminate(pid, grace)?;

	let mut results = Vec::with_capacity(descendants.len());
	for child in descendants {
		match terminate(child, grace) {
			Ok(outcome) => results.push((child, outcome)),
			Err(err) => debug!(target = "relay.process", pid = child, error = %err, "descendant termination failed"),
		}
	}

	Ok(TreeTermination { root, descendants: results })
}

/// Returns every live process whose parent chain leads to `pid`.
pub fn descendant_pids(pid: u32) -> Vec<u32> {
	let table = parent_table();
	let mut found = Vec::new();
	let mut frontier = vec![pid];
	while let Some(parent) = frontier.pop() {
		for &(child, ppid) in &table {
			if ppid == parent && child != pid && !found.contains(&child) {
				found.push(child);
				frontier.push(child);
			}
		}
	}
	found
}

fn wait_for_exit(pid: u32, within: Duration) -> bool {
	let deadline = Instant::now() + within;
	loop {
		if !pid_is_alive(pid) {
			return true;
		}
		if Instant::now() >= deadline {
			return false;
		}
		std::thread::sleep(LIVENESS_POLL);
	}
}

fn signal(pid: u32, force: bool) -> Result<(), ProcessError> {
	#[cfg(unix)]
	let (tool, status) = {
		let sig = if force { "-KILL" } else { "-TERM" };
		("kill", Command::new("kill").args([sig, &pid.to_string()]).status())
	};

	#[cfg(windows)]
	let (tool, status) = {
		let mut args = vec!["/PID".to_string(), pid.to_string(), "/T".to_string()];
		if force {
			args.push("/F".to_string());
		}
		("taskkill", Command::new("taskkill").args(&args).status())
	};

	#[cfg(not(any(unix, windows)))]
	let (tool, status): (&'static str, std::io::Result<std::process::ExitStatus>) =
		("kill", Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "signals unsupported")));

	match status {
		Ok(status) if status.success() => Ok(()),
		// Non-zero usually means the process exited between the liveness check and the signal.
		Ok(_) if !pid_is_alive(pid) => Ok(()),
		Ok(status) => {
			debug!(target = "relay.process", pid, %status, "{tool} returned non-zero");
			Ok(())
		}
		Err(source) => Err(ProcessError::Tool { tool, pid, source }),
	}
}

#[cfg(target_os = "linux")]
fn parent_table() -> Vec<(u32, u32)> {
	let Ok(entries) = std::fs::read_dir("/proc") else {
		return Vec::new();
	};

	entries
		.filter_map(|entry| entry.ok())
		.filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
		.filter_map(|pid| {
			let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
			Some((pid, stat_parent(&stat)?))
		})
		.collect()
}

#[cfg(all(unix, not(target_os = "linux")))]
fn parent_table() -> Vec<(u32, u32)> {
	let Ok(output) = Command::new("ps").args(["-A", "-o", "pid=,ppid="]).output() else {
		return Vec::new();
	};
	parse_ps_table(&String::from_utf8_lossy(&output.stdout))
}

#[cfg(not(unix))]
fn parent_table() -> Vec<(u32, u32)> {
	// taskkill /T already walks the tree on Windows.
	Vec::new()
}

#[cfg(any(test, all(unix, not(target_os = "linux"))))]
fn parse_ps_table(output: &str) -> Vec<(u32, u32)> {
	output
		.lines()
		.filter_map(|line| {
			let mut fields = line.split_whitespace();
			let pid = fields.next()?.parse().ok()?;
			let ppid = fields.next()?.parse().ok()?;
			Some((pid, ppid))
		})
		.collect()
}

/// Fields after the parenthesised command name, which may itself contain spaces.
#[cfg(any(test, unix))]
fn stat_tail(stat: &str) -> Option<&str> {
	stat.rfind(')').map(|idx| stat[idx + 1..].trim_start())
}

#[cfg(any(test, unix))]
fn stat_state(stat: &str) -> Option<char> {
	stat_tail(stat)?.chars().next()
}

#[cfg(any(test, target_os = "linux"))]
fn stat_parent(stat: &str) -> Option<u32> {
	stat_tail(stat)?.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(any(test, windows))]
fn tasklist_has_pid(output: &str, pid: u32) -> bool {
	let pid_str = pid.to_string();
	output.lines().any(|line| {
		let line = line.trim();
		if !line.starts_with('"') {
			return false;
		}

		line.trim_matches('"')
			.split("\",\"")
			.nth(1)
			.is_some_and(|field| field.trim() == pid_str.as_str())
	})
}
