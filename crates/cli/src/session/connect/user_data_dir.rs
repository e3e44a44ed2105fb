//! Per-owner browser profile directories.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::Result;

/// Directory name used for `owner`'s profile.
fn profile_dir_name(owner: &str) -> String {
	owner
		.chars()
		.map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
		.collect()
}

/// Resolves and creates the profile directory for `owner` under `root`.
pub fn resolve_profile_dir(root: &Path, owner: &str) -> Result<PathBuf> {
	let dir = root.join(profile_dir_name(owner));
	std::fs::create_dir_all(&dir)?;
	Ok(dir)
}

/// Removes profile directories under `root` that belong to none of `owners`.
///
/// Returns the removed paths. A missing root is an empty result.
pub fn prune_profiles(root: &Path, owners: &HashSet<String>) -> Result<Vec<PathBuf>> {
	let keep: HashSet<String> = owners.iter().map(|owner| profile_dir_name(owner)).collect();
	let entries = match std::fs::read_dir(root) {
		Ok(entries) => entries,
		Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
		Err(err) => return Err(err.into()),
	};

	let mut removed = Vec::new();
	for entry in entries {
		let entry = entry?;
		if !entry.file_type()?.is_dir() {
			continue;
		}
		let name = entry.file_name().to_string_lossy().to_string();
		if keep.contains(&name) {
			continue;
		}
		let path = entry.path();
		match std::fs::remove_dir_all(&path) {
			Ok(()) => {
				debug!(target = "relay.profiles", path = %path.display(), "pruned profile");
				removed.push(path);
			}
			Err(err) => warn!(target = "relay.profiles", path = %path.display(), error = %err, "failed to prune profile"),
		}
	}
	Ok(removed)
}
