//! Browser executable discovery.

use std::path::{Path, PathBuf};

/// Returns `configured` when given, else the first installed Chromium-family browser.
pub(crate) fn resolve_browser_binary(configured: Option<&str>) -> Option<String> {
	match configured {
		Some(binary) => Some(binary.to_string()),
		None => find_chrome_executable(),
	}
}

pub(crate) fn find_chrome_executable() -> Option<String> {
	let candidates: Vec<String> = if cfg!(target_os = "macos") {
		vec![
			"/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
			"/Applications/Chromium.app/Contents/MacOS/Chromium",
			"/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge",
		]
		.into_iter()
		.map(str::to_string)
		.collect()
	} else if cfg!(target_os = "windows") {
		windows_browser_candidates()
	} else {
		vec![
			"google-chrome-stable",
			"google-chrome",
			"chromium-browser",
			"chromium",
			"/usr/bin/google-chrome-stable",
			"/usr/bin/google-chrome",
			"/usr/bin/chromium-browser",
			"/usr/bin/chromium",
			"/snap/bin/chromium",
		]
		.into_iter()
		.map(str::to_string)
		.collect()
	};

	candidates.into_iter().find(|candidate| is_installed(candidate))
}

fn is_installed(candidate: &str) -> bool {
	if candidate.starts_with('/') || candidate.contains('\\') || candidate.contains(':') {
		Path::new(candidate).exists()
	} else {
		which::which(candidate).is_ok()
	}
}

fn windows_browser_candidates() -> Vec<String> {
	let mut roots: Vec<PathBuf> = ["PROGRAMFILES", "PROGRAMFILES(X86)", "LOCALAPPDATA"]
		.into_iter()
		.filter_map(|key| std::env::var(key).ok().map(PathBuf::from))
		.collect();
	if roots.is_empty() {
		roots.push(PathBuf::from(r"C:\Program Files"));
		roots.push(PathBuf::from(r"C:\Program Files (x86)"));
	}

	let suffixes: &[&[&str]] = &[
		&["Google", "Chrome", "Application", "chrome.exe"],
		&["Microsoft", "Edge", "Application", "msedge.exe"],
		&["Chromium", "Application", "chrome.exe"],
	];

	let mut candidates: Vec<String> = roots
		.iter()
		.flat_map(|root| {
			suffixes
				.iter()
				.map(move |suffix| suffix.iter().fold(root.clone(), |path, part| path.join(part)).to_string_lossy().to_string())
		})
		.collect();
	candidates.extend(["chrome.exe", "msedge.exe", "chromium.exe"].map(str::to_string));
	candidates
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn configured_binary_wins() {
		assert_eq!(resolve_browser_binary(Some("/opt/chrome")), Some("/opt/chrome".to_string()));
	}

	#[test]
	fn windows_candidates_include_common_commands() {
		let candidates = windows_browser_candidates();
		assert!(candidates.contains(&"chrome.exe".to_string()));
		assert!(candidates.contains(&"msedge.exe".to_string()));
		assert!(candidates.iter().any(|c| c.ends_with("chrome.exe") && c.contains("Google")));
	}

	#[test]
	fn absolute_paths_are_checked_on_disk() {
		assert!(!is_installed("/definitely/not/a/browser"));
	}
}
