use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::json;
use tempfile::TempDir;

const DEAD_PID: u32 = 999_999_999;

fn relay_binary() -> PathBuf {
	PathBuf::from(env!("CARGO_BIN_EXE_relay"))
}

/// Writes a config rooted in `dir` and returns its path.
fn write_config(dir: &Path) -> PathBuf {
	let path = dir.join("config.json");
	let config = json!({
		"state_dir": dir.join("state"),
		"workflows": [
			{ "owner": "scrape", "preferred_port": 9222, "lock_tag": "collector_running", "defer_while": ["threads_running"] },
			{ "owner": "post", "preferred_port": 9333, "lock_tag": "threads_running" }
		]
	});
	std::fs::write(&path, config.to_string()).expect("config should be written");
	path
}

fn run_relay(config: &Path, args: &[&str]) -> (bool, serde_json::Value, String) {
	let output = Command::new(relay_binary())
		.arg("--config")
		.arg(config)
		.args(["--format", "json"])
		.args(args)
		.env_remove("RUST_LOG")
		.output()
		.expect("failed to execute relay");

	let stdout = String::from_utf8_lossy(&output.stdout).to_string();
	let stderr = String::from_utf8_lossy(&output.stderr).to_string();
	let parsed = serde_json::from_str(&stdout).unwrap_or_else(|_| json!({ "raw": stdout }));
	(output.status.success(), parsed, stderr)
}

#[test]
fn sessions_list_reports_rows_with_liveness() {
	let tmp = TempDir::new().expect("temp dir should be created");
	let config = write_config(tmp.path());
	std::fs::create_dir_all(tmp.path().join("state")).unwrap();
	std::fs::write(
		tmp.path().join("state/state.json"),
		json!({
			"schema": 1,
			"sessions": [{ "owner": "scrape", "pid": DEAD_PID, "port": 9222, "started_at": 1_700_000_000 }]
		})
		.to_string(),
	)
	.unwrap();

	let (success, json, stderr) = run_relay(&config, &["sessions", "list"]);
	assert!(success, "sessions list failed: {stderr}");
	assert_eq!(json["ok"], true);
	assert_eq!(json["command"], "sessions list");
	assert_eq!(json["data"][0]["owner"], "scrape");
	assert_eq!(json["data"][0]["alive"], false);
}

#[test]
fn sessions_list_is_empty_without_state_file() {
	let tmp = TempDir::new().expect("temp dir should be created");
	let config = write_config(tmp.path());

	let (success, json, stderr) = run_relay(&config, &["sessions", "list"]);
	assert!(success, "sessions list failed: {stderr}");
	assert_eq!(json["data"], json!([]));
}

#[test]
fn kill_all_clears_dead_rows() {
	let tmp = TempDir::new().expect("temp dir should be created");
	let config = write_config(tmp.path());
	std::fs::create_dir_all(tmp.path().join("state")).unwrap();
	std::fs::write(
		tmp.path().join("state/state.json"),
		json!({ "schema": 1, "sessions": [{ "owner": "post", "pid": DEAD_PID, "port": 9333, "started_at": 0 }] }).to_string(),
	)
	.unwrap();

	let (success, json, stderr) = run_relay(&config, &["sessions", "kill-all"]);
	assert!(success, "kill-all failed: {stderr}");
	assert_eq!(json["data"]["already_gone"], 1);

	let (_, json, _) = run_relay(&config, &["sessions", "list"]);
	assert_eq!(json["data"], json!([]));
}

#[test]
fn lock_status_covers_workflow_tags_and_release_clears_flag() {
	let tmp = TempDir::new().expect("temp dir should be created");
	let config = write_config(tmp.path());
	let locks = tmp.path().join("state/locks");
	std::fs::create_dir_all(&locks).unwrap();
	std::fs::write(locks.join("threads_running.lock"), "1700000000 pid=1").unwrap();

	let (success, json, stderr) = run_relay(&config, &["lock", "status"]);
	assert!(success, "lock status failed: {stderr}");
	let statuses = json["data"].as_array().expect("status list");
	let tags: Vec<&str> = statuses.iter().filter_map(|status| status["tag"].as_str()).collect();
	assert_eq!(tags, ["collector_running", "threads_running"]);
	assert_eq!(statuses[1]["busy"], true);
	assert_eq!(statuses[0]["busy"], false);

	let (success, json, _) = run_relay(&config, &["lock", "release", "threads_running"]);
	assert!(success);
	assert_eq!(json["data"]["removed"], true);
	assert!(!locks.join("threads_running.lock").exists());
}

#[test]
fn port_reports_free_preferred_port() {
	let tmp = TempDir::new().expect("temp dir should be created");
	let config = write_config(tmp.path());
	let preferred = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();

	let (success, json, stderr) = run_relay(&config, &["port", &preferred.to_string()]);
	assert!(success, "port failed: {stderr}");
	assert_eq!(json["data"]["port"], preferred);
	assert_eq!(json["data"]["fallback"], false);
}

#[test]
fn missing_explicit_config_fails_with_config_error() {
	let tmp = TempDir::new().expect("temp dir should be created");

	let (success, json, _) = run_relay(&tmp.path().join("absent.json"), &["sessions", "list"]);
	assert!(!success);
	assert_eq!(json["ok"], false);
	assert_eq!(json["error"]["code"], "CONFIG_ERROR");
}
