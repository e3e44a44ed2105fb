//! Configuration loaded from `config.json`.
//!
//! Every field has a default so a missing or partial file yields a working
//! setup with the stock `scrape` and `post` workflows.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::lock::validate_tag;

pub const CONFIG_FILE: &str = "config.json";
const STATE_DIR_NAME: &str = "relay";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
	/// Root for profiles, lock files, the state file and the pid file.
	pub state_dir: Option<PathBuf>,
	pub scheduler: SchedulerConfig,
	pub ports: PortsConfig,
	pub browser: BrowserConfig,
	pub retry: RetryConfig,
	pub lock: LockConfig,
	pub queue: QueueConfig,
	pub generator: Option<GeneratorConfig>,
	pub workflows: WorkflowsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
	pub poll_interval_ms: u64,
	pub error_backoff_ms: u64,
	/// How long shutdown waits for dispatched jobs before aborting them.
	pub drain_timeout_ms: u64,
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		Self {
			poll_interval_ms: 5_000,
			error_backoff_ms: 30_000,
			drain_timeout_ms: 600_000,
		}
	}
}

impl SchedulerConfig {
	pub fn poll_interval(&self) -> Duration {
		Duration::from_millis(self.poll_interval_ms)
	}

	pub fn error_backoff(&self) -> Duration {
		Duration::from_millis(self.error_backoff_ms)
	}

	pub fn drain_timeout(&self) -> Duration {
		Duration::from_millis(self.drain_timeout_ms)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
	pub fallback_step: u16,
	pub fallback_count: u16,
}

impl Default for PortsConfig {
	fn default() -> Self {
		Self {
			fallback_step: relay_runtime::ports::DEFAULT_FALLBACK_STEP,
			fallback_count: relay_runtime::ports::DEFAULT_FALLBACK_COUNT,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
	/// Explicit executable; discovered from well-known locations when unset.
	pub binary: Option<String>,
	pub headless: bool,
	pub extra_args: Vec<String>,
	pub ready_timeout_ms: u64,
	/// Extra wait after the port opens, before attaching.
	pub settle_ms: u64,
	pub terminate_grace_ms: u64,
	pub close_timeout_ms: u64,
}

impl Default for BrowserConfig {
	fn default() -> Self {
		Self {
			binary: None,
			headless: false,
			extra_args: Vec::new(),
			ready_timeout_ms: 30_000,
			settle_ms: 2_000,
			terminate_grace_ms: 3_000,
			close_timeout_ms: 5_000,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
	pub max_attempts: u32,
	pub cooldown_ms: u64,
	pub unit_timeout_ms: u64,
}

impl Default for RetryConfig {
	fn default() -> Self {
		Self {
			max_attempts: 3,
			cooldown_ms: 5_000,
			unit_timeout_ms: 40_000,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
	pub stale_after_secs: u64,
}

impl Default for LockConfig {
	fn default() -> Self {
		Self { stale_after_secs: 300 }
	}
}

impl LockConfig {
	pub fn stale_after(&self) -> Duration {
		Duration::from_secs(self.stale_after_secs)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
	pub idle_poll_ms: u64,
	/// Pause between generation requests to stay under provider rate limits.
	pub item_pause_ms: u64,
}

impl Default for QueueConfig {
	fn default() -> Self {
		Self {
			idle_poll_ms: 1_000,
			item_pause_ms: 500,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
	/// OpenAI-compatible chat completions URL.
	pub endpoint: String,
	pub model: String,
	pub api_key_env: String,
	pub system_prompt: String,
	pub max_tokens: u32,
	pub timeout_ms: u64,
}

impl Default for GeneratorConfig {
	fn default() -> Self {
		Self {
			endpoint: "https://api.perplexity.ai/chat/completions".to_string(),
			model: "sonar".to_string(),
			api_key_env: "RELAY_GENERATOR_API_KEY".to_string(),
			system_prompt: "Summarize the news headline in about 500 characters for a social post.".to_string(),
			max_tokens: 1_000,
			timeout_ms: 60_000,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowsConfig(pub Vec<WorkflowConfig>);

impl Default for WorkflowsConfig {
	fn default() -> Self {
		Self(vec![
			WorkflowConfig {
				owner: "scrape".to_string(),
				preferred_port: 9222,
				lock_tag: "collector_running".to_string(),
				generate: true,
				defer_while: vec!["threads_running".to_string()],
				..WorkflowConfig::default()
			},
			WorkflowConfig {
				owner: "post".to_string(),
				preferred_port: 9333,
				lock_tag: "threads_running".to_string(),
				..WorkflowConfig::default()
			},
		])
	}
}

/// One recurring workflow bound to an owner tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
	pub owner: String,
	pub preferred_port: u16,
	pub interval_secs: u64,
	pub lock_tag: String,
	/// Page the session returns to when its state is reset.
	pub home_url: String,
	pub targets: Vec<String>,
	/// Expression evaluated on each target; must yield `[{title, category, target?}]`.
	pub extract_script: String,
	/// Forward extracted items to the generation queue.
	pub generate: bool,
	/// Lock tags that, while busy, postpone this workflow by `defer_secs`.
	pub defer_while: Vec<String>,
	pub defer_secs: u64,
	pub enabled: bool,
}

impl Default for WorkflowConfig {
	fn default() -> Self {
		Self {
			owner: String::new(),
			preferred_port: 9222,
			interval_secs: 3_600,
			lock_tag: String::new(),
			home_url: "about:blank".to_string(),
			targets: Vec::new(),
			extract_script: "[]".to_string(),
			generate: false,
			defer_while: Vec::new(),
			defer_secs: 300,
			enabled: true,
		}
	}
}

impl WorkflowConfig {
	pub fn interval(&self) -> Duration {
		Duration::from_secs(self.interval_secs.max(1))
	}

	pub fn defer_delay(&self) -> Duration {
		Duration::from_secs(self.defer_secs.max(1))
	}
}

impl RelayConfig {
	/// Loads `path`, or the default location when `path` is `None`.
	///
	/// A missing default file yields [`RelayConfig::default`]; a missing
	/// explicit file is an error.
	pub fn load(path: Option<&Path>) -> Result<Self> {
		let (path, required) = match path {
			Some(path) => (path.to_path_buf(), true),
			None => match default_config_path() {
				Some(path) => (path, false),
				None => return Ok(Self::default()),
			},
		};

		let content = match std::fs::read_to_string(&path) {
			Ok(content) => content,
			Err(err) if !required && err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
			Err(source) => return Err(RelayError::ConfigRead { path, source }),
		};

		let config: Self = serde_json::from_str(&content)?;
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<()> {
		if self.retry.max_attempts == 0 {
			return Err(RelayError::Config("retry.max_attempts must be at least 1".into()));
		}

		let mut owners = HashSet::new();
		for workflow in &self.workflows.0 {
			if workflow.owner.trim().is_empty() {
				return Err(RelayError::Config("workflow owner must not be empty".into()));
			}
			if !owners.insert(workflow.owner.as_str()) {
				return Err(RelayError::Config(format!("duplicate workflow owner '{}'", workflow.owner)));
			}
			if !workflow.lock_tag.is_empty() {
				validate_tag(&workflow.lock_tag)?;
			}
			for tag in &workflow.defer_while {
				validate_tag(tag)?;
			}
		}
		Ok(())
	}

	pub fn state_dir(&self) -> PathBuf {
		self.state_dir.clone().unwrap_or_else(|| {
			dirs::data_local_dir()
				.unwrap_or_else(std::env::temp_dir)
				.join(STATE_DIR_NAME)
		})
	}

	pub fn profiles_dir(&self) -> PathBuf {
		self.state_dir().join("profiles")
	}

	pub fn locks_dir(&self) -> PathBuf {
		self.state_dir().join("locks")
	}

	pub fn state_file(&self) -> PathBuf {
		self.state_dir().join("state.json")
	}

	pub fn pid_file(&self) -> PathBuf {
		self.state_dir().join("relay.pid")
	}

	pub fn workflow(&self, owner: &str) -> Option<&WorkflowConfig> {
		self.workflows.0.iter().find(|workflow| workflow.owner == owner)
	}
}

fn default_config_path() -> Option<PathBuf> {
	dirs::config_dir().map(|dir| dir.join(STATE_DIR_NAME).join(CONFIG_FILE))
}
