//! Bounded retry with in-place recovery for flaky scripted interactions.
//!
//! A unit of work is attempted under a wall-clock timeout. Transient
//! failures are recovered by [`RetryableUnit::reset`] first, escalating to
//! [`RetryableUnit::recover`] when the reset itself fails. A timeout earns one
//! extra in-attempt try after a reset before it counts as a failure. Once
//! `max_attempts` is spent the unit is abandoned; the caller moves on.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RetryConfig;
use crate::error::{LaunchError, RelayError};

/// Failure of one attempt, classified for the retry loop.
#[derive(Debug, Clone, Error)]
pub enum UnitError {
	/// Worth retrying: stale references, navigation races, reset connections.
	#[error("{0}")]
	Transient(String),
	/// Retrying cannot help; the unit is abandoned immediately.
	#[error("{0}")]
	Permanent(String),
}

impl UnitError {
	pub fn transient(message: impl Into<String>) -> Self {
		UnitError::Transient(message.into())
	}

	pub fn permanent(message: impl Into<String>) -> Self {
		UnitError::Permanent(message.into())
	}

	pub fn is_permanent(&self) -> bool {
		matches!(self, UnitError::Permanent(_))
	}
}

impl From<RelayError> for UnitError {
	fn from(err: RelayError) -> Self {
		match err {
			RelayError::Config(_) | RelayError::InstanceRunning { .. } | RelayError::Launch(LaunchError::AlreadyRunning { .. }) => {
				UnitError::Permanent(err.to_string())
			}
			other => UnitError::Transient(other.to_string()),
		}
	}
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
	pub max_attempts: u32,
	pub cooldown: Duration,
	pub unit_timeout: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self::from(&RetryConfig::default())
	}
}

impl From<&RetryConfig> for RetryPolicy {
	fn from(config: &RetryConfig) -> Self {
		Self {
			max_attempts: config.max_attempts.max(1),
			cooldown: Duration::from_millis(config.cooldown_ms),
			unit_timeout: Duration::from_millis(config.unit_timeout_ms),
		}
	}
}

/// Attempt counter scoped to a single `run_with_retry` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
	pub attempts: u32,
	pub max_attempts: u32,
}

impl RetryState {
	fn new(max_attempts: u32) -> Self {
		Self { attempts: 0, max_attempts }
	}

	fn begin(&mut self) -> u32 {
		self.attempts += 1;
		self.attempts
	}

	fn exhausted(&self) -> bool {
		self.attempts >= self.max_attempts
	}
}

#[derive(Debug)]
pub enum RetryOutcome<T> {
	Completed { value: T, attempts: u32 },
	Abandoned { attempts: u32, last_error: UnitError },
}

impl<T> RetryOutcome<T> {
	pub fn is_completed(&self) -> bool {
		matches!(self, RetryOutcome::Completed { .. })
	}

	pub fn attempts(&self) -> u32 {
		match self {
			RetryOutcome::Completed { attempts, .. } | RetryOutcome::Abandoned { attempts, .. } => *attempts,
		}
	}

	pub fn into_value(self) -> Option<T> {
		match self {
			RetryOutcome::Completed { value, .. } => Some(value),
			RetryOutcome::Abandoned { .. } => None,
		}
	}
}

#[async_trait]
pub trait RetryableUnit: Send {
	type Output: Send;

	/// Short description used in logs.
	fn label(&self) -> String;

	async fn attempt(&mut self) -> Result<Self::Output, UnitError>;

	/// In-place state reset, e.g. navigate away and back.
	async fn reset(&mut self) -> Result<(), UnitError> {
		Ok(())
	}

	/// Heavy recovery, e.g. tear down and relaunch the session.
	async fn recover(&mut self) -> Result<(), UnitError> {
		Ok(())
	}
}

enum AttemptResult<T> {
	Done(T),
	Failed(UnitError),
}

/// Runs `unit` until it succeeds, fails permanently, or exhausts the policy.
pub async fn run_with_retry<U: RetryableUnit>(policy: &RetryPolicy, unit: &mut U) -> RetryOutcome<U::Output> {
	let label = unit.label();
	let mut state = RetryState::new(policy.max_attempts.max(1));

	loop {
		let attempt = state.begin();
		debug!(target = "relay.retry", unit = %label, attempt, max = state.max_attempts, "starting attempt");

		let error = match timed_attempt(policy, unit, &label).await {
			AttemptResult::Done(value) => {
				if attempt > 1 {
					info!(target = "relay.retry", unit = %label, attempt, "succeeded after retry");
				}
				return RetryOutcome::Completed { value, attempts: attempt };
			}
			AttemptResult::Failed(error) => error,
		};

		if error.is_permanent() {
			warn!(target = "relay.retry", unit = %label, attempt, error = %error, "permanent failure; abandoning");
			return RetryOutcome::Abandoned {
				attempts: attempt,
				last_error: error,
			};
		}

		if state.exhausted() {
			warn!(target = "relay.retry", unit = %label, attempts = attempt, error = %error, "retries exhausted; abandoning");
			return RetryOutcome::Abandoned {
				attempts: attempt,
				last_error: error,
			};
		}

		warn!(target = "relay.retry", unit = %label, attempt, max = state.max_attempts, error = %error, "attempt failed; retrying");
		tokio::time::sleep(policy.cooldown).await;
	}
}

/// One counted attempt: run, and on timeout reset and run once more.
///
/// Recovery for the next attempt happens here so the cooldown follows it.
async fn timed_attempt<U: RetryableUnit>(policy: &RetryPolicy, unit: &mut U, label: &str) -> AttemptResult<U::Output> {
	match tokio::time::timeout(policy.unit_timeout, unit.attempt()).await {
		Ok(Ok(value)) => return AttemptResult::Done(value),
		Ok(Err(error)) => {
			if !error.is_permanent() {
				recover(unit, label, false).await;
			}
			return AttemptResult::Failed(error);
		}
		Err(_) => {
			warn!(target = "relay.retry", unit = %label, timeout_ms = policy.unit_timeout.as_millis() as u64, "attempt timed out; resetting in place");
		}
	}

	if let Err(error) = unit.reset().await {
		warn!(target = "relay.retry", unit = %label, error = %error, "reset after timeout failed");
		recover(unit, label, true).await;
		return AttemptResult::Failed(UnitError::transient(format!("timed out; reset failed: {error}")));
	}

	match tokio::time::timeout(policy.unit_timeout, unit.attempt()).await {
		Ok(Ok(value)) => AttemptResult::Done(value),
		Ok(Err(error)) => {
			if !error.is_permanent() {
				recover(unit, label, true).await;
			}
			AttemptResult::Failed(error)
		}
		Err(_) => {
			recover(unit, label, true).await;
			AttemptResult::Failed(UnitError::transient(format!(
				"timed out twice after {}ms",
				policy.unit_timeout.as_millis()
			)))
		}
	}
}

/// Soft reset first unless it was already spent, then full recovery.
async fn recover<U: RetryableUnit>(unit: &mut U, label: &str, skip_reset: bool) {
	if !skip_reset {
		match unit.reset().await {
			Ok(()) => return,
			Err(error) => warn!(target = "relay.retry", unit = %label, error = %error, "reset failed; escalating to recovery"),
		}
	}

	if let Err(error) = unit.recover().await {
		warn!(target = "relay.retry", unit = %label, error = %error, "recovery failed");
	}
}
