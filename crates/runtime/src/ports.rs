//! Remote-debugging port selection with deterministic fallbacks.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::process::port_available;

/// Distance between consecutive fallback candidates.
pub const DEFAULT_FALLBACK_STEP: u16 = 10;
/// Number of fallback candidates probed after the preferred port.
pub const DEFAULT_FALLBACK_COUNT: u16 = 10;

#[derive(Debug, Error)]
pub enum AllocationError {
	#[error("no free port for preferred {preferred}; occupied: {tried:?}")]
	Exhausted { preferred: u16, tried: Vec<u16> },
}

type Probe = Arc<dyn Fn(u16) -> bool + Send + Sync>;

/// Stateless allocator probing `preferred`, then `preferred + step * k`.
///
/// Two callers may observe the same port as free; the loser fails to bind
/// later and goes through normal launch retry.
#[derive(Clone)]
pub struct PortAllocator {
	step: u16,
	count: u16,
	probe: Probe,
}

impl fmt::Debug for PortAllocator {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("PortAllocator").field("step", &self.step).field("count", &self.count).finish_non_exhaustive()
	}
}

impl Default for PortAllocator {
	fn default() -> Self {
		Self::new()
	}
}

impl PortAllocator {
	pub fn new() -> Self {
		Self {
			step: DEFAULT_FALLBACK_STEP,
			count: DEFAULT_FALLBACK_COUNT,
			probe: Arc::new(port_available),
		}
	}

	pub fn with_fallbacks(mut self, step: u16, count: u16) -> Self {
		self.step = step.max(1);
		self.count = count;
		self
	}

	/// Replaces the bind probe; `probe(port)` returns `true` when the port is free.
	pub fn with_probe(mut self, probe: impl Fn(u16) -> bool + Send + Sync + 'static) -> Self {
		self.probe = Arc::new(probe);
		self
	}

	/// Preferred port followed by every in-range fallback, in probe order.
	pub fn candidates(&self, preferred: u16) -> Vec<u16> {
		std::iter::once(Some(preferred))
			.chain((1..=self.count).map(|k| self.step.checked_mul(k).and_then(|offset| preferred.checked_add(offset))))
			.flatten()
			.collect()
	}

	pub fn allocate(&self, preferred: u16) -> Result<u16, AllocationError> {
		let mut tried = Vec::new();
		for port in self.candidates(preferred) {
			if (self.probe)(port) {
				if port != preferred {
					debug!(target = "relay.ports", preferred, port, "preferred port busy; using fallback");
				}
				return Ok(port);
			}
			tried.push(port);
		}
		Err(AllocationError::Exhausted { preferred, tried })
	}
}
