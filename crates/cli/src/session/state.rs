//! Session lifecycle states and allowed transitions.
//!
//! ```text
//! Unlaunched -> Launching -> Ready <-> Busy
//!                   |          |        |
//!                   +----------+--------+--> Terminating -> Gone
//! ```

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
	Unlaunched,
	Launching,
	Ready,
	Busy,
	Terminating,
	Gone,
}

impl SessionState {
	pub fn can_transition_to(self, next: SessionState) -> bool {
		use SessionState::*;

		matches!(
			(self, next),
			(Unlaunched, Launching)
				| (Launching, Ready)
				| (Ready, Busy)
				| (Busy, Ready)
				| (Launching | Ready | Busy, Terminating)
				| (Terminating, Gone)
		)
	}

	pub fn is_live(self) -> bool {
		matches!(self, SessionState::Ready | SessionState::Busy)
	}
}

#[cfg(test)]
mod tests {
	use super::SessionState::*;

	#[test]
	fn happy_path_is_allowed() {
		let path = [Unlaunched, Launching, Ready, Busy, Ready, Terminating, Gone];
		for pair in path.windows(2) {
			assert!(pair[0].can_transition_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
		}
	}

	#[test]
	fn busy_failure_never_shortcuts_to_gone() {
		assert!(!Busy.can_transition_to(Gone));
		assert!(Busy.can_transition_to(Terminating));
	}

	#[test]
	fn gone_is_terminal() {
		for next in [Unlaunched, Launching, Ready, Busy, Terminating, Gone] {
			assert!(!Gone.can_transition_to(next));
		}
	}
}
