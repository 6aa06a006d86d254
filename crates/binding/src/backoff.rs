//! Rebind backoff policy.

use std::time::Duration;

/// First delay before an automatic rebind.
pub const REBIND_INITIAL_DELAY: Duration = Duration::from_secs(2);
/// Multiplier applied after each scheduled rebind.
pub const REBIND_GROWTH_FACTOR: u32 = 2;
/// Ceiling for the rebind delay.
pub const REBIND_MAX_DELAY: Duration = Duration::from_secs(60);

/// Monotonically non-decreasing, capped delay sequence for automatic rebinds
/// after unexpected connection loss.
///
/// Resets to the initial delay when the next successful explicit bind reaches
/// the connected state.
#[derive(Debug, Clone)]
pub struct RebindBackoff {
	next: Duration,
}

impl RebindBackoff {
	/// Backoff positioned at the initial delay.
	pub fn new() -> Self {
		Self {
			next: REBIND_INITIAL_DELAY,
		}
	}

	/// Consume and return the current delay, advancing the sequence.
	pub fn next_delay(&mut self) -> Duration {
		let delay = self.next;
		self.next = (delay * REBIND_GROWTH_FACTOR).min(REBIND_MAX_DELAY);
		delay
	}

	/// Reset to the initial delay.
	pub fn reset(&mut self) {
		self.next = REBIND_INITIAL_DELAY;
	}
}

impl Default for RebindBackoff {
	fn default() -> Self {
		Self::new()
	}
}
