//! Clock abstraction for timestamping transitions.
//!
//! Engine operations read the current time through [`Clock`] so tests can
//! pin "now" instead of racing the wall clock.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

/// Source of the current time.
pub trait Clock: Send + Sync {
	/// Returns the current instant in UTC.
	fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
	fn now(&self) -> DateTime<Utc> {
		Utc::now()
	}
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
	now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
	/// Creates a clock frozen at `now`.
	pub fn new(now: DateTime<Utc>) -> Self {
		Self {
			now: Mutex::new(now),
		}
	}

	/// Moves the clock to `now`.
	pub fn set(&self, now: DateTime<Utc>) {
		if let Ok(mut guard) = self.now.lock() {
			*guard = now;
		}
	}

	/// Moves the clock forward by `delta`.
	pub fn advance(&self, delta: Duration) {
		if let Ok(mut guard) = self.now.lock() {
			*guard += delta;
		}
	}
}

impl Clock for ManualClock {
	fn now(&self) -> DateTime<Utc> {
		match self.now.lock() {
			Ok(guard) => *guard,
			Err(poisoned) => *poisoned.into_inner(),
		}
	}
}
