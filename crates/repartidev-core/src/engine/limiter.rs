//! Per-receiver order creation quota.
//!
//! A sliding one-hour window of creation timestamps is kept per receiver in a
//! concurrent map. Receivers whose window has drained are dropped from the map.
//! The window lives in process memory only; a restart resets every quota.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::VecDeque;
use uuid::Uuid;

/// Sliding-window limiter for order creation.
pub struct CreationLimiter {
	/// Creations allowed per window. Zero disables the limiter.
	limit: u32,
	window: Duration,
	history: DashMap<Uuid, VecDeque<DateTime<Utc>>>,
}

impl CreationLimiter {
	/// Limiter allowing `limit` creations per rolling hour.
	pub fn per_hour(limit: u32) -> Self {
		Self {
			limit,
			window: Duration::hours(1),
			history: DashMap::new(),
		}
	}

	/// Records a creation for `receiver` at `now` if the quota allows it.
	///
	/// On refusal returns the number of seconds until the oldest creation in
	/// the window expires.
	pub fn try_acquire(&self, receiver: Uuid, now: DateTime<Utc>) -> Result<(), u64> {
		if self.limit == 0 {
			return Ok(());
		}

		let cutoff = now - self.window;
		self.history.retain(|_, stamps| {
			while stamps.front().is_some_and(|at| *at <= cutoff) {
				stamps.pop_front();
			}
			!stamps.is_empty()
		});

		let mut stamps = self.history.entry(receiver).or_default();

		if stamps.len() >= self.limit as usize {
			let retry_after = stamps
				.front()
				.map(|oldest| (*oldest + self.window - now).num_seconds().max(1) as u64)
				.unwrap_or(1);
			return Err(retry_after);
		}

		stamps.push_back(now);
		Ok(())
	}

	/// Gives back a creation recorded at `at` whose order never got stored.
	pub fn release(&self, receiver: Uuid, at: DateTime<Utc>) {
		if let Some(mut stamps) = self.history.get_mut(&receiver) {
			if let Some(pos) = stamps.iter().rposition(|stamp| *stamp == at) {
				stamps.remove(pos);
			}
		}
		self.history.remove_if(&receiver, |_, stamps| stamps.is_empty());
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::TimeZone;

	#[test]
	fn test_quota_refills_after_window() {
		let limiter = CreationLimiter::per_hour(2);
		let receiver = Uuid::new_v4();
		let start = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();

		assert!(limiter.try_acquire(receiver, start).is_ok());
		assert!(limiter
			.try_acquire(receiver, start + Duration::minutes(10))
			.is_ok());
		assert_eq!(
			limiter.try_acquire(receiver, start + Duration::minutes(20)),
			Err(40 * 60)
		);
		// Another receiver has its own quota.
		assert!(limiter
			.try_acquire(Uuid::new_v4(), start + Duration::minutes(20))
			.is_ok());

		assert!(limiter
			.try_acquire(receiver, start + Duration::minutes(61))
			.is_ok());
	}

	#[test]
	fn test_release_returns_the_slot() {
		let limiter = CreationLimiter::per_hour(1);
		let receiver = Uuid::new_v4();
		let now = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();

		assert!(limiter.try_acquire(receiver, now).is_ok());
		assert!(limiter.try_acquire(receiver, now).is_err());

		limiter.release(receiver, now);
		assert!(limiter.history.get(&receiver).is_none());
		assert!(limiter.try_acquire(receiver, now).is_ok());
	}

	#[test]
	fn test_drained_receivers_are_evicted() {
		let limiter = CreationLimiter::per_hour(5);
		let start = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
		for _ in 0..20 {
			limiter.try_acquire(Uuid::new_v4(), start).unwrap();
		}
		assert_eq!(limiter.history.len(), 20);

		let later = Uuid::new_v4();
		limiter
			.try_acquire(later, start + Duration::minutes(61))
			.unwrap();
		assert_eq!(limiter.history.len(), 1);
		assert!(limiter.history.contains_key(&later));
	}

	#[test]
	fn test_zero_limit_disables_quota() {
		let limiter = CreationLimiter::per_hour(0);
		let receiver = Uuid::new_v4();
		let now = Utc::now();
		for _ in 0..50 {
			assert!(limiter.try_acquire(receiver, now).is_ok());
		}
	}
}
