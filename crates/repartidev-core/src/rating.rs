//! Incremental rating averages for deliverers.

use repartidev_types::{RatingBreakdown, Review, User};
use std::collections::BTreeMap;

/// Lowest accepted rating.
pub const MIN_RATING: i64 = 1;
/// Highest accepted rating.
pub const MAX_RATING: i64 = 5;

/// Folds new ratings into a user's running average.
pub struct RatingAggregator;

impl RatingAggregator {
	/// Checks that `rating` lies in `1..=5`.
	pub fn validate(rating: i64) -> Result<u8, String> {
		if (MIN_RATING..=MAX_RATING).contains(&rating) {
			Ok(rating as u8)
		} else {
			Err(format!(
				"rating must be between {} and {}, got {}",
				MIN_RATING, MAX_RATING, rating
			))
		}
	}

	/// Returns the average and count after adding one rating.
	pub fn fold(average: f64, count: u32, rating: u8) -> (f64, u32) {
		let new_count = count.saturating_add(1);
		let new_average = (average * f64::from(count) + f64::from(rating)) / f64::from(new_count);
		(new_average, new_count)
	}

	/// Copy of `user` with `rating` folded into its aggregate.
	pub fn rated(user: &User, rating: u8) -> User {
		let (rating_average, rating_count) =
			Self::fold(user.rating_average, user.rating_count, rating);
		User {
			rating_average,
			rating_count,
			..user.clone()
		}
	}

	/// Star distribution and average over a set of reviews.
	pub fn breakdown<'a>(reviews: impl IntoIterator<Item = &'a Review>) -> RatingBreakdown {
		let mut distribution = BTreeMap::new();
		let mut sum = 0u64;
		for review in reviews {
			*distribution.entry(review.rating).or_insert(0usize) += 1;
			sum += u64::from(review.rating);
		}
		let total_reviews: usize = distribution.values().sum();
		let average = if total_reviews == 0 {
			0.0
		} else {
			(sum as f64 / total_reviews as f64 * 100.0).round() / 100.0
		};
		RatingBreakdown {
			average,
			total_reviews,
			distribution,
		}
	}
}
