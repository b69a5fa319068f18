//! Rolling-window earnings statistics.
//!
//! Orders are bucketed by the time they reached their current status:
//! `completed_at` for delivered orders, `updated_at` for everything else.
//! Windows are anchored at a caller-supplied instant so reports are
//! reproducible.

use chrono::{DateTime, Duration, FixedOffset, Offset, Utc};
use repartidev_types::{
	DelivererRanking, EarningsSummary, Order, OrderStatus, RatingBreakdown, User, WindowStats,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::permissions::PermissionEngine;

const WEEK_DAYS: i64 = 7;
const MONTH_DAYS: i64 = 30;

/// Computes earnings windows, goal progress and deliverer rankings.
#[derive(Debug, Clone)]
pub struct EarningsAggregator {
	offset: FixedOffset,
	monthly_goal: Decimal,
}

impl EarningsAggregator {
	/// An out-of-range offset falls back to UTC.
	pub fn new(utc_offset_minutes: i32, monthly_goal: Decimal) -> Self {
		let offset = utc_offset_minutes
			.checked_mul(60)
			.and_then(FixedOffset::east_opt)
			.unwrap_or_else(|| Utc.fix());
		Self {
			offset,
			monthly_goal,
		}
	}

	/// Instant an order entered its current status.
	fn window_timestamp(order: &Order) -> DateTime<Utc> {
		order.completed_at.unwrap_or(order.updated_at)
	}

	/// Statistics over the given orders.
	pub fn window_stats<'a>(orders: impl IntoIterator<Item = &'a Order>) -> WindowStats {
		let mut earnings = Decimal::ZERO;
		let mut total_count = 0usize;
		let mut completed_count = 0usize;
		let mut delivery_minutes = 0.0f64;

		for order in orders {
			total_count += 1;
			if order.status != OrderStatus::Completed {
				continue;
			}
			completed_count += 1;
			earnings += order.amount;
			if let Some(completed_at) = order.completed_at {
				delivery_minutes += (completed_at - order.created_at).num_seconds() as f64 / 60.0;
			}
		}

		let completion_rate = if total_count == 0 {
			0.0
		} else {
			completed_count as f64 / total_count as f64 * 100.0
		};
		let avg_delivery_minutes = if completed_count == 0 {
			0.0
		} else {
			delivery_minutes / completed_count as f64
		};

		WindowStats {
			earnings,
			completed_count,
			total_count,
			completion_rate,
			avg_delivery_minutes,
		}
	}

	fn within_days(order: &Order, now: DateTime<Utc>, days: i64) -> bool {
		let at = Self::window_timestamp(order);
		at >= now - Duration::days(days) && at <= now
	}

	fn is_today(&self, order: &Order, now: DateTime<Utc>) -> bool {
		let at = Self::window_timestamp(order);
		at <= now
			&& at.with_timezone(&self.offset).date_naive()
				== now.with_timezone(&self.offset).date_naive()
	}

	/// Summary for the orders delivered by one deliverer, carrying the
	/// reviews they received alongside.
	pub fn summarize(
		&self,
		orders: &[Order],
		ratings: RatingBreakdown,
		now: DateTime<Utc>,
	) -> EarningsSummary {
		let today = Self::window_stats(orders.iter().filter(|o| self.is_today(o, now)));
		let week = Self::window_stats(
			orders
				.iter()
				.filter(|o| Self::within_days(o, now, WEEK_DAYS)),
		);
		let month = Self::window_stats(
			orders
				.iter()
				.filter(|o| Self::within_days(o, now, MONTH_DAYS)),
		);
		let total: Decimal = orders
			.iter()
			.filter(|o| o.status == OrderStatus::Completed)
			.map(|o| o.amount)
			.sum();

		let progress = if self.monthly_goal > Decimal::ZERO {
			(month.earnings / self.monthly_goal * Decimal::ONE_HUNDRED).min(Decimal::ONE_HUNDRED)
		} else {
			Decimal::ZERO
		};
		let goal_remaining = (self.monthly_goal - month.earnings).max(Decimal::ZERO);

		EarningsSummary {
			completion_rate: month.completion_rate,
			avg_delivery_minutes: month.avg_delivery_minutes,
			today,
			week,
			total,
			monthly_goal: self.monthly_goal,
			goal_progress_percent: progress.to_f64().unwrap_or(0.0),
			goal_remaining,
			month,
			ratings,
		}
	}

	/// Per-deliverer statistics over the month window, most completed first.
	pub fn rankings(users: &[User], orders: &[Order], now: DateTime<Utc>) -> Vec<DelivererRanking> {
		let mut rankings: Vec<DelivererRanking> = users
			.iter()
			.filter(|user| PermissionEngine::can_deliver_orders(user))
			.map(|user| {
				let theirs: Vec<&Order> = orders
					.iter()
					.filter(|o| o.deliverer_id == Some(user.id))
					.filter(|o| Self::within_days(o, now, MONTH_DAYS))
					.collect();
				let stats = Self::window_stats(theirs.iter().copied());
				let cancelled_orders = theirs
					.iter()
					.filter(|o| o.status == OrderStatus::Cancelled)
					.count();
				DelivererRanking {
					user_id: user.id,
					name: user.full_name(),
					email: user.email.clone(),
					total_orders: stats.total_count,
					completed_orders: stats.completed_count,
					cancelled_orders,
					earnings: stats.earnings,
					completion_rate: stats.completion_rate,
					avg_delivery_minutes: stats.avg_delivery_minutes,
					rating_average: user.rating_average,
				}
			})
			.collect();

		rankings.sort_by(|a, b| {
			b.completed_orders
				.cmp(&a.completed_orders)
				.then(b.earnings.cmp(&a.earnings))
				.then(a.name.cmp(&b.name))
		});
		rankings
	}
}
