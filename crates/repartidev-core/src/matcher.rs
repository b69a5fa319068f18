//! Backlog filtering for deliverers.
//!
//! The matcher decides which pending orders a deliverer gets to see and in
//! what order. Visibility is deliberately looser than claim-time permission:
//! unless strict matching is configured, orders from other condominiums are
//! listed and only rejected when the deliverer tries to accept them.
//!
//! It also lists the deliverers of a condominium who could take an order,
//! which is what an admin picks from when assigning.

use crate::permissions::PermissionEngine;
use repartidev_types::{
	AvailableDeliverer, DelivererStatistics, DepartmentRef, Order, OrderFilters, OrderStatus,
	User, UserProfile,
};
use uuid::Uuid;

/// Score given to orders outside the deliverer's condominium.
const UNRELATED: u32 = u32::MAX;

/// Base score for a department in another tower of the same condominium.
const OTHER_TOWER_BASE: u32 = 100;

/// Filters the order backlog into the subset a deliverer may claim.
#[derive(Debug, Clone, Copy, Default)]
pub struct AvailabilityMatcher {
	strict_condominium: bool,
}

impl AvailabilityMatcher {
	pub fn new(strict_condominium: bool) -> Self {
		Self { strict_condominium }
	}

	/// Rejects filters whose amount range is empty.
	pub fn validate_filters(filters: &OrderFilters) -> Result<(), String> {
		match (filters.min_amount, filters.max_amount) {
			(Some(min), Some(max)) if min > max => Err(format!(
				"min_amount {} is greater than max_amount {}",
				min, max
			)),
			_ => Ok(()),
		}
	}

	/// Distance between two departments. Lower is closer.
	///
	/// Same tower scores the floor difference, another tower of the same
	/// condominium scores 100 plus the floor difference, and anything else
	/// sorts last.
	pub fn proximity_score(from: Option<&DepartmentRef>, to: &DepartmentRef) -> u32 {
		let Some(from) = from else {
			return UNRELATED;
		};
		if from.condominium_id != to.condominium_id {
			return UNRELATED;
		}
		let floors = from.floor.abs_diff(to.floor);
		if from.tower == to.tower {
			floors
		} else {
			OTHER_TOWER_BASE.saturating_add(floors)
		}
	}

	fn matches(&self, actor: &User, order: &Order, filters: &OrderFilters) -> bool {
		if order.status != OrderStatus::Pending {
			return false;
		}
		if self.strict_condominium {
			if let Some(condominium) = actor.condominium_id() {
				if order.condominium_id() != condominium {
					return false;
				}
			}
		}
		if filters
			.condominium
			.is_some_and(|condominium| order.condominium_id() != condominium)
		{
			return false;
		}
		if filters
			.is_immediate
			.is_some_and(|immediate| order.is_immediate != immediate)
		{
			return false;
		}
		if filters.min_amount.is_some_and(|min| order.amount < min) {
			return false;
		}
		if filters.max_amount.is_some_and(|max| order.amount > max) {
			return false;
		}
		true
	}

	/// Returns the pending orders `actor` may see, nearest first.
	///
	/// Ties on proximity fall back to the scheduled date, then creation time.
	pub fn visible_orders(
		&self,
		actor: &User,
		orders: Vec<Order>,
		filters: &OrderFilters,
	) -> Vec<Order> {
		let home = actor.department.as_ref();
		let mut visible: Vec<(u32, Order)> = orders
			.into_iter()
			.filter(|order| self.matches(actor, order, filters))
			.map(|order| {
				(
					Self::proximity_score(home, &order.receiver_department),
					order,
				)
			})
			.collect();

		visible.sort_by(|(a_score, a), (b_score, b)| {
			a_score
				.cmp(b_score)
				.then(a.scheduled_date.cmp(&b.scheduled_date))
				.then(a.created_at.cmp(&b.created_at))
		});
		visible.into_iter().map(|(_, order)| order).collect()
	}

	/// Deliverers living in `condominium_id` who switched availability on,
	/// other than `exclude`. Best rated first, then most completed orders.
	pub fn available_deliverers(
		users: &[User],
		orders: &[Order],
		condominium_id: Uuid,
		exclude: Uuid,
		max_active_orders: usize,
	) -> Vec<AvailableDeliverer> {
		let mut deliverers: Vec<AvailableDeliverer> = users
			.iter()
			.filter(|user| {
				user.id != exclude
					&& PermissionEngine::is_available(user)
					&& user.condominium_id() == Some(condominium_id)
			})
			.map(|user| {
				let completed_orders = orders
					.iter()
					.filter(|o| o.deliverer_id == Some(user.id) && o.status == OrderStatus::Completed)
					.count();
				AvailableDeliverer {
					profile: UserProfile::from(user),
					statistics: DelivererStatistics {
						completed_orders,
						average_rating: (user.rating_average * 100.0).round() / 100.0,
						is_currently_available: (user.active_orders as usize) < max_active_orders,
					},
				}
			})
			.collect();

		deliverers.sort_by(|a, b| {
			b.statistics
				.average_rating
				.total_cmp(&a.statistics.average_rating)
				.then(b.statistics.completed_orders.cmp(&a.statistics.completed_orders))
		});
		deliverers
	}
}
