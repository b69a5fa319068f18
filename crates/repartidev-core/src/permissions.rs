//! Authorization predicates for order actions.
//!
//! Every predicate is a pure function of the values passed in: the acting
//! user, the order, and for completion the direct-completion policy. Callers
//! turn a `false` into a `Forbidden` error naming the predicate that failed,
//! which is why [`Denied`] carries the predicate's canonical name.

use repartidev_types::{Order, OrderStatus, Role, User};
use std::fmt;

/// Name of a predicate that returned `false`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Denied(pub &'static str);

impl fmt::Display for Denied {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.0)
	}
}

/// Stateless permission checks shared by the engine and its transports.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissionEngine {
	allow_direct_completion: bool,
}

impl PermissionEngine {
	pub fn new(allow_direct_completion: bool) -> Self {
		Self {
			allow_direct_completion,
		}
	}

	/// Role permits posting orders.
	pub fn can_receive_orders(actor: &User) -> bool {
		matches!(actor.role, Role::Receiver | Role::ReceiverAndDeliverer)
	}

	/// Role permits delivering orders.
	pub fn can_deliver_orders(actor: &User) -> bool {
		matches!(actor.role, Role::Deliverer | Role::ReceiverAndDeliverer)
	}

	/// Deliverer who has switched availability on.
	pub fn is_available(actor: &User) -> bool {
		Self::can_deliver_orders(actor) && actor.is_available_for_delivery
	}

	/// Claiming a pending order from the open backlog.
	///
	/// The condominium check only applies when both the actor and the order
	/// carry a department; an actor without one passes it.
	pub fn can_accept_order(actor: &User, order: &Order) -> bool {
		if !Self::is_available(actor)
			|| order.status != OrderStatus::Pending
			|| order.receiver_id == actor.id
		{
			return false;
		}
		match actor.condominium_id() {
			Some(condominium) => condominium == order.condominium_id(),
			None => true,
		}
	}

	/// Accepting an order an admin earmarked for this deliverer.
	pub fn can_accept_assigned_order(actor: &User, order: &Order) -> bool {
		Self::is_available(actor)
			&& order.status == OrderStatus::Assigned
			&& order.deliverer_id == Some(actor.id)
	}

	pub fn can_start_order(actor: &User, order: &Order) -> bool {
		order.deliverer_id == Some(actor.id) && order.status == OrderStatus::Accepted
	}

	pub fn can_reject_order(actor: &User, order: &Order) -> bool {
		order.deliverer_id == Some(actor.id)
			&& matches!(order.status, OrderStatus::Assigned | OrderStatus::Accepted)
	}

	/// Receiver withdrawing a pending or accepted order, or the deliverer
	/// dropping an accepted one.
	pub fn can_cancel_order(actor: &User, order: &Order) -> bool {
		let as_receiver = order.receiver_id == actor.id
			&& matches!(order.status, OrderStatus::Pending | OrderStatus::Accepted);
		let as_deliverer =
			order.deliverer_id == Some(actor.id) && order.status == OrderStatus::Accepted;
		as_receiver || as_deliverer
	}

	pub fn can_complete_order(&self, actor: &User, order: &Order) -> bool {
		if order.deliverer_id != Some(actor.id) {
			return false;
		}
		match order.status {
			OrderStatus::InProgress => true,
			OrderStatus::Accepted => self.allow_direct_completion,
			_ => false,
		}
	}

	pub fn can_rate_order(actor: &User, order: &Order) -> bool {
		order.receiver_id == actor.id
			&& order.status == OrderStatus::Completed
			&& order.review_id.is_none()
	}

	pub fn can_assign_orders(actor: &User) -> bool {
		actor.role == Role::Admin
	}

	pub fn can_delete_order(actor: &User, order: &Order) -> bool {
		order.receiver_id == actor.id && order.status == OrderStatus::Pending
	}

	/// The actor is the managed user or an admin.
	pub fn can_manage_user(actor: &User, user: &User) -> bool {
		actor.id == user.id || actor.role == Role::Admin
	}

	/// Creating condominiums and departments.
	pub fn can_manage_directory(actor: &User) -> bool {
		actor.role == Role::Admin
	}

	/// Reading cross-deliverer reports.
	pub fn can_view_reports(actor: &User) -> bool {
		actor.role == Role::Admin
	}

	/// Parties to the order, admins, and deliverers browsing the backlog.
	pub fn can_view_order(actor: &User, order: &Order) -> bool {
		order.receiver_id == actor.id
			|| order.deliverer_id == Some(actor.id)
			|| actor.role == Role::Admin
			|| (order.status == OrderStatus::Pending && Self::can_deliver_orders(actor))
	}

	/// Checks whether `actor` may accept `order`, through either the open
	/// backlog or an assignment.
	pub fn check_accept(actor: &User, order: &Order) -> Result<(), Denied> {
		if order.status == OrderStatus::Assigned {
			ensure(
				Self::can_accept_assigned_order(actor, order),
				"canAcceptAssignedOrder",
			)
		} else {
			ensure(Self::can_accept_order(actor, order), "canAcceptOrder")
		}
	}

	pub fn check_start(actor: &User, order: &Order) -> Result<(), Denied> {
		ensure(Self::can_start_order(actor, order), "canStartOrder")
	}

	pub fn check_reject(actor: &User, order: &Order) -> Result<(), Denied> {
		ensure(Self::can_reject_order(actor, order), "canRejectOrder")
	}

	pub fn check_cancel(actor: &User, order: &Order) -> Result<(), Denied> {
		ensure(Self::can_cancel_order(actor, order), "canCancelOrder")
	}

	pub fn check_complete(&self, actor: &User, order: &Order) -> Result<(), Denied> {
		ensure(self.can_complete_order(actor, order), "canCompleteOrder")
	}

	pub fn check_rate(actor: &User, order: &Order) -> Result<(), Denied> {
		ensure(Self::can_rate_order(actor, order), "canRateOrder")
	}

	pub fn check_assign(actor: &User) -> Result<(), Denied> {
		ensure(Self::can_assign_orders(actor), "canAssignOrders")
	}
}

fn ensure(allowed: bool, predicate: &'static str) -> Result<(), Denied> {
	if allowed {
		Ok(())
	} else {
		Err(Denied(predicate))
	}
}
