//! Event types for lifecycle notifications.
//!
//! Every successful engine mutation publishes an event on the event bus.
//! Subscribers (logging in the service binary, tests) observe what happened
//! without being able to influence the transition itself.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Order, OrderAction, OrderStatus, Review, Role};

/// Main event type encompassing all engine events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
	/// Events about delivery orders.
	Order(OrderEvent),
	/// Events about residents.
	User(UserEvent),
}

/// Events related to the order lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrderEvent {
	/// A receiver posted a new order.
	Created { order: Order },
	/// An order moved between statuses.
	Transitioned {
		order_id: Uuid,
		actor_id: Uuid,
		action: OrderAction,
		from: OrderStatus,
		to: OrderStatus,
	},
	/// A receiver removed a pending order.
	Deleted { order_id: Uuid, actor_id: Uuid },
	/// A receiver reviewed the deliverer of a completed order.
	Reviewed { review: Review },
}

/// Events related to resident accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum UserEvent {
	/// A resident registered.
	Registered { user_id: Uuid, role: Role },
	/// A resident's role changed.
	RoleChanged { user_id: Uuid, role: Role },
	/// A deliverer switched availability on or off.
	AvailabilityChanged { user_id: Uuid, available: bool },
	/// A resident's rating aggregate changed.
	Rated {
		user_id: Uuid,
		rating_average: f64,
		rating_count: u32,
	},
}
