//! Order state machine implementation.
//!
//! Orders move through Pending -> (Assigned) -> Accepted -> InProgress ->
//! Completed, with Cancelled reachable from every pre-delivery state and
//! reject handing an assigned or accepted order back to the backlog. Each
//! transition is computed from the order version the caller read and written
//! back only if that version is still current.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use repartidev_storage::{Batch, StorageError, StorageService, Versioned};
use repartidev_types::{Clock, Order, OrderAction, OrderStatus, StorageKey};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during order state management.
#[derive(Debug, Error)]
pub enum OrderStateError {
	#[error("Storage error: {0}")]
	Storage(String),
	#[error("Cannot {action} an order in status {from}")]
	InvalidTransition {
		from: OrderStatus,
		action: OrderAction,
	},
	#[error("Order not found: {0}")]
	OrderNotFound(String),
	/// The order changed between read and write.
	#[error("Order {0} was modified concurrently")]
	Stale(String),
	#[error("Assign requires a deliverer")]
	MissingAssignee,
	#[error("Order invariant violated: {0}")]
	Invariant(String),
}

/// Static transition table - each status maps to the statuses it may move to.
static TRANSITIONS: Lazy<HashMap<OrderStatus, HashSet<OrderStatus>>> = Lazy::new(|| {
	use OrderStatus::*;

	let mut m = HashMap::new();
	m.insert(Pending, HashSet::from([Assigned, Accepted, Cancelled]));
	m.insert(Confirmed, HashSet::from([Accepted, Cancelled]));
	m.insert(Assigned, HashSet::from([Accepted, Pending, Cancelled]));
	m.insert(Accepted, HashSet::from([InProgress, Completed, Pending, Cancelled]));
	m.insert(InProgress, HashSet::from([Completed]));
	m.insert(Completed, HashSet::new()); // terminal
	m.insert(Cancelled, HashSet::new()); // terminal
	m
});

/// Status an action moves the order to.
fn target_status(action: OrderAction) -> OrderStatus {
	match action {
		OrderAction::Assign => OrderStatus::Assigned,
		OrderAction::Accept => OrderStatus::Accepted,
		OrderAction::Reject => OrderStatus::Pending,
		OrderAction::Start => OrderStatus::InProgress,
		OrderAction::Complete => OrderStatus::Completed,
		OrderAction::Cancel => OrderStatus::Cancelled,
	}
}

fn map_storage(order_id: &str, err: StorageError) -> OrderStateError {
	match err {
		StorageError::NotFound => OrderStateError::OrderNotFound(order_id.to_string()),
		StorageError::PreconditionFailed(_) => OrderStateError::Stale(order_id.to_string()),
		other => OrderStateError::Storage(other.to_string()),
	}
}

/// Manages order state transitions and persistence
pub struct OrderStateMachine {
	storage: Arc<StorageService>,
	clock: Arc<dyn Clock>,
}

impl OrderStateMachine {
	pub fn new(storage: Arc<StorageService>, clock: Arc<dyn Clock>) -> Self {
		Self { storage, clock }
	}

	/// Checks if a status change is an edge of the lifecycle graph.
	pub fn is_valid_transition(from: OrderStatus, to: OrderStatus) -> bool {
		TRANSITIONS.get(&from).is_some_and(|set| set.contains(&to))
	}

	/// Resolves the status `action` leads to from `from`.
	pub fn next_status(
		from: OrderStatus,
		action: OrderAction,
	) -> Result<OrderStatus, OrderStateError> {
		let to = target_status(action);
		if Self::is_valid_transition(from, to) {
			Ok(to)
		} else {
			Err(OrderStateError::InvalidTransition { from, action })
		}
	}

	/// Computes the order after `action`, without persisting it.
	///
	/// `actor_id` becomes the deliverer on accept; `assignee` is required for
	/// assign and ignored otherwise.
	pub fn transition(
		order: &Order,
		action: OrderAction,
		actor_id: Uuid,
		assignee: Option<Uuid>,
		now: DateTime<Utc>,
	) -> Result<Order, OrderStateError> {
		let to = Self::next_status(order.status, action)?;
		let mut next = order.clone();

		match action {
			OrderAction::Assign => {
				next.deliverer_id = Some(assignee.ok_or(OrderStateError::MissingAssignee)?);
			},
			OrderAction::Accept => next.deliverer_id = Some(actor_id),
			OrderAction::Reject => next.deliverer_id = None,
			OrderAction::Complete => next.completed_at = Some(now),
			OrderAction::Start | OrderAction::Cancel => {},
		}
		next.status = to;
		next.updated_at = now.max(order.updated_at);

		next.check_invariants()
			.map_err(OrderStateError::Invariant)?;
		Ok(next)
	}

	/// Gets an order by ID
	pub async fn get_order(&self, order_id: &str) -> Result<Order, OrderStateError> {
		self.storage
			.retrieve(StorageKey::Orders.as_str(), order_id)
			.await
			.map_err(|e| map_storage(order_id, e))
	}

	/// Gets an order together with the token needed to write it back.
	pub async fn get_versioned(&self, order_id: &str) -> Result<Versioned<Order>, OrderStateError> {
		self.storage
			.retrieve_versioned(StorageKey::Orders.as_str(), order_id)
			.await
			.map_err(|e| map_storage(order_id, e))
	}

	/// Every stored order.
	pub async fn all_orders(&self) -> Result<Vec<Order>, OrderStateError> {
		self.storage
			.retrieve_all(StorageKey::Orders.as_str())
			.await
			.map_err(|e| OrderStateError::Storage(e.to_string()))
	}

	/// Stores a freshly created order. Fails if the id is already taken.
	pub async fn store_new(&self, order: &Order) -> Result<(), OrderStateError> {
		let order_id = order.id.to_string();
		order
			.check_invariants()
			.map_err(OrderStateError::Invariant)?;
		let batch = Batch::new()
			.insert_new(StorageKey::Orders.as_str(), &order_id, order)
			.map_err(|e| OrderStateError::Storage(e.to_string()))?;
		self.storage
			.commit(batch)
			.await
			.map_err(|e| map_storage(&order_id, e))
	}

	/// Adds the write applying `action` to the order version in `prior` to
	/// `batch` and returns the order as it will be stored.
	///
	/// The write is guarded by `prior`, so if anyone changed the order since it
	/// was read the whole batch is refused.
	pub fn stage(
		&self,
		batch: Batch,
		prior: &Versioned<Order>,
		action: OrderAction,
		actor_id: Uuid,
		assignee: Option<Uuid>,
	) -> Result<(Batch, Order), OrderStateError> {
		let next = Self::transition(&prior.value, action, actor_id, assignee, self.clock.now())?;
		let batch = batch
			.replace(
				StorageKey::Orders.as_str(),
				&next.id.to_string(),
				prior,
				&next,
			)
			.map_err(|e| OrderStateError::Storage(e.to_string()))?;
		Ok((batch, next))
	}

	/// Adds the write linking `review_id` to the order to `batch`.
	///
	/// The link is guarded by the order version in `prior`, so it commits
	/// together with whatever else the batch carries or not at all.
	pub fn link_review(
		&self,
		batch: Batch,
		prior: &Versioned<Order>,
		review_id: Uuid,
	) -> Result<(Batch, Order), OrderStateError> {
		let mut next = prior.value.clone();
		next.review_id = Some(review_id);
		next.updated_at = self.clock.now().max(prior.value.updated_at);
		let batch = batch
			.replace(
				StorageKey::Orders.as_str(),
				&next.id.to_string(),
				prior,
				&next,
			)
			.map_err(|e| OrderStateError::Storage(e.to_string()))?;
		Ok((batch, next))
	}

	/// Removes the order version in `prior`.
	pub async fn delete(&self, prior: &Versioned<Order>) -> Result<(), OrderStateError> {
		let order_id = prior.value.id.to_string();
		self.storage
			.commit(Batch::new().remove(StorageKey::Orders.as_str(), &order_id, prior))
			.await
			.map_err(|e| map_storage(&order_id, e))
	}
}
