//! Delivery engine exposing every lifecycle operation.
//!
//! Each operation names its actor explicitly, resolves it against the
//! directory, checks eligibility through the permission predicates and only
//! then touches storage. Order transitions are guarded batch writes, so of
//! two concurrent actions against the same order version exactly one wins
//! and the other surfaces as a conflict. A transition that moves an order in
//! or out of an active status writes the deliverer's record in the same
//! batch, which makes the capacity limit and the availability switch race on
//! that record too. Nothing here retries on its own.

pub mod event_bus;
pub mod limiter;

#[cfg(test)]
mod tests;

use crate::directory::{Directory, DirectoryError};
use crate::earnings::EarningsAggregator;
use crate::matcher::AvailabilityMatcher;
use crate::permissions::{Denied, PermissionEngine};
use crate::rating::RatingAggregator;
use crate::state::{OrderStateError, OrderStateMachine};
use chrono::{DateTime, Utc};
use event_bus::EventBus;
use limiter::CreationLimiter;
use repartidev_config::Config;
use repartidev_storage::{Batch, StorageError, StorageService, Versioned};
use repartidev_types::{
	truncate_id, AvailableDeliverers, Clock, Condominium, CreateCondominiumRequest,
	CreateDepartmentRequest, CreateOrderRequest, DelivererRanking, Department, DepartmentRef,
	EarningsSummary, EngineEvent, ErrorKind, Order, OrderAction, OrderEvent, OrderFilters,
	OrderStatus, RegisterUserRequest, Review, Role, StorageKey, User, UserEvent,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
	/// The acting user id does not resolve to a registered user.
	#[error("Unknown actor: {0}")]
	UnknownActor(Uuid),
	#[error("Forbidden: {0}")]
	Forbidden(String),
	#[error("Cannot {action} an order in status {from}")]
	InvalidTransition {
		from: OrderStatus,
		action: OrderAction,
	},
	/// Another deliverer holds the order.
	#[error("Order {0} was already taken by another deliverer")]
	OrderTaken(Uuid),
	/// The record changed between read and write.
	#[error("{0} was modified concurrently, reload and retry")]
	Stale(String),
	#[error("Invalid input: {0}")]
	InvalidInput(String),
	#[error("{0}")]
	NotFound(String),
	#[error("Order creation limit reached, retry in {retry_after} seconds")]
	RateLimited { retry_after: u64 },
	#[error("Internal error: {0}")]
	Internal(String),
}

impl EngineError {
	/// Classification used by transports to pick a status code.
	pub fn kind(&self) -> ErrorKind {
		match self {
			EngineError::UnknownActor(_) | EngineError::NotFound(_) => ErrorKind::NotFound,
			EngineError::Forbidden(_) => ErrorKind::Forbidden,
			EngineError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
			EngineError::OrderTaken(_) | EngineError::Stale(_) => ErrorKind::Conflict,
			EngineError::InvalidInput(_) => ErrorKind::InvalidInput,
			EngineError::RateLimited { .. } => ErrorKind::RateLimited,
			EngineError::Internal(_) => ErrorKind::Internal,
		}
	}
}

impl From<Denied> for EngineError {
	fn from(denied: Denied) -> Self {
		EngineError::Forbidden(denied.to_string())
	}
}

impl From<OrderStateError> for EngineError {
	fn from(err: OrderStateError) -> Self {
		match err {
			OrderStateError::InvalidTransition { from, action } => {
				EngineError::InvalidTransition { from, action }
			},
			OrderStateError::OrderNotFound(id) => EngineError::NotFound(format!("Order not found: {}", id)),
			OrderStateError::Stale(id) => EngineError::Stale(format!("Order {}", id)),
			OrderStateError::MissingAssignee => EngineError::InvalidInput(err.to_string()),
			OrderStateError::Storage(_) | OrderStateError::Invariant(_) => {
				EngineError::Internal(err.to_string())
			},
		}
	}
}

impl From<DirectoryError> for EngineError {
	fn from(err: DirectoryError) -> Self {
		match err {
			DirectoryError::NotFound { .. } => EngineError::NotFound(err.to_string()),
			DirectoryError::Stale(key) => EngineError::Stale(key),
			DirectoryError::Storage(msg) => EngineError::Internal(msg),
		}
	}
}

impl From<StorageError> for EngineError {
	fn from(err: StorageError) -> Self {
		match err {
			StorageError::NotFound => EngineError::NotFound(err.to_string()),
			StorageError::PreconditionFailed(key) => EngineError::Stale(key),
			other => EngineError::Internal(other.to_string()),
		}
	}
}

fn require(allowed: bool, predicate: &'static str) -> Result<(), EngineError> {
	if allowed {
		Ok(())
	} else {
		Err(Denied(predicate).into())
	}
}

fn required(field: &str, value: &str) -> Result<String, EngineError> {
	let value = value.trim();
	if value.is_empty() {
		return Err(EngineError::InvalidInput(format!("{} is required", field)));
	}
	Ok(value.to_string())
}

fn normalize_email(email: &str) -> Result<String, EngineError> {
	let email = email.trim().to_lowercase();
	match email.split_once('@') {
		Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
		_ => Err(EngineError::InvalidInput(format!(
			"invalid email address: {}",
			email
		))),
	}
}

fn short(id: &Uuid) -> String {
	truncate_id(&id.to_string())
}

/// Order lifecycle engine.
#[derive(Clone)]
pub struct DeliveryEngine {
	/// Service configuration.
	config: Config,
	/// Storage service for batch commits spanning several records.
	storage: Arc<StorageService>,
	/// Users, condominiums and departments.
	directory: Arc<Directory>,
	/// Order state machine
	state_machine: Arc<OrderStateMachine>,
	permissions: PermissionEngine,
	matcher: AvailabilityMatcher,
	earnings: EarningsAggregator,
	/// Order creation quota per receiver.
	limiter: Arc<CreationLimiter>,
	clock: Arc<dyn Clock>,
	/// Event bus for lifecycle notifications.
	event_bus: EventBus,
}

impl DeliveryEngine {
	/// Creates a new engine over the given storage.
	pub fn new(
		config: Config,
		storage: Arc<StorageService>,
		clock: Arc<dyn Clock>,
		event_bus: EventBus,
	) -> Self {
		let directory = Arc::new(Directory::new(storage.clone()));
		let state_machine = Arc::new(OrderStateMachine::new(storage.clone(), clock.clone()));
		let permissions = PermissionEngine::new(config.orders.allow_direct_completion);
		let matcher = AvailabilityMatcher::new(config.orders.strict_condominium_matching);
		let earnings = EarningsAggregator::new(
			config.earnings.utc_offset_minutes,
			config.earnings.monthly_goal,
		);
		let limiter = Arc::new(CreationLimiter::per_hour(
			config.orders.order_creation_limit_per_hour,
		));

		Self {
			config,
			storage,
			directory,
			state_machine,
			permissions,
			matcher,
			earnings,
			limiter,
			clock,
			event_bus,
		}
	}

	/// Returns a reference to the service configuration.
	pub fn config(&self) -> &Config {
		&self.config
	}

	/// Returns a reference to the event bus.
	pub fn event_bus(&self) -> &EventBus {
		&self.event_bus
	}

	fn publish(&self, event: EngineEvent) {
		self.event_bus.publish(event).ok();
	}

	/// Resolves the acting user.
	async fn actor(&self, actor_id: Uuid) -> Result<User, EngineError> {
		Ok(self.actor_versioned(actor_id).await?.into_inner())
	}

	/// Resolves the acting user along with the token guarding its record.
	async fn actor_versioned(&self, actor_id: Uuid) -> Result<Versioned<User>, EngineError> {
		match self.directory.get_user_versioned(actor_id).await {
			Ok(user) => Ok(user),
			Err(DirectoryError::NotFound { .. }) => Err(EngineError::UnknownActor(actor_id)),
			Err(e) => Err(e.into()),
		}
	}

	/// Resolves a department referenced by a request body.
	async fn department_ref(&self, department_id: Uuid) -> Result<DepartmentRef, EngineError> {
		match self.directory.get_department(department_id).await {
			Ok(department) => Ok(department.to_ref()),
			Err(DirectoryError::NotFound { .. }) => Err(EngineError::InvalidInput(format!(
				"department {} does not exist",
				department_id
			))),
			Err(e) => Err(e.into()),
		}
	}

	async fn all_orders(&self) -> Result<Vec<Order>, EngineError> {
		Ok(self.state_machine.all_orders().await?)
	}

	fn ensure_capacity(&self, deliverer: &User) -> Result<(), EngineError> {
		let active = deliverer.active_orders as usize;
		let max = self.config.orders.max_active_orders;
		if active >= max {
			tracing::warn!(
				deliverer = %short(&deliverer.id),
				active,
				max,
				"Deliverer at capacity"
			);
			return Err(EngineError::Forbidden(format!(
				"deliverer already holds {} active orders (max {})",
				active, max
			)));
		}
		Ok(())
	}

	// ---------------------------------------------------------------------
	// Directory
	// ---------------------------------------------------------------------

	/// Registers a condominium. Admin only.
	#[instrument(skip_all, fields(actor = %short(&actor_id)))]
	pub async fn create_condominium(
		&self,
		actor_id: Uuid,
		request: CreateCondominiumRequest,
	) -> Result<Condominium, EngineError> {
		let actor = self.actor(actor_id).await?;
		require(
			PermissionEngine::can_manage_directory(&actor),
			"canManageDirectory",
		)?;

		let condominium = Condominium {
			id: Uuid::new_v4(),
			name: required("name", &request.name)?,
			address: required("address", &request.address)?,
			district: request.district.trim().to_string(),
			region: request.region.trim().to_string(),
			entries: request.entries,
		};
		self.directory.insert_condominium(&condominium).await?;

		tracing::info!(
			condominium_id = %short(&condominium.id),
			name = %condominium.name,
			"Condominium registered"
		);
		Ok(condominium)
	}

	/// Adds a department to an existing condominium. Admin only.
	#[instrument(skip_all, fields(actor = %short(&actor_id), condominium_id = %short(&condominium_id)))]
	pub async fn create_department(
		&self,
		actor_id: Uuid,
		condominium_id: Uuid,
		request: CreateDepartmentRequest,
	) -> Result<Department, EngineError> {
		let actor = self.actor(actor_id).await?;
		require(
			PermissionEngine::can_manage_directory(&actor),
			"canManageDirectory",
		)?;
		let condominium = self.directory.get_condominium(condominium_id).await?;

		let department = Department {
			id: Uuid::new_v4(),
			condominium_id: condominium.id,
			name: required("name", &request.name)?,
			tower: required("tower", &request.tower)?,
			floor: request.floor,
		};
		self.directory.insert_department(&department).await?;

		tracing::info!(
			department_id = %short(&department.id),
			tower = %department.tower,
			floor = department.floor,
			"Department registered"
		);
		Ok(department)
	}

	/// Registers a resident.
	///
	/// Registration is open. The admin role can only be claimed this way
	/// while no admin exists yet; afterwards an admin has to grant it.
	#[instrument(skip_all, fields(role = %request.role))]
	pub async fn register_user(&self, request: RegisterUserRequest) -> Result<User, EngineError> {
		let first_name = required("firstName", &request.first_name)?;
		let email = normalize_email(&request.email)?;

		if request.role == Role::Admin
			&& self
				.directory
				.all_users()
				.await?
				.iter()
				.any(|u| u.role == Role::Admin)
		{
			return Err(Denied("canManageUser").into());
		}

		let department = match request.department_id {
			Some(id) => Some(self.department_ref(id).await?),
			None => None,
		};

		let user = User {
			id: Uuid::new_v4(),
			first_name,
			last_name: request.last_name.trim().to_string(),
			email,
			role: request.role,
			department,
			is_available_for_delivery: false,
			rating_average: 0.0,
			rating_count: 0,
			active_orders: 0,
			created_at: self.clock.now(),
		};
		self.directory.insert_user(&user).await?;

		tracing::info!(user_id = %short(&user.id), role = %user.role, "User registered");
		self.publish(EngineEvent::User(UserEvent::Registered {
			user_id: user.id,
			role: user.role,
		}));
		Ok(user)
	}

	/// Reads a resident's full record. Residents may read their own, admins
	/// anyone's.
	pub async fn get_user(&self, actor_id: Uuid, user_id: Uuid) -> Result<User, EngineError> {
		let actor = self.actor(actor_id).await?;
		let user = self.directory.get_user(user_id).await?;
		require(PermissionEngine::can_manage_user(&actor, &user), "canManageUser")?;
		Ok(user)
	}

	/// Deliverers of a condominium who could take an order, best rated first.
	///
	/// Lists the actor's own condominium unless another one is named; the
	/// actor never appears in the result.
	#[instrument(skip_all, fields(actor = %short(&actor_id)))]
	pub async fn available_deliverers(
		&self,
		actor_id: Uuid,
		condominium_id: Option<Uuid>,
	) -> Result<AvailableDeliverers, EngineError> {
		let actor = self.actor(actor_id).await?;
		let condominium_id = condominium_id
			.or_else(|| actor.condominium_id())
			.ok_or_else(|| {
				EngineError::InvalidInput(
					"condominium_id is required when the actor has no department".into(),
				)
			})?;
		let condominium = self.directory.get_condominium(condominium_id).await?;

		let users = self.directory.all_users().await?;
		let orders = self.all_orders().await?;
		let deliverers = AvailabilityMatcher::available_deliverers(
			&users,
			&orders,
			condominium.id,
			actor.id,
			self.config.orders.max_active_orders,
		);
		tracing::debug!(count = deliverers.len(), "Listed available deliverers");

		Ok(AvailableDeliverers {
			condominium_id: condominium.id,
			condominium_name: condominium.name,
			count: deliverers.len(),
			deliverers,
		})
	}

	/// Changes a resident's role.
	///
	/// Residents may switch between non-admin roles themselves; granting or
	/// revoking admin takes an admin. Losing the deliverer capability is
	/// refused while the resident still holds active deliveries.
	#[instrument(skip_all, fields(actor = %short(&actor_id), user_id = %short(&user_id)))]
	pub async fn update_role(
		&self,
		actor_id: Uuid,
		user_id: Uuid,
		role: Role,
	) -> Result<User, EngineError> {
		let actor = self.actor(actor_id).await?;
		let prior = self.directory.get_user_versioned(user_id).await?;
		require(
			PermissionEngine::can_manage_user(&actor, &prior.value),
			"canManageUser",
		)?;
		if (role == Role::Admin || prior.value.role == Role::Admin) && actor.role != Role::Admin {
			return Err(Denied("canManageUser").into());
		}

		let mut user = prior.value.clone();
		user.role = role;
		if !PermissionEngine::can_deliver_orders(&user) {
			let active = prior.value.active_orders;
			if active > 0 {
				return Err(EngineError::Forbidden(format!(
					"cannot drop the deliverer role with {} active orders",
					active
				)));
			}
			user.is_available_for_delivery = false;
		}
		self.directory.replace_user(&prior, &user).await?;

		tracing::info!(from = %prior.value.role, to = %role, "Role changed");
		self.publish(EngineEvent::User(UserEvent::RoleChanged { user_id, role }));
		Ok(user)
	}

	/// Moves a resident to another department.
	#[instrument(skip_all, fields(actor = %short(&actor_id), user_id = %short(&user_id)))]
	pub async fn set_department(
		&self,
		actor_id: Uuid,
		user_id: Uuid,
		department_id: Uuid,
	) -> Result<User, EngineError> {
		let actor = self.actor(actor_id).await?;
		let prior = self.directory.get_user_versioned(user_id).await?;
		require(
			PermissionEngine::can_manage_user(&actor, &prior.value),
			"canManageUser",
		)?;
		let department = self.department_ref(department_id).await?;

		let mut user = prior.value.clone();
		user.department = Some(department);
		self.directory.replace_user(&prior, &user).await?;

		tracing::info!(department_id = %short(&department_id), "Department changed");
		Ok(user)
	}

	/// Switches a deliverer's availability on or off.
	///
	/// Going unavailable is refused while the deliverer holds active orders.
	#[instrument(skip_all, fields(actor = %short(&actor_id), user_id = %short(&user_id)))]
	pub async fn toggle_availability(
		&self,
		actor_id: Uuid,
		user_id: Uuid,
	) -> Result<User, EngineError> {
		let actor = self.actor(actor_id).await?;
		let prior = self.directory.get_user_versioned(user_id).await?;
		require(
			PermissionEngine::can_manage_user(&actor, &prior.value),
			"canManageUser",
		)?;
		require(
			PermissionEngine::can_deliver_orders(&prior.value),
			"canDeliverOrders",
		)?;

		// Accepting or assigning an order rewrites this record, so the guarded
		// replace below fails if the count changed after this check.
		if prior.value.is_available_for_delivery {
			let active = prior.value.active_orders;
			if active > 0 {
				tracing::warn!(active, "Availability change refused");
				return Err(EngineError::Forbidden(format!(
					"cannot become unavailable with {} active orders",
					active
				)));
			}
		}

		let mut user = prior.value.clone();
		user.is_available_for_delivery = !user.is_available_for_delivery;
		self.directory.replace_user(&prior, &user).await?;

		tracing::info!(available = user.is_available_for_delivery, "Availability changed");
		self.publish(EngineEvent::User(UserEvent::AvailabilityChanged {
			user_id,
			available: user.is_available_for_delivery,
		}));
		Ok(user)
	}

	// ---------------------------------------------------------------------
	// Orders
	// ---------------------------------------------------------------------

	/// Posts a new pending order.
	///
	/// The order is delivered to the receiver's own department unless the
	/// request names another department of the same condominium.
	#[instrument(skip_all, fields(actor = %short(&actor_id)))]
	pub async fn create_order(
		&self,
		actor_id: Uuid,
		request: CreateOrderRequest,
	) -> Result<Order, EngineError> {
		let actor = self.actor(actor_id).await?;
		require(
			PermissionEngine::can_receive_orders(&actor),
			"canReceiveOrders",
		)?;
		if request.amount <= Decimal::ZERO {
			return Err(EngineError::InvalidInput(format!(
				"amount must be positive, got {}",
				request.amount
			)));
		}

		let department = match request.department_id {
			Some(id) => {
				let department = self.department_ref(id).await?;
				if actor
					.condominium_id()
					.is_some_and(|home| home != department.condominium_id)
				{
					return Err(EngineError::InvalidInput(
						"department belongs to another condominium".into(),
					));
				}
				department
			},
			None => actor.department.clone().ok_or_else(|| {
				EngineError::InvalidInput("receiver has no department".into())
			})?,
		};

		let now = self.clock.now();
		self.limiter
			.try_acquire(actor.id, now)
			.map_err(|retry_after| {
				tracing::warn!(retry_after, "Order creation throttled");
				EngineError::RateLimited { retry_after }
			})?;

		let order = Order {
			id: Uuid::new_v4(),
			receiver_id: actor.id,
			receiver_department: department,
			deliverer_id: None,
			status: OrderStatus::Pending,
			amount: request.amount,
			is_immediate: request.is_immediate,
			scheduled_date: request.scheduled_date,
			delivery_notes: request
				.delivery_notes
				.map(|notes| notes.trim().to_string())
				.filter(|notes| !notes.is_empty()),
			created_at: now,
			updated_at: now,
			completed_at: None,
			review_id: None,
		};
		if let Err(e) = self.state_machine.store_new(&order).await {
			self.limiter.release(actor.id, now);
			return Err(e.into());
		}

		tracing::info!(
			order_id = %short(&order.id),
			amount = %order.amount,
			immediate = order.is_immediate,
			"Order created"
		);
		self.publish(EngineEvent::Order(OrderEvent::Created {
			order: order.clone(),
		}));
		Ok(order)
	}

	/// Pending orders the deliverer may claim, nearest first.
	#[instrument(skip_all, fields(actor = %short(&actor_id)))]
	pub async fn list_available_orders(
		&self,
		actor_id: Uuid,
		filters: OrderFilters,
	) -> Result<Vec<Order>, EngineError> {
		let actor = self.actor(actor_id).await?;
		require(
			PermissionEngine::can_deliver_orders(&actor),
			"canDeliverOrders",
		)?;
		AvailabilityMatcher::validate_filters(&filters).map_err(EngineError::InvalidInput)?;

		let orders = self.all_orders().await?;
		let visible = self.matcher.visible_orders(&actor, orders, &filters);
		tracing::debug!(count = visible.len(), "Listed available orders");
		Ok(visible)
	}

	/// Reads a single order.
	pub async fn get_order(&self, actor_id: Uuid, order_id: Uuid) -> Result<Order, EngineError> {
		let actor = self.actor(actor_id).await?;
		let order = self.state_machine.get_order(&order_id.to_string()).await?;
		require(PermissionEngine::can_view_order(&actor, &order), "canViewOrder")?;
		Ok(order)
	}

	/// Orders posted by the actor, newest first.
	pub async fn my_requests(&self, actor_id: Uuid) -> Result<Vec<Order>, EngineError> {
		let actor = self.actor(actor_id).await?;
		let mut orders: Vec<Order> = self
			.all_orders()
			.await?
			.into_iter()
			.filter(|o| o.receiver_id == actor.id)
			.collect();
		orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
		Ok(orders)
	}

	/// Orders delivered or being delivered by the actor, most recently
	/// updated first.
	pub async fn my_deliveries(&self, actor_id: Uuid) -> Result<Vec<Order>, EngineError> {
		let actor = self.actor(actor_id).await?;
		let mut orders: Vec<Order> = self
			.all_orders()
			.await?
			.into_iter()
			.filter(|o| o.deliverer_id == Some(actor.id))
			.collect();
		orders.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
		Ok(orders)
	}

	/// Claims an order. Of two concurrent claims exactly one succeeds.
	pub async fn accept_order(&self, actor_id: Uuid, order_id: Uuid) -> Result<Order, EngineError> {
		self.transition(actor_id, order_id, OrderAction::Accept, None)
			.await
	}

	/// Hands an assigned or accepted order back to the backlog.
	pub async fn reject_order(&self, actor_id: Uuid, order_id: Uuid) -> Result<Order, EngineError> {
		self.transition(actor_id, order_id, OrderAction::Reject, None)
			.await
	}

	pub async fn start_order(&self, actor_id: Uuid, order_id: Uuid) -> Result<Order, EngineError> {
		self.transition(actor_id, order_id, OrderAction::Start, None)
			.await
	}

	pub async fn complete_order(
		&self,
		actor_id: Uuid,
		order_id: Uuid,
	) -> Result<Order, EngineError> {
		self.transition(actor_id, order_id, OrderAction::Complete, None)
			.await
	}

	pub async fn cancel_order(&self, actor_id: Uuid, order_id: Uuid) -> Result<Order, EngineError> {
		self.transition(actor_id, order_id, OrderAction::Cancel, None)
			.await
	}

	/// Earmarks a pending order for a deliverer. Admin only.
	pub async fn assign_order(
		&self,
		actor_id: Uuid,
		order_id: Uuid,
		deliverer_id: Uuid,
	) -> Result<Order, EngineError> {
		self.transition(actor_id, order_id, OrderAction::Assign, Some(deliverer_id))
			.await
	}

	/// Removes a pending order. Only its receiver may do so.
	#[instrument(skip_all, fields(order_id = %short(&order_id)))]
	pub async fn delete_order(&self, actor_id: Uuid, order_id: Uuid) -> Result<(), EngineError> {
		let actor = self.actor(actor_id).await?;
		let prior = self
			.state_machine
			.get_versioned(&order_id.to_string())
			.await?;
		require(
			PermissionEngine::can_delete_order(&actor, &prior.value),
			"canDeleteOrder",
		)?;
		self.state_machine.delete(&prior).await?;

		tracing::info!("Order deleted");
		self.publish(EngineEvent::Order(OrderEvent::Deleted {
			order_id,
			actor_id,
		}));
		Ok(())
	}

	fn authorize(&self, actor: &User, order: &Order, action: OrderAction) -> Result<(), Denied> {
		match action {
			OrderAction::Assign => PermissionEngine::check_assign(actor),
			OrderAction::Accept => PermissionEngine::check_accept(actor, order),
			OrderAction::Reject => PermissionEngine::check_reject(actor, order),
			OrderAction::Start => PermissionEngine::check_start(actor, order),
			OrderAction::Complete => self.permissions.check_complete(actor, order),
			OrderAction::Cancel => PermissionEngine::check_cancel(actor, order),
		}
	}

	/// Validates the deliverer an admin picked for an order and returns their
	/// record.
	async fn check_assignee(
		&self,
		order: &Order,
		assignee: Option<Uuid>,
	) -> Result<Versioned<User>, EngineError> {
		let assignee_id =
			assignee.ok_or_else(|| EngineError::InvalidInput("delivererId is required".into()))?;
		let assignee = match self.directory.get_user_versioned(assignee_id).await {
			Ok(user) => user,
			Err(DirectoryError::NotFound { .. }) => {
				return Err(EngineError::InvalidInput(format!(
					"deliverer {} does not exist",
					assignee_id
				)))
			},
			Err(e) => return Err(e.into()),
		};
		let candidate = &assignee.value;

		if !PermissionEngine::is_available(candidate) {
			return Err(EngineError::InvalidInput(
				"deliverer is not available for delivery".into(),
			));
		}
		if candidate.id == order.receiver_id {
			return Err(EngineError::InvalidInput(
				"receiver cannot deliver their own order".into(),
			));
		}
		if candidate
			.condominium_id()
			.is_some_and(|home| home != order.condominium_id())
		{
			return Err(EngineError::InvalidInput(
				"deliverer lives in another condominium".into(),
			));
		}
		Ok(assignee)
	}

	/// The deliverer record whose active order count moves when `order` goes
	/// to `to`, paired with its new value. `None` when the count stays put.
	async fn workload_change(
		&self,
		actor: &Versioned<User>,
		order: &Order,
		action: OrderAction,
		to: OrderStatus,
		assignee: Option<Uuid>,
	) -> Result<Option<(Versioned<User>, User)>, EngineError> {
		match (order.status.is_active_delivery(), to.is_active_delivery()) {
			(false, true) => {
				let holder = match action {
					OrderAction::Assign => self.check_assignee(order, assignee).await?,
					_ => actor.clone(),
				};
				self.ensure_capacity(&holder.value)?;
				let mut next = holder.value.clone();
				next.active_orders = next.active_orders.saturating_add(1);
				Ok(Some((holder, next)))
			},
			(true, false) => {
				let Some(deliverer_id) = order.deliverer_id else {
					return Ok(None);
				};
				let holder = if deliverer_id == actor.value.id {
					actor.clone()
				} else {
					self.directory.get_user_versioned(deliverer_id).await?
				};
				let mut next = holder.value.clone();
				next.active_orders = next.active_orders.saturating_sub(1);
				Ok(Some((holder, next)))
			},
			_ => Ok(None),
		}
	}

	/// Reports why a claim lost its guarded write.
	async fn classify_lost_claim(&self, actor_id: Uuid, order_id: Uuid) -> EngineError {
		match self.state_machine.get_order(&order_id.to_string()).await {
			Ok(order)
				if order.status.is_active_delivery() && order.deliverer_id != Some(actor_id) =>
			{
				EngineError::OrderTaken(order_id)
			},
			Ok(_) => EngineError::Stale(format!("Order {}", order_id)),
			Err(e) => e.into(),
		}
	}

	/// Runs one lifecycle action: edge check, permission check, guards, then
	/// one batch holding the new order version and, when the deliverer's
	/// workload changes, their updated record.
	#[instrument(skip_all, fields(order_id = %short(&order_id), action = %action))]
	async fn transition(
		&self,
		actor_id: Uuid,
		order_id: Uuid,
		action: OrderAction,
		assignee: Option<Uuid>,
	) -> Result<Order, EngineError> {
		let actor_record = self.actor_versioned(actor_id).await?;
		let actor = &actor_record.value;
		let prior = self
			.state_machine
			.get_versioned(&order_id.to_string())
			.await?;
		let current = &prior.value;

		if action == OrderAction::Accept
			&& current.status.is_active_delivery()
			&& current.deliverer_id != Some(actor.id)
		{
			tracing::warn!(actor = %short(&actor.id), "Order already taken");
			return Err(EngineError::OrderTaken(order_id));
		}

		let to = OrderStateMachine::next_status(current.status, action)?;
		self.authorize(actor, current, action).map_err(|denied| {
			tracing::warn!(actor = %short(&actor.id), predicate = %denied, "Action denied");
			EngineError::from(denied)
		})?;

		let workload = self
			.workload_change(&actor_record, current, action, to, assignee)
			.await?;

		let from = current.status;
		let (mut batch, updated) =
			self.state_machine
				.stage(Batch::new(), &prior, action, actor.id, assignee)?;
		if let Some((holder, next)) = &workload {
			batch = batch.replace(
				StorageKey::Users.as_str(),
				&next.id.to_string(),
				holder,
				next,
			)?;
		}

		match self.storage.commit(batch).await {
			Ok(()) => {},
			Err(StorageError::PreconditionFailed(_)) if action == OrderAction::Accept => {
				let err = self.classify_lost_claim(actor.id, order_id).await;
				tracing::warn!(error = %err, "Claim lost");
				return Err(err);
			},
			Err(StorageError::PreconditionFailed(key)) => {
				tracing::warn!(key = %key, "Transition lost to a concurrent write");
				return Err(EngineError::Stale(key));
			},
			Err(e) => return Err(e.into()),
		}

		tracing::info!(
			actor = %short(&actor.id),
			from = %from,
			to = %updated.status,
			"Order transitioned"
		);
		self.publish(EngineEvent::Order(OrderEvent::Transitioned {
			order_id,
			actor_id: actor.id,
			action,
			from,
			to: updated.status,
		}));
		Ok(updated)
	}

	// ---------------------------------------------------------------------
	// Reviews and reports
	// ---------------------------------------------------------------------

	/// Reviews the deliverer of a completed order.
	///
	/// The review, the order's review link and the deliverer's new rating
	/// aggregate are committed as one batch.
	#[instrument(skip_all, fields(order_id = %short(&order_id)))]
	pub async fn submit_review(
		&self,
		actor_id: Uuid,
		order_id: Uuid,
		rating: i64,
		comment: Option<String>,
	) -> Result<Review, EngineError> {
		let actor = self.actor(actor_id).await?;
		let rating = RatingAggregator::validate(rating).map_err(EngineError::InvalidInput)?;
		let prior = self
			.state_machine
			.get_versioned(&order_id.to_string())
			.await?;
		PermissionEngine::check_rate(&actor, &prior.value)?;

		let deliverer_id = prior.value.deliverer_id.ok_or_else(|| {
			EngineError::Internal(format!("completed order {} has no deliverer", order_id))
		})?;
		let deliverer = self.directory.get_user_versioned(deliverer_id).await?;
		let rated = RatingAggregator::rated(&deliverer.value, rating);

		let review = Review {
			id: Uuid::new_v4(),
			order_id,
			reviewer_id: actor.id,
			reviewed_id: deliverer_id,
			rating,
			comment: comment
				.map(|c| c.trim().to_string())
				.filter(|c| !c.is_empty()),
			created_at: self.clock.now(),
		};

		let batch = Batch::new().insert_new(
			StorageKey::Reviews.as_str(),
			&order_id.to_string(),
			&review,
		)?;
		let (batch, _) = self.state_machine.link_review(batch, &prior, review.id)?;
		let batch = batch.replace(
			StorageKey::Users.as_str(),
			&deliverer_id.to_string(),
			&deliverer,
			&rated,
		)?;
		self.storage.commit(batch).await?;

		tracing::info!(
			deliverer = %short(&deliverer_id),
			rating,
			average = rated.rating_average,
			count = rated.rating_count,
			"Review submitted"
		);
		self.publish(EngineEvent::Order(OrderEvent::Reviewed {
			review: review.clone(),
		}));
		self.publish(EngineEvent::User(UserEvent::Rated {
			user_id: deliverer_id,
			rating_average: rated.rating_average,
			rating_count: rated.rating_count,
		}));
		Ok(review)
	}

	/// Earnings of the acting deliverer, with windows anchored at `now` or
	/// at the current time.
	pub async fn earnings_summary(
		&self,
		actor_id: Uuid,
		now: Option<DateTime<Utc>>,
	) -> Result<EarningsSummary, EngineError> {
		let actor = self.actor(actor_id).await?;
		require(
			PermissionEngine::can_deliver_orders(&actor),
			"canDeliverOrders",
		)?;
		let now = now.unwrap_or_else(|| self.clock.now());
		let orders: Vec<Order> = self
			.all_orders()
			.await?
			.into_iter()
			.filter(|o| o.deliverer_id == Some(actor.id))
			.collect();
		let reviews: Vec<Review> = self
			.storage
			.retrieve_all(StorageKey::Reviews.as_str())
			.await?;
		let ratings =
			RatingAggregator::breakdown(reviews.iter().filter(|r| r.reviewed_id == actor.id));
		Ok(self.earnings.summarize(&orders, ratings, now))
	}

	/// Month-window statistics for every deliverer. Admin only.
	pub async fn deliverer_rankings(
		&self,
		actor_id: Uuid,
		now: Option<DateTime<Utc>>,
	) -> Result<Vec<DelivererRanking>, EngineError> {
		let actor = self.actor(actor_id).await?;
		require(PermissionEngine::can_view_reports(&actor), "canViewReports")?;
		let now = now.unwrap_or_else(|| self.clock.now());
		let users = self.directory.all_users().await?;
		let orders = self.all_orders().await?;
		Ok(EarningsAggregator::rankings(&users, &orders, now))
	}
}
