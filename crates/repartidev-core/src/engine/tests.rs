use super::*;
use async_trait::async_trait;
use chrono::{Duration, TimeZone};
use repartidev_storage::implementations::{file::FileStorage, memory::MemoryStorage};
use repartidev_storage::{StorageInterface, WriteOp};
use repartidev_types::{ConfigSchema, ManualClock};
use std::sync::atomic::{AtomicBool, Ordering};

struct Fixture {
	engine: DeliveryEngine,
	clock: Arc<ManualClock>,
	admin: User,
	tower_a: Department,
	tower_b: Department,
}

fn registration(email: &str, role: Role, department_id: Option<Uuid>) -> RegisterUserRequest {
	RegisterUserRequest {
		first_name: "Resident".into(),
		last_name: "Tester".into(),
		email: email.into(),
		role,
		department_id,
	}
}

async fn fixture() -> Fixture {
	fixture_with(Config::for_testing()).await
}

async fn fixture_with(config: Config) -> Fixture {
	fixture_on(config, Box::new(MemoryStorage::new())).await
}

async fn fixture_on(config: Config, backend: Box<dyn StorageInterface>) -> Fixture {
	let clock = Arc::new(ManualClock::new(
		Utc.with_ymd_and_hms(2024, 5, 20, 12, 0, 0).unwrap(),
	));
	let storage = Arc::new(StorageService::new(backend));
	let engine = DeliveryEngine::new(config, storage, clock.clone(), EventBus::default());

	let admin = engine
		.register_user(registration("Admin@Condo.cl", Role::Admin, None))
		.await
		.unwrap();
	let condominium = engine
		.create_condominium(
			admin.id,
			CreateCondominiumRequest {
				name: "Los Aromos".into(),
				address: "Av. Grecia 1200".into(),
				district: "Nunoa".into(),
				region: "RM".into(),
				entries: 2,
			},
		)
		.await
		.unwrap();
	let tower_a = engine
		.create_department(
			admin.id,
			condominium.id,
			CreateDepartmentRequest {
				name: "101".into(),
				tower: "A".into(),
				floor: 1,
			},
		)
		.await
		.unwrap();
	let tower_b = engine
		.create_department(
			admin.id,
			condominium.id,
			CreateDepartmentRequest {
				name: "502".into(),
				tower: "B".into(),
				floor: 5,
			},
		)
		.await
		.unwrap();

	Fixture {
		engine,
		clock,
		admin,
		tower_a,
		tower_b,
	}
}

impl Fixture {
	/// Registers a resident; deliverers come back available.
	async fn resident(&self, role: Role, department: &Department) -> User {
		let email = format!("{}@condo.cl", Uuid::new_v4());
		let user = self
			.engine
			.register_user(registration(&email, role, Some(department.id)))
			.await
			.unwrap();
		if PermissionEngine::can_deliver_orders(&user) {
			self.engine
				.toggle_availability(user.id, user.id)
				.await
				.unwrap()
		} else {
			user
		}
	}

	async fn post(&self, receiver: &User, amount: Decimal) -> Order {
		self.engine
			.create_order(
				receiver.id,
				CreateOrderRequest {
					department_id: None,
					amount,
					scheduled_date: self.clock.now() + Duration::hours(1),
					is_immediate: true,
					delivery_notes: Some("  Leave it with the concierge ".into()),
				},
			)
			.await
			.unwrap()
	}

	/// Drives an order from pending to completed by `deliverer`.
	async fn deliver(&self, order: &Order, deliverer: &User) -> Order {
		self.engine
			.accept_order(deliverer.id, order.id)
			.await
			.unwrap();
		self.clock.advance(Duration::minutes(5));
		self.engine
			.start_order(deliverer.id, order.id)
			.await
			.unwrap();
		self.clock.advance(Duration::minutes(15));
		self.engine
			.complete_order(deliverer.id, order.id)
			.await
			.unwrap()
	}
}

fn twenty() -> Decimal {
	Decimal::new(2000, 2)
}

#[tokio::test]
async fn test_full_lifecycle_updates_rating() {
	let f = fixture().await;
	let receiver = f.resident(Role::Receiver, &f.tower_a).await;
	let deliverer = f.resident(Role::Deliverer, &f.tower_b).await;

	let order = f.post(&receiver, twenty()).await;
	assert_eq!(order.status, OrderStatus::Pending);
	assert_eq!(order.delivery_notes.as_deref(), Some("Leave it with the concierge"));
	order.check_invariants().unwrap();

	let accepted = f
		.engine
		.accept_order(deliverer.id, order.id)
		.await
		.unwrap();
	assert_eq!(accepted.status, OrderStatus::Accepted);
	assert_eq!(accepted.deliverer_id, Some(deliverer.id));
	accepted.check_invariants().unwrap();

	f.clock.advance(Duration::minutes(5));
	let started = f.engine.start_order(deliverer.id, order.id).await.unwrap();
	assert_eq!(started.status, OrderStatus::InProgress);
	assert!(started.completed_at.is_none());

	f.clock.advance(Duration::minutes(15));
	let completed = f
		.engine
		.complete_order(deliverer.id, order.id)
		.await
		.unwrap();
	assert_eq!(completed.status, OrderStatus::Completed);
	assert_eq!(completed.completed_at, Some(f.clock.now()));
	completed.check_invariants().unwrap();

	let review = f
		.engine
		.submit_review(receiver.id, order.id, 5, Some("Fast".into()))
		.await
		.unwrap();
	assert_eq!(review.rating, 5);
	assert_eq!(review.reviewed_id, deliverer.id);

	let rated = f.engine.get_user(deliverer.id, deliverer.id).await.unwrap();
	assert_eq!(rated.rating_average, 5.0);
	assert_eq!(rated.rating_count, 1);

	let stored = f.engine.get_order(receiver.id, order.id).await.unwrap();
	assert_eq!(stored.review_id, Some(review.id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_accepts_have_single_winner() {
	let f = fixture().await;
	let receiver = f.resident(Role::Receiver, &f.tower_a).await;
	let first = f.resident(Role::Deliverer, &f.tower_b).await;
	let second = f.resident(Role::ReceiverAndDeliverer, &f.tower_b).await;
	let order = f.post(&receiver, twenty()).await;

	let mut handles = Vec::new();
	for deliverer in [first.id, second.id] {
		let engine = f.engine.clone();
		let order_id = order.id;
		handles.push(tokio::spawn(async move {
			engine.accept_order(deliverer, order_id).await
		}));
	}

	let mut results = Vec::new();
	for handle in handles {
		results.push(handle.await.unwrap());
	}
	assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
	let loser = results
		.iter()
		.find_map(|r| r.as_ref().err())
		.unwrap();
	assert_eq!(loser.kind(), ErrorKind::Conflict);

	let winner = results.iter().find_map(|r| r.as_ref().ok()).unwrap();
	let stored = f.engine.get_order(receiver.id, order.id).await.unwrap();
	assert_eq!(stored.deliverer_id, winner.deliverer_id);
}

#[tokio::test]
async fn test_deliverer_from_other_condominium_is_forbidden() {
	let f = fixture().await;
	let receiver = f.resident(Role::Receiver, &f.tower_a).await;

	let elsewhere = f
		.engine
		.create_condominium(
			f.admin.id,
			CreateCondominiumRequest {
				name: "El Bosque".into(),
				address: "Camino 9".into(),
				district: String::new(),
				region: String::new(),
				entries: 1,
			},
		)
		.await
		.unwrap();
	let far = f
		.engine
		.create_department(
			f.admin.id,
			elsewhere.id,
			CreateDepartmentRequest {
				name: "11".into(),
				tower: "A".into(),
				floor: 1,
			},
		)
		.await
		.unwrap();
	let outsider = f.resident(Role::Deliverer, &far).await;
	let order = f.post(&receiver, twenty()).await;

	// Visible in the backlog, refused at claim time.
	let visible = f
		.engine
		.list_available_orders(outsider.id, OrderFilters::default())
		.await
		.unwrap();
	assert!(visible.iter().any(|o| o.id == order.id));

	let err = f
		.engine
		.accept_order(outsider.id, order.id)
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Forbidden);
	assert!(err.to_string().contains("canAcceptOrder"));
}

#[tokio::test]
async fn test_strict_matching_hides_other_condominiums() {
	let mut config = Config::for_testing();
	config.orders.strict_condominium_matching = true;
	let f = fixture_with(config).await;
	let receiver = f.resident(Role::Receiver, &f.tower_a).await;
	let order = f.post(&receiver, twenty()).await;

	let elsewhere = f
		.engine
		.create_condominium(
			f.admin.id,
			CreateCondominiumRequest {
				name: "El Bosque".into(),
				address: "Camino 9".into(),
				district: String::new(),
				region: String::new(),
				entries: 1,
			},
		)
		.await
		.unwrap();
	let far = f
		.engine
		.create_department(
			f.admin.id,
			elsewhere.id,
			CreateDepartmentRequest {
				name: "11".into(),
				tower: "A".into(),
				floor: 1,
			},
		)
		.await
		.unwrap();
	let outsider = f.resident(Role::Deliverer, &far).await;
	let neighbour = f.resident(Role::Deliverer, &f.tower_b).await;

	let hidden = f
		.engine
		.list_available_orders(outsider.id, OrderFilters::default())
		.await
		.unwrap();
	assert!(hidden.is_empty());

	let shown = f
		.engine
		.list_available_orders(neighbour.id, OrderFilters::default())
		.await
		.unwrap();
	assert_eq!(shown.len(), 1);
	assert_eq!(shown[0].id, order.id);
}

#[tokio::test]
async fn test_receiver_cannot_cancel_in_progress_order() {
	let f = fixture().await;
	let receiver = f.resident(Role::Receiver, &f.tower_a).await;
	let deliverer = f.resident(Role::Deliverer, &f.tower_b).await;
	let order = f.post(&receiver, twenty()).await;

	f.engine
		.accept_order(deliverer.id, order.id)
		.await
		.unwrap();
	f.engine
		.start_order(deliverer.id, order.id)
		.await
		.unwrap();

	let err = f
		.engine
		.cancel_order(receiver.id, order.id)
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::InvalidTransition);
}

#[tokio::test]
async fn test_cancel_rules_follow_roles() {
	let f = fixture().await;
	let receiver = f.resident(Role::Receiver, &f.tower_a).await;
	let deliverer = f.resident(Role::Deliverer, &f.tower_b).await;
	let bystander = f.resident(Role::Deliverer, &f.tower_b).await;

	let pending = f.post(&receiver, twenty()).await;
	let err = f
		.engine
		.cancel_order(bystander.id, pending.id)
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Forbidden);
	let cancelled = f
		.engine
		.cancel_order(receiver.id, pending.id)
		.await
		.unwrap();
	assert_eq!(cancelled.status, OrderStatus::Cancelled);
	assert!(cancelled.deliverer_id.is_none());

	let accepted = f.post(&receiver, twenty()).await;
	f.engine
		.accept_order(deliverer.id, accepted.id)
		.await
		.unwrap();
	let dropped = f
		.engine
		.cancel_order(deliverer.id, accepted.id)
		.await
		.unwrap();
	assert_eq!(dropped.status, OrderStatus::Cancelled);
	assert_eq!(dropped.deliverer_id, Some(deliverer.id));

	let again = f
		.engine
		.cancel_order(receiver.id, accepted.id)
		.await
		.unwrap_err();
	assert_eq!(again.kind(), ErrorKind::InvalidTransition);
}

#[tokio::test]
async fn test_cannot_accept_own_order() {
	let f = fixture().await;
	let both = f.resident(Role::ReceiverAndDeliverer, &f.tower_a).await;
	let order = f.post(&both, twenty()).await;

	let err = f.engine.accept_order(both.id, order.id).await.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Forbidden);
}

#[tokio::test]
async fn test_reject_returns_order_to_backlog() {
	let f = fixture().await;
	let receiver = f.resident(Role::Receiver, &f.tower_a).await;
	let first = f.resident(Role::Deliverer, &f.tower_b).await;
	let second = f.resident(Role::Deliverer, &f.tower_b).await;
	let order = f.post(&receiver, twenty()).await;

	f.engine.accept_order(first.id, order.id).await.unwrap();
	let taken = f
		.engine
		.accept_order(second.id, order.id)
		.await
		.unwrap_err();
	assert!(matches!(taken, EngineError::OrderTaken(id) if id == order.id));

	let rejected = f.engine.reject_order(first.id, order.id).await.unwrap();
	assert_eq!(rejected.status, OrderStatus::Pending);
	assert!(rejected.deliverer_id.is_none());

	let reclaimed = f.engine.accept_order(second.id, order.id).await.unwrap();
	assert_eq!(reclaimed.deliverer_id, Some(second.id));

	let err = f.engine.reject_order(first.id, order.id).await.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Forbidden);
}

#[tokio::test]
async fn test_assignment_flow() {
	let f = fixture().await;
	let receiver = f.resident(Role::Receiver, &f.tower_a).await;
	let chosen = f.resident(Role::Deliverer, &f.tower_b).await;
	let other = f.resident(Role::Deliverer, &f.tower_b).await;
	let order = f.post(&receiver, twenty()).await;

	let err = f
		.engine
		.assign_order(other.id, order.id, chosen.id)
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Forbidden);

	let err = f
		.engine
		.assign_order(f.admin.id, order.id, receiver.id)
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::InvalidInput);

	let assigned = f
		.engine
		.assign_order(f.admin.id, order.id, chosen.id)
		.await
		.unwrap();
	assert_eq!(assigned.status, OrderStatus::Assigned);
	assert_eq!(assigned.deliverer_id, Some(chosen.id));

	let err = f.engine.accept_order(other.id, order.id).await.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Conflict);

	let accepted = f.engine.accept_order(chosen.id, order.id).await.unwrap();
	assert_eq!(accepted.status, OrderStatus::Accepted);
	assert_eq!(accepted.deliverer_id, Some(chosen.id));
}

#[tokio::test]
async fn test_assigned_deliverer_can_decline() {
	let f = fixture().await;
	let receiver = f.resident(Role::Receiver, &f.tower_a).await;
	let chosen = f.resident(Role::Deliverer, &f.tower_b).await;
	let order = f.post(&receiver, twenty()).await;

	f.engine
		.assign_order(f.admin.id, order.id, chosen.id)
		.await
		.unwrap();
	let declined = f.engine.reject_order(chosen.id, order.id).await.unwrap();
	assert_eq!(declined.status, OrderStatus::Pending);
	assert!(declined.deliverer_id.is_none());
}

#[tokio::test]
async fn test_capacity_limits_active_orders() {
	let mut config = Config::for_testing();
	config.orders.max_active_orders = 1;
	let f = fixture_with(config).await;
	let receiver = f.resident(Role::Receiver, &f.tower_a).await;
	let deliverer = f.resident(Role::Deliverer, &f.tower_b).await;
	let first = f.post(&receiver, twenty()).await;
	let second = f.post(&receiver, twenty()).await;

	f.engine.accept_order(deliverer.id, first.id).await.unwrap();
	let err = f
		.engine
		.accept_order(deliverer.id, second.id)
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Forbidden);

	f.engine.start_order(deliverer.id, first.id).await.unwrap();
	f.engine
		.complete_order(deliverer.id, first.id)
		.await
		.unwrap();
	f.engine
		.accept_order(deliverer.id, second.id)
		.await
		.unwrap();
}

#[tokio::test]
async fn test_order_creation_is_rate_limited() {
	let mut config = Config::for_testing();
	config.orders.order_creation_limit_per_hour = 2;
	let f = fixture_with(config).await;
	let receiver = f.resident(Role::Receiver, &f.tower_a).await;

	f.post(&receiver, twenty()).await;
	f.post(&receiver, twenty()).await;
	let err = f
		.engine
		.create_order(
			receiver.id,
			CreateOrderRequest {
				department_id: None,
				amount: twenty(),
				scheduled_date: f.clock.now(),
				is_immediate: false,
				delivery_notes: None,
			},
		)
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::RateLimited);
	assert!(matches!(err, EngineError::RateLimited { retry_after } if retry_after == 3600));

	f.clock.advance(Duration::minutes(61));
	f.post(&receiver, twenty()).await;
}

#[tokio::test]
async fn test_create_order_validation() {
	let f = fixture().await;
	let receiver = f.resident(Role::Receiver, &f.tower_a).await;
	let deliverer = f.resident(Role::Deliverer, &f.tower_b).await;

	let request = |amount: Decimal| CreateOrderRequest {
		department_id: None,
		amount,
		scheduled_date: f.clock.now(),
		is_immediate: true,
		delivery_notes: None,
	};

	let err = f
		.engine
		.create_order(receiver.id, request(Decimal::ZERO))
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::InvalidInput);

	let err = f
		.engine
		.create_order(deliverer.id, request(twenty()))
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Forbidden);

	let homeless = f
		.engine
		.register_user(registration("nobody@condo.cl", Role::Receiver, None))
		.await
		.unwrap();
	let err = f
		.engine
		.create_order(homeless.id, request(twenty()))
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::InvalidInput);

	let err = f
		.engine
		.create_order(Uuid::new_v4(), request(twenty()))
		.await
		.unwrap_err();
	assert!(matches!(err, EngineError::UnknownActor(_)));
}

#[tokio::test]
async fn test_direct_completion_requires_policy() {
	let f = fixture().await;
	let receiver = f.resident(Role::Receiver, &f.tower_a).await;
	let deliverer = f.resident(Role::Deliverer, &f.tower_b).await;
	let order = f.post(&receiver, twenty()).await;
	f.engine
		.accept_order(deliverer.id, order.id)
		.await
		.unwrap();
	let err = f
		.engine
		.complete_order(deliverer.id, order.id)
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Forbidden);

	let mut config = Config::for_testing();
	config.orders.allow_direct_completion = true;
	let lenient = fixture_with(config).await;
	let receiver = lenient.resident(Role::Receiver, &lenient.tower_a).await;
	let deliverer = lenient.resident(Role::Deliverer, &lenient.tower_b).await;
	let order = lenient.post(&receiver, twenty()).await;
	lenient
		.engine
		.accept_order(deliverer.id, order.id)
		.await
		.unwrap();
	let completed = lenient
		.engine
		.complete_order(deliverer.id, order.id)
		.await
		.unwrap();
	assert_eq!(completed.status, OrderStatus::Completed);
	assert!(completed.completed_at.is_some());
}

#[tokio::test]
async fn test_availability_toggle_blocked_by_active_orders() {
	let f = fixture().await;
	let receiver = f.resident(Role::Receiver, &f.tower_a).await;
	let deliverer = f.resident(Role::Deliverer, &f.tower_b).await;
	let order = f.post(&receiver, twenty()).await;

	f.engine
		.accept_order(deliverer.id, order.id)
		.await
		.unwrap();
	let err = f
		.engine
		.toggle_availability(deliverer.id, deliverer.id)
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Forbidden);

	f.engine.start_order(deliverer.id, order.id).await.unwrap();
	f.engine
		.complete_order(deliverer.id, order.id)
		.await
		.unwrap();
	let off = f
		.engine
		.toggle_availability(deliverer.id, deliverer.id)
		.await
		.unwrap();
	assert!(!off.is_available_for_delivery);

	let err = f
		.engine
		.toggle_availability(receiver.id, receiver.id)
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Forbidden);

	let err = f
		.engine
		.toggle_availability(receiver.id, deliverer.id)
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Forbidden);
}

#[tokio::test]
async fn test_unavailable_deliverer_cannot_accept() {
	let f = fixture().await;
	let receiver = f.resident(Role::Receiver, &f.tower_a).await;
	let deliverer = f.resident(Role::Deliverer, &f.tower_b).await;
	f.engine
		.toggle_availability(deliverer.id, deliverer.id)
		.await
		.unwrap();
	let order = f.post(&receiver, twenty()).await;

	let err = f
		.engine
		.accept_order(deliverer.id, order.id)
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Forbidden);
}

#[tokio::test]
async fn test_delete_order() {
	let f = fixture().await;
	let receiver = f.resident(Role::Receiver, &f.tower_a).await;
	let deliverer = f.resident(Role::Deliverer, &f.tower_b).await;
	let order = f.post(&receiver, twenty()).await;

	let err = f
		.engine
		.delete_order(deliverer.id, order.id)
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Forbidden);

	f.engine.delete_order(receiver.id, order.id).await.unwrap();
	let err = f.engine.get_order(receiver.id, order.id).await.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::NotFound);

	let held = f.post(&receiver, twenty()).await;
	f.engine.accept_order(deliverer.id, held.id).await.unwrap();
	let err = f
		.engine
		.delete_order(receiver.id, held.id)
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Forbidden);
}

#[tokio::test]
async fn test_review_rules() {
	let f = fixture().await;
	let receiver = f.resident(Role::Receiver, &f.tower_a).await;
	let deliverer = f.resident(Role::Deliverer, &f.tower_b).await;
	let order = f.post(&receiver, twenty()).await;

	let err = f
		.engine
		.submit_review(receiver.id, order.id, 4, None)
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Forbidden);

	f.deliver(&order, &deliverer).await;

	let err = f
		.engine
		.submit_review(receiver.id, order.id, 6, None)
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::InvalidInput);

	let err = f
		.engine
		.submit_review(deliverer.id, order.id, 5, None)
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Forbidden);

	f.engine
		.submit_review(receiver.id, order.id, 4, None)
		.await
		.unwrap();
	let err = f
		.engine
		.submit_review(receiver.id, order.id, 5, None)
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Forbidden);

	let rated = f.engine.get_user(f.admin.id, deliverer.id).await.unwrap();
	assert_eq!(rated.rating_count, 1);
	assert_eq!(rated.rating_average, 4.0);
}

#[tokio::test]
async fn test_ratings_average_over_orders() {
	let f = fixture().await;
	let receiver = f.resident(Role::Receiver, &f.tower_a).await;
	let deliverer = f.resident(Role::Deliverer, &f.tower_b).await;

	for rating in [5, 3, 4] {
		let order = f.post(&receiver, twenty()).await;
		f.deliver(&order, &deliverer).await;
		f.engine
			.submit_review(receiver.id, order.id, rating, None)
			.await
			.unwrap();
	}

	let rated = f.engine.get_user(deliverer.id, deliverer.id).await.unwrap();
	assert!((rated.rating_average - 4.0).abs() < 1e-9);
	assert_eq!(rated.rating_count, 3);
}

#[tokio::test]
async fn test_earnings_and_rankings() {
	let f = fixture().await;
	let receiver = f.resident(Role::Receiver, &f.tower_a).await;
	let deliverer = f.resident(Role::Deliverer, &f.tower_b).await;
	let idle = f.resident(Role::Deliverer, &f.tower_a).await;

	let order = f.post(&receiver, twenty()).await;
	f.deliver(&order, &deliverer).await;
	f.engine
		.submit_review(receiver.id, order.id, 5, None)
		.await
		.unwrap();
	let cancelled = f.post(&receiver, twenty()).await;
	f.engine
		.accept_order(deliverer.id, cancelled.id)
		.await
		.unwrap();
	f.engine
		.cancel_order(receiver.id, cancelled.id)
		.await
		.unwrap();

	let summary = f.engine.earnings_summary(deliverer.id, None).await.unwrap();
	assert_eq!(summary.today.earnings, twenty());
	assert_eq!(summary.today.completed_count, 1);
	assert_eq!(summary.today.total_count, 2);
	assert_eq!(summary.completion_rate, 50.0);
	assert_eq!(summary.avg_delivery_minutes, 20.0);
	assert_eq!(summary.total, twenty());
	assert_eq!(summary.goal_remaining, Decimal::new(480, 0));
	assert_eq!(summary.ratings.total_reviews, 1);
	assert_eq!(summary.ratings.average, 5.0);
	assert_eq!(summary.ratings.distribution.get(&5), Some(&1));

	let untouched = f.engine.earnings_summary(idle.id, None).await.unwrap();
	assert_eq!(untouched.ratings.total_reviews, 0);
	assert!(untouched.ratings.distribution.is_empty());

	let err = f
		.engine
		.earnings_summary(receiver.id, None)
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Forbidden);

	let rankings = f.engine.deliverer_rankings(f.admin.id, None).await.unwrap();
	assert_eq!(rankings.len(), 2);
	assert_eq!(rankings[0].user_id, deliverer.id);
	assert_eq!(rankings[0].cancelled_orders, 1);
	assert_eq!(rankings[1].user_id, idle.id);

	let err = f
		.engine
		.deliverer_rankings(deliverer.id, None)
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Forbidden);
}

#[tokio::test]
async fn test_listing_and_history() {
	let f = fixture().await;
	let receiver = f.resident(Role::Receiver, &f.tower_a).await;
	let deliverer = f.resident(Role::Deliverer, &f.tower_b).await;
	let first = f.post(&receiver, twenty()).await;
	f.clock.advance(Duration::minutes(1));
	let second = f.post(&receiver, Decimal::new(500, 2)).await;

	let err = f
		.engine
		.list_available_orders(receiver.id, OrderFilters::default())
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Forbidden);

	let bad_range = OrderFilters {
		min_amount: Some(Decimal::new(10, 0)),
		max_amount: Some(Decimal::new(1, 0)),
		..Default::default()
	};
	let err = f
		.engine
		.list_available_orders(deliverer.id, bad_range)
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::InvalidInput);

	f.engine
		.accept_order(deliverer.id, first.id)
		.await
		.unwrap();
	let available = f
		.engine
		.list_available_orders(deliverer.id, OrderFilters::default())
		.await
		.unwrap();
	assert_eq!(available.len(), 1);
	assert_eq!(available[0].id, second.id);

	let requests = f.engine.my_requests(receiver.id).await.unwrap();
	let ids: Vec<_> = requests.iter().map(|o| o.id).collect();
	assert_eq!(ids, vec![second.id, first.id]);

	let deliveries = f.engine.my_deliveries(deliverer.id).await.unwrap();
	assert_eq!(deliveries.len(), 1);
	assert_eq!(deliveries[0].id, first.id);
}

#[tokio::test]
async fn test_role_management() {
	let f = fixture().await;
	let resident = f.resident(Role::Receiver, &f.tower_a).await;
	let neighbour = f.resident(Role::Receiver, &f.tower_a).await;

	let err = f
		.engine
		.register_user(registration("second-admin@condo.cl", Role::Admin, None))
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Forbidden);

	let both = f
		.engine
		.update_role(resident.id, resident.id, Role::ReceiverAndDeliverer)
		.await
		.unwrap();
	assert_eq!(both.role, Role::ReceiverAndDeliverer);

	let err = f
		.engine
		.update_role(neighbour.id, resident.id, Role::Deliverer)
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Forbidden);

	let err = f
		.engine
		.update_role(resident.id, resident.id, Role::Admin)
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Forbidden);

	let promoted = f
		.engine
		.update_role(f.admin.id, resident.id, Role::Admin)
		.await
		.unwrap();
	assert_eq!(promoted.role, Role::Admin);

	let moved = f
		.engine
		.set_department(neighbour.id, neighbour.id, f.tower_b.id)
		.await
		.unwrap();
	assert_eq!(moved.department.map(|d| d.id), Some(f.tower_b.id));

	let err = f
		.engine
		.set_department(neighbour.id, neighbour.id, Uuid::new_v4())
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test]
async fn test_events_are_published() {
	let f = fixture().await;
	let receiver = f.resident(Role::Receiver, &f.tower_a).await;
	let deliverer = f.resident(Role::Deliverer, &f.tower_b).await;
	let mut events = f.engine.event_bus().subscribe();

	let order = f.post(&receiver, twenty()).await;
	f.engine
		.accept_order(deliverer.id, order.id)
		.await
		.unwrap();

	match events.recv().await.unwrap() {
		EngineEvent::Order(OrderEvent::Created { order: created }) => {
			assert_eq!(created.id, order.id)
		},
		other => panic!("unexpected event: {:?}", other),
	}
	match events.recv().await.unwrap() {
		EngineEvent::Order(OrderEvent::Transitioned {
			order_id,
			action,
			from,
			to,
			..
		}) => {
			assert_eq!(order_id, order.id);
			assert_eq!(action, OrderAction::Accept);
			assert_eq!(from, OrderStatus::Pending);
			assert_eq!(to, OrderStatus::Accepted);
		},
		other => panic!("unexpected event: {:?}", other),
	}
}

#[tokio::test]
async fn test_lifecycle_on_file_storage() {
	let dir = tempfile::tempdir().unwrap();
	let backend = Box::new(FileStorage::new(dir.path().to_path_buf()));
	let f = fixture_on(Config::for_testing(), backend).await;
	let receiver = f.resident(Role::Receiver, &f.tower_a).await;
	let first = f.resident(Role::Deliverer, &f.tower_b).await;
	let second = f.resident(Role::Deliverer, &f.tower_b).await;
	let order = f.post(&receiver, twenty()).await;

	let (a, b) = tokio::join!(
		f.engine.accept_order(first.id, order.id),
		f.engine.accept_order(second.id, order.id)
	);
	assert!(a.is_ok() != b.is_ok());

	let winner = if a.is_ok() { &first } else { &second };
	f.engine.start_order(winner.id, order.id).await.unwrap();
	f.engine
		.complete_order(winner.id, order.id)
		.await
		.unwrap();
	f.engine
		.submit_review(receiver.id, order.id, 3, None)
		.await
		.unwrap();

	let rated = f.engine.get_user(f.admin.id, winner.id).await.unwrap();
	assert_eq!(rated.rating_count, 1);
	assert_eq!(rated.rating_average, 3.0);
}

/// Memory backend whose order writes can be made to fail.
struct FailingOrderWrites {
	inner: MemoryStorage,
	failing: Arc<AtomicBool>,
}

#[async_trait]
impl StorageInterface for FailingOrderWrites {
	async fn get_bytes(&self, key: &str) -> Result<Vec<u8>, StorageError> {
		self.inner.get_bytes(key).await
	}

	async fn scan_prefix(&self, prefix: &str) -> Result<Vec<Vec<u8>>, StorageError> {
		self.inner.scan_prefix(prefix).await
	}

	async fn commit(&self, ops: Vec<WriteOp>) -> Result<(), StorageError> {
		if self.failing.load(Ordering::SeqCst) && ops.iter().any(|op| op.key.starts_with("orders:")) {
			return Err(StorageError::Backend("disk full".into()));
		}
		self.inner.commit(ops).await
	}

	fn config_schema(&self) -> Box<dyn ConfigSchema> {
		self.inner.config_schema()
	}
}

#[tokio::test]
async fn test_failed_order_store_keeps_creation_quota() {
	let mut config = Config::for_testing();
	config.orders.order_creation_limit_per_hour = 1;
	let failing = Arc::new(AtomicBool::new(false));
	let backend = Box::new(FailingOrderWrites {
		inner: MemoryStorage::new(),
		failing: failing.clone(),
	});
	let f = fixture_on(config, backend).await;
	let receiver = f.resident(Role::Receiver, &f.tower_a).await;

	failing.store(true, Ordering::SeqCst);
	let err = f
		.engine
		.create_order(
			receiver.id,
			CreateOrderRequest {
				department_id: None,
				amount: twenty(),
				scheduled_date: f.clock.now(),
				is_immediate: true,
				delivery_notes: None,
			},
		)
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Internal);

	failing.store(false, Ordering::SeqCst);
	let order = f.post(&receiver, twenty()).await;
	assert_eq!(order.status, OrderStatus::Pending);
}

#[tokio::test]
async fn test_user_records_are_private() {
	let f = fixture().await;
	let receiver = f.resident(Role::Receiver, &f.tower_a).await;
	let deliverer = f.resident(Role::Deliverer, &f.tower_b).await;

	let err = f
		.engine
		.get_user(receiver.id, deliverer.id)
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Forbidden);
	assert!(err.to_string().contains("canManageUser"));

	let own = f.engine.get_user(deliverer.id, deliverer.id).await.unwrap();
	assert_eq!(own.email, deliverer.email);
	let seen_by_admin = f.engine.get_user(f.admin.id, deliverer.id).await.unwrap();
	assert_eq!(seen_by_admin.id, deliverer.id);
}

#[tokio::test]
async fn test_available_deliverers() {
	let f = fixture().await;
	let receiver = f.resident(Role::Receiver, &f.tower_a).await;
	let rated = f.resident(Role::Deliverer, &f.tower_b).await;
	let fresh = f.resident(Role::ReceiverAndDeliverer, &f.tower_a).await;
	let resting = f.resident(Role::Deliverer, &f.tower_b).await;
	f.engine
		.toggle_availability(resting.id, resting.id)
		.await
		.unwrap();

	let order = f.post(&receiver, twenty()).await;
	f.deliver(&order, &rated).await;
	f.engine
		.submit_review(receiver.id, order.id, 4, None)
		.await
		.unwrap();

	let listing = f
		.engine
		.available_deliverers(receiver.id, None)
		.await
		.unwrap();
	assert_eq!(listing.condominium_name, "Los Aromos");
	assert_eq!(listing.count, 2);
	let ids: Vec<_> = listing.deliverers.iter().map(|d| d.profile.id).collect();
	assert_eq!(ids, vec![rated.id, fresh.id]);
	assert_eq!(listing.deliverers[0].statistics.completed_orders, 1);
	assert_eq!(listing.deliverers[0].statistics.average_rating, 4.0);
	assert!(listing.deliverers[0].statistics.is_currently_available);

	// The caller never lists themselves.
	let own_view = f
		.engine
		.available_deliverers(fresh.id, None)
		.await
		.unwrap();
	assert!(own_view.deliverers.iter().all(|d| d.profile.id != fresh.id));

	let err = f
		.engine
		.available_deliverers(f.admin.id, None)
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::InvalidInput);

	let by_admin = f
		.engine
		.available_deliverers(f.admin.id, Some(f.tower_a.condominium_id))
		.await
		.unwrap();
	assert_eq!(by_admin.count, 2);

	let err = f
		.engine
		.available_deliverers(f.admin.id, Some(Uuid::new_v4()))
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_active_order_count_follows_lifecycle() {
	let f = fixture().await;
	let receiver = f.resident(Role::Receiver, &f.tower_a).await;
	let deliverer = f.resident(Role::Deliverer, &f.tower_b).await;
	let active = |user: User| user.active_orders;

	let claimed = f.post(&receiver, twenty()).await;
	let assigned = f.post(&receiver, twenty()).await;
	f.engine
		.accept_order(deliverer.id, claimed.id)
		.await
		.unwrap();
	f.engine
		.assign_order(f.admin.id, assigned.id, deliverer.id)
		.await
		.unwrap();
	let me = f.engine.get_user(deliverer.id, deliverer.id).await.unwrap();
	assert_eq!(active(me), 2);

	// Accepting an order already assigned to you does not count it twice.
	f.engine
		.accept_order(deliverer.id, assigned.id)
		.await
		.unwrap();
	f.engine
		.start_order(deliverer.id, assigned.id)
		.await
		.unwrap();
	let me = f.engine.get_user(deliverer.id, deliverer.id).await.unwrap();
	assert_eq!(active(me), 2);

	f.engine
		.cancel_order(receiver.id, claimed.id)
		.await
		.unwrap();
	f.engine
		.complete_order(deliverer.id, assigned.id)
		.await
		.unwrap();
	let me = f.engine.get_user(deliverer.id, deliverer.id).await.unwrap();
	assert_eq!(active(me), 0);

	let returned = f.post(&receiver, twenty()).await;
	f.engine
		.accept_order(deliverer.id, returned.id)
		.await
		.unwrap();
	f.engine
		.reject_order(deliverer.id, returned.id)
		.await
		.unwrap();
	let me = f.engine.get_user(deliverer.id, deliverer.id).await.unwrap();
	assert_eq!(active(me), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_accepts_respect_capacity() {
	let mut config = Config::for_testing();
	config.orders.max_active_orders = 1;
	config.orders.order_creation_limit_per_hour = 0;
	let f = fixture_with(config).await;
	let receiver = f.resident(Role::Receiver, &f.tower_a).await;
	let deliverer = f.resident(Role::Deliverer, &f.tower_b).await;

	for _ in 0..10 {
		let first = f.post(&receiver, twenty()).await;
		let second = f.post(&receiver, twenty()).await;

		let handles: Vec<_> = [first.id, second.id]
			.into_iter()
			.map(|order_id| {
				let engine = f.engine.clone();
				let deliverer_id = deliverer.id;
				tokio::spawn(async move { engine.accept_order(deliverer_id, order_id).await })
			})
			.collect();
		let mut won = Vec::new();
		for handle in handles {
			match handle.await.unwrap() {
				Ok(order) => won.push(order),
				Err(e) => assert!(matches!(
					e.kind(),
					ErrorKind::Forbidden | ErrorKind::Conflict
				)),
			}
		}
		assert_eq!(won.len(), 1, "both claims went through at capacity 1");

		let me = f.engine.get_user(deliverer.id, deliverer.id).await.unwrap();
		assert_eq!(me.active_orders, 1);

		f.engine
			.reject_order(deliverer.id, won[0].id)
			.await
			.unwrap();
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_going_offline_races_accept_safely() {
	let mut config = Config::for_testing();
	config.orders.order_creation_limit_per_hour = 0;
	let f = fixture_with(config).await;
	let receiver = f.resident(Role::Receiver, &f.tower_a).await;
	let deliverer = f.resident(Role::Deliverer, &f.tower_b).await;

	for _ in 0..10 {
		let order = f.post(&receiver, twenty()).await;

		let accept = {
			let engine = f.engine.clone();
			let (deliverer_id, order_id) = (deliverer.id, order.id);
			tokio::spawn(async move { engine.accept_order(deliverer_id, order_id).await })
		};
		let toggle = {
			let engine = f.engine.clone();
			let deliverer_id = deliverer.id;
			tokio::spawn(async move { engine.toggle_availability(deliverer_id, deliverer_id).await })
		};
		let accepted = accept.await.unwrap();
		let toggled = toggle.await.unwrap();
		assert!(
			!(accepted.is_ok() && toggled.is_ok()),
			"deliverer went offline while claiming an order"
		);

		let me = f.engine.get_user(deliverer.id, deliverer.id).await.unwrap();
		let held = f
			.engine
			.my_deliveries(deliverer.id)
			.await
			.unwrap()
			.into_iter()
			.filter(|o| o.status.is_active_delivery())
			.count();
		assert_eq!(me.active_orders as usize, held);
		assert!(me.is_available_for_delivery || held == 0);

		if accepted.is_ok() {
			f.engine
				.reject_order(deliverer.id, order.id)
				.await
				.unwrap();
		}
		if !me.is_available_for_delivery {
			f.engine
				.toggle_availability(deliverer.id, deliverer.id)
				.await
				.unwrap();
		}
	}
}

#[tokio::test]
async fn test_failed_review_commit_on_file_storage_applies_nothing() {
	let dir = tempfile::tempdir().unwrap();
	let backend = Box::new(FileStorage::new(dir.path().to_path_buf()));
	let f = fixture_on(Config::for_testing(), backend).await;
	let receiver = f.resident(Role::Receiver, &f.tower_a).await;
	let deliverer = f.resident(Role::Deliverer, &f.tower_b).await;
	let order = f.post(&receiver, twenty()).await;
	f.deliver(&order, &deliverer).await;

	// Staging the deliverer's new rating fails after the review and the
	// order link are already staged.
	let blocker = dir.path().join(format!("users_{}.tmp", deliverer.id));
	std::fs::create_dir(&blocker).unwrap();

	let err = f
		.engine
		.submit_review(receiver.id, order.id, 2, None)
		.await
		.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::Internal);

	let stored = f.engine.get_order(receiver.id, order.id).await.unwrap();
	assert!(stored.review_id.is_none());
	let me = f.engine.get_user(deliverer.id, deliverer.id).await.unwrap();
	assert_eq!(me.rating_count, 0);

	std::fs::remove_dir(&blocker).unwrap();
	let review = f
		.engine
		.submit_review(receiver.id, order.id, 2, None)
		.await
		.unwrap();
	let stored = f.engine.get_order(receiver.id, order.id).await.unwrap();
	assert_eq!(stored.review_id, Some(review.id));
	let me = f.engine.get_user(deliverer.id, deliverer.id).await.unwrap();
	assert_eq!(me.rating_count, 1);
	assert_eq!(me.rating_average, 2.0);
}
