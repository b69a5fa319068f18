//! HTTP server for the Repartidev API.
//!
//! Builds the axum router over a shared [`DeliveryEngine`] and serves it on
//! the configured address. Every route lives under `/api`.

use crate::apis::{directory, earnings, orders, users};
use axum::{
	error_handling::HandleErrorLayer,
	extract::DefaultBodyLimit,
	http::{HeaderValue, StatusCode},
	response::Json,
	routing::{get, post, put},
	BoxError, Router,
};
use repartidev_config::{ApiConfig, CorsConfig};
use repartidev_core::DeliveryEngine;
use repartidev_types::ErrorResponse;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower::{timeout::TimeoutLayer, ServiceBuilder};
use tower_http::{
	cors::{Any, CorsLayer},
	trace::TraceLayer,
};

/// Shared application state for the API server.
#[derive(Clone)]
pub struct AppState {
	/// Engine every handler delegates to.
	pub engine: Arc<DeliveryEngine>,
}

/// Builds the API router with its middleware stack.
pub fn router(engine: Arc<DeliveryEngine>, api_config: &ApiConfig) -> Router {
	let api = Router::new()
		.route("/health", get(health))
		.route("/condominiums", post(directory::create_condominium))
		.route(
			"/condominiums/{id}/departments",
			post(directory::create_department),
		)
		.route("/users", post(users::register_user))
		.route(
			"/users/available-deliverers",
			get(users::available_deliverers),
		)
		.route("/users/{id}", get(users::get_user))
		.route("/users/{id}/role", put(users::update_role))
		.route("/users/{id}/department", put(users::set_department))
		.route(
			"/users/{id}/availability",
			post(users::toggle_availability),
		)
		.route("/orders", post(orders::create_order))
		.route("/orders/available", get(orders::list_available))
		.route("/orders/requests", get(orders::my_requests))
		.route("/orders/deliveries", get(orders::my_deliveries))
		.route(
			"/orders/{id}",
			get(orders::get_order).delete(orders::delete_order),
		)
		.route("/orders/{id}/accept", post(orders::accept_order))
		.route("/orders/{id}/reject", post(orders::reject_order))
		.route("/orders/{id}/start", post(orders::start_order))
		.route("/orders/{id}/complete", post(orders::complete_order))
		.route("/orders/{id}/cancel", post(orders::cancel_order))
		.route("/orders/{id}/assign", post(orders::assign_order))
		.route("/orders/{id}/review", post(orders::submit_review))
		.route("/earnings", get(earnings::earnings_summary))
		.route("/reports/deliverers", get(earnings::deliverer_rankings));

	Router::new()
		.nest("/api", api)
		.layer(DefaultBodyLimit::max(api_config.max_request_size))
		.layer(
			ServiceBuilder::new()
				.layer(HandleErrorLayer::new(handle_timeout_error))
				.layer(TimeoutLayer::new(Duration::from_secs(
					api_config.timeout_seconds,
				))),
		)
		.layer(cors_layer(api_config.cors.as_ref()))
		.layer(TraceLayer::new_for_http())
		.with_state(AppState { engine })
}

/// Starts the HTTP server and serves until the listener fails.
pub async fn start_server(
	api_config: ApiConfig,
	engine: Arc<DeliveryEngine>,
) -> Result<(), Box<dyn std::error::Error>> {
	let app = router(engine, &api_config);

	let bind_address = format!("{}:{}", api_config.host, api_config.port);
	let listener = TcpListener::bind(&bind_address).await?;

	tracing::info!("Repartidev API server starting on {}", bind_address);

	axum::serve(listener, app).await?;

	Ok(())
}

fn cors_layer(cors: Option<&CorsConfig>) -> CorsLayer {
	match cors {
		Some(cors) => {
			let origins: Vec<HeaderValue> = cors
				.allowed_origins
				.iter()
				.filter_map(|origin| match origin.parse() {
					Ok(value) => Some(value),
					Err(_) => {
						tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
						None
					},
				})
				.collect();
			CorsLayer::new()
				.allow_origin(origins)
				.allow_methods(Any)
				.allow_headers(Any)
		},
		None => CorsLayer::permissive(),
	}
}

/// Handles GET /api/health.
async fn health() -> Json<Value> {
	Json(serde_json::json!({ "status": "ok" }))
}

async fn handle_timeout_error(err: BoxError) -> (StatusCode, Json<ErrorResponse>) {
	let (status, error) = if err.is::<tower::timeout::error::Elapsed>() {
		(StatusCode::REQUEST_TIMEOUT, "REQUEST_TIMEOUT")
	} else {
		(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
	};
	tracing::warn!(error = %err, "Request aborted");
	(
		status,
		Json(ErrorResponse {
			error: error.to_string(),
			message: err.to_string(),
			details: None,
			retry_after: None,
		}),
	)
}

#[cfg(test)]
mod tests {
	use super::*;
	use axum::{body::Body, http::Request};
	use repartidev_config::Config;
	use repartidev_core::{EngineBuilder, EngineFactories};
	use tower::ServiceExt;
	use uuid::Uuid;

	async fn app_with(config: Config) -> Router {
		let factories = EngineFactories {
			storage_factories: repartidev_storage::get_all_implementations()
				.into_iter()
				.map(|(name, factory)| (name.to_string(), factory))
				.collect(),
		};
		let api_config = config.api.clone().unwrap_or(ApiConfig {
			enabled: true,
			host: "127.0.0.1".to_string(),
			port: 3000,
			timeout_seconds: 30,
			max_request_size: 64 * 1024,
			cors: None,
		});
		let engine = EngineBuilder::new(config).build(factories).await.unwrap();
		router(Arc::new(engine), &api_config)
	}

	async fn call(
		app: &Router,
		method: &str,
		uri: &str,
		actor: Option<Uuid>,
		body: Option<Value>,
	) -> (StatusCode, Value) {
		let mut request = Request::builder().method(method).uri(uri);
		if let Some(actor) = actor {
			request = request.header("X-User-Id", actor.to_string());
		}
		let request = match body {
			Some(body) => request
				.header("content-type", "application/json")
				.body(Body::from(body.to_string()))
				.unwrap(),
			None => request.body(Body::empty()).unwrap(),
		};

		let response = app.clone().oneshot(request).await.unwrap();
		let status = response.status();
		let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
			.await
			.unwrap();
		let value = if bytes.is_empty() {
			Value::Null
		} else {
			serde_json::from_slice(&bytes).unwrap()
		};
		(status, value)
	}

	fn id_of(value: &Value) -> Uuid {
		value["id"].as_str().unwrap().parse().unwrap()
	}

	struct Seed {
		admin: Uuid,
		receiver: Uuid,
		deliverers: Vec<Uuid>,
	}

	async fn seed(app: &Router) -> Seed {
		let (status, admin) = call(
			app,
			"POST",
			"/api/users",
			None,
			Some(serde_json::json!({
				"firstName": "Ada",
				"lastName": "Admin",
				"email": "admin@condo.cl",
				"role": "ADMIN"
			})),
		)
		.await;
		assert_eq!(status, StatusCode::CREATED);
		let admin = id_of(&admin);

		let (status, condominium) = call(
			app,
			"POST",
			"/api/condominiums",
			Some(admin),
			Some(serde_json::json!({
				"name": "Los Aromos",
				"address": "Av. Grecia 1200"
			})),
		)
		.await;
		assert_eq!(status, StatusCode::CREATED);

		let (status, department) = call(
			app,
			"POST",
			&format!("/api/condominiums/{}/departments", id_of(&condominium)),
			Some(admin),
			Some(serde_json::json!({ "name": "101", "tower": "A", "floor": 1 })),
		)
		.await;
		assert_eq!(status, StatusCode::CREATED);
		let department = id_of(&department);

		let register = |role: &'static str, email: String| {
			let app = app.clone();
			async move {
				let (status, user) = call(
					&app,
					"POST",
					"/api/users",
					None,
					Some(serde_json::json!({
						"firstName": "Resident",
						"lastName": "Tester",
						"email": email,
						"role": role,
						"departmentId": department
					})),
				)
				.await;
				assert_eq!(status, StatusCode::CREATED);
				id_of(&user)
			}
		};

		let receiver = register("RECEIVER", "receiver@condo.cl".into()).await;
		let mut deliverers = Vec::new();
		for n in 0..2 {
			let deliverer = register("DELIVERER", format!("deliverer{}@condo.cl", n)).await;
			let (status, user) = call(
				app,
				"POST",
				&format!("/api/users/{}/availability", deliverer),
				Some(deliverer),
				None,
			)
			.await;
			assert_eq!(status, StatusCode::OK);
			assert_eq!(user["is_available_for_delivery"], true);
			deliverers.push(deliverer);
		}

		Seed {
			admin,
			receiver,
			deliverers,
		}
	}

	fn order_body() -> Value {
		serde_json::json!({
			"amount": "20.00",
			"scheduledDate": "2024-05-20T13:00:00Z",
			"isImmediate": true
		})
	}

	#[tokio::test]
	async fn test_health() {
		let app = app_with(Config::for_testing()).await;
		let (status, body) = call(&app, "GET", "/api/health", None, None).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(body["status"], "ok");
	}

	#[tokio::test]
	async fn test_actor_header_is_required() {
		let app = app_with(Config::for_testing()).await;

		let (status, body) = call(&app, "GET", "/api/orders/requests", None, None).await;
		assert_eq!(status, StatusCode::UNAUTHORIZED);
		assert_eq!(body["error"], "MISSING_ACTOR");

		let (status, body) = call(
			&app,
			"GET",
			"/api/orders/requests",
			Some(Uuid::new_v4()),
			None,
		)
		.await;
		assert_eq!(status, StatusCode::UNAUTHORIZED);
		assert_eq!(body["error"], "UNKNOWN_ACTOR");
	}

	#[tokio::test]
	async fn test_order_lifecycle_over_http() {
		let app = app_with(Config::for_testing()).await;
		let seed = seed(&app).await;
		let (first, second) = (seed.deliverers[0], seed.deliverers[1]);

		let (status, order) = call(
			&app,
			"POST",
			"/api/orders",
			Some(seed.receiver),
			Some(order_body()),
		)
		.await;
		assert_eq!(status, StatusCode::CREATED);
		assert_eq!(order["status"], 1);
		let order_id = id_of(&order);

		let (status, available) =
			call(&app, "GET", "/api/orders/available", Some(first), None).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(available.as_array().map(Vec::len), Some(1));

		let uri = |action: &str| format!("/api/orders/{}/{}", order_id, action);

		let (status, _) = call(&app, "POST", &uri("accept"), Some(first), None).await;
		assert_eq!(status, StatusCode::OK);

		let (status, body) = call(&app, "POST", &uri("accept"), Some(second), None).await;
		assert_eq!(status, StatusCode::CONFLICT);
		assert_eq!(body["error"], "ORDER_TAKEN");

		let (status, _) = call(&app, "POST", &uri("start"), Some(first), None).await;
		assert_eq!(status, StatusCode::OK);

		let (status, body) = call(&app, "POST", &uri("cancel"), Some(seed.receiver), None).await;
		assert_eq!(status, StatusCode::CONFLICT);
		assert_eq!(body["error"], "INVALID_TRANSITION");

		let (status, order) = call(&app, "POST", &uri("complete"), Some(first), None).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(order["status"], 6);

		let (status, body) = call(
			&app,
			"POST",
			&uri("review"),
			Some(seed.receiver),
			Some(serde_json::json!({ "rating": 7 })),
		)
		.await;
		assert_eq!(status, StatusCode::BAD_REQUEST);
		assert_eq!(body["error"], "INVALID_INPUT");

		let (status, _) = call(
			&app,
			"POST",
			&uri("review"),
			Some(seed.receiver),
			Some(serde_json::json!({ "rating": 5, "comment": "Quick" })),
		)
		.await;
		assert_eq!(status, StatusCode::CREATED);

		let (status, body) = call(
			&app,
			"GET",
			&format!("/api/users/{}", first),
			Some(seed.receiver),
			None,
		)
		.await;
		assert_eq!(status, StatusCode::FORBIDDEN);
		assert_eq!(body["error"], "FORBIDDEN");

		let (status, user) = call(
			&app,
			"GET",
			&format!("/api/users/{}", first),
			Some(first),
			None,
		)
		.await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(user["rating_count"], 1);

		let (status, listing) = call(
			&app,
			"GET",
			"/api/users/available-deliverers",
			Some(seed.receiver),
			None,
		)
		.await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(listing["count"], 2);
		assert_eq!(listing["deliverers"][0]["id"], first.to_string());
		assert_eq!(listing["deliverers"][0]["statistics"]["averageRating"], 5.0);
		assert!(listing["deliverers"][0].get("email").is_none());

		let (status, summary) = call(&app, "GET", "/api/earnings", Some(first), None).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(summary["today"]["completedCount"], 1);
		assert_eq!(summary["ratings"]["totalReviews"], 1);
		assert_eq!(summary["ratings"]["distribution"]["5"], 1);

		let (status, _) = call(&app, "GET", "/api/earnings", Some(seed.receiver), None).await;
		assert_eq!(status, StatusCode::FORBIDDEN);

		let (status, rankings) =
			call(&app, "GET", "/api/reports/deliverers", Some(seed.admin), None).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(rankings.as_array().map(Vec::len), Some(2));
	}

	#[tokio::test]
	async fn test_assign_and_delete() {
		let app = app_with(Config::for_testing()).await;
		let seed = seed(&app).await;

		let (_, order) = call(
			&app,
			"POST",
			"/api/orders",
			Some(seed.receiver),
			Some(order_body()),
		)
		.await;
		let order_id = id_of(&order);

		let (status, _) = call(
			&app,
			"POST",
			&format!("/api/orders/{}/assign", order_id),
			Some(seed.receiver),
			Some(serde_json::json!({ "delivererId": seed.deliverers[0] })),
		)
		.await;
		assert_eq!(status, StatusCode::FORBIDDEN);

		let (status, assigned) = call(
			&app,
			"POST",
			&format!("/api/orders/{}/assign", order_id),
			Some(seed.admin),
			Some(serde_json::json!({ "delivererId": seed.deliverers[0] })),
		)
		.await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(assigned["status"], 3);

		let (status, _) = call(
			&app,
			"DELETE",
			&format!("/api/orders/{}", order_id),
			Some(seed.receiver),
			None,
		)
		.await;
		assert_eq!(status, StatusCode::FORBIDDEN);

		let (_, pending) = call(
			&app,
			"POST",
			"/api/orders",
			Some(seed.receiver),
			Some(order_body()),
		)
		.await;
		let (status, body) = call(
			&app,
			"DELETE",
			&format!("/api/orders/{}", id_of(&pending)),
			Some(seed.receiver),
			None,
		)
		.await;
		assert_eq!(status, StatusCode::NO_CONTENT);
		assert_eq!(body, Value::Null);

		let (status, _) = call(
			&app,
			"GET",
			&format!("/api/orders/{}", id_of(&pending)),
			Some(seed.receiver),
			None,
		)
		.await;
		assert_eq!(status, StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn test_rate_limit_reports_retry_after() {
		let mut config = Config::for_testing();
		config.orders.order_creation_limit_per_hour = 1;
		let app = app_with(config).await;
		let seed = seed(&app).await;

		let (status, _) = call(
			&app,
			"POST",
			"/api/orders",
			Some(seed.receiver),
			Some(order_body()),
		)
		.await;
		assert_eq!(status, StatusCode::CREATED);

		let (status, body) = call(
			&app,
			"POST",
			"/api/orders",
			Some(seed.receiver),
			Some(order_body()),
		)
		.await;
		assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
		assert_eq!(body["error"], "RATE_LIMITED");
		assert!(body["retry_after"].as_u64().is_some());
	}
}
