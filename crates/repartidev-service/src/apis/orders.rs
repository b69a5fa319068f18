//! Order lifecycle endpoints.

use super::{api_error, Actor};
use crate::server::AppState;
use axum::{
	extract::{Path, Query, State},
	http::StatusCode,
	response::Json,
};
use repartidev_types::{
	APIError, AssignOrderRequest, CreateOrderRequest, Order, OrderAction, OrderFilters, Review,
	SubmitReviewRequest,
};
use uuid::Uuid;

/// Handles POST /api/orders.
pub async fn create_order(
	State(state): State<AppState>,
	Actor(actor): Actor,
	Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<Order>), APIError> {
	let order = state
		.engine
		.create_order(actor, request)
		.await
		.map_err(api_error)?;
	Ok((StatusCode::CREATED, Json(order)))
}

/// Handles GET /api/orders/available.
pub async fn list_available(
	State(state): State<AppState>,
	Actor(actor): Actor,
	Query(filters): Query<OrderFilters>,
) -> Result<Json<Vec<Order>>, APIError> {
	state
		.engine
		.list_available_orders(actor, filters)
		.await
		.map(Json)
		.map_err(api_error)
}

/// Handles GET /api/orders/requests.
pub async fn my_requests(
	State(state): State<AppState>,
	Actor(actor): Actor,
) -> Result<Json<Vec<Order>>, APIError> {
	state
		.engine
		.my_requests(actor)
		.await
		.map(Json)
		.map_err(api_error)
}

/// Handles GET /api/orders/deliveries.
pub async fn my_deliveries(
	State(state): State<AppState>,
	Actor(actor): Actor,
) -> Result<Json<Vec<Order>>, APIError> {
	state
		.engine
		.my_deliveries(actor)
		.await
		.map(Json)
		.map_err(api_error)
}

/// Handles GET /api/orders/{id}.
pub async fn get_order(
	State(state): State<AppState>,
	Actor(actor): Actor,
	Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, APIError> {
	state
		.engine
		.get_order(actor, order_id)
		.await
		.map(Json)
		.map_err(api_error)
}

/// Handles DELETE /api/orders/{id}.
pub async fn delete_order(
	State(state): State<AppState>,
	Actor(actor): Actor,
	Path(order_id): Path<Uuid>,
) -> Result<StatusCode, APIError> {
	state
		.engine
		.delete_order(actor, order_id)
		.await
		.map_err(api_error)?;
	Ok(StatusCode::NO_CONTENT)
}

async fn run_action(
	state: &AppState,
	actor: Uuid,
	order_id: Uuid,
	action: OrderAction,
) -> Result<Json<Order>, APIError> {
	let engine = &state.engine;
	let result = match action {
		OrderAction::Accept => engine.accept_order(actor, order_id).await,
		OrderAction::Reject => engine.reject_order(actor, order_id).await,
		OrderAction::Start => engine.start_order(actor, order_id).await,
		OrderAction::Complete => engine.complete_order(actor, order_id).await,
		OrderAction::Cancel => engine.cancel_order(actor, order_id).await,
		OrderAction::Assign => {
			return Err(APIError::BadRequest {
				error_type: "INVALID_INPUT".to_string(),
				message: "assignment needs a deliverer".to_string(),
			})
		},
	};
	result.map(Json).map_err(|e| {
		tracing::warn!(action = %action, error = %e, "Order action failed");
		api_error(e)
	})
}

/// Handles POST /api/orders/{id}/accept.
pub async fn accept_order(
	State(state): State<AppState>,
	Actor(actor): Actor,
	Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, APIError> {
	run_action(&state, actor, order_id, OrderAction::Accept).await
}

/// Handles POST /api/orders/{id}/reject.
pub async fn reject_order(
	State(state): State<AppState>,
	Actor(actor): Actor,
	Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, APIError> {
	run_action(&state, actor, order_id, OrderAction::Reject).await
}

/// Handles POST /api/orders/{id}/start.
pub async fn start_order(
	State(state): State<AppState>,
	Actor(actor): Actor,
	Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, APIError> {
	run_action(&state, actor, order_id, OrderAction::Start).await
}

/// Handles POST /api/orders/{id}/complete.
pub async fn complete_order(
	State(state): State<AppState>,
	Actor(actor): Actor,
	Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, APIError> {
	run_action(&state, actor, order_id, OrderAction::Complete).await
}

/// Handles POST /api/orders/{id}/cancel.
pub async fn cancel_order(
	State(state): State<AppState>,
	Actor(actor): Actor,
	Path(order_id): Path<Uuid>,
) -> Result<Json<Order>, APIError> {
	run_action(&state, actor, order_id, OrderAction::Cancel).await
}

/// Handles POST /api/orders/{id}/assign.
pub async fn assign_order(
	State(state): State<AppState>,
	Actor(actor): Actor,
	Path(order_id): Path<Uuid>,
	Json(request): Json<AssignOrderRequest>,
) -> Result<Json<Order>, APIError> {
	state
		.engine
		.assign_order(actor, order_id, request.deliverer_id)
		.await
		.map(Json)
		.map_err(api_error)
}

/// Handles POST /api/orders/{id}/review.
pub async fn submit_review(
	State(state): State<AppState>,
	Actor(actor): Actor,
	Path(order_id): Path<Uuid>,
	Json(request): Json<SubmitReviewRequest>,
) -> Result<(StatusCode, Json<Review>), APIError> {
	let review = state
		.engine
		.submit_review(actor, order_id, request.rating, request.comment)
		.await
		.map_err(api_error)?;
	Ok((StatusCode::CREATED, Json(review)))
}
