//! Resident account endpoints.

use super::{api_error, Actor};
use crate::server::AppState;
use axum::{
	extract::{Path, Query, State},
	http::StatusCode,
	response::Json,
};
use repartidev_types::{
	APIError, AvailableDeliverers, AvailableDeliverersQuery, RegisterUserRequest,
	SetDepartmentRequest, UpdateRoleRequest, User,
};
use uuid::Uuid;

/// Handles POST /api/users. Registration needs no actor.
pub async fn register_user(
	State(state): State<AppState>,
	Json(request): Json<RegisterUserRequest>,
) -> Result<(StatusCode, Json<User>), APIError> {
	let user = state
		.engine
		.register_user(request)
		.await
		.map_err(api_error)?;
	Ok((StatusCode::CREATED, Json(user)))
}

/// Handles GET /api/users/{id}.
pub async fn get_user(
	State(state): State<AppState>,
	Actor(actor): Actor,
	Path(user_id): Path<Uuid>,
) -> Result<Json<User>, APIError> {
	state
		.engine
		.get_user(actor, user_id)
		.await
		.map(Json)
		.map_err(api_error)
}

/// Handles GET /api/users/available-deliverers.
pub async fn available_deliverers(
	State(state): State<AppState>,
	Actor(actor): Actor,
	Query(query): Query<AvailableDeliverersQuery>,
) -> Result<Json<AvailableDeliverers>, APIError> {
	state
		.engine
		.available_deliverers(actor, query.condominium_id)
		.await
		.map(Json)
		.map_err(api_error)
}

/// Handles PUT /api/users/{id}/role.
pub async fn update_role(
	State(state): State<AppState>,
	Actor(actor): Actor,
	Path(user_id): Path<Uuid>,
	Json(request): Json<UpdateRoleRequest>,
) -> Result<Json<User>, APIError> {
	state
		.engine
		.update_role(actor, user_id, request.role)
		.await
		.map(Json)
		.map_err(api_error)
}

/// Handles PUT /api/users/{id}/department.
pub async fn set_department(
	State(state): State<AppState>,
	Actor(actor): Actor,
	Path(user_id): Path<Uuid>,
	Json(request): Json<SetDepartmentRequest>,
) -> Result<Json<User>, APIError> {
	state
		.engine
		.set_department(actor, user_id, request.department_id)
		.await
		.map(Json)
		.map_err(api_error)
}

/// Handles POST /api/users/{id}/availability.
pub async fn toggle_availability(
	State(state): State<AppState>,
	Actor(actor): Actor,
	Path(user_id): Path<Uuid>,
) -> Result<Json<User>, APIError> {
	state
		.engine
		.toggle_availability(actor, user_id)
		.await
		.map(Json)
		.map_err(api_error)
}
