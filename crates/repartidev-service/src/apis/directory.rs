//! Condominium and department endpoints.

use super::{api_error, Actor};
use crate::server::AppState;
use axum::{
	extract::{Path, State},
	http::StatusCode,
	response::Json,
};
use repartidev_types::{
	APIError, Condominium, CreateCondominiumRequest, CreateDepartmentRequest, Department,
};
use uuid::Uuid;

/// Handles POST /api/condominiums.
pub async fn create_condominium(
	State(state): State<AppState>,
	Actor(actor): Actor,
	Json(request): Json<CreateCondominiumRequest>,
) -> Result<(StatusCode, Json<Condominium>), APIError> {
	let condominium = state
		.engine
		.create_condominium(actor, request)
		.await
		.map_err(api_error)?;
	Ok((StatusCode::CREATED, Json(condominium)))
}

/// Handles POST /api/condominiums/{id}/departments.
pub async fn create_department(
	State(state): State<AppState>,
	Actor(actor): Actor,
	Path(condominium_id): Path<Uuid>,
	Json(request): Json<CreateDepartmentRequest>,
) -> Result<(StatusCode, Json<Department>), APIError> {
	let department = state
		.engine
		.create_department(actor, condominium_id, request)
		.await
		.map_err(api_error)?;
	Ok((StatusCode::CREATED, Json(department)))
}
