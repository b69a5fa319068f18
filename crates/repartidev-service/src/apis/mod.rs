//! Repartidev HTTP API handlers.
//!
//! Handlers translate HTTP requests into engine calls. The acting user is
//! named by the `X-User-Id` header; authenticating that id is left to
//! whatever sits in front of the service.

pub mod directory;
pub mod earnings;
pub mod orders;
pub mod users;

use axum::{extract::FromRequestParts, http::request::Parts};
use repartidev_core::EngineError;
use repartidev_types::APIError;
use uuid::Uuid;

/// Header carrying the acting user's id.
pub const ACTOR_HEADER: &str = "x-user-id";

/// The user a request acts on behalf of.
#[derive(Debug, Clone, Copy)]
pub struct Actor(pub Uuid);

impl<S> FromRequestParts<S> for Actor
where
	S: Send + Sync,
{
	type Rejection = APIError;

	async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
		let value = parts
			.headers
			.get(ACTOR_HEADER)
			.ok_or_else(|| APIError::Unauthorized {
				error_type: "MISSING_ACTOR".to_string(),
				message: "X-User-Id header is required".to_string(),
			})?;

		value
			.to_str()
			.ok()
			.and_then(|raw| Uuid::parse_str(raw.trim()).ok())
			.map(Actor)
			.ok_or_else(|| APIError::Unauthorized {
				error_type: "INVALID_ACTOR".to_string(),
				message: "X-User-Id header must be a UUID".to_string(),
			})
	}
}

/// Maps an engine failure onto its HTTP error.
pub fn api_error(err: EngineError) -> APIError {
	let message = err.to_string();
	match err {
		EngineError::UnknownActor(_) => APIError::Unauthorized {
			error_type: "UNKNOWN_ACTOR".to_string(),
			message,
		},
		EngineError::Forbidden(_) => APIError::Forbidden {
			error_type: "FORBIDDEN".to_string(),
			message,
		},
		EngineError::InvalidTransition { .. } => APIError::Conflict {
			error_type: "INVALID_TRANSITION".to_string(),
			message,
		},
		EngineError::OrderTaken(_) => APIError::Conflict {
			error_type: "ORDER_TAKEN".to_string(),
			message,
		},
		EngineError::Stale(_) => APIError::Conflict {
			error_type: "STALE_ORDER".to_string(),
			message,
		},
		EngineError::InvalidInput(_) => APIError::BadRequest {
			error_type: "INVALID_INPUT".to_string(),
			message,
		},
		EngineError::NotFound(_) => APIError::NotFound {
			error_type: "NOT_FOUND".to_string(),
			message,
		},
		EngineError::RateLimited { retry_after } => APIError::TooManyRequests {
			error_type: "RATE_LIMITED".to_string(),
			message,
			retry_after: Some(retry_after),
		},
		EngineError::Internal(_) => {
			tracing::error!(error = %message, "Engine failure");
			APIError::InternalServerError {
				error_type: "INTERNAL_ERROR".to_string(),
				message: "internal error".to_string(),
			}
		},
	}
}
