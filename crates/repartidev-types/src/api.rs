//! API types for the Repartidev HTTP API.
//!
//! This module defines the request and response bodies exchanged by the
//! transport, the summary shapes produced by the aggregators, and the
//! [`APIError`] type that renders engine failures as JSON responses.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::{Role, UserProfile};

/// Request body for registering a condominium.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCondominiumRequest {
	pub name: String,
	pub address: String,
	#[serde(default)]
	pub district: String,
	#[serde(default)]
	pub region: String,
	#[serde(default)]
	pub entries: u32,
}

/// Request body for adding a department to a condominium.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDepartmentRequest {
	pub name: String,
	pub tower: String,
	pub floor: i32,
}

/// Request body for registering a resident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterUserRequest {
	#[serde(rename = "firstName")]
	pub first_name: String,
	#[serde(rename = "lastName")]
	pub last_name: String,
	pub email: String,
	pub role: Role,
	#[serde(rename = "departmentId", default)]
	pub department_id: Option<Uuid>,
}

/// Request body for changing a resident's role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateRoleRequest {
	pub role: Role,
}

/// Request body for moving a resident to a department.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetDepartmentRequest {
	#[serde(rename = "departmentId")]
	pub department_id: Uuid,
}

/// Request body for posting a delivery order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderRequest {
	/// Delivery department; defaults to the receiver's own department.
	#[serde(rename = "departmentId", default)]
	pub department_id: Option<Uuid>,
	pub amount: Decimal,
	#[serde(rename = "scheduledDate")]
	pub scheduled_date: DateTime<Utc>,
	#[serde(rename = "isImmediate", default)]
	pub is_immediate: bool,
	#[serde(rename = "deliveryNotes", default)]
	pub delivery_notes: Option<String>,
}

/// Filters narrowing the backlog of claimable orders.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderFilters {
	/// Only orders from this condominium.
	#[serde(default)]
	pub condominium: Option<Uuid>,
	/// Only immediate (or only scheduled) orders.
	#[serde(default)]
	pub is_immediate: Option<bool>,
	/// Inclusive lower bound on the amount.
	#[serde(default)]
	pub min_amount: Option<Decimal>,
	/// Inclusive upper bound on the amount.
	#[serde(default)]
	pub max_amount: Option<Decimal>,
}

/// Request body for earmarking an order for a deliverer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignOrderRequest {
	#[serde(rename = "delivererId")]
	pub deliverer_id: Uuid,
}

/// Request body for reviewing a completed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitReviewRequest {
	/// Rating; anything outside 1..=5 is rejected by the engine.
	pub rating: i64,
	#[serde(default)]
	pub comment: Option<String>,
}

/// Query parameters for the earnings endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EarningsQuery {
	/// Anchor of the rolling windows; defaults to the current time.
	#[serde(default)]
	pub now: Option<DateTime<Utc>>,
}

/// Query parameters for the available deliverers listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AvailableDeliverersQuery {
	/// Defaults to the caller's own condominium.
	#[serde(default)]
	pub condominium_id: Option<Uuid>,
}

/// Statistics for one rolling window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
	/// Sum of amounts over completed orders.
	pub earnings: Decimal,
	#[serde(rename = "completedCount")]
	pub completed_count: usize,
	#[serde(rename = "totalCount")]
	pub total_count: usize,
	/// Percentage of orders in the window that completed; 0 when empty.
	#[serde(rename = "completionRate")]
	pub completion_rate: f64,
	/// Mean creation-to-completion time; 0 when nothing completed.
	#[serde(rename = "avgDeliveryMinutes")]
	pub avg_delivery_minutes: f64,
}

/// Earnings overview for a deliverer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarningsSummary {
	pub today: WindowStats,
	pub week: WindowStats,
	pub month: WindowStats,
	/// All-time earnings.
	pub total: Decimal,
	/// Completion rate of the month window.
	#[serde(rename = "completionRate")]
	pub completion_rate: f64,
	/// Average delivery time of the month window.
	#[serde(rename = "avgDeliveryMinutes")]
	pub avg_delivery_minutes: f64,
	#[serde(rename = "monthlyGoal")]
	pub monthly_goal: Decimal,
	/// Month earnings as a percentage of the goal, capped at 100.
	#[serde(rename = "goalProgressPercent")]
	pub goal_progress_percent: f64,
	#[serde(rename = "goalRemaining")]
	pub goal_remaining: Decimal,
	pub ratings: RatingBreakdown,
}

/// Reviews received by a deliverer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RatingBreakdown {
	/// Mean rating rounded to two decimals; 0 without reviews.
	pub average: f64,
	#[serde(rename = "totalReviews")]
	pub total_reviews: usize,
	/// Review count per star value. Values nobody gave are left out.
	pub distribution: BTreeMap<u8, usize>,
}

/// Track record shown next to an available deliverer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelivererStatistics {
	#[serde(rename = "completedOrders")]
	pub completed_orders: usize,
	#[serde(rename = "averageRating")]
	pub average_rating: f64,
	/// Below the active order limit right now.
	#[serde(rename = "isCurrentlyAvailable")]
	pub is_currently_available: bool,
}

/// One deliverer of the available deliverers listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailableDeliverer {
	#[serde(flatten)]
	pub profile: UserProfile,
	pub statistics: DelivererStatistics,
}

/// Deliverers who could take an order in a condominium, best rated first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailableDeliverers {
	#[serde(rename = "condominiumId")]
	pub condominium_id: Uuid,
	#[serde(rename = "condominiumName")]
	pub condominium_name: String,
	pub count: usize,
	pub deliverers: Vec<AvailableDeliverer>,
}

/// One row of the deliverer ranking report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelivererRanking {
	#[serde(rename = "userId")]
	pub user_id: Uuid,
	pub name: String,
	pub email: String,
	#[serde(rename = "totalOrders")]
	pub total_orders: usize,
	#[serde(rename = "completedOrders")]
	pub completed_orders: usize,
	#[serde(rename = "cancelledOrders")]
	pub cancelled_orders: usize,
	pub earnings: Decimal,
	#[serde(rename = "completionRate")]
	pub completion_rate: f64,
	#[serde(rename = "avgDeliveryMinutes")]
	pub avg_delivery_minutes: f64,
	#[serde(rename = "ratingAverage")]
	pub rating_average: f64,
}

/// Error response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
	/// Machine-readable error code.
	pub error: String,
	/// Human-readable description.
	pub message: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub details: Option<serde_json::Value>,
	/// Seconds after which the request may be retried.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub retry_after: Option<u64>,
}

/// API error carrying its HTTP status class.
#[derive(Debug, Clone)]
pub enum APIError {
	/// Malformed request (400).
	BadRequest { error_type: String, message: String },
	/// Missing or unknown actor (401).
	Unauthorized { error_type: String, message: String },
	/// Actor not entitled to the action (403).
	Forbidden { error_type: String, message: String },
	/// Referenced record does not exist (404).
	NotFound { error_type: String, message: String },
	/// Request collides with the current order state (409).
	Conflict { error_type: String, message: String },
	/// Quota exhausted (429).
	TooManyRequests {
		error_type: String,
		message: String,
		retry_after: Option<u64>,
	},
	/// Internal server error (500).
	InternalServerError { error_type: String, message: String },
}

impl APIError {
	/// Get the HTTP status code for this error.
	pub fn status_code(&self) -> u16 {
		match self {
			APIError::BadRequest { .. } => 400,
			APIError::Unauthorized { .. } => 401,
			APIError::Forbidden { .. } => 403,
			APIError::NotFound { .. } => 404,
			APIError::Conflict { .. } => 409,
			APIError::TooManyRequests { .. } => 429,
			APIError::InternalServerError { .. } => 500,
		}
	}

	/// Convert to ErrorResponse for JSON serialization.
	pub fn to_error_response(&self) -> ErrorResponse {
		let (error_type, message, retry_after) = match self {
			APIError::BadRequest {
				error_type,
				message,
			}
			| APIError::Unauthorized {
				error_type,
				message,
			}
			| APIError::Forbidden {
				error_type,
				message,
			}
			| APIError::NotFound {
				error_type,
				message,
			}
			| APIError::Conflict {
				error_type,
				message,
			}
			| APIError::InternalServerError {
				error_type,
				message,
			} => (error_type, message, None),
			APIError::TooManyRequests {
				error_type,
				message,
				retry_after,
			} => (error_type, message, *retry_after),
		};

		ErrorResponse {
			error: error_type.clone(),
			message: message.clone(),
			details: None,
			retry_after,
		}
	}
}

impl fmt::Display for APIError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let response = self.to_error_response();
		write!(f, "{} ({}): {}", response.error, self.status_code(), response.message)
	}
}

impl std::error::Error for APIError {}

impl axum::response::IntoResponse for APIError {
	fn into_response(self) -> axum::response::Response {
		use axum::{http::StatusCode, response::Json};

		let status =
			StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
		(status, Json(self.to_error_response())).into_response()
	}
}
