//! Earnings and reporting endpoints.

use super::{api_error, Actor};
use crate::server::AppState;
use axum::{
	extract::{Query, State},
	response::Json,
};
use repartidev_types::{APIError, DelivererRanking, EarningsQuery, EarningsSummary};

/// Handles GET /api/earnings.
///
/// `?now=` anchors the rolling windows at a fixed instant instead of the
/// current time.
pub async fn earnings_summary(
	State(state): State<AppState>,
	Actor(actor): Actor,
	Query(query): Query<EarningsQuery>,
) -> Result<Json<EarningsSummary>, APIError> {
	state
		.engine
		.earnings_summary(actor, query.now)
		.await
		.map(Json)
		.map_err(api_error)
}

/// Handles GET /api/reports/deliverers.
pub async fn deliverer_rankings(
	State(state): State<AppState>,
	Actor(actor): Actor,
	Query(query): Query<EarningsQuery>,
) -> Result<Json<Vec<DelivererRanking>>, APIError> {
	state
		.engine
		.deliverer_rankings(actor, query.now)
		.await
		.map(Json)
		.map_err(api_error)
}
