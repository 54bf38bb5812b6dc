//! Dashboard statistics endpoint

use axum::{Json, extract::State};

use crate::api::{error::ApiResult, state::ApiState, types::StatsResponse};

/// GET /api/v1/stats
///
/// Dashboard summary over all monitors plus storage and observer counters
pub async fn get_stats(State(state): State<ApiState>) -> ApiResult<Json<StatsResponse>> {
    let dashboard = state.stats.dashboard().await?;

    Ok(Json(StatsResponse {
        dashboard,
        storage: state.storage.get_stats().await,
        observers: state.broadcaster.connection_count().await.unwrap_or_default(),
    }))
}
