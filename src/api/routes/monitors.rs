//! Monitor endpoints

use std::collections::HashMap;

use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::Deserialize;

use crate::api::{
    error::{ApiError, ApiResult},
    state::ApiState,
    types::{
        ChecksResponse, IncidentInfo, IncidentsResponse, MonitorInfo, MonitorStatsResponse,
        MonitorsResponse,
    },
};
use crate::monitor::{MonitorConfig, MonitorId};
use crate::stats::DEFAULT_WINDOW_HOURS;

/// Default number of rows returned by list endpoints
const DEFAULT_LIMIT: usize = 50;

const MAX_LIMIT: usize = 1000;

/// Longest stats window (30 days)
const MAX_HOURS: i64 = 720;

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    limit: Option<usize>,
}

impl LimitQuery {
    fn resolve(&self) -> ApiResult<usize> {
        match self.limit {
            None => Ok(DEFAULT_LIMIT),
            Some(limit) if (1..=MAX_LIMIT).contains(&limit) => Ok(limit),
            Some(limit) => Err(ApiError::InvalidRequest(format!(
                "limit must be between 1 and {MAX_LIMIT}, got {limit}"
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StatsQuery {
    hours: Option<i64>,
}

async fn find_monitor(state: &ApiState, id: MonitorId) -> ApiResult<MonitorConfig> {
    state
        .registry
        .list_monitors()
        .await?
        .into_iter()
        .find(|m| m.id == id)
        .ok_or_else(|| ApiError::NotFound(format!("monitor {id} not found")))
}

/// GET /api/v1/monitors
///
/// Scheduled monitors with their incident phase and last check
pub async fn list_monitors(State(state): State<ApiState>) -> ApiResult<Json<MonitorsResponse>> {
    let scheduled = state.scheduler.status().await?;
    let mut states: HashMap<MonitorId, _> = state
        .detector
        .all_states()
        .await?
        .into_iter()
        .map(|s| (s.monitor_id, s))
        .collect();

    let monitors: Vec<MonitorInfo> = scheduled
        .into_iter()
        .map(|monitor| {
            let incident_state = states.remove(&monitor.config.id);
            MonitorInfo::new(monitor, incident_state)
        })
        .collect();

    Ok(Json(MonitorsResponse {
        count: monitors.len(),
        monitors,
    }))
}

/// GET /api/v1/monitors/:id/checks?limit=
///
/// Most recent check results, newest first
pub async fn get_checks(
    State(state): State<ApiState>,
    Path(id): Path<MonitorId>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<ChecksResponse>> {
    let limit = query.resolve()?;
    find_monitor(&state, id).await?;

    let checks = state.backend.latest_checks(id, limit).await?;

    Ok(Json(ChecksResponse {
        monitor_id: id,
        count: checks.len(),
        checks,
    }))
}

/// GET /api/v1/monitors/:id/incidents?limit=
pub async fn get_incidents(
    State(state): State<ApiState>,
    Path(id): Path<MonitorId>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<IncidentsResponse>> {
    let limit = query.resolve()?;
    find_monitor(&state, id).await?;

    let incidents: Vec<IncidentInfo> = state
        .backend
        .incidents(id, limit)
        .await?
        .into_iter()
        .map(IncidentInfo::from)
        .collect();

    Ok(Json(IncidentsResponse {
        monitor_id: id,
        count: incidents.len(),
        incidents,
    }))
}

/// GET /api/v1/monitors/:id/stats?hours=
pub async fn get_monitor_stats(
    State(state): State<ApiState>,
    Path(id): Path<MonitorId>,
    Query(query): Query<StatsQuery>,
) -> ApiResult<Json<MonitorStatsResponse>> {
    let hours = query.hours.unwrap_or(DEFAULT_WINDOW_HOURS);
    if !(1..=MAX_HOURS).contains(&hours) {
        return Err(ApiError::InvalidRequest(format!(
            "hours must be between 1 and {MAX_HOURS}, got {hours}"
        )));
    }
    find_monitor(&state, id).await?;

    let stats = state.stats.monitor_stats_for(id, hours).await?;

    Ok(Json(MonitorStatsResponse { hours, stats }))
}

/// POST /api/v1/monitors/:id/resolve
///
/// Close the open incident of a monitor without waiting for a successful probe
pub async fn resolve_incident(
    State(state): State<ApiState>,
    Path(id): Path<MonitorId>,
) -> ApiResult<Json<IncidentInfo>> {
    match state.detector.resolve_manually(id).await? {
        Some(incident) => Ok(Json(incident.into())),
        None => Err(ApiError::NotFound(format!(
            "monitor {id} has no open incident"
        ))),
    }
}
