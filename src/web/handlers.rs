//! HTTP request handlers.

use super::AppState;
use crate::db::{timefmt, MAX_SHARD_KEY};
use crate::scheduler::{PingError, PingReport, TickError, TickReport};

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Envelope shared by both trigger endpoints.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "timefmt")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub details: Option<T>,
}

impl<T: Serialize> TriggerResponse<T> {
    fn ok(message: String, details: T) -> Response {
        let body = Self {
            success: true,
            message: Some(message),
            error: None,
            timestamp: timefmt::now(),
            details: Some(details),
        };
        (StatusCode::OK, Json(body)).into_response()
    }
}

fn failure(status: StatusCode, error: impl Into<String>) -> Response {
    let body: TriggerResponse<()> = TriggerResponse {
        success: false,
        message: None,
        error: Some(error.into()),
        timestamp: timefmt::now(),
        details: None,
    };
    (status, Json(body)).into_response()
}

// ============================================================================
// API: Tick
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickRequest {
    #[serde(default)]
    pub node_id: Option<String>,
    pub shard_key: u8,
}

pub async fn handle_tick(
    State(state): State<AppState>,
    payload: Result<Json<TickRequest>, JsonRejection>,
) -> Response {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => return failure(StatusCode::BAD_REQUEST, rejection.body_text()),
    };
    if req.shard_key > MAX_SHARD_KEY {
        return failure(
            StatusCode::BAD_REQUEST,
            format!("shardKey must be between 0 and {}", MAX_SHARD_KEY),
        );
    }

    let node_id = req
        .node_id
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| state.config.node_id.clone());

    match state.monitor.tick(&node_id, req.shard_key).await {
        Ok(report) => {
            let message = format!("Processed {} URLs", report.selected);
            TriggerResponse::<TickReport>::ok(message, report)
        }
        Err(e @ TickError::InvalidShard(_)) => failure(StatusCode::BAD_REQUEST, e.to_string()),
        Err(e) => {
            tracing::error!("Tick trigger failed for {}/{}: {}", node_id, req.shard_key, e);
            failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

// ============================================================================
// API: Single URL
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingRequest {
    pub url_id: String,
}

pub async fn handle_ping(
    State(state): State<AppState>,
    payload: Result<Json<PingRequest>, JsonRejection>,
) -> Response {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => return failure(StatusCode::BAD_REQUEST, rejection.body_text()),
    };

    match state.monitor.ping_url(&req.url_id).await {
        Ok(report) => {
            let message = report.log.clone();
            TriggerResponse::<PingReport>::ok(message, report)
        }
        Err(PingError::MalformedInput(msg)) => failure(StatusCode::BAD_REQUEST, msg),
        Err(e) => {
            tracing::error!("Ping trigger failed for {}: {}", req.url_id, e);
            failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub node_id: String,
    pub running_shards: Vec<u8>,
    pub tick_interval_secs: u64,
    pub batch_size: usize,
    pub max_concurrency: usize,
}

pub async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    let monitor = state.monitor.config();
    Json(StatusResponse {
        node_id: state.config.node_id.clone(),
        running_shards: state.scheduler.running_shards().await,
        tick_interval_secs: state.config.tick_interval.as_secs(),
        batch_size: monitor.batch_size,
        max_concurrency: monitor.max_concurrency,
    })
}
