use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::billing::{BillingEngine, BillingError};
use crate::scheduler::{CollectionScheduler, ScheduleRequest, SchedulerError};

/// Thin HTTP wiring over the operation contracts. Handlers translate between
/// JSON and the subsystems; all real behavior lives behind them.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<CollectionScheduler>,
    pub billing: Arc<BillingEngine>,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/collection/start", post(start_collection))
        .route("/collection/stop", post(stop_collection))
        .route("/collection/run-now", post(run_collection_now))
        .route("/collection/status", get(collection_status))
        .route("/billing/:year/:month", get(get_bill).post(recalculate_bill))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.message }))).into_response()
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        let status = match &e {
            SchedulerError::InvalidSchedule(_) => StatusCode::UNPROCESSABLE_ENTITY,
            SchedulerError::AlreadyRunning | SchedulerError::NotRunning => StatusCode::CONFLICT,
            SchedulerError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        let status = match &e {
            BillingError::InvalidMonth { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            BillingError::NotComputed(_) => StatusCode::NOT_FOUND,
            BillingError::Store(_) | BillingError::Transaction(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

async fn start_collection(
    State(state): State<AppState>,
    Json(request): Json<ScheduleRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = state.scheduler.start(request).await?;
    Ok(Json(json!({
        "message": "collection started",
        "is_running": status.is_running,
    })))
}

async fn stop_collection(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = state.scheduler.stop().await?;
    Ok(Json(json!({
        "message": "collection stopped",
        "is_running": status.is_running,
    })))
}

async fn run_collection_now(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let report = state.scheduler.run_now().await?;
    let timestamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default();
    Ok(Json(json!({
        "timestamp": timestamp,
        "attempted": report.attempted,
        "stored": report.stored,
        "failed": report.failed,
    })))
}

async fn collection_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.scheduler.status().await)
}

async fn get_bill(
    State(state): State<AppState>,
    Path((year, month)): Path<(i32, u8)>,
) -> Result<Response, ApiError> {
    let report = state.billing.get_bill(year, month).await?;
    Ok(Json(report).into_response())
}

async fn recalculate_bill(
    State(state): State<AppState>,
    Path((year, month)): Path<(i32, u8)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.billing.recalculate_bill(year, month).await?;
    Ok(Json(json!({ "message": "billing recalculated" })))
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
