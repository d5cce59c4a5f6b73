use axum::{
    extract::{rejection::JsonRejection, Path as AxumPath, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use common::LibraryScan;
use tracing::warn;

use crate::scan::ScanError;
use crate::state::{
    AppState, ErrorResponse, HealthResponse, JsonResult, ScanListQuery, ScanListResponse,
    StartScanBody, StartScanResponse,
};
use crate::ws::events_handler;

const DEFAULT_PAGE_SIZE: usize = 20;
const MAX_PAGE_SIZE: usize = 200;

pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/scans", post(start_scan).get(list_scans))
        .route("/scans/:scan_id", get(get_scan))
        .route("/scans/:scan_id/cancel", post(cancel_scan))
        .route("/events", get(events_handler))
        .with_state(state)
}

pub fn json_error(
    status: StatusCode,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn scan_error(err: ScanError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &err {
        ScanError::Conflict(_) | ScanError::Finished(_) => StatusCode::CONFLICT,
        ScanError::NotFound(_) => StatusCode::NOT_FOUND,
        ScanError::BadRequest(_) => StatusCode::BAD_REQUEST,
        _ => {
            warn!("Scan request failed: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    json_error(status, err.to_string())
}

pub async fn health(State(state): State<AppState>) -> JsonResult<HealthResponse> {
    let stats = state.scans.stats().await.map_err(scan_error)?;
    let active_scan = state
        .scans
        .active_scan()
        .await
        .map_err(scan_error)?
        .map(|scan| scan.id);
    Ok(Json(HealthResponse {
        status: "ok",
        artists: stats.artists,
        albums: stats.albums,
        tracks: stats.tracks,
        active_scan,
    }))
}

/// Every field is optional, so a request without a JSON body starts a scan
/// with the configured defaults.
pub async fn start_scan(
    State(state): State<AppState>,
    body: Result<Json<StartScanBody>, JsonRejection>,
) -> Result<(StatusCode, Json<StartScanResponse>), (StatusCode, Json<ErrorResponse>)> {
    let body = match body {
        Ok(Json(body)) => body,
        Err(JsonRejection::MissingJsonContentType(_)) => StartScanBody::default(),
        Err(rejection) => return Err(json_error(rejection.status(), rejection.body_text())),
    };
    let scan = state
        .scans
        .start_scan(body.root_path, body.recursive, body.prune_deleted)
        .await
        .map_err(scan_error)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(StartScanResponse {
            scan_id: scan.id,
            status: scan.status.as_str().to_string(),
        }),
    ))
}

pub async fn get_scan(
    State(state): State<AppState>,
    AxumPath(scan_id): AxumPath<String>,
) -> JsonResult<LibraryScan> {
    let scan = state.scans.get_scan(&scan_id).await.map_err(scan_error)?;
    Ok(Json(scan))
}

pub async fn list_scans(
    State(state): State<AppState>,
    Query(params): Query<ScanListQuery>,
) -> JsonResult<ScanListResponse> {
    let page = params.page.unwrap_or(1).max(1);
    let page_size = params
        .page_size
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let (scans, total) = state
        .scans
        .list_scans(page, page_size)
        .await
        .map_err(scan_error)?;
    Ok(Json(ScanListResponse { scans, total }))
}

pub async fn cancel_scan(
    State(state): State<AppState>,
    AxumPath(scan_id): AxumPath<String>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    state.scans.cancel(&scan_id).await.map_err(scan_error)?;
    Ok(StatusCode::ACCEPTED)
}
