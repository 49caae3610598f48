//! HTTP route handlers for the scan API.

use std::thread;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use probescout::core::goal::{GoalListing, default_goal, goal_by_id, list_goals};
use probescout::core::target::validate_target;
use probescout::report::{RunStatus, ScanSummary};
use probescout::session::SessionListing;

use crate::sse;
use crate::state::AppState;

/// Full application: `/api` routes behind a permissive CORS layer.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    Router::new()
        .nest("/api", api_router())
        .layer(cors)
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/goals", get(goals))
        .route("/scans", get(list_scans).post(start_scan))
        .route("/scans/{id}", get(get_scan))
        .route("/scans/{id}/stop", post(stop_scan))
        .route("/scans/{id}/events", get(sse::events_handler))
}

/// JSON error body: `{"error": "..."}`.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn not_found(id: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: format!("no scan {id}"),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

async fn health() -> &'static str {
    "ok"
}

/// GET /api/goals - the goal catalog.
async fn goals() -> Json<Vec<GoalListing>> {
    Json(list_goals())
}

#[derive(Deserialize)]
struct StartScanRequest {
    target: String,
    #[serde(default)]
    goal: Option<String>,
    #[serde(default)]
    dry_run: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScanCreated {
    pub id: String,
    pub status: RunStatus,
}

/// POST /api/scans - validate, run pre-flight, then start the loop on its own thread.
async fn start_scan(
    State(state): State<AppState>,
    Json(request): Json<StartScanRequest>,
) -> Result<(StatusCode, Json<ScanCreated>), ApiError> {
    let target = validate_target(&request.target)
        .map_err(|err| ApiError::bad_request(format!("invalid target: {err}")))?;
    let goal = match request.goal.as_deref().or(state.config.goal.as_deref()) {
        None => default_goal(),
        Some(id) => {
            goal_by_id(id).ok_or_else(|| ApiError::bad_request(format!("unknown goal {id:?}")))?
        }
    };
    let mut config = (*state.config).clone();
    config.scanner.dry_run |= request.dry_run;

    // Pre-flight and the worker both block, so neither runs on the async runtime.
    let (started_tx, started_rx) = oneshot::channel();
    let worker_state = state.clone();
    thread::spawn(move || {
        if let Err(err) = worker_state.worker.check(&config) {
            let _ = started_tx.send(Err(format!("{err:#}")));
            return;
        }
        let (session, events) =
            worker_state
                .registry
                .create(target, goal, config.budget.max_iterations);
        sse::forward_events(worker_state.clone(), session.id().to_string(), events);
        let _ = started_tx.send(Ok(session.id().to_string()));

        info!(session = %session.id(), goal = goal.id, "scan started");
        if let Err(err) = worker_state.worker.run(&session, &config) {
            warn!(session = %session.id(), err = %format!("{err:#}"), "scan failed");
        }
    });

    let id = started_rx
        .await
        .map_err(|_| ApiError::internal("scan worker exited before starting"))?
        .map_err(ApiError::bad_request)?;
    Ok((
        StatusCode::CREATED,
        Json(ScanCreated {
            id,
            status: RunStatus::Running,
        }),
    ))
}

/// GET /api/scans - every session with its status.
async fn list_scans(State(state): State<AppState>) -> Json<Vec<SessionListing>> {
    Json(state.registry.list())
}

/// GET /api/scans/{id} - full progress snapshot.
async fn get_scan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ScanSummary>, ApiError> {
    let session = state.registry.get(&id).ok_or_else(|| ApiError::not_found(&id))?;
    Ok(Json(session.snapshot()))
}

/// POST /api/scans/{id}/stop - takes effect at the next iteration boundary.
async fn stop_scan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<ScanCreated>), ApiError> {
    let session = state.registry.get(&id).ok_or_else(|| ApiError::not_found(&id))?;
    session.request_stop();
    Ok((
        StatusCode::ACCEPTED,
        Json(ScanCreated {
            id,
            status: session.status(),
        }),
    ))
}
