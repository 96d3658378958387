//! HTTP surface of the scheduler.
//!
//! | Route                          | Handler                    |
//! |--------------------------------|----------------------------|
//! | `GET /`                        | service info               |
//! | `POST /api/v1/study`           | submit a raw payload       |
//! | `GET /api/v1/result/{id}`      | poll a job                 |
//! | `GET /api/v1/job/next`         | claim the next job         |
//! | `GET /api/v1/job/next/{version}` | claim with a version tag |
//! | `POST /api/v1/job/{id}`        | report a finished job      |
//!
//! Every `/api/v1` route goes through the access-token middleware.

pub mod auth;
mod routes;

use axum::{
    extract::{DefaultBodyLimit, Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};

use crate::error::SchedulerError;
use crate::scheduler::SchedulerService;

pub use auth::AccessGuard;

/// Largest payload or report body accepted.
pub const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct ApiState {
    pub service: SchedulerService,
    pub guard: AccessGuard,
}

impl ApiState {
    pub fn new(service: SchedulerService, guard: AccessGuard) -> Self {
        Self { service, guard }
    }
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/study", post(routes::submit))
        .route("/result/{id}", get(routes::get_result))
        .route("/job/next", get(routes::claim))
        .route("/job/next/{version}", get(routes::claim_version))
        .route("/job/{id}", post(routes::report))
        .route_layer(middleware::from_fn_with_state(
            state.guard.clone(),
            require_token,
        ));

    Router::new()
        .route("/", get(routes::info))
        .nest("/api/v1", api)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct TokenParams {
    token: Option<String>,
}

async fn require_token(
    State(guard): State<AccessGuard>,
    Query(params): Query<TokenParams>,
    request: Request,
    next: Next,
) -> Response {
    match guard.check(params.token.as_deref()) {
        Ok(()) => next.run(request).await,
        Err(e) => {
            tracing::warn!(path = %request.uri().path(), "Rejected request with bad access token");
            e.into_response()
        }
    }
}

impl SchedulerError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SchedulerError::JobNotFound(_) => StatusCode::NOT_FOUND,
            SchedulerError::Unauthorized => StatusCode::FORBIDDEN,
            SchedulerError::InvalidRecord(_) => StatusCode::BAD_REQUEST,
            SchedulerError::InvalidTransition { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for SchedulerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}
