//! HTTP server for the job API.
//!
//! Thin JSON layer over [`JobApi`]. Handlers parse and validate the request,
//! call one facade method and map the outcome onto a status code.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/jobs` | Submit a job (`{ "type", "parameters", "secret"? }`) |
//! | `GET`  | `/jobs` | List jobs (`?type=&status=&limit=&offset=`) |
//! | `GET`  | `/jobs/{id}` | Job status, result or error, and progress |
//! | `GET`  | `/jobs/{id}/progress` | Progress entries (`?after=<seq>`) |
//! | `POST` | `/jobs/{id}/cancel` | Request cancellation |
//! | `GET`  | `/settings` | Current settings |
//! | `POST` | `/settings` | Partial settings update |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "invalid request: link must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so a browser dashboard
//! on another port can poll job status.

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::api::JobApi;
use crate::config::Config;
use crate::credentials::secret_from;
use crate::error::JobError;
use crate::models::{JobFilter, JobPage, JobView, Page, ProgressEntry};
use crate::settings::{Settings, SettingsPatch};

/// Starts the HTTP server and the job runner.
///
/// Binds to `[server].bind`, runs until Ctrl-C, then stops accepting
/// requests and waits for running jobs to finish.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let api = JobApi::from_config(config).await?;
    api.runner().start().await?;

    let app = router(api.clone());
    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind = %bind_addr, "job server listening");
    println!("Job server listening on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    api.runner().shutdown().await;
    Ok(())
}

/// Builds the router with all job and settings routes.
pub fn router(api: JobApi) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/jobs", post(handle_submit).get(handle_list))
        .route("/jobs/{id}", get(handle_status))
        .route("/jobs/{id}/progress", get(handle_progress))
        .route("/jobs/{id}/cancel", post(handle_cancel))
        .route("/settings", get(handle_get_settings).post(handle_update_settings))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(api)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

impl From<JobError> for AppError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Validation(_) => bad_request(err.to_string()),
            JobError::NotFound(_) => AppError {
                status: StatusCode::NOT_FOUND,
                code: "not_found",
                message: err.to_string(),
            },
            JobError::InvalidState { .. } => AppError {
                status: StatusCode::CONFLICT,
                code: "conflict",
                message: err.to_string(),
            },
            other => {
                error!(error = %other, "request failed");
                AppError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: "internal",
                    message: other.to_string(),
                }
            }
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /jobs ============

/// Request body for `POST /jobs`. Deliberately not `Debug`: it may hold a
/// plaintext secret.
#[derive(Deserialize)]
struct SubmitRequest {
    #[serde(rename = "type")]
    job_type: String,
    #[serde(default)]
    parameters: serde_json::Value,
    #[serde(default)]
    secret: Option<String>,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    job_id: String,
    status: String,
}

async fn handle_submit(
    State(api): State<JobApi>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SubmitResponse>), AppError> {
    let Json(req) = body?;
    let secret = req.secret.filter(|s| !s.is_empty()).map(secret_from);
    let job_id = api
        .submit_job(&req.job_type, &req.parameters, secret)
        .await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id,
            status: "pending".to_string(),
        }),
    ))
}

// ============ GET /jobs ============

#[derive(Deserialize, Default)]
struct ListQuery {
    #[serde(rename = "type")]
    job_type: Option<String>,
    status: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

impl ListQuery {
    fn filter(&self) -> Result<JobFilter, JobError> {
        Ok(JobFilter {
            job_type: self.job_type.as_deref().map(str::parse).transpose()?,
            status: self.status.as_deref().map(str::parse).transpose()?,
        })
    }
}

async fn handle_list(
    State(api): State<JobApi>,
    Query(query): Query<ListQuery>,
) -> Result<Json<JobPage>, AppError> {
    let filter = query.filter()?;
    let page = Page::new(query.limit, query.offset);
    Ok(Json(api.list_jobs(filter, page).await?))
}

// ============ GET /jobs/{id} ============

async fn handle_status(
    State(api): State<JobApi>,
    Path(id): Path<String>,
) -> Result<Json<JobView>, AppError> {
    Ok(Json(api.get_job_status(&id).await?))
}

// ============ GET /jobs/{id}/progress ============

#[derive(Deserialize, Default)]
struct ProgressQuery {
    after: Option<i64>,
}

#[derive(Serialize)]
struct ProgressResponse {
    job_id: String,
    entries: Vec<ProgressEntry>,
}

async fn handle_progress(
    State(api): State<JobApi>,
    Path(id): Path<String>,
    Query(query): Query<ProgressQuery>,
) -> Result<Json<ProgressResponse>, AppError> {
    let entries = api.get_job_progress(&id, query.after).await?;
    Ok(Json(ProgressResponse {
        job_id: id,
        entries,
    }))
}

// ============ POST /jobs/{id}/cancel ============

#[derive(Serialize)]
struct CancelResponse {
    job_id: String,
    cancelled: bool,
}

async fn handle_cancel(
    State(api): State<JobApi>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, AppError> {
    let cancelled = api.cancel_job(&id).await?;
    Ok(Json(CancelResponse {
        job_id: id,
        cancelled,
    }))
}

// ============ /settings ============

async fn handle_get_settings(State(api): State<JobApi>) -> Json<Settings> {
    Json(api.get_settings().await)
}

async fn handle_update_settings(
    State(api): State<JobApi>,
    body: Result<Json<SettingsPatch>, JsonRejection>,
) -> Result<Json<Settings>, AppError> {
    let Json(patch) = body?;
    Ok(Json(api.update_settings(patch).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::UnavailableAdapter;
    use crate::credentials::CredentialGuard;
    use crate::runner::JobRunner;
    use crate::settings::SettingsStore;
    use crate::store::InMemoryJobStore;
    use serde_json::json;
    use std::sync::Arc;

    fn api() -> JobApi {
        JobApi::new(JobRunner::new(
            Arc::new(InMemoryJobStore::new()),
            Arc::new(SettingsStore::in_memory(Settings::default())),
            Arc::new(UnavailableAdapter),
            Arc::new(CredentialGuard::from_master_key("test")),
            1,
        ))
    }

    fn submit(job_type: &str, parameters: serde_json::Value) -> Json<SubmitRequest> {
        Json(SubmitRequest {
            job_type: job_type.to_string(),
            parameters,
            secret: None,
        })
    }

    #[tokio::test]
    async fn submit_returns_accepted() {
        let api = api();
        let (status, Json(body)) = handle_submit(
            State(api.clone()),
            Ok(submit("update-incomplete", json!({ "folder_path": "/books" }))),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body.status, "pending");

        let view = handle_status(State(api), Path(body.job_id.clone()))
            .await
            .unwrap();
        assert_eq!(view.0.id, body.job_id);
    }

    #[tokio::test]
    async fn validation_maps_to_bad_request() {
        let err = handle_submit(
            State(api()),
            Ok(submit("fetch-by-link", json!({ "link": "" }))),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "bad_request");
    }

    #[tokio::test]
    async fn unknown_job_maps_to_not_found() {
        let err = handle_status(State(api()), Path("missing".to_string()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bad_list_filter_is_rejected() {
        let query = ListQuery {
            status: Some("exploded".into()),
            ..Default::default()
        };
        let err = handle_list(State(api()), Query(query)).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn invalid_state_maps_to_conflict() {
        let err = AppError::from(JobError::InvalidState {
            id: "a".into(),
            status: "succeeded".into(),
            action: "complete",
        });
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.code, "conflict");
    }
}
