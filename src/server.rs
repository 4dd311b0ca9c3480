// src/server.rs

//! HTTP surface for the ingest daemon: document submission, status lookup,
//! operator job control, and per-org quota inspection.

use crate::quota::{QuotaEnforcer, QuotaType};
use crate::router::{IngestOutcome, IngestRequest};
use crate::state::StateStore;
use crate::timeout::TimeoutEnforcer;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

// The application state, shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<crate::router::Router>,
    pub state: StateStore,
    pub timeouts: Arc<TimeoutEnforcer>,
    pub quota: Arc<QuotaEnforcer>,
}

async fn ingest_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<IngestRequest>,
) -> impl IntoResponse {
    match app_state.router.ingest(payload).await {
        Ok(IngestOutcome::Created(document)) => {
            (StatusCode::CREATED, Json(json!(document))).into_response()
        }
        Ok(IngestOutcome::Skipped { doc_id, reason }) => (
            StatusCode::OK,
            Json(json!({ "doc_id": doc_id, "skipped": true, "reason": reason })),
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Ingest request failed");
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn document_handler(
    State(app_state): State<Arc<AppState>>,
    Path(doc_id): Path<String>,
) -> impl IntoResponse {
    match app_state.state.get_document(&doc_id).await {
        Ok(Some(document)) => (StatusCode::OK, Json(json!(document))).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "Document not found").into_response(),
        Err(e) => {
            error!(doc_id, error = %e, "Document lookup failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn job_handler(
    State(app_state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    match app_state.state.get_job(&job_id).await {
        Ok(Some(job)) => (StatusCode::OK, Json(json!(job))).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "Job not found").into_response(),
        Err(e) => {
            error!(job_id, error = %e, "Job lookup failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[derive(Deserialize)]
pub struct StopRequest {
    pub reason: String,
}

async fn stop_job_handler(
    State(app_state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
    Json(payload): Json<StopRequest>,
) -> impl IntoResponse {
    match app_state.timeouts.stop_job(&job_id, &payload.reason).await {
        Ok(Some(job)) => (StatusCode::OK, Json(json!(job))).into_response(),
        Ok(None) => (StatusCode::CONFLICT, "Job is not in a stoppable state").into_response(),
        Err(e) => {
            error!(job_id, error = %e, "Stop request failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn quota_handler(
    State(app_state): State<Arc<AppState>>,
    Path(org_id): Path<String>,
) -> impl IntoResponse {
    let types = [
        QuotaType::ProcessingMonthly,
        QuotaType::StorageTotal,
        QuotaType::ConcurrentJobs,
        QuotaType::FileCountTotal,
    ];
    let mut report = serde_json::Map::new();
    for quota_type in types {
        match app_state.quota.status(&org_id, quota_type).await {
            Ok(status) => {
                report.insert(quota_type.to_string(), json!(status));
            }
            Err(e) => {
                error!(org_id, %quota_type, error = %e, "Quota lookup failed");
                return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
            }
        }
    }
    (StatusCode::OK, Json(serde_json::Value::Object(report))).into_response()
}

// The main function to run the server
pub async fn run_server(app_state: Arc<AppState>, port: u16) -> crate::error::Result<()> {
    let app = axum::Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/ingest", post(ingest_handler))
        .route("/documents/:doc_id", get(document_handler))
        .route("/jobs/:job_id", get(job_handler))
        .route("/jobs/:job_id/stop", post(stop_job_handler))
        .route("/quota/:org_id", get(quota_handler))
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .await
        .map_err(|e| crate::error::PipelineError::Unexpected(e.to_string()))
}
