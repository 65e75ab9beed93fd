//! The fixed-contract HTTP surface of spec.md §6. Out-of-core per the
//! spec, but a complete repository needs at least one concrete edge; this
//! is it, built the way `fourthplaces-mntogether`'s server package wires
//! up `axum`.

use crate::admin::Admin;
use crate::error::BatchflowError;
use crate::store::Store;
use crate::submission::{Submission, SubmissionItem, SubmissionRequest};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

pub struct AppState<S> {
    pub submission: Arc<Submission<S>>,
    pub admin: Arc<Admin<S>>,
}

pub fn router<S: Store + 'static>(state: Arc<AppState<S>>) -> Router {
    Router::new()
        .route("/jobs", post(submit_job::<S>))
        .route("/jobs/:job_key", get(job_status::<S>))
        .route(
            "/jobs/:job_key/units/:input_id/redrive",
            post(redrive_unit::<S>),
        )
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct SubmitItemBody {
    #[serde(rename = "indexKey")]
    index_key: String,
    #[serde(rename = "effectiveDate")]
    effective_date: i32,
    #[serde(rename = "asofindicator")]
    asof_indicator: String,
}

#[derive(Debug, Deserialize)]
struct OutputSpec {
    #[allow(dead_code)]
    format: String,
}

#[derive(Debug, Deserialize)]
struct SubmitBody {
    items: Vec<SubmitItemBody>,
    #[serde(default)]
    #[allow(dead_code)]
    output: Option<OutputSpec>,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    #[serde(rename = "jobId")]
    job_id: String,
    status: &'static str,
}

async fn submit_job<S: Store + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(body): Json<SubmitBody>,
) -> Response {
    let request = SubmissionRequest {
        items: body
            .items
            .into_iter()
            .map(|i| SubmissionItem {
                index_key: i.index_key,
                effective_date: i.effective_date,
                asof_indicator: i.asof_indicator,
            })
            .collect(),
    };

    match state.submission.submit(request).await {
        Ok(job_key) => (
            StatusCode::ACCEPTED,
            Json(SubmitResponse {
                job_id: job_key,
                status: "SUBMITTED",
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn job_status<S: Store + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(job_key): Path<String>,
) -> Response {
    match state.admin.status_by_key(&job_key).await {
        Ok(Some(view)) => (StatusCode::OK, Json(view)).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => error_response(e),
    }
}

async fn redrive_unit<S: Store + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path((_job_key, input_id)): Path<(String, Uuid)>,
) -> Response {
    match state.admin.redrive(input_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(error: BatchflowError) -> Response {
    let status = match &error {
        BatchflowError::Validation(_) => StatusCode::BAD_REQUEST,
        BatchflowError::JobKeyConflict(_) => StatusCode::CONFLICT,
        BatchflowError::TooManyUnits { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        BatchflowError::JobTerminalGuardViolation(_) => StatusCode::CONFLICT,
        BatchflowError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, error.to_string()).into_response()
}
