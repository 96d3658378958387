use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::api::ApiState;
use crate::error::{Result, SchedulerError};
use crate::scheduler::{JobRecord, JobResult, JobStatus, SubmitReceipt};

#[derive(Debug, Deserialize)]
pub(crate) struct VersionParams {
    version: Option<String>,
}

impl VersionParams {
    /// `?version=` with an empty value means no filter.
    fn into_version(self) -> Option<String> {
        self.version.filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ServiceInfo {
    name: &'static str,
    version: &'static str,
    token_required: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct ReportReceipt {
    job: String,
    status: JobStatus,
}

pub(crate) async fn info(State(state): State<ApiState>) -> Json<ServiceInfo> {
    Json(ServiceInfo {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
        token_required: state.guard.is_enabled(),
    })
}

pub(crate) async fn submit(
    State(state): State<ApiState>,
    Query(params): Query<VersionParams>,
    body: Bytes,
) -> Result<Json<SubmitReceipt>> {
    let version = params.into_version();
    let receipt = state.service.submit(body.to_vec(), version.clone()).await?;
    tracing::info!(
        job_id = %receipt.job,
        version = ?version,
        progress = receipt.progress,
        "Job submitted"
    );
    Ok(Json(receipt))
}

pub(crate) async fn get_result(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<JobResult>> {
    Ok(Json(state.service.get_result(&id).await?))
}

pub(crate) async fn claim(
    State(state): State<ApiState>,
    Query(params): Query<VersionParams>,
) -> Result<Response> {
    claim_for(&state, params.into_version()).await
}

pub(crate) async fn claim_version(
    State(state): State<ApiState>,
    Path(version): Path<String>,
) -> Result<Response> {
    claim_for(&state, Some(version)).await
}

async fn claim_for(state: &ApiState, version: Option<String>) -> Result<Response> {
    match state.service.claim(version).await? {
        Some(job) => Ok(Json(job).into_response()),
        None => Ok(Json(serde_json::json!({})).into_response()),
    }
}

pub(crate) async fn report(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: std::result::Result<Json<JobRecord>, JsonRejection>,
) -> Result<Json<ReportReceipt>> {
    let Json(record) = body.map_err(|e| SchedulerError::InvalidRecord(e.body_text()))?;
    if record.id != id {
        return Err(SchedulerError::InvalidRecord(format!(
            "path id {} does not match record id {}",
            id, record.id
        )));
    }

    let status = record.status;
    let job = state.service.report(record).await?;
    Ok(Json(ReportReceipt { job, status }))
}
