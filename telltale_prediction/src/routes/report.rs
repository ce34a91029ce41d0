use crate::{
    registry::ModelLoader,
    report::{export, Record, ReportFormat},
    routes::ApiError,
    server::SharedState,
};
use axum::{
    body::Body,
    extract::{Query, State},
    http::header,
    response::{Json, Response},
};
use serde::Deserialize;
use tracing::instrument;

#[derive(Debug, Deserialize)]
pub struct ExportParams {
    format: Option<String>,
}

#[instrument(skip(state, records), fields(count = records.len()))]
pub async fn export_report<L: ModelLoader>(
    State(state): State<SharedState<L>>,
    Query(params): Query<ExportParams>,
    Json(records): Json<Vec<Record>>,
) -> Result<Response, ApiError> {
    state.metrics.record_request("/export-report");

    let format = ReportFormat::parse(params.format.as_deref().unwrap_or("xlsx"));
    let now = chrono::Local::now().naive_local();
    let file = export(&records, format, now)?;

    Response::builder()
        .header(header::CONTENT_TYPE, file.content_type)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename={}", file.filename),
        )
        .body(Body::from(file.bytes))
        .map_err(|e| ApiError::Report(e.to_string()))
}
