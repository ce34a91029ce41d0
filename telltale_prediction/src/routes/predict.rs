use crate::{
    prediction::{is_accepted_filename, BatchRecord, PredictionResult, UploadedFile},
    registry::ModelLoader,
    routes::ApiError,
    server::SharedState,
};
use axum::{
    extract::{Multipart, State},
    response::Json,
};
use std::time::Instant;
use tracing::instrument;

const SINGLE_FILE_FIELD: &str = "file";

#[instrument(skip(state, multipart))]
pub async fn predict<L: ModelLoader>(
    State(state): State<SharedState<L>>,
    mut multipart: Multipart,
) -> Result<Json<PredictionResult>, ApiError> {
    state.metrics.record_request("/predict");

    let mut upload = None;
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(SINGLE_FILE_FIELD) {
            let filename = field.file_name().unwrap_or_default().to_string();
            if !is_accepted_filename(&filename) {
                return Err(ApiError::BadRequest(
                    "Only PNG images are allowed.".to_string(),
                ));
            }
            let bytes = field.bytes().await?;
            upload = Some((filename, bytes.to_vec()));
            break;
        }
    }
    let (filename, bytes) =
        upload.ok_or_else(|| ApiError::BadRequest("No file uploaded".to_string()))?;

    let started = Instant::now();
    let result = state.prediction_service.predict(filename, bytes).await;
    state
        .metrics
        .record_prediction_duration(started.elapsed().as_millis() as u64, "/predict");

    Ok(Json(result?))
}

#[instrument(skip(state, multipart))]
pub async fn predict_batch<L: ModelLoader>(
    State(state): State<SharedState<L>>,
    mut multipart: Multipart,
) -> Result<Json<Vec<BatchRecord>>, ApiError> {
    state.metrics.record_request("/predict-batch");

    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await? {
        let Some(filename) = field.file_name().map(str::to_string) else {
            continue;
        };
        let bytes = field.bytes().await?;
        files.push(UploadedFile {
            filename,
            bytes: bytes.to_vec(),
        });
    }
    tracing::info!("Received batch of {} files", files.len());

    let started = Instant::now();
    let records = state.prediction_service.predict_batch(files).await?;
    state
        .metrics
        .record_prediction_duration(started.elapsed().as_millis() as u64, "/predict-batch");

    Ok(Json(records))
}
