use crate::{registry::ModelLoader, routes::ApiError, server::SharedState};
use axum::extract::State;
use prometheus::{Encoder, TextEncoder};

pub async fn metrics_handler<L: ModelLoader>(
    State(state): State<SharedState<L>>,
) -> Result<String, ApiError> {
    let metric_families = state.metrics.registry.gather();

    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    String::from_utf8(buffer).map_err(|e| ApiError::Internal(e.to_string()))
}
