use crate::{
    registry::{ModelListing, ModelLoader},
    routes::ApiError,
    server::SharedState,
};
use axum::{
    extract::{Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

#[derive(Debug, Deserialize)]
pub struct SwitchModelParams {
    name: String,
}

#[derive(Debug, Serialize)]
pub struct SwitchModelResponse {
    status: &'static str,
    model: String,
}

pub async fn list_models<L: ModelLoader>(State(state): State<SharedState<L>>) -> Json<ModelListing> {
    state.metrics.record_request("/models");
    Json(state.registry.list_models())
}

#[instrument(skip(state))]
pub async fn switch_model<L: ModelLoader>(
    State(state): State<SharedState<L>>,
    Query(params): Query<SwitchModelParams>,
) -> Result<Json<SwitchModelResponse>, ApiError> {
    state.metrics.record_request("/switch-model");

    let registry = state.registry.clone();
    let name = params.name.clone();
    let result = tokio::task::spawn_blocking(move || registry.load_model(&name))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    state.metrics.record_model_switch(result.is_ok());
    let model = result?;

    Ok(Json(SwitchModelResponse {
        status: "success",
        model: model.name.clone(),
    }))
}
