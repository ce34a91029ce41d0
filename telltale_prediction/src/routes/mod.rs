mod error;
mod health;
mod metrics;
mod models;
mod predict;
mod report;

use crate::{registry::ModelLoader, server::SharedState};
use axum::{
    routing::{get, post},
    Router,
};

pub use error::ApiError;

pub fn api_routes<L: ModelLoader>() -> Router<SharedState<L>> {
    Router::new()
        .route("/health", get(health::healthcheck::<L>))
        .route("/metrics", get(metrics::metrics_handler::<L>))
        .route("/models", get(models::list_models::<L>))
        .route("/switch-model", post(models::switch_model::<L>))
        .route("/predict", post(predict::predict::<L>))
        .route("/predict-batch", post(predict::predict_batch::<L>))
        .route("/export-report", post(report::export_report::<L>))
}
