use crate::{
    config::Config,
    prediction::PredictionService,
    registry::{ModelLoader, ModelRegistry},
    routes::api_routes,
    telemetry::Metrics,
};
use axum::{extract::DefaultBodyLimit, Router};
use axum_otel_metrics::HttpMetricsLayerBuilder;
use std::sync::Arc;
use tokio::{net::TcpListener, sync::broadcast::Receiver, task::JoinHandle};
use tower_http::cors::CorsLayer;

pub struct SharedState<L: ModelLoader> {
    pub registry: Arc<ModelRegistry<L>>,
    pub prediction_service: PredictionService<L>,
    pub metrics: Arc<Metrics>,
}

impl<L: ModelLoader> Clone for SharedState<L> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            prediction_service: self.prediction_service.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<L: ModelLoader> SharedState<L> {
    pub fn new(
        registry: Arc<ModelRegistry<L>>,
        prediction_service: PredictionService<L>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry,
            prediction_service,
            metrics,
        }
    }
}

pub fn build_router<L: ModelLoader>(state: SharedState<L>, body_limit_bytes: usize) -> Router {
    Router::new()
        .merge(api_routes())
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .layer(CorsLayer::permissive())
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new<L: ModelLoader>(state: SharedState<L>, config: &Config) -> anyhow::Result<Self> {
        let addr = config.server.get_address();
        let metrics_layer = HttpMetricsLayerBuilder::new().build();

        let router = build_router(state, config.server.body_limit_bytes).layer(metrics_layer);
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(
        self,
        shutdown_rx: Receiver<()>,
    ) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        let listener = self.listener;
        let router = self.router;
        let server_handle = tokio::spawn({
            let mut shutdown_rx = shutdown_rx.resubscribe();
            async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move {
                        shutdown_rx.recv().await.ok();
                    })
                    .await?;
                Ok(())
            }
        });

        Ok(server_handle)
    }
}
