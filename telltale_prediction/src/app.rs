use crate::{
    config::Config,
    ort_service::OrtModelLoader,
    prediction::PredictionService,
    registry::ModelRegistry,
    server::{HttpServer, SharedState},
    telemetry::Metrics,
};
use std::sync::Arc;
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> anyhow::Result<()> {
    let loader = OrtModelLoader::new(config.model.num_instances);
    let registry = Arc::new(ModelRegistry::new(
        &config.model.models_dir,
        &config.model.default_model,
        loader,
    ));

    {
        let registry = registry.clone();
        tokio::task::spawn_blocking(move || registry.initialize()).await?;
    }

    let prediction_service = PredictionService::new(registry.clone(), config.model.normalization);
    let metrics = Arc::new(Metrics::new()?);
    let state = SharedState::new(registry, prediction_service, metrics);

    let server = HttpServer::new(state, &config).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_handle = server.run(shutdown_tx.subscribe()).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    server_handle.await??;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
