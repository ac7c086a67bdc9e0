use anyhow::Context;
use clap::Parser;
use inferd_server::server::{
    config::{CliArgs, ServerConfig},
    engine::{
        TextGenerationEngine,
        llama::{LlamaEngine, LlamaEngineConfig},
    },
    lifecycle::{InferenceServer, termination_signal},
    registry::registry_from_config,
    telemetry::init_telemetry,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    let model_path = config.model.resolve_file()?;
    let engine_config = LlamaEngineConfig {
        model_path,
        gpu_layers: config.model.gpu_layers,
        context_size: config.model.context_size,
    };
    let engine = tokio::task::spawn_blocking(move || LlamaEngine::load(engine_config))
        .await
        .context("engine loader panicked")??;
    tracing::info!("Loaded {}", engine.describe());

    let registry = registry_from_config(&config.registry)?;

    let tcp = TcpListener::bind(&config.server_addr)
        .await
        .with_context(|| format!("binding {}", config.server_addr))?;
    let incoming = TcpListenerStream::new(tcp);
    tracing::info!("Listening on {}", config.server_addr);

    let outcome = InferenceServer::new(config, Arc::new(engine))
        .with_registry(registry)
        .with_telemetry(providers)
        .serve_with_incoming_shutdown(incoming, termination_signal())
        .await?;

    tracing::info!("Service shut down ({outcome:?})");
    Ok(())
}

fn log_startup_info(config: &ServerConfig) {
    if cfg!(debug_assertions) {
        tracing::info!(
            "Starting {} ({}) with full config: {:#?}",
            config.server_name,
            config.environment,
            config
        );
    } else {
        tracing::info!(
            "Starting {} ({}) with model {} and {} session slots",
            config.server_name,
            config.environment,
            config.model.name,
            config.max_workers
        );
    }
}
