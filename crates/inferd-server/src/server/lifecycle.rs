//! Process lifecycle: `Starting -> Serving -> Draining -> Stopped`.
//!
//! [`InferenceServer`] wires the engine, accelerator gate, session pool,
//! health and reflection services into one tonic server and owns the ordered
//! shutdown:
//!
//! 1. Deregister from the service registry while the listener still accepts.
//! 2. Stop the listener and drain sessions for the grace period.
//! 3. Terminate leftovers, flush telemetry, report `Stopped`.
//!
//! Health keys are set to `SERVING` once after the listener is up and are not
//! flipped during drain; the registry withdrawal is what stops new traffic.

use crate::server::{
    config::ServerConfig,
    engine::TextGenerationEngine,
    gate::AcceleratorGate,
    pool::manager::{DrainOutcome, SessionPool},
    registry::{DisabledRegistry, ServiceRegistration, ServiceRegistry, detect_advertise_ip},
    service::handler::InferenceService,
    telemetry::TelemetryProviders,
};
use core::{fmt, time::Duration};
use futures::Stream;
use inferd_core::proto::{FILE_DESCRIPTOR_SET, inferencer_service_server::InferencerServiceServer};
use std::{future::Future, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    signal,
    sync::watch,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Server, server::Connected};
use tonic_health::ServingStatus;
use tonic_reflection::server::Builder;
use tonic_web::GrpcWebLayer;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};

/// How long the transport gets to close connections after sessions drained.
const LISTENER_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Starting,
    Serving,
    Draining,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Starting => "starting",
            Self::Serving => "serving",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        })
    }
}

/// A configured server, ready to serve one listener.
pub struct InferenceServer<E> {
    config: ServerConfig,
    engine: Arc<E>,
    registry: Arc<dyn ServiceRegistry>,
    providers: Option<TelemetryProviders>,
    state: watch::Sender<LifecycleState>,
}

impl<E: TextGenerationEngine> InferenceServer<E> {
    /// A server with registration disabled and no telemetry exporters.
    pub fn new(config: ServerConfig, engine: Arc<E>) -> Self {
        let (state, _) = watch::channel(LifecycleState::Starting);
        Self {
            config,
            engine,
            registry: Arc::new(DisabledRegistry),
            providers: None,
            state,
        }
    }

    #[must_use]
    pub fn with_registry(mut self, registry: Arc<dyn ServiceRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Providers to flush once draining completes.
    #[must_use]
    pub fn with_telemetry(mut self, providers: TelemetryProviders) -> Self {
        self.providers = Some(providers);
        self
    }

    /// Observes lifecycle transitions.
    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    fn transition(&self, next: LifecycleState) {
        let previous = self.state.send_replace(next);
        tracing::info!("Lifecycle {previous} -> {next}");
    }

    fn registration(&self) -> ServiceRegistration {
        let address = self
            .config
            .registry
            .advertise_ip
            .unwrap_or_else(detect_advertise_ip);

        ServiceRegistration::new(&self.config.server_name, address, self.config.port).with_tags([
            self.config.server_name.as_str(),
            self.config.environment.as_str(),
            "grpc",
        ])
    }

    /// Serves `incoming` until `signal` resolves, then drains.
    ///
    /// # Errors
    ///
    /// Fails if reflection cannot be built or the transport stops with an
    /// error before `signal` fires. Registry failures are logged only.
    pub async fn serve_with_incoming_shutdown<I, IO, IE, F>(
        self,
        incoming: I,
        signal: F,
    ) -> anyhow::Result<DrainOutcome>
    where
        I: Stream<Item = Result<IO, IE>> + Send + 'static,
        IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
        IO::ConnectInfo: Clone + Send + Sync + 'static,
        IE: Into<tower::BoxError> + Send + 'static,
        F: Future<Output = ()>,
    {
        let pool = Arc::new(SessionPool::new(self.config.max_workers));
        let service = InferenceService::new(
            Arc::clone(&self.engine),
            AcceleratorGate::new(),
            Arc::clone(&pool),
            self.config.generation,
            self.config.session,
        );

        let (health_reporter, health_service) = tonic_health::server::health_reporter();
        let reflection = Builder::configure()
            .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
            .build_v1()?;

        let listener = CancellationToken::new();
        let router = Server::builder()
            .accept_http1(true)
            .http2_adaptive_window(Some(true))
            .layer(
                ServiceBuilder::new()
                    .layer(
                        CorsLayer::new()
                            .allow_origin(Any)
                            .allow_methods(Any)
                            .allow_headers(Any),
                    )
                    .layer(GrpcWebLayer::new()),
            )
            .add_service(health_service)
            .add_service(reflection)
            .add_service(service.into_server());
        let mut server = tokio::spawn(
            router.serve_with_incoming_shutdown(incoming, listener.clone().cancelled_owned()),
        );

        health_reporter
            .set_service_status("", ServingStatus::Serving)
            .await;
        health_reporter
            .set_service_status(&self.config.server_name, ServingStatus::Serving)
            .await;
        health_reporter
            .set_serving::<InferencerServiceServer<InferenceService<E>>>()
            .await;

        let registration = self.registration();
        match self.registry.register(&registration).await {
            Ok(()) => tracing::info!(
                "Registered {} at {}:{}",
                registration.id,
                registration.address,
                registration.port
            ),
            Err(e) => tracing::warn!("{e}; continuing unregistered"),
        }

        self.transition(LifecycleState::Serving);
        tracing::info!("{} ready, engine: {}", self.config.server_name, self.engine.describe());

        let early_exit = tokio::select! {
            () = signal => None,
            joined = &mut server => Some(joined),
        };

        // === Draining ===
        self.transition(LifecycleState::Draining);

        match self.registry.deregister(&registration.id).await {
            Ok(()) => tracing::info!("Deregistered {}", registration.id),
            Err(e) => tracing::warn!("{e}"),
        }

        listener.cancel();
        let outcome = pool.shutdown(self.config.shutdown_grace).await;
        tracing::info!("Sessions drained ({outcome:?})");

        let served = match early_exit {
            Some(joined) => joined.map_err(anyhow::Error::from).and_then(|r| r.map_err(Into::into)),
            None => match timeout(LISTENER_CLOSE_TIMEOUT, &mut server).await {
                Ok(joined) => joined
                    .map_err(anyhow::Error::from)
                    .and_then(|r| r.map_err(Into::into)),
                Err(_) => {
                    tracing::warn!("Transport did not close in time; aborting connections");
                    server.abort();
                    Ok(())
                }
            },
        };

        if let Some(providers) = &self.providers {
            providers.shutdown();
        }
        self.transition(LifecycleState::Stopped);

        served.map(|()| outcome)
    }
}

/// Resolves on Ctrl+C or SIGTERM.
///
/// Handlers are installed when this is called, not when the future is first
/// polled, so a signal arriving while the server is still registering is
/// not lost.
#[cfg(unix)]
pub fn termination_signal() -> impl Future<Output = ()> + Send + 'static {
    use signal::unix::{Signal, SignalKind};

    async fn received(stream: Option<&mut Signal>) {
        match stream {
            Some(stream) => {
                stream.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    let install = |kind: SignalKind, name: &'static str| {
        signal::unix::signal(kind)
            .inspect_err(|e| tracing::error!("Failed to install {name} handler: {e}"))
            .ok()
    };
    let mut terminate = install(SignalKind::terminate(), "SIGTERM");
    let mut interrupt = install(SignalKind::interrupt(), "Ctrl+C");

    async move {
        tokio::select! {
            () = received(interrupt.as_mut()) => tracing::info!("Received Ctrl+C signal"),
            () = received(terminate.as_mut()) => tracing::info!("Received SIGTERM signal"),
        }
    }
}

/// Resolves on Ctrl+C.
#[cfg(not(unix))]
pub fn termination_signal() -> impl Future<Output = ()> + Send + 'static {
    async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
        tracing::info!("Received Ctrl+C signal");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Command;

    #[tokio::test]
    async fn sigterm_before_first_poll_is_observed() {
        let signal = termination_signal();

        let status = Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        timeout(Duration::from_secs(2), signal)
            .await
            .expect("SIGTERM delivered to the installed handler");
    }

    #[test]
    fn lifecycle_states_display_lowercase() {
        assert_eq!(LifecycleState::Draining.to_string(), "draining");
        assert_eq!(LifecycleState::Stopped.to_string(), "stopped");
    }
}
