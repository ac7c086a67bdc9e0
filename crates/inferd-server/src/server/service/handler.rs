//! gRPC entry point for `StreamInference`.
//!
//! [`InferenceService`] admits each RPC through the [`SessionPool`], spawns a
//! [`SessionController`] on the pool's tracker, and hands tonic a
//! [`ReceiverStream`] over the session's outbound channel. The handler itself
//! returns as soon as the session is admitted; everything else runs in the
//! spawned task.

use crate::server::{
    config::SessionPolicy,
    engine::TextGenerationEngine,
    gate::AcceleratorGate,
    pool::manager::SessionPool,
    prompt::PromptAssembler,
    streaming::{
        bridge::GenerationBridge,
        session::{SessionController, SessionShared},
    },
    telemetry::{decrement_sessions_inflight, increment_sessions, increment_sessions_inflight},
};
use core::pin::Pin;
use futures::Stream;
use inferd_core::{
    proto::{
        InferenceRequest, InferenceResponse,
        inferencer_service_server::{InferencerService, InferencerServiceServer},
    },
    types::GenerationParams,
};
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming, codec::CompressionEncoding};
use tracing::Instrument;

/// Streaming inference service over one engine.
pub struct InferenceService<E> {
    shared: Arc<SessionShared<E>>,
    pool: Arc<SessionPool>,
    next_session: Arc<AtomicU64>,
}

impl<E> Clone for InferenceService<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            pool: Arc::clone(&self.pool),
            next_session: Arc::clone(&self.next_session),
        }
    }
}

impl<E: TextGenerationEngine> InferenceService<E> {
    pub fn new(
        engine: Arc<E>,
        gate: AcceleratorGate,
        pool: Arc<SessionPool>,
        params: GenerationParams,
        policy: SessionPolicy,
    ) -> Self {
        let shared = SessionShared {
            bridge: GenerationBridge::new(engine, pool.tracker()),
            gate,
            assembler: PromptAssembler::default(),
            params,
            policy,
            signals: pool.signals(),
        };

        Self {
            shared: Arc::new(shared),
            pool,
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Wraps the service in the generated tonic server with compression.
    pub fn into_server(self) -> InferencerServiceServer<Self> {
        InferencerServiceServer::new(self)
            .send_compressed(CompressionEncoding::Zstd)
            .send_compressed(CompressionEncoding::Gzip)
            .send_compressed(CompressionEncoding::Deflate)
            .accept_compressed(CompressionEncoding::Zstd)
            .accept_compressed(CompressionEncoding::Gzip)
            .accept_compressed(CompressionEncoding::Deflate)
    }
}

#[tonic::async_trait]
impl<E: TextGenerationEngine> InferencerService for InferenceService<E> {
    type StreamInferenceStream =
        Pin<Box<dyn Stream<Item = Result<InferenceResponse, Status>> + Send>>;

    /// Opens a session for the duration of the RPC.
    ///
    /// Waits for a session slot; once the server is draining the RPC is
    /// refused with `UNAVAILABLE`.
    #[tracing::instrument(skip_all, fields(peer = ?req.remote_addr()))]
    async fn stream_inference(
        &self,
        req: Request<Streaming<InferenceRequest>>,
    ) -> Result<Response<Self::StreamInferenceStream>, Status> {
        let slot = self.pool.admit().await.inspect_err(|_| {
            tracing::info!("Refusing session: server is draining");
        })?;

        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        let inbound = req.into_inner();
        let (resp_tx, resp_rx) = mpsc::channel(self.shared.policy.stream_buffer_size);
        let mut controller = SessionController::new(Arc::clone(&self.shared));

        increment_sessions();
        increment_sessions_inflight();

        let fut = async move {
            tracing::info!("Session opened");
            let reason = controller.run(inbound, resp_tx).await;
            tracing::info!(turns = controller.turns(), "Session closed: {reason}");
            decrement_sessions_inflight();
        };
        self.pool
            .spawn(slot, fut.instrument(tracing::info_span!("session", session)));

        Ok(Response::new(Box::pin(ReceiverStream::new(resp_rx))))
    }
}
