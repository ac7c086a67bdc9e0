#![allow(dead_code)]

use core::time::Duration;
use inferd_core::proto::{
    InferenceRequest, InferenceResponse, inferencer_service_client::InferencerServiceClient,
};
use inferd_server::server::{
    config::ServerConfig,
    engine::scripted::ScriptedEngine,
    lifecycle::{InferenceServer, LifecycleState},
    pool::manager::DrainOutcome,
    registry::{DisabledRegistry, ServiceRegistry},
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::{Streaming, transport::Channel};

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: watch::Receiver<LifecycleState>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<anyhow::Result<DrainOutcome>>,
}

impl TestServer {
    pub async fn start(engine: Arc<ScriptedEngine>) -> Self {
        Self::start_with(engine, Arc::new(DisabledRegistry), |_| {}).await
    }

    pub async fn start_with(
        engine: Arc<ScriptedEngine>,
        registry: Arc<dyn ServiceRegistry>,
        configure: impl FnOnce(&mut ServerConfig),
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut config = ServerConfig::for_addr(addr);
        configure(&mut config);

        let server = InferenceServer::new(config, engine).with_registry(registry);
        let mut state = server.subscribe();
        let (shutdown, signal) = oneshot::channel::<()>();

        let handle = tokio::spawn(server.serve_with_incoming_shutdown(
            TcpListenerStream::new(listener),
            async move {
                let _ = signal.await;
            },
        ));

        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == LifecycleState::Serving),
        )
        .await
        .expect("server started")
        .unwrap();

        Self {
            addr,
            state,
            shutdown: Some(shutdown),
            handle,
        }
    }

    pub async fn channel(&self) -> Channel {
        Channel::from_shared(format!("http://{}", self.addr))
            .unwrap()
            .connect()
            .await
            .unwrap()
    }

    pub async fn client(&self) -> InferencerServiceClient<Channel> {
        InferencerServiceClient::new(self.channel().await)
    }

    /// Fires the termination signal without waiting for the drain.
    pub fn signal_shutdown(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }

    /// Signals shutdown and waits for the server to stop.
    pub async fn stop(mut self) -> DrainOutcome {
        self.signal_shutdown();
        tokio::time::timeout(Duration::from_secs(15), self.handle)
            .await
            .expect("server stopped")
            .unwrap()
            .unwrap()
    }
}

/// An open session: a sender for fragments and the response stream.
pub struct Session {
    pub tx: mpsc::Sender<InferenceRequest>,
    pub rx: Streaming<InferenceResponse>,
}

impl Session {
    pub async fn open(client: &mut InferencerServiceClient<Channel>) -> Self {
        let (tx, outbound) = mpsc::channel(16);
        let rx = client
            .stream_inference(ReceiverStream::new(outbound))
            .await
            .unwrap()
            .into_inner();
        Self { tx, rx }
    }

    pub async fn send(&self, session_id: &str, message: &str) {
        self.send_with_temperature(session_id, message, 0.0).await;
    }

    pub async fn send_with_temperature(&self, session_id: &str, message: &str, temperature: f32) {
        self.tx
            .send(InferenceRequest {
                session_id: session_id.into(),
                message: message.into(),
                temperature,
            })
            .await
            .unwrap();
    }

    /// Reads chunks up to and including the next finished chunk.
    pub async fn turn(&mut self) -> Vec<InferenceResponse> {
        let mut chunks = Vec::new();
        loop {
            let chunk = tokio::time::timeout(Duration::from_secs(10), self.rx.message())
                .await
                .expect("chunk in time")
                .unwrap()
                .expect("stream open");
            let finished = chunk.is_finished;
            chunks.push(chunk);
            if finished {
                return chunks;
            }
        }
    }

    /// Reads until the server ends the stream.
    pub async fn drain(&mut self) -> Vec<InferenceResponse> {
        let mut chunks = Vec::new();
        loop {
            match tokio::time::timeout(Duration::from_secs(10), self.rx.message())
                .await
                .expect("stream ended in time")
            {
                Ok(Some(chunk)) => chunks.push(chunk),
                Ok(None) | Err(_) => return chunks,
            }
        }
    }
}

pub fn text(chunks: &[InferenceResponse]) -> String {
    chunks.iter().map(|c| c.chunk.as_str()).collect()
}
