//! Per-RPC session state machine.
//!
//! A [`SessionController`] consumes inbound fragments, keeps the session's
//! transcript, and runs one turn per non-empty fragment:
//!
//! ```text
//! Open -> Accumulating -> Generating -> Emitting -> Accumulating ... -> Closed
//! ```
//!
//! Each turn assembles a prompt from the whole transcript, waits for the
//! accelerator gate, and forwards every fragment from the generation bridge
//! as a partial chunk followed by exactly one finished chunk. A generation
//! error only ends the turn (unless the policy says otherwise); transport
//! failures, client disconnects and server termination close the session
//! without further emission.

use crate::server::{
    config::SessionPolicy,
    engine::TextGenerationEngine,
    gate::AcceleratorGate,
    pool::manager::ShutdownSignals,
    prompt::PromptAssembler,
    streaming::bridge::GenerationBridge,
    telemetry::{increment_tokens_generated, increment_turn_errors, increment_turns, record_turn},
};
use core::fmt;
use futures::{Stream, StreamExt};
use inferd_core::{
    Error,
    proto::{InferenceRequest, InferenceResponse},
    types::GenerationParams,
};
use std::time::Instant;
use tokio::sync::mpsc;
use tonic::Status;

/// Outbound half of a session.
pub type ResponseSender = mpsc::Sender<Result<InferenceResponse, Status>>;

/// Why a session reached `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The client half-closed its stream.
    InboundClosed,
    /// The client stopped reading (disconnect or cancellation).
    ClientGone,
    /// The inbound stream failed.
    Transport(String),
    /// A turn failed and the policy closes on generation errors.
    GenerationError,
    /// The server began draining while the session was idle.
    Drained,
    /// The drain grace period elapsed.
    Terminated,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InboundClosed => f.write_str("inbound stream closed"),
            Self::ClientGone => f.write_str("client went away"),
            Self::Transport(status) => write!(f, "transport error: {status}"),
            Self::GenerationError => f.write_str("generation error"),
            Self::Drained => f.write_str("server draining"),
            Self::Terminated => f.write_str("server terminated"),
        }
    }
}

/// Components shared by every session of one server.
pub struct SessionShared<E> {
    pub bridge: GenerationBridge<E>,
    pub gate: AcceleratorGate,
    pub assembler: PromptAssembler,
    pub params: GenerationParams,
    pub policy: SessionPolicy,
    pub signals: ShutdownSignals,
}

enum TurnOutcome {
    Completed,
    Failed,
    Aborted(CloseReason),
}

/// One session's transcript and counters.
pub struct SessionController<E> {
    shared: std::sync::Arc<SessionShared<E>>,
    transcript: Vec<String>,
    session_tokens: i32,
    turns: usize,
}

impl<E: TextGenerationEngine> SessionController<E> {
    pub fn new(shared: std::sync::Arc<SessionShared<E>>) -> Self {
        Self {
            shared,
            transcript: Vec::new(),
            session_tokens: 0,
            turns: 0,
        }
    }

    /// Turns completed or failed so far.
    pub fn turns(&self) -> usize {
        self.turns
    }

    /// Drives the session until it closes.
    pub async fn run<S>(&mut self, mut inbound: S, out: ResponseSender) -> CloseReason
    where
        S: Stream<Item = Result<InferenceRequest, Status>> + Unpin + Send,
    {
        let signals = self.shared.signals.clone();

        loop {
            // Fragments already queued by the client are served before an
            // idle session honours `draining`.
            let next = tokio::select! {
                biased;
                () = signals.terminated() => return CloseReason::Terminated,
                () = out.closed() => return CloseReason::ClientGone,
                next = inbound.next() => next,
                () = signals.draining() => return CloseReason::Drained,
            };

            let request = match next {
                None => return CloseReason::InboundClosed,
                Some(Err(status)) => {
                    tracing::warn!("Inbound stream failed: {status}");
                    return CloseReason::Transport(status.message().to_string());
                }
                Some(Ok(request)) => request,
            };

            if request.message.is_empty() {
                tracing::debug!(session_id = %request.session_id, "Ignoring empty fragment");
                continue;
            }

            tracing::info!(
                session_id = %request.session_id,
                message_len = request.message.len(),
                temperature = request.temperature,
                "Received fragment"
            );

            let temperature = request.temperature;
            self.transcript.push(request.message);

            match self.turn(temperature, &out).await {
                TurnOutcome::Completed => {}
                TurnOutcome::Failed if self.shared.policy.close_on_generation_error => {
                    return CloseReason::GenerationError;
                }
                TurnOutcome::Failed => {}
                TurnOutcome::Aborted(reason) => return reason,
            }
        }
    }

    fn params_for(&self, temperature: f32) -> GenerationParams {
        if self.shared.policy.honor_temperature_override {
            self.shared.params.with_temperature_override(temperature)
        } else {
            self.shared.params
        }
    }

    async fn turn(&mut self, temperature: f32, out: &ResponseSender) -> TurnOutcome {
        let shared = std::sync::Arc::clone(&self.shared);
        let started = Instant::now();
        self.turns += 1;
        increment_turns();

        let raw = self.transcript.concat();
        let prompt = shared.assembler.assemble(shared.bridge.engine(), &raw);
        let params = self.params_for(temperature);

        tracing::info!(
            turn = self.turns,
            prompt_len = prompt.len(),
            temperature = params.temperature,
            "Starting turn"
        );

        let permit = tokio::select! {
            biased;
            () = shared.signals.terminated() => return TurnOutcome::Aborted(CloseReason::Terminated),
            () = out.closed() => return TurnOutcome::Aborted(CloseReason::ClientGone),
            permit = shared.gate.admit() => permit,
        };

        let mut tokens = shared.bridge.start(permit, prompt, params);
        let base = if shared.policy.cumulative_token_count {
            self.session_tokens
        } else {
            0
        };
        let mut turn_tokens: i32 = 0;

        let failure = loop {
            let item = tokio::select! {
                biased;
                () = shared.signals.terminated() => Err(CloseReason::Terminated),
                () = out.closed() => Err(CloseReason::ClientGone),
                item = tokens.next() => Ok(item),
            };

            let item = match item {
                Ok(item) => item,
                Err(reason) => {
                    self.session_tokens += turn_tokens;
                    return TurnOutcome::Aborted(reason);
                }
            };

            match item {
                None => break None,
                Some(Ok(fragment)) => {
                    turn_tokens += 1;
                    let chunk = InferenceResponse::partial(fragment, base + turn_tokens);
                    if let Err(reason) = emit(&shared.signals, out, chunk).await {
                        self.session_tokens += turn_tokens;
                        return TurnOutcome::Aborted(reason);
                    }
                }
                Some(Err(e)) => break Some(e),
            }
        };

        self.session_tokens += turn_tokens;
        increment_tokens_generated(turn_tokens as u64);

        let closing = match &failure {
            None => InferenceResponse::finished(base + turn_tokens),
            Some(e) => InferenceResponse::failed(e.client_message(), base + turn_tokens),
        };
        if let Err(reason) = emit(&shared.signals, out, closing).await {
            return TurnOutcome::Aborted(reason);
        }

        let elapsed = started.elapsed().as_secs_f64();
        let tokens_per_second = if elapsed > 0.0 {
            f64::from(turn_tokens) / elapsed
        } else {
            0.0
        };

        match failure {
            None => {
                record_turn(elapsed * 1000.0, tokens_per_second);
                tracing::info!(
                    turn = self.turns,
                    tokens = turn_tokens,
                    elapsed_secs = elapsed,
                    tokens_per_second,
                    "Turn finished"
                );
                TurnOutcome::Completed
            }
            Some(e) => {
                increment_turn_errors();
                log_failure(self.turns, turn_tokens, &e);
                TurnOutcome::Failed
            }
        }
    }
}

fn log_failure(turn: usize, tokens: i32, err: &Error) {
    tracing::warn!(turn, tokens, "Turn failed: {err}");
}

/// Sends one chunk, giving up if the client is gone or the server terminates.
async fn emit(
    signals: &ShutdownSignals,
    out: &ResponseSender,
    chunk: InferenceResponse,
) -> Result<(), CloseReason> {
    tokio::select! {
        biased;
        () = signals.terminated() => Err(CloseReason::Terminated),
        sent = out.send(Ok(chunk)) => sent.map_err(|_| CloseReason::ClientGone),
    }
}
