//! Bridges a blocking generation call into an async token stream.
//!
//! [`GenerationBridge::start`] moves the engine call onto a blocking thread
//! (tracked by the shared [`TaskTracker`]) and immediately returns a
//! [`TokenStream`]. Fragments cross an unbounded channel, so the producer is
//! never throttled by a slow client and the gate is released as soon as the
//! engine returns.
//!
//! ## Guarantees
//!
//! - Fragments arrive in emission order; none are dropped while the stream is
//!   held.
//! - An engine error is yielded as the last item. A panicking engine surfaces
//!   as a `Generation` error instead of ending the stream silently.
//! - Dropping the stream early detaches the unit: it runs to completion, its
//!   output is discarded, and the tracker still observes its exit.

use crate::server::{
    engine::{TextGenerationEngine, TokenSink},
    gate::GatePermit,
};
use core::{
    pin::Pin,
    task::{Context, Poll},
};
use futures::Stream;
use inferd_core::{Error, Result, types::GenerationParams};
use std::{future::Future, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::task::TaskTracker;

/// Starts generation units against a shared engine.
pub struct GenerationBridge<E> {
    engine: Arc<E>,
    tracker: TaskTracker,
}

impl<E> Clone for GenerationBridge<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
            tracker: self.tracker.clone(),
        }
    }
}

impl<E: TextGenerationEngine> GenerationBridge<E> {
    pub fn new(engine: Arc<E>, tracker: TaskTracker) -> Self {
        Self { engine, tracker }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Runs `prompt` on a background thread while holding `permit`.
    ///
    /// The permit is released by the background thread when the engine
    /// returns, independently of how the caller consumes the stream.
    pub fn start(
        &self,
        permit: GatePermit,
        prompt: String,
        params: GenerationParams,
    ) -> TokenStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Arc::clone(&self.engine);
        let span = tracing::Span::current();

        let handle = self.tracker.spawn_blocking(move || {
            let _permit = permit;
            let _entered = span.enter();

            let mut sink = TokenSink::new(tx);
            if let Err(e) = engine.generate(&prompt, &params, &mut sink) {
                tracing::warn!("Generation failed after {} fragments: {e}", sink.emitted());
                sink.fail(e);
            }
            sink.emitted()
        });

        TokenStream {
            rx,
            handle: Some(handle),
        }
    }
}

/// Consumer end of one generation unit.
///
/// Single pass and finite: ends once the engine returns.
#[derive(Debug)]
pub struct TokenStream {
    rx: mpsc::UnboundedReceiver<Result<String>>,
    handle: Option<JoinHandle<usize>>,
}

impl Stream for TokenStream {
    type Item = Result<String>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(item)) => return Poll::Ready(Some(item)),
            Poll::Ready(None) => {}
            Poll::Pending => return Poll::Pending,
        }

        // Channel closed: the unit has returned or unwound. Join it so a
        // panic is reported rather than read as a clean end of stream.
        let Some(handle) = this.handle.as_mut() else {
            return Poll::Ready(None);
        };

        match Pin::new(handle).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(joined) => {
                this.handle = None;
                match joined {
                    Ok(_) => Poll::Ready(None),
                    Err(e) if e.is_panic() => Poll::Ready(Some(Err(Error::generation(
                        "generation thread panicked",
                    )))),
                    Err(e) => Poll::Ready(Some(Err(Error::generation(e.to_string())))),
                }
            }
        }
    }
}
