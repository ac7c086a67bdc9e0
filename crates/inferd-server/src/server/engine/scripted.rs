//! A deterministic engine that replays a fixed token script.
//!
//! Used by unit and end-to-end tests to exercise the session controller, the
//! accelerator gate and the drain logic without loading a model. It records
//! every prompt it receives and the wall-clock window of each `generate`
//! call so tests can assert on transcript accumulation and gate exclusivity.

use super::{TextGenerationEngine, TokenSink};
use core::time::Duration;
use inferd_core::{Error, Result, types::GenerationParams};
use parking_lot::Mutex;
use std::{
    sync::atomic::{AtomicUsize, Ordering},
    time::Instant,
};

/// Scripted [`TextGenerationEngine`].
#[derive(Debug, Default)]
pub struct ScriptedEngine {
    tokens: Vec<String>,
    delay: Duration,
    fail_after: Option<(usize, String)>,
    prompts: Mutex<Vec<String>>,
    params: Mutex<Vec<GenerationParams>>,
    windows: Mutex<Vec<(Instant, Instant)>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedEngine {
    /// An engine that emits `tokens` for every call.
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Sleeps `delay` before each emitted token.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fails with `message` once `count` tokens have been emitted.
    #[must_use]
    pub fn failing_after(mut self, count: usize, message: impl Into<String>) -> Self {
        self.fail_after = Some((count, message.into()));
        self
    }

    /// Prompts received so far, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    /// Parameters received so far, in call order.
    pub fn params(&self) -> Vec<GenerationParams> {
        self.params.lock().clone()
    }

    /// Number of `generate` calls that have started.
    pub fn calls(&self) -> usize {
        self.prompts.lock().len()
    }

    /// Highest number of `generate` calls observed running at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Start/end instants of every completed `generate` call.
    pub fn windows(&self) -> Vec<(Instant, Instant)> {
        self.windows.lock().clone()
    }

    /// Whether any two completed calls overlapped in time.
    pub fn any_overlap(&self) -> bool {
        let mut windows = self.windows();
        windows.sort_by_key(|(start, _)| *start);
        windows.windows(2).any(|pair| pair[1].0 < pair[0].1)
    }
}

impl TextGenerationEngine for ScriptedEngine {
    fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        sink: &mut TokenSink,
    ) -> Result<()> {
        let started = Instant::now();
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        self.prompts.lock().push(prompt.to_string());
        self.params.lock().push(*params);

        let result = self.replay(sink);

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.windows.lock().push((started, Instant::now()));
        result
    }

    fn describe(&self) -> String {
        format!("scripted engine ({} tokens)", self.tokens.len())
    }
}

impl ScriptedEngine {
    fn replay(&self, sink: &mut TokenSink) -> Result<()> {
        for (emitted, token) in self.tokens.iter().enumerate() {
            match &self.fail_after {
                Some((count, message)) if emitted == *count => {
                    return Err(Error::generation(message.clone()));
                }
                _ => {}
            }
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            sink.emit(token.as_str());
        }

        match &self.fail_after {
            Some((count, message)) if *count >= self.tokens.len() => {
                Err(Error::generation(message.clone()))
            }
            _ => Ok(()),
        }
    }
}
