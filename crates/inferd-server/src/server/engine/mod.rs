//! Text-generation engine seam.
//!
//! The server never tokenizes, samples or templates on its own. It talks to a
//! [`TextGenerationEngine`], a blocking producer that pushes decoded text
//! fragments into a [`TokenSink`] and renders chat transcripts into prompt
//! strings.
//!
//! ## Implementations
//!
//! - [`llama::LlamaEngine`] (feature `llama`) - GGUF models through
//!   `llama-cpp-2`.
//! - [`scripted::ScriptedEngine`] - deterministic in-process engine used by the
//!   test suite.

pub mod chatml;
#[cfg(feature = "llama")]
pub mod llama;
pub mod scripted;

use inferd_core::{
    Error, Result,
    types::{ChatTurn, GenerationParams},
};
use tokio::sync::mpsc;

/// A blocking text generator bound to one model and accelerator context.
///
/// `generate` is always invoked from a blocking thread and never concurrently
/// with itself; callers serialize access through the accelerator gate.
pub trait TextGenerationEngine: Send + Sync + 'static {
    /// Generates a completion for `prompt`, emitting decoded fragments into
    /// `sink` in production order.
    ///
    /// Returning `Err` after some fragments were emitted is allowed; those
    /// fragments stay delivered.
    fn generate(&self, prompt: &str, params: &GenerationParams, sink: &mut TokenSink)
    -> Result<()>;

    /// Renders a transcript into the prompt format the model was trained on.
    ///
    /// With `add_generation_prompt` the rendering ends with the framing that
    /// cues an assistant reply. The default is ChatML.
    fn apply_chat_template(
        &self,
        turns: &[ChatTurn],
        add_generation_prompt: bool,
    ) -> Result<String> {
        Ok(chatml::render(turns, add_generation_prompt))
    }

    /// Short human readable description for start-up logs.
    fn describe(&self) -> String {
        "text-generation engine".to_string()
    }
}

/// Producer end of a token hand-off.
///
/// Wraps an unbounded channel so `emit` never blocks the generation thread.
#[derive(Debug)]
pub struct TokenSink {
    tx: mpsc::UnboundedSender<Result<String>>,
    emitted: usize,
}

impl TokenSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Result<String>>) -> Self {
        Self { tx, emitted: 0 }
    }

    /// Hands a decoded fragment to the consumer.
    ///
    /// Returns `false` once the consumer has gone away. Engines may use this
    /// to stop early; continuing is harmless, the output is discarded.
    pub fn emit(&mut self, fragment: impl Into<String>) -> bool {
        let fragment = fragment.into();
        if fragment.is_empty() {
            return !self.tx.is_closed();
        }
        self.emitted += 1;
        self.tx.send(Ok(fragment)).is_ok()
    }

    /// Number of non-empty fragments emitted so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Pushes a terminal error behind any emitted fragments.
    pub(crate) fn fail(&self, err: Error) {
        let _ = self.tx.send(Err(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl TextGenerationEngine for Echo {
        fn generate(
            &self,
            prompt: &str,
            _params: &GenerationParams,
            sink: &mut TokenSink,
        ) -> Result<()> {
            sink.emit(prompt);
            Ok(())
        }
    }

    #[test]
    fn default_template_is_chatml() {
        let turns = [ChatTurn::system("sys"), ChatTurn::user("hi")];
        let prompt = Echo.apply_chat_template(&turns, true).unwrap();
        assert_eq!(
            prompt,
            "<|im_start|>system\nsys<|im_end|>\n<|im_start|>user\nhi<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn sink_skips_empty_fragments_and_reports_detach() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = TokenSink::new(tx);

        assert!(sink.emit(""));
        assert!(sink.emit("a"));
        assert_eq!(sink.emitted(), 1);
        assert_eq!(rx.try_recv().unwrap(), Ok("a".to_string()));
        assert!(rx.try_recv().is_err());

        drop(rx);
        assert!(!sink.emit("b"));
        assert!(!sink.emit(""));
    }
}
