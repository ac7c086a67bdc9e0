//! GGUF models through `llama-cpp-2`.
//!
//! The backend and model are loaded once at start-up and shared for the
//! process lifetime. A fresh [`LlamaContext`] (KV cache) is created per
//! `generate` call on the calling blocking thread, so no context ever crosses
//! threads.

use super::{TextGenerationEngine, TokenSink, chatml};
use core::num::NonZeroU32;
use inferd_core::{
    Error, Result,
    types::{ChatTurn, GenerationParams},
};
use llama_cpp_2::{
    context::{LlamaContext, params::LlamaContextParams},
    llama_backend::LlamaBackend,
    llama_batch::LlamaBatch,
    model::{AddBos, LlamaChatMessage, LlamaChatTemplate, LlamaModel, Special, params::LlamaModelParams},
    sampling::LlamaSampler,
};
use std::path::PathBuf;

/// Tokens considered by the repetition penalty.
const PENALTY_LAST_N: i32 = 64;

/// Control tokens (`<think>`, `<|im_end|>`, ...) are not client text.
const DETOKENIZE: Special = Special::Plaintext;

/// Load options for [`LlamaEngine`].
#[derive(Debug, Clone)]
pub struct LlamaEngineConfig {
    pub model_path: PathBuf,
    pub gpu_layers: u32,
    pub context_size: NonZeroU32,
}

/// [`TextGenerationEngine`] backed by llama.cpp.
pub struct LlamaEngine {
    backend: LlamaBackend,
    model: LlamaModel,
    template: Option<LlamaChatTemplate>,
    config: LlamaEngineConfig,
}

impl LlamaEngine {
    /// Initializes the llama.cpp backend and loads the model file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EngineLoad`] when the backend cannot start or the
    /// model cannot be read.
    pub fn load(config: LlamaEngineConfig) -> Result<Self> {
        let backend = LlamaBackend::init().map_err(|e| Error::EngineLoad {
            reason: format!("backend init: {e}"),
        })?;

        let params = LlamaModelParams::default().with_n_gpu_layers(config.gpu_layers);
        let model = LlamaModel::load_from_file(&backend, &config.model_path, &params).map_err(
            |e| Error::EngineLoad {
                reason: format!("{}: {e}", config.model_path.display()),
            },
        )?;

        let template = match model.chat_template(None) {
            Ok(template) => Some(template),
            Err(e) => {
                tracing::warn!("Model has no usable chat template ({e}); using ChatML");
                None
            }
        };

        Ok(Self {
            backend,
            model,
            template,
            config,
        })
    }

    fn sampler(params: &GenerationParams) -> LlamaSampler {
        let penalties = LlamaSampler::penalties(PENALTY_LAST_N, params.repetition_penalty, 0.0, 0.0);

        if params.temperature <= f32::EPSILON {
            return LlamaSampler::chain_simple([penalties, LlamaSampler::greedy()]);
        }

        LlamaSampler::chain_simple([
            penalties,
            LlamaSampler::top_k(params.top_k as i32),
            LlamaSampler::top_p(params.top_p, 1),
            LlamaSampler::temp(params.temperature),
            LlamaSampler::dist(seed()),
        ])
    }

    fn run(
        &self,
        ctx: &mut LlamaContext<'_>,
        prompt: &str,
        params: &GenerationParams,
        sink: &mut TokenSink,
    ) -> Result<()> {
        let tokens = self
            .model
            .str_to_token(prompt, AddBos::Always)
            .map_err(|e| Error::generation(format!("tokenize: {e}")))?;

        let n_ctx = self.config.context_size.get() as usize;
        if tokens.len() >= n_ctx {
            return Err(Error::generation(format!(
                "prompt of {} tokens exceeds the {n_ctx} token context window",
                tokens.len()
            )));
        }

        let mut batch = LlamaBatch::new(n_ctx, 1);
        let last = tokens.len() - 1;
        for (i, token) in tokens.iter().enumerate() {
            batch
                .add(*token, i as i32, &[0], i == last)
                .map_err(|e| Error::generation(format!("batch: {e}")))?;
        }
        ctx.decode(&mut batch)
            .map_err(|e| Error::generation(format!("decode prompt: {e}")))?;

        let mut sampler = Self::sampler(params);
        let mut position = tokens.len() as i32;
        let mut pending = Utf8Buffer::default();

        for _ in 0..params.max_new_tokens {
            if position as usize >= n_ctx {
                tracing::debug!("Context window full after {position} tokens");
                break;
            }

            let token = sampler.sample(ctx, batch.n_tokens() - 1);
            if self.model.is_eog_token(token) {
                break;
            }

            let bytes = self
                .model
                .token_to_bytes(token, DETOKENIZE)
                .map_err(|e| Error::generation(format!("detokenize: {e}")))?;

            if let Some(text) = pending.push(&bytes) {
                if !sink.emit(text) {
                    tracing::debug!("Consumer detached, stopping generation early");
                    return Ok(());
                }
            }

            batch.clear();
            batch
                .add(token, position, &[0], true)
                .map_err(|e| Error::generation(format!("batch: {e}")))?;
            ctx.decode(&mut batch)
                .map_err(|e| Error::generation(format!("decode: {e}")))?;
            position += 1;
        }

        if let Some(rest) = pending.finish() {
            sink.emit(rest);
        }
        Ok(())
    }
}

impl TextGenerationEngine for LlamaEngine {
    fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        sink: &mut TokenSink,
    ) -> Result<()> {
        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(self.config.context_size))
            .with_n_batch(self.config.context_size.get());

        let mut ctx = self
            .model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| Error::generation(format!("context: {e}")))?;

        self.run(&mut ctx, prompt, params, sink)
    }

    fn apply_chat_template(
        &self,
        turns: &[ChatTurn],
        add_generation_prompt: bool,
    ) -> Result<String> {
        let Some(template) = &self.template else {
            return Ok(chatml::render(turns, add_generation_prompt));
        };

        let messages = turns
            .iter()
            .map(|turn| LlamaChatMessage::new(turn.role.as_str().to_string(), turn.content.clone()))
            .collect::<core::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::assembly(e.to_string()))?;

        self.model
            .apply_chat_template(template, &messages, add_generation_prompt)
            .map_err(|e| Error::assembly(e.to_string()))
    }

    fn describe(&self) -> String {
        format!(
            "llama.cpp {} ({} params, {} ctx, {} gpu layers)",
            self.config.model_path.display(),
            self.model.n_params(),
            self.config.context_size,
            self.config.gpu_layers,
        )
    }
}

/// Accumulates detokenized bytes until they form valid UTF-8.
///
/// Multi-byte characters are often split across tokens.
#[derive(Default)]
struct Utf8Buffer {
    bytes: Vec<u8>,
}

impl Utf8Buffer {
    fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.bytes.extend_from_slice(bytes);

        let valid = match core::str::from_utf8(&self.bytes) {
            Ok(_) => self.bytes.len(),
            // Invalid sequence, not just a truncated one.
            Err(e) if e.error_len().is_some() => return self.finish(),
            Err(e) => e.valid_up_to(),
        };

        if valid == 0 {
            return None;
        }
        let rest = self.bytes.split_off(valid);
        let text = String::from_utf8(core::mem::replace(&mut self.bytes, rest)).ok()?;
        Some(text)
    }

    fn finish(&mut self) -> Option<String> {
        if self.bytes.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.bytes).into_owned();
        self.bytes.clear();
        Some(text)
    }
}

fn seed() -> u32 {
    use std::hash::{BuildHasher, Hasher};
    std::collections::hash_map::RandomState::new()
        .build_hasher()
        .finish() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn special_tokens_are_not_rendered() {
        assert!(matches!(DETOKENIZE, Special::Plaintext));
    }

    #[test]
    fn utf8_buffer_holds_split_characters() {
        let mut buffer = Utf8Buffer::default();
        let snowman = "☃".as_bytes();

        assert_eq!(buffer.push(&snowman[..1]), None);
        assert_eq!(buffer.push(&snowman[1..]), Some("☃".to_string()));
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn utf8_buffer_emits_valid_prefix() {
        let mut buffer = Utf8Buffer::default();
        let mut bytes = b"ab".to_vec();
        bytes.push("é".as_bytes()[0]);

        assert_eq!(buffer.push(&bytes), Some("ab".to_string()));
        assert_eq!(buffer.push(&"é".as_bytes()[1..]), Some("é".to_string()));
    }
}
