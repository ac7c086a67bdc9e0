//! Turns an accumulated transcript into the prompt string the engine consumes.
//!
//! Clients either send plain text or a JSON array of `{role, content}` turns.
//! Both shapes are normalized to a turn list that starts with a system turn
//! and rendered with generation framing appended. Assembly never fails: an
//! unparsable transcript is treated as one user utterance, and a template
//! the engine cannot render falls back to ChatML.

use crate::server::engine::{TextGenerationEngine, chatml};
use inferd_core::types::{ChatTurn, DEFAULT_SYSTEM_PROMPT};

#[derive(Debug, Clone)]
pub struct PromptAssembler {
    system_prompt: String,
}

impl Default for PromptAssembler {
    fn default() -> Self {
        Self::new(DEFAULT_SYSTEM_PROMPT)
    }
}

impl PromptAssembler {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
        }
    }

    /// Normalizes `raw` into turns, injecting the system turn when missing.
    pub fn turns(&self, raw: &str) -> Vec<ChatTurn> {
        match serde_json::from_str::<Vec<ChatTurn>>(raw) {
            Ok(mut turns) => {
                if !turns.iter().any(ChatTurn::is_system) {
                    turns.insert(0, ChatTurn::system(self.system_prompt.as_str()));
                }
                turns
            }
            Err(_) => vec![
                ChatTurn::system(self.system_prompt.as_str()),
                ChatTurn::user(raw),
            ],
        }
    }

    /// Builds the prompt for `raw` using the engine's chat template.
    pub fn assemble<E: TextGenerationEngine + ?Sized>(&self, engine: &E, raw: &str) -> String {
        let turns = self.turns(raw);

        match engine.apply_chat_template(&turns, true) {
            Ok(prompt) if !prompt.is_empty() => prompt,
            Ok(_) => {
                tracing::warn!("Chat template rendered an empty prompt, using ChatML");
                chatml::render(&turns, true)
            }
            Err(e) => {
                tracing::warn!("{e}, using ChatML");
                chatml::render(&turns, true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::engine::{TokenSink, scripted::ScriptedEngine};
    use inferd_core::{
        Error, Result,
        types::{GenerationParams, Role},
    };

    #[test]
    fn raw_text_is_wrapped_as_user_turn() {
        let turns = PromptAssembler::default().turns("Hello");
        assert_eq!(
            turns,
            vec![ChatTurn::system(DEFAULT_SYSTEM_PROMPT), ChatTurn::user("Hello")]
        );
    }

    #[test]
    fn structured_turns_get_exactly_one_leading_system_turn() {
        let raw = r#"[{"role":"user","content":"a"},{"role":"assistant","content":"b"}]"#;
        let turns = PromptAssembler::default().turns(raw);

        assert_eq!(turns.iter().filter(|t| t.is_system()).count(), 1);
        assert_eq!(turns[0], ChatTurn::system(DEFAULT_SYSTEM_PROMPT));
        assert_eq!(turns[2].role, Role::Assistant);
    }

    #[test]
    fn existing_system_turn_is_kept_in_place() {
        let raw = r#"[{"role":"user","content":"a"},{"role":"system","content":"terse"}]"#;
        let turns = PromptAssembler::default().turns(raw);

        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1], ChatTurn::system("terse"));
    }

    #[test]
    fn non_list_json_is_raw_text() {
        let raw = r#"{"role":"user","content":"a"}"#;
        let turns = PromptAssembler::default().turns(raw);
        assert_eq!(turns[1], ChatTurn::user(raw));
    }

    #[test]
    fn concatenated_fragments_fall_back_to_raw_text() {
        let raw = r#"[{"role":"user","content":"a"}][{"role":"user","content":"b"}]"#;
        let turns = PromptAssembler::default().turns(raw);
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].content, raw);
    }

    #[test]
    fn assembles_with_default_template() {
        let prompt = PromptAssembler::default().assemble(&ScriptedEngine::default(), "Hi");
        assert!(prompt.starts_with("<|im_start|>system\nYou are a helpful AI assistant.<|im_end|>\n"));
        assert!(prompt.ends_with("<|im_start|>user\nHi<|im_end|>\n<|im_start|>assistant\n"));
    }

    struct BrokenTemplate;

    impl crate::server::engine::TextGenerationEngine for BrokenTemplate {
        fn generate(&self, _: &str, _: &GenerationParams, _: &mut TokenSink) -> Result<()> {
            Ok(())
        }

        fn apply_chat_template(&self, _: &[ChatTurn], _: bool) -> Result<String> {
            Err(Error::assembly("unsupported role"))
        }
    }

    #[test]
    fn template_failure_falls_back_to_chatml() {
        let prompt = PromptAssembler::default().assemble(&BrokenTemplate, "Hi");
        assert!(!prompt.is_empty());
        assert!(prompt.ends_with("<|im_start|>assistant\n"));
    }
}
