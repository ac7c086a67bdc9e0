//! # Generation and Conversation Types
//!
//! Types shared between the session controller, the prompt assembler and
//! engine implementations.
//!
//! ## Overview
//!
//! - [`GenerationParams`] - sampling parameters fixed per session from server
//!   configuration, optionally overridden per turn.
//! - [`ChatTurn`] / [`Role`] - one `{role, content}` entry of a structured
//!   conversation, deserializable from the JSON clients may send as message
//!   text.
//! - [`DEFAULT_SYSTEM_PROMPT`] - instruction injected when a conversation has
//!   no system turn.

use serde::{Deserialize, Serialize};

/// Instruction prepended to every conversation that lacks a system turn.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant.";

/// Sampling parameters for one generation call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    /// Upper bound on generated tokens for a single turn.
    pub max_new_tokens: u32,
    /// Softmax temperature. `0.0` selects greedy decoding.
    pub temperature: f32,
    /// Penalty applied to already generated tokens (`1.0` disables it).
    pub repetition_penalty: f32,
    /// Nucleus sampling mass.
    pub top_p: f32,
    /// Number of candidates kept before nucleus sampling (`0` disables it).
    pub top_k: u32,
}

impl GenerationParams {
    /// Returns a copy with `temperature` replaced when `requested` is positive.
    ///
    /// Clients send `0.0` (the protobuf default) to mean "no preference", so
    /// zero and negative values keep the configured temperature.
    #[must_use]
    pub fn with_temperature_override(mut self, requested: f32) -> Self {
        if requested > 0.0 && requested.is_finite() {
            self.temperature = requested;
        }
        self
    }
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 100,
            temperature: 0.7,
            repetition_penalty: 1.05,
            top_p: 0.7,
            top_k: 40,
        }
    }
}

/// Speaker of a [`ChatTurn`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    /// Any other role a client sends (for example `tool`). Rendered verbatim.
    #[serde(untagged)]
    Other(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Other(role) => role,
        }
    }
}

/// One entry of a structured conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_temperature_overrides() {
        let params = GenerationParams::default().with_temperature_override(1.3);
        assert!((params.temperature - 1.3).abs() < f32::EPSILON);
    }

    #[test]
    fn non_positive_temperature_keeps_default() {
        let base = GenerationParams::default();
        assert_eq!(base.with_temperature_override(0.0), base);
        assert_eq!(base.with_temperature_override(-2.0), base);
        assert_eq!(base.with_temperature_override(f32::NAN), base);
    }

    #[test]
    fn chat_turns_deserialize_known_and_custom_roles() {
        let turns: Vec<ChatTurn> = serde_json::from_str(
            r#"[{"role":"system","content":"be brief"},
                {"role":"user","content":"hi"},
                {"role":"tool","content":"{}"}]"#,
        )
        .unwrap();

        assert!(turns[0].is_system());
        assert_eq!(turns[1].role, Role::User);
        assert_eq!(turns[2].role, Role::Other("tool".into()));
        assert_eq!(turns[2].role.as_str(), "tool");
    }

    #[test]
    fn turn_without_content_is_rejected() {
        let parsed = serde_json::from_str::<Vec<ChatTurn>>(r#"[{"role":"user"}]"#);
        assert!(parsed.is_err());
    }
}
