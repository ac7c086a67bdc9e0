//! ChatML rendering, the template family of the Qwen models the server ships
//! with by default.

use inferd_core::types::ChatTurn;

const TURN_START: &str = "<|im_start|>";
const TURN_END: &str = "<|im_end|>";

/// Renders `turns` as ChatML, optionally followed by the assistant framing.
pub fn render(turns: &[ChatTurn], add_generation_prompt: bool) -> String {
    let mut prompt = String::with_capacity(
        turns
            .iter()
            .map(|turn| turn.content.len() + turn.role.as_str().len() + 24)
            .sum::<usize>()
            + 32,
    );

    for turn in turns {
        prompt.push_str(TURN_START);
        prompt.push_str(turn.role.as_str());
        prompt.push('\n');
        prompt.push_str(&turn.content);
        prompt.push_str(TURN_END);
        prompt.push('\n');
    }

    if add_generation_prompt {
        prompt.push_str(TURN_START);
        prompt.push_str("assistant\n");
    }

    prompt
}
