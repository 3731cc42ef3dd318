//! Rough input-token estimate for `count_tokens`. Not a tokenizer.

use crate::translate::anthropic_types::{ContentBlock, MessagesRequest, ToolResultContent};

const CHARS_PER_TOKEN: usize = 4;

/// Approximate the number of input tokens in a request. Never returns zero.
pub fn estimate_input_tokens(req: &MessagesRequest) -> u64 {
    let mut chars = 0usize;

    if let Some(ref system) = req.system {
        chars += system.as_text().chars().count();
    }

    for message in &req.messages {
        for block in message.content.blocks().iter() {
            chars += match block {
                ContentBlock::Text { text } => text.chars().count(),
                ContentBlock::ToolUse { name, input, .. } => {
                    name.chars().count() + input.to_string().chars().count()
                }
                ContentBlock::ToolResult { content, .. } => match content {
                    Some(ToolResultContent::Text(text)) => text.chars().count(),
                    Some(ToolResultContent::Blocks(blocks)) => blocks
                        .iter()
                        .map(|b| match b {
                            ContentBlock::Text { text } => text.chars().count(),
                            _ => 0,
                        })
                        .sum(),
                    None => 0,
                },
                ContentBlock::Image { .. } => 0,
            };
        }
    }

    for tool in req.tools.iter().flatten() {
        chars += tool.name.chars().count();
        chars += tool.description.as_deref().map_or(0, |d| d.chars().count());
        chars += tool.input_schema.to_string().chars().count();
    }

    ((chars / CHARS_PER_TOKEN) as u64).max(1)
}
