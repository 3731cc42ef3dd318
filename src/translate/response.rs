use super::anthropic_types::{MessagesResponse, ResponseContentBlock, Role, StopReason, Usage};
use super::openai_types::{ChatCompletionResponse, ChatUsage};
use crate::error::{GatewayError, Result};

/// Translate an `OpenAI` chat completion into an Anthropic Messages response.
/// `original_model` is the model id the caller asked for, echoed back unchanged.
pub fn openai_to_anthropic(
    resp: &ChatCompletionResponse,
    original_model: &str,
) -> Result<MessagesResponse> {
    let choice = resp
        .choices
        .as_ref()
        .and_then(|choices| choices.first())
        .ok_or_else(|| GatewayError::malformed("response has no choices"))?;

    let mut content: Vec<ResponseContentBlock> = Vec::new();

    if let Some(text) = choice.message.content.as_deref().filter(|t| !t.is_empty()) {
        content.push(ResponseContentBlock::Text {
            text: text.to_string(),
        });
    }

    for call in choice.message.tool_calls.iter().flatten() {
        let (input, raw) = parse_arguments(&call.function.arguments);
        content.push(ResponseContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.function.name.clone(),
            input,
        });
        if let Some(raw) = raw {
            tracing::warn!(tool_call_id = %call.id, "Tool call arguments are not valid JSON");
            content.push(ResponseContentBlock::Text { text: raw });
        }
    }

    // Callers expect at least one content block.
    if content.is_empty() {
        content.push(ResponseContentBlock::Text {
            text: String::new(),
        });
    }

    let (stop_reason, stop_reason_detail) = choice
        .finish_reason
        .as_deref()
        .map_or((StopReason::EndTurn, None), map_finish_reason);

    let id = if resp.id.is_empty() {
        new_message_id()
    } else {
        format!("msg_{}", resp.id.trim_start_matches("chatcmpl-"))
    };

    Ok(MessagesResponse {
        id,
        response_type: "message".to_string(),
        role: Role::Assistant,
        content,
        model: original_model.to_string(),
        stop_reason: Some(stop_reason),
        stop_sequence: None,
        stop_reason_detail,
        usage: resp.usage.as_ref().map(usage_from).unwrap_or_default(),
    })
}

/// Map an `OpenAI` `finish_reason` onto an Anthropic `stop_reason`.
/// Reasons without a table entry become `end_turn`, with the original returned alongside.
pub fn map_finish_reason(reason: &str) -> (StopReason, Option<String>) {
    match reason {
        "stop" => (StopReason::EndTurn, None),
        "length" => (StopReason::MaxTokens, None),
        "tool_calls" | "function_call" => (StopReason::ToolUse, None),
        other => (StopReason::EndTurn, Some(other.to_string())),
    }
}

pub fn usage_from(usage: &ChatUsage) -> Usage {
    Usage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
        cache_read_input_tokens: usage.cached_tokens(),
    }
}

/// Parse concatenated tool arguments. Returns the parsed input and, when the text was
/// not a JSON object, the raw text so it can be surfaced instead of lost.
pub fn parse_arguments(raw: &str) -> (serde_json::Value, Option<String>) {
    if raw.trim().is_empty() {
        return (serde_json::json!({}), None);
    }
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value @ serde_json::Value::Object(_)) => (value, None),
        _ => (serde_json::json!({}), Some(raw.to_string())),
    }
}

pub fn new_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}
