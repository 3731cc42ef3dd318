//! Translate Anthropic Messages API requests into `OpenAI` Chat Completions requests.
//!
//! A single Anthropic message can expand into several `OpenAI` messages: `tool_result`
//! blocks become `tool`-role messages of their own, placed ahead of the rest of the
//! message because the backend wants them right after the assistant's tool calls.

use super::anthropic_types::{
    ContentBlock, ImageSource, Message, MessagesRequest, Role, ToolChoice, ToolResultContent,
};
use super::openai_types::{
    ChatCompletionRequest, ChatContent, ChatFunction, ChatFunctionName, ChatMessage,
    ChatNamedToolChoice, ChatRole, ChatTool, ChatToolCall, ChatToolCallFunction, ChatToolChoice,
    ContentPart, ImageUrl, StreamOptions,
};
use crate::config::TokenLimits;
use crate::error::{GatewayError, Result};
use crate::tiers::RoutedModel;

/// Settings that shape every translated request.
#[derive(Debug, Clone, Copy)]
pub struct TranslateOptions {
    pub limits: TokenLimits,
    /// Whether the backend accepts `image_url` parts. When false, images become text markers.
    pub multimodal: bool,
}

impl Default for TranslateOptions {
    fn default() -> Self {
        Self {
            limits: TokenLimits::default(),
            multimodal: true,
        }
    }
}

/// Fields the gateway owns; tier extras may not set them.
const RESERVED_FIELDS: &[&str] = &["model", "messages", "stream", "stream_options"];

/// Translate an Anthropic request into an `OpenAI` request for the routed backend model.
pub fn anthropic_to_openai(
    req: &MessagesRequest,
    routed: &RoutedModel,
    opts: &TranslateOptions,
) -> Result<ChatCompletionRequest> {
    if req.model.trim().is_empty() {
        return Err(GatewayError::invalid_request("model is required"));
    }
    if req.messages.is_empty() {
        return Err(GatewayError::invalid_request(
            "messages must contain at least one message",
        ));
    }

    let mut messages = Vec::with_capacity(req.messages.len() + 1);

    if let Some(ref system) = req.system {
        let text = system.as_text();
        if !text.trim().is_empty() {
            messages.push(ChatMessage::text(ChatRole::System, text));
        }
    }

    for (i, msg) in req.messages.iter().enumerate() {
        let translated = translate_message(msg, opts.multimodal).map_err(|e| match e {
            GatewayError::InvalidRequest { message } => {
                GatewayError::invalid_request(format!("messages[{i}]: {message}"))
            }
            other => other,
        })?;
        messages.extend(translated);
    }

    let tools: Option<Vec<ChatTool>> = req
        .tools
        .as_ref()
        .filter(|tools| !tools.is_empty())
        .map(|tools| {
            tools
                .iter()
                .map(|t| ChatTool {
                    tool_type: "function".to_string(),
                    function: ChatFunction {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        parameters: t.input_schema.clone(),
                    },
                })
                .collect()
        });

    // A tool choice only means something when there are tools to choose from.
    let tool_choice = req.tool_choice.as_ref().filter(|_| tools.is_some());

    let max_tokens = opts
        .limits
        .clamp(req.max_tokens.unwrap_or(opts.limits.max));

    let mut translated = ChatCompletionRequest {
        model: routed.model.clone(),
        messages,
        max_tokens: Some(max_tokens),
        temperature: req.temperature,
        top_p: req.top_p,
        stream: req.stream,
        stream_options: req.stream.then_some(StreamOptions {
            include_usage: true,
        }),
        stop: req.stop_sequences.clone().filter(|s| !s.is_empty()),
        tool_choice: tool_choice.map(translate_tool_choice),
        parallel_tool_calls: tool_choice
            .filter(|tc| tc.disables_parallel_calls())
            .map(|_| false),
        tools,
        user: req.metadata.as_ref().and_then(|m| m.user_id.clone()),
        extra: serde_json::Map::new(),
    };

    // Tier defaults only fill fields the translation left unset, and never transport fields.
    if !routed.extra.is_empty() {
        let present = serde_json::to_value(&translated)?;
        for (key, value) in &routed.extra {
            if RESERVED_FIELDS.contains(&key.as_str()) {
                tracing::warn!(field = %key, tier = %routed.tier, "Ignoring reserved field in tier extras");
                continue;
            }
            if present.get(key).is_none() {
                translated.extra.insert(key.clone(), value.clone());
            }
        }
    }

    Ok(translated)
}

fn translate_message(msg: &Message, multimodal: bool) -> Result<Vec<ChatMessage>> {
    let blocks = msg.content.blocks();

    let mut out: Vec<ChatMessage> = Vec::new();
    let mut parts: Vec<ContentPart> = Vec::new();
    let mut tool_calls: Vec<ChatToolCall> = Vec::new();

    for block in blocks.iter() {
        match block {
            ContentBlock::Text { text } => parts.push(ContentPart::Text { text: text.clone() }),
            ContentBlock::Image { source } => {
                if multimodal && msg.role == Role::User {
                    parts.push(ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: image_url(source),
                        },
                    });
                } else {
                    parts.push(ContentPart::Text {
                        text: image_placeholder(source),
                    });
                }
            }
            ContentBlock::ToolUse { id, name, input } => {
                if msg.role != Role::Assistant {
                    return Err(GatewayError::invalid_request(
                        "tool_use blocks are only allowed in assistant messages",
                    ));
                }
                tool_calls.push(ChatToolCall {
                    id: id.clone(),
                    call_type: "function".to_string(),
                    function: ChatToolCallFunction {
                        name: name.clone(),
                        arguments: serde_json::to_string(input)?,
                    },
                });
            }
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let text = tool_result_text(content.as_ref(), *is_error)?;
                out.push(ChatMessage::tool_result(tool_use_id.clone(), text));
            }
        }
    }

    let content = collapse_parts(parts);

    match msg.role {
        Role::User => {
            if content.is_some() || out.is_empty() {
                out.push(ChatMessage {
                    role: ChatRole::User,
                    content: Some(content.unwrap_or_else(|| ChatContent::Text(String::new()))),
                    tool_calls: None,
                    tool_call_id: None,
                });
            }
        }
        Role::Assistant => {
            if content.is_some() || !tool_calls.is_empty() || out.is_empty() {
                let content = match (content, tool_calls.is_empty()) {
                    (Some(c), _) => Some(c),
                    (None, true) => Some(ChatContent::Text(String::new())),
                    (None, false) => None,
                };
                out.push(ChatMessage {
                    role: ChatRole::Assistant,
                    content,
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                    tool_call_id: None,
                });
            }
        }
    }

    Ok(out)
}

/// Text-only part lists collapse to one string; anything with an image stays a part list.
fn collapse_parts(parts: Vec<ContentPart>) -> Option<ChatContent> {
    if parts.is_empty() {
        return None;
    }

    let all_text = parts
        .iter()
        .all(|p| matches!(p, ContentPart::Text { .. }));
    if !all_text {
        return Some(ChatContent::Parts(parts));
    }

    let text = parts
        .into_iter()
        .filter_map(|p| match p {
            ContentPart::Text { text } => Some(text),
            ContentPart::ImageUrl { .. } => None,
        })
        .collect::<Vec<_>>()
        .join("\n");
    Some(ChatContent::Text(text))
}

fn tool_result_text(content: Option<&ToolResultContent>, is_error: Option<bool>) -> Result<String> {
    let body = match content {
        None => String::new(),
        Some(ToolResultContent::Text(t)) => t.clone(),
        Some(ToolResultContent::Blocks(blocks)) => {
            let mut pieces = Vec::with_capacity(blocks.len());
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => pieces.push(text.clone()),
                    ContentBlock::Image { source } => pieces.push(image_placeholder(source)),
                    ContentBlock::ToolUse { .. } | ContentBlock::ToolResult { .. } => {
                        return Err(GatewayError::invalid_request(
                            "tool_result content may only contain text and image blocks",
                        ));
                    }
                }
            }
            pieces.join("\n")
        }
    };

    if is_error == Some(true) {
        Ok(format!("Error: {body}"))
    } else {
        Ok(body)
    }
}

fn image_url(source: &ImageSource) -> String {
    match source {
        ImageSource::Base64 { media_type, data } => format!("data:{media_type};base64,{data}"),
        ImageSource::Url { url } => url.clone(),
    }
}

fn image_placeholder(source: &ImageSource) -> String {
    match source {
        ImageSource::Base64 { media_type, .. } => format!("[image omitted: {media_type}]"),
        ImageSource::Url { url } => format!("[image omitted: {url}]"),
    }
}

fn translate_tool_choice(tc: &ToolChoice) -> ChatToolChoice {
    match tc {
        ToolChoice::Auto { .. } => ChatToolChoice::Mode("auto".to_string()),
        ToolChoice::Any { .. } => ChatToolChoice::Mode("required".to_string()),
        ToolChoice::None => ChatToolChoice::Mode("none".to_string()),
        ToolChoice::Tool { name, .. } => ChatToolChoice::Function(ChatNamedToolChoice {
            choice_type: "function".to_string(),
            function: ChatFunctionName { name: name.clone() },
        }),
    }
}
