//! State machine for translating `OpenAI` streaming chunks into Anthropic SSE events.
//!
//! The [`StreamTranslator`] is pure and synchronous: it takes one upstream chunk at a time
//! and returns the Anthropic events that chunk triggers, in order. The async side (reading
//! the backend, heartbeats, cancellation) lives in [`crate::proxy`].
//!
//! Lifecycle of one stream:
//!
//! ```text
//! Idle -> MessageOpen -> (block open -> delta* -> block stop)* -> Stopping -> Done
//!   \__________\_____________________________________________\____-> Cancelled
//! ```
//!
//! Only one content block is open at a time and indices are handed out sequentially
//! from zero, so every `content_block_start` has exactly one matching `content_block_stop`.
//! Parallel tool calls are streamed one at a time: the first call's fragments go out live,
//! the others collect in their buffers and are emitted whole once the live block closes.

use std::collections::HashMap;

use super::anthropic_types::{
    Delta, MessageDeltaBody, MessagesResponse, ResponseContentBlock, Role, StopReason,
    StreamEvent, Usage,
};
use super::errors::{ClassifiedError, ErrorKind};
use super::openai_types::{ChatCompletionChunk, ChatUsage, ChunkToolCall};
use super::response::{map_finish_reason, new_message_id, parse_arguments, usage_from};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Nothing received yet.
    Idle,
    /// `message_start` sent; content blocks may open and close.
    MessageOpen,
    /// A finish reason arrived. Waiting for a trailing usage chunk before `message_delta`.
    Stopping,
    /// `message_stop` (or a terminal error) sent.
    Done,
    Cancelled,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Done | StreamState::Cancelled)
    }
}

/// Arguments of one streamed tool call, concatenated in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallBuffer {
    pub id: String,
    pub name: String,
    pub arguments: String,
    /// Set once the call's `content_block_start` has gone out.
    pub block_index: Option<usize>,
    pub closed: bool,
    /// Arguments arrived after the block closed; they are re-sent whole as text at the end.
    late: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text { index: usize },
    /// The call being streamed live. Its block starts with the first argument fragment.
    Tool { call: usize },
}

#[derive(Debug)]
pub struct StreamTranslator {
    model: String,
    msg_id: String,
    state: StreamState,
    next_index: usize,
    open: Option<OpenBlock>,
    calls: Vec<ToolCallBuffer>,
    /// Upstream tool-call slot (`index`) to call id; only a call's first fragment has the id.
    slots: HashMap<u32, String>,
    usage: Usage,
    stop: Option<(StopReason, Option<String>)>,
}

impl StreamTranslator {
    /// `model` is the model id the caller asked for.
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            msg_id: new_message_id(),
            state: StreamState::Idle,
            next_index: 0,
            open: None,
            calls: Vec::new(),
            slots: HashMap::new(),
            usage: Usage::default(),
            stop: None,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn message_id(&self) -> &str {
        &self.msg_id
    }

    pub fn usage(&self) -> Usage {
        self.usage
    }

    pub fn tool_calls(&self) -> &[ToolCallBuffer] {
        &self.calls
    }

    /// Process one upstream chunk, returning zero or more Anthropic events.
    pub fn process_chunk(&mut self, chunk: &ChatCompletionChunk) -> Vec<StreamEvent> {
        if self.state.is_terminal() {
            return Vec::new();
        }

        let mut events = Vec::new();

        if let Some(ref usage) = chunk.usage {
            self.absorb_usage(usage);
        }

        if self.state == StreamState::Idle {
            events.push(self.message_start());
            self.state = StreamState::MessageOpen;
        }

        if self.state == StreamState::Stopping {
            // After the finish reason only a usage report is expected.
            if chunk.usage.is_some() {
                self.complete(&mut events);
            }
            return events;
        }

        let Some(choice) = chunk.choices.first() else {
            return events;
        };

        if let Some(text) = choice.delta.content.as_deref().filter(|t| !t.is_empty()) {
            self.push_text(text, &mut events);
        }

        for fragment in choice.delta.tool_calls.iter().flatten() {
            self.push_tool_fragment(fragment, &mut events);
        }

        if let Some(ref reason) = choice.finish_reason {
            self.settle_tool_calls(&mut events);
            self.stop = Some(map_finish_reason(reason));
            self.state = StreamState::Stopping;
            if chunk.usage.is_some() {
                self.complete(&mut events);
            }
        }

        events
    }

    /// Call when the upstream stream ends (`[DONE]` or EOF) to flush what is left.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        match self.state {
            StreamState::Done | StreamState::Cancelled => return events,
            StreamState::Idle => {
                events.push(self.message_start());
            }
            StreamState::MessageOpen | StreamState::Stopping => {}
        }
        self.complete(&mut events);
        events
    }

    /// The caller went away. Closes what is open and emits one terminal event.
    /// Calling it again is a no-op.
    pub fn cancel(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.state.is_terminal() {
            return events;
        }
        self.close_open_block(&mut events);
        events.push(ClassifiedError::new(ErrorKind::ClientDisconnected, None).to_event());
        self.state = StreamState::Cancelled;
        events
    }

    /// The upstream failed mid-stream. Closes what is open and emits the error event.
    pub fn fail(&mut self, error: &ClassifiedError) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.state.is_terminal() {
            return events;
        }
        self.close_open_block(&mut events);
        events.push(error.to_event());
        self.state = StreamState::Done;
        events
    }

    /// A keep-alive event, unless the stream is already over. Never touches block state.
    pub fn heartbeat(&self) -> Option<StreamEvent> {
        (!self.state.is_terminal()).then_some(StreamEvent::Ping)
    }

    fn push_text(&mut self, text: &str, events: &mut Vec<StreamEvent>) {
        let index = match self.open {
            Some(OpenBlock::Text { index }) => index,
            _ => {
                self.settle_tool_calls(events);
                self.open_text_block(events)
            }
        };
        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::TextDelta {
                text: text.to_string(),
            },
        });
    }

    fn push_tool_fragment(&mut self, fragment: &ChunkToolCall, events: &mut Vec<StreamEvent>) {
        let id = match fragment.id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => {
                self.slots.insert(fragment.index, id.to_string());
                id.to_string()
            }
            None => match self.slots.get(&fragment.index) {
                Some(id) => id.clone(),
                None => {
                    // Some backends never send ids; make one up so the call is not lost.
                    let id = format!("call_{}", uuid::Uuid::new_v4().simple());
                    self.slots.insert(fragment.index, id.clone());
                    id
                }
            },
        };

        let name = fragment
            .function
            .as_ref()
            .and_then(|f| f.name.as_deref())
            .filter(|n| !n.is_empty());
        let arguments = fragment
            .function
            .as_ref()
            .and_then(|f| f.arguments.as_deref())
            .unwrap_or_default();

        let call = match self.calls.iter().position(|c| c.id == id) {
            Some(call) => {
                if let Some(name) = name {
                    if self.calls[call].block_index.is_some() {
                        tracing::warn!(
                            tool_call_id = %id,
                            "Tool name fragment arrived after its block started"
                        );
                    }
                    self.calls[call].name.push_str(name);
                }
                call
            }
            None => {
                let call = self.calls.len();
                self.calls.push(ToolCallBuffer {
                    id,
                    name: name.unwrap_or_default().to_string(),
                    arguments: String::new(),
                    block_index: None,
                    closed: false,
                    late: false,
                });
                // With another call streaming live this one waits in its buffer.
                if !matches!(self.open, Some(OpenBlock::Tool { .. })) {
                    self.close_open_block(events);
                    self.open = Some(OpenBlock::Tool { call });
                }
                call
            }
        };

        if arguments.is_empty() {
            return;
        }
        self.calls[call].arguments.push_str(arguments);

        if self.open == Some(OpenBlock::Tool { call }) {
            let index = match self.calls[call].block_index {
                Some(index) => index,
                None => self.start_tool_block(call, events),
            };
            events.push(StreamEvent::ContentBlockDelta {
                index,
                delta: Delta::InputJsonDelta {
                    partial_json: arguments.to_string(),
                },
            });
        } else if self.calls[call].closed {
            tracing::warn!(
                tool_call_id = %self.calls[call].id,
                "Arguments arrived for a tool call whose block is already closed"
            );
            self.calls[call].late = true;
        }
    }

    fn allocate_index(&mut self) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    fn open_text_block(&mut self, events: &mut Vec<StreamEvent>) -> usize {
        let index = self.allocate_index();
        self.open = Some(OpenBlock::Text { index });
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block: ResponseContentBlock::Text {
                text: String::new(),
            },
        });
        index
    }

    /// A complete text block in one go.
    fn emit_text_block(&mut self, text: String, events: &mut Vec<StreamEvent>) {
        let index = self.open_text_block(events);
        events.push(StreamEvent::ContentBlockDelta {
            index,
            delta: Delta::TextDelta { text },
        });
        self.open = None;
        events.push(StreamEvent::ContentBlockStop { index });
    }

    fn start_tool_block(&mut self, call: usize, events: &mut Vec<StreamEvent>) -> usize {
        let index = self.allocate_index();
        let buffer = &mut self.calls[call];
        buffer.block_index = Some(index);
        events.push(StreamEvent::ContentBlockStart {
            index,
            content_block: ResponseContentBlock::ToolUse {
                id: buffer.id.clone(),
                name: buffer.name.clone(),
                input: serde_json::json!({}),
            },
        });
        index
    }

    fn stop_tool_block(&mut self, call: usize, index: usize, events: &mut Vec<StreamEvent>) {
        self.calls[call].closed = true;
        let (_, raw) = parse_arguments(&self.calls[call].arguments);
        if self.calls[call].arguments.trim().is_empty() {
            events.push(StreamEvent::ContentBlockDelta {
                index,
                delta: Delta::InputJsonDelta {
                    partial_json: "{}".to_string(),
                },
            });
        }
        events.push(StreamEvent::ContentBlockStop { index });

        if let Some(raw) = raw {
            tracing::warn!(
                tool_call_id = %self.calls[call].id,
                "Streamed tool call arguments are not valid JSON"
            );
            self.emit_text_block(raw, events);
        }
    }

    fn close_open_block(&mut self, events: &mut Vec<StreamEvent>) {
        match self.open.take() {
            None => {}
            Some(OpenBlock::Text { index }) => {
                events.push(StreamEvent::ContentBlockStop { index });
            }
            Some(OpenBlock::Tool { call }) => {
                let index = match self.calls[call].block_index {
                    Some(index) => index,
                    None => self.start_tool_block(call, events),
                };
                self.stop_tool_block(call, index, events);
            }
        }
    }

    /// Close the live block, then emit every call that was buffered behind it.
    fn settle_tool_calls(&mut self, events: &mut Vec<StreamEvent>) {
        self.close_open_block(events);
        for call in 0..self.calls.len() {
            if self.calls[call].closed || self.calls[call].block_index.is_some() {
                continue;
            }
            let index = self.start_tool_block(call, events);
            if !self.calls[call].arguments.is_empty() {
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: Delta::InputJsonDelta {
                        partial_json: self.calls[call].arguments.clone(),
                    },
                });
            }
            self.stop_tool_block(call, index, events);
        }
    }

    fn complete(&mut self, events: &mut Vec<StreamEvent>) {
        self.settle_tool_calls(events);
        for call in 0..self.calls.len() {
            if std::mem::take(&mut self.calls[call].late) {
                let arguments = self.calls[call].arguments.clone();
                self.emit_text_block(arguments, events);
            }
        }

        let (stop_reason, stop_reason_detail) =
            self.stop.take().unwrap_or((StopReason::EndTurn, None));

        events.push(StreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(stop_reason),
                stop_sequence: None,
                stop_reason_detail,
            },
            usage: self.usage,
        });
        events.push(StreamEvent::MessageStop);
        self.state = StreamState::Done;
    }

    /// Counters only ever move up within one stream.
    fn absorb_usage(&mut self, usage: &ChatUsage) {
        let incoming = usage_from(usage);
        self.usage.input_tokens = self.usage.input_tokens.max(incoming.input_tokens);
        self.usage.output_tokens = self.usage.output_tokens.max(incoming.output_tokens);
        self.usage.cache_read_input_tokens = match (
            self.usage.cache_read_input_tokens,
            incoming.cache_read_input_tokens,
        ) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    fn message_start(&self) -> StreamEvent {
        StreamEvent::MessageStart {
            message: MessagesResponse {
                id: self.msg_id.clone(),
                response_type: "message".to_string(),
                role: Role::Assistant,
                content: Vec::new(),
                model: self.model.clone(),
                stop_reason: None,
                stop_sequence: None,
                stop_reason_detail: None,
                usage: Usage::default(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::openai_types::*;

    fn chunk(delta: ChunkDelta, finish: Option<&str>, usage: Option<ChatUsage>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: "c1".to_string(),
            model: "gpt-4o".to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish.map(String::from),
            }],
            usage,
        }
    }

    fn text_chunk(content: &str) -> ChatCompletionChunk {
        chunk(
            ChunkDelta {
                content: Some(content.to_string()),
                ..Default::default()
            },
            None,
            None,
        )
    }

    fn tool_chunk(slot: u32, id: Option<&str>, name: Option<&str>, args: &str) -> ChatCompletionChunk {
        chunk(
            ChunkDelta {
                tool_calls: Some(vec![ChunkToolCall {
                    index: slot,
                    id: id.map(String::from),
                    function: Some(ChunkToolCallFunction {
                        name: name.map(String::from),
                        arguments: Some(args.to_string()),
                    }),
                }]),
                ..Default::default()
            },
            None,
            None,
        )
    }

    fn usage(input: u64, output: u64) -> ChatUsage {
        ChatUsage {
            prompt_tokens: input,
            completion_tokens: output,
            total_tokens: input + output,
            prompt_tokens_details: None,
        }
    }

    fn names(events: &[StreamEvent]) -> Vec<&'static str> {
        events.iter().map(StreamEvent::event_name).collect()
    }

    fn run(translator: &mut StreamTranslator, chunks: &[ChatCompletionChunk]) -> Vec<StreamEvent> {
        let mut events: Vec<StreamEvent> = chunks
            .iter()
            .flat_map(|c| translator.process_chunk(c))
            .collect();
        events.extend(translator.finish());
        events
    }

    #[test]
    fn test_three_text_fragments_then_finish() {
        let mut translator = StreamTranslator::new("claude-3-5-haiku");
        let mut first = text_chunk("Hel");
        first.choices[0].delta.role = Some("assistant".to_string());

        let mut events = Vec::new();
        for c in [first, text_chunk("lo"), text_chunk(" world")] {
            events.extend(translator.process_chunk(&c));
        }
        events.extend(translator.process_chunk(&chunk(
            ChunkDelta::default(),
            Some("stop"),
            Some(usage(12, 3)),
        )));

        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert_eq!(
            events[1],
            StreamEvent::ContentBlockStart {
                index: 0,
                content_block: ResponseContentBlock::Text {
                    text: String::new()
                },
            }
        );
        assert_eq!(events[5], StreamEvent::ContentBlockStop { index: 0 });
        match &events[6] {
            StreamEvent::MessageDelta { delta, usage } => {
                assert_eq!(delta.stop_reason, Some(StopReason::EndTurn));
                assert_eq!(usage.input_tokens, 12);
                assert_eq!(usage.output_tokens, 3);
            }
            other => panic!("expected message_delta, got {other:?}"),
        }
        assert_eq!(translator.state(), StreamState::Done);
        assert!(translator.finish().is_empty());
    }

    #[test]
    fn test_usage_after_finish_reason_is_waited_for() {
        let mut translator = StreamTranslator::new("m");
        translator.process_chunk(&text_chunk("Hi"));

        let events = translator.process_chunk(&chunk(ChunkDelta::default(), Some("length"), None));
        assert_eq!(names(&events), vec!["content_block_stop"]);
        assert_eq!(translator.state(), StreamState::Stopping);

        let trailing = ChatCompletionChunk {
            usage: Some(usage(40, 8)),
            ..Default::default()
        };
        let events = translator.process_chunk(&trailing);
        assert_eq!(names(&events), vec!["message_delta", "message_stop"]);
        match &events[0] {
            StreamEvent::MessageDelta { delta, usage } => {
                assert_eq!(delta.stop_reason, Some(StopReason::MaxTokens));
                assert_eq!(usage.output_tokens, 8);
            }
            other => panic!("expected message_delta, got {other:?}"),
        }
    }

    #[test]
    fn test_text_then_tool_call() {
        let mut translator = StreamTranslator::new("m");
        let events = run(
            &mut translator,
            &[
                text_chunk("Checking..."),
                tool_chunk(0, Some("call_abc"), Some("search"), "{\"q\""),
                tool_chunk(0, None, None, ":\"rust\"}"),
                chunk(ChunkDelta::default(), Some("tool_calls"), None),
            ],
        );

        assert_eq!(
            names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert_eq!(
            events[4],
            StreamEvent::ContentBlockStart {
                index: 1,
                content_block: ResponseContentBlock::ToolUse {
                    id: "call_abc".to_string(),
                    name: "search".to_string(),
                    input: serde_json::json!({}),
                },
            }
        );
        assert_eq!(translator.tool_calls()[0].arguments, "{\"q\":\"rust\"}");
        match &events[8] {
            StreamEvent::MessageDelta { delta, .. } => {
                assert_eq!(delta.stop_reason, Some(StopReason::ToolUse));
            }
            other => panic!("expected message_delta, got {other:?}"),
        }
    }

    #[test]
    fn test_fragment_reassembly_at_arbitrary_splits() {
        let original = r#"{"path":"/tmp/a b.txt","lines":[1,2,3],"nested":{"ok":true}}"#;
        for split_every in [1, 2, 5, 7, original.len()] {
            let mut translator = StreamTranslator::new("m");
            let mut chunks = vec![tool_chunk(0, Some("call_1"), Some("read"), "")];
            let chars: Vec<char> = original.chars().collect();
            for piece in chars.chunks(split_every) {
                let piece: String = piece.iter().collect();
                chunks.push(tool_chunk(0, None, None, &piece));
            }
            let events = run(&mut translator, &chunks);

            let streamed: String = events
                .iter()
                .filter_map(|e| match e {
                    StreamEvent::ContentBlockDelta {
                        delta: Delta::InputJsonDelta { partial_json },
                        ..
                    } => Some(partial_json.as_str()),
                    _ => None,
                })
                .collect();
            assert_eq!(streamed, original);
            assert_eq!(translator.tool_calls()[0].arguments, original);
        }
    }

    #[test]
    fn test_parallel_tool_calls_get_their_own_blocks() {
        let mut translator = StreamTranslator::new("m");
        let events = run(
            &mut translator,
            &[
                tool_chunk(0, Some("call_a"), Some("one"), "{}"),
                tool_chunk(1, Some("call_b"), Some("two"), "{\"x\":1}"),
                chunk(ChunkDelta::default(), Some("tool_calls"), None),
            ],
        );

        let starts: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockStart { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(starts, vec![0, 1]);
        assert_eq!(translator.tool_calls().len(), 2);
        assert_eq!(translator.tool_calls()[1].block_index, Some(1));
    }

    fn json_per_block(events: &[StreamEvent]) -> HashMap<usize, String> {
        let mut per_block: HashMap<usize, String> = HashMap::new();
        for event in events {
            if let StreamEvent::ContentBlockDelta {
                index,
                delta: Delta::InputJsonDelta { partial_json },
            } = event
            {
                per_block.entry(*index).or_default().push_str(partial_json);
            }
        }
        per_block
    }

    fn text_deltas(events: &[StreamEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockDelta {
                    delta: Delta::TextDelta { text },
                    ..
                } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_interleaved_parallel_fragments_are_not_lost() {
        let mut translator = StreamTranslator::new("m");
        let events = run(
            &mut translator,
            &[
                tool_chunk(0, Some("call_a"), Some("one"), "{\"x\":"),
                tool_chunk(1, Some("call_b"), Some("two"), "{\"y\":2}"),
                tool_chunk(0, None, None, "1}"),
                chunk(ChunkDelta::default(), Some("tool_calls"), None),
            ],
        );

        let per_block = json_per_block(&events);
        assert_eq!(per_block[&0], "{\"x\":1}");
        assert_eq!(per_block[&1], "{\"y\":2}");
        assert!(text_deltas(&events).is_empty());
        assert_eq!(translator.tool_calls()[0].block_index, Some(0));
        assert_eq!(translator.tool_calls()[1].block_index, Some(1));
        assert_block_accounting(&events);
    }

    #[test]
    fn test_arguments_after_a_closed_block_follow_as_text() {
        let mut translator = StreamTranslator::new("m");
        let events = run(
            &mut translator,
            &[
                tool_chunk(0, Some("call_a"), Some("one"), "{\"x\":"),
                text_chunk("thinking"),
                tool_chunk(0, None, None, "1}"),
                chunk(ChunkDelta::default(), Some("tool_calls"), None),
            ],
        );

        assert_eq!(translator.tool_calls()[0].arguments, "{\"x\":1}");
        let texts = text_deltas(&events);
        assert_eq!(texts.last(), Some(&"{\"x\":1}"));
        assert_block_accounting(&events);
    }

    #[test]
    fn test_tool_block_waits_for_a_late_name() {
        let mut translator = StreamTranslator::new("m");
        let mut events = translator.process_chunk(&tool_chunk(0, Some("call_a"), None, ""));
        assert_eq!(names(&events), vec!["message_start"]);

        events.extend(translator.process_chunk(&tool_chunk(0, None, Some("search"), "{}")));
        assert_eq!(
            events[1],
            StreamEvent::ContentBlockStart {
                index: 0,
                content_block: ResponseContentBlock::ToolUse {
                    id: "call_a".to_string(),
                    name: "search".to_string(),
                    input: serde_json::json!({}),
                },
            }
        );
    }

    #[test]
    fn test_empty_arguments_flush_empty_object() {
        let mut translator = StreamTranslator::new("m");
        let events = run(
            &mut translator,
            &[
                tool_chunk(0, Some("call_1"), Some("now"), ""),
                chunk(ChunkDelta::default(), Some("tool_calls"), None),
            ],
        );
        assert!(events.contains(&StreamEvent::ContentBlockDelta {
            index: 0,
            delta: Delta::InputJsonDelta {
                partial_json: "{}".to_string()
            },
        }));
    }

    #[test]
    fn test_malformed_arguments_surface_as_text_block() {
        let mut translator = StreamTranslator::new("m");
        let events = run(
            &mut translator,
            &[
                tool_chunk(0, Some("call_1"), Some("broken"), "{\"a\": "),
                chunk(ChunkDelta::default(), Some("tool_calls"), None),
            ],
        );

        let texts: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::ContentBlockDelta {
                    index: 1,
                    delta: Delta::TextDelta { text },
                } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["{\"a\": "]);
        assert_block_accounting(&events);
    }

    #[test]
    fn test_fragments_without_ids_are_kept() {
        let mut translator = StreamTranslator::new("m");
        run(
            &mut translator,
            &[
                tool_chunk(0, None, Some("lookup"), "{\"k\":"),
                tool_chunk(0, None, None, "1}"),
            ],
        );
        assert_eq!(translator.tool_calls().len(), 1);
        assert!(translator.tool_calls()[0].id.starts_with("call_"));
        assert_eq!(translator.tool_calls()[0].arguments, "{\"k\":1}");
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut translator = StreamTranslator::new("m");
        translator.process_chunk(&text_chunk("partial"));

        let first = translator.cancel();
        assert_eq!(names(&first), vec!["content_block_stop", "error"]);
        match &first[1] {
            StreamEvent::Error { error } => {
                assert_eq!(error.error_type, "client_disconnected_error");
            }
            other => panic!("expected error event, got {other:?}"),
        }
        assert_eq!(translator.state(), StreamState::Cancelled);

        assert!(translator.cancel().is_empty());
        assert!(translator.finish().is_empty());
        assert!(translator.process_chunk(&text_chunk("late")).is_empty());
        assert!(translator.heartbeat().is_none());
    }

    #[test]
    fn test_fail_closes_block_and_emits_error() {
        let mut translator = StreamTranslator::new("m");
        translator.process_chunk(&tool_chunk(0, Some("call_1"), Some("x"), "{\"a\":1}"));

        let error = ClassifiedError::new(ErrorKind::Overloaded, Some("busy"));
        let events = translator.fail(&error);
        assert_eq!(names(&events), vec!["content_block_stop", "error"]);
        assert_eq!(translator.state(), StreamState::Done);
    }

    #[test]
    fn test_finish_without_chunks() {
        let mut translator = StreamTranslator::new("m");
        let events = translator.finish();
        assert_eq!(
            names(&events),
            vec!["message_start", "message_delta", "message_stop"]
        );
    }

    #[test]
    fn test_heartbeat_does_not_touch_blocks() {
        let mut translator = StreamTranslator::new("m");
        translator.process_chunk(&text_chunk("a"));
        assert_eq!(translator.heartbeat(), Some(StreamEvent::Ping));
        let events = translator.process_chunk(&text_chunk("b"));
        assert_eq!(names(&events), vec!["content_block_delta"]);
    }

    #[test]
    fn test_usage_never_decreases() {
        let mut translator = StreamTranslator::new("m");
        let mut c = text_chunk("a");
        c.usage = Some(usage(50, 10));
        translator.process_chunk(&c);
        let mut c = text_chunk("b");
        c.usage = Some(usage(0, 4));
        translator.process_chunk(&c);

        assert_eq!(translator.usage().input_tokens, 50);
        assert_eq!(translator.usage().output_tokens, 10);
    }

    #[test]
    fn test_interleaved_text_and_tools_keep_indices_gapless() {
        let mut translator = StreamTranslator::new("m");
        let events = run(
            &mut translator,
            &[
                text_chunk("a"),
                tool_chunk(0, Some("call_1"), Some("t"), "{}"),
                text_chunk("b"),
                tool_chunk(1, Some("call_2"), Some("t"), "{}"),
                text_chunk("c"),
                chunk(ChunkDelta::default(), Some("stop"), None),
            ],
        );
        assert_block_accounting(&events);
    }

    /// Every start has a stop, only one block is open at a time, and indices run 0, 1, 2, ...
    fn assert_block_accounting(events: &[StreamEvent]) {
        let mut open: Option<usize> = None;
        let mut expected_next = 0;
        let mut starts = 0;
        let mut stops = 0;
        for event in events {
            match event {
                StreamEvent::ContentBlockStart { index, .. } => {
                    assert!(open.is_none(), "block opened while another is open");
                    assert_eq!(*index, expected_next);
                    expected_next += 1;
                    open = Some(*index);
                    starts += 1;
                }
                StreamEvent::ContentBlockDelta { index, .. } => {
                    assert_eq!(open, Some(*index));
                }
                StreamEvent::ContentBlockStop { index } => {
                    assert_eq!(open, Some(*index));
                    open = None;
                    stops += 1;
                }
                _ => {}
            }
        }
        assert_eq!(starts, stops);
        assert!(open.is_none());
    }
}
