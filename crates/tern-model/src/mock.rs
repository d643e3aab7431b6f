// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Scripted provider for tests.
//!
//! Replays a programmed sequence of responses through the same event
//! vocabulary as the real providers, one response per stream request. Text
//! is emitted in configurable chunks with the abort signal checked between
//! chunks, so cancellation-mid-stream behaves like a live endpoint. Every
//! received context is recorded for assertions.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::provider::{ProviderEvent, ProviderStream, SimpleStreamOptions, StreamFn};
use crate::stream::event_stream;
use crate::types::{
    AssistantContentBlock, AssistantMessage, Context, StopReason,
};
use crate::Model;

/// One scripted assistant response.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub blocks: Vec<AssistantContentBlock>,
    pub stop_reason: StopReason,
    pub error_message: Option<String>,
}

impl ScriptedResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            blocks: vec![AssistantContentBlock::text(text.into())],
            stop_reason: StopReason::Stop,
            error_message: None,
        }
    }

    pub fn tool_calls(blocks: Vec<AssistantContentBlock>) -> Self {
        Self { blocks, stop_reason: StopReason::ToolUse, error_message: None }
    }
}

#[derive(Default)]
struct Recorded {
    contexts: Vec<Context>,
}

/// Scripted provider handle. Clone the [`StreamFn`] from [`stream_fn`] into
/// an agent config; each call pops the next scripted response.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    recorded: Mutex<Recorded>,
    /// Number of characters per emitted text delta.
    text_chunk_size: usize,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ScriptedResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            recorded: Mutex::new(Recorded::default()),
            text_chunk_size: usize::MAX,
        })
    }

    /// Like [`new`], but text blocks stream in `chunk_size`-character deltas
    /// with an abort check between deltas.
    pub fn with_chunked_text(responses: Vec<ScriptedResponse>, chunk_size: usize) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            recorded: Mutex::new(Recorded::default()),
            text_chunk_size: chunk_size.max(1),
        })
    }

    /// Contexts received so far, in request order.
    pub fn contexts(&self) -> Vec<Context> {
        self.recorded.lock().unwrap().contexts.clone()
    }

    pub fn stream_fn(self: &Arc<Self>) -> StreamFn {
        let this = Arc::clone(self);
        Arc::new(move |model: &Model, context: Context, options: SimpleStreamOptions| {
            this.stream(model, context, options)
        })
    }

    fn stream(
        self: &Arc<Self>,
        model: &Model,
        context: Context,
        options: SimpleStreamOptions,
    ) -> ProviderStream {
        self.recorded.lock().unwrap().contexts.push(context);
        let response = self.responses.lock().unwrap().pop_front();
        let (tx, stream) = event_stream();
        let model = model.clone();
        let chunk_size = self.text_chunk_size;

        tokio::spawn(async move {
            let mut output = AssistantMessage::partial(&model);
            let signal = options.base.signal.clone();
            let Some(script) = response else {
                output.stop_reason = StopReason::Error;
                output.error_message = Some("mock provider: script exhausted".into());
                tx.push(ProviderEvent::Error { reason: StopReason::Error, message: output.clone() });
                tx.end(Some(output));
                return;
            };

            tx.push(ProviderEvent::Start { partial: output.clone() });

            let mut aborted = false;
            'blocks: for block in script.blocks {
                match block {
                    AssistantContentBlock::Text { text, text_signature } => {
                        output
                            .content
                            .push(AssistantContentBlock::Text { text: String::new(), text_signature });
                        let index = output.content.len() - 1;
                        tx.push(ProviderEvent::TextStart { content_index: index, partial: output.clone() });
                        let chars: Vec<char> = text.chars().collect();
                        for chunk in chars.chunks(chunk_size) {
                            if signal.as_ref().is_some_and(|s| s.is_set()) {
                                aborted = true;
                                break 'blocks;
                            }
                            let delta: String = chunk.iter().collect();
                            if let Some(AssistantContentBlock::Text { text: buf, .. }) =
                                output.content.last_mut()
                            {
                                buf.push_str(&delta);
                            }
                            tx.push(ProviderEvent::TextDelta {
                                content_index: index,
                                delta,
                                partial: output.clone(),
                            });
                            tokio::task::yield_now().await;
                        }
                        let content = match output.content.last() {
                            Some(AssistantContentBlock::Text { text, .. }) => text.clone(),
                            _ => String::new(),
                        };
                        tx.push(ProviderEvent::TextEnd {
                            content_index: index,
                            content,
                            partial: output.clone(),
                        });
                    }
                    AssistantContentBlock::Thinking { thinking, thinking_signature } => {
                        output.content.push(AssistantContentBlock::Thinking {
                            thinking: thinking.clone(),
                            thinking_signature,
                        });
                        let index = output.content.len() - 1;
                        tx.push(ProviderEvent::ThinkingStart {
                            content_index: index,
                            partial: output.clone(),
                        });
                        tx.push(ProviderEvent::ThinkingDelta {
                            content_index: index,
                            delta: thinking.clone(),
                            partial: output.clone(),
                        });
                        tx.push(ProviderEvent::ThinkingEnd {
                            content_index: index,
                            content: thinking,
                            partial: output.clone(),
                        });
                    }
                    AssistantContentBlock::ToolCall(tc) => {
                        output.content.push(AssistantContentBlock::ToolCall(tc.clone()));
                        let index = output.content.len() - 1;
                        tx.push(ProviderEvent::ToolCallStart {
                            content_index: index,
                            partial: output.clone(),
                        });
                        tx.push(ProviderEvent::ToolCallEnd {
                            content_index: index,
                            tool_call: tc,
                            partial: output.clone(),
                        });
                    }
                }
            }

            if aborted || signal.as_ref().is_some_and(|s| s.is_set()) {
                output.stop_reason = StopReason::Aborted;
                output.error_message = Some("Request was aborted".into());
                tx.push(ProviderEvent::Error {
                    reason: StopReason::Aborted,
                    message: output.clone(),
                });
                tx.end(Some(output));
                return;
            }

            output.stop_reason = script.stop_reason;
            output.error_message = script.error_message;
            if output.stop_reason.is_terminal_error() {
                tx.push(ProviderEvent::Error { reason: output.stop_reason, message: output.clone() });
            } else {
                tx.push(ProviderEvent::Done { reason: output.stop_reason, message: output.clone() });
            }
            tx.end(Some(output));
        });

        stream
    }
}
