// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Streaming client for the `chat/completions` JSON-over-SSE wire format.
//!
//! One implementation covers every endpoint speaking this protocol — the
//! differences between them (max-tokens field name, developer role, thinking
//! switches, Mistral's tool-id rules, …) are captured in the
//! [`CompletionsCompat`] record resolved by `descriptor::compat_for`, so the
//! request builder stays a single straight-line function.
//!
//! The request task owns the growing partial [`AssistantMessage`]; every
//! delta appends to (or opens) the trailing content block and emits the
//! corresponding unified event with a snapshot of the partial attached.

use anyhow::{bail, Context as _, Result};
use futures::StreamExt;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::credentials::env_api_key;
use crate::descriptor::{compat_for, CompletionsCompat, MaxTokensField, ThinkingFormat};
use crate::provider::{
    clamp_reasoning, event_channel_pair, parse_streaming_json, AbortSignal, ProviderEvent,
    ProviderSender, ProviderStream, SimpleStreamOptions, StreamOptions,
};
use crate::sse::SseEventBuffer;
use crate::transform::{normalize_mistral_tool_id, normalize_openai_tool_id, transform_messages};
use crate::types::{
    AssistantContentBlock, AssistantMessage, Context, Message, ReasoningEffort, StopReason,
    ToolCallBlock, UserContent, UserContentBlock,
};
use crate::Model;

/// Options specific to the chat-completions protocol.
#[derive(Clone, Default)]
pub struct CompletionsOptions {
    pub base: StreamOptions,
    pub tool_choice: Option<Value>,
    pub reasoning_effort: Option<ReasoningEffort>,
}

/// Start a streaming chat-completions request.
///
/// Never panics and never returns a failed future: protocol errors and
/// cancellation finalize the partial message with `stop_reason = error` /
/// `aborted` and surface as an [`ProviderEvent::Error`] event.
pub fn stream_completions(model: &Model, context: Context, options: CompletionsOptions) -> ProviderStream {
    let (tx, stream) = event_channel_pair();
    let model = model.clone();
    tokio::spawn(async move {
        let mut output = AssistantMessage::partial(&model);
        let signal = options.base.signal.clone();
        match run_request(&model, &context, &options, &tx, &mut output).await {
            Ok(()) => {
                tx.push(ProviderEvent::Done { reason: output.stop_reason, message: output.clone() });
                tx.end(Some(output));
            }
            Err(err) => {
                output.stop_reason = if signal.as_ref().is_some_and(AbortSignal::is_set) {
                    StopReason::Aborted
                } else {
                    StopReason::Error
                };
                output.error_message = Some(err.to_string());
                tx.push(ProviderEvent::Error { reason: output.stop_reason, message: output.clone() });
                tx.end(Some(output));
            }
        }
    });
    stream
}

/// Caller-level entry point: translates a reasoning level into
/// `reasoning_effort` (clamping `xhigh` for models without it).
pub fn stream_simple_completions(
    model: &Model,
    context: Context,
    options: SimpleStreamOptions,
) -> ProviderStream {
    let reasoning_effort = options.reasoning.map(|e| clamp_reasoning(e, model));
    stream_completions(
        model,
        context,
        CompletionsOptions { base: options.base, tool_choice: options.tool_choice, reasoning_effort },
    )
}

async fn run_request(
    model: &Model,
    context: &Context,
    options: &CompletionsOptions,
    tx: &ProviderSender,
    output: &mut AssistantMessage,
) -> Result<()> {
    let api_key = options
        .base
        .api_key
        .clone()
        .or_else(|| env_api_key(&model.provider))
        .with_context(|| format!("No API key for provider: {}", model.provider))?;

    let params = build_params(model, context, options);
    if let Some(observer) = &options.base.on_payload {
        observer(&params);
    }
    let headers = build_headers(model, context, &api_key, options.base.headers.as_ref());
    let url = build_url(&model.base_url);

    debug!(provider = %model.provider, model = %model.id, %url, "sending completions request");

    let client = reqwest::Client::new();
    let mut request = client.post(&url).json(&params);
    for (name, value) in &headers {
        request = request.header(name.as_str(), value.as_str());
    }
    let response = request.send().await.with_context(|| format!("{} request failed", model.provider))?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        bail!("{} error {status}: {body}", model.provider);
    }

    tx.push(ProviderEvent::Start { partial: output.clone() });

    let mut state = StreamState::default();
    let mut sse = SseEventBuffer::new();
    let mut bytes = response.bytes_stream();
    'stream: while let Some(chunk) = bytes.next().await {
        let chunk = chunk.context("reading SSE stream")?;
        for event in sse.push_chunk(&chunk) {
            abort_if_set(options.base.signal.as_ref())?;
            if event.data == "[DONE]" {
                break 'stream;
            }
            let Ok(value) = serde_json::from_str::<Value>(&event.data) else { continue };
            handle_chunk(&value, model, tx, output, &mut state);
        }
    }
    // Some servers close the connection without terminating the last event.
    if let Some(event) = sse.finish() {
        if event.data != "[DONE]" {
            if let Ok(value) = serde_json::from_str::<Value>(&event.data) {
                handle_chunk(&value, model, tx, output, &mut state);
            }
        }
    }
    state.finish_current(tx, output);

    abort_if_set(options.base.signal.as_ref())?;
    Ok(())
}

fn abort_if_set(signal: Option<&AbortSignal>) -> Result<()> {
    if signal.is_some_and(AbortSignal::is_set) {
        bail!("Request was aborted");
    }
    Ok(())
}

// ─── Delta accumulation ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
    ToolCall,
}

#[derive(Default)]
struct StreamState {
    current: Option<BlockKind>,
    /// Raw accumulated argument text of the open tool call.
    tool_args: String,
    /// Id of the open tool call, used to detect a new parallel call.
    tool_id: String,
}

impl StreamState {
    /// Emit the `*_end` event for the open trailing block, if any.
    fn finish_current(&mut self, tx: &ProviderSender, output: &AssistantMessage) {
        let Some(kind) = self.current.take() else { return };
        let content_index = output.content.len().saturating_sub(1);
        match (kind, output.content.last()) {
            (BlockKind::Text, Some(AssistantContentBlock::Text { text, .. })) => {
                tx.push(ProviderEvent::TextEnd {
                    content_index,
                    content: text.clone(),
                    partial: output.clone(),
                });
            }
            (BlockKind::Thinking, Some(AssistantContentBlock::Thinking { thinking, .. })) => {
                tx.push(ProviderEvent::ThinkingEnd {
                    content_index,
                    content: thinking.clone(),
                    partial: output.clone(),
                });
            }
            (BlockKind::ToolCall, Some(AssistantContentBlock::ToolCall(tc))) => {
                tx.push(ProviderEvent::ToolCallEnd {
                    content_index,
                    tool_call: tc.clone(),
                    partial: output.clone(),
                });
            }
            _ => {}
        }
        self.tool_args.clear();
        self.tool_id.clear();
    }
}

fn handle_chunk(
    value: &Value,
    model: &Model,
    tx: &ProviderSender,
    output: &mut AssistantMessage,
    state: &mut StreamState,
) {
    if let Some(usage) = value.get("usage").filter(|u| !u.is_null()) {
        apply_usage(usage, model, output);
    }

    let Some(choice) = value.get("choices").and_then(Value::as_array).and_then(|c| c.first()) else {
        return;
    };
    if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
        output.stop_reason = map_stop_reason(Some(reason));
    }
    let delta = &choice["delta"];

    if let Some(text) = delta.get("content").and_then(Value::as_str).filter(|t| !t.is_empty()) {
        if state.current != Some(BlockKind::Text) {
            state.finish_current(tx, output);
            output.content.push(AssistantContentBlock::text(""));
            state.current = Some(BlockKind::Text);
            tx.push(ProviderEvent::TextStart {
                content_index: output.content.len() - 1,
                partial: output.clone(),
            });
        }
        if let Some(AssistantContentBlock::Text { text: buf, .. }) = output.content.last_mut() {
            buf.push_str(text);
        }
        tx.push(ProviderEvent::TextDelta {
            content_index: output.content.len() - 1,
            delta: text.to_string(),
            partial: output.clone(),
        });
    }

    // Reasoning arrives under one of three field names; the name is recorded
    // as the block's signature so request serialization can round-trip it.
    let reasoning = ["reasoning_content", "reasoning", "reasoning_text"]
        .iter()
        .find_map(|field| {
            delta.get(*field).and_then(Value::as_str).filter(|v| !v.is_empty()).map(|v| (*field, v))
        });
    if let Some((field, thinking_delta)) = reasoning {
        if state.current != Some(BlockKind::Thinking) {
            state.finish_current(tx, output);
            output.content.push(AssistantContentBlock::Thinking {
                thinking: String::new(),
                thinking_signature: Some(field.to_string()),
            });
            state.current = Some(BlockKind::Thinking);
            tx.push(ProviderEvent::ThinkingStart {
                content_index: output.content.len() - 1,
                partial: output.clone(),
            });
        }
        if let Some(AssistantContentBlock::Thinking { thinking, .. }) = output.content.last_mut() {
            thinking.push_str(thinking_delta);
        }
        tx.push(ProviderEvent::ThinkingDelta {
            content_index: output.content.len() - 1,
            delta: thinking_delta.to_string(),
            partial: output.clone(),
        });
    }

    if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
        for tc in tool_calls {
            let id = tc.get("id").and_then(Value::as_str).unwrap_or("");
            let name = tc["function"].get("name").and_then(Value::as_str).unwrap_or("");
            let new_call = state.current != Some(BlockKind::ToolCall)
                || (!id.is_empty() && state.tool_id != id);
            if new_call {
                state.finish_current(tx, output);
                output.content.push(AssistantContentBlock::ToolCall(ToolCallBlock {
                    id: id.to_string(),
                    name: name.to_string(),
                    arguments: Map::new(),
                    thought_signature: None,
                }));
                state.current = Some(BlockKind::ToolCall);
                state.tool_id = id.to_string();
                tx.push(ProviderEvent::ToolCallStart {
                    content_index: output.content.len() - 1,
                    partial: output.clone(),
                });
            }
            let args_delta = tc["function"].get("arguments").and_then(Value::as_str).unwrap_or("");
            if let Some(AssistantContentBlock::ToolCall(block)) = output.content.last_mut() {
                if !id.is_empty() {
                    block.id = id.to_string();
                    state.tool_id = id.to_string();
                }
                // First non-empty name wins; later names on the same call are
                // ignored (some gateways re-send the name on every chunk).
                if !name.is_empty() && block.name.is_empty() {
                    block.name = name.to_string();
                }
                if !args_delta.is_empty() {
                    state.tool_args.push_str(args_delta);
                    block.arguments = parse_streaming_json(&state.tool_args);
                }
            }
            tx.push(ProviderEvent::ToolCallDelta {
                content_index: output.content.len() - 1,
                delta: args_delta.to_string(),
                partial: output.clone(),
            });
        }
    }

    // Encrypted reasoning blobs attach to the tool call with the matching id
    // and round-trip as its thought signature.
    if let Some(details) = delta.get("reasoning_details").and_then(Value::as_array) {
        for detail in details {
            let is_encrypted = detail.get("type").and_then(Value::as_str) == Some("reasoning.encrypted");
            let id = detail.get("id").and_then(Value::as_str);
            let has_data = detail.get("data").and_then(Value::as_str).is_some();
            if let (true, Some(id), true) = (is_encrypted, id, has_data) {
                for block in &mut output.content {
                    if let AssistantContentBlock::ToolCall(tc) = block {
                        if tc.id == id {
                            tc.thought_signature = Some(detail.to_string());
                        }
                    }
                }
            }
        }
    }
}

fn apply_usage(usage: &Value, model: &Model, output: &mut AssistantMessage) {
    let cached = usage["prompt_tokens_details"]["cached_tokens"].as_u64().unwrap_or(0);
    let reasoning = usage["completion_tokens_details"]["reasoning_tokens"].as_u64().unwrap_or(0);
    let prompt = usage["prompt_tokens"].as_u64().unwrap_or(0);
    let completion = usage["completion_tokens"].as_u64().unwrap_or(0);

    output.usage.input = prompt.saturating_sub(cached);
    output.usage.output = completion + reasoning;
    output.usage.cache_read = cached;
    output.usage.cache_write = 0;
    output.usage.total_tokens = output.usage.input + output.usage.output + output.usage.cache_read;
    output.usage.apply_cost(&model.cost);
}

pub(crate) fn map_stop_reason(reason: Option<&str>) -> StopReason {
    match reason {
        None | Some("stop") => StopReason::Stop,
        Some("length") => StopReason::Length,
        Some("function_call") | Some("tool_calls") => StopReason::ToolUse,
        Some("content_filter") => StopReason::Error,
        Some(_) => StopReason::Error,
    }
}

// ─── Request construction ─────────────────────────────────────────────────────

pub(crate) fn build_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else if base.ends_with("/v1") {
        format!("{base}/chat/completions")
    } else {
        format!("{base}/v1/chat/completions")
    }
}

pub(crate) fn build_headers(
    model: &Model,
    context: &Context,
    api_key: &str,
    extra: Option<&std::collections::HashMap<String, String>>,
) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = vec![
        ("Authorization".into(), format!("Bearer {api_key}")),
        ("Content-Type".into(), "application/json".into()),
    ];
    for (name, value) in &model.headers {
        headers.push((name.clone(), value.clone()));
    }

    if model.provider == "github-copilot" {
        let is_agent_call = context.messages.last().is_some_and(|m| m.role() != "user");
        headers.push(("X-Initiator".into(), if is_agent_call { "agent" } else { "user" }.into()));
        headers.push(("Openai-Intent".into(), "conversation-edits".into()));
        if messages_carry_images(&context.messages) {
            headers.push(("Copilot-Vision-Request".into(), "true".into()));
        }
    }

    if let Some(extra) = extra {
        for (name, value) in extra {
            headers.push((name.clone(), value.clone()));
        }
    }
    headers
}

fn messages_carry_images(messages: &[Message]) -> bool {
    messages.iter().any(|m| match m {
        Message::User(u) => match &u.content {
            UserContent::Blocks(blocks) => {
                blocks.iter().any(|b| matches!(b, UserContentBlock::Image { .. }))
            }
            UserContent::Text(_) => false,
        },
        Message::ToolResult(tr) => tr.has_images(),
        Message::Assistant(_) => false,
    })
}

fn has_tool_history(messages: &[Message]) -> bool {
    messages.iter().any(|m| match m {
        Message::ToolResult(_) => true,
        Message::Assistant(a) => a.tool_calls().next().is_some(),
        Message::User(_) => false,
    })
}

pub(crate) fn build_params(model: &Model, context: &Context, options: &CompletionsOptions) -> Value {
    let compat = compat_for(model);
    let messages = build_completions_messages(model, context, &compat);
    let reasoning_effort = options.reasoning_effort.map(|e| clamp_reasoning(e, model));

    let mut params = json!({
        "model": model.id,
        "messages": messages,
        "stream": true,
    });

    if compat.supports_usage_in_streaming {
        params["stream_options"] = json!({ "include_usage": true });
    }
    if compat.supports_store {
        params["store"] = json!(false);
    }
    if let Some(max_tokens) = options.base.max_tokens {
        match compat.max_tokens_field {
            MaxTokensField::MaxTokens => params["max_tokens"] = json!(max_tokens),
            MaxTokensField::MaxCompletionTokens => params["max_completion_tokens"] = json!(max_tokens),
        }
    }
    if let Some(temperature) = options.base.temperature {
        params["temperature"] = json!(temperature);
    }

    match &context.tools {
        Some(tools) if !tools.is_empty() => {
            params["tools"] = json!(convert_tools(tools, &compat));
        }
        // Some endpoints insist on a tools array whenever the history
        // contains tool calls, even when no tools are offered this turn.
        _ if has_tool_history(&context.messages) => {
            params["tools"] = json!([]);
        }
        _ => {}
    }
    if let Some(tool_choice) = &options.tool_choice {
        params["tool_choice"] = tool_choice.clone();
    }

    match compat.thinking_format {
        ThinkingFormat::Zai if model.reasoning => {
            params["thinking"] =
                json!({ "type": if reasoning_effort.is_some() { "enabled" } else { "disabled" } });
        }
        ThinkingFormat::Qwen if model.reasoning => {
            params["enable_thinking"] = json!(reasoning_effort.is_some());
        }
        _ => {
            if let Some(effort) = reasoning_effort {
                if model.reasoning && compat.supports_reasoning_effort {
                    params["reasoning_effort"] = json!(effort.as_str());
                }
            }
        }
    }

    if model.base_url.contains("openrouter.ai") && !compat.openrouter_routing.is_empty() {
        params["provider"] = json!(compat.openrouter_routing);
    }
    if model.base_url.contains("ai-gateway.vercel.sh") && !compat.vercel_gateway_routing.is_empty() {
        let mut gateway = Map::new();
        if let Some(only) = compat.vercel_gateway_routing.get("only") {
            gateway.insert("only".into(), json!(only));
        }
        if let Some(order) = compat.vercel_gateway_routing.get("order") {
            gateway.insert("order".into(), json!(order));
        }
        if !gateway.is_empty() {
            params["providerOptions"] = json!({ "gateway": gateway });
        }
    }

    params
}

fn convert_tools(tools: &[crate::types::Tool], compat: &CompletionsCompat) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            let mut function = json!({
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.parameters,
            });
            if compat.supports_strict_mode {
                function["strict"] = json!(false);
            }
            json!({ "type": "function", "function": function })
        })
        .collect()
}

fn normalize_id_for(model: &Model, compat: &CompletionsCompat, tool_id: &str) -> String {
    if compat.requires_mistral_tool_ids {
        return normalize_mistral_tool_id(tool_id);
    }
    let mut id = if tool_id.contains('|') { normalize_openai_tool_id(tool_id) } else { tool_id.to_string() };
    if model.provider == "openai" && id.len() > 40 {
        id.truncate(40);
    }
    if model.provider == "github-copilot" && model.id.to_lowercase().contains("claude") {
        id = crate::transform::normalize_anthropic_tool_id(&id);
    }
    id
}

/// Convert the context's message list into the wire-format JSON array.
///
/// Free function so the wire shape is unit-testable without HTTP.
pub(crate) fn build_completions_messages(
    model: &Model,
    context: &Context,
    compat: &CompletionsCompat,
) -> Vec<Value> {
    let mut params: Vec<Value> = Vec::new();

    if let Some(system) = &context.system_prompt {
        let role = if model.reasoning && compat.supports_developer_role { "developer" } else { "system" };
        params.push(json!({ "role": role, "content": system }));
    }

    let model_for_normalize = model.clone();
    let compat_for_normalize = compat.clone();
    let normalize = move |tool_id: &str, _m: &Model, _src: &AssistantMessage| {
        normalize_id_for(&model_for_normalize, &compat_for_normalize, tool_id)
    };
    let transformed = transform_messages(&context.messages, model, Some(&normalize));

    let mut last_role: Option<&'static str> = None;
    let mut i = 0;
    while i < transformed.len() {
        let msg = &transformed[i];
        if compat.requires_assistant_after_tool_result
            && last_role == Some("toolResult")
            && msg.role() == "user"
        {
            params.push(json!({ "role": "assistant", "content": "I have processed the tool results." }));
        }
        match msg {
            Message::User(user) => match &user.content {
                UserContent::Text(text) => {
                    params.push(json!({ "role": "user", "content": text }));
                }
                UserContent::Blocks(blocks) => {
                    let mut content: Vec<Value> = Vec::new();
                    for block in blocks {
                        match block {
                            UserContentBlock::Text { text } => {
                                content.push(json!({ "type": "text", "text": text }));
                            }
                            UserContentBlock::Image { data, mime_type } => {
                                if model.supports_images() {
                                    content.push(json!({
                                        "type": "image_url",
                                        "image_url": { "url": format!("data:{mime_type};base64,{data}") },
                                    }));
                                }
                            }
                        }
                    }
                    if content.is_empty() {
                        i += 1;
                        continue;
                    }
                    params.push(json!({ "role": "user", "content": content }));
                }
            },
            Message::Assistant(assistant) => {
                if let Some(wire) = assistant_to_wire(assistant, model, compat) {
                    params.push(wire);
                } else {
                    i += 1;
                    continue;
                }
            }
            Message::ToolResult(_) => {
                // Consume the whole run of consecutive tool results so any
                // images they carry can be appended as one user message after
                // the tool messages.
                let mut image_blocks: Vec<Value> = Vec::new();
                while i < transformed.len() {
                    let Message::ToolResult(tr) = &transformed[i] else { break };
                    let text = tr.text();
                    let mut tool_msg = json!({
                        "role": "tool",
                        "content": if text.is_empty() { "(see attached image)" } else { text.as_str() },
                        "tool_call_id": tr.tool_call_id,
                    });
                    if compat.requires_tool_result_name && !tr.tool_name.is_empty() {
                        tool_msg["name"] = json!(tr.tool_name);
                    }
                    params.push(tool_msg);

                    if tr.has_images() && model.supports_images() {
                        for block in &tr.content {
                            if let UserContentBlock::Image { data, mime_type } = block {
                                image_blocks.push(json!({
                                    "type": "image_url",
                                    "image_url": { "url": format!("data:{mime_type};base64,{data}") },
                                }));
                            }
                        }
                    }
                    i += 1;
                }

                if !image_blocks.is_empty() {
                    if compat.requires_assistant_after_tool_result {
                        params.push(
                            json!({ "role": "assistant", "content": "I have processed the tool results." }),
                        );
                    }
                    let mut content =
                        vec![json!({ "type": "text", "text": "Attached image(s) from tool result:" })];
                    content.extend(image_blocks);
                    params.push(json!({ "role": "user", "content": content }));
                    last_role = Some("user");
                } else {
                    last_role = Some("toolResult");
                }
                continue;
            }
        }
        last_role = Some(match msg {
            Message::User(_) => "user",
            Message::Assistant(_) => "assistant",
            Message::ToolResult(_) => "toolResult",
        });
        i += 1;
    }

    params
}

/// Serialize one assistant message, or `None` when nothing of it survives
/// (no text, no tool calls) and the message should be skipped.
fn assistant_to_wire(
    assistant: &AssistantMessage,
    model: &Model,
    compat: &CompletionsCompat,
) -> Option<Value> {
    let mut wire = json!({
        "role": "assistant",
        "content": if compat.requires_assistant_after_tool_result { json!("") } else { Value::Null },
    });

    let text_blocks: Vec<&str> = assistant
        .content
        .iter()
        .filter_map(|b| match b {
            AssistantContentBlock::Text { text, .. } if !text.trim().is_empty() => Some(text.as_str()),
            _ => None,
        })
        .collect();
    if !text_blocks.is_empty() {
        if model.provider == "github-copilot" {
            wire["content"] = json!(text_blocks.concat());
        } else {
            wire["content"] = json!(text_blocks
                .iter()
                .map(|t| json!({ "type": "text", "text": t }))
                .collect::<Vec<_>>());
        }
    }

    let thinking_blocks: Vec<(&str, Option<&str>)> = assistant
        .content
        .iter()
        .filter_map(|b| match b {
            AssistantContentBlock::Thinking { thinking, thinking_signature }
                if !thinking.trim().is_empty() =>
            {
                Some((thinking.as_str(), thinking_signature.as_deref()))
            }
            _ => None,
        })
        .collect();
    if !thinking_blocks.is_empty() {
        if compat.requires_thinking_as_text {
            let thinking_text =
                thinking_blocks.iter().map(|(t, _)| *t).collect::<Vec<_>>().join("\n\n");
            let block = json!({ "type": "text", "text": thinking_text });
            match &mut wire["content"] {
                Value::Array(list) => list.insert(0, block),
                other => *other = json!([block]),
            }
        } else if let Some(signature) = thinking_blocks[0].1 {
            // Replay reasoning under the field name it originally arrived in.
            let joined = thinking_blocks.iter().map(|(t, _)| *t).collect::<Vec<_>>().join("\n");
            wire[signature] = json!(joined);
        }
    }

    let tool_calls: Vec<&ToolCallBlock> = assistant.tool_calls().collect();
    if !tool_calls.is_empty() {
        wire["tool_calls"] = json!(tool_calls
            .iter()
            .map(|tc| {
                json!({
                    "id": tc.id,
                    "type": "function",
                    "function": {
                        "name": tc.name,
                        "arguments": Value::Object(tc.arguments.clone()).to_string(),
                    }
                })
            })
            .collect::<Vec<_>>());
        let reasoning_details: Vec<Value> = tool_calls
            .iter()
            .filter_map(|tc| tc.thought_signature.as_deref())
            .filter_map(|sig| serde_json::from_str::<Value>(sig).ok())
            .filter(|v| !v.is_null())
            .collect();
        if !reasoning_details.is_empty() {
            wire["reasoning_details"] = json!(reasoning_details);
        }
    }

    let has_content = match &wire["content"] {
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        _ => false,
    };
    if !has_content && wire.get("tool_calls").is_none() {
        return None;
    }
    Some(wire)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
