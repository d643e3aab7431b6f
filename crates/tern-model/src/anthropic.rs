// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Streaming client for the Anthropic messages JSON-over-SSE wire format.
//!
//! Differences from the chat-completions protocol that shape this module:
//! content arrives as typed blocks addressed by index (so the partial message
//! is grown through an index → slot map, not a trailing cursor), thinking
//! carries a server signature that must round-trip, consecutive tool results
//! are grouped into a single `user` turn, and prompt caching is driven by
//! explicit `cache_control` markers.
//!
//! When the API key is an OAuth access token (`sk-ant-oat…`) the request is
//! shaped like the Claude Code CLI's: its fixed system block is prepended and
//! tool names are mapped to the CLI's canonical casing on the way out and
//! back on the way in.

use std::collections::HashMap;

use anyhow::{bail, Context as _, Result};
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::credentials::env_api_key;
use crate::provider::{
    adjust_max_tokens_for_thinking, clamp_reasoning, event_channel_pair, parse_streaming_json,
    AbortSignal, CacheRetention, ProviderEvent, ProviderSender, ProviderStream,
    SimpleStreamOptions, StreamOptions,
};
use crate::sse::SseEventBuffer;
use crate::transform::{normalize_anthropic_tool_id, transform_messages};
use crate::types::{
    AssistantContentBlock, AssistantMessage, Context, Message, StopReason, Tool, ToolCallBlock,
    UserContent, UserContentBlock,
};
use crate::Model;

pub(crate) const ANTHROPIC_VERSION: &str = "2023-06-01";
const CLAUDE_CODE_VERSION: &str = "2.1.2";

/// Tool names the Claude Code CLI registers, in their canonical casing.
const CLAUDE_CODE_TOOLS: &[&str] = &[
    "Read",
    "Write",
    "Edit",
    "Bash",
    "Grep",
    "Glob",
    "AskUserQuestion",
    "EnterPlanMode",
    "ExitPlanMode",
    "KillShell",
    "NotebookEdit",
    "Skill",
    "Task",
    "TaskOutput",
    "TodoWrite",
    "WebFetch",
    "WebSearch",
];

fn to_claude_code_name(name: &str) -> String {
    CLAUDE_CODE_TOOLS
        .iter()
        .find(|canonical| canonical.eq_ignore_ascii_case(name))
        .map(|c| c.to_string())
        .unwrap_or_else(|| name.to_string())
}

fn from_claude_code_name(name: &str, tools: Option<&[Tool]>) -> String {
    if let Some(tools) = tools {
        for tool in tools {
            if tool.name.eq_ignore_ascii_case(name) {
                return tool.name.clone();
            }
        }
    }
    name.to_string()
}

fn is_oauth_token(api_key: &str) -> bool {
    api_key.contains("sk-ant-oat")
}

/// Options specific to the messages protocol.
#[derive(Clone, Default)]
pub struct MessagesOptions {
    pub base: StreamOptions,
    pub thinking_enabled: Option<bool>,
    pub thinking_budget_tokens: Option<u32>,
    pub interleaved_thinking: Option<bool>,
    pub tool_choice: Option<Value>,
}

// ─── Cache control ────────────────────────────────────────────────────────────

fn resolve_cache_retention(requested: Option<CacheRetention>) -> CacheRetention {
    if let Some(retention) = requested {
        return retention;
    }
    if std::env::var("PI_CACHE_RETENTION").as_deref() == Ok("long") {
        CacheRetention::Long
    } else {
        CacheRetention::Short
    }
}

/// Cache-control marker for this request, or `None` when caching is off.
/// The 1-hour TTL is only valid on the canonical Anthropic endpoint.
pub(crate) fn cache_control_for(base_url: &str, requested: Option<CacheRetention>) -> Option<Value> {
    let retention = resolve_cache_retention(requested);
    match retention {
        CacheRetention::None => None,
        CacheRetention::Long if base_url.contains("api.anthropic.com") => {
            Some(json!({ "type": "ephemeral", "ttl": "1h" }))
        }
        _ => Some(json!({ "type": "ephemeral" })),
    }
}

// ─── Entry points ─────────────────────────────────────────────────────────────

/// Start a streaming messages request. Same error contract as the
/// chat-completions provider: failures surface as `error` events, never as
/// panics or failed futures.
pub fn stream_messages(model: &Model, context: Context, options: MessagesOptions) -> ProviderStream {
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

/// Caller-level entry point: translates the reasoning level into a thinking
/// budget and adjusts `max_tokens` to make room for it.
pub fn stream_simple_messages(
    model: &Model,
    context: Context,
    options: SimpleStreamOptions,
) -> ProviderStream {
    let mut base = options.base;
    if base.max_tokens.is_none() {
        // Leave headroom on very large models rather than defaulting to the
        // full declared output limit.
        base.max_tokens = model.max_tokens.map(|mt| mt.min(32_000));
    }

    let Some(reasoning) = options.reasoning else {
        return stream_messages(
            model,
            context,
            MessagesOptions {
                base,
                thinking_enabled: Some(false),
                thinking_budget_tokens: None,
                interleaved_thinking: None,
                tool_choice: options.tool_choice,
            },
        );
    };

    let effort = clamp_reasoning(reasoning, model);
    let base_max_tokens = base.max_tokens.or(model.max_tokens).unwrap_or(1024);
    let model_max_tokens = model.max_tokens.unwrap_or(base_max_tokens);
    let (adjusted_max, budget) = adjust_max_tokens_for_thinking(
        base_max_tokens,
        model_max_tokens,
        effort,
        options.thinking_budgets.as_ref(),
    );
    base.max_tokens = Some(adjusted_max);

    stream_messages(
        model,
        context,
        MessagesOptions {
            base,
            thinking_enabled: Some(true),
            thinking_budget_tokens: Some(budget),
            interleaved_thinking: None,
            tool_choice: options.tool_choice,
        },
    )
}

async fn run_request(
    model: &Model,
    context: &Context,
    options: &MessagesOptions,
    tx: &ProviderSender,
    output: &mut AssistantMessage,
) -> Result<()> {
    let api_key = options
        .base
        .api_key
        .clone()
        .or_else(|| env_api_key(&model.provider))
        .with_context(|| format!("No API key for provider: {}", model.provider))?;

    let is_oauth = is_oauth_token(&api_key);
    let cache_control = cache_control_for(&model.base_url, options.base.cache_retention);
    let params = build_params(model, context, is_oauth, cache_control.as_ref(), options);
    if let Some(observer) = &options.base.on_payload {
        observer(&params);
    }
    let headers = build_headers(
        &api_key,
        &model.headers,
        options.base.headers.as_ref(),
        is_oauth,
        options.interleaved_thinking,
    );
    let url = build_url(&model.base_url);

    debug!(provider = %model.provider, model = %model.id, oauth = is_oauth, %url,
        "sending messages request");

    let client = reqwest::Client::new();
    let mut request = client.post(&url).json(&params);
    for (name, value) in &headers {
        request = request.header(name.as_str(), value.as_str());
    }
    let response = request.send().await.context("Anthropic request failed")?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        bail!("Anthropic error {status}: {body}");
    }

    tx.push(ProviderEvent::Start { partial: output.clone() });

    let mut state = BlockState::default();
    let mut sse = SseEventBuffer::new();
    let mut bytes = response.bytes_stream();
    'stream: while let Some(chunk) = bytes.next().await {
        let chunk = chunk.context("reading SSE stream")?;
        for event in sse.push_chunk(&chunk) {
            abort_if_set(options.base.signal.as_ref())?;
            if event.data == "[DONE]" {
                continue;
            }
            let Ok(value) = serde_json::from_str::<Value>(&event.data) else { continue };
            let event_type = event
                .name
                .clone()
                .or_else(|| value.get("type").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_default();
            if event_type == "message_stop" {
                break 'stream;
            }
            handle_event(&event_type, &value, model, context, is_oauth, tx, output, &mut state);
        }
    }
    // Process a trailing event the server never terminated with a blank line.
    if let Some(event) = sse.finish() {
        if event.data != "[DONE]" {
            if let Ok(value) = serde_json::from_str::<Value>(&event.data) {
                let event_type = event
                    .name
                    .or_else(|| value.get("type").and_then(Value::as_str).map(str::to_string))
                    .unwrap_or_default();
                if event_type != "message_stop" {
                    handle_event(&event_type, &value, model, context, is_oauth, tx, output, &mut state);
                }
            }
        }
    }

    abort_if_set(options.base.signal.as_ref())?;
    Ok(())
}

fn abort_if_set(signal: Option<&AbortSignal>) -> Result<()> {
    if signal.is_some_and(AbortSignal::is_set) {
        bail!("Request was aborted");
    }
    Ok(())
}

// ─── SSE event handling ───────────────────────────────────────────────────────

#[derive(Default)]
struct BlockState {
    /// Wire block index → position in `output.content`.
    slots: HashMap<u64, usize>,
    /// Wire block index → accumulated raw argument JSON.
    partial_json: HashMap<u64, String>,
}

#[allow(clippy::too_many_arguments)]
fn handle_event(
    event_type: &str,
    value: &Value,
    model: &Model,
    context: &Context,
    is_oauth: bool,
    tx: &ProviderSender,
    output: &mut AssistantMessage,
    state: &mut BlockState,
) {
    match event_type {
        "message_start" => {
            let usage = &value["message"]["usage"];
            output.usage.input = usage["input_tokens"].as_u64().unwrap_or(0);
            output.usage.output = usage["output_tokens"].as_u64().unwrap_or(0);
            output.usage.cache_read = usage["cache_read_input_tokens"].as_u64().unwrap_or(0);
            output.usage.cache_write = usage["cache_creation_input_tokens"].as_u64().unwrap_or(0);
            output.usage.total_tokens = output.usage.input
                + output.usage.output
                + output.usage.cache_read
                + output.usage.cache_write;
            output.usage.apply_cost(&model.cost);
        }
        "content_block_start" => {
            let index = value["index"].as_u64().unwrap_or(output.content.len() as u64);
            let block = &value["content_block"];
            match block["type"].as_str().unwrap_or("") {
                "text" => {
                    output.content.push(AssistantContentBlock::text(""));
                    let slot = output.content.len() - 1;
                    state.slots.insert(index, slot);
                    tx.push(ProviderEvent::TextStart { content_index: slot, partial: output.clone() });
                }
                "thinking" => {
                    output.content.push(AssistantContentBlock::Thinking {
                        thinking: String::new(),
                        thinking_signature: Some(String::new()),
                    });
                    let slot = output.content.len() - 1;
                    state.slots.insert(index, slot);
                    tx.push(ProviderEvent::ThinkingStart { content_index: slot, partial: output.clone() });
                }
                "tool_use" => {
                    let mut name = block["name"].as_str().unwrap_or("").to_string();
                    if is_oauth {
                        name = from_claude_code_name(&name, context.tools.as_deref());
                    }
                    output.content.push(AssistantContentBlock::ToolCall(ToolCallBlock {
                        id: block["id"].as_str().unwrap_or("").to_string(),
                        name,
                        arguments: block["input"].as_object().cloned().unwrap_or_default(),
                        thought_signature: None,
                    }));
                    let slot = output.content.len() - 1;
                    state.slots.insert(index, slot);
                    state.partial_json.insert(index, String::new());
                    tx.push(ProviderEvent::ToolCallStart { content_index: slot, partial: output.clone() });
                }
                _ => {}
            }
        }
        "content_block_delta" => {
            let index = value["index"].as_u64().unwrap_or(0);
            let Some(&slot) = state.slots.get(&index) else { return };
            let delta = &value["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => {
                    let text = delta["text"].as_str().unwrap_or("");
                    if let Some(AssistantContentBlock::Text { text: buf, .. }) = output.content.get_mut(slot)
                    {
                        buf.push_str(text);
                    }
                    tx.push(ProviderEvent::TextDelta {
                        content_index: slot,
                        delta: text.to_string(),
                        partial: output.clone(),
                    });
                }
                "thinking_delta" => {
                    let thinking = delta["thinking"].as_str().unwrap_or("");
                    if let Some(AssistantContentBlock::Thinking { thinking: buf, .. }) =
                        output.content.get_mut(slot)
                    {
                        buf.push_str(thinking);
                    }
                    tx.push(ProviderEvent::ThinkingDelta {
                        content_index: slot,
                        delta: thinking.to_string(),
                        partial: output.clone(),
                    });
                }
                "input_json_delta" => {
                    let partial = delta["partial_json"].as_str().unwrap_or("");
                    let buf = state.partial_json.entry(index).or_default();
                    buf.push_str(partial);
                    let arguments = parse_streaming_json(buf);
                    if let Some(AssistantContentBlock::ToolCall(tc)) = output.content.get_mut(slot) {
                        tc.arguments = arguments;
                    }
                    tx.push(ProviderEvent::ToolCallDelta {
                        content_index: slot,
                        delta: partial.to_string(),
                        partial: output.clone(),
                    });
                }
                // The signature is an opaque integrity blob; accumulate it on
                // the thinking block, never surface it as readable output.
                "signature_delta" => {
                    let signature = delta["signature"].as_str().unwrap_or("");
                    if let Some(AssistantContentBlock::Thinking { thinking_signature, .. }) =
                        output.content.get_mut(slot)
                    {
                        match thinking_signature {
                            Some(existing) => existing.push_str(signature),
                            None => *thinking_signature = Some(signature.to_string()),
                        }
                    }
                }
                _ => {}
            }
        }
        "content_block_stop" => {
            let index = value["index"].as_u64().unwrap_or(0);
            let Some(&slot) = state.slots.get(&index) else { return };
            match output.content.get(slot) {
                Some(AssistantContentBlock::Text { text, .. }) => {
                    tx.push(ProviderEvent::TextEnd {
                        content_index: slot,
                        content: text.clone(),
                        partial: output.clone(),
                    });
                }
                Some(AssistantContentBlock::Thinking { thinking, .. }) => {
                    tx.push(ProviderEvent::ThinkingEnd {
                        content_index: slot,
                        content: thinking.clone(),
                        partial: output.clone(),
                    });
                }
                Some(AssistantContentBlock::ToolCall(tc)) => {
                    tx.push(ProviderEvent::ToolCallEnd {
                        content_index: slot,
                        tool_call: tc.clone(),
                        partial: output.clone(),
                    });
                }
                None => {}
            }
        }
        "message_delta" => {
            if let Some(reason) = value["delta"]["stop_reason"].as_str() {
                output.stop_reason = map_stop_reason(reason);
            }
            let usage = &value["usage"];
            if usage.is_object() {
                if let Some(v) = usage["input_tokens"].as_u64() {
                    output.usage.input = v;
                }
                if let Some(v) = usage["output_tokens"].as_u64() {
                    output.usage.output = v;
                }
                if let Some(v) = usage["cache_read_input_tokens"].as_u64() {
                    output.usage.cache_read = v;
                }
                if let Some(v) = usage["cache_creation_input_tokens"].as_u64() {
                    output.usage.cache_write = v;
                }
                output.usage.total_tokens = output.usage.input
                    + output.usage.output
                    + output.usage.cache_read
                    + output.usage.cache_write;
                output.usage.apply_cost(&model.cost);
            }
        }
        _ => {}
    }
}

pub(crate) fn map_stop_reason(reason: &str) -> StopReason {
    match reason {
        "end_turn" => StopReason::Stop,
        "max_tokens" => StopReason::Length,
        "tool_use" => StopReason::ToolUse,
        "refusal" | "sensitive" => StopReason::Error,
        _ => StopReason::Stop,
    }
}

// ─── Request construction ─────────────────────────────────────────────────────

pub(crate) fn build_url(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/messages") {
        base.to_string()
    } else if base.ends_with("/v1") {
        format!("{base}/messages")
    } else {
        format!("{base}/v1/messages")
    }
}

pub(crate) fn build_headers(
    api_key: &str,
    model_headers: &HashMap<String, String>,
    extra: Option<&HashMap<String, String>>,
    is_oauth: bool,
    interleaved_thinking: Option<bool>,
) -> Vec<(String, String)> {
    let mut betas = vec!["fine-grained-tool-streaming-2025-05-14"];
    if interleaved_thinking != Some(false) {
        betas.push("interleaved-thinking-2025-05-14");
    }

    let mut headers: Vec<(String, String)> = if is_oauth {
        vec![
            ("accept".into(), "application/json".into()),
            ("anthropic-dangerous-direct-browser-access".into(), "true".into()),
            (
                "anthropic-beta".into(),
                format!("claude-code-20250219,oauth-2025-04-20,{}", betas.join(",")),
            ),
            ("anthropic-version".into(), ANTHROPIC_VERSION.into()),
            ("authorization".into(), format!("Bearer {api_key}")),
            ("content-type".into(), "application/json".into()),
            ("user-agent".into(), format!("claude-cli/{CLAUDE_CODE_VERSION} (external, cli)")),
            ("x-app".into(), "cli".into()),
        ]
    } else {
        vec![
            ("accept".into(), "application/json".into()),
            ("anthropic-dangerous-direct-browser-access".into(), "true".into()),
            ("anthropic-beta".into(), betas.join(",")),
            ("anthropic-version".into(), ANTHROPIC_VERSION.into()),
            ("content-type".into(), "application/json".into()),
            ("x-api-key".into(), api_key.into()),
        ]
    };

    for (name, value) in model_headers {
        headers.push((name.clone(), value.clone()));
    }
    if let Some(extra) = extra {
        for (name, value) in extra {
            headers.push((name.clone(), value.clone()));
        }
    }
    headers
}

pub(crate) fn build_params(
    model: &Model,
    context: &Context,
    is_oauth: bool,
    cache_control: Option<&Value>,
    options: &MessagesOptions,
) -> Value {
    let messages = build_anthropic_messages(model, context, is_oauth, cache_control);
    let mut params = json!({
        "model": model.id,
        "messages": messages,
        "stream": true,
        "max_tokens": options.base.max_tokens.or(model.max_tokens).unwrap_or(1024),
    });

    if is_oauth {
        let mut system_blocks = vec![json!({
            "type": "text",
            "text": "You are Claude Code, Anthropic's official CLI for Claude.",
        })];
        if let Some(system) = &context.system_prompt {
            system_blocks.push(json!({ "type": "text", "text": system }));
        }
        if let Some(cc) = cache_control {
            for block in &mut system_blocks {
                block["cache_control"] = cc.clone();
            }
        }
        params["system"] = json!(system_blocks);
    } else if let Some(system) = &context.system_prompt {
        let mut block = json!({ "type": "text", "text": system });
        if let Some(cc) = cache_control {
            block["cache_control"] = cc.clone();
        }
        params["system"] = json!([block]);
    }

    if let Some(temperature) = options.base.temperature {
        params["temperature"] = json!(temperature);
    }

    if let Some(tools) = &context.tools {
        if !tools.is_empty() {
            params["tools"] = json!(convert_tools(tools, is_oauth));
        }
    }

    if options.thinking_enabled == Some(true) && model.reasoning {
        params["thinking"] = json!({
            "type": "enabled",
            "budget_tokens": options.thinking_budget_tokens.unwrap_or(1024),
        });
    }

    if let Some(tool_choice) = &options.tool_choice {
        params["tool_choice"] = match tool_choice {
            Value::String(s) => json!({ "type": s }),
            other => other.clone(),
        };
    }

    params
}

fn convert_tools(tools: &[Tool], is_oauth: bool) -> Vec<Value> {
    tools
        .iter()
        .map(|tool| {
            let name =
                if is_oauth { to_claude_code_name(&tool.name) } else { tool.name.clone() };
            json!({
                "name": name,
                "description": tool.description,
                "input_schema": {
                    "type": "object",
                    "properties": tool.parameters.get("properties").cloned().unwrap_or(json!({})),
                    "required": tool.parameters.get("required").cloned().unwrap_or(json!([])),
                },
            })
        })
        .collect()
}

fn image_block(data: &str, mime_type: &str) -> Value {
    json!({
        "type": "image",
        "source": { "type": "base64", "media_type": mime_type, "data": data },
    })
}

/// Tool-result content: a plain string when text-only, else a block array
/// with a text placeholder inserted when only images are present.
fn tool_result_content(blocks: &[UserContentBlock]) -> Value {
    let has_images = blocks.iter().any(|b| matches!(b, UserContentBlock::Image { .. }));
    if !has_images {
        let text: Vec<&str> = blocks
            .iter()
            .filter_map(|b| match b {
                UserContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        return json!(text.join("\n"));
    }
    let mut out: Vec<Value> = Vec::new();
    for block in blocks {
        match block {
            UserContentBlock::Text { text } => out.push(json!({ "type": "text", "text": text })),
            UserContentBlock::Image { data, mime_type } => out.push(image_block(data, mime_type)),
        }
    }
    if !out.iter().any(|b| b["type"] == "text") {
        out.insert(0, json!({ "type": "text", "text": "(see attached image)" }));
    }
    json!(out)
}

fn normalize_id(tool_id: &str, _model: &Model, _source: &AssistantMessage) -> String {
    normalize_anthropic_tool_id(tool_id)
}

/// Convert the context's messages into the messages wire format, grouping
/// consecutive tool results into single user turns and placing the cache
/// marker on the last content block of the final user message.
pub(crate) fn build_anthropic_messages(
    model: &Model,
    context: &Context,
    is_oauth: bool,
    cache_control: Option<&Value>,
) -> Vec<Value> {
    let transformed = transform_messages(&context.messages, model, Some(&normalize_id));
    let mut params: Vec<Value> = Vec::new();

    let mut i = 0;
    while i < transformed.len() {
        match &transformed[i] {
            Message::User(user) => match &user.content {
                UserContent::Text(text) => {
                    if !text.trim().is_empty() {
                        params.push(json!({ "role": "user", "content": text }));
                    }
                }
                UserContent::Blocks(blocks) => {
                    let mut out: Vec<Value> = Vec::new();
                    for block in blocks {
                        match block {
                            UserContentBlock::Text { text } => {
                                if !text.trim().is_empty() {
                                    out.push(json!({ "type": "text", "text": text }));
                                }
                            }
                            UserContentBlock::Image { data, mime_type } => {
                                if model.supports_images() {
                                    out.push(image_block(data, mime_type));
                                }
                            }
                        }
                    }
                    if !out.is_empty() {
                        params.push(json!({ "role": "user", "content": out }));
                    }
                }
            },
            Message::Assistant(assistant) => {
                let mut blocks: Vec<Value> = Vec::new();
                for block in &assistant.content {
                    match block {
                        AssistantContentBlock::Text { text, .. } => {
                            if !text.trim().is_empty() {
                                blocks.push(json!({ "type": "text", "text": text }));
                            }
                        }
                        AssistantContentBlock::Thinking { thinking, thinking_signature } => {
                            if thinking.trim().is_empty() {
                                continue;
                            }
                            match thinking_signature.as_deref().filter(|s| !s.is_empty()) {
                                Some(signature) => blocks.push(json!({
                                    "type": "thinking",
                                    "thinking": thinking,
                                    "signature": signature,
                                })),
                                None => blocks.push(json!({ "type": "text", "text": thinking })),
                            }
                        }
                        AssistantContentBlock::ToolCall(tc) => {
                            let name = if is_oauth {
                                to_claude_code_name(&tc.name)
                            } else {
                                tc.name.clone()
                            };
                            blocks.push(json!({
                                "type": "tool_use",
                                "id": tc.id,
                                "name": name,
                                "input": tc.arguments,
                            }));
                        }
                    }
                }
                if !blocks.is_empty() {
                    params.push(json!({ "role": "assistant", "content": blocks }));
                }
            }
            Message::ToolResult(_) => {
                let mut results: Vec<Value> = Vec::new();
                while i < transformed.len() {
                    let Message::ToolResult(tr) = &transformed[i] else { break };
                    results.push(json!({
                        "type": "tool_result",
                        "tool_use_id": tr.tool_call_id,
                        "content": tool_result_content(&tr.content),
                        "is_error": tr.is_error,
                    }));
                    i += 1;
                }
                params.push(json!({ "role": "user", "content": results }));
                continue;
            }
        }
        i += 1;
    }

    if let Some(cc) = cache_control {
        if let Some(last) = params.last_mut() {
            if last["role"] == "user" {
                if let Some(content) = last["content"].as_array_mut() {
                    if let Some(block) = content.last_mut() {
                        let block_type = block["type"].as_str().unwrap_or("");
                        if matches!(block_type, "text" | "image" | "tool_result") {
                            block["cache_control"] = cc.clone();
                        }
                    }
                }
            }
        }
    }

    params
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
