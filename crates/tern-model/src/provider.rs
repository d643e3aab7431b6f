// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Provider-facing surface: the unified event vocabulary, stream options,
//! cancellation signal, and the api-based dispatch helpers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::stream::{EventSender, EventStream};
use crate::types::{Api, AssistantMessage, Context, ReasoningEffort, StopReason, ToolCallBlock};
use crate::Model;

/// Events emitted by a provider while streaming one assistant response.
///
/// Every event carries a clone of the partial message as it stood when the
/// event was produced; the `Done` / `Error` terminals carry the finalized
/// message (which is also the stream's terminal value).
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    Start { partial: AssistantMessage },
    TextStart { content_index: usize, partial: AssistantMessage },
    TextDelta { content_index: usize, delta: String, partial: AssistantMessage },
    TextEnd { content_index: usize, content: String, partial: AssistantMessage },
    ThinkingStart { content_index: usize, partial: AssistantMessage },
    ThinkingDelta { content_index: usize, delta: String, partial: AssistantMessage },
    ThinkingEnd { content_index: usize, content: String, partial: AssistantMessage },
    ToolCallStart { content_index: usize, partial: AssistantMessage },
    ToolCallDelta { content_index: usize, delta: String, partial: AssistantMessage },
    ToolCallEnd { content_index: usize, tool_call: ToolCallBlock, partial: AssistantMessage },
    Done { reason: StopReason, message: AssistantMessage },
    /// Protocol failure or cancellation. The message carries
    /// `stop_reason = error | aborted` and `error_message`.
    Error { reason: StopReason, message: AssistantMessage },
}

impl ProviderEvent {
    /// The partial (or final) assistant message this event carries.
    pub fn message(&self) -> &AssistantMessage {
        match self {
            Self::Start { partial }
            | Self::TextStart { partial, .. }
            | Self::TextDelta { partial, .. }
            | Self::TextEnd { partial, .. }
            | Self::ThinkingStart { partial, .. }
            | Self::ThinkingDelta { partial, .. }
            | Self::ThinkingEnd { partial, .. }
            | Self::ToolCallStart { partial, .. }
            | Self::ToolCallDelta { partial, .. }
            | Self::ToolCallEnd { partial, .. } => partial,
            Self::Done { message, .. } | Self::Error { message, .. } => message,
        }
    }
}

pub type ProviderStream = EventStream<ProviderEvent, AssistantMessage>;
pub type ProviderSender = EventSender<ProviderEvent, AssistantMessage>;

/// Connected sender/stream pair for one provider request.
pub(crate) fn event_channel_pair() -> (ProviderSender, ProviderStream) {
    crate::stream::event_stream()
}

/// Factory signature the agent loop uses to obtain a provider stream.
/// The two built-in factories are [`crate::stream_simple`] specialized per
/// wire protocol; tests substitute a scripted mock.
pub type StreamFn = Arc<dyn Fn(&Model, Context, SimpleStreamOptions) -> ProviderStream + Send + Sync>;

// ─── Cancellation ─────────────────────────────────────────────────────────────

/// One-shot cooperative cancellation flag shared by the provider read loop,
/// every tool invocation, and the agent's own polling points.
///
/// Providers check it between SSE lines; a set signal finalizes the partial
/// message with `stop_reason = aborted`. Setting it is idempotent.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    inner: Arc<AtomicBool>,
}

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.inner.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.inner.load(Ordering::Acquire)
    }
}

// ─── Options ──────────────────────────────────────────────────────────────────

/// Anthropic prompt-cache retention tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheRetention {
    None,
    Short,
    Long,
}

/// Callback observing the final request payload before it is sent.
pub type PayloadObserver = Arc<dyn Fn(&Value) + Send + Sync>;

/// Options common to both wire protocols.
#[derive(Clone, Default)]
pub struct StreamOptions {
    pub api_key: Option<String>,
    pub headers: Option<HashMap<String, String>>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub signal: Option<AbortSignal>,
    pub session_id: Option<String>,
    pub on_payload: Option<PayloadObserver>,
    pub cache_retention: Option<CacheRetention>,
    /// Hint forwarded for retry layers above the core; unused here.
    pub max_retry_delay_ms: Option<u64>,
}

/// Caller-level options: a reasoning level instead of per-protocol knobs.
/// `stream_simple` translates these into the protocol-specific options.
#[derive(Clone, Default)]
pub struct SimpleStreamOptions {
    pub base: StreamOptions,
    pub reasoning: Option<ReasoningEffort>,
    pub thinking_budgets: Option<HashMap<ReasoningEffort, u32>>,
    pub tool_choice: Option<Value>,
}

// ─── Thinking budgets ─────────────────────────────────────────────────────────

/// Default thinking-token budget per reasoning level. Callers can override
/// individual levels via `SimpleStreamOptions::thinking_budgets`.
pub fn default_thinking_budget(effort: ReasoningEffort) -> u32 {
    match effort {
        ReasoningEffort::Minimal => 1024,
        ReasoningEffort::Low => 2048,
        ReasoningEffort::Medium => 8192,
        // xhigh is clamped to high before lookup.
        ReasoningEffort::High | ReasoningEffort::Xhigh => 16384,
    }
}

/// Clamp `xhigh` down to `high` for models that do not advertise it.
pub fn clamp_reasoning(effort: ReasoningEffort, model: &Model) -> ReasoningEffort {
    if effort == ReasoningEffort::Xhigh && !model.supports_xhigh {
        ReasoningEffort::High
    } else {
        effort
    }
}

/// Grow `max_tokens` by the thinking budget, capped at the model's declared
/// limit. If the cap leaves fewer than 1024 tokens of real output, the budget
/// shrinks until output headroom is restored.
///
/// Returns `(adjusted_max_tokens, thinking_budget)`.
pub fn adjust_max_tokens_for_thinking(
    base_max_tokens: u32,
    model_max_tokens: u32,
    effort: ReasoningEffort,
    custom_budgets: Option<&HashMap<ReasoningEffort, u32>>,
) -> (u32, u32) {
    const MIN_OUTPUT_TOKENS: u32 = 1024;

    let mut budget = custom_budgets
        .and_then(|m| m.get(&effort).copied())
        .unwrap_or_else(|| default_thinking_budget(effort));
    let max_tokens = (base_max_tokens + budget).min(model_max_tokens);
    if max_tokens <= budget {
        budget = max_tokens.saturating_sub(MIN_OUTPUT_TOKENS);
    }
    (max_tokens, budget)
}

// ─── Dispatch ─────────────────────────────────────────────────────────────────

/// Start a streaming completion using the protocol the model speaks.
pub fn stream_simple(model: &Model, context: Context, options: SimpleStreamOptions) -> ProviderStream {
    match model.api {
        Api::OpenAiCompletions => crate::openai_compat::stream_simple_completions(model, context, options),
        Api::AnthropicMessages => crate::anthropic::stream_simple_messages(model, context, options),
    }
}

/// Await the full response of a non-interactive completion.
pub async fn complete_simple(
    model: &Model,
    context: Context,
    options: SimpleStreamOptions,
) -> Result<AssistantMessage, crate::stream::StreamError> {
    let mut stream = stream_simple(model, context, options);
    stream.result().await
}

// ─── Streaming JSON ───────────────────────────────────────────────────────────

/// Decode the longest prefix of `raw` that parses as a JSON object.
///
/// Tool-call arguments arrive as an incrementally growing string; this makes
/// the best currently-parseable object available after every delta. Returns
/// an empty map while no prefix parses yet.
pub(crate) fn parse_streaming_json(raw: &str) -> serde_json::Map<String, Value> {
    let raw = raw.trim();
    if raw.is_empty() {
        return serde_json::Map::new();
    }
    for end in (1..=raw.len()).rev() {
        if !raw.is_char_boundary(end) {
            continue;
        }
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&raw[..end]) {
            return map;
        }
    }
    serde_json::Map::new()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
