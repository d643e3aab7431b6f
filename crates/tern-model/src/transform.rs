// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Message normalization for cross-provider handoff.
//!
//! A conversation recorded against one provider can be resumed on another.
//! [`transform_messages`] rewrites the history so the target endpoint accepts
//! it: foreign thinking blocks are stripped or downgraded to text, tool-call
//! ids are rewritten through a provider-specific normalizer (with tool
//! results following via a forward map), assistant messages that ended in
//! `error`/`aborted` are dropped, and any tool call left without a result
//! gets a synthetic error result. Applying the transform to its own output
//! is a fixed point.

use std::collections::{HashMap, HashSet};

use crate::types::{
    AssistantContentBlock, AssistantMessage, Message, StopReason, ToolCallBlock, ToolResultMessage,
    UserContentBlock, now_ms,
};
use crate::Model;

/// Rewrites a tool-call id for the target model. Receives the original id,
/// the target model, and the assistant message the call came from.
pub type NormalizeToolCallId = dyn Fn(&str, &Model, &AssistantMessage) -> String + Send + Sync;

pub fn transform_messages(
    messages: &[Message],
    model: &Model,
    normalize_tool_call_id: Option<&NormalizeToolCallId>,
) -> Vec<Message> {
    let mut id_map: HashMap<String, String> = HashMap::new();
    let mut transformed: Vec<Message> = Vec::with_capacity(messages.len());

    for msg in messages {
        match msg {
            Message::User(_) => transformed.push(msg.clone()),
            Message::ToolResult(tr) => {
                match id_map.get(&tr.tool_call_id) {
                    Some(normalized) if normalized != &tr.tool_call_id => {
                        let mut rewritten = tr.clone();
                        rewritten.tool_call_id = normalized.clone();
                        transformed.push(Message::ToolResult(rewritten));
                    }
                    _ => transformed.push(msg.clone()),
                }
            }
            Message::Assistant(am) => {
                transformed.push(Message::Assistant(normalize_assistant(
                    am,
                    model,
                    normalize_tool_call_id,
                    &mut id_map,
                )));
            }
        }
    }

    insert_missing_tool_results(transformed)
}

fn normalize_assistant(
    msg: &AssistantMessage,
    model: &Model,
    normalize_tool_call_id: Option<&NormalizeToolCallId>,
    id_map: &mut HashMap<String, String>,
) -> AssistantMessage {
    let is_same_model =
        msg.provider == model.provider && msg.api == model.api && msg.model == model.id;

    let mut content: Vec<AssistantContentBlock> = Vec::with_capacity(msg.content.len());
    for block in &msg.content {
        match block {
            AssistantContentBlock::Thinking { thinking, thinking_signature } => {
                if is_same_model && thinking_signature.is_some() {
                    content.push(block.clone());
                    continue;
                }
                if thinking.trim().is_empty() {
                    continue;
                }
                if is_same_model {
                    content.push(block.clone());
                } else {
                    // A foreign-signatured (or unsigned) thinking block cannot
                    // be replayed as thinking; keep the words as plain text.
                    content.push(AssistantContentBlock::text(thinking.clone()));
                }
            }
            AssistantContentBlock::Text { .. } => content.push(block.clone()),
            AssistantContentBlock::ToolCall(tc) => {
                let mut tool_call = tc.clone();
                if !is_same_model && tool_call.thought_signature.is_some() {
                    tool_call.thought_signature = None;
                }
                if !is_same_model {
                    if let Some(normalize) = normalize_tool_call_id {
                        let normalized = normalize(&tool_call.id, model, msg);
                        if normalized != tool_call.id {
                            id_map.insert(tool_call.id.clone(), normalized.clone());
                            tool_call.id = normalized;
                        }
                    }
                }
                content.push(AssistantContentBlock::ToolCall(tool_call));
            }
        }
    }

    AssistantMessage { content, ..msg.clone() }
}

/// Second pass: drop errored assistant turns and synthesize a result for
/// every tool call that has none before the next user message or the end of
/// the list.
fn insert_missing_tool_results(transformed: Vec<Message>) -> Vec<Message> {
    let mut result: Vec<Message> = Vec::with_capacity(transformed.len());
    let mut pending: Vec<ToolCallBlock> = Vec::new();
    let mut seen_result_ids: HashSet<String> = HashSet::new();

    fn flush(
        result: &mut Vec<Message>,
        pending: &mut Vec<ToolCallBlock>,
        seen: &mut HashSet<String>,
    ) {
        for tc in pending.drain(..) {
            if !seen.contains(&tc.id) {
                result.push(Message::ToolResult(ToolResultMessage {
                    tool_call_id: tc.id,
                    tool_name: tc.name,
                    content: vec![UserContentBlock::text("No result provided")],
                    details: None,
                    is_error: true,
                    timestamp: now_ms(),
                }));
            }
        }
        seen.clear();
    }

    for msg in transformed {
        match msg {
            Message::Assistant(am) => {
                if !pending.is_empty() {
                    flush(&mut result, &mut pending, &mut seen_result_ids);
                }
                if am.stop_reason.is_terminal_error() {
                    continue;
                }
                let calls: Vec<ToolCallBlock> = am.tool_calls().cloned().collect();
                if !calls.is_empty() {
                    pending = calls;
                    seen_result_ids.clear();
                }
                result.push(Message::Assistant(am));
            }
            Message::ToolResult(tr) => {
                seen_result_ids.insert(tr.tool_call_id.clone());
                result.push(Message::ToolResult(tr));
            }
            Message::User(_) => {
                if !pending.is_empty() {
                    flush(&mut result, &mut pending, &mut seen_result_ids);
                }
                result.push(msg);
            }
        }
    }
    if !pending.is_empty() {
        flush(&mut result, &mut pending, &mut seen_result_ids);
    }

    result
}

// ─── Id normalizers ───────────────────────────────────────────────────────────

/// Mistral: alphanumeric only, padded or truncated to exactly 9 characters.
pub fn normalize_mistral_tool_id(tool_id: &str) -> String {
    const PADDING: &str = "ABCDEFGHI";
    let mut normalized: String = tool_id.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    if normalized.len() < 9 {
        normalized.push_str(&PADDING[..9 - normalized.len()]);
    } else if normalized.len() > 9 {
        normalized.truncate(9);
    }
    normalized
}

/// OpenAI: strip a `|`-suffix tag, keep `[A-Za-z0-9_-]` (other characters
/// become `_`), truncate to 40.
pub fn normalize_openai_tool_id(tool_id: &str) -> String {
    let base = tool_id.split('|').next().unwrap_or(tool_id);
    let sanitized: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    sanitized.chars().take(40).collect()
}

/// Anthropic: keep `[A-Za-z0-9_-]`, truncate to 64.
pub fn normalize_anthropic_tool_id(tool_id: &str) -> String {
    tool_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .take(64)
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
