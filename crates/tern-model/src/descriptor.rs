// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Model descriptors and wire-compatibility detection.
//!
//! A [`Model`] is pure data describing one reachable model: which API it
//! speaks, where it lives, what it costs, and which quirks its endpoint has.
//! Quirk detection is the pure function [`compat_for`] — provider id and
//! base-url substrings select a [`CompletionsCompat`] record, and an explicit
//! `model.compat` override wins field by field. Request builders read the
//! record instead of scattering provider conditionals.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{Api, ModelCost};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InputModality {
    Text,
    Image,
}

/// Descriptor for one model reachable through a provider endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Model {
    /// Model identifier forwarded to the API (e.g. `gpt-4o`, `claude-sonnet-4-5`).
    pub id: String,
    pub api: Api,
    /// Stable provider id used for credential lookup (e.g. `openai`, `groq`).
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub base_url: String,
    /// Whether the model supports a reasoning / extended-thinking mode.
    #[serde(default)]
    pub reasoning: bool,
    #[serde(default = "default_input")]
    pub input: Vec<InputModality>,
    #[serde(default)]
    pub cost: ModelCost,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Additional HTTP headers sent on every request to this model.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Explicit quirk overrides; unset fields fall back to detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compat: Option<CompatOverride>,
    /// Whether the endpoint accepts `reasoning_effort: "xhigh"`.
    #[serde(default)]
    pub supports_xhigh: bool,
}

fn default_input() -> Vec<InputModality> {
    vec![InputModality::Text]
}

impl Model {
    pub fn supports_images(&self) -> bool {
        self.input.contains(&InputModality::Image)
    }
}

/// Which JSON field carries the output-token cap.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MaxTokensField {
    MaxTokens,
    MaxCompletionTokens,
}

/// How reasoning is switched on for a chat-completions endpoint.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingFormat {
    /// `reasoning_effort: <level>` (OpenAI and most compatibles).
    Openai,
    /// `thinking: {type: enabled|disabled}` (Z.ai).
    Zai,
    /// `enable_thinking: bool` (Qwen / DashScope).
    Qwen,
}

/// Resolved wire quirks for a chat-completions endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionsCompat {
    pub supports_store: bool,
    pub supports_developer_role: bool,
    pub supports_reasoning_effort: bool,
    pub supports_usage_in_streaming: bool,
    pub supports_strict_mode: bool,
    pub max_tokens_field: MaxTokensField,
    pub requires_tool_result_name: bool,
    pub requires_assistant_after_tool_result: bool,
    pub requires_thinking_as_text: bool,
    pub requires_mistral_tool_ids: bool,
    pub thinking_format: ThinkingFormat,
    pub openrouter_routing: HashMap<String, Vec<String>>,
    pub vercel_gateway_routing: HashMap<String, Vec<String>>,
}

/// Per-field quirk override carried on a [`Model`]. `None` means "use the
/// detected value".
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompatOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_store: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_developer_role: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_reasoning_effort: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_usage_in_streaming: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supports_strict_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens_field: Option<MaxTokensField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_tool_result_name: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_assistant_after_tool_result: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_thinking_as_text: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_mistral_tool_ids: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_format: Option<ThinkingFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openrouter_routing: Option<HashMap<String, Vec<String>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vercel_gateway_routing: Option<HashMap<String, Vec<String>>>,
}

/// Detect endpoint quirks from the provider id and base url.
fn detect_compat(model: &Model) -> CompletionsCompat {
    let provider = model.provider.as_str();
    let base_url = model.base_url.as_str();

    let is_zai = provider == "zai" || base_url.contains("api.z.ai");
    let is_grok = provider == "xai" || base_url.contains("api.x.ai");
    let is_mistral = provider == "mistral" || base_url.contains("mistral.ai");
    // Endpoints that reject `store` / the developer role.
    let is_non_standard = provider == "cerebras"
        || base_url.contains("cerebras.ai")
        || is_grok
        || is_mistral
        || base_url.contains("chutes.ai")
        || base_url.contains("deepseek.com")
        || is_zai
        || provider == "opencode"
        || base_url.contains("opencode.ai");

    let use_max_tokens = is_mistral || base_url.contains("chutes.ai");

    CompletionsCompat {
        supports_store: !is_non_standard,
        supports_developer_role: !is_non_standard,
        supports_reasoning_effort: !is_grok && !is_zai,
        supports_usage_in_streaming: true,
        supports_strict_mode: true,
        max_tokens_field: if use_max_tokens {
            MaxTokensField::MaxTokens
        } else {
            MaxTokensField::MaxCompletionTokens
        },
        requires_tool_result_name: is_mistral,
        requires_assistant_after_tool_result: false,
        requires_thinking_as_text: is_mistral,
        requires_mistral_tool_ids: is_mistral,
        thinking_format: if is_zai { ThinkingFormat::Zai } else { ThinkingFormat::Openai },
        openrouter_routing: HashMap::new(),
        vercel_gateway_routing: HashMap::new(),
    }
}

/// Resolved quirks for `model`: detection plus the explicit override.
pub fn compat_for(model: &Model) -> CompletionsCompat {
    let detected = detect_compat(model);
    let Some(ov) = &model.compat else {
        return detected;
    };
    CompletionsCompat {
        supports_store: ov.supports_store.unwrap_or(detected.supports_store),
        supports_developer_role: ov.supports_developer_role.unwrap_or(detected.supports_developer_role),
        supports_reasoning_effort: ov
            .supports_reasoning_effort
            .unwrap_or(detected.supports_reasoning_effort),
        supports_usage_in_streaming: ov
            .supports_usage_in_streaming
            .unwrap_or(detected.supports_usage_in_streaming),
        supports_strict_mode: ov.supports_strict_mode.unwrap_or(detected.supports_strict_mode),
        max_tokens_field: ov.max_tokens_field.unwrap_or(detected.max_tokens_field),
        requires_tool_result_name: ov
            .requires_tool_result_name
            .unwrap_or(detected.requires_tool_result_name),
        requires_assistant_after_tool_result: ov
            .requires_assistant_after_tool_result
            .unwrap_or(detected.requires_assistant_after_tool_result),
        requires_thinking_as_text: ov
            .requires_thinking_as_text
            .unwrap_or(detected.requires_thinking_as_text),
        requires_mistral_tool_ids: ov
            .requires_mistral_tool_ids
            .unwrap_or(detected.requires_mistral_tool_ids),
        thinking_format: ov.thinking_format.unwrap_or(detected.thinking_format),
        openrouter_routing: ov.openrouter_routing.clone().unwrap_or(detected.openrouter_routing),
        vercel_gateway_routing: ov
            .vercel_gateway_routing
            .clone()
            .unwrap_or(detected.vercel_gateway_routing),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
