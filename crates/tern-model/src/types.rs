use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Model;

// ─── Content blocks ───────────────────────────────────────────────────────────

/// A single content block in a user message or a tool result.
///
/// Images carry raw base64 plus a mime type; providers serialize them into
/// their API-specific wire shape (`image_url` data URLs for chat-completions,
/// `source: {type: base64}` blocks for messages).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum UserContentBlock {
    Text { text: String },
    Image { data: String, mime_type: String },
}

impl UserContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(data: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self::Image { data: data.into(), mime_type: mime_type.into() }
    }
}

/// A tool invocation requested by the assistant.
///
/// `arguments` is always a JSON object. While streaming it holds the best
/// currently-parseable prefix of the argument text; it is final once the
/// provider emits the block's end event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallBlock {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Map<String, Value>,
    /// Encrypted reasoning blob tied to this call (openrouter
    /// `reasoning.encrypted` details, JSON-encoded). Round-trips on request
    /// serialization; cleared when the conversation moves to another model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought_signature: Option<String>,
}

/// A single content block in an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum AssistantContentBlock {
    Text {
        text: String,
        /// Which wire field carried this text, when it matters for the
        /// round-trip (rare; reasoning text replayed as a dedicated field).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text_signature: Option<String>,
    },
    Thinking {
        thinking: String,
        /// Provider integrity signature for the thinking block. Thinking
        /// without a signature cannot be replayed to another provider.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        thinking_signature: Option<String>,
    },
    ToolCall(ToolCallBlock),
}

impl AssistantContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into(), text_signature: None }
    }

    pub fn as_tool_call(&self) -> Option<&ToolCallBlock> {
        match self {
            Self::ToolCall(tc) => Some(tc),
            _ => None,
        }
    }
}

// ─── Messages ─────────────────────────────────────────────────────────────────

/// User message content: either a plain string or an ordered block list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum UserContent {
    Text(String),
    Blocks(Vec<UserContentBlock>),
}

impl UserContent {
    /// Plain text of this content, joining text blocks with newlines.
    /// Image blocks are omitted.
    pub fn as_text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    UserContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    pub content: UserContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<AssistantContentBlock>,
    pub api: Api,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub stop_reason: StopReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub timestamp: i64,
}

impl AssistantMessage {
    /// Empty partial message attributed to `model`, used as the seed for a
    /// streaming response.
    pub fn partial(model: &Model) -> Self {
        Self {
            content: Vec::new(),
            api: model.api,
            provider: model.provider.clone(),
            model: model.id.clone(),
            usage: Usage::default(),
            stop_reason: StopReason::Stop,
            error_message: None,
            timestamp: now_ms(),
        }
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCallBlock> {
        self.content.iter().filter_map(AssistantContentBlock::as_tool_call)
    }

    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                AssistantContentBlock::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultMessage {
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub content: Vec<UserContentBlock>,
    /// Structured payload for frontends; never sent to a model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default)]
    pub is_error: bool,
    pub timestamp: i64,
}

impl ToolResultMessage {
    pub fn error(tool_call_id: impl Into<String>, tool_name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
            content: vec![UserContentBlock::text(text)],
            details: None,
            is_error: true,
            timestamp: now_ms(),
        }
    }

    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                UserContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn has_images(&self) -> bool {
        self.content.iter().any(|b| matches!(b, UserContentBlock::Image { .. }))
    }
}

/// A message in the conversation, discriminated by its `role` tag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "role", rename_all = "camelCase")]
pub enum Message {
    User(UserMessage),
    Assistant(AssistantMessage),
    ToolResult(ToolResultMessage),
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User(UserMessage { content: UserContent::Text(text.into()), timestamp: Some(now_ms()) })
    }

    pub fn user_with_blocks(blocks: Vec<UserContentBlock>) -> Self {
        Self::User(UserMessage { content: UserContent::Blocks(blocks), timestamp: Some(now_ms()) })
    }

    pub fn role(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Assistant(_) => "assistant",
            Self::ToolResult(_) => "toolResult",
        }
    }

    pub fn as_assistant(&self) -> Option<&AssistantMessage> {
        match self {
            Self::Assistant(m) => Some(m),
            _ => None,
        }
    }
}

/// Milliseconds since the Unix epoch, the timestamp unit used on messages.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ─── Usage and cost ───────────────────────────────────────────────────────────

/// Per-million-token prices for a model, in USD.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModelCost {
    #[serde(default)]
    pub input: f64,
    #[serde(default)]
    pub output: f64,
    #[serde(default)]
    pub cache_read: f64,
    #[serde(default)]
    pub cache_write: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UsageCost {
    #[serde(default)]
    pub input: f64,
    #[serde(default)]
    pub output: f64,
    #[serde(default)]
    pub cache_read: f64,
    #[serde(default)]
    pub cache_write: f64,
    #[serde(default)]
    pub total: f64,
}

/// Token usage for one assistant message. `input` excludes cached tokens;
/// `output` includes reasoning tokens where the provider reports them.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(default)]
    pub input: u64,
    #[serde(default)]
    pub output: u64,
    #[serde(default)]
    pub cache_read: u64,
    #[serde(default)]
    pub cache_write: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub cost: UsageCost,
}

impl Usage {
    /// Recompute the dollar cost from `rates`. Call after any token field
    /// changes; the total is the sum of the four components.
    pub fn apply_cost(&mut self, rates: &ModelCost) {
        self.cost.input = self.input as f64 * rates.input / 1_000_000.0;
        self.cost.output = self.output as f64 * rates.output / 1_000_000.0;
        self.cost.cache_read = self.cache_read as f64 * rates.cache_read / 1_000_000.0;
        self.cost.cache_write = self.cache_write as f64 * rates.cache_write / 1_000_000.0;
        self.cost.total = self.cost.input + self.cost.output + self.cost.cache_read + self.cost.cache_write;
    }
}

// ─── Stop reasons and APIs ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    #[default]
    Stop,
    Length,
    ToolUse,
    Error,
    Aborted,
}

impl StopReason {
    /// Errors and aborts terminate the run; no tool execution follows.
    pub fn is_terminal_error(self) -> bool {
        matches!(self, Self::Error | Self::Aborted)
    }
}

/// The wire protocol a model speaks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Api {
    #[serde(rename = "openai-completions")]
    OpenAiCompletions,
    #[serde(rename = "anthropic-messages")]
    AnthropicMessages,
}

/// Reasoning effort requested from a reasoning-capable model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Minimal,
    Low,
    Medium,
    High,
    Xhigh,
}

impl ReasoningEffort {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Xhigh => "xhigh",
        }
    }
}

// ─── Tools and context ────────────────────────────────────────────────────────

/// A tool schema offered to the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tool {
    pub name: String,
    pub description: String,
    /// JSON Schema of the argument object.
    pub parameters: Value,
}

/// Everything a provider needs to build one request.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assistant(content: Vec<AssistantContentBlock>) -> AssistantMessage {
        AssistantMessage {
            content,
            api: Api::AnthropicMessages,
            provider: "anthropic".into(),
            model: "claude-test".into(),
            usage: Usage::default(),
            stop_reason: StopReason::Stop,
            error_message: None,
            timestamp: 1,
        }
    }

    // ── Wire tags ─────────────────────────────────────────────────────────────

    #[test]
    fn user_message_serializes_with_role_tag() {
        let m = Message::user("hello");
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["role"], "user");
        assert_eq!(v["content"], "hello");
    }

    #[test]
    fn tool_result_role_is_camel_case_on_wire() {
        let m = Message::ToolResult(ToolResultMessage::error("t1", "echo", "boom"));
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["role"], "toolResult");
        assert_eq!(v["toolCallId"], "t1");
        assert_eq!(v["toolName"], "echo");
        assert_eq!(v["isError"], true);
    }

    #[test]
    fn stop_reason_tool_use_is_camel_case_on_wire() {
        let v = serde_json::to_value(StopReason::ToolUse).unwrap();
        assert_eq!(v, "toolUse");
    }

    #[test]
    fn api_serializes_with_dashes() {
        assert_eq!(serde_json::to_value(Api::OpenAiCompletions).unwrap(), "openai-completions");
        assert_eq!(serde_json::to_value(Api::AnthropicMessages).unwrap(), "anthropic-messages");
    }

    #[test]
    fn tool_call_block_uses_camel_case_type_tag() {
        let block = AssistantContentBlock::ToolCall(ToolCallBlock {
            id: "t1".into(),
            name: "echo".into(),
            arguments: serde_json::Map::new(),
            thought_signature: None,
        });
        let v = serde_json::to_value(&block).unwrap();
        assert_eq!(v["type"], "toolCall");
        assert!(v.get("thoughtSignature").is_none(), "absent option must be omitted");
    }

    #[test]
    fn image_block_mime_type_field_is_camel_case() {
        let b = UserContentBlock::image("AAAA", "image/png");
        let v = serde_json::to_value(&b).unwrap();
        assert_eq!(v["mimeType"], "image/png");
    }

    // ── Round-trips ───────────────────────────────────────────────────────────

    #[test]
    fn user_message_round_trip() {
        let m = Message::user("payload");
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn user_message_with_image_blocks_round_trip() {
        let m = Message::user_with_blocks(vec![
            UserContentBlock::text("what is this?"),
            UserContentBlock::image("iVBORw0KGgo=", "image/png"),
        ]);
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn assistant_message_round_trip_all_block_kinds() {
        let mut args = serde_json::Map::new();
        args.insert("value".into(), json!("hi"));
        let m = Message::Assistant(assistant(vec![
            AssistantContentBlock::text("answer"),
            AssistantContentBlock::Thinking {
                thinking: "step 1".into(),
                thinking_signature: Some("sig".into()),
            },
            AssistantContentBlock::ToolCall(ToolCallBlock {
                id: "call_1".into(),
                name: "echo".into(),
                arguments: args,
                thought_signature: None,
            }),
        ]));
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn tool_result_round_trip_with_details() {
        let m = Message::ToolResult(ToolResultMessage {
            tool_call_id: "c1".into(),
            tool_name: "read".into(),
            content: vec![UserContentBlock::text("data")],
            details: Some(json!({"lines": 3})),
            is_error: false,
            timestamp: 42,
        });
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn assistant_deserializes_with_missing_optional_fields() {
        // Older logs omit usage/stopReason; defaults must apply.
        let raw = r#"{"role":"assistant","content":[{"type":"text","text":"hi"}],
            "api":"openai-completions","provider":"openai","model":"m","timestamp":5}"#;
        let m: Message = serde_json::from_str(raw).unwrap();
        let a = m.as_assistant().unwrap();
        assert_eq!(a.stop_reason, StopReason::Stop);
        assert_eq!(a.usage, Usage::default());
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    #[test]
    fn assistant_text_concatenates_text_blocks() {
        let m = assistant(vec![
            AssistantContentBlock::text("a"),
            AssistantContentBlock::Thinking { thinking: "t".into(), thinking_signature: None },
            AssistantContentBlock::text("b"),
        ]);
        assert_eq!(m.text(), "ab");
    }

    #[test]
    fn tool_calls_iterator_skips_other_blocks() {
        let m = assistant(vec![
            AssistantContentBlock::text("x"),
            AssistantContentBlock::ToolCall(ToolCallBlock {
                id: "1".into(),
                name: "a".into(),
                arguments: Default::default(),
                thought_signature: None,
            }),
        ]);
        assert_eq!(m.tool_calls().count(), 1);
    }

    #[test]
    fn user_content_as_text_joins_blocks() {
        let c = UserContent::Blocks(vec![
            UserContentBlock::text("one"),
            UserContentBlock::image("AA", "image/png"),
            UserContentBlock::text("two"),
        ]);
        assert_eq!(c.as_text(), "one\ntwo");
    }

    // ── Cost ──────────────────────────────────────────────────────────────────

    #[test]
    fn apply_cost_uses_per_million_rates() {
        let rates = ModelCost { input: 3.0, output: 15.0, cache_read: 0.3, cache_write: 3.75 };
        let mut usage = Usage {
            input: 1_000_000,
            output: 2_000_000,
            cache_read: 1_000_000,
            cache_write: 0,
            total_tokens: 4_000_000,
            cost: UsageCost::default(),
        };
        usage.apply_cost(&rates);
        assert_eq!(usage.cost.input, 3.0);
        assert_eq!(usage.cost.output, 30.0);
        assert_eq!(usage.cost.cache_read, 0.3);
        assert_eq!(usage.cost.total, 33.3);
    }

    #[test]
    fn terminal_error_covers_error_and_aborted_only() {
        assert!(StopReason::Error.is_terminal_error());
        assert!(StopReason::Aborted.is_terminal_error());
        assert!(!StopReason::Stop.is_terminal_error());
        assert!(!StopReason::Length.is_terminal_error());
        assert!(!StopReason::ToolUse.is_terminal_error());
    }
}
