// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{Map, Value};

use tern_model::{AbortSignal, Tool, UserContentBlock};

/// The result a tool hands back: content blocks for the model plus an
/// optional structured payload for frontends.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub content: Vec<UserContentBlock>,
    pub details: Option<Value>,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self { content: vec![UserContentBlock::text(text)], details: None }
    }

    pub fn text_of(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                UserContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Callback a tool may invoke any number of times with intermediate output.
pub type ToolUpdateFn = dyn Fn(ToolOutput) + Send + Sync;

/// A tool callable by the model.
///
/// `execute` runs with validated arguments. A returned `Err` (or any error
/// string) becomes an error tool-result fed back to the model; it never
/// aborts the turn. Implementations should watch `signal` and bail promptly
/// when it fires.
#[async_trait]
pub trait AgentTool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// JSON Schema of the argument object.
    fn parameters(&self) -> Value;

    async fn execute(
        &self,
        tool_call_id: &str,
        args: Map<String, Value>,
        signal: Option<AbortSignal>,
        on_update: &ToolUpdateFn,
    ) -> anyhow::Result<ToolOutput>;
}

/// The schema handed to providers for a tool.
pub fn to_tool(tool: &dyn AgentTool) -> Tool {
    Tool {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        parameters: tool.parameters(),
    }
}
