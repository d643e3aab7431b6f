// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::{Map, Value};

use tern_model::{EventSender, EventStream, Message, ProviderEvent, ToolResultMessage};

use crate::tool::ToolOutput;

/// Events emitted by the agent over one run. Consumers (frontends, the
/// stdio harness) subscribe to these to drive their output; every event
/// reflects state already committed to the run's message list.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    AgentStart,
    TurnStart,
    /// A message entered the context: a prompt, a steering injection, the
    /// streaming partial assistant, or a tool result.
    MessageStart { message: Message },
    /// The partial assistant message grew; carries the provider-level event.
    MessageUpdate { event: ProviderEvent, message: Message },
    MessageEnd { message: Message },
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        args: Map<String, Value>,
    },
    /// A tool reported intermediate output through its update callback.
    ToolExecutionUpdate {
        tool_call_id: String,
        tool_name: String,
        args: Map<String, Value>,
        partial: ToolOutput,
    },
    ToolExecutionEnd {
        tool_call_id: String,
        tool_name: String,
        result: ToolOutput,
        is_error: bool,
    },
    TurnEnd {
        message: Message,
        tool_results: Vec<ToolResultMessage>,
    },
    AgentEnd { messages: Vec<Message> },
}

impl AgentEvent {
    /// Short tag for logging and test assertions.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AgentStart => "agent_start",
            Self::TurnStart => "turn_start",
            Self::MessageStart { .. } => "message_start",
            Self::MessageUpdate { .. } => "message_update",
            Self::MessageEnd { .. } => "message_end",
            Self::ToolExecutionStart { .. } => "tool_execution_start",
            Self::ToolExecutionUpdate { .. } => "tool_execution_update",
            Self::ToolExecutionEnd { .. } => "tool_execution_end",
            Self::TurnEnd { .. } => "turn_end",
            Self::AgentEnd { .. } => "agent_end",
        }
    }
}

/// The stream a run delivers its events through; the terminal value is the
/// ordered list of messages the run produced.
pub type AgentStream = EventStream<AgentEvent, Vec<Message>>;
pub type AgentSender = EventSender<AgentEvent, Vec<Message>>;
