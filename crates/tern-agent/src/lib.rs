// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The agent runtime: turn scheduling, tool dispatch, steering.
//!
//! [`agent_loop`] / [`agent_loop_continue`] run the state machine over an
//! event stream; [`Agent`] wraps them with owned history and the
//! one-run-at-a-time guard.

mod agent;
mod agent_loop;
mod error;
mod events;
mod queue;
mod tool;

pub use agent::Agent;
pub use agent_loop::{
    agent_loop, agent_loop_continue, AgentConfig, AgentContext, ApiKeyResolver, ContextTransform,
    SKIPPED_BY_STEERING,
};
pub use error::AgentError;
pub use events::{AgentEvent, AgentSender, AgentStream};
pub use queue::{MessageQueue, QueueMode};
pub use tool::{to_tool, AgentTool, ToolOutput, ToolUpdateFn};
