// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Caller-facing failures of the agent surface.
///
/// Everything that happens *inside* a run (provider failures, tool errors,
/// cancellation) is reported through the event stream instead — a run that
/// started always ends with `agent_end`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("agent is already processing a prompt")]
    AlreadyStreaming,
    #[error("cannot continue: no messages in context")]
    EmptyContext,
    #[error("cannot continue from message role: assistant")]
    ContinueFromAssistant,
}
